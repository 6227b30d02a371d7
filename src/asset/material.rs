//! Material descriptions

use crate::asset::texture::Texture;
use crate::core::types::Vec4;

/// Shading model used to draw a material, from most to least expensive
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ShadingModel {
    /// Full PBR including normal maps
    #[default]
    Physical,
    /// PBR with base colour only
    Standard,
    /// Flat colour, no lighting
    Unlit,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MaterialDesc {
    pub name: String,
    pub base_color: Vec4,
    pub metalness: f32,
    pub roughness: f32,
    pub base_color_texture: Option<Texture>,
    pub normal_texture: Option<Texture>,
    pub shading: ShadingModel,
}

impl Default for MaterialDesc {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            base_color: Vec4::ONE,
            metalness: 0.0,
            roughness: 0.8,
            base_color_texture: None,
            normal_texture: None,
            shading: ShadingModel::Physical,
        }
    }
}

impl MaterialDesc {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Textures referenced by this material
    pub fn textures(&self) -> impl Iterator<Item = &Texture> {
        self.base_color_texture.iter().chain(self.normal_texture.iter())
    }
}
