//! Material tiering: trade shading cost for distance/priority

use crate::asset::material::{MaterialDesc, ShadingModel};

/// Coarse material complexity tier
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize)]
pub enum MaterialTier {
    #[default]
    High,
    Medium,
    Low,
}

impl MaterialTier {
    pub fn shading_model(self) -> ShadingModel {
        match self {
            MaterialTier::High => ShadingModel::Physical,
            MaterialTier::Medium => ShadingModel::Standard,
            MaterialTier::Low => ShadingModel::Unlit,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MaterialTier::High => "high",
            MaterialTier::Medium => "medium",
            MaterialTier::Low => "low",
        }
    }
}

/// Material to use for `desc` at `tier`. Cheaper tiers drop the textures
/// their shading model cannot use.
pub fn material_for_tier(desc: &MaterialDesc, tier: MaterialTier) -> MaterialDesc {
    let mut out = desc.clone();
    out.shading = tier.shading_model();
    match tier {
        MaterialTier::High => {}
        MaterialTier::Medium => {
            out.normal_texture = None;
        }
        MaterialTier::Low => {
            out.normal_texture = None;
            out.metalness = 0.0;
            out.roughness = 1.0;
        }
    }
    out
}
