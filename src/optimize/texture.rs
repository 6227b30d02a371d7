//! Texture downscaling and sampler tuning

use std::sync::Arc;

use image::imageops::{self, FilterType};

use crate::asset::texture::{FilterMode, Texture};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureOptions {
    /// Largest allowed dimension in pixels
    pub max_size: u32,
    pub generate_mipmaps: bool,
    pub anisotropy: u8,
}

impl Default for TextureOptions {
    fn default() -> Self {
        Self {
            max_size: 1024,
            generate_mipmaps: true,
            anisotropy: 4,
        }
    }
}

impl TextureOptions {
    /// Cache key fragment identifying these options
    pub fn signature(&self) -> String {
        format!(
            "{}:{}:{}",
            self.max_size,
            if self.generate_mipmaps { "mip" } else { "nomip" },
            self.anisotropy
        )
    }
}

/// Derive an optimized copy of `texture`; the input is left untouched so
/// other consumers of a shared texture keep their version.
pub fn optimize_texture(texture: &Texture, options: &TextureOptions) -> Texture {
    let mut out = texture.clone();
    let max_size = options.max_size.max(1);

    if texture.width > max_size || texture.height > max_size {
        let scale = max_size as f32 / texture.width.max(texture.height) as f32;
        let width = ((texture.width as f32 * scale).round() as u32).clamp(1, max_size);
        let height = ((texture.height as f32 * scale).round() as u32).clamp(1, max_size);
        if let Some(pixels) = &texture.pixels {
            let resized = imageops::resize(&**pixels, width, height, FilterType::Triangle);
            out.pixels = Some(Arc::new(resized));
        }
        out.width = width;
        out.height = height;
        log::trace!(
            "Downscaled texture {} from {}x{} to {}x{}",
            texture.id, texture.width, texture.height, width, height
        );
    }

    out.sampler.generate_mipmaps = options.generate_mipmaps;
    out.sampler.min_filter = if options.generate_mipmaps {
        FilterMode::LinearMipmapLinear
    } else {
        FilterMode::Linear
    };
    out.sampler.mag_filter = FilterMode::Linear;
    out.sampler.anisotropy = options.anisotropy.clamp(1, 16);
    out
}
