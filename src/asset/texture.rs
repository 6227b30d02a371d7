//! CPU-side textures and sampler parameters

use std::sync::Arc;

use image::RgbaImage;

/// Texture filtering mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
    LinearMipmapLinear,
}

/// Sampling parameters applied when the texture is uploaded
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SamplerParams {
    pub min_filter: FilterMode,
    pub mag_filter: FilterMode,
    pub generate_mipmaps: bool,
    pub anisotropy: u8,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            min_filter: FilterMode::Linear,
            mag_filter: FilterMode::Linear,
            generate_mipmaps: false,
            anisotropy: 1,
        }
    }
}

/// A texture image plus its sampler parameters.
///
/// Pixel data is shared, so derived copies are cheap.
#[derive(Clone, Debug, PartialEq)]
pub struct Texture {
    pub id: String,
    pub width: u32,
    pub height: u32,
    pub pixels: Option<Arc<RgbaImage>>,
    pub sampler: SamplerParams,
}

impl Texture {
    pub fn from_image(id: impl Into<String>, image: RgbaImage) -> Self {
        Self {
            id: id.into(),
            width: image.width(),
            height: image.height(),
            pixels: Some(Arc::new(image)),
            sampler: SamplerParams::default(),
        }
    }

    /// Texture with known dimensions but no pixel data loaded
    pub fn placeholder(id: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            width,
            height,
            pixels: None,
            sampler: SamplerParams::default(),
        }
    }

    /// Number of mip levels the texture will carry
    pub fn mip_level_count(&self) -> u32 {
        if self.sampler.generate_mipmaps {
            32 - self.width.max(self.height).max(1).leading_zeros()
        } else {
            1
        }
    }

    /// GPU bytes for the RGBA8 image including its mip chain
    pub fn byte_size(&self) -> usize {
        let mut total = 0usize;
        let (mut w, mut h) = (self.width.max(1) as usize, self.height.max(1) as usize);
        for _ in 0..self.mip_level_count() {
            total += w * h * 4;
            w = (w / 2).max(1);
            h = (h / 2).max(1);
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_image() {
        let tex = Texture::from_image("albedo", RgbaImage::new(64, 32));
        assert_eq!(tex.width, 64);
        assert_eq!(tex.height, 32);
        assert!(tex.pixels.is_some());
        assert_eq!(tex.mip_level_count(), 1);
    }

    #[test]
    fn test_mip_levels() {
        let mut tex = Texture::placeholder("t", 256, 64);
        tex.sampler.generate_mipmaps = true;
        assert_eq!(tex.mip_level_count(), 9); // 256 -> 1
    }

    #[test]
    fn test_byte_size_with_mips() {
        let mut tex = Texture::placeholder("t", 4, 4);
        assert_eq!(tex.byte_size(), 64);
        tex.sampler.generate_mipmaps = true;
        // 4x4 + 2x2 + 1x1
        assert_eq!(tex.byte_size(), (16 + 4 + 1) * 4);
    }
}
