//! Geometry decimation, LOD generation, texture tuning and material tiering

pub mod geometry;
pub mod texture;
pub mod material;

pub use geometry::{create_lod_levels, optimize_geometry, GeometryOptions};
pub use texture::{optimize_texture, TextureOptions};
pub use material::{material_for_tier, MaterialTier};
