//! Asset model: locators, CPU-side geometry/texture/material data, decoding and fetching

pub mod locator;
pub mod geometry;
pub mod texture;
pub mod material;
pub mod model;
pub mod obj;
pub mod primitives;
pub mod source;

pub use locator::{AssetLocator, LocatorRegistry, TempLocator};
pub use geometry::Geometry;
pub use texture::{FilterMode, SamplerParams, Texture};
pub use material::{MaterialDesc, ShadingModel};
pub use model::{MeshPrimitive, ModelNode};
pub use obj::ObjDecoder;
pub use source::{AssetDecoder, AssetSource, BoxFuture, LocalSource};
