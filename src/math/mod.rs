//! Bounding volumes

pub mod aabb;

pub use aabb::{Aabb, BoundingSphere, Bounds};
