//! Figview - asset loading and rendering-context scheduling for 3D figurine previews

pub mod core;
pub mod math;
pub mod asset;
pub mod optimize;
pub mod render;
pub mod streaming;
pub mod scheduler;
pub mod debug;

pub use scheduler::{AssetScheduler, Preview, PreviewState, SchedulerStats};
