//! Load scheduling: priority queues, the load queue, batching, caching and LOD selection

pub mod priority;
pub mod history;
pub mod load_queue;
pub mod batch;
pub mod cache;
pub mod lod;

pub use priority::PriorityQueue;
pub use history::{HistoryTable, LoadHistory};
pub use load_queue::{LoadHandle, LoadOperation, LoadQueue, LoadState, QueueStats};
pub use batch::{BatchItem, BatchLoader, BatchOutput, BatchStats, BatchTicket, CleanupHook, OperationFactory};
pub use cache::{CacheStats, MaterialParts, PoolStats, PrimitiveShape, ResourceCache, ResourcePool};
pub use lod::{lod_for_priority, material_tier_for_lod, QualityTier, DEFAULT_LOD_RATIOS};
