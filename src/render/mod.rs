//! Rendering resources: GPU handles, context admission, disposal and performance monitoring

pub mod gpu;
pub mod context;
pub mod disposal;
pub mod monitor;

pub use gpu::{
    Disposable, Drawable, GpuGeometry, GpuMaterial, GpuTexture, LedgerSnapshot, Ownership,
    RenderModel, RenderNode, ResourceKind, ResourceLedger,
};
pub use context::{Admission, AdmissionTicket, BreakerTrip, CleanupFn, ContextLease, ContextManager, ContextStats};
pub use disposal::{DisposalManager, DisposalReport};
pub use monitor::{
    MemoryPressure, PerformanceMonitor, PerformanceReport, PerformanceSample, PerformanceSignal,
    PerformanceState,
};
