//! Core types and utilities shared by the scheduler components

pub mod types;
pub mod error;
pub mod logging;
pub mod config;
pub mod timer;
pub mod cancel;

pub use types::*;
pub use error::{Error, LoadError, LoadErrorKind};
pub use config::SchedulerConfig;
pub use cancel::CancelHandle;
