//! Debug protocol - JSON command/response definitions

use serde::{Deserialize, Serialize};

/// Commands sent by a debug client, one JSON object per line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "params")]
pub enum DebugCommand {
    /// Full scheduler stats snapshot
    GetSchedulerStats,
    /// Rolling performance summary
    GetPerformance,
    /// Change the rendering context ceiling (clamped by the scheduler)
    SetMaxContexts { max: usize },
    /// Release one preview and its context
    ReleasePreview { id: String },
    /// Return the scheduler to its initial state
    ResetScheduler,
    /// Ping (health check)
    Ping,
}

/// Responses from debug server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum DebugResponse {
    #[serde(rename = "ok")]
    Ok { data: ResponseData },
    #[serde(rename = "error")]
    Error { message: String },
}

/// Response data variants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    None,
    Pong { message: String },
    /// Scheduler stats as produced by the application
    SchedulerStats { stats: serde_json::Value },
    Performance(PerformanceInfo),
    ContextsUpdated { max_contexts: usize },
    Released {
        id: String,
        geometries: usize,
        materials: usize,
        textures: usize,
    },
    ParamsUpdated { description: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceInfo {
    pub state: String,
    pub pressure: String,
    pub average_fps: Option<f32>,
    pub average_render_ms: f32,
    pub latest_memory_mb: f32,
    pub samples: usize,
}

impl DebugResponse {
    pub fn ok(data: ResponseData) -> Self {
        Self::Ok { data }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self::Error {
            message: msg.into(),
        }
    }

    pub fn pong() -> Self {
        Self::ok(ResponseData::Pong {
            message: "pong".into(),
        })
    }

    pub fn none() -> Self {
        Self::ok(ResponseData::None)
    }
}
