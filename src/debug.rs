//! Debug server integration for the asset scheduler

use std::sync::Arc;

use figview_debug::{DebugCommand, DebugHandler, DebugResponse, DebugServer, PerformanceInfo, ResponseData};
use tokio::sync::Mutex;

use crate::scheduler::AssetScheduler;

/// Answers debug commands against a running scheduler
pub struct SchedulerDebugHandler {
    scheduler: AssetScheduler,
}

impl SchedulerDebugHandler {
    pub fn new(scheduler: AssetScheduler) -> Self {
        Self { scheduler }
    }

    /// Serve `scheduler` on `port` until the returned server is dropped
    pub fn serve(scheduler: AssetScheduler, port: u16) -> DebugServer {
        let handler: Arc<Mutex<dyn DebugHandler>> = Arc::new(Mutex::new(Self::new(scheduler)));
        DebugServer::start(handler, port)
    }
}

impl DebugHandler for SchedulerDebugHandler {
    fn handle_command(&mut self, cmd: DebugCommand) -> DebugResponse {
        match cmd {
            DebugCommand::Ping => DebugResponse::pong(),
            DebugCommand::GetSchedulerStats => match serde_json::to_value(self.scheduler.stats()) {
                Ok(stats) => DebugResponse::ok(ResponseData::SchedulerStats { stats }),
                Err(e) => DebugResponse::error(format!("Failed to serialize stats: {}", e)),
            },
            DebugCommand::GetPerformance => {
                let report = self.scheduler.performance();
                DebugResponse::ok(ResponseData::Performance(PerformanceInfo {
                    state: format!("{:?}", report.state),
                    pressure: format!("{:?}", report.pressure),
                    average_fps: report.average_fps,
                    average_render_ms: report.average_render_ms,
                    latest_memory_mb: report.latest_memory_mb,
                    samples: report.samples,
                }))
            }
            DebugCommand::SetMaxContexts { max } => {
                let max_contexts = self.scheduler.set_max_contexts(max);
                log::info!("Debug: context ceiling set to {} (requested {})", max_contexts, max);
                DebugResponse::ok(ResponseData::ContextsUpdated { max_contexts })
            }
            DebugCommand::ReleasePreview { id } => {
                let report = self.scheduler.release(&id);
                DebugResponse::ok(ResponseData::Released {
                    id,
                    geometries: report.geometries,
                    materials: report.materials,
                    textures: report.textures,
                })
            }
            DebugCommand::ResetScheduler => {
                self.scheduler.reset();
                DebugResponse::ok(ResponseData::ParamsUpdated {
                    description: "scheduler reset".into(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{LocalSource, LocatorRegistry, ObjDecoder};
    use crate::core::config::SchedulerConfig;

    fn handler() -> SchedulerDebugHandler {
        let scheduler = AssetScheduler::new(
            SchedulerConfig::default(),
            Arc::new(LocalSource::new(Arc::new(LocatorRegistry::new()))),
            Arc::new(ObjDecoder),
        )
        .unwrap();
        SchedulerDebugHandler::new(scheduler)
    }

    #[tokio::test]
    async fn test_set_max_contexts_is_clamped() {
        let mut handler = handler();
        let response = handler.handle_command(DebugCommand::SetMaxContexts { max: 12 });
        assert_eq!(response, DebugResponse::ok(ResponseData::ContextsUpdated { max_contexts: 6 }));

        let response = handler.handle_command(DebugCommand::SetMaxContexts { max: 2 });
        assert_eq!(response, DebugResponse::ok(ResponseData::ContextsUpdated { max_contexts: 2 }));
    }

    #[tokio::test]
    async fn test_stats_are_json() {
        let mut handler = handler();
        handler.handle_command(DebugCommand::SetMaxContexts { max: 3 });
        let DebugResponse::Ok { data: ResponseData::SchedulerStats { stats } } =
            handler.handle_command(DebugCommand::GetSchedulerStats)
        else {
            panic!("expected stats");
        };
        assert_eq!(stats["max_contexts"], 3);
        assert_eq!(stats["active_contexts"], 0);
        assert_eq!(stats["performance_state"], "Optimal");
    }

    #[tokio::test]
    async fn test_reset_and_ping() {
        let mut handler = handler();
        assert_eq!(handler.handle_command(DebugCommand::Ping), DebugResponse::pong());
        handler.handle_command(DebugCommand::SetMaxContexts { max: 1 });
        assert!(matches!(
            handler.handle_command(DebugCommand::ResetScheduler),
            DebugResponse::Ok { .. }
        ));
        assert_eq!(handler.scheduler.stats().max_contexts, 6);
    }
}
