//! TCP debug server

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::protocol::{DebugCommand, DebugResponse};

/// Trait that the application implements to handle debug commands
pub trait DebugHandler: Send + Sync + 'static {
    fn handle_command(&mut self, cmd: DebugCommand) -> DebugResponse;
}

/// Debug server handle - the server stops when this is dropped
pub struct DebugServer {
    handle: tokio::task::JoinHandle<()>,
}

impl DebugServer {
    /// Start the debug server on the given port.
    /// The handler is called for each incoming command.
    /// Returns immediately -- server runs in background.
    pub fn start(handler: Arc<Mutex<dyn DebugHandler>>, port: u16) -> Self {
        let handle = tokio::spawn(async move {
            let addr = format!("127.0.0.1:{}", port);
            let listener = match TcpListener::bind(&addr).await {
                Ok(l) => {
                    log::info!("Debug server listening on {}", addr);
                    l
                }
                Err(e) => {
                    log::error!("Failed to bind debug server on {}: {}", addr, e);
                    return;
                }
            };
            accept_loop(listener, handler).await;
        });

        Self { handle }
    }

    /// Bind first, then serve in the background. Port 0 picks a free port;
    /// the bound address is returned.
    pub async fn bind(
        handler: Arc<Mutex<dyn DebugHandler>>,
        port: u16,
    ) -> std::io::Result<(Self, SocketAddr)> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let addr = listener.local_addr()?;
        log::info!("Debug server listening on {}", addr);
        let handle = tokio::spawn(accept_loop(listener, handler));
        Ok((Self { handle }, addr))
    }
}

impl Drop for DebugServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn accept_loop(listener: TcpListener, handler: Arc<Mutex<dyn DebugHandler>>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                log::info!("Debug client connected from {}", peer);
                let handler = handler.clone();
                tokio::spawn(async move {
                    handle_connection(stream, handler).await;
                    log::info!("Debug client disconnected: {}", peer);
                });
            }
            Err(e) => {
                log::error!("Debug server accept error: {}", e);
            }
        }
    }
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    handler: Arc<Mutex<dyn DebugHandler>>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break, // Connection closed
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let response = match serde_json::from_str::<DebugCommand>(trimmed) {
                    Ok(cmd) => {
                        log::debug!("Debug command: {:?}", cmd);
                        let mut h = handler.lock().await;
                        h.handle_command(cmd)
                    }
                    Err(e) => DebugResponse::error(format!("Invalid command JSON: {}", e)),
                };

                let mut resp_json =
                    serde_json::to_string(&response).unwrap_or_else(|e| {
                        format!(
                            "{{\"status\":\"error\",\"message\":\"Serialize error: {}\"}}",
                            e
                        )
                    });
                resp_json.push('\n');

                if let Err(e) = writer.write_all(resp_json.as_bytes()).await {
                    log::error!("Debug server write error: {}", e);
                    break;
                }
                if let Err(e) = writer.flush().await {
                    log::error!("Debug server flush error: {}", e);
                    break;
                }
            }
            Err(e) => {
                log::error!("Debug server read error: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ResponseData;
    use tokio::net::TcpStream;

    struct CountingHandler {
        max_contexts: usize,
    }

    impl DebugHandler for CountingHandler {
        fn handle_command(&mut self, cmd: DebugCommand) -> DebugResponse {
            match cmd {
                DebugCommand::Ping => DebugResponse::pong(),
                DebugCommand::SetMaxContexts { max } => {
                    self.max_contexts = max.min(6);
                    DebugResponse::ok(ResponseData::ContextsUpdated {
                        max_contexts: self.max_contexts,
                    })
                }
                _ => DebugResponse::error("unsupported"),
            }
        }
    }

    async fn roundtrip(addr: SocketAddr, lines: &[&str]) -> Vec<DebugResponse> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut responses = Vec::new();
        for line in lines {
            writer.write_all(format!("{}\n", line).as_bytes()).await.unwrap();
            let mut response = String::new();
            reader.read_line(&mut response).await.unwrap();
            responses.push(serde_json::from_str(response.trim()).unwrap());
        }
        responses
    }

    #[tokio::test]
    async fn test_commands_over_tcp() {
        let handler = Arc::new(Mutex::new(CountingHandler { max_contexts: 6 }));
        let (_server, addr) = DebugServer::bind(handler.clone(), 0).await.unwrap();

        let responses = roundtrip(
            addr,
            &[
                r#"{"cmd":"Ping"}"#,
                r#"{"cmd":"SetMaxContexts","params":{"max":9}}"#,
                "not json",
            ],
        )
        .await;

        assert_eq!(responses[0], DebugResponse::pong());
        assert_eq!(
            responses[1],
            DebugResponse::ok(ResponseData::ContextsUpdated { max_contexts: 6 })
        );
        assert!(matches!(responses[2], DebugResponse::Error { .. }));
        assert_eq!(handler.lock().await.max_contexts, 6);
    }
}
