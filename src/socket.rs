//! Unix domain socket chat connector.
//!
//! A reference connector that speaks JSON lines, one [`ConnectorRequest`]
//! per line in and one [`ConnectorResponse`] per line out. Chat messages go
//! onto the engine's bounded inbound queue; when it is full the request is
//! answered with `backpressure` instead of blocking the connection.
//!
//! Replies are broadcast to every connection, and each connection forwards
//! only those addressed to channels it has sent messages on.

use crate::engine::{ChatSink, Engine};
use crate::error::BridgeError;
use crate::protocol::{
    current_timestamp_ms, ChatMessage, ConnectorRequest, ConnectorResponse, OutboundMessage,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const OUTBOUND_CAPACITY: usize = 256;

/// [`ChatSink`] feeding every connected socket client
pub struct SocketSink {
    outbound: broadcast::Sender<OutboundMessage>,
}

#[async_trait]
impl ChatSink for SocketSink {
    async fn send(&self, channel_id: &str, text: &str) -> crate::error::Result<()> {
        self.outbound
            .send(OutboundMessage {
                channel_id: channel_id.to_string(),
                text: text.to_string(),
                timestamp: current_timestamp_ms(),
            })
            .map(|_| ())
            .map_err(|_| BridgeError::Backend("no socket client connected".to_string()))
    }
}

/// State shared by every connection
struct Shared {
    platform: String,
    inbound: mpsc::Sender<ChatMessage>,
    engine: Engine,
    outbound: broadcast::Sender<OutboundMessage>,
    /// Asks the process to shut down
    shutdown_tx: mpsc::Sender<()>,
    /// Fires when the process is shutting down
    stop: CancellationToken,
}

pub struct SocketConnector {
    socket_path: PathBuf,
    shared: Arc<Shared>,
}

impl SocketConnector {
    /// Create the connector and register its sink for `platform`
    pub fn new(
        socket_path: PathBuf,
        platform: &str,
        inbound: mpsc::Sender<ChatMessage>,
        engine: Engine,
        shutdown_tx: mpsc::Sender<()>,
        stop: CancellationToken,
    ) -> Self {
        let (outbound, _) = broadcast::channel(OUTBOUND_CAPACITY);
        engine.register_sink(
            platform,
            Arc::new(SocketSink {
                outbound: outbound.clone(),
            }),
        );
        Self {
            socket_path,
            shared: Arc::new(Shared {
                platform: platform.to_string(),
                inbound,
                engine,
                outbound,
                shutdown_tx,
                stop,
            }),
        }
    }

    /// Accept connections until the stop token fires
    pub async fn run(self) -> Result<()> {
        let path = self.socket_path.as_path();
        if path.exists() {
            std::fs::remove_file(path).context("Failed to remove existing socket")?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .context(format!("Failed to create socket directory {:?}", parent))?;
        }

        let listener = UnixListener::bind(path)
            .context(format!("Failed to bind socket at {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(path, perms) {
                warn!("Failed to set socket permissions: {}", e);
            }
        }

        info!("Chat socket listening at {}", path.display());

        loop {
            tokio::select! {
                _ = self.shared.stop.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let shared = Arc::clone(&self.shared);
                        tokio::spawn(async move {
                            let conn = AssertUnwindSafe(handle_connection(stream, shared));
                            match conn.catch_unwind().await {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => error!("Connection error: {}", e),
                                Err(_) => error!("Connection task panicked"),
                            }
                        });
                    }
                    Err(e) => error!("Accept error: {}", e),
                },
            }
        }

        if let Err(e) = std::fs::remove_file(path) {
            debug!("Could not remove socket {}: {}", path.display(), e);
        }
        info!("Chat socket closed");
        Ok(())
    }
}

async fn write_frame<W>(writer: &mut W, response: &ConnectorResponse) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_string(response)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

async fn handle_connection(stream: UnixStream, shared: Arc<Shared>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    let mut outbound_rx = shared.outbound.subscribe();
    // Channels this client has written to; replies for them come back here
    let mut channels: HashSet<String> = HashSet::new();

    debug!("New client connection");

    loop {
        tokio::select! {
            result = reader.read_line(&mut line) => {
                if result? == 0 {
                    debug!("Client disconnected");
                    break;
                }

                let trimmed = line.trim();
                if trimmed.is_empty() {
                    line.clear();
                    continue;
                }

                let response = match serde_json::from_str::<ConnectorRequest>(trimmed) {
                    Ok(request) => {
                        if let ConnectorRequest::Message { channel_id, .. } = &request {
                            // Track before queueing so a fast reply is not missed
                            channels.insert(channel_id.clone());
                        }
                        handle_request(request, &shared).await
                    }
                    Err(e) => ConnectorResponse::Error {
                        message: format!("Invalid JSON: {}", e),
                    },
                };
                write_frame(&mut writer, &response).await?;
                line.clear();

                if matches!(response, ConnectorResponse::ShutdownAck) {
                    return Ok(());
                }
            }

            result = outbound_rx.recv() => match result {
                Ok(message) => {
                    if channels.contains(&message.channel_id) {
                        let reply = ConnectorResponse::Reply {
                            channel_id: message.channel_id,
                            text: message.text,
                            timestamp: message.timestamp,
                        };
                        write_frame(&mut writer, &reply).await?;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Outbound receiver lagged by {} messages, replies lost", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Outbound channel closed");
                    break;
                }
            },

            _ = shared.stop.cancelled() => break,
        }
    }

    Ok(())
}

async fn handle_request(request: ConnectorRequest, shared: &Shared) -> ConnectorResponse {
    match request {
        ConnectorRequest::Message {
            user_id,
            channel_id,
            content,
        } => {
            let message = ChatMessage::new(&shared.platform, &user_id, &channel_id, &content);
            match shared.inbound.try_send(message) {
                Ok(()) => ConnectorResponse::Accepted,
                Err(TrySendError::Full(_)) => {
                    warn!(channel = %channel_id, "Inbound queue full, dropping message");
                    ConnectorResponse::Backpressure { accept: false }
                }
                Err(TrySendError::Closed(_)) => ConnectorResponse::Error {
                    message: "bridge is shutting down".to_string(),
                },
            }
        }

        ConnectorRequest::CreateSession {
            user_id,
            name,
            tool,
            work_dir,
        } => match shared
            .engine
            .create_session(
                &shared.platform,
                &user_id,
                &name,
                &tool,
                Path::new(&work_dir).to_path_buf(),
            )
            .await
        {
            Ok(info) => ConnectorResponse::SessionCreated { name: info.name },
            Err(e) => ConnectorResponse::Error {
                message: e.to_string(),
            },
        },

        ConnectorRequest::RemoveSession { user_id, name } => match shared
            .engine
            .remove_session(&shared.platform, &user_id, &name)
            .await
        {
            Ok(info) => ConnectorResponse::SessionRemoved { name: info.name },
            Err(e) => ConnectorResponse::Error {
                message: e.to_string(),
            },
        },

        ConnectorRequest::Shutdown => {
            info!("Shutdown requested via socket");
            if shared.shutdown_tx.send(()).await.is_err() {
                debug!("Shutdown already in progress");
            }
            ConnectorResponse::ShutdownAck
        }
    }
}
