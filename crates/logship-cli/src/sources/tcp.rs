//! TCP syslog source: newline-framed messages over stream sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use logship_core::config::{SourceProtocol, SyslogSourceConfig};
use logship_core::metrics::{ErrorKind, RelayMetrics};
use logship_core::model::{IdStream, ListenerInfo, MessageOrigin, StoredMessage};
use logship_core::supervisor::{IngestSource, SourceContext, Stasher};
use logship_core::{Result, StoreError};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Pause before retrying a stash rejected by backpressure. Not reading from
/// the socket in the meantime is the flow control.
const BACKPRESSURE_PAUSE: Duration = Duration::from_millis(100);

/// Maximum accepted frame length.
const MAX_FRAME_BYTES: usize = 64 * 1024;

/// TCP ingest source. One accept loop per configured port; one handler task
/// per connection.
pub struct TcpSource {
    metrics: Arc<RelayMetrics>,
    running: parking_lot::Mutex<Option<Running>>,
}

struct Running {
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl TcpSource {
    /// Create the source.
    pub fn new(metrics: Arc<RelayMetrics>) -> Self {
        Self {
            metrics,
            running: parking_lot::Mutex::new(None),
        }
    }
}

#[async_trait]
impl IngestSource for TcpSource {
    fn name(&self) -> &str {
        "tcp"
    }

    async fn start(&self, ctx: SourceContext) -> Result<Vec<ListenerInfo>> {
        let tracker = TaskTracker::new();
        let ids = Arc::new(tokio::sync::Mutex::new(ctx.ids));
        let mut infos = Vec::new();

        for config in ctx
            .sources
            .iter()
            .filter(|s| s.protocol == SourceProtocol::Tcp)
        {
            let shared = Arc::new(SharedConfig {
                config: config.clone(),
                config_id: config.config_id(),
            });
            for port in &config.ports {
                let addr: SocketAddr = format!("{}:{}", config.bind_addr, port)
                    .parse()
                    .map_err(|e| {
                        logship_core::Error::Config(format!("invalid bind address: {}", e))
                    })?;
                let listener = TcpListener::bind(addr).await?;
                let local = listener.local_addr()?;
                infos.push(ListenerInfo {
                    protocol: "tcp".to_string(),
                    bind_addr: local.ip().to_string(),
                    port: local.port(),
                });

                tracker.spawn(accept_loop(
                    listener,
                    shared.clone(),
                    ctx.stasher.clone(),
                    ids.clone(),
                    ctx.cancel.clone(),
                    tracker.clone(),
                    self.metrics.clone(),
                ));
            }
        }

        *self.running.lock() = Some(Running {
            cancel: ctx.cancel,
            tracker,
        });
        Ok(infos)
    }

    async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            running.cancel.cancel();
            running.tracker.close();
            running.tracker.wait().await;
            debug!("TCP source tasks have ended");
        }
    }
}

struct SharedConfig {
    config: SyslogSourceConfig,
    config_id: logship_core::model::ConfigId,
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<SharedConfig>,
    stasher: Stasher,
    ids: Arc<tokio::sync::Mutex<IdStream>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    metrics: Arc<RelayMetrics>,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracker.spawn(handle_connection(
                        stream,
                        peer,
                        shared.clone(),
                        stasher.clone(),
                        ids.clone(),
                        cancel.clone(),
                        metrics.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                }
            },
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<SharedConfig>,
    stasher: Stasher,
    ids: Arc<tokio::sync::Mutex<IdStream>>,
    cancel: CancellationToken,
    metrics: Arc<RelayMetrics>,
) {
    let client = peer.ip().to_string();
    let local_port = stream.local_addr().map(|a| a.port()).unwrap_or_default();
    info!(client = %client, local_port, "New client");

    // The limit bounds one frame; a client that never sends a newline is
    // disconnected instead of growing the buffer.
    let mut reader = BufReader::new(stream).take(MAX_FRAME_BYTES as u64);
    let mut frame = Vec::with_capacity(1024);
    let read_timeout = shared.config.read_timeout();

    loop {
        frame.clear();
        reader.set_limit(MAX_FRAME_BYTES as u64);
        // The deadline covers one frame and resets after each one.
        let read = async { reader.read_until(b'\n', &mut frame).await };
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            outcome = async {
                match read_timeout {
                    Some(timeout) => tokio::time::timeout(timeout, read).await.ok(),
                    None => Some(read.await),
                }
            } => outcome,
        };

        match outcome {
            None => {
                debug!(client = %client, "Read timeout, closing connection");
                return;
            }
            Some(Err(e)) => {
                debug!(client = %client, error = %e, "Read error, closing connection");
                return;
            }
            Some(Ok(0)) => {
                debug!(client = %client, "Client closed connection");
                return;
            }
            Some(Ok(_)) => {}
        }

        if !frame.ends_with(b"\n") && frame.len() >= MAX_FRAME_BYTES {
            warn!(client = %client, bytes = frame.len(), "Oversized frame, closing connection");
            metrics.record_error(ErrorKind::Parse);
            return;
        }
        if frame.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }

        let parsed = match super::parse_frame(&frame, &shared.config, Utc::now()) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(client = %client, error = %e, "Unparseable frame dropped");
                metrics.record_error(ErrorKind::Parse);
                continue;
            }
        };

        let Some(uid) = ids.lock().await.next().await else {
            return;
        };
        let msg = StoredMessage {
            uid,
            config_id: shared.config_id,
            parsed,
            origin: MessageOrigin {
                client: client.clone(),
                local_port,
                socket_path: None,
            },
        };

        // Backpressure: stop reading from the socket until the store has room.
        loop {
            match stasher.stash(msg.clone()).await {
                Ok(()) => break,
                Err(StoreError::BackpressureFull) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(BACKPRESSURE_PAUSE) => {}
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Store rejected message, closing connection");
                    return;
                }
            }
        }
    }
}
