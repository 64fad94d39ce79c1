//! Process supervisor.
//!
//! Owns the store and the forwarder for the process lifetime and starts and
//! stops ingest sources on (re)configuration. One control loop multiplexes
//! termination signals, reload requests, store fatal errors and forwarder
//! fatal errors.
//!
//! Shutdown ordering is strict: sources first (so every in-flight parse has
//! stashed or returned), then the forwarder (so every borrowed message is
//! resolved and no new outputs are pulled), then the store (pending writes
//! flush and undelivered SENT entries requeue), then external collaborators.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, SyslogSourceConfig};
use crate::error::StoreError;
use crate::forwarder::Forwarder;
use crate::health::HealthCheck;
use crate::metrics::RelayMetrics;
use crate::model::{IdStream, ListenerInfo, StoredMessage};
use crate::store::MessageStore;
use crate::Result;

/// Backoff before restarting the forwarder after a fatal broker error.
const FORWARDER_RESTART_BACKOFF: Duration = Duration::from_secs(1);

/// Buffered ids handed to each source.
const ID_STREAM_BUFFER: usize = 1024;

/// Capability handed to ingest sources for enqueueing parsed messages.
#[derive(Clone)]
pub struct Stasher {
    store: Arc<MessageStore>,
}

impl Stasher {
    /// Durably enqueue one message. See [`MessageStore::stash`] for the
    /// backpressure contract.
    pub async fn stash(&self, msg: StoredMessage) -> std::result::Result<(), StoreError> {
        self.store.stash(msg).await
    }
}

/// Everything an ingest source needs to run.
pub struct SourceContext {
    /// Stash capability
    pub stasher: Stasher,
    /// Stream of pre-generated message ids
    pub ids: IdStream,
    /// The full source configuration list; the source picks what applies
    pub sources: Vec<SyslogSourceConfig>,
    /// Cancelled when the source must stop
    pub cancel: CancellationToken,
}

/// An ingest source: a listener plus parser pushing messages into the store.
///
/// Listeners and wire-format parsers live outside the core; this is the
/// interface the supervisor drives them through. `start` must return the
/// listeners it opened; `stop` must not return before every in-flight parse
/// has called stash or given up.
#[async_trait]
pub trait IngestSource: Send + Sync {
    /// Source name for logging.
    fn name(&self) -> &str;

    /// Start listening. Returns the opened listeners.
    async fn start(&self, ctx: SourceContext) -> Result<Vec<ListenerInfo>>;

    /// Stop listening and wait for in-flight work.
    async fn stop(&self);
}

/// The supervisor.
pub struct Supervisor {
    config: Config,
    config_path: Option<PathBuf>,
    store: Arc<MessageStore>,
    forwarder: Arc<Forwarder>,
    sources: Vec<Arc<dyn IngestSource>>,
    health: Arc<HealthCheck>,
    metrics: Arc<RelayMetrics>,
    shutdown: CancellationToken,
    forwarder_cancel: CancellationToken,
    source_cancel: CancellationToken,
    reload_tx: mpsc::Sender<Config>,
    reload_rx: mpsc::Receiver<Config>,
}

impl Supervisor {
    /// Open the store and assemble the supervisor. Nothing runs until
    /// [`Supervisor::run`].
    pub fn start(
        config: Config,
        config_path: Option<PathBuf>,
        test_mode: bool,
        sources: Vec<Arc<dyn IngestSource>>,
        metrics: Arc<RelayMetrics>,
        health: Arc<HealthCheck>,
    ) -> Result<Self> {
        health.register_component("store");
        health.register_component("broker");
        health.register_component("sources");

        let store_cancel = CancellationToken::new();
        let store = Arc::new(MessageStore::open(
            &config.store,
            metrics.clone(),
            &store_cancel,
        )?);
        health.mark_healthy("store");

        let forwarder = Arc::new(Forwarder::new(test_mode, metrics.clone()));
        let (reload_tx, reload_rx) = mpsc::channel(1);

        Ok(Self {
            config,
            config_path,
            store,
            forwarder,
            sources,
            health,
            metrics,
            shutdown: CancellationToken::new(),
            forwarder_cancel: CancellationToken::new(),
            source_cancel: CancellationToken::new(),
            reload_tx,
            reload_rx,
        })
    }

    /// Replace the forwarder (tests use this to inject a scripted sink).
    pub fn with_forwarder(mut self, forwarder: Forwarder) -> Self {
        self.forwarder = Arc::new(forwarder);
        self
    }

    /// Token an embedder can cancel to trigger graceful shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Channel an embedder can push full configurations into (the external
    /// config-update path; file-based reload goes through SIGHUP).
    pub fn config_updates(&self) -> mpsc::Sender<Config> {
        self.reload_tx.clone()
    }

    /// Shared store handle.
    pub fn store(&self) -> Arc<MessageStore> {
        self.store.clone()
    }

    /// Run the control loop until termination, then shut down in order.
    pub async fn run(mut self) -> Result<()> {
        self.store
            .store_all_source_configs(self.config.sources.clone())
            .await
            .map_err(crate::Error::Store)?;

        self.start_forwarder();
        self.start_sources().await;

        let mut store_errors = self.store.errors();
        let mut forwarder_errors = self.forwarder.errors();
        let (mut term_signal, mut reload_signal) = signal_listeners()?;

        debug!("Supervisor control loop starting");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }

                _ = term_signal.wait() => {
                    info!("Termination signal received");
                    break;
                }

                _ = reload_signal.wait() => {
                    info!("SIGHUP received: reloading configuration");
                    self.reload_from_file().await;
                    forwarder_errors = self.forwarder.errors();
                }

                maybe_config = self.reload_rx.recv() => {
                    if let Some(new_config) = maybe_config {
                        info!("Configuration was updated externally");
                        self.apply_reload(new_config).await;
                        forwarder_errors = self.forwarder.errors();
                    }
                }

                _ = store_errors.recv() => {
                    error!("The store had a fatal error");
                    self.health.mark_unhealthy("store", "fatal storage error");
                    break;
                }

                _ = forwarder_errors.recv() => {
                    warn!("Forwarder received a fatal broker error: resetting connection");
                    self.health.mark_degraded("broker", "reconnecting after fatal error");
                    self.stop_forwarder().await;
                    tokio::time::sleep(FORWARDER_RESTART_BACKOFF).await;
                    self.start_forwarder();
                    forwarder_errors = self.forwarder.errors();
                }
            }
        }

        self.shutdown_in_order().await;
        Ok(())
    }

    fn start_forwarder(&mut self) {
        self.forwarder_cancel = CancellationToken::new();
        let accepted = self.forwarder.forward(
            self.forwarder_cancel.clone(),
            self.store.clone(),
            self.config.broker.clone(),
        );
        if accepted {
            self.health.mark_healthy("broker");
            debug!("Forwarder session started");
        } else {
            warn!("Forwarder session already running, not restarted");
        }
    }

    async fn stop_forwarder(&mut self) {
        self.forwarder_cancel.cancel();
        self.forwarder.wait_finished().await;
        debug!("Forwarder session stopped");
    }

    /// Start every source concurrently; a slow bind on one source must not
    /// delay the others.
    async fn start_sources(&mut self) {
        self.source_cancel = CancellationToken::new();
        let starts: Vec<_> = self
            .sources
            .iter()
            .map(|source| {
                let source = source.clone();
                let ctx = SourceContext {
                    stasher: Stasher {
                        store: self.store.clone(),
                    },
                    ids: IdStream::spawn(ID_STREAM_BUFFER, self.source_cancel.child_token()),
                    sources: self.config.sources.clone(),
                    cancel: self.source_cancel.child_token(),
                };
                let health = self.health.clone();
                async move {
                    match source.start(ctx).await {
                        Ok(listeners) => {
                            for listener in &listeners {
                                info!(source = source.name(), listener = %listener, "Listener started");
                            }
                            if listeners.is_empty() {
                                debug!(source = source.name(), "Source started without listeners");
                            }
                            true
                        }
                        Err(e) => {
                            error!(source = source.name(), error = %e, "Error starting source");
                            health.mark_degraded(
                                "sources",
                                &format!("{} failed to start", source.name()),
                            );
                            false
                        }
                    }
                }
            })
            .collect();
        let started = futures::future::join_all(starts).await;
        if !self.sources.is_empty() && started.iter().all(|ok| *ok) {
            self.health.mark_healthy("sources");
        }
    }

    async fn stop_sources(&mut self) {
        self.source_cancel.cancel();
        let stops = self.sources.iter().map(|source| {
            let source = source.clone();
            async move {
                source.stop().await;
                debug!(source = source.name(), "Source stopped");
            }
        });
        futures::future::join_all(stops).await;
    }

    /// SIGHUP path: re-read the config file. On any error the previous
    /// configuration stays active and the daemon keeps running.
    async fn reload_from_file(&mut self) {
        let Some(path) = self.config_path.clone() else {
            warn!("No configuration file to reload from");
            return;
        };
        match Config::from_file(&path) {
            Ok(new_config) => self.apply_reload(new_config).await,
            Err(e) => {
                error!(error = %e, "Error reloading configuration. Configuration was left untouched.");
            }
        }
    }

    /// Apply a validated configuration: persist the source configs, restart
    /// the forwarder with the new broker config, restart the sources. The
    /// store itself is never torn down by a reload.
    async fn apply_reload(&mut self, new_config: Config) {
        if let Err(e) = self
            .store
            .store_all_source_configs(new_config.sources.clone())
            .await
        {
            error!(error = %e, "Can't store the source configurations");
            return;
        }

        self.stop_forwarder().await;
        self.config = new_config;
        self.start_forwarder();

        self.stop_sources().await;
        self.start_sources().await;
        info!("Reload complete");
    }

    async fn shutdown_in_order(&mut self) {
        info!("Shutting down");

        self.stop_sources().await;
        debug!("All sources have been stopped");

        self.stop_forwarder().await;
        debug!("Forwarder has been stopped");

        self.store.close().await;
        debug!("Store has been closed");

        self.shutdown.cancel();
        self.metrics.set_table_sizes(
            self.store.counts().queued,
            self.store.counts().sent,
            self.store.counts().failed,
        );
        info!("Shutdown complete");
    }
}

/// Termination listener: SIGTERM or SIGINT.
struct TermSignal {
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
}

impl TermSignal {
    async fn wait(&mut self) {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = self.sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

/// Reload listener: SIGHUP. Never resolves on non-unix platforms.
struct ReloadSignal {
    #[cfg(unix)]
    sighup: tokio::signal::unix::Signal,
}

impl ReloadSignal {
    async fn wait(&mut self) {
        #[cfg(unix)]
        {
            self.sighup.recv().await;
        }
        #[cfg(not(unix))]
        std::future::pending::<()>().await
    }
}

fn signal_listeners() -> Result<(TermSignal, ReloadSignal)> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        Ok((
            TermSignal {
                sigterm: signal(SignalKind::terminate())?,
            },
            ReloadSignal {
                sighup: signal(SignalKind::hangup())?,
            },
        ))
    }
    #[cfg(not(unix))]
    Ok((TermSignal {}, ReloadSignal {}))
}
