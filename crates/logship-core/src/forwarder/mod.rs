//! The forwarder pipeline.
//!
//! Drains `store.outputs()`, evaluates each source's filter and topic /
//! partition expressions, produces to the broker sink and correlates the
//! sink's responses back to store state transitions. Every message pulled
//! from the store is resolved with exactly one of `ack`, `nack` or
//! `perm_error`:
//!
//! - filter DROPPED            -> ack (discard silently)
//! - filter REJECTED           -> nack
//! - filter ERROR              -> perm_error
//! - missing source config     -> perm_error
//! - empty topic/partition key -> perm_error
//! - broker success            -> ack
//! - broker failure            -> nack (fatal kinds also signal `errors()`)

mod sink;

pub use sink::{
    KafkaSinkConnector, ProduceFailure, ProduceRequest, SinkAck, SinkConnector, SinkHandle,
    SinkResponses,
};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::metrics::{ErrorKind, FilterOutcome, RelayMetrics};
use crate::model::{ConfigId, StoredMessage};
use crate::store::MessageStore;
use crate::transform::{ExprEnv, FilterVerdict, TransformEnv};

/// Forwards stored messages to the broker.
pub struct Forwarder {
    forwarding: Arc<AtomicBool>,
    test_mode: bool,
    connector: Arc<dyn SinkConnector>,
    error_tx: broadcast::Sender<()>,
    session: parking_lot::Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<RelayMetrics>,
}

impl Forwarder {
    /// Create a forwarder producing to the broker, or printing to stdout in
    /// test mode.
    pub fn new(test_mode: bool, metrics: Arc<RelayMetrics>) -> Self {
        let connector = Arc::new(KafkaSinkConnector::new(metrics.clone()));
        Self::with_connector(test_mode, connector, metrics)
    }

    /// Create a forwarder with a custom sink connector.
    pub fn with_connector(
        test_mode: bool,
        connector: Arc<dyn SinkConnector>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        let (error_tx, _) = broadcast::channel(4);
        Self {
            forwarding: Arc::new(AtomicBool::new(false)),
            test_mode,
            connector,
            error_tx,
            session: parking_lot::Mutex::new(None),
            metrics,
        }
    }

    /// Start a forwarding session.
    ///
    /// Returns `false` without starting anything when a session is already
    /// running; the compare-and-swap on the `forwarding` flag is what
    /// enforces the single-writer invariant.
    pub fn forward(
        &self,
        cancel: CancellationToken,
        store: Arc<MessageStore>,
        broker: BrokerConfig,
    ) -> bool {
        if self
            .forwarding
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        let session = Session {
            cancel,
            store,
            broker,
            test_mode: self.test_mode,
            connector: self.connector.clone(),
            error_tx: self.error_tx.clone(),
            metrics: self.metrics.clone(),
        };
        let forwarding = self.forwarding.clone();
        let handle = tokio::spawn(async move {
            session.run().await;
            forwarding.store(false, Ordering::SeqCst);
        });
        *self.session.lock() = Some(handle);
        true
    }

    /// Whether a session is currently running.
    pub fn is_forwarding(&self) -> bool {
        self.forwarding.load(Ordering::SeqCst)
    }

    /// Block until the current session has fully drained: no more outputs
    /// pulls, and every borrowed message resolved.
    pub async fn wait_finished(&self) {
        let handle = self.session.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Fatal broker error signal. Emits once per session on the first fatal
    /// delivery failure; the supervisor restarts the forwarder on it.
    pub fn errors(&self) -> broadcast::Receiver<()> {
        self.error_tx.subscribe()
    }
}

struct Session {
    cancel: CancellationToken,
    store: Arc<MessageStore>,
    broker: BrokerConfig,
    test_mode: bool,
    connector: Arc<dyn SinkConnector>,
    error_tx: broadcast::Sender<()>,
    metrics: Arc<RelayMetrics>,
}

impl Session {
    async fn run(self) {
        if self.test_mode {
            info!("Forwarding session started in test mode (stdout, no broker)");
            self.drive_outputs(None).await;
            return;
        }

        let Some((sink, responses)) = self.connector.connect(&self.broker, &self.cancel).await
        else {
            debug!("Forwarding session cancelled before the sink came up");
            return;
        };
        info!("Forwarding session started");

        let listener = tokio::spawn(listen_responses(
            self.store.clone(),
            responses,
            self.error_tx.clone(),
            self.metrics.clone(),
        ));

        self.drive_outputs(Some(&sink)).await;

        // Dropping the sink closes its input channel; the dispatcher drains
        // outstanding deliveries and the listener resolves them all before
        // exiting, so no borrowed message is left unresolved.
        drop(sink);
        let _ = listener.await;
        info!("Forwarding session finished");
    }

    async fn drive_outputs(&self, sink: Option<&SinkHandle>) {
        let outputs = self.store.outputs();
        let mut envs: HashMap<ConfigId, ExprEnv> = HashMap::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                maybe_msg = outputs.recv() => match maybe_msg {
                    Some(msg) => self.process_message(msg, sink, &mut envs).await,
                    None => return,
                },
            }
        }
    }

    /// Evaluate and dispatch one message. Exactly one terminal action per
    /// message: every path below ends in ack, nack, perm_error or a sink
    /// send (whose response resolves it later).
    async fn process_message(
        &self,
        msg: StoredMessage,
        sink: Option<&SinkHandle>,
        envs: &mut HashMap<ConfigId, ExprEnv>,
    ) {
        let uid = msg.uid;

        if !envs.contains_key(&msg.config_id) {
            let config = match self.store.get_source_config(&msg.config_id) {
                Ok(config) => config,
                Err(e) => {
                    warn!(
                        uid = %uid,
                        config_id = %msg.config_id,
                        error = %e,
                        "Could not find the stored configuration for a message"
                    );
                    self.metrics.record_error(ErrorKind::Config);
                    self.store.perm_error(uid).await;
                    return;
                }
            };
            match ExprEnv::compile(&config) {
                Ok(env) => {
                    envs.insert(msg.config_id, env);
                }
                Err(e) => {
                    warn!(
                        uid = %uid,
                        config_id = %msg.config_id,
                        error = %e,
                        "Stored configuration has an uncompilable expression"
                    );
                    self.metrics.record_error(ErrorKind::Transform);
                    self.store.perm_error(uid).await;
                    return;
                }
            }
        }
        let env = &envs[&msg.config_id];

        let (topic, topic_warnings) = env.topic(&msg.parsed);
        for warning in &topic_warnings {
            info!(uid = %uid, warning = %warning, "Error calculating topic");
        }
        let (partition_key, partition_warnings) = env.partition_key(&msg.parsed);
        for warning in &partition_warnings {
            info!(uid = %uid, warning = %warning, "Error calculating the partition key");
        }

        if topic.is_empty() || partition_key.is_empty() {
            warn!(uid = %uid, "Topic or partition key could not be calculated");
            self.metrics.record_error(ErrorKind::Transform);
            self.store.perm_error(uid).await;
            return;
        }

        let result = env.filter(&msg.parsed);
        let record = match result.verdict {
            FilterVerdict::Dropped => {
                self.metrics.record_filter(FilterOutcome::Dropped);
                self.store.ack(uid).await;
                return;
            }
            FilterVerdict::Rejected => {
                self.metrics.record_filter(FilterOutcome::Rejected);
                self.store.nack(uid).await;
                return;
            }
            FilterVerdict::Error => {
                warn!(
                    uid = %uid,
                    warning = result.warning.as_deref().unwrap_or("unknown"),
                    "Error happened while filtering message"
                );
                self.metrics.record_error(ErrorKind::Transform);
                self.store.perm_error(uid).await;
                return;
            }
            FilterVerdict::Pass => {
                self.metrics.record_filter(FilterOutcome::Passing);
                match result.record {
                    Some(record) => record,
                    // A filter may consume the message without failing it.
                    None => {
                        self.store.ack(uid).await;
                        return;
                    }
                }
            }
        };

        let payload = match record.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(uid = %uid, error = %e, "Error encoding broker message");
                self.store.perm_error(uid).await;
                return;
            }
        };

        match sink {
            None => {
                info!(
                    uid = %uid,
                    topic = %topic,
                    partition_key = %partition_key,
                    "Message (test mode)"
                );
                println!("{}", String::from_utf8_lossy(&payload));
                self.store.ack(uid).await;
            }
            Some(sink) => {
                let request = ProduceRequest {
                    topic,
                    partition_key,
                    payload,
                    uid,
                };
                if sink.send(request).await.is_err() {
                    // Sink dispatcher went away; requeue for the next session.
                    self.store.nack(uid).await;
                }
            }
        }
    }
}

/// Correlate sink responses back to store transitions. A fatal failure
/// signals `errors()` exactly once per session.
async fn listen_responses(
    store: Arc<MessageStore>,
    mut responses: SinkResponses,
    error_tx: broadcast::Sender<()>,
    metrics: Arc<RelayMetrics>,
) {
    let mut successes_open = true;
    let mut failures_open = true;
    let mut fatal_signalled = false;

    while successes_open || failures_open {
        tokio::select! {
            maybe_ack = responses.successes.recv(), if successes_open => match maybe_ack {
                Some(ack) => {
                    debug!(uid = %ack.uid, topic = %ack.topic, "Broker confirmed delivery");
                    store.ack(ack.uid).await;
                }
                None => successes_open = false,
            },
            maybe_failure = responses.failures.recv(), if failures_open => match maybe_failure {
                Some(failure) => {
                    info!(
                        uid = %failure.uid,
                        topic = %failure.topic,
                        kind = %failure.kind,
                        reason = %failure.reason,
                        "Broker producer error"
                    );
                    metrics.record_error(ErrorKind::Broker);
                    store.nack(failure.uid).await;
                    if failure.kind.is_fatal() && !fatal_signalled {
                        fatal_signalled = true;
                        let _ = error_tx.send(());
                    }
                }
                None => failures_open = false,
            },
        }
    }
}
