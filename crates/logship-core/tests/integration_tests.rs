//! End-to-end tests for the store/forwarder pipeline.
//!
//! The broker is replaced by a scripted sink connector so delivery outcomes
//! can be chosen per message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use logship_core::config::{Config, StoreConfig, SyslogSourceConfig};
use logship_core::error::BrokerErrorKind;
use logship_core::forwarder::{
    ProduceFailure, ProduceRequest, SinkAck, SinkConnector, SinkHandle, SinkResponses,
};
use logship_core::model::{
    ConfigId, MessageId, MessageIdGenerator, MessageOrigin, ParsedRecord, StoredMessage,
};
use logship_core::store::{table_stats, MessageStore};
use logship_core::{Forwarder, HealthCheck, RelayMetrics, Supervisor};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type Decision = dyn Fn(&ProduceRequest) -> Result<(), BrokerErrorKind> + Send + Sync;

/// A sink connector whose delivery outcomes are scripted per request.
struct ScriptedConnector {
    decide: Arc<Decision>,
    seen: Arc<parking_lot::Mutex<Vec<ProduceRequest>>>,
    connects: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    fn new(decide: impl Fn(&ProduceRequest) -> Result<(), BrokerErrorKind> + Send + Sync + 'static)
    -> Self {
        Self {
            decide: Arc::new(decide),
            seen: Arc::new(parking_lot::Mutex::new(Vec::new())),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn ack_all() -> Self {
        Self::new(|_| Ok(()))
    }

    fn seen(&self) -> Vec<ProduceRequest> {
        self.seen.lock().clone()
    }
}

#[async_trait::async_trait]
impl SinkConnector for ScriptedConnector {
    async fn connect(
        &self,
        _config: &logship_core::config::BrokerConfig,
        _cancel: &CancellationToken,
    ) -> Option<(SinkHandle, SinkResponses)> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (input_tx, mut input_rx) = mpsc::channel::<ProduceRequest>(64);
        let (success_tx, successes) = mpsc::channel(64);
        let (failure_tx, failures) = mpsc::channel(64);
        let decide = self.decide.clone();
        let seen = self.seen.clone();

        tokio::spawn(async move {
            while let Some(request) = input_rx.recv().await {
                seen.lock().push(request.clone());
                match decide(&request) {
                    Ok(()) => {
                        let _ = success_tx
                            .send(SinkAck {
                                uid: request.uid,
                                topic: request.topic,
                            })
                            .await;
                    }
                    Err(kind) => {
                        let _ = failure_tx
                            .send(ProduceFailure {
                                uid: request.uid,
                                topic: request.topic,
                                kind,
                                reason: "scripted failure".to_string(),
                            })
                            .await;
                    }
                }
            }
        });

        Some((
            SinkHandle::new(input_tx),
            SinkResponses {
                successes,
                failures,
            },
        ))
    }
}

fn store_config(dir: &TempDir, max_sent_inflight: usize) -> StoreConfig {
    StoreConfig {
        directory: dir.path().to_path_buf(),
        ingest_channel_capacity: 4096,
        max_sent_inflight,
    }
}

fn broker_config() -> logship_core::config::BrokerConfig {
    let toml_src = r#"
        [store]
        directory = "unused"
        [broker]
        bootstrap_servers = ["broker-1:9092"]
    "#;
    let config: Config = toml::from_str(toml_src).unwrap();
    config.broker
}

fn record(hostname: &str, appname: &str) -> ParsedRecord {
    let now = chrono::Utc::now();
    ParsedRecord {
        facility: 16,
        severity: 6,
        priority: 134,
        hostname: hostname.to_string(),
        appname: appname.to_string(),
        procid: "100".to_string(),
        msgid: "-".to_string(),
        timestamp_reported: now,
        timestamp_generated: now,
        message: "hello".to_string(),
        structured_data: HashMap::new(),
        properties: HashMap::new(),
    }
}

fn message(
    generator: &MessageIdGenerator,
    config_id: ConfigId,
    hostname: &str,
    appname: &str,
) -> StoredMessage {
    StoredMessage {
        uid: generator.next_id(),
        config_id,
        parsed: record(hostname, appname),
        origin: MessageOrigin {
            client: "198.51.100.7".to_string(),
            local_port: 1514,
            socket_path: None,
        },
    }
}

async fn open_store(dir: &TempDir, max_sent_inflight: usize) -> Arc<MessageStore> {
    Arc::new(
        MessageStore::open(
            &store_config(dir, max_sent_inflight),
            Arc::new(RelayMetrics::new()),
            &CancellationToken::new(),
        )
        .unwrap(),
    )
}

/// Poll until the store reaches an empty queued+sent state.
async fn wait_drained(store: &MessageStore) {
    for _ in 0..1200 {
        let counts = store.counts();
        if counts.queued == 0 && counts.sent == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("store did not drain: {:?}", store.counts());
}

#[tokio::test]
async fn scenario_messages_forwarded_in_order_and_acked() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 16).await;
    let generator = MessageIdGenerator::new();

    let source = SyslogSourceConfig::default();
    let config_id = store.store_source_config(source).await.unwrap();

    let mut uids = Vec::new();
    for name in ["a", "b", "c"] {
        let msg = message(&generator, config_id, "web-01", name);
        uids.push(msg.uid);
        store.stash(msg).await.unwrap();
    }

    let connector = Arc::new(ScriptedConnector::ack_all());
    let forwarder = Forwarder::with_connector(
        false,
        connector.clone(),
        Arc::new(RelayMetrics::new()),
    );
    let cancel = CancellationToken::new();
    assert!(forwarder.forward(cancel.clone(), store.clone(), broker_config()));

    wait_drained(&store).await;
    cancel.cancel();
    forwarder.wait_finished().await;
    store.close().await;
    drop(store);

    // Delivered in MessageId order, each exactly once.
    let seen: Vec<MessageId> = connector.seen().iter().map(|r| r.uid).collect();
    assert_eq!(seen, uids);
    // Default topic and partition key.
    assert!(connector.seen().iter().all(|r| r.topic == "syslog"));
    assert!(connector.seen().iter().all(|r| r.partition_key == "web-01"));

    let counts = table_stats(dir.path()).unwrap();
    assert_eq!((counts.queued, counts.sent, counts.failed), (0, 0, 0));
}

#[tokio::test]
async fn scenario_filtered_message_is_acked_without_broker_send() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 16).await;
    let generator = MessageIdGenerator::new();

    let source = SyslogSourceConfig {
        filter_expr: Some(r#"hostname != "blocked""#.to_string()),
        ..SyslogSourceConfig::default()
    };
    let config_id = store.store_source_config(source).await.unwrap();

    let blocked = message(&generator, config_id, "blocked", "app");
    let passing = message(&generator, config_id, "web-01", "app");
    let passing_uid = passing.uid;
    store.stash(blocked).await.unwrap();
    store.stash(passing).await.unwrap();

    let connector = Arc::new(ScriptedConnector::ack_all());
    let forwarder = Forwarder::with_connector(
        false,
        connector.clone(),
        Arc::new(RelayMetrics::new()),
    );
    let cancel = CancellationToken::new();
    forwarder.forward(cancel.clone(), store.clone(), broker_config());

    wait_drained(&store).await;
    cancel.cancel();
    forwarder.wait_finished().await;
    store.close().await;
    drop(store);

    // Only the passing message reached the broker; the blocked one was
    // acked (dropped) without a send and nothing is left behind.
    let seen = connector.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].uid, passing_uid);

    let counts = table_stats(dir.path()).unwrap();
    assert_eq!((counts.queued, counts.sent, counts.failed), (0, 0, 0));
}

#[tokio::test]
async fn scenario_empty_topic_moves_message_to_failed() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 16).await;
    let generator = MessageIdGenerator::new();

    // Topic comes from the appname; one message has an empty appname.
    let source = SyslogSourceConfig {
        topic_template: Some("{appname}".to_string()),
        ..SyslogSourceConfig::default()
    };
    let config_id = store.store_source_config(source).await.unwrap();

    let doomed = message(&generator, config_id, "web-01", "");
    let fine = message(&generator, config_id, "web-01", "app");
    let fine_uid = fine.uid;
    store.stash(doomed).await.unwrap();
    store.stash(fine).await.unwrap();

    let connector = Arc::new(ScriptedConnector::ack_all());
    let forwarder = Forwarder::with_connector(
        false,
        connector.clone(),
        Arc::new(RelayMetrics::new()),
    );
    let cancel = CancellationToken::new();
    forwarder.forward(cancel.clone(), store.clone(), broker_config());

    wait_drained(&store).await;
    cancel.cancel();
    forwarder.wait_finished().await;
    store.close().await;
    drop(store);

    let seen = connector.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].uid, fine_uid);
    assert_eq!(seen[0].topic, "app");

    let counts = table_stats(dir.path()).unwrap();
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.queued, 0);
}

#[tokio::test]
async fn scenario_missing_config_moves_message_to_failed() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 16).await;
    let generator = MessageIdGenerator::new();

    // Nothing stored under this config id.
    let orphan_config = ConfigId::from_content(b"never-stored");
    store
        .stash(message(&generator, orphan_config, "web-01", "app"))
        .await
        .unwrap();

    let connector = Arc::new(ScriptedConnector::ack_all());
    let forwarder = Forwarder::with_connector(
        false,
        connector.clone(),
        Arc::new(RelayMetrics::new()),
    );
    let cancel = CancellationToken::new();
    forwarder.forward(cancel.clone(), store.clone(), broker_config());

    wait_drained(&store).await;
    cancel.cancel();
    forwarder.wait_finished().await;
    store.close().await;
    drop(store);

    assert!(connector.seen().is_empty());
    assert_eq!(table_stats(dir.path()).unwrap().failed, 1);
}

#[tokio::test]
async fn scenario_fatal_broker_error_signals_once_and_requeues() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 16).await;
    let generator = MessageIdGenerator::new();

    let config_id = store
        .store_source_config(SyslogSourceConfig::default())
        .await
        .unwrap();
    let msg = message(&generator, config_id, "web-01", "app");
    let uid = msg.uid;
    store.stash(msg).await.unwrap();

    // First delivery attempt fails with a fatal auth error, later ones ack.
    let failed_once = Arc::new(AtomicBool::new(false));
    let failed_once_for_decide = failed_once.clone();
    let connector = Arc::new(ScriptedConnector::new(move |_| {
        if failed_once_for_decide.swap(true, Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerErrorKind::AuthFailure)
        }
    }));

    let forwarder = Forwarder::with_connector(
        false,
        connector.clone(),
        Arc::new(RelayMetrics::new()),
    );
    let mut errors = forwarder.errors();
    let cancel = CancellationToken::new();
    forwarder.forward(cancel.clone(), store.clone(), broker_config());

    // The fatal error is signalled exactly once.
    tokio::time::timeout(Duration::from_secs(5), errors.recv())
        .await
        .expect("fatal error signal")
        .unwrap();

    // Supervisor behavior: stop the session, restart it. The message was
    // nacked back to queued, so the new session redelivers it.
    cancel.cancel();
    forwarder.wait_finished().await;
    assert!(!forwarder.is_forwarding());

    let cancel = CancellationToken::new();
    assert!(forwarder.forward(cancel.clone(), store.clone(), broker_config()));
    wait_drained(&store).await;
    cancel.cancel();
    forwarder.wait_finished().await;
    store.close().await;

    let deliveries: Vec<MessageId> = connector.seen().iter().map(|r| r.uid).collect();
    assert_eq!(deliveries, vec![uid, uid]);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 2);

    let counts = table_stats(dir.path()).unwrap();
    assert_eq!((counts.queued, counts.sent, counts.failed), (0, 0, 0));
}

#[tokio::test]
async fn scenario_broker_outage_backlog_drains_within_inflight_bound() {
    let dir = TempDir::new().unwrap();
    let max_inflight = 32;
    let store = open_store(&dir, max_inflight).await;
    let generator = MessageIdGenerator::new();

    let config_id = store
        .store_source_config(SyslogSourceConfig::default())
        .await
        .unwrap();

    const BACKLOG: usize = 500;
    for i in 0..BACKLOG {
        store
            .stash(message(&generator, config_id, "web-01", &format!("app{i}")))
            .await
            .unwrap();
    }

    // Broker is down: every delivery fails transiently until it comes back.
    let broker_up = Arc::new(AtomicBool::new(false));
    let broker_up_for_decide = broker_up.clone();
    let connector = Arc::new(ScriptedConnector::new(move |_| {
        if broker_up_for_decide.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerErrorKind::Transient)
        }
    }));

    let forwarder = Forwarder::with_connector(
        false,
        connector.clone(),
        Arc::new(RelayMetrics::new()),
    );
    let cancel = CancellationToken::new();
    forwarder.forward(cancel.clone(), store.clone(), broker_config());

    // While the broker is down the sent count must respect the bound.
    for _ in 0..20 {
        assert!(store.counts().sent <= max_inflight as u64);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    broker_up.store(true, Ordering::SeqCst);
    wait_drained(&store).await;
    assert!(store.counts().sent <= max_inflight as u64);

    cancel.cancel();
    forwarder.wait_finished().await;
    store.close().await;
    drop(store);

    let counts = table_stats(dir.path()).unwrap();
    assert_eq!((counts.queued, counts.sent, counts.failed), (0, 0, 0));
}

#[tokio::test]
async fn forward_enforces_a_single_session() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 16).await;

    let connector = Arc::new(ScriptedConnector::ack_all());
    let forwarder =
        Forwarder::with_connector(false, connector, Arc::new(RelayMetrics::new()));
    let cancel = CancellationToken::new();

    assert!(forwarder.forward(cancel.clone(), store.clone(), broker_config()));
    // A second session must be refused while the first is running.
    assert!(!forwarder.forward(cancel.clone(), store.clone(), broker_config()));

    cancel.cancel();
    forwarder.wait_finished().await;

    // Once the first session has drained, a new one is accepted.
    let second_cancel = CancellationToken::new();
    assert!(forwarder.forward(second_cancel.clone(), store.clone(), broker_config()));
    second_cancel.cancel();
    forwarder.wait_finished().await;
    store.close().await;
}

#[tokio::test]
async fn test_mode_prints_and_acks_without_broker() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir, 16).await;
    let generator = MessageIdGenerator::new();

    let config_id = store
        .store_source_config(SyslogSourceConfig::default())
        .await
        .unwrap();
    store
        .stash(message(&generator, config_id, "web-01", "app"))
        .await
        .unwrap();

    let forwarder = Forwarder::new(true, Arc::new(RelayMetrics::new()));
    let cancel = CancellationToken::new();
    forwarder.forward(cancel.clone(), store.clone(), broker_config());

    wait_drained(&store).await;
    cancel.cancel();
    forwarder.wait_finished().await;
    store.close().await;
    drop(store);

    let counts = table_stats(dir.path()).unwrap();
    assert_eq!((counts.queued, counts.sent, counts.failed), (0, 0, 0));
}

#[tokio::test]
async fn supervisor_runs_pipeline_and_shuts_down_in_order() {
    let dir = TempDir::new().unwrap();
    let store_dir = dir.path().join("store");

    let toml_src = format!(
        r#"
        [store]
        directory = "{}"

        [broker]
        bootstrap_servers = ["broker-1:9092"]

        [[sources]]
        ports = [0]
        topic_template = "logs-{{hostname}}"
    "#,
        store_dir.display()
    );
    let config: Config = toml::from_str(&toml_src).unwrap();
    config.validate().unwrap();
    let source_config = config.sources[0].clone();

    let metrics = Arc::new(RelayMetrics::new());
    let health = Arc::new(HealthCheck::new());
    let connector = Arc::new(ScriptedConnector::ack_all());
    let forwarder = Forwarder::with_connector(false, connector.clone(), metrics.clone());

    let supervisor = Supervisor::start(
        config,
        None,
        false,
        Vec::new(),
        metrics.clone(),
        health.clone(),
    )
    .unwrap()
    .with_forwarder(forwarder);

    let store = supervisor.store();
    let shutdown = supervisor.shutdown_token();
    let run = tokio::spawn(supervisor.run());

    // Ingest a message as a source would.
    let generator = MessageIdGenerator::new();
    let msg = message(
        &generator,
        source_config.config_id(),
        "web-01",
        "app",
    );
    // The supervisor persists source configs on startup; wait for that.
    for _ in 0..100 {
        if store.get_source_config(&source_config.config_id()).is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    store.stash(msg).await.unwrap();

    wait_drained(&store).await;
    shutdown.cancel();
    run.await.unwrap().unwrap();
    drop(store);

    let seen = connector.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].topic, "logs-web-01");

    // Graceful drain: nothing left in sent after shutdown.
    let counts = table_stats(&store_dir).unwrap();
    assert_eq!(counts.sent, 0);
    assert_eq!(counts.queued, 0);
}
