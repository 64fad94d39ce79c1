//! Durable, crash-safe message store.
//!
//! Mediates between ingest and egress with an explicit per-message state
//! machine: `stash` appends to QUEUED, the outputs stream atomically moves
//! messages to SENT as the forwarder pulls them, and the forwarder resolves
//! every borrowed message with exactly one of `ack` (delete), `nack` (back to
//! QUEUED) or `perm_error` (to FAILED). Every entry found in SENT at open
//! time is moved back to QUEUED before the outputs stream opens, which is
//! what makes delivery at-least-once across crashes.
//!
//! The store exclusively owns its tables. Mutations are serialised through
//! the single writer task in [`writer`]; reads go through snapshot read
//! transactions.

mod tables;
mod writer;

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use redb::{Database, ReadableTable, ReadableTableMetadata};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{StoreConfig, SyslogSourceConfig};
use crate::error::StoreError;
use crate::metrics::RelayMetrics;
use crate::model::{ConfigId, MessageId, StoredMessage};
use crate::retry::RetryConfig;
use crate::{Error, Result};

use tables::{CONFIGS, DB_FILE, FAILED, QUEUED, SENT};
use writer::{transient, Command, StashRequest, Writer};

/// In-memory mirror of the persistent table sizes.
#[derive(Debug, Default)]
pub(crate) struct TableCounts {
    pub queued: AtomicU64,
    pub sent: AtomicU64,
    pub failed: AtomicU64,
}

/// Snapshot of the table sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCounts {
    /// Messages waiting to be forwarded
    pub queued: u64,
    /// Messages awaiting broker confirmation
    pub sent: u64,
    /// Permanently failed messages retained for inspection
    pub failed: u64,
}

/// Handle on the store's outputs stream.
///
/// The stream is infinite and not restartable within a session: each message
/// received here has been atomically moved to SENT and must be resolved with
/// exactly one of `ack`, `nack` or `perm_error`.
#[derive(Clone)]
pub struct Outputs {
    rx: Arc<Mutex<mpsc::Receiver<StoredMessage>>>,
}

impl Outputs {
    /// Receive the next message. `None` once the store has closed.
    pub async fn recv(&self) -> Option<StoredMessage> {
        self.rx.lock().await.recv().await
    }
}

/// The durable message store.
pub struct MessageStore {
    db: Arc<Database>,
    ingest_tx: mpsc::Sender<StashRequest>,
    control_tx: mpsc::Sender<Command>,
    outputs: Outputs,
    error_tx: broadcast::Sender<()>,
    cancel: CancellationToken,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
    counts: Arc<TableCounts>,
    metrics: Arc<RelayMetrics>,
}

impl MessageStore {
    /// Open (or create) the store under `config.directory` and run recovery.
    ///
    /// Recovery moves every SENT entry back to QUEUED before the outputs
    /// stream opens, so messages that were in flight during a crash are
    /// redelivered.
    pub fn open(
        config: &StoreConfig,
        metrics: Arc<RelayMetrics>,
        parent_cancel: &CancellationToken,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.directory)?;
        let db = Database::create(config.directory.join(DB_FILE))
            .map_err(|e| Error::Store(StoreError::Fatal(e.to_string())))?;

        let counts = Arc::new(TableCounts::default());
        let recovered = recover(&db, &counts)?;
        if recovered > 0 {
            info!(recovered, "Recovered in-flight messages back to queued");
        }
        metrics.set_table_sizes(
            counts.queued.load(Ordering::Relaxed),
            0,
            counts.failed.load(Ordering::Relaxed),
        );

        let db = Arc::new(db);
        let cancel = parent_cancel.child_token();
        let (ingest_tx, ingest_rx) = mpsc::channel(config.ingest_channel_capacity);
        let (control_tx, control_rx) = mpsc::channel(config.max_sent_inflight * 2 + 16);
        let outputs_capacity = config.max_sent_inflight.min(16);
        let (outputs_tx, outputs_rx) = mpsc::channel(outputs_capacity);
        let (error_tx, _) = broadcast::channel(1);

        let writer = Writer {
            db: db.clone(),
            ingest_rx,
            control_rx,
            outputs_tx,
            cancel: cancel.clone(),
            error_tx: error_tx.clone(),
            retry: RetryConfig::for_storage(),
            max_sent_inflight: config.max_sent_inflight,
            counts: counts.clone(),
            metrics: metrics.clone(),
            fatal: false,
        };
        let writer_handle = tokio::spawn(writer.run());

        info!(
            directory = %config.directory.display(),
            queued = counts.queued.load(Ordering::Relaxed),
            failed = counts.failed.load(Ordering::Relaxed),
            "Message store opened"
        );

        Ok(Self {
            db,
            ingest_tx,
            control_tx,
            outputs: Outputs {
                rx: Arc::new(Mutex::new(outputs_rx)),
            },
            error_tx,
            cancel,
            writer_handle: Mutex::new(Some(writer_handle)),
            counts,
            metrics,
        })
    }

    /// Enqueue a message for forwarding. Returns once the write is durable.
    ///
    /// Returns [`StoreError::BackpressureFull`] without blocking when the
    /// ingest channel is at capacity; the source decides whether to drop or
    /// to pause reads.
    pub async fn stash(&self, msg: StoredMessage) -> std::result::Result<(), StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = StashRequest {
            msg,
            reply: reply_tx,
        };
        match self.ingest_tx.try_send(request) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.record_backpressure();
                return Err(StoreError::BackpressureFull);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => return Err(StoreError::Closed),
        }
        reply_rx.await.unwrap_or(Err(StoreError::Closed))
    }

    /// The outputs stream handle.
    pub fn outputs(&self) -> Outputs {
        self.outputs.clone()
    }

    /// Confirm delivery: SENT -> deleted.
    pub async fn ack(&self, uid: MessageId) {
        if self.control_tx.send(Command::Ack(uid)).await.is_err() {
            debug!(uid = %uid, "Ack after store close");
        }
    }

    /// Reject delivery: SENT -> QUEUED, for later redelivery.
    pub async fn nack(&self, uid: MessageId) {
        if self.control_tx.send(Command::Nack(uid)).await.is_err() {
            debug!(uid = %uid, "Nack after store close");
        }
    }

    /// Permanent failure: SENT -> FAILED, retained for inspection.
    pub async fn perm_error(&self, uid: MessageId) {
        if self.control_tx.send(Command::PermError(uid)).await.is_err() {
            debug!(uid = %uid, "Permanent error after store close");
        }
    }

    /// Persist one source configuration. Idempotent: the key is the content
    /// hash, so re-storing the same configuration is a no-op.
    pub async fn store_source_config(
        &self,
        config: SyslogSourceConfig,
    ) -> std::result::Result<ConfigId, StoreError> {
        let ids = self.store_all_source_configs(vec![config]).await?;
        Ok(ids[0])
    }

    /// Persist a set of source configurations. Existing entries are
    /// preserved so messages still in flight keep their configuration.
    pub async fn store_all_source_configs(
        &self,
        configs: Vec<SyslogSourceConfig>,
    ) -> std::result::Result<Vec<ConfigId>, StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.control_tx
            .send(Command::StoreConfigs {
                configs,
                reply: reply_tx,
            })
            .await
            .map_err(|_| StoreError::Closed)?;
        reply_rx.await.unwrap_or(Err(StoreError::Closed))
    }

    /// Look up a stored source configuration.
    pub fn get_source_config(
        &self,
        id: &ConfigId,
    ) -> std::result::Result<SyslogSourceConfig, StoreError> {
        let txn = self.db.begin_read().map_err(transient)?;
        let table = txn.open_table(CONFIGS).map_err(transient)?;
        let guard = table
            .get(id.as_bytes().as_slice())
            .map_err(transient)?
            .ok_or(StoreError::ConfigNotFound(*id))?;
        serde_json::from_slice(guard.value()).map_err(transient)
    }

    /// Fatal-error signal stream. Emits once when storage becomes
    /// non-recoverable; the supervisor then initiates shutdown.
    pub fn errors(&self) -> broadcast::Receiver<()> {
        self.error_tx.subscribe()
    }

    /// Current table sizes.
    pub fn counts(&self) -> StoreCounts {
        StoreCounts {
            queued: self.counts.queued.load(Ordering::Relaxed),
            sent: self.counts.sent.load(Ordering::Relaxed),
            failed: self.counts.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop the writer. Pending writes are flushed and undelivered SENT
    /// entries are moved back to QUEUED before this resolves.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.wait_finished().await;
    }

    /// Wait until the writer task has stopped.
    pub async fn wait_finished(&self) {
        let handle = self.writer_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Startup recovery: ensure all tables exist and move SENT back to QUEUED.
fn recover(db: &Database, counts: &TableCounts) -> Result<u64> {
    let txn = db
        .begin_write()
        .map_err(|e| Error::Store(StoreError::Fatal(e.to_string())))?;

    let recovered = {
        let pairs = {
            let sent = txn.open_table(SENT).map_err(fatal)?;
            let mut pairs = Vec::new();
            for entry in sent.iter().map_err(fatal)? {
                let (k, v) = entry.map_err(fatal)?;
                pairs.push((k.value().to_vec(), v.value().to_vec()));
            }
            pairs
        };
        {
            let mut queued = txn.open_table(QUEUED).map_err(fatal)?;
            let mut sent = txn.open_table(SENT).map_err(fatal)?;
            for (k, v) in &pairs {
                queued
                    .insert(k.as_slice(), v.as_slice())
                    .map_err(fatal)?;
                sent.remove(k.as_slice()).map_err(fatal)?;
            }
        }
        // Create the remaining tables so later reads never miss them.
        txn.open_table(FAILED).map_err(fatal)?;
        txn.open_table(CONFIGS).map_err(fatal)?;

        let queued_len = txn.open_table(QUEUED).map_err(fatal)?.len().map_err(fatal)?;
        let failed_len = txn.open_table(FAILED).map_err(fatal)?.len().map_err(fatal)?;
        counts.queued.store(queued_len, Ordering::Relaxed);
        counts.sent.store(0, Ordering::Relaxed);
        counts.failed.store(failed_len, Ordering::Relaxed);

        pairs.len() as u64
    };

    txn.commit()
        .map_err(|e| Error::Store(StoreError::Fatal(e.to_string())))?;
    Ok(recovered)
}

fn fatal(e: impl std::fmt::Display) -> Error {
    Error::Store(StoreError::Fatal(e.to_string()))
}

/// Offline inspection of a store directory: per-table entry counts.
///
/// For operator tooling; must not run concurrently with a live store on the
/// same directory.
pub fn table_stats(directory: &Path) -> Result<StoreCounts> {
    let db = Database::create(directory.join(DB_FILE))
        .map_err(|e| Error::Store(StoreError::Fatal(e.to_string())))?;
    let txn = db.begin_write().map_err(fatal)?;
    let queued = txn.open_table(QUEUED).map_err(fatal)?.len().map_err(fatal)?;
    let sent = txn.open_table(SENT).map_err(fatal)?.len().map_err(fatal)?;
    let failed = txn.open_table(FAILED).map_err(fatal)?.len().map_err(fatal)?;
    txn.commit().map_err(fatal)?;
    Ok(StoreCounts {
        queued,
        sent,
        failed,
    })
}

/// Offline purge of the FAILED table. Returns the number of deleted entries.
pub fn purge_failed(directory: &Path) -> Result<u64> {
    let db = Database::create(directory.join(DB_FILE))
        .map_err(|e| Error::Store(StoreError::Fatal(e.to_string())))?;
    let txn = db.begin_write().map_err(fatal)?;
    let purged = {
        let failed = txn.open_table(FAILED).map_err(fatal)?;
        failed.len().map_err(fatal)?
    };
    txn.delete_table(FAILED).map_err(fatal)?;
    txn.open_table(FAILED).map_err(fatal)?;
    txn.commit().map_err(fatal)?;
    Ok(purged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testutil::record;
    use crate::model::{MessageIdGenerator, MessageOrigin};
    use tempfile::TempDir;

    fn store_config(dir: &TempDir) -> StoreConfig {
        StoreConfig {
            directory: dir.path().to_path_buf(),
            ingest_channel_capacity: 64,
            max_sent_inflight: 8,
        }
    }

    fn message(generator: &MessageIdGenerator, config_id: ConfigId) -> StoredMessage {
        StoredMessage {
            uid: generator.next_id(),
            config_id,
            parsed: record("web-01", 6),
            origin: MessageOrigin {
                client: "198.51.100.7".to_string(),
                local_port: 1514,
                socket_path: None,
            },
        }
    }

    async fn open(dir: &TempDir) -> MessageStore {
        let cancel = CancellationToken::new();
        MessageStore::open(
            &store_config(dir),
            Arc::new(RelayMetrics::new()),
            &cancel,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_stash_then_output_then_ack() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let generator = MessageIdGenerator::new();
        let config_id = ConfigId::from_content(b"cfg");

        let msg = message(&generator, config_id);
        let uid = msg.uid;
        store.stash(msg).await.unwrap();

        let outputs = store.outputs();
        let emitted = outputs.recv().await.unwrap();
        assert_eq!(emitted.uid, uid);

        store.ack(uid).await;
        store.close().await;
        drop(store);

        let counts = table_stats(dir.path()).unwrap();
        assert_eq!(counts.queued, 0);
        assert_eq!(counts.sent, 0);
        assert_eq!(counts.failed, 0);
    }

    #[tokio::test]
    async fn test_outputs_preserve_stash_order() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let generator = MessageIdGenerator::new();
        let config_id = ConfigId::from_content(b"cfg");

        let mut uids = Vec::new();
        for _ in 0..5 {
            let msg = message(&generator, config_id);
            uids.push(msg.uid);
            store.stash(msg).await.unwrap();
        }

        let outputs = store.outputs();
        for expected in &uids {
            let emitted = outputs.recv().await.unwrap();
            assert_eq!(emitted.uid, *expected);
            store.ack(emitted.uid).await;
        }
        store.close().await;
    }

    #[tokio::test]
    async fn test_nack_redelivers() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let generator = MessageIdGenerator::new();
        let msg = message(&generator, ConfigId::from_content(b"cfg"));
        let uid = msg.uid;
        store.stash(msg).await.unwrap();

        let outputs = store.outputs();
        let first = outputs.recv().await.unwrap();
        assert_eq!(first.uid, uid);
        store.nack(uid).await;

        let second = outputs.recv().await.unwrap();
        assert_eq!(second.uid, uid);
        store.ack(uid).await;
        store.close().await;
    }

    #[tokio::test]
    async fn test_perm_error_retains_failed_entry() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;
        let generator = MessageIdGenerator::new();
        let msg = message(&generator, ConfigId::from_content(b"cfg"));
        let uid = msg.uid;
        store.stash(msg).await.unwrap();

        let outputs = store.outputs();
        outputs.recv().await.unwrap();
        store.perm_error(uid).await;
        store.close().await;
        drop(store);

        let counts = table_stats(dir.path()).unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.queued, 0);

        assert_eq!(purge_failed(dir.path()).unwrap(), 1);
        let counts = table_stats(dir.path()).unwrap();
        assert_eq!(counts.failed, 0);
    }

    #[tokio::test]
    async fn test_backpressure_when_ingest_channel_full() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let config = StoreConfig {
            directory: dir.path().to_path_buf(),
            ingest_channel_capacity: 1,
            max_sent_inflight: 8,
        };
        let store = Arc::new(
            MessageStore::open(&config, Arc::new(RelayMetrics::new()), &cancel).unwrap(),
        );
        // Stop the writer so the single channel slot cannot drain.
        store.cancel.cancel();
        store.wait_finished().await;

        let generator = MessageIdGenerator::new();
        let config_id = ConfigId::from_content(b"cfg");

        // The first stash occupies the slot and never commits (the writer is
        // gone), so it must not be awaited inline.
        let occupant = {
            let store = store.clone();
            let msg = message(&generator, config_id);
            tokio::spawn(async move { store.stash(msg).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let second = store.stash(message(&generator, config_id)).await;
        assert!(matches!(second, Err(StoreError::BackpressureFull)));
        occupant.abort();
    }

    #[tokio::test]
    async fn test_sent_is_bounded_by_max_inflight() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let config = StoreConfig {
            directory: dir.path().to_path_buf(),
            ingest_channel_capacity: 64,
            max_sent_inflight: 2,
        };
        let store =
            MessageStore::open(&config, Arc::new(RelayMetrics::new()), &cancel).unwrap();
        let generator = MessageIdGenerator::new();
        let config_id = ConfigId::from_content(b"cfg");

        for _ in 0..10 {
            store.stash(message(&generator, config_id)).await.unwrap();
        }

        // Without acks, no more than max_sent_inflight messages may move to
        // SENT, even though the outputs channel has room.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(store.counts().sent <= 2);

        let outputs = store.outputs();
        for _ in 0..10 {
            let msg = outputs.recv().await.unwrap();
            assert!(store.counts().sent <= 2);
            store.ack(msg.uid).await;
        }
        store.close().await;
    }

    #[tokio::test]
    async fn test_recovery_requeues_sent() {
        let dir = TempDir::new().unwrap();
        let generator = MessageIdGenerator::new();
        let config_id = ConfigId::from_content(b"cfg");
        let uid;

        {
            let store = open(&dir).await;
            let msg = message(&generator, config_id);
            uid = msg.uid;
            store.stash(msg).await.unwrap();
            // Pull the message so it moves to SENT, then drop the store
            // without resolving it (simulated crash: cancel without close
            // would still drain, so verify the close path requeues instead).
            let outputs = store.outputs();
            outputs.recv().await.unwrap();
            store.close().await;
        }

        // Graceful close already moved it back to queued.
        assert_eq!(table_stats(dir.path()).unwrap().queued, 1);

        {
            let store = open(&dir).await;
            let outputs = store.outputs();
            let recovered = outputs.recv().await.unwrap();
            assert_eq!(recovered.uid, uid);
            store.ack(uid).await;
            store.close().await;
        }

        assert_eq!(table_stats(dir.path()).unwrap().queued, 0);
    }

    #[tokio::test]
    async fn test_open_recovers_entries_stranded_in_sent() {
        // Simulate a crash that left a message in SENT by seeding the table
        // directly, then verify open() moves it back to QUEUED.
        let dir = TempDir::new().unwrap();
        let generator = MessageIdGenerator::new();
        let msg = message(&generator, ConfigId::from_content(b"cfg"));
        let uid = msg.uid;

        {
            let db = Database::create(dir.path().join(tables::DB_FILE)).unwrap();
            let txn = db.begin_write().unwrap();
            {
                let mut sent = txn.open_table(SENT).unwrap();
                sent.insert(
                    uid.as_bytes().as_slice(),
                    msg.to_bytes().unwrap().as_slice(),
                )
                .unwrap();
            }
            txn.commit().unwrap();
        }

        let store = open(&dir).await;
        assert_eq!(store.counts().sent, 0);
        assert_eq!(store.counts().queued, 1);

        let outputs = store.outputs();
        let recovered = outputs.recv().await.unwrap();
        assert_eq!(recovered.uid, uid);
        store.ack(uid).await;
        store.close().await;
        drop(store);

        let counts = table_stats(dir.path()).unwrap();
        assert_eq!(counts.queued, 0);
        assert_eq!(counts.sent, 0);
    }

    #[tokio::test]
    async fn test_config_roundtrip_and_idempotence() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir).await;

        let config = SyslogSourceConfig {
            ports: vec![1514],
            topic_template: Some("logs-{hostname}".into()),
            ..SyslogSourceConfig::default()
        };
        let id = store.store_source_config(config.clone()).await.unwrap();
        assert_eq!(id, config.config_id());

        let fetched = store.get_source_config(&id).unwrap();
        assert_eq!(fetched, config);

        // Storing the same set again changes nothing.
        let ids = store
            .store_all_source_configs(vec![config.clone()])
            .await
            .unwrap();
        assert_eq!(ids, vec![id]);

        let missing = ConfigId::from_content(b"nope");
        assert!(matches!(
            store.get_source_config(&missing),
            Err(StoreError::ConfigNotFound(_))
        ));
        store.close().await;
    }
}
