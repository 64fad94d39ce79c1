//! The store's single writer task.
//!
//! All table mutations happen here, one write transaction at a time, so every
//! state transition is an atomic batch and readers always observe a
//! consistent snapshot. The task multiplexes the control channel (acks and
//! config updates), the bounded ingest channel (stashes, committed in
//! batches) and the outputs pump, which moves one message `queued -> sent`
//! whenever the forwarder has capacity.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use redb::{Database, ReadableTable};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SyslogSourceConfig;
use crate::error::StoreError;
use crate::metrics::{ErrorKind, RelayMetrics};
use crate::model::{ConfigId, MessageId, StoredMessage};
use crate::retry::RetryConfig;

use super::tables::{CONFIGS, FAILED, QUEUED, SENT};
use super::TableCounts;

/// Upper bound on stash requests folded into one commit.
const STASH_BATCH_MAX: usize = 128;

/// A stash awaiting durable commit.
pub(super) struct StashRequest {
    pub msg: StoredMessage,
    pub reply: oneshot::Sender<Result<(), StoreError>>,
}

/// Control-plane operations.
pub(super) enum Command {
    Ack(MessageId),
    Nack(MessageId),
    PermError(MessageId),
    StoreConfigs {
        configs: Vec<SyslogSourceConfig>,
        reply: oneshot::Sender<Result<Vec<ConfigId>, StoreError>>,
    },
}

pub(super) struct Writer {
    pub db: Arc<Database>,
    pub ingest_rx: mpsc::Receiver<StashRequest>,
    pub control_rx: mpsc::Receiver<Command>,
    pub outputs_tx: mpsc::Sender<StoredMessage>,
    pub cancel: CancellationToken,
    pub error_tx: broadcast::Sender<()>,
    pub retry: RetryConfig,
    pub max_sent_inflight: usize,
    pub counts: Arc<TableCounts>,
    pub metrics: Arc<RelayMetrics>,
    pub fatal: bool,
}

impl Writer {
    pub(super) async fn run(mut self) {
        debug!("Store writer started");
        loop {
            let can_emit = !self.fatal
                && self.counts.queued.load(Ordering::Relaxed) > 0
                && (self.counts.sent.load(Ordering::Relaxed) as usize) < self.max_sent_inflight;

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                cmd = self.control_rx.recv() => match cmd {
                    Some(cmd) => self.handle_control(cmd).await,
                    None => break,
                },

                req = self.ingest_rx.recv() => match req {
                    Some(req) => self.handle_stash_batch(req).await,
                    None => break,
                },

                permit = self.outputs_tx.clone().reserve_owned(), if can_emit => match permit {
                    Ok(permit) => self.emit_next(permit).await,
                    Err(_) => break,
                },
            }

            if self.fatal {
                break;
            }
        }
        self.finish().await;
    }

    /// Drain what can be drained without waiting, requeue undelivered SENT
    /// entries, and stop. After this returns no message is left in SENT.
    async fn finish(&mut self) {
        if self.fatal {
            warn!("Store writer stopping after fatal storage error");
            return;
        }

        while let Ok(cmd) = self.control_rx.try_recv() {
            self.handle_control(cmd).await;
            if self.fatal {
                return;
            }
        }
        while let Ok(req) = self.ingest_rx.try_recv() {
            self.handle_stash_batch(req).await;
            if self.fatal {
                return;
            }
        }

        let requeued = self
            .transition(|txn| {
                let pairs = {
                    let sent = txn.open_table(SENT).map_err(transient)?;
                    let mut pairs = Vec::new();
                    for entry in sent.iter().map_err(transient)? {
                        let (k, v) = entry.map_err(transient)?;
                        pairs.push((k.value().to_vec(), v.value().to_vec()));
                    }
                    pairs
                };
                {
                    let mut queued = txn.open_table(QUEUED).map_err(transient)?;
                    let mut sent = txn.open_table(SENT).map_err(transient)?;
                    for (k, v) in &pairs {
                        queued
                            .insert(k.as_slice(), v.as_slice())
                            .map_err(transient)?;
                        sent.remove(k.as_slice()).map_err(transient)?;
                    }
                }
                Ok(pairs.len() as u64)
            })
            .await;

        match requeued {
            Ok(n) => {
                self.counts.queued.fetch_add(n, Ordering::Relaxed);
                self.counts.sent.store(0, Ordering::Relaxed);
                self.publish_sizes();
                info!(requeued = n, "Store writer drained and stopped");
            }
            Err(e) => warn!(error = %e, "Could not requeue sent messages during close"),
        }
    }

    async fn handle_stash_batch(&mut self, first: StashRequest) {
        let mut batch = vec![first];
        while batch.len() < STASH_BATCH_MAX {
            match self.ingest_rx.try_recv() {
                Ok(req) => batch.push(req),
                Err(_) => break,
            }
        }

        let encoded: Vec<(MessageId, Result<Vec<u8>, String>)> = batch
            .iter()
            .map(|req| {
                (
                    req.msg.uid,
                    req.msg.to_bytes().map_err(|e| e.to_string()),
                )
            })
            .collect();

        let result = self
            .transition(|txn| {
                let mut queued = txn.open_table(QUEUED).map_err(transient)?;
                let mut inserted = 0u64;
                for (uid, bytes) in &encoded {
                    if let Ok(bytes) = bytes {
                        queued
                            .insert(uid.as_bytes().as_slice(), bytes.as_slice())
                            .map_err(transient)?;
                        inserted += 1;
                    }
                }
                Ok(inserted)
            })
            .await;

        match result {
            Ok(inserted) => {
                self.counts.queued.fetch_add(inserted, Ordering::Relaxed);
                self.metrics.record_stashed(inserted);
                self.publish_sizes();
                for (req, (_, bytes)) in batch.into_iter().zip(encoded.into_iter()) {
                    let reply = match bytes {
                        Ok(_) => Ok(()),
                        Err(msg) => Err(StoreError::Transient(msg)),
                    };
                    let _ = req.reply.send(reply);
                }
            }
            Err(e) => {
                let msg = e.to_string();
                for req in batch {
                    let _ = req.reply.send(Err(StoreError::Fatal(msg.clone())));
                }
            }
        }
    }

    /// Move the oldest queued message to SENT and hand it to the outputs
    /// stream. An undecodable entry is quarantined in FAILED instead.
    async fn emit_next(&mut self, permit: mpsc::OwnedPermit<StoredMessage>) {
        let result = self
            .transition(|txn| {
                let (key, value) = {
                    let queued = txn.open_table(QUEUED).map_err(transient)?;
                    let x = match queued.first().map_err(transient)? {
                        Some((k, v)) => (k.value().to_vec(), v.value().to_vec()),
                        None => return Ok(None),
                    };
                    x
                };

                let decoded = StoredMessage::from_bytes(&value);
                {
                    let mut queued = txn.open_table(QUEUED).map_err(transient)?;
                    queued.remove(key.as_slice()).map_err(transient)?;
                    let destination = if decoded.is_ok() { SENT } else { FAILED };
                    let mut table = txn.open_table(destination).map_err(transient)?;
                    table
                        .insert(key.as_slice(), value.as_slice())
                        .map_err(transient)?;
                }
                Ok(Some(decoded))
            })
            .await;

        match result {
            Ok(Some(Ok(msg))) => {
                self.counts.queued.fetch_sub(1, Ordering::Relaxed);
                self.counts.sent.fetch_add(1, Ordering::Relaxed);
                self.publish_sizes();
                permit.send(msg);
            }
            Ok(Some(Err(e))) => {
                error!(error = %e, "Undecodable queued entry moved to failed table");
                self.counts.queued.fetch_sub(1, Ordering::Relaxed);
                self.counts.failed.fetch_add(1, Ordering::Relaxed);
                self.publish_sizes();
            }
            Ok(None) => {}
            Err(e) => {
                error!(error = %e, "Could not dequeue message");
            }
        }
    }

    async fn handle_control(&mut self, cmd: Command) {
        match cmd {
            Command::Ack(uid) => {
                let removed = self
                    .transition(|txn| {
                        let mut sent = txn.open_table(SENT).map_err(transient)?;
                        let x = Ok(sent
                            .remove(uid.as_bytes().as_slice())
                            .map_err(transient)?
                            .is_some());
                        x
                    })
                    .await;
                match removed {
                    Ok(true) => {
                        self.counts.sent.fetch_sub(1, Ordering::Relaxed);
                        self.metrics.record_acked();
                        self.publish_sizes();
                    }
                    Ok(false) => {
                        warn!(uid = %uid, "Ack for a message that is not in sent state");
                    }
                    Err(e) => error!(uid = %uid, error = %e, "Ack failed"),
                }
            }
            Command::Nack(uid) => {
                match self.move_from_sent(uid, QUEUED).await {
                    Ok(true) => {
                        self.counts.sent.fetch_sub(1, Ordering::Relaxed);
                        self.counts.queued.fetch_add(1, Ordering::Relaxed);
                        self.metrics.record_nacked();
                        self.publish_sizes();
                    }
                    Ok(false) => {
                        warn!(uid = %uid, "Nack for a message that is not in sent state");
                    }
                    Err(e) => error!(uid = %uid, error = %e, "Nack failed"),
                }
            }
            Command::PermError(uid) => {
                match self.move_from_sent(uid, FAILED).await {
                    Ok(true) => {
                        self.counts.sent.fetch_sub(1, Ordering::Relaxed);
                        self.counts.failed.fetch_add(1, Ordering::Relaxed);
                        self.metrics.record_perm_failed();
                        self.publish_sizes();
                    }
                    Ok(false) => {
                        warn!(uid = %uid, "Permanent error for a message that is not in sent state");
                    }
                    Err(e) => error!(uid = %uid, error = %e, "Permanent error transition failed"),
                }
            }
            Command::StoreConfigs { configs, reply } => {
                let encoded: Result<Vec<(ConfigId, Vec<u8>)>, StoreError> = configs
                    .iter()
                    .map(|cfg| {
                        let id = cfg.config_id();
                        serde_json::to_vec(cfg)
                            .map(|bytes| (id, bytes))
                            .map_err(|e| StoreError::Transient(e.to_string()))
                    })
                    .collect();

                let result = match encoded {
                    Ok(entries) => {
                        let ids: Vec<ConfigId> = entries.iter().map(|(id, _)| *id).collect();
                        self.transition(|txn| {
                            let mut table = txn.open_table(CONFIGS).map_err(transient)?;
                            for (id, bytes) in &entries {
                                table
                                    .insert(id.as_bytes().as_slice(), bytes.as_slice())
                                    .map_err(transient)?;
                            }
                            Ok(())
                        })
                        .await
                        .map(|_| ids)
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
        }
    }

    async fn move_from_sent(
        &mut self,
        uid: MessageId,
        destination: redb::TableDefinition<'static, &'static [u8], &'static [u8]>,
    ) -> Result<bool, StoreError> {
        self.transition(|txn| {
            let value = {
                let mut sent = txn.open_table(SENT).map_err(transient)?;
                let x = match sent.remove(uid.as_bytes().as_slice()).map_err(transient)? {
                    Some(guard) => guard.value().to_vec(),
                    None => return Ok(false),
                };
                x
            };
            let mut table = txn.open_table(destination).map_err(transient)?;
            table
                .insert(uid.as_bytes().as_slice(), value.as_slice())
                .map_err(transient)?;
            Ok(true)
        })
        .await
    }

    /// Execute one state transition as an atomic write transaction, retrying
    /// transient failures with bounded backoff before escalating to fatal.
    ///
    /// A fatal escalation emits once on `errors()` and poisons the writer.
    async fn transition<T>(
        &mut self,
        op: impl Fn(&redb::WriteTransaction) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut attempt: u32 = 0;
        loop {
            let started = Instant::now();
            let result = (|| {
                let txn = self.db.begin_write().map_err(transient)?;
                let out = op(&txn)?;
                txn.commit().map_err(transient)?;
                Ok(out)
            })();

            match result {
                Ok(value) => {
                    self.metrics.record_commit(started.elapsed());
                    return Ok(value);
                }
                Err(StoreError::Transient(message)) => {
                    self.metrics.record_error(ErrorKind::Storage);
                    if attempt >= self.retry.max_retries {
                        error!(error = %message, "Storage failure exhausted retries");
                        self.fail_fatal();
                        return Err(StoreError::Fatal(message));
                    }
                    let delay = self.retry.calculate_delay(attempt);
                    warn!(
                        error = %message,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Transient storage failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }

    fn fail_fatal(&mut self) {
        if !self.fatal {
            self.fatal = true;
            let _ = self.error_tx.send(());
        }
    }

    fn publish_sizes(&self) {
        self.metrics.set_table_sizes(
            self.counts.queued.load(Ordering::Relaxed),
            self.counts.sent.load(Ordering::Relaxed),
            self.counts.failed.load(Ordering::Relaxed),
        );
    }
}

pub(super) fn transient(e: impl std::fmt::Display) -> StoreError {
    StoreError::Transient(e.to_string())
}
