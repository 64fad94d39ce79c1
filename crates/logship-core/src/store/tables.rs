//! Persistent table definitions.
//!
//! Four logical keyspaces in one embedded database. Message tables are keyed
//! by raw [`MessageId`](crate::model::MessageId) bytes, whose byte order is
//! generation order, so a forward scan of `queued` yields messages in
//! time-of-receipt order. Values are serde_json serialisations.

use redb::TableDefinition;

/// Messages waiting to be forwarded.
pub(super) const QUEUED: TableDefinition<&[u8], &[u8]> = TableDefinition::new("queued");

/// Messages handed to the forwarder, awaiting broker confirmation.
pub(super) const SENT: TableDefinition<&[u8], &[u8]> = TableDefinition::new("sent");

/// Messages that permanently failed; retained for operator inspection.
pub(super) const FAILED: TableDefinition<&[u8], &[u8]> = TableDefinition::new("failed");

/// Source configurations keyed by content-hash config id.
pub(super) const CONFIGS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("configs");

/// Database file name inside the store directory.
pub(super) const DB_FILE: &str = "messages.redb";
