//! Message and configuration identifiers.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::timestamp::context::ContextV7;
use uuid::{Timestamp, Uuid};

/// 128-bit lexicographically-sortable timestamped message identifier.
///
/// Backed by a UUIDv7: 48 bits of Unix milliseconds followed by a monotonic
/// counter and per-process entropy, so byte order equals generation order
/// even within the same millisecond. Unique for the process lifetime and
/// used as the primary key in every persistent table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Raw big-endian bytes, suitable as a storage key.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Rebuild an id from storage key bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        MessageId(Uuid::from_bytes(bytes))
    }

    /// Milliseconds since the Unix epoch encoded in the id.
    pub fn timestamp_ms(&self) -> u64 {
        let b = self.0.as_bytes();
        ((b[0] as u64) << 40)
            | ((b[1] as u64) << 32)
            | ((b[2] as u64) << 24)
            | ((b[3] as u64) << 16)
            | ((b[4] as u64) << 8)
            | (b[5] as u64)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Generator of fresh [`MessageId`] values.
///
/// Holds the per-process entropy context that keeps ids monotonic within a
/// millisecond. Not `Clone`; share one generator or spawn an [`IdStream`]
/// per consumer.
pub struct MessageIdGenerator {
    context: ContextV7,
}

impl MessageIdGenerator {
    /// Create a generator with a fresh entropy context.
    pub fn new() -> Self {
        Self {
            context: ContextV7::new(),
        }
    }

    /// Produce the next id.
    pub fn next_id(&self) -> MessageId {
        let ts = Timestamp::now(&self.context);
        MessageId(Uuid::new_v7(ts))
    }
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream of pre-generated message ids handed to an ingest source.
///
/// A background task keeps a small buffer of ids ready so sources never
/// block on generation in their accept loops.
pub struct IdStream {
    rx: mpsc::Receiver<MessageId>,
}

impl IdStream {
    /// Spawn a generator task and return the receiving half.
    ///
    /// The task runs until `cancel` fires.
    pub fn spawn(buffer: usize, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        tokio::spawn(async move {
            let generator = MessageIdGenerator::new();
            loop {
                let id = generator.next_id();
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    res = tx.send(id) => {
                        if res.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        Self { rx }
    }

    /// Receive the next pre-generated id. `None` after cancellation.
    pub async fn next(&mut self) -> Option<MessageId> {
        self.rx.recv().await
    }
}

/// Stable content-hash identifier of a source configuration.
///
/// Computed over the canonical serialisation of the configuration, so the
/// same configuration hashes to the same id across restarts and reloads and
/// in-flight messages stay attached to their source config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConfigId([u8; 32]);

impl ConfigId {
    /// Hash arbitrary canonical bytes into a config id.
    pub fn from_content(content: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        let digest = Sha256::digest(content);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        ConfigId(bytes)
    }

    /// Raw bytes, suitable as a storage key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Rebuild from storage key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ConfigId(bytes)
    }
}

impl std::fmt::Display for ConfigId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ConfigId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err(format!("expected 64 hex characters, got {}", s.len()));
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(|e| e.to_string())?;
            bytes[i] = u8::from_str_radix(hex, 16).map_err(|e| e.to_string())?;
        }
        Ok(ConfigId(bytes))
    }
}

impl Serialize for ConfigId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ConfigId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_sorted_by_generation_order() {
        let generator = MessageIdGenerator::new();
        let mut previous = generator.next_id();
        for _ in 0..1000 {
            let next = generator.next_id();
            assert!(next > previous, "{} should sort after {}", next, previous);
            assert!(next.as_bytes() > previous.as_bytes());
            previous = next;
        }
    }

    #[test]
    fn test_id_byte_roundtrip() {
        let id = MessageIdGenerator::new().next_id();
        let restored = MessageId::from_bytes(*id.as_bytes());
        assert_eq!(id, restored);
    }

    #[test]
    fn test_id_embeds_wall_clock() {
        let before = chrono::Utc::now().timestamp_millis() as u64;
        let id = MessageIdGenerator::new().next_id();
        let after = chrono::Utc::now().timestamp_millis() as u64;
        assert!(id.timestamp_ms() >= before);
        assert!(id.timestamp_ms() <= after);
    }

    #[test]
    fn test_config_id_is_content_addressed() {
        let a = ConfigId::from_content(b"config-a");
        let b = ConfigId::from_content(b"config-a");
        let c = ConfigId::from_content(b"config-b");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_config_id_hex_roundtrip() {
        let id = ConfigId::from_content(b"roundtrip");
        let hex = id.to_string();
        assert_eq!(hex.len(), 64);
        let parsed: ConfigId = hex.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[tokio::test]
    async fn test_id_stream_delivers_fresh_ids() {
        let cancel = CancellationToken::new();
        let mut stream = IdStream::spawn(8, cancel.clone());
        let first = stream.next().await.unwrap();
        let second = stream.next().await.unwrap();
        assert!(second > first);
        cancel.cancel();
    }
}
