//! Shared data model: message identifiers, raw and parsed messages, and the
//! unit of persistence handed to the store.

mod ids;
mod message;

pub use ids::{ConfigId, IdStream, MessageId, MessageIdGenerator};
pub use message::{ListenerInfo, MessageOrigin, ParsedRecord, RawMessage, StoredMessage};

#[cfg(test)]
pub(crate) use message::testutil;
