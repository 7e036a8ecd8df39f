//! Chat message types for Parley.
//!
//! A [`Message`] is produced by a caller, accepted by the broker's ingress
//! queue and consumed exactly once by the dispatch loop, which hands shared
//! copies to every recipient's delivery channel.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// A user identifier.
pub type UserId = String;

/// Sending half of a user's delivery channel. Written to by the broker.
pub type DeliverySender = mpsc::Sender<Arc<Message>>;

/// Receiving half of a user's delivery channel. Drained by the caller.
pub type DeliveryReceiver = mpsc::Receiver<Arc<Message>>;

/// Create a bounded delivery channel for one user.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn delivery_channel(capacity: usize) -> (DeliverySender, DeliveryReceiver) {
    mpsc::channel(capacity)
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Sending user.
    pub sender: UserId,
    /// Target user. Ignored for broadcasts.
    #[serde(default)]
    pub recipient: UserId,
    /// Message text.
    pub content: String,
    /// Deliver to every registered user.
    #[serde(default)]
    pub broadcast: bool,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp: u64,
}

impl Message {
    /// Create a message directed at a single recipient.
    #[must_use]
    pub fn direct(
        sender: impl Into<UserId>,
        recipient: impl Into<UserId>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            content: content.into(),
            broadcast: false,
            timestamp: now_millis(),
        }
    }

    /// Create a message for every registered user.
    #[must_use]
    pub fn broadcast(sender: impl Into<UserId>, content: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            recipient: UserId::new(),
            content: content.into(),
            broadcast: true,
            timestamp: now_millis(),
        }
    }

    /// Override the timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether this message goes to every registered user.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.broadcast
    }

    /// Content size in bytes.
    #[must_use]
    pub fn content_size(&self) -> usize {
        self.content.len()
    }
}
