//! Delivery registry for Parley.
//!
//! Maps each user id to the sending half of that user's delivery channel.
//! All access goes through [`Registry`], so writers (register/unregister)
//! always take exclusive access and the dispatch scans take shared access.

use crate::message::{DeliverySender, Message, UserId};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

/// Outcome of a delivery scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Channels that accepted the message.
    pub delivered: usize,
    /// Channels that were full or closed.
    pub dropped: usize,
}

impl Delivery {
    fn record(&mut self, accepted: bool) {
        if accepted {
            self.delivered += 1;
        } else {
            self.dropped += 1;
        }
    }
}

/// Registry of per-user delivery channels.
#[derive(Debug, Default)]
pub struct Registry {
    channels: DashMap<UserId, DeliverySender>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user's delivery channel.
    ///
    /// Replaces any existing channel for the same id and returns it. The
    /// registry never drains or closes the replaced channel.
    pub fn register(
        &self,
        id: impl Into<UserId>,
        sender: DeliverySender,
    ) -> Option<DeliverySender> {
        let id = id.into();
        let previous = self.channels.insert(id.clone(), sender);
        debug!(user = %id, replaced = previous.is_some(), "Registered delivery channel");
        previous
    }

    /// Remove a user's delivery channel, if any.
    pub fn unregister(&self, id: &str) -> Option<DeliverySender> {
        let removed = self.channels.remove(id).map(|(_, sender)| sender);
        if removed.is_some() {
            debug!(user = %id, "Unregistered delivery channel");
        }
        removed
    }

    /// Get a user's delivery channel.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<DeliverySender> {
        self.channels.get(id).map(|e| e.value().clone())
    }

    /// Check if a user has a registered channel.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.channels.contains_key(id)
    }

    /// Number of registered channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Check if no channels are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Ids of all registered users.
    #[must_use]
    pub fn ids(&self) -> Vec<UserId> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    /// Offer a message to one user's channel without blocking.
    ///
    /// An unknown recipient yields an empty [`Delivery`].
    pub fn deliver_to(&self, id: &str, message: &Arc<Message>) -> Delivery {
        let mut delivery = Delivery::default();
        if let Some(entry) = self.channels.get(id) {
            delivery.record(offer(entry.key(), entry.value(), message));
        } else {
            trace!(recipient = %id, "No channel registered, discarding");
        }
        delivery
    }

    /// Offer a message to every registered channel without blocking.
    pub fn deliver_all(&self, message: &Arc<Message>) -> Delivery {
        let mut delivery = Delivery::default();
        for entry in self.channels.iter() {
            delivery.record(offer(entry.key(), entry.value(), message));
        }
        delivery
    }
}

fn offer(id: &str, sender: &DeliverySender, message: &Arc<Message>) -> bool {
    match sender.try_send(Arc::clone(message)) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            trace!(recipient = %id, "Delivery channel full, dropping");
            false
        }
        Err(TrySendError::Closed(_)) => {
            trace!(recipient = %id, "Delivery channel closed, dropping");
            false
        }
    }
}
