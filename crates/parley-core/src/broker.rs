//! Message broker for Parley.
//!
//! The broker owns a bounded ingress queue shared by all producers and a
//! [`Registry`] of per-user delivery channels. A single dispatch task drains
//! the queue and routes each message to one recipient or to everyone.
//!
//! Delivery is best-effort: a message for an unregistered recipient, or for a
//! recipient whose channel is full, is dropped without notifying the sender.
//! The dispatch task never waits on a single consumer.

use crate::lifetime::Lifetime;
use crate::message::{DeliveryReceiver, DeliverySender, Message, UserId};
use crate::registry::{Delivery, Registry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Default ingress queue capacity.
pub const DEFAULT_INGRESS_CAPACITY: usize = 100;

/// Default capacity for delivery channels created by the broker.
pub const DEFAULT_DELIVERY_CAPACITY: usize = 16;

/// Broker errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The broker's lifetime has been cancelled.
    #[error("broker cancelled")]
    Cancelled,

    /// The dispatch loop was already started.
    #[error("broker is already running")]
    AlreadyRunning,

    /// The ingress queue is full.
    #[error("ingress queue full")]
    QueueFull,
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Capacity of the shared ingress queue.
    pub ingress_capacity: usize,
    /// Capacity of delivery channels made by [`Broker::delivery_channel`].
    pub delivery_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            ingress_capacity: DEFAULT_INGRESS_CAPACITY,
            delivery_capacity: DEFAULT_DELIVERY_CAPACITY,
        }
    }
}

/// Lifecycle phase of a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    /// Constructed, dispatch loop not started. Messages are buffered.
    Idle,
    /// Dispatch loop active.
    Running,
    /// Dispatch loop exited. There is no restart.
    Stopped,
}

/// Broker statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Users with a registered delivery channel.
    pub registered_users: usize,
    /// Messages waiting in the ingress queue.
    pub queued: usize,
    /// Messages taken off the ingress queue and routed.
    pub dispatched: u64,
    /// Per-recipient copies accepted by a delivery channel.
    pub delivered: u64,
    /// Per-recipient copies dropped on a full or closed channel.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    dispatched: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn record(&self, delivery: Delivery) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.delivered.fetch_add(delivery.delivered as u64, Ordering::Relaxed);
        self.dropped.fetch_add(delivery.dropped as u64, Ordering::Relaxed);
    }
}

/// The message broker.
///
/// Share it behind an [`Arc`]; every operation takes `&self`.
pub struct Broker {
    lifetime: Lifetime,
    config: BrokerConfig,
    ingress: mpsc::Sender<Message>,
    /// Ingress receiver, held until [`Broker::run`] hands it to the dispatch task.
    pending: Mutex<Option<mpsc::Receiver<Message>>>,
    registry: Arc<Registry>,
    counters: Arc<Counters>,
    done: Arc<watch::Sender<bool>>,
}

impl Broker {
    /// Create a broker with default configuration.
    #[must_use]
    pub fn new(lifetime: Lifetime) -> Self {
        Self::with_config(lifetime, BrokerConfig::default())
    }

    /// Create a broker with custom configuration.
    #[must_use]
    pub fn with_config(lifetime: Lifetime, config: BrokerConfig) -> Self {
        debug!("Creating broker with config: {:?}", config);
        let (ingress, pending) = mpsc::channel(config.ingress_capacity.max(1));
        let (done, _) = watch::channel(false);
        Self {
            lifetime,
            config,
            ingress,
            pending: Mutex::new(Some(pending)),
            registry: Arc::new(Registry::new()),
            counters: Arc::new(Counters::default()),
            done: Arc::new(done),
        }
    }

    /// Get the broker configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Create a delivery channel sized by [`BrokerConfig::delivery_capacity`].
    #[must_use]
    pub fn delivery_channel(&self) -> (DeliverySender, DeliveryReceiver) {
        crate::message::delivery_channel(self.config.delivery_capacity.max(1))
    }

    /// Register a user's delivery channel, replacing any previous one.
    ///
    /// The broker drops its handle to a replaced channel but never drains or
    /// closes it.
    pub fn register_user(&self, id: impl Into<UserId>, sender: DeliverySender) {
        self.registry.register(id, sender);
    }

    /// Unregister a user. Does nothing if the user is not registered.
    pub fn unregister_user(&self, id: &str) {
        self.registry.unregister(id);
    }

    /// Check if a user has a registered delivery channel.
    #[must_use]
    pub fn is_registered(&self, id: &str) -> bool {
        self.registry.contains(id)
    }

    /// Submit a message for dispatch.
    ///
    /// Waits only while the ingress queue is full. Messages submitted before
    /// [`Broker::run`] are buffered.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::Cancelled`] if the lifetime is already
    /// cancelled, if cancellation wins the race against the enqueue, or if
    /// the dispatch loop has exited.
    pub async fn send_message(&self, message: Message) -> Result<(), BrokerError> {
        if self.lifetime.is_cancelled() {
            return Err(BrokerError::Cancelled);
        }

        tokio::select! {
            () = self.lifetime.cancelled() => Err(BrokerError::Cancelled),
            sent = self.ingress.send(message) => sent.map_err(|_| BrokerError::Cancelled),
        }
    }

    /// Submit a message without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::QueueFull`] if the ingress queue is full, or
    /// [`BrokerError::Cancelled`] as for [`Broker::send_message`].
    pub fn try_send_message(&self, message: Message) -> Result<(), BrokerError> {
        if self.lifetime.is_cancelled() {
            return Err(BrokerError::Cancelled);
        }

        self.ingress.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => BrokerError::QueueFull,
            TrySendError::Closed(_) => BrokerError::Cancelled,
        })
    }

    /// Start the dispatch loop on the current tokio runtime.
    ///
    /// The loop runs until the lifetime is cancelled; see [`Broker::done`].
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::AlreadyRunning`] if called more than once.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn run(&self) -> Result<JoinHandle<()>, BrokerError> {
        let ingress = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(BrokerError::AlreadyRunning)?;

        let dispatcher = Dispatcher {
            registry: Arc::clone(&self.registry),
            counters: Arc::clone(&self.counters),
        };
        let done = DoneGuard(Arc::clone(&self.done));

        info!("Starting broker dispatch loop");
        Ok(tokio::spawn(dispatch_loop(
            self.lifetime.clone(),
            ingress,
            dispatcher,
            done,
        )))
    }

    /// Wait for the dispatch loop to exit.
    ///
    /// Never resolves if [`Broker::run`] was not called.
    pub async fn done(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn state(&self) -> BrokerState {
        if *self.done.borrow() {
            BrokerState::Stopped
        } else if self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
        {
            BrokerState::Idle
        } else {
            BrokerState::Running
        }
    }

    /// Get broker statistics.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            registered_users: self.registry.len(),
            queued: self.ingress.max_capacity() - self.ingress.capacity(),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Routes messages taken off the ingress queue.
struct Dispatcher {
    registry: Arc<Registry>,
    counters: Arc<Counters>,
}

impl Dispatcher {
    fn dispatch(&self, message: Message) {
        let message = Arc::new(message);
        let delivery = if message.broadcast {
            self.registry.deliver_all(&message)
        } else {
            self.registry.deliver_to(&message.recipient, &message)
        };

        trace!(
            sender = %message.sender,
            recipient = %message.recipient,
            broadcast = message.broadcast,
            delivered = delivery.delivered,
            dropped = delivery.dropped,
            "Dispatched message"
        );
        self.counters.record(delivery);
    }
}

/// Marks the broker stopped when the dispatch task ends, even by panic.
struct DoneGuard(Arc<watch::Sender<bool>>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

async fn dispatch_loop(
    lifetime: Lifetime,
    mut ingress: mpsc::Receiver<Message>,
    dispatcher: Dispatcher,
    _done: DoneGuard,
) {
    let cancelled = lifetime.cancelled();
    tokio::pin!(cancelled);

    loop {
        tokio::select! {
            () = &mut cancelled => break,
            received = ingress.recv() => match received {
                Some(message) => dispatcher.dispatch(message),
                None => break,
            },
        }
    }

    // Refuse further sends, then discard whatever was still queued.
    ingress.close();
    let mut discarded = 0usize;
    while ingress.try_recv().is_ok() {
        discarded += 1;
    }

    info!(discarded, "Broker dispatch loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::delivery_channel;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(1);

    async fn recv(rx: &mut DeliveryReceiver) -> Arc<Message> {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("delivery channel closed")
    }

    fn running_broker() -> (Lifetime, Arc<Broker>) {
        let lifetime = Lifetime::new();
        let broker = Arc::new(Broker::new(lifetime.clone()));
        broker.run().unwrap();
        (lifetime, broker)
    }

    #[tokio::test]
    async fn test_direct_then_broadcast_scenario() {
        let (_lifetime, broker) = running_broker();
        let (alice_tx, mut alice_rx) = delivery_channel(1);
        let (bob_tx, mut bob_rx) = delivery_channel(1);
        broker.register_user("alice", alice_tx);
        broker.register_user("bob", bob_tx);

        let hi = Message::direct("alice", "bob", "hi");
        broker.send_message(hi.clone()).await.unwrap();
        assert_eq!(*recv(&mut bob_rx).await, hi);
        assert!(alice_rx.try_recv().is_err());

        let all = Message::broadcast("alice", "all");
        broker.send_message(all.clone()).await.unwrap();
        assert_eq!(*recv(&mut alice_rx).await, all);
        assert_eq!(*recv(&mut bob_rx).await, all);
    }

    #[tokio::test]
    async fn test_broadcast_skips_full_channel() {
        let (_lifetime, broker) = running_broker();
        let (alice_tx, mut alice_rx) = delivery_channel(1);
        let (bob_tx, mut bob_rx) = delivery_channel(1);
        broker.register_user("alice", alice_tx);
        broker.register_user("bob", bob_tx);

        // Fill bob's channel and leave it undrained.
        broker
            .send_message(Message::direct("alice", "bob", "first"))
            .await
            .unwrap();
        broker
            .send_message(Message::broadcast("alice", "all"))
            .await
            .unwrap();

        assert_eq!(recv(&mut alice_rx).await.content, "all");
        assert_eq!(bob_rx.try_recv().unwrap().content, "first");
        assert!(bob_rx.try_recv().is_err());

        let stats = broker.stats();
        assert_eq!(stats.dispatched, 2);
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.dropped, 1);
    }

    #[tokio::test]
    async fn test_direct_message_to_full_channel_is_dropped() {
        let (_lifetime, broker) = running_broker();
        let (bob_tx, mut bob_rx) = delivery_channel(1);
        let (alice_tx, mut alice_rx) = delivery_channel(1);
        broker.register_user("bob", bob_tx);
        broker.register_user("alice", alice_tx);

        broker
            .send_message(Message::direct("alice", "bob", "first"))
            .await
            .unwrap();
        broker
            .send_message(Message::direct("alice", "bob", "second"))
            .await
            .unwrap();
        broker
            .send_message(Message::direct("bob", "alice", "marker"))
            .await
            .unwrap();

        // Once the marker arrives both messages for bob have been dispatched.
        assert_eq!(recv(&mut alice_rx).await.content, "marker");
        assert_eq!(bob_rx.try_recv().unwrap().content, "first");
        assert!(bob_rx.try_recv().is_err());
        assert_eq!(broker.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone() {
        let (_lifetime, broker) = running_broker();
        let mut receivers = Vec::new();
        for i in 0..10 {
            let (tx, rx) = delivery_channel(4);
            broker.register_user(format!("user-{i}"), tx);
            receivers.push(rx);
        }

        let msg = Message::broadcast("user-0", "hello everyone");
        broker.send_message(msg.clone()).await.unwrap();

        for rx in &mut receivers {
            assert_eq!(*recv(rx).await, msg);
        }
    }

    #[tokio::test]
    async fn test_unregistered_recipient_is_discarded() {
        let (_lifetime, broker) = running_broker();
        let (tx, mut rx) = delivery_channel(4);
        broker.register_user("alice", tx);

        broker
            .send_message(Message::direct("alice", "ghost", "anyone?"))
            .await
            .unwrap();
        broker
            .send_message(Message::direct("bob", "alice", "marker"))
            .await
            .unwrap();

        // FIFO dispatch: once the marker arrives the first message was handled.
        assert_eq!(recv(&mut rx).await.content, "marker");
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.stats().delivered, 1);
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let (_lifetime, broker) = running_broker();
        let (tx, mut rx) = delivery_channel(64);
        broker.register_user("bob", tx);

        for i in 0..50 {
            let msg = if i % 2 == 0 {
                Message::direct("alice", "bob", i.to_string())
            } else {
                Message::broadcast("carol", i.to_string())
            };
            broker.send_message(msg).await.unwrap();
        }

        for i in 0..50 {
            assert_eq!(recv(&mut rx).await.content, i.to_string());
        }
    }

    #[tokio::test]
    async fn test_unregister_stops_delivery() {
        let (_lifetime, broker) = running_broker();
        let (bob_tx, mut bob_rx) = delivery_channel(4);
        let (alice_tx, mut alice_rx) = delivery_channel(4);
        broker.register_user("bob", bob_tx);
        broker.register_user("alice", alice_tx);

        broker.unregister_user("bob");
        broker.unregister_user("bob");
        assert!(!broker.is_registered("bob"));

        broker
            .send_message(Message::broadcast("alice", "after"))
            .await
            .unwrap();
        assert_eq!(recv(&mut alice_rx).await.content, "after");
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reregister_replaces_channel() {
        let (_lifetime, broker) = running_broker();
        let (old_tx, mut old_rx) = delivery_channel(4);
        let (new_tx, mut new_rx) = delivery_channel(4);
        broker.register_user("bob", old_tx);
        broker.register_user("bob", new_tx);
        assert_eq!(broker.stats().registered_users, 1);

        broker
            .send_message(Message::direct("alice", "bob", "hi"))
            .await
            .unwrap();
        assert_eq!(recv(&mut new_rx).await.content, "hi");
        assert!(old_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_idle_broker_buffers_messages() {
        let lifetime = Lifetime::new();
        let broker = Broker::new(lifetime);
        assert_eq!(broker.state(), BrokerState::Idle);

        let (tx, mut rx) = delivery_channel(4);
        broker.register_user("bob", tx);
        broker
            .send_message(Message::direct("alice", "bob", "early"))
            .await
            .unwrap();
        assert_eq!(broker.stats().queued, 1);
        assert!(rx.try_recv().is_err());

        broker.run().unwrap();
        assert_eq!(broker.state(), BrokerState::Running);
        assert_eq!(recv(&mut rx).await.content, "early");
    }

    #[tokio::test]
    async fn test_run_twice_fails() {
        let (_lifetime, broker) = running_broker();
        assert_eq!(broker.run().unwrap_err(), BrokerError::AlreadyRunning);
    }

    #[tokio::test]
    async fn test_full_ingress_queue() {
        let config = BrokerConfig {
            ingress_capacity: 2,
            ..BrokerConfig::default()
        };
        let broker = Broker::with_config(Lifetime::new(), config);

        broker.try_send_message(Message::broadcast("a", "1")).unwrap();
        broker.try_send_message(Message::broadcast("a", "2")).unwrap();
        assert_eq!(
            broker.try_send_message(Message::broadcast("a", "3")),
            Err(BrokerError::QueueFull)
        );

        // A blocking send stays pending until the queue drains.
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            broker.send_message(Message::broadcast("a", "3")),
        )
        .await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_blocked_sender_released_by_dispatch() {
        let config = BrokerConfig {
            ingress_capacity: 1,
            ..BrokerConfig::default()
        };
        let broker = Arc::new(Broker::with_config(Lifetime::new(), config));
        let (tx, mut rx) = delivery_channel(8);
        broker.register_user("bob", tx);

        broker
            .send_message(Message::direct("alice", "bob", "1"))
            .await
            .unwrap();
        let sender = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move {
                broker
                    .send_message(Message::direct("alice", "bob", "2"))
                    .await
            })
        };

        broker.run().unwrap();
        assert_eq!(recv(&mut rx).await.content, "1");
        assert_eq!(recv(&mut rx).await.content, "2");
        assert_eq!(sender.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_cancellation_stops_broker() {
        let (lifetime, broker) = running_broker();
        lifetime.cancel();

        tokio::time::timeout(WAIT, broker.done()).await.unwrap();
        assert_eq!(broker.state(), BrokerState::Stopped);
        assert_eq!(
            broker.send_message(Message::broadcast("a", "late")).await,
            Err(BrokerError::Cancelled)
        );
        assert_eq!(
            broker.try_send_message(Message::broadcast("a", "late")),
            Err(BrokerError::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_cancellation_releases_blocked_sender() {
        let config = BrokerConfig {
            ingress_capacity: 1,
            ..BrokerConfig::default()
        };
        let lifetime = Lifetime::new();
        let broker = Arc::new(Broker::with_config(lifetime.clone(), config));
        broker.try_send_message(Message::broadcast("a", "1")).unwrap();

        let sender = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.send_message(Message::broadcast("a", "2")).await })
        };
        tokio::task::yield_now().await;

        lifetime.cancel();
        let result = tokio::time::timeout(WAIT, sender).await.unwrap().unwrap();
        assert_eq!(result, Err(BrokerError::Cancelled));
    }

    #[tokio::test]
    async fn test_done_resolves_after_cancel_with_queued_messages() {
        let lifetime = Lifetime::new();
        let broker = Broker::new(lifetime.clone());
        broker.try_send_message(Message::broadcast("a", "1")).unwrap();

        lifetime.cancel();
        broker.run().unwrap();
        tokio::time::timeout(WAIT, broker.done()).await.unwrap();
        assert_eq!(broker.state(), BrokerState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_producers() {
        let (_lifetime, broker) = running_broker();
        let (tx, mut rx) = delivery_channel(1024);
        broker.register_user("sink", tx);

        let producers: Vec<_> = (0..8)
            .map(|p| {
                let broker = Arc::clone(&broker);
                tokio::spawn(async move {
                    for i in 0..50 {
                        broker
                            .send_message(Message::direct(format!("p{p}"), "sink", i.to_string()))
                            .await
                            .unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.await.unwrap();
        }

        let mut last_seen = std::collections::HashMap::new();
        for _ in 0..400 {
            let msg = recv(&mut rx).await;
            let n: i64 = msg.content.parse().unwrap();
            let prev = last_seen.insert(msg.sender.clone(), n).unwrap_or(-1);
            assert!(n > prev, "per-sender order violated for {}", msg.sender);
        }
    }
}
