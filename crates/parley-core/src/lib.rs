//! # parley-core
//!
//! In-process chat message broker and user directory for Parley.
//!
//! This crate provides the building blocks:
//!
//! - **Directory** - Validated, thread-safe set of users
//! - **Broker** - Routes messages to one user or to everyone
//! - **Registry** - Per-user delivery channels behind one locking discipline
//! - **Lifetime** - Cancellation signal shared by the directory and broker
//! - **Message** - The chat message itself
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  send   ┌─────────────┐  try_send  ┌──────────────────┐
//! │  Producers  │────────▶│   Broker    │───────────▶│ Delivery channel │
//! └─────────────┘ ingress └─────────────┘  registry  └──────────────────┘
//!                                │                      (one per user)
//!                                ▼
//!                         ┌─────────────┐
//!                         │  Lifetime   │
//!                         └─────────────┘
//! ```
//!
//! Delivery is best-effort. A message for an unregistered user, or for a
//! user whose delivery channel is full, is dropped and the sender is not
//! told.
//!
//! ## Example
//!
//! ```rust
//! use parley_core::{Broker, Lifetime, Message};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let lifetime = Lifetime::new();
//! let broker = Broker::new(lifetime.clone());
//! broker.run().unwrap();
//!
//! let (tx, mut rx) = broker.delivery_channel();
//! broker.register_user("bob", tx);
//! broker.send_message(Message::direct("alice", "bob", "hi")).await.unwrap();
//! assert_eq!(rx.recv().await.unwrap().content, "hi");
//!
//! lifetime.cancel();
//! broker.done().await;
//! # }
//! ```

pub mod broker;
pub mod lifetime;
pub mod message;
pub mod registry;
pub mod user;

pub use broker::{Broker, BrokerConfig, BrokerError, BrokerState, BrokerStats};
pub use lifetime::Lifetime;
pub use message::{delivery_channel, DeliveryReceiver, DeliverySender, Message, UserId};
pub use registry::{Delivery, Registry};
pub use user::{Directory, User, UserError};
