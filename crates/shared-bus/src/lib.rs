//! # Shared Bus - Message Bus Boundary
//!
//! The broker talks to its transport only through the `MessageBus` trait
//! defined here. `InMemoryBus` is the in-process implementation used by tests
//! and single-node deployments.
//!
//! ## Interaction Surface
//!
//! ```text
//! ┌──────────────┐   publish / request    ┌──────────────┐
//! │   Producer   │ ─────────────────────→ │              │
//! └──────────────┘                        │  MessageBus  │
//!                                         │              │
//! ┌──────────────┐   subscribe(queue)     │  core subj.  │
//! │  Subscriber  │ ←───────────────────── │  + inboxes   │
//! └──────────────┘                        │              │
//!                                         │  stream log  │
//! ┌──────────────┐   pull{batch,expires}  │  + durables  │
//! │   Consumer   │ ←────────────────────→ │              │
//! └──────────────┘   ack / nak / term     └──────────────┘
//! ```
//!
//! ## Delivery
//!
//! - Core subjects are best effort: no subscriber, no delivery.
//! - Queue groups: each message reaches one member of each group.
//! - Stream messages stay retained; a durable consumer redelivers anything
//!   not acknowledged within its ack wait.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod bus;
pub mod memory;
pub mod message;
pub mod stream;
pub mod subscriber;

// Re-export main types
pub use bus::{BusError, ConsumerOptions, DeliverPolicy, MessageBus, PublishAck};
pub use memory::InMemoryBus;
pub use message::{is_valid_pattern, is_valid_subject, subject_matches, BusMessage, Headers};
pub use stream::{AckKind, Acker, PullEvent, PullRequest, PullSubscription, StreamMessage};
pub use subscriber::Subscription;

/// Subject prefix of private request inboxes.
pub const INBOX_PREFIX: &str = "_INBOX";

/// Name reported in stream publish acknowledgements.
pub const DEFAULT_STREAM: &str = "COURIER";
