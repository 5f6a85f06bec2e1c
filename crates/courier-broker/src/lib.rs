//! # Courier Broker
//!
//! Typed messaging over an injected [`MessageBus`](shared_bus::MessageBus).
//! Every message is wrapped in an envelope, validated against the schema
//! registered for its subject on both sides of the bus, and correlated with
//! a span so a publish and its receipts land in one trace.
//!
//! ## Architecture
//!
//! ```text
//!                      ┌──────────────────────────────┐
//!                      │            Broker            │
//!                      └──┬────────────┬───────────┬──┘
//!                         │            │           │
//!             ┌───────────▼──┐ ┌───────▼──────┐ ┌──▼──────────────┐
//!             │ PubSubManager│ │RequestReply- │ │ ConsumerManager │
//!             │              │ │   Manager    │ │  (pull, durable)│
//!             └───────────┬──┘ └───────┬──────┘ └──┬──────────────┘
//!                         └────────────┼───────────┘
//!                               ┌──────▼──────┐
//!                               │ ManagerBase │  envelope, validation,
//!                               └──────┬──────┘  codec, span per message
//!                                      │
//!                              Arc<dyn MessageBus>
//! ```
//!
//! ## Patterns
//!
//! | Pattern | Produce | Receive | Failure on receive |
//! |---------|---------|---------|--------------------|
//! | publish/subscribe | `publish` | `subscribe` | dropped, loop continues |
//! | request/reply | `request` | `reply` | `PAYLOAD_VALIDATION` / `INTERNAL_ERROR` reply |
//! | durable stream | `dispatch` | `consume` | `term` / `nak` |

#![allow(clippy::missing_const_for_fn)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod base;
pub mod broker;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod error;
pub mod handler;
pub mod pubsub;
pub mod request_reply;

pub use base::{Direction, ManagerBase};
pub use broker::{Broker, BrokerBuilder};
pub use codec::{Codec, CodecError, FnCodec, JsonCodec};
pub use config::{BrokerConfig, BrokerOptions, ConfigError, ConsumerDefaults};
pub use consumer::{durable_name, ConsumeOptions, ConsumerManager, PollController, PollState};
pub use error::{BrokerError, BrokerResult};
pub use handler::{Delivery, MessageContext, MessageHandler, ReplyHandler};
pub use pubsub::{PubSubManager, SubscribeOptions, SubscriptionHandle};
pub use request_reply::{
    ReplyOptions, RequestOptions, RequestReplyManager, RequestState, Responder,
};
