//! # Integration Flows
//!
//! Every flow runs a [`Broker`](courier_broker::Broker) over an
//! [`InMemoryBus`](shared_bus::InMemoryBus). All awaits are guarded by
//! `tokio::time::timeout`.

pub mod fixtures;

mod consumer_flows;
mod pubsub_flows;
mod request_flows;
mod trace_flows;
