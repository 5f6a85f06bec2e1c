//! Shared registries and broker setup for integration flows.

use std::sync::Arc;
use std::time::Duration;

use courier_broker::{Broker, BrokerOptions};
use serde::{Deserialize, Serialize};
use shared_bus::InMemoryBus;
use shared_types::schema;
use shared_types::{RequestReplyDefinition, RequestReplyRegistry, SchemaRegistry};

/// Guard applied to every await in the flows.
pub const WAIT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub amount: i64,
}

pub fn events() -> SchemaRegistry {
    SchemaRegistry::builder()
        .subject("orders.created", schema::typed::<Order>())
        .subject("foo.bar", schema::typed::<i64>())
        .build()
}

pub fn endpoints() -> RequestReplyRegistry {
    RequestReplyRegistry::builder()
        .subject(
            "foo.ask",
            RequestReplyDefinition::new(schema::typed::<i64>(), schema::typed::<i64>()),
        )
        .subject(
            "foo.error",
            RequestReplyDefinition::new(schema::any(), schema::any())
                .error("YO", schema::typed::<String>()),
        )
        .build()
}

pub fn jobs() -> SchemaRegistry {
    SchemaRegistry::builder()
        .subject("orders.settle", schema::typed::<Order>())
        .build()
}

pub fn options(name: &str) -> BrokerOptions {
    let mut options = BrokerOptions {
        name: name.to_string(),
        id: format!("{name}-1"),
        request_timeout_ms: 500,
        ..Default::default()
    };
    options.consumer.expires_ms = 50;
    options
}

/// A broker named `name` on `bus` with every pattern configured.
pub fn broker(bus: &InMemoryBus, name: &str) -> Broker {
    broker_with(bus, options(name))
}

pub fn broker_with(bus: &InMemoryBus, options: BrokerOptions) -> Broker {
    Broker::builder(Arc::new(bus.clone()))
        .options(options)
        .publish_subscribe(events())
        .request_reply(endpoints())
        .consumer(jobs())
        .build()
        .expect("valid broker options")
}
