//! # Courier Benchmarks
//!
//! Per-message overhead added on top of the bus:
//!
//! | Stage | Work |
//! |-------|------|
//! | codec | JSON encode / decode of a complete envelope |
//! | validation | base envelope schema plus typed payload schema |
//! | publish | validate + encode + in-memory bus hand-off |

use std::sync::Arc;
use std::time::Duration;

use courier_broker::{Broker, BrokerOptions, Codec, JsonCodec};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use serde::{Deserialize, Serialize};
use shared_bus::InMemoryBus;
use shared_types::{
    schema, BaseEnvelope, Draft, Envelope, EnvelopeSchema, SchemaRegistry, Validator,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    id: u64,
    amount: i64,
    lines: Vec<String>,
}

fn envelope(lines: usize) -> serde_json::Value {
    let mut rng = rand::thread_rng();
    let order = Order {
        id: rng.gen(),
        amount: rng.gen_range(1..100_000),
        lines: (0..lines).map(|i| format!("sku-{i}")).collect(),
    };
    let envelope = Envelope::new(BaseEnvelope::new("orders.created", "bench", 1u64), order);
    serde_json::to_value(envelope).expect("serializable order")
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let codec = JsonCodec;

    for lines in [1, 16, 256] {
        let value = envelope(lines);
        let bytes = codec.encode(&value).expect("encodable");
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", lines), &value, |b, value| {
            b.iter(|| black_box(codec.encode(value)))
        });
        group.bench_with_input(BenchmarkId::new("decode", lines), &bytes, |b, bytes| {
            b.iter(|| black_box(codec.decode(bytes)))
        });
    }
    group.finish();
}

fn bench_validation(c: &mut Criterion) {
    let mut group = c.benchmark_group("validation");
    let validator = Validator::enforcing();
    let payload = schema::typed::<Order>();

    for lines in [1, 16, 256] {
        let value = envelope(lines);
        group.bench_with_input(BenchmarkId::new("envelope_and_payload", lines), &value, |b, value| {
            b.iter(|| black_box(validator.validate(value, &EnvelopeSchema, Some(payload.as_ref()))))
        });
    }
    group.finish();
}

fn bench_publish(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let broker = Broker::builder(Arc::new(InMemoryBus::new()))
        .options(BrokerOptions {
            name: "bench".into(),
            ..Default::default()
        })
        .publish_subscribe(
            SchemaRegistry::builder()
                .subject("orders.created", schema::typed::<Order>())
                .build(),
        )
        .build()
        .expect("valid options");

    let mut group = c.benchmark_group("publish");
    group.measurement_time(Duration::from_secs(5));
    group.throughput(Throughput::Elements(1));
    group.bench_function("no_subscribers", |b| {
        b.to_async(&runtime).iter(|| async {
            let order = Order {
                id: 1,
                amount: 10,
                lines: vec!["sku-1".into()],
            };
            black_box(broker.publish("orders.created", Draft::data(order), None).await)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_codec, bench_validation, bench_publish);
criterion_main!(benches);
