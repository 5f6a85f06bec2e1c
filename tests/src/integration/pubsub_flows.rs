//! # Publish/Subscribe Flows
//!
//! Round-trip fidelity, outbound rejection, lax validation and load sharing
//! between instances of one service.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use courier_broker::{BrokerError, BrokerOptions, MessageContext, SubscribeOptions};
    use serde_json::{json, Value};
    use shared_bus::InMemoryBus;
    use shared_types::Draft;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use crate::integration::fixtures::{broker, broker_with, options, Order, WAIT};

    #[tokio::test]
    async fn test_typed_payload_round_trip() {
        let bus = InMemoryBus::new();
        let broker = broker(&bus, "orders");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = broker
            .subscribe(
                "orders.created",
                move |ctx: MessageContext<Order>| {
                    let tx = tx.clone();
                    async move {
                        tx.send((ctx.envelope.base.service.clone(), ctx.into_data()))?;
                        anyhow::Ok(())
                    }
                },
                SubscribeOptions::default(),
            )
            .await
            .unwrap();

        let order = Order { id: 7, amount: 1250 };
        timeout(WAIT, broker.publish("orders.created", Draft::data(order.clone()), None))
            .await
            .unwrap()
            .unwrap();

        let (service, received) = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(service, "orders");
        assert_eq!(received, order);

        handle.unsubscribe().await;
    }

    #[tokio::test]
    async fn test_invalid_outbound_rejected_on_every_pattern() {
        let bus = InMemoryBus::new();
        let broker = broker(&bus, "strict");

        let published = broker
            .publish("foo.bar", Draft::data(json!("ten")), None)
            .await
            .unwrap_err();
        assert!(matches!(published, BrokerError::SchemaValidation(_)));

        let dispatched = broker
            .dispatch("orders.settle", Draft::data(json!({ "id": "seven" })), None)
            .await
            .unwrap_err();
        assert!(matches!(dispatched, BrokerError::SchemaValidation(_)));

        let requested = broker
            .request::<Value, Value, _>(
                "foo.ask",
                Draft::data(json!("ten")),
                None,
                Default::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(requested, BrokerError::SchemaValidation(_)));

        assert_eq!(bus.messages_published(), 0);
        assert_eq!(bus.stream_len(), 0);
    }

    #[tokio::test]
    async fn test_disabled_validation_still_delivers() {
        let bus = InMemoryBus::new();
        let broker = broker_with(
            &bus,
            BrokerOptions {
                schema_validation: false,
                ..options("lax")
            },
        );
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = broker
            .subscribe(
                "foo.bar",
                move |ctx: MessageContext<Value>| {
                    let tx = tx.clone();
                    async move {
                        tx.send(ctx.into_data())?;
                        anyhow::Ok(())
                    }
                },
                SubscribeOptions::default(),
            )
            .await
            .unwrap();

        broker
            .publish("foo.bar", Draft::data(json!("ten")), None)
            .await
            .unwrap();
        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some(json!("ten")));

        handle.unsubscribe().await;
    }

    #[tokio::test]
    async fn test_instances_of_one_service_share_messages() {
        let bus = InMemoryBus::new();
        let first = broker_with(&bus, BrokerOptions { id: "a".into(), ..options("billing") });
        let second = broker_with(&bus, BrokerOptions { id: "b".into(), ..options("billing") });
        let audit = broker(&bus, "audit");

        let billing_calls = Arc::new(AtomicUsize::new(0));
        let audit_calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for instance in [&first, &second] {
            let calls = billing_calls.clone();
            handles.push(
                instance
                    .subscribe(
                        "foo.bar",
                        move |_: MessageContext<i64>| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            async { anyhow::Ok(()) }
                        },
                        SubscribeOptions::default(),
                    )
                    .await
                    .unwrap(),
            );
        }
        let calls = audit_calls.clone();
        handles.push(
            audit
                .subscribe(
                    "foo.bar",
                    move |_: MessageContext<i64>| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        async { anyhow::Ok(()) }
                    },
                    SubscribeOptions::default(),
                )
                .await
                .unwrap(),
        );

        for n in 0..6i64 {
            audit.publish("foo.bar", Draft::data(n), None).await.unwrap();
        }

        timeout(WAIT, async {
            while billing_calls.load(Ordering::SeqCst) < 6
                || audit_calls.load(Ordering::SeqCst) < 6
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(billing_calls.load(Ordering::SeqCst), 6);
        assert_eq!(audit_calls.load(Ordering::SeqCst), 6);

        for handle in handles {
            handle.unsubscribe().await;
        }
    }
}
