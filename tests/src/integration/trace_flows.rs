//! # Trace Correlation Flows
//!
//! A producer span and every span it causes on the receiving side share one
//! trace id, whichever pattern carries the message.

#[cfg(test)]
mod tests {
    use courier_broker::{
        ConsumeOptions, MessageContext, ReplyOptions, RequestOptions, Responder, SubscribeOptions,
    };
    use courier_telemetry::{scoped_tracing, MessagingAction, SpanAttributes};
    use shared_bus::InMemoryBus;
    use shared_types::{Draft, PropagatedContext, ReplyEnvelope};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use crate::integration::fixtures::{broker, Order, WAIT};

    struct Observed {
        envelope: Option<PropagatedContext>,
        span: Option<PropagatedContext>,
    }

    fn observe<T>(ctx: &MessageContext<T>) -> Observed {
        Observed {
            envelope: ctx.envelope.base.trace_context.clone(),
            span: ctx.span.propagated(),
        }
    }

    #[tokio::test]
    async fn test_subscriber_span_joins_publisher_trace() {
        let _telemetry = scoped_tracing("trace-flows");
        let bus = InMemoryBus::new();
        let broker = broker(&bus, "orders");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = broker
            .subscribe(
                "orders.created",
                move |ctx: MessageContext<Order>| {
                    let tx = tx.clone();
                    async move {
                        tx.send(observe(&ctx))?;
                        anyhow::Ok(())
                    }
                },
                SubscribeOptions::default(),
            )
            .await
            .unwrap();

        let root = broker.tracer().start_span(
            "checkout",
            SpanAttributes::new("orders.created", MessagingAction::Publish),
            None,
        );
        let trace_id = root.propagated().expect("root span identity").trace_id;

        broker
            .publish("orders.created", Draft::data(Order { id: 1, amount: 3 }), Some(&root))
            .await
            .unwrap();
        root.finish();

        let observed = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        let carried = observed.envelope.expect("envelope trace context");
        let receiving = observed.span.expect("receiving span identity");
        assert_eq!(carried.trace_id, trace_id);
        assert_eq!(receiving.trace_id, trace_id);
        assert_ne!(receiving.span_id, carried.span_id);

        handle.unsubscribe().await;
    }

    #[tokio::test]
    async fn test_reply_and_consume_spans_join_producer_trace() {
        let _telemetry = scoped_tracing("trace-flows");
        let bus = InMemoryBus::new();
        let broker = broker(&bus, "settlement");
        let (tx, mut rx) = mpsc::unbounded_channel();

        let replies = tx.clone();
        let handle = broker
            .reply(
                "foo.ask",
                move |ctx: MessageContext<i64>, responder: Responder<i64>| {
                    let tx = replies.clone();
                    async move {
                        tx.send(observe(&ctx))?;
                        responder.reply_with_data(Draft::data(*ctx.data())).await?;
                        anyhow::Ok(())
                    }
                },
                ReplyOptions::default(),
            )
            .await
            .unwrap();
        broker
            .consume(
                "orders.settle",
                move |ctx: MessageContext<Order>| {
                    let tx = tx.clone();
                    async move {
                        tx.send(observe(&ctx))?;
                        anyhow::Ok(())
                    }
                },
                ConsumeOptions::default(),
            )
            .await
            .unwrap();

        let root = broker.tracer().start_span(
            "settle",
            SpanAttributes::new("orders.settle", MessagingAction::Dispatch),
            None,
        );
        let trace_id = root.propagated().expect("root span identity").trace_id;

        let reply: ReplyEnvelope<i64> = timeout(
            WAIT,
            broker.request("foo.ask", Draft::data(1i64), Some(&root), RequestOptions::default()),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(reply.is_success());
        broker
            .dispatch("orders.settle", Draft::data(Order { id: 2, amount: 4 }), Some(&root))
            .await
            .unwrap();
        root.finish();

        for _ in 0..2 {
            let observed = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            assert_eq!(observed.envelope.expect("envelope trace context").trace_id, trace_id);
            assert_eq!(observed.span.expect("receiving span identity").trace_id, trace_id);
        }

        broker.stop().await;
        handle.unsubscribe().await;
    }
}
