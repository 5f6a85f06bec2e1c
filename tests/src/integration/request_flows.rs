//! # Request/Reply Flows
//!
//! The reply error protocol between two brokers: success, declared
//! application errors, `PAYLOAD_VALIDATION` for bad requests and
//! `INTERNAL_ERROR` for failing handlers.

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use courier_broker::{BrokerError, MessageContext, ReplyOptions, RequestOptions, Responder};
    use serde_json::{json, Value};
    use shared_bus::{BusMessage, InMemoryBus, MessageBus};
    use shared_types::{Draft, Envelope, ErrorCode, ReplyEnvelope, ReplyError, ReplyKind};
    use tokio::time::timeout;

    use crate::integration::fixtures::{broker, WAIT};

    #[tokio::test]
    async fn test_request_across_services() {
        let bus = InMemoryBus::new();
        let server = broker(&bus, "calculator");
        let client = broker(&bus, "frontend");

        let handle = server
            .reply(
                "foo.ask",
                |ctx: MessageContext<i64>, responder: Responder<i64>| async move {
                    responder.reply_with_data(Draft::data(ctx.data() + 10)).await?;
                    anyhow::Ok(())
                },
                ReplyOptions::default(),
            )
            .await
            .unwrap();

        let reply: ReplyEnvelope<i64> = timeout(
            WAIT,
            client.request("foo.ask", Draft::data(10i64), None, RequestOptions::default()),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(reply.is_success());
        assert_eq!(reply.data(), Some(&20));
        assert_eq!(reply.base.service, "calculator");

        handle.unsubscribe().await;
    }

    #[tokio::test]
    async fn test_declared_error_reaches_requester() {
        let bus = InMemoryBus::new();
        let server = broker(&bus, "errors");

        let handle = server
            .reply(
                "foo.error",
                |_: MessageContext<Value>, responder: Responder<Value>| async move {
                    responder
                        .reply_with_error(ReplyError::new("YO").with_data("error"))
                        .await?;
                    anyhow::Ok(())
                },
                ReplyOptions::default(),
            )
            .await
            .unwrap();

        let reply: ReplyEnvelope<Value> = timeout(
            WAIT,
            server.request("foo.error", Draft::data(json!({})), None, RequestOptions::default()),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(reply.kind(), ReplyKind::Error);
        let error = reply.into_result().unwrap_err();
        assert_eq!(error.code, ErrorCode::from("YO"));
        assert_eq!(error.data, Some(json!("error")));
    }

    #[tokio::test]
    async fn test_foreign_invalid_request_is_answered_with_payload_validation() {
        let bus = InMemoryBus::new();
        let server = broker(&bus, "calculator");
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        let handle = server
            .reply(
                "foo.ask",
                move |_: MessageContext<i64>, _: Responder<i64>| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    async { anyhow::Ok(()) }
                },
                ReplyOptions::default(),
            )
            .await
            .unwrap();

        // A producer that skips outbound validation.
        let request = json!({
            "id": "req-1",
            "subject": "foo.ask",
            "date": 0,
            "service": "rogue",
            "instance": 1,
            "data": "ten",
        });
        let raw = timeout(
            WAIT,
            bus.request(
                BusMessage::new("foo.ask", serde_json::to_vec(&request).unwrap()),
                WAIT,
            ),
        )
        .await
        .unwrap()
        .unwrap();

        let reply: ReplyEnvelope<Value> = serde_json::from_slice(&raw.payload).unwrap();
        let error = reply.error().expect("validation error reply");
        assert_eq!(error.code, ErrorCode::payload_validation());
        assert!(error.data.as_ref().is_some_and(Value::is_array));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        handle.unsubscribe().await;
    }

    #[tokio::test]
    async fn test_failing_handler_is_answered_with_internal_error() {
        let bus = InMemoryBus::new();
        let server = broker(&bus, "calculator");

        let handle = server
            .reply(
                "foo.ask",
                |_: MessageContext<i64>, _: Responder<i64>| async {
                    Err::<(), _>(anyhow::anyhow!("database unavailable"))
                },
                ReplyOptions::default(),
            )
            .await
            .unwrap();

        let reply: ReplyEnvelope<i64> = timeout(
            WAIT,
            server.request("foo.ask", Draft::data(1i64), None, RequestOptions::default()),
        )
        .await
        .unwrap()
        .unwrap();
        let error = reply.error().expect("internal error reply");
        assert_eq!(error.code, ErrorCode::internal_error());
        assert_eq!(error.data, None);

        handle.unsubscribe().await;
    }

    #[tokio::test]
    async fn test_message_without_reply_destination_is_ignored() {
        let bus = InMemoryBus::new();
        let server = broker(&bus, "calculator");
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();

        let handle = server
            .reply(
                "foo.ask",
                move |ctx: MessageContext<i64>, responder: Responder<i64>| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    async move {
                        responder.reply_with_data(Draft::data(*ctx.data())).await?;
                        anyhow::Ok(())
                    }
                },
                ReplyOptions::default(),
            )
            .await
            .unwrap();

        let stray = Envelope::new(
            shared_types::BaseEnvelope::new("foo.ask", "rogue", 1u64),
            json!(5),
        );
        bus.publish(BusMessage::new("foo.ask", serde_json::to_vec(&stray).unwrap()))
            .await
            .unwrap();

        // The endpoint survives and still answers real requests, in order.
        let reply: ReplyEnvelope<i64> = timeout(
            WAIT,
            server.request("foo.ask", Draft::data(3i64), None, RequestOptions::default()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(reply.data(), Some(&3));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!handle.is_finished());

        handle.unsubscribe().await;
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let bus = InMemoryBus::new();
        let server = broker(&bus, "calculator");

        let handle = server
            .reply(
                "foo.ask",
                |_: MessageContext<i64>, _: Responder<i64>| async {
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                    anyhow::Ok(())
                },
                ReplyOptions::default(),
            )
            .await
            .unwrap();

        let err = timeout(
            WAIT,
            server.request::<i64, i64, _>(
                "foo.ask",
                Draft::data(1i64),
                None,
                RequestOptions::timeout(std::time::Duration::from_millis(50)),
            ),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, BrokerError::RoundTripTimeout { .. }));

        handle.unsubscribe().await;
    }
}
