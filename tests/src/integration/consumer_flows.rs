//! # Durable Consumer Flows
//!
//! Stream retention across consumer restarts, load sharing through one
//! durable name and settlement of failed work.

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use courier_broker::{durable_name, ConsumeOptions, MessageContext, MessageHandler, PollState};
    use shared_bus::InMemoryBus;
    use shared_types::Draft;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use crate::integration::fixtures::{broker, Order, WAIT};

    fn forward(tx: mpsc::UnboundedSender<u64>) -> impl MessageHandler<Order> {
        move |ctx: MessageContext<Order>| {
            let tx = tx.clone();
            async move {
                tx.send(ctx.data().id)?;
                anyhow::Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_work_dispatched_while_offline_is_consumed_later() {
        let bus = InMemoryBus::new();
        let producer = broker(&bus, "checkout");
        for id in 1..=3u64 {
            let ack = producer
                .dispatch("orders.settle", Draft::data(Order { id, amount: 10 }), None)
                .await
                .unwrap();
            assert_eq!(ack.sequence, id);
        }

        let worker = broker(&bus, "settlement");
        let (tx, mut rx) = mpsc::unbounded_channel();
        let durable = worker
            .consume::<Order, _>("orders.settle", forward(tx), ConsumeOptions::default())
            .await
            .unwrap();
        assert_eq!(durable, durable_name("settlement", "orders.settle"));

        for id in 1..=3u64 {
            assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some(id));
        }

        timeout(WAIT, worker.stop()).await.unwrap();
        assert_eq!(bus.pending_count(&durable), 0);
    }

    #[tokio::test]
    async fn test_instances_share_one_durable_cursor() {
        let bus = InMemoryBus::new();
        let first = broker(&bus, "settlement");
        let second = broker(&bus, "settlement");
        let (tx, mut rx) = mpsc::unbounded_channel();

        first
            .consume::<Order, _>(
                "orders.settle",
                forward(tx.clone()),
                ConsumeOptions::default().batch(2),
            )
            .await
            .unwrap();
        second
            .consume::<Order, _>("orders.settle", forward(tx), ConsumeOptions::default().batch(2))
            .await
            .unwrap();

        for id in 1..=10u64 {
            first
                .dispatch("orders.settle", Draft::data(Order { id, amount: 1 }), None)
                .await
                .unwrap();
        }

        let mut seen = BTreeSet::new();
        for _ in 0..10 {
            seen.insert(timeout(WAIT, rx.recv()).await.unwrap().unwrap());
        }
        assert_eq!(seen, (1..=10).collect());

        // Nothing is delivered twice once everything is acknowledged.
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());

        first.stop().await;
        second.stop().await;
    }

    #[tokio::test]
    async fn test_failed_work_is_retried_until_it_succeeds() {
        let bus = InMemoryBus::new();
        let worker = broker(&bus, "settlement");
        let (tx, mut rx) = mpsc::unbounded_channel();

        worker
            .consume(
                "orders.settle",
                move |ctx: MessageContext<Order>| {
                    let tx = tx.clone();
                    async move {
                        let attempt = ctx.delivery.map_or(0, |d| d.delivered);
                        tx.send(attempt)?;
                        anyhow::ensure!(attempt >= 3, "attempt {attempt} failed");
                        anyhow::Ok(())
                    }
                },
                ConsumeOptions::default(),
            )
            .await
            .unwrap();

        worker
            .dispatch("orders.settle", Draft::data(Order { id: 1, amount: 5 }), None)
            .await
            .unwrap();

        for attempt in 1..=3u32 {
            assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some(attempt));
        }
        worker.stop().await;
        assert_eq!(bus.pending_count("dsettlement-orders.settle"), 0);
    }

    #[tokio::test]
    async fn test_stop_ends_polling() {
        let bus = InMemoryBus::new();
        let worker = broker(&bus, "settlement");
        let (tx, _rx) = mpsc::unbounded_channel();

        worker
            .consume::<Order, _>("orders.settle", forward(tx), ConsumeOptions::default())
            .await
            .unwrap();
        assert!(worker.consumers().poll_state("orders.settle").is_some());

        timeout(WAIT, worker.stop()).await.unwrap();
        assert_eq!(worker.consumers().poll_state("orders.settle"), None::<PollState>);
        assert_eq!(bus.open_pulls("dsettlement-orders.settle"), 0);
    }
}
