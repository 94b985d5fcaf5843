#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use claims::{assert_none, assert_some};
use docq::bson::oid::ObjectId;
use docq::bson::{Bson, DateTime, bson, doc};
use docq::schema::{ItemState, QueueItem};
use docq::{Processor, Queue, QueueOptions, Runner, Store, StoreOptions};
use testcontainers::ContainerAsync;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::mongo::Mongo;
use tokio::sync::Barrier;

/// Test utilities and common setup
mod test_utils {
    use super::*;

    /// Start a MongoDB container and connect a store to it.
    pub(super) async fn setup_test_store() -> anyhow::Result<(Store, ContainerAsync<Mongo>)> {
        let container = Mongo::default().start().await?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(27017).await?;
        let connection_string = format!("mongodb://{host}:{port}/docq_test");

        let store = Store::connect(&connection_string, StoreOptions::default()).await?;

        Ok((store, container))
    }

    /// Create a test runner with common configuration.
    pub(super) fn create_test_runner<P: Processor>(
        queue: Queue,
        processor: P,
        context: P::Context,
    ) -> Runner<P> {
        Runner::new(queue, processor, context)
            .num_workers(2)
            .poll_interval(Duration::from_millis(50))
            .jitter(Duration::ZERO)
            .shutdown_when_queue_empty()
    }
}

async fn find_item(store: &Store, id: ObjectId) -> anyhow::Result<QueueItem> {
    let item = store
        .database()
        .collection::<QueueItem>("queue")
        .find_one(doc! { "_id": id })
        .await?
        .expect("item should exist");
    Ok(item)
}

#[tokio::test]
async fn items_are_locked_while_processing() -> anyhow::Result<()> {
    #[derive(Clone)]
    struct TestContext {
        item_started_barrier: Arc<Barrier>,
        assertions_finished_barrier: Arc<Barrier>,
    }

    struct BlockingProcessor;

    impl Processor for BlockingProcessor {
        type Context = TestContext;

        async fn process(&self, _message: Bson, ctx: TestContext) -> anyhow::Result<()> {
            ctx.item_started_barrier.wait().await;
            ctx.assertions_finished_barrier.wait().await;
            Ok(())
        }
    }

    let test_context = TestContext {
        item_started_barrier: Arc::new(Barrier::new(2)),
        assertions_finished_barrier: Arc::new(Barrier::new(2)),
    };

    let (store, _container) = test_utils::setup_test_store().await?;
    let queue = Queue::bind(&store, QueueOptions::default()).await?;

    let stored = queue.enqueue(bson!("blocking")).await?;

    let runner = test_utils::create_test_runner(queue, BlockingProcessor, test_context.clone());
    let handle = runner.start();

    test_context.item_started_barrier.wait().await;

    let in_flight = find_item(&store, stored.id).await?;
    assert_eq!(in_flight.state(), ItemState::Locked);
    assert_some!(in_flight.locked_at);

    test_context.assertions_finished_barrier.wait().await;
    handle.wait_for_shutdown().await;

    let finished = find_item(&store, stored.id).await?;
    assert_eq!(finished.state(), ItemState::Complete);
    assert_some!(finished.completed_at);

    Ok(())
}

#[tokio::test]
async fn successful_items_are_completed() -> anyhow::Result<()> {
    struct CountingProcessor;

    impl Processor for CountingProcessor {
        type Context = Arc<AtomicU32>;

        async fn process(&self, _message: Bson, ctx: Self::Context) -> anyhow::Result<()> {
            ctx.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let (store, _container) = test_utils::setup_test_store().await?;
    let queue = Queue::bind(&store, QueueOptions::default()).await?;

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(queue.enqueue(bson!(format!("item-{i}"))).await?.id);
    }

    let processed = Arc::new(AtomicU32::new(0));
    let runner =
        test_utils::create_test_runner(queue.clone(), CountingProcessor, processed.clone());
    runner.start().wait_for_shutdown().await;

    assert_eq!(processed.load(Ordering::SeqCst), 5);
    for id in ids {
        assert_eq!(find_item(&store, id).await?.state(), ItemState::Complete);
    }
    assert_none!(queue.claim().await?);

    Ok(())
}

#[tokio::test]
async fn erroring_processors_consume_a_retry() -> anyhow::Result<()> {
    struct FlakyProcessor;

    impl Processor for FlakyProcessor {
        type Context = Arc<AtomicU32>;

        async fn process(&self, _message: Bson, ctx: Self::Context) -> anyhow::Result<()> {
            if ctx.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("first attempt fails");
            }
            Ok(())
        }
    }

    let (store, _container) = test_utils::setup_test_store().await?;
    let queue = Queue::bind(&store, QueueOptions::default()).await?;

    let stored = queue.enqueue(bson!("flaky")).await?;

    let attempts = Arc::new(AtomicU32::new(0));
    let runner = Runner::new(queue, FlakyProcessor, attempts.clone())
        .poll_interval(Duration::from_millis(50))
        .jitter(Duration::ZERO)
        .shutdown_when_queue_empty();
    runner.start().wait_for_shutdown().await;

    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    let finished = find_item(&store, stored.id).await?;
    assert_eq!(finished.state(), ItemState::Complete);
    assert_eq!(finished.retries, 1);

    Ok(())
}

#[tokio::test]
async fn panicking_processors_dead_letter_the_item() -> anyhow::Result<()> {
    struct PanickingProcessor;

    impl Processor for PanickingProcessor {
        type Context = ();

        async fn process(&self, _message: Bson, _ctx: Self::Context) -> anyhow::Result<()> {
            panic!("processing always explodes");
        }
    }

    let (store, _container) = test_utils::setup_test_store().await?;
    let queue = Queue::bind(&store, QueueOptions::default().max_retries(2)).await?;

    let stored = queue.enqueue(bson!("poison")).await?;

    let runner = Runner::new(queue.clone(), PanickingProcessor, ())
        .poll_interval(Duration::from_millis(50))
        .jitter(Duration::ZERO)
        .shutdown_when_queue_empty();
    runner.start().wait_for_shutdown().await;

    let dead = find_item(&store, stored.id).await?;
    assert_eq!(dead.state(), ItemState::Dead);
    assert_eq!(dead.retries, 2);
    assert_none!(queue.claim().await?);

    Ok(())
}

#[tokio::test]
async fn maintenance_reclaims_abandoned_leases() -> anyhow::Result<()> {
    struct CountingProcessor;

    impl Processor for CountingProcessor {
        type Context = Arc<AtomicU32>;

        async fn process(&self, _message: Bson, ctx: Self::Context) -> anyhow::Result<()> {
            ctx.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let (store, _container) = test_utils::setup_test_store().await?;
    let queue = Queue::bind(&store, QueueOptions::default()).await?;

    // Simulate a worker that claimed an item and died: the item is locked
    // with a lease taken far in the past.
    let stored = queue.enqueue(bson!("abandoned")).await?;
    let claimed = assert_some!(queue.claim().await?);
    let past = DateTime::from_millis(DateTime::now().timestamp_millis() - 120_000);
    store
        .database()
        .collection::<QueueItem>("queue")
        .update_one(doc! { "_id": claimed.id }, doc! { "$set": { "locked_at": past } })
        .await?;

    let processed = Arc::new(AtomicU32::new(0));
    let runner = Runner::new(queue, CountingProcessor, processed.clone())
        .poll_interval(Duration::from_millis(50))
        .jitter(Duration::ZERO)
        .reclaim_interval(Duration::from_millis(100));
    let _handle = runner.start();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while processed.load(Ordering::SeqCst) == 0 {
        assert!(tokio::time::Instant::now() < deadline, "lease was never reclaimed");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let finished = find_item(&store, stored.id).await?;
    assert_eq!(finished.state(), ItemState::Complete);

    Ok(())
}
