//! Contention tests: many workers sharing a small pool

mod common;

use common::MemFactory;
use leasepool::prelude::*;
use leasepool::session::SessionFactory;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WORKERS: usize = 12;
const ITERATIONS: usize = 5;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_worker_starves_under_contention() {
    let factory = MemFactory::new();
    let pool = Pool::with_factory(
        PoolConfig::default()
            .with_min_size(0)
            .with_max_size(3)
            .with_acquire_timeout(Duration::from_secs(10))
            .with_watcher(
                WatcherConfig::default()
                    .with_max_lease(Duration::ZERO)
                    .with_max_idle(Duration::ZERO),
            ),
        Arc::clone(&factory) as Arc<dyn SessionFactory>,
    );
    pool.open(true).await.unwrap();

    let mut workers = Vec::with_capacity(WORKERS);
    for worker in 0..WORKERS {
        let pool = pool.clone();
        workers.push(tokio::spawn(async move {
            let mut total_wait = Duration::ZERO;
            for iteration in 0..ITERATIONS {
                let start = Instant::now();
                let lease = pool
                    .acquire()
                    .await
                    .unwrap_or_else(|err| panic!("worker {worker} starved at {iteration}: {err}"));
                total_wait += start.elapsed();

                // Simulate statement work with a small variable hold.
                let hold = 2 + (worker * 7 + iteration * 3) % 9;
                tokio::time::sleep(Duration::from_millis(hold as u64)).await;

                assert!(pool.open_count() <= 3);
                pool.release(lease).await;
            }
            total_wait
        }));
    }

    let mut waits = Vec::with_capacity(WORKERS);
    for worker in workers {
        waits.push(worker.await.unwrap());
    }

    // Every worker completed every iteration within the acquire deadline.
    assert_eq!(waits.len(), WORKERS);
    let stats = pool.stats();
    assert_eq!(stats.acquisitions as usize, WORKERS * ITERATIONS);

    // The pool never grew past its bound, and reused sessions heavily.
    assert!(pool.open_count() >= 1 && pool.open_count() <= 3);
    assert!(factory.opened() <= 3);
    assert_eq!(pool.idle_count(), pool.open_count());

    pool.close().await;
    assert_eq!(pool.open_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fifo_wakeup_of_parked_waiters() {
    let factory = MemFactory::new();
    let pool = Pool::with_factory(
        PoolConfig::default()
            .with_min_size(0)
            .with_max_size(1)
            .with_acquire_timeout(Duration::from_secs(10))
            .with_watcher(
                WatcherConfig::default()
                    .with_max_lease(Duration::ZERO)
                    .with_max_idle(Duration::ZERO),
            ),
        factory,
    );
    pool.open(true).await.unwrap();

    let held = pool.acquire().await.unwrap();

    // Park waiters one at a time so their queue order is deterministic.
    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut waiters = Vec::new();
    for waiter in 0..4u32 {
        let pool = pool.clone();
        let done_tx = done_tx.clone();
        waiters.push(tokio::spawn(async move {
            let lease = pool.acquire().await.unwrap();
            done_tx.send(waiter).unwrap();
            // A brief hold before handing the session onward.
            tokio::time::sleep(Duration::from_millis(5)).await;
            pool.release(lease).await;
        }));
        // Let this waiter park before spawning the next.
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    drop(done_tx);

    pool.release(held).await;
    for waiter in waiters {
        waiter.await.unwrap();
    }

    let mut order = Vec::new();
    while let Some(waiter) = done_rx.recv().await {
        order.push(waiter);
    }
    // Fair semaphore: waiters are served in arrival order.
    assert_eq!(order, vec![0, 1, 2, 3]);

    pool.close().await;
}
