//! Shared-handle identity under concurrent first use.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower_mdgate::{ConnectionPool, GateError};

#[derive(Debug)]
struct Historical {
    serial: usize,
}

fn slow_pool(built: Arc<AtomicUsize>) -> ConnectionPool<Historical> {
    ConnectionPool::new(move || {
        std::thread::sleep(Duration::from_millis(25));
        Ok::<_, GateError>(Historical {
            serial: built.fetch_add(1, Ordering::SeqCst),
        })
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_tasks_share_one_handle() {
    let built = Arc::new(AtomicUsize::new(0));
    let pool = Arc::new(slow_pool(built.clone()));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let pool = pool.clone();
            tokio::task::spawn_blocking(move || pool.shared_handle().unwrap())
        })
        .collect();

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap());
    }

    assert_eq!(built.load(Ordering::SeqCst), 1);
    assert_eq!(pool.constructions(), 1);
    assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
}

#[test]
fn reset_between_bursts_builds_exactly_twice() {
    let built = Arc::new(AtomicUsize::new(0));
    let pool = Arc::new(slow_pool(built.clone()));

    let burst = |pool: &Arc<ConnectionPool<Historical>>| {
        let threads: Vec<_> = (0..6)
            .map(|_| {
                let pool = pool.clone();
                std::thread::spawn(move || pool.shared_handle().unwrap().serial)
            })
            .collect();
        threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .collect::<Vec<_>>()
    };

    let first = burst(&pool);
    pool.reset();
    let second = burst(&pool);

    assert!(first.iter().all(|s| *s == 0));
    assert!(second.iter().all(|s| *s == 1));
    assert_eq!(built.load(Ordering::SeqCst), 2);
}

#[test]
fn ephemeral_handles_do_not_touch_shared_state() {
    let built = Arc::new(AtomicUsize::new(0));
    let pool = slow_pool(built);

    let streaming = pool.ephemeral_handle().unwrap();
    assert!(!pool.is_initialized());

    let shared = pool.shared_handle().unwrap();
    assert_ne!(streaming.serial, shared.serial);
    assert_eq!(pool.constructions(), 2);
}
