use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use sluice_core::WorkerPool;

#[test]
fn results_reap_in_submission_order_under_latency_skew() -> Result<(), Box<dyn std::error::Error>>
{
    let pool = WorkerPool::new(4);

    let mut handles = Vec::new();
    for id in 0..48usize {
        handles.push(pool.submit(move |_worker| {
            // Earlier tasks sleep longer, so completion order inverts
            // submission order; reaping by index must not care.
            thread::sleep(Duration::from_millis(((48 - id) % 6) as u64));
            id * 7
        }));
    }

    for (id, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.wait(), id * 7);
    }
    Ok(())
}

#[test]
fn every_submitted_task_runs_exactly_once() -> Result<(), Box<dyn std::error::Error>> {
    let pool = WorkerPool::new(3);
    let counter = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let counter = Arc::clone(&counter);
            pool.submit(move |_worker| {
                counter.fetch_add(1, Ordering::AcqRel);
            })
        })
        .collect();
    for handle in handles {
        handle.wait();
    }

    assert_eq!(counter.load(Ordering::Acquire), 100);
    Ok(())
}

#[test]
fn tasks_see_valid_worker_indexes_and_all_workers_participate()
-> Result<(), Box<dyn std::error::Error>> {
    let worker_count = 4;
    let pool = WorkerPool::new(worker_count);
    let seen = Arc::new(Mutex::new(BTreeSet::new()));

    let handles: Vec<_> = (0..200usize)
        .map(|id| {
            let seen = Arc::clone(&seen);
            pool.submit(move |worker| {
                seen.lock().expect("seen set mutex poisoned").insert(worker);
                thread::sleep(Duration::from_millis((id % 3) as u64));
                worker
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.wait() < worker_count);
    }

    let seen = seen.lock().expect("seen set mutex poisoned");
    assert_eq!(seen.len(), worker_count);
    Ok(())
}

#[test]
fn pool_joins_cleanly_after_all_handles_are_reaped() -> Result<(), Box<dyn std::error::Error>> {
    let pool = WorkerPool::new(2);
    let handles: Vec<_> = (0..16)
        .map(|id| pool.submit(move |_worker| id * 2))
        .collect();
    let results: Vec<_> = handles.into_iter().map(|handle| handle.wait()).collect();
    drop(pool);

    assert_eq!(results, (0..16).map(|id| id * 2).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn zero_requested_workers_still_spawns_one() -> Result<(), Box<dyn std::error::Error>> {
    let pool = WorkerPool::new(0);
    assert_eq!(pool.num_workers(), 1);
    assert_eq!(pool.submit(|worker| worker).wait(), 0);
    Ok(())
}
