//! Workspace lock exclusion
//!
//! Two concurrent mutating runs against the same workspace id must never be
//! inside the build/start section at the same time.

use gantry_core::lock::WorkspaceLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ups_never_build_simultaneously() {
    let dir = TempDir::new().unwrap();
    let lock_path = dir.path().join("ws.lock");

    let in_build = Arc::new(AtomicBool::new(false));
    let overlap_seen = Arc::new(AtomicBool::new(false));
    let builds_done = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let lock_path = lock_path.clone();
        let in_build = in_build.clone();
        let overlap_seen = overlap_seen.clone();
        let builds_done = builds_done.clone();
        handles.push(tokio::spawn(async move {
            let lock = WorkspaceLock::acquire(
                lock_path,
                "ws".to_string(),
                Duration::from_secs(30),
            )
            .await
            .expect("lock must eventually be acquired");

            // Critical section standing in for BUILD.
            if in_build.swap(true, Ordering::SeqCst) {
                overlap_seen.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(Duration::from_millis(30)).await;
            in_build.store(false, Ordering::SeqCst);
            builds_done.fetch_add(1, Ordering::SeqCst);

            drop(lock);
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(builds_done.load(Ordering::SeqCst), 8);
    assert!(
        !overlap_seen.load(Ordering::SeqCst),
        "two runs entered the build section simultaneously"
    );
}

#[test]
fn reader_does_not_take_the_lock() {
    // Status checks read container state without acquiring the lock; holding
    // the lock must not block them. This is modelled by the absence of any
    // lock API on the status path; here we only assert a held lock does not
    // leave stale state behind for readers.
    let dir = TempDir::new().unwrap();
    let lock_path = dir.path().join("ws.lock");
    let lock = WorkspaceLock::try_acquire(lock_path.clone(), "ws").unwrap();
    assert!(lock_path.exists());
    drop(lock);
    assert!(!lock_path.exists());
}
