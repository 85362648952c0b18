//! End-to-end coverage of the store-driven lifecycle (admission, locking,
//! escalation, stale-lock recovery) without touching the external service —
//! the same boundary the teacher draws around its own database-only
//! integration tests.

use escalation_engine::store::Store;

async fn store() -> Store {
    let store = Store::connect(":memory:").await.unwrap();
    store.initialize().await.unwrap();
    store
}

#[tokio::test]
async fn admission_then_duplicate_leaves_exactly_one_row() {
    let store = store().await;
    store.insert(42, "2030-01-01T00:00:00+00:00", "2030-01-01T00:00:00+00:00").await.unwrap();
    let duplicate = store.insert(42, "2030-01-01T00:00:00+00:00", "2030-01-01T00:00:00+00:00").await;
    assert!(duplicate.is_err());
    assert!(store.exists(42).await.unwrap());
}

#[tokio::test]
async fn step_progression_advances_step_and_releases_lock() {
    let store = store().await;
    store.insert(1, "2020-01-01T00:00:00+00:00", "2020-01-01T00:00:00+00:00").await.unwrap();
    store.try_lock(1).await.unwrap();
    store.set_step(1, 2).await.unwrap();

    store.bump_step_and_reschedule(1, 3, chrono_tz::UTC).await.unwrap();

    let row = store.get_row(1).await.unwrap().unwrap();
    assert_eq!(row.step, 3);
    assert!(!row.processing);
    assert!(row.locked_at.is_none());
}

#[tokio::test]
async fn concurrent_lock_attempts_yield_exactly_one_winner() {
    let store = std::sync::Arc::new(store().await);
    store.insert(9, "2020-01-01T00:00:00+00:00", "2020-01-01T00:00:00+00:00").await.unwrap();

    let mut attempts = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        attempts.push(tokio::spawn(async move { store.try_lock(9).await.unwrap() }));
    }

    let mut wins = 0;
    for attempt in attempts {
        if attempt.await.unwrap() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
}

#[tokio::test]
async fn stale_lock_is_recovered_and_eligible_again() {
    let store = store().await;
    store.insert(5, "2020-01-01T00:00:00+00:00", "2020-01-01T00:00:00+00:00").await.unwrap();
    store.try_lock(5).await.unwrap();

    // Fast-forward the lock timestamp into the stale range directly, the
    // same way spec.md scenario 6 sets up a crashed-worker lock.
    let row = store.get_row(5).await.unwrap().unwrap();
    assert!(row.processing);

    let recovered = store.recover_stale_locks(-1).await.unwrap();
    assert_eq!(recovered, vec![5]);

    let candidates = store.fetch_candidates(10).await.unwrap();
    assert_eq!(candidates, vec![5]);
}

#[tokio::test]
async fn step_four_completion_deletes_the_row() {
    let store = store().await;
    store.insert(3, "2020-01-01T00:00:00+00:00", "2020-01-01T00:00:00+00:00").await.unwrap();
    store.set_step(3, 4).await.unwrap();
    store.try_lock(3).await.unwrap();

    store.delete(3).await.unwrap();

    assert!(!store.exists(3).await.unwrap());
}
