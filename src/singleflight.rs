//! Per-URL mutual exclusion (C3), collapsing concurrent duplicate audits.
//!
//! No direct teacher equivalent exists for this component; it composes the
//! `DashMap`-of-locks idiom the teacher uses for per-domain concurrency
//! limiting (`crawl_engine::domain_limiter`) with a per-key async mutex so a
//! second caller for the same URL waits on the first rather than racing it.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Tracks in-flight work per normalized URL. The first caller for a key is
/// told `was_first = true` and is responsible for populating the cache; a
/// caller that arrives while that work is in flight waits for the lock and
/// is told `was_first = false`, meaning it must re-check the cache before
/// doing any work of its own.
#[derive(Default)]
pub struct SingleFlight {
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

pub struct FlightGuard {
    key: String,
    was_first: bool,
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

impl FlightGuard {
    pub fn was_first(&self) -> bool {
        self.was_first
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `key`, blocking until any concurrent holder
    /// releases it. `was_first` on the returned guard tells the caller
    /// whether it is the sole owner of this unit of work (no one else was
    /// waiting when it arrived) or whether it should re-probe the cache
    /// because another caller may have just populated it.
    pub async fn acquire(&self, key: &str) -> FlightGuard {
        let was_first = !self.locks.contains_key(key);
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();

        let guard = lock.lock_owned().await;
        FlightGuard {
            key: key.to_string(),
            was_first,
            _guard: guard,
        }
    }

    /// Drops the map entry for `key` if no one else holds a reference to its
    /// lock, so the map doesn't grow unboundedly across distinct URLs.
    pub fn release(&self, key: &str) {
        if let Some(entry) = self.locks.get(key) {
            if Arc::strong_count(entry.value()) <= 1 {
                drop(entry);
                self.locks.remove(key);
            }
        }
    }

    pub fn cleanup(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn in_flight_count(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn first_caller_is_marked_first() {
        let sf = SingleFlight::new();
        let guard = sf.acquire("https://example.com/").await;
        assert!(guard.was_first());
    }

    #[tokio::test]
    async fn second_caller_waits_and_is_not_first() {
        let sf = Arc::new(SingleFlight::new());
        let order = Arc::new(AtomicU32::new(0));

        let sf1 = sf.clone();
        let order1 = order.clone();
        let first = tokio::spawn(async move {
            let guard = sf1.acquire("https://example.com/").await;
            assert!(guard.was_first());
            tokio::time::sleep(Duration::from_millis(50)).await;
            order1.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(10)).await;

        let sf2 = sf.clone();
        let second = tokio::spawn(async move {
            let guard = sf2.acquire("https://example.com/").await;
            assert!(!guard.was_first());
            order.fetch_add(10, Ordering::SeqCst);
        });

        let (r1, r2) = tokio::join!(first, second);
        r1.unwrap();
        r2.unwrap();
    }

    #[tokio::test]
    async fn release_cleans_up_when_uncontended() {
        let sf = SingleFlight::new();
        {
            let _guard = sf.acquire("https://example.com/").await;
        }
        sf.release("https://example.com/");
        assert_eq!(sf.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_block_each_other() {
        let sf = SingleFlight::new();
        let g1 = sf.acquire("https://a.example/").await;
        let g2 = sf.acquire("https://b.example/").await;
        assert!(g1.was_first());
        assert!(g2.was_first());
    }
}
