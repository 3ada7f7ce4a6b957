//! Global concurrency limiter (C7): a semaphore bounding how many audits run
//! at once, with a non-blocking and a blocking acquisition interface.
//!
//! Grounded on the concurrency manager's dual `try_acquire`/`acquire_async`
//! shape and its composited `get_stats()` (active + queued counts), and on
//! the teacher's general `tokio::sync::Semaphore` usage for bounding
//! concurrent work (`crawl_engine::domain_limiter`).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct LimiterStats {
    pub active: usize,
    pub capacity: usize,
    pub available: usize,
}

/// A single RAII permit. Releasing happens on drop, so a panicking or
/// cancelled task can never leak a slot.
pub struct AuditPermit {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for AuditPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounds the number of audits running concurrently across the whole
/// process. The queue (C4) is what absorbs excess demand; this limiter only
/// decides when a queued job may actually start running.
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    active: Arc<AtomicUsize>,
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Non-blocking: returns `None` immediately if no slot is free, rather
    /// than waiting.
    pub fn try_acquire(&self) -> Option<AuditPermit> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        self.active.fetch_add(1, Ordering::SeqCst);
        Some(AuditPermit {
            _permit: permit,
            active: self.active.clone(),
        })
    }

    /// Blocking: waits until a slot frees up.
    pub async fn acquire(&self) -> AuditPermit {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("limiter semaphore is never closed");
        self.active.fetch_add(1, Ordering::SeqCst);
        AuditPermit {
            _permit: permit,
            active: self.active.clone(),
        }
    }

    pub fn stats(&self) -> LimiterStats {
        let active = self.active.load(Ordering::SeqCst);
        LimiterStats {
            active,
            capacity: self.capacity,
            available: self.capacity.saturating_sub(active),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn try_acquire_fails_once_capacity_is_exhausted() {
        let limiter = ConcurrencyLimiter::new(2);
        let p1 = limiter.try_acquire().expect("slot 1");
        let p2 = limiter.try_acquire().expect("slot 2");
        assert!(limiter.try_acquire().is_none());
        assert_eq!(limiter.stats().active, 2);
        drop(p1);
        assert_eq!(limiter.stats().active, 1);
        drop(p2);
    }

    #[tokio::test]
    async fn acquire_waits_for_a_released_slot() {
        let limiter = Arc::new(ConcurrencyLimiter::new(1));
        let permit = limiter.try_acquire().expect("slot");

        let waiter_limiter = limiter.clone();
        let waiter = tokio::spawn(async move {
            let _permit = waiter_limiter.acquire().await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        waiter.await.expect("waiter completes once the slot frees");
    }

    #[test]
    fn stats_report_capacity_and_availability() {
        let limiter = ConcurrencyLimiter::new(5);
        let stats = limiter.stats();
        assert_eq!(stats.capacity, 5);
        assert_eq!(stats.available, 5);
        assert_eq!(stats.active, 0);
    }
}
