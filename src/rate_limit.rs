//! Per-connector rate limiting.
//!
//! Every upstream call goes through [`RateLimiter::call`], which
//!
//! 1. acquires one of `max_in_flight` permits,
//! 2. waits for the next free slot on a fixed inter-call delay grid,
//! 3. runs the call under a hard timeout.
//!
//! The permit lives only as long as the call future. A call that times out is
//! dropped, which releases its permit so sibling partitions keep moving.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

use crate::error::FetchError;
use crate::models::RateLimitSpec;

pub struct RateLimiter {
    permits: Arc<Semaphore>,
    max_in_flight: usize,
    delay: Duration,
    timeout: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(spec: RateLimitSpec) -> Self {
        let max_in_flight = spec.max_in_flight.max(1);
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            delay: spec.delay,
            timeout: spec.timeout,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// Run `call` once a rate-limit token is available.
    ///
    /// Returns [`FetchError::Timeout`] if the call does not finish within the
    /// configured timeout. No retry is attempted.
    pub async fn call<F, T>(&self, call: F) -> Result<T, FetchError>
    where
        F: Future<Output = Result<T, FetchError>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| FetchError::Transport("rate limiter closed".to_string()))?;

        self.wait_turn().await;

        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    /// Calls currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.permits.available_permits()
    }

    async fn wait_turn(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let slot = (*next).max(Instant::now());
            *next = slot + self.delay;
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(delay_ms: u64, max_in_flight: usize, timeout_ms: u64) -> RateLimitSpec {
        RateLimitSpec {
            delay: Duration::from_millis(delay_ms),
            max_in_flight,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test]
    async fn spaces_consecutive_calls_by_delay() {
        let limiter = RateLimiter::new(spec(50, 1, 1_000));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.call(async { Ok::<_, FetchError>(()) }).await.unwrap();
        }
        // First call is immediate, the next two wait one delay each.
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn timeout_cancels_call_and_releases_permit() {
        let limiter = RateLimiter::new(spec(0, 1, 50));

        let result = limiter
            .call(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, FetchError>(())
            })
            .await;
        assert!(matches!(result, Err(FetchError::Timeout { ms: 50 })));
        assert_eq!(limiter.in_flight(), 0);

        let ok = limiter.call(async { Ok::<_, FetchError>(7) }).await.unwrap();
        assert_eq!(ok, 7);
    }

    #[tokio::test]
    async fn upstream_error_passes_through() {
        let limiter = RateLimiter::new(spec(0, 2, 1_000));
        let result: Result<(), _> = limiter
            .call(async {
                Err(FetchError::Status {
                    status: 503,
                    message: "unavailable".into(),
                })
            })
            .await;
        assert!(matches!(result, Err(FetchError::Status { status: 503, .. })));
    }

    #[tokio::test]
    async fn bounds_calls_in_flight() {
        let limiter = Arc::new(RateLimiter::new(spec(0, 2, 1_000)));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let limiter = limiter.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .call(async {
                        peak.fetch_max(limiter.in_flight(), std::sync::atomic::Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, FetchError>(())
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= 2);
    }
}
