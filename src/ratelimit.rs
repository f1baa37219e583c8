//! Shared pacing gate for outbound service calls.
//!
//! Both cloud clients funnel through one gate so aggregate call frequency
//! stays bounded no matter how many workers are running.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Enforces a minimum wall-clock interval between successive acquisitions.
///
/// Callers reserve the next free slot under the lock and sleep until it
/// outside the critical section, so a slow sleeper never blocks other
/// reservations. The tokio mutex queues waiters FIFO, which keeps
/// acquisition starvation-free under concurrency.
pub struct RateGate {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Blocks until the minimum interval has elapsed since the previous
    /// acquisition, then returns. The reserved slot is committed before
    /// sleeping, so concurrent callers are spaced out in reservation order.
    pub async fn acquire(&self) {
        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(at) if at > now => at,
                _ => now,
            };
            *next = Some(slot + self.min_interval);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sequential_acquires_are_spaced() {
        let gate = RateGate::new(Duration::from_secs(1));
        let mut starts = Vec::new();
        for _ in 0..4 {
            gate.acquire().await;
            starts.push(Instant::now());
        }
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquires_are_spaced() {
        let gate = Arc::new(RateGate::new(Duration::from_millis(500)));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.acquire().await;
                Instant::now()
            }));
        }
        let mut starts = Vec::new();
        for handle in handles {
            starts.push(handle.await.unwrap());
        }
        starts.sort();
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_acquire_does_not_wait() {
        let gate = RateGate::new(Duration::from_secs(5));
        let before = Instant::now();
        gate.acquire().await;
        assert_eq!(Instant::now(), before);
    }
}
