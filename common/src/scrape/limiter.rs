// Fetch admission control: a concurrency cap plus start-spacing
//
// A semaphore bounds simultaneous fetches; a capacity-one token bucket spaces
// fetch starts by the configured delay. Waits abort on job cancellation;
// in-flight requests are left to finish or time out.

use crate::errors::ScrapeError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct FetchGate {
    semaphore: Arc<Semaphore>,
    interval: Duration,
    next_start: Arc<Mutex<Option<Instant>>>,
}

impl FetchGate {
    pub fn new(max_concurrent: usize, interval: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            interval,
            next_start: Arc::new(Mutex::new(None)),
        }
    }

    /// Wait for a fetch slot. The returned permit must be held for the
    /// duration of the fetch.
    pub async fn admit(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, ScrapeError> {
        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(ScrapeError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| ScrapeError::Cancelled)?
            }
        };

        if !self.interval.is_zero() {
            let start_at = {
                let mut next = self.next_start.lock().await;
                let now = Instant::now();
                let start_at = match *next {
                    Some(at) if at > now => at,
                    _ => now,
                };
                *next = Some(start_at + self.interval);
                start_at
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(ScrapeError::Cancelled),
                _ = tokio::time::sleep_until(start_at) => {}
            }
        }

        Ok(permit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spaces_fetch_starts() {
        let gate = FetchGate::new(4, Duration::from_millis(50));
        let cancel = CancellationToken::new();

        let t0 = Instant::now();
        let _p1 = gate.admit(&cancel).await.unwrap();
        let _p2 = gate.admit(&cancel).await.unwrap();
        let _p3 = gate.admit(&cancel).await.unwrap();
        let elapsed = t0.elapsed();

        // second and third starts are spaced one interval apart each
        assert!(elapsed >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let gate = FetchGate::new(1, Duration::ZERO);
        let cancel = CancellationToken::new();

        let p1 = gate.admit(&cancel).await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(50), gate.admit(&cancel)).await;
        assert!(second.is_err(), "second admit should block on the cap");

        drop(p1);
        let third = tokio::time::timeout(Duration::from_millis(50), gate.admit(&cancel)).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let gate = FetchGate::new(1, Duration::from_secs(60));
        let cancel = CancellationToken::new();

        // first admit consumes the token; second would wait a minute
        let _p1 = gate.admit(&cancel).await.unwrap();
        drop(_p1);

        let gate = Arc::new(gate);
        let gate2 = gate.clone();
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move { gate2.admit(&cancel2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ScrapeError::Cancelled)));
    }
}
