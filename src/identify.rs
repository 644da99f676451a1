//! Fleet-wide gate over IDENTIFY.
//!
//! Shards are partitioned into `max_concurrency` buckets by
//! `shard_id % max_concurrency`. A bucket is an async mutex holding the time
//! of its last grant: holding the guard is holding the bucket, so two shards
//! of one bucket can never be mid-identify together. The guard is owned by
//! the returned [`IdentifyLease`] and released when the lease is dropped.

use crate::error::Error;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

type Bucket = Arc<Mutex<Option<Instant>>>;

/// Shared identify coordinator. Cloning is cheap and shares buckets.
#[derive(Debug, Clone)]
pub struct IdentifyCoordinator {
    buckets: Arc<Vec<Bucket>>,
    spacing: Duration,
}

/// Permission to send IDENTIFY for one shard.
#[derive(Debug)]
pub struct IdentifyLease {
    bucket: usize,
    granted_at: Instant,
    _guard: OwnedMutexGuard<Option<Instant>>,
}

impl IdentifyLease {
    pub fn bucket(&self) -> usize {
        self.bucket
    }

    pub fn granted_at(&self) -> Instant {
        self.granted_at
    }
}

impl IdentifyCoordinator {
    pub fn new(max_concurrency: u32, spacing: Duration) -> Self {
        let count = max_concurrency.max(1) as usize;
        let buckets = (0..count).map(|_| Arc::new(Mutex::new(None))).collect();
        Self {
            buckets: Arc::new(buckets),
            spacing,
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket_for(&self, shard_id: u32) -> usize {
        shard_id as usize % self.buckets.len()
    }

    /// Wait until `shard_id` may send IDENTIFY.
    ///
    /// Resolves once the shard's bucket is free and at least `spacing` has
    /// passed since the bucket's previous grant. Cancelling (through `cancel`
    /// or by dropping the future) consumes no grant and leaves the bucket
    /// untouched.
    pub async fn wait_for_identify(
        &self,
        shard_id: u32,
        cancel: &CancellationToken,
    ) -> Result<IdentifyLease, Error> {
        let bucket = self.bucket_for(shard_id);
        let lock = self.buckets[bucket].clone();

        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::IdentifyCancelled { shard_id }),
            guard = lock.lock_owned() => guard,
        };

        if let Some(last) = *guard {
            let ready_at = last + self.spacing;
            if ready_at > Instant::now() {
                debug!(
                    "[SHARD-{}] Waiting {:?} for identify bucket {}",
                    shard_id,
                    ready_at - Instant::now(),
                    bucket
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::IdentifyCancelled { shard_id }),
                    _ = tokio::time::sleep_until(ready_at) => {}
                }
            }
        }

        let mut guard = guard;
        let granted_at = Instant::now();
        *guard = Some(granted_at);
        debug!("[SHARD-{}] Identify granted (bucket {})", shard_id, bucket);

        Ok(IdentifyLease {
            bucket,
            granted_at,
            _guard: guard,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_same_bucket_is_serialized_and_spaced() {
        let coordinator = IdentifyCoordinator::new(1, Duration::from_secs(5));
        let cancel = CancellationToken::new();

        let first = coordinator.wait_for_identify(0, &cancel).await.unwrap();
        let first_at = first.granted_at();

        let c = coordinator.clone();
        let second = tokio::spawn(async move {
            let token = CancellationToken::new();
            c.wait_for_identify(1, &token).await.map(|lease| lease.granted_at())
        });

        // Held lease blocks the bucket.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!second.is_finished());

        let released_at = Instant::now();
        drop(first);
        let second_at = second.await.unwrap().unwrap();

        assert!(second_at >= first_at + Duration::from_secs(5));
        assert!(second_at >= released_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spacing_measured_from_previous_grant() {
        let coordinator = IdentifyCoordinator::new(1, Duration::from_secs(5));
        let cancel = CancellationToken::new();

        let first = coordinator.wait_for_identify(0, &cancel).await.unwrap();
        let first_at = first.granted_at();
        tokio::time::sleep(Duration::from_secs(2)).await;
        drop(first);

        let second = coordinator.wait_for_identify(0, &cancel).await.unwrap();
        assert_eq!(second.granted_at() - first_at, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_buckets_run_concurrently() {
        let coordinator = IdentifyCoordinator::new(2, Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let start = Instant::now();

        let a = coordinator.wait_for_identify(0, &cancel).await.unwrap();
        let b = coordinator.wait_for_identify(1, &cancel).await.unwrap();

        assert_eq!(a.bucket(), 0);
        assert_eq!(b.bucket(), 1);
        assert_eq!(a.granted_at(), start);
        assert_eq!(b.granted_at(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_consumes_no_grant() {
        let coordinator = IdentifyCoordinator::new(1, Duration::from_secs(5));
        let holder_token = CancellationToken::new();
        let held = coordinator.wait_for_identify(0, &holder_token).await.unwrap();

        let c = coordinator.clone();
        let waiter_token = CancellationToken::new();
        let waiter_cancel = waiter_token.clone();
        let waiter = tokio::spawn(async move { c.wait_for_identify(1, &waiter_token).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        waiter_cancel.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::IdentifyCancelled { shard_id: 1 })));

        let held_at = held.granted_at();
        drop(held);

        // Bucket still usable and the spacing still keys off the real grant.
        let next = coordinator.wait_for_identify(2, &holder_token).await.unwrap();
        assert_eq!(next.granted_at(), held_at + Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_spacing_sleep() {
        let coordinator = IdentifyCoordinator::new(1, Duration::from_secs(5));
        let token = CancellationToken::new();
        drop(coordinator.wait_for_identify(0, &token).await.unwrap());

        let c = coordinator.clone();
        let waiter_token = CancellationToken::new();
        let cancel = waiter_token.clone();
        let waiter = tokio::spawn(async move { c.wait_for_identify(0, &waiter_token).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        assert!(waiter.await.unwrap().is_err());

        // The lock was released by the cancelled waiter.
        let lease = coordinator.wait_for_identify(0, &token).await;
        assert!(lease.is_ok());
    }

    #[test]
    fn test_bucket_assignment() {
        let coordinator = IdentifyCoordinator::new(16, Duration::from_secs(5));
        assert_eq!(coordinator.bucket_for(0), 0);
        assert_eq!(coordinator.bucket_for(17), 1);
        assert_eq!(coordinator.bucket_for(31), 15);

        let single = IdentifyCoordinator::new(0, Duration::from_secs(5));
        assert_eq!(single.max_concurrency(), 1);
    }
}
