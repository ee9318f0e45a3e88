//! Advisory locks stored in the same database as everything else.
//!
//! A lock is one row `(resource, owner, acquired_at)`. Claiming takes
//! over rows whose holder went stale (crashed mid-hold); contention is
//! handled by bounded, jittered retries. Holding a lock is advisory:
//! every writer of group state goes through `modify_state`, which is
//! what makes the lock effective.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use rand::Rng;

use updraft_domain::config::LockConfig;
use updraft_domain::{keys, Clock, Error, Result};

use crate::backend::StorageBackend;

/// Proof of a held claim; pass back to [`LockService::release`].
#[derive(Debug)]
pub struct LockGuard {
    resource: String,
    owner: String,
}

#[derive(Clone)]
pub struct LockService {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    config: LockConfig,
}

impl LockService {
    pub fn new(backend: Arc<dyn StorageBackend>, clock: Arc<dyn Clock>, config: LockConfig) -> Self {
        Self {
            backend,
            clock,
            config,
        }
    }

    /// Retry budget configured for `modify_state`-style callers.
    pub fn default_max_retry(&self) -> u32 {
        self.config.max_retry
    }

    /// Try to claim `resource`, retrying up to `max_retry` times with
    /// jittered waits. Fails with `BusyLock` once the budget is spent.
    pub async fn acquire(&self, resource: &str, max_retry: u32) -> Result<LockGuard> {
        let owner = keys::new_key();
        let stale_after = Duration::seconds(self.config.stale_after_secs as i64);

        for attempt in 0..=max_retry {
            let claimed = self
                .backend
                .try_acquire_lock(resource, &owner, self.clock.now(), stale_after)
                .await?;
            if claimed {
                tracing::debug!(resource, attempt, "lock acquired");
                return Ok(LockGuard {
                    resource: resource.to_owned(),
                    owner,
                });
            }
            if attempt < max_retry {
                tokio::time::sleep(self.retry_wait()).await;
            }
        }
        Err(Error::BusyLock(resource.to_owned()))
    }

    /// Release a held claim. Releasing a claim that was taken over by a
    /// stale-lock takeover is a no-op.
    pub async fn release(&self, guard: LockGuard) -> Result<()> {
        let removed = self
            .backend
            .release_lock(&guard.resource, &guard.owner)
            .await?;
        if !removed {
            tracing::warn!(
                resource = %guard.resource,
                "lock was no longer held at release (taken over as stale?)"
            );
        }
        Ok(())
    }

    /// Run `body` while holding `resource`. The lock is released whether
    /// the body succeeds or fails; the body's result is returned either
    /// way.
    pub async fn with_lock<T, F, Fut>(&self, resource: &str, max_retry: u32, body: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire(resource, max_retry).await?;
        let result = body().await;
        if let Err(e) = self.release(guard).await {
            tracing::warn!(resource, error = %e, "failed to release lock");
        }
        result
    }

    /// Uniform jitter in the configured wait window, so contending
    /// claimants do not retry in lockstep.
    fn retry_wait(&self) -> StdDuration {
        let min_ms = self.config.retry_wait_min_secs * 1000;
        let max_ms = self.config.retry_wait_max_secs.max(self.config.retry_wait_min_secs) * 1000;
        let wait_ms = if min_ms == max_ms {
            min_ms
        } else {
            rand::thread_rng().gen_range(min_ms..=max_ms)
        };
        StdDuration::from_millis(wait_ms)
    }
}
