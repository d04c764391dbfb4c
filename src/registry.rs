//! Registry digest resolution.
//!
//! Digests come from a manifest-only query, so resolving a reference never
//! pulls layers. Transient failures are retried with exponential backoff;
//! credential and not-found failures are final on the first answer.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::time::sleep;

use crate::error::{EngineError, UpdateError};
use crate::runtime::{bounded, ContainerRuntime};
use crate::types::{DigestRecord, ImageReference};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the `attempt`-th failure (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Clone)]
pub struct DigestResolver {
    runtime: Arc<dyn ContainerRuntime>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl DigestResolver {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            runtime,
            policy,
            timeout,
        }
    }

    /// Digest currently published under `reference`.
    ///
    /// Pinned references resolve to their pin without asking the registry.
    pub async fn resolve(&self, reference: &ImageReference) -> Result<DigestRecord, UpdateError> {
        if let Some(pinned) = reference.pinned_digest() {
            return Ok(DigestRecord::observed(reference.clone(), pinned.clone()));
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = bounded(self.timeout, self.runtime.distribution_digest(reference)).await;
            match result {
                Ok(digest) => {
                    debug!("Resolved {} to {}", reference, digest);
                    return Ok(DigestRecord::observed(reference.clone(), digest));
                }
                Err(EngineError::Unauthorized(msg)) => {
                    return Err(UpdateError::AuthFailure(format!("{}: {}", reference, msg)));
                }
                Err(EngineError::NotFound(msg)) => {
                    return Err(UpdateError::ReferenceNotFound(format!("{}: {}", reference, msg)));
                }
                Err(e) if attempt < self.policy.attempts => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(
                        "Resolving {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        reference, attempt, self.policy.attempts, e, delay
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    return Err(UpdateError::RegistryUnreachable(format!(
                        "{} after {} attempts: {}",
                        reference, attempt, e
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            attempts: 6,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_after(4), Duration::from_secs(3));
        assert_eq!(policy.delay_after(40), Duration::from_secs(3));
    }
}
