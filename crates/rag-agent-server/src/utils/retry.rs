use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

use crate::utils::error::AgentError;

/// Exponential backoff with a hard attempt cap.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Backoff {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay: Duration::from_secs(10),
        }
    }

    /// Delay before retry number `attempt` (0-based), with ±25% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let base_ms = initial_ms.saturating_mul(1u64 << attempt.min(16));
        let capped_ms = base_ms.min(max_ms);
        let jitter_range = capped_ms / 4;
        if jitter_range == 0 {
            return Duration::from_millis(capped_ms);
        }
        let offset = rand::rng().random_range(0..=jitter_range * 2);
        Duration::from_millis(capped_ms.saturating_sub(jitter_range).saturating_add(offset))
    }

    pub async fn wait(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        tokio::time::sleep(delay).await;
        delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200))
    }
}

/// Run `fut` under `limit`; an elapsed deadline becomes a transient error.
pub async fn with_timeout<T, F>(limit: Duration, op: &'static str, fut: F) -> Result<T, AgentError>
where
    F: Future<Output = Result<T, AgentError>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(AgentError::TransientBackend(format!(
            "{} timed out after {}ms",
            op,
            limit.as_millis()
        ))),
    }
}
