use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;

/// Doubling retry delay with a cap, a retry budget and a little jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    max_retries: u32,
    current_attempt: u32,
}

#[derive(Debug, Error)]
#[error("Maximum retry attempts exceeded")]
pub struct MaxRetriesExceeded;

impl ExponentialBackoff {
    pub fn new(initial_delay_ms: u64, max_delay_ms: u64, max_retries: u32) -> Self {
        Self {
            initial_delay_ms,
            max_delay_ms,
            max_retries,
            current_attempt: 0,
        }
    }

    /// Retries used so far.
    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    /// Delay before the next retry, before jitter.
    pub fn next_delay(&self) -> Duration {
        let factor = 2_u64.saturating_pow(self.current_attempt);
        Duration::from_millis(self.initial_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    /// Wait before the next retry, or fail if the budget is spent.
    pub async fn sleep(&mut self) -> Result<(), MaxRetriesExceeded> {
        if self.current_attempt >= self.max_retries {
            return Err(MaxRetriesExceeded);
        }

        let base = self.next_delay();
        let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
        let delay = base + Duration::from_millis(jitter_ms);

        log::warn!(
            "⏳ Retry attempt {} of {} in {}ms",
            self.current_attempt + 1,
            self.max_retries,
            delay.as_millis()
        );

        sleep(delay).await;
        self.current_attempt += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let mut backoff = ExponentialBackoff::new(100, 350, 5);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        backoff.current_attempt = 1;
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        backoff.current_attempt = 2;
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_is_enforced() {
        let mut backoff = ExponentialBackoff::new(10, 100, 2);
        assert!(backoff.sleep().await.is_ok());
        assert!(backoff.sleep().await.is_ok());
        let exhausted = backoff.sleep().await.unwrap_err();
        assert_eq!(exhausted.to_string(), "Maximum retry attempts exceeded");
        assert_eq!(backoff.attempts(), 2);
    }
}
