use std::time::Duration;
use tokio::time::Instant;

/// Single-delay throttle: at most one permitted call per `delay` window.
///
/// Not safe for concurrent callers on its own; each component that needs
/// independent throttling (arXiv metadata calls need at least 3 seconds
/// between requests, PDF mirrors tolerate less) owns its own instance and
/// wraps it in a mutex where tasks share it.
pub struct RateLimiter {
    delay: Duration,
    last_call: Option<Instant>,
}

impl RateLimiter {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_call: None,
        }
    }

    /// Suspend until `delay` has elapsed since the last permitted call,
    /// then stamp the new last-call time.
    pub async fn wait(&mut self) {
        if let Some(last) = self.last_call {
            let elapsed = last.elapsed();
            if elapsed < self.delay {
                tokio::time::sleep(self.delay - elapsed).await;
            }
        }
        self.last_call = Some(Instant::now());
    }

    /// Non-blocking check used for diagnostics.
    pub fn can_proceed(&self) -> bool {
        match self.last_call {
            Some(last) => last.elapsed() >= self.delay,
            None => true,
        }
    }

    /// Time remaining until the next call is allowed (zero if clear).
    pub fn time_until_next_call(&self) -> Duration {
        match self.last_call {
            Some(last) => self.delay.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_call_is_immediate() {
        let mut limiter = RateLimiter::new(Duration::from_secs(3));
        assert!(limiter.can_proceed());
        assert_eq!(limiter.time_until_next_call(), Duration::ZERO);

        let before = Instant::now();
        limiter.wait().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn second_call_waits_out_the_delay() {
        let mut limiter = RateLimiter::new(Duration::from_secs(3));
        limiter.wait().await;
        assert!(!limiter.can_proceed());

        let before = Instant::now();
        limiter.wait().await;
        assert_eq!(before.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn elapsed_delay_clears_the_throttle() {
        let mut limiter = RateLimiter::new(Duration::from_secs(3));
        limiter.wait().await;

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(limiter.can_proceed());
        assert_eq!(limiter.time_until_next_call(), Duration::ZERO);

        let before = Instant::now();
        limiter.wait().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn time_until_next_call_counts_down() {
        let mut limiter = RateLimiter::new(Duration::from_secs(3));
        limiter.wait().await;

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.time_until_next_call(), Duration::from_secs(2));
    }
}
