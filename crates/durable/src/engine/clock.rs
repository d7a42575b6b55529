//! Engine time source

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Deadline used when an instant would not fit in the tokio clock
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Wall-clock time anchored to the tokio clock
///
/// `now()` advances with `tokio::time`, so tests running on a paused
/// runtime move timers and recorded timestamps forward together.
#[derive(Debug, Clone, Copy)]
pub struct EngineClock {
    base_utc: DateTime<Utc>,
    base_instant: Instant,
}

impl Default for EngineClock {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineClock {
    /// Anchor the clock at the current time
    pub fn new() -> Self {
        Self {
            base_utc: Utc::now(),
            base_instant: Instant::now(),
        }
    }

    /// Current wall-clock time
    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = Instant::now().saturating_duration_since(self.base_instant);
        self.base_utc + chrono::Duration::from_std(elapsed).unwrap_or_default()
    }

    /// The tokio instant corresponding to `at`
    ///
    /// Instants in the past map to the anchor, which has already elapsed.
    /// Instants beyond what tokio can represent are clamped to about
    /// thirty years out.
    pub fn instant_at(&self, at: DateTime<Utc>) -> Instant {
        match (at - self.base_utc).to_std() {
            Ok(offset) => self
                .base_instant
                .checked_add(offset)
                .unwrap_or_else(|| Instant::now() + FAR_FUTURE),
            Err(_) => self.base_instant,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_now_follows_tokio_time() {
        let clock = EngineClock::new();
        let start = clock.now();

        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(clock.now() - start, chrono::Duration::seconds(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_instant_at() {
        let clock = EngineClock::new();
        let in_ten = clock.now() + chrono::Duration::seconds(10);

        assert_eq!(
            clock.instant_at(in_ten) - Instant::now(),
            Duration::from_secs(10)
        );

        let past = clock.now() - chrono::Duration::seconds(10);
        assert!(clock.instant_at(past) <= Instant::now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_instant_at_far_future_does_not_overflow() {
        let clock = EngineClock::new();
        let at = DateTime::<Utc>::MAX_UTC;

        assert!(clock.instant_at(at) > Instant::now() + Duration::from_secs(86_400));
    }
}
