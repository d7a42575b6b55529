//! In-process scheduler for durable timers
//!
//! The durable part of a timer is its `TimerCreated` event; this service
//! only holds the sleeping task that reports the fire. After a restart the
//! engine re-arms every open timer from history.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::clock::EngineClock;

/// Identifies a timer by the decision that created it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub workflow_id: Uuid,
    pub generation: u32,
    pub scheduled_seq: u64,
}

/// Sleeping tasks for every armed timer
pub struct TimerService {
    clock: EngineClock,
    armed: Arc<DashMap<TimerKey, CancellationToken>>,
    shutdown: CancellationToken,
}

impl TimerService {
    pub fn new(clock: EngineClock) -> Self {
        Self {
            clock,
            armed: Arc::new(DashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Arm a timer; arming an already armed key is a no-op
    ///
    /// `on_fire` runs once the deadline passes, unless the timer was
    /// cancelled first.
    pub fn schedule<F, Fut>(&self, key: TimerKey, fire_at: DateTime<Utc>, on_fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown.child_token();
        match self.armed.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(_) => return,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(token.clone());
            }
        }

        let deadline = self.clock.instant_at(fire_at);
        let armed = self.armed.clone();
        debug!(workflow_id = %key.workflow_id, seq = key.scheduled_seq, %fire_at, "timer armed");

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    armed.remove(&key);
                    on_fire().await;
                }
            }
        });
    }

    /// Disarm a timer; returns false if it was not armed
    pub fn cancel(&self, key: &TimerKey) -> bool {
        match self.armed.remove(key) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Disarm every timer of one generation
    pub fn cancel_generation(&self, workflow_id: Uuid, generation: u32) {
        self.armed.retain(|key, token| {
            let matches = key.workflow_id == workflow_id && key.generation == generation;
            if matches {
                token.cancel();
            }
            !matches
        });
    }

    /// Whether a timer is currently armed
    pub fn is_armed(&self, key: &TimerKey) -> bool {
        self.armed.contains_key(key)
    }

    /// Number of armed timers
    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }

    /// Disarm everything
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.armed.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn key(seq: u64) -> TimerKey {
        TimerKey {
            workflow_id: Uuid::nil(),
            generation: 0,
            scheduled_seq: seq,
        }
    }

    fn counter_callback(
        fired: &Arc<AtomicUsize>,
    ) -> impl FnOnce() -> std::future::Ready<()> + Send + 'static {
        let fired = fired.clone();
        move || {
            fired.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_at_deadline() {
        let clock = EngineClock::new();
        let timers = TimerService::new(clock);
        let fired = Arc::new(AtomicUsize::new(0));

        timers.schedule(
            key(1),
            clock.now() + chrono::Duration::seconds(5),
            counter_callback(&fired),
        );
        assert!(timers.is_armed(&key(1)));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timers.is_armed(&key(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let clock = EngineClock::new();
        let timers = TimerService::new(clock);
        let fired = Arc::new(AtomicUsize::new(0));

        timers.schedule(
            key(1),
            clock.now() + chrono::Duration::seconds(5),
            counter_callback(&fired),
        );
        assert!(timers.cancel(&key(1)));
        assert!(!timers.cancel(&key(1)));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_is_idempotent() {
        let clock = EngineClock::new();
        let timers = TimerService::new(clock);
        let fired = Arc::new(AtomicUsize::new(0));
        let at = clock.now() + chrono::Duration::seconds(1);

        timers.schedule(key(1), at, counter_callback(&fired));
        timers.schedule(key(1), at, counter_callback(&fired));
        assert_eq!(timers.armed_count(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_generation_and_shutdown() {
        let clock = EngineClock::new();
        let timers = TimerService::new(clock);
        let fired = Arc::new(AtomicUsize::new(0));
        let at = clock.now() + chrono::Duration::seconds(1);

        timers.schedule(key(1), at, counter_callback(&fired));
        timers.schedule(
            TimerKey {
                generation: 1,
                ..key(1)
            },
            at,
            counter_callback(&fired),
        );

        timers.cancel_generation(Uuid::nil(), 0);
        assert_eq!(timers.armed_count(), 1);

        timers.shutdown();
        assert_eq!(timers.armed_count(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
