//! Claiming due step tasks
//!
//! The poller reserves a concurrency slot before it claims, so every task it
//! hands out already owns the permit it will run under. Slots left over
//! after a claim go straight back to the pool.
//!
//! Between claims it sleeps until whichever comes first:
//!
//! - the earliest pending retry becomes due,
//! - a slot frees up while all of them are busy,
//! - the idle interval elapses (stretched after every empty claim, up to
//!   `max_interval`),
//! - shutdown is signalled.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, instrument, trace};

use crate::engine::EngineClock;
use crate::persistence::{ClaimedTask, StoreError, WorkflowEventStore};

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Shortest sleep between claims
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Longest sleep while nothing is pending
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth factor of the idle sleep after an empty claim
    pub backoff_multiplier: f64,

    /// Most tasks taken in one claim
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Values below 1.0 would shrink the sleep; they are raised to 1.0
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// A claimed task together with the slot it runs under
#[derive(Debug)]
pub struct ClaimedSlot {
    pub task: ClaimedTask,
    pub permit: OwnedSemaphorePermit,
}

/// What ended a [`TaskPoller::wait`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Time to claim again
    Claim,
    /// Shutdown was signalled
    Shutdown,
}

/// Claims due tasks into free concurrency slots
pub struct TaskPoller {
    store: Arc<dyn WorkflowEventStore>,
    clock: EngineClock,
    worker_id: String,
    step_types: Vec<String>,
    config: PollerConfig,
    slots: Arc<Semaphore>,
    idle: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl TaskPoller {
    pub fn new(
        store: Arc<dyn WorkflowEventStore>,
        clock: EngineClock,
        worker_id: String,
        step_types: Vec<String>,
        config: PollerConfig,
        slots: Arc<Semaphore>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            clock,
            worker_id,
            step_types,
            idle: config.min_interval,
            config,
            slots,
            shutdown_rx,
        }
    }

    /// Claim as many due tasks as there are free slots
    ///
    /// Returns nothing once shutdown is signalled or when every slot is
    /// busy; neither counts as an empty claim.
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn claim(&mut self) -> Result<Vec<ClaimedSlot>, PollerError> {
        if self.is_shutdown() {
            return Ok(vec![]);
        }

        let mut permits = Vec::new();
        while permits.len() < self.config.batch_size {
            match Arc::clone(&self.slots).try_acquire_owned() {
                Ok(permit) => permits.push(permit),
                Err(_) => break,
            }
        }
        if permits.is_empty() {
            trace!("all slots busy");
            return Ok(vec![]);
        }

        let tasks = self
            .store
            .claim_tasks(&self.worker_id, &self.step_types, permits.len(), self.clock.now())
            .await?;

        if tasks.is_empty() {
            self.idle = self.stretched_idle();
            trace!(idle_ms = self.idle.as_millis() as u64, "nothing due");
        } else {
            self.idle = self.config.min_interval;
            debug!(count = tasks.len(), free = permits.len(), "claimed tasks");
        }

        // Surplus permits drop with the iterator
        Ok(tasks
            .into_iter()
            .zip(permits)
            .map(|(task, permit)| ClaimedSlot { task, permit })
            .collect())
    }

    /// Sleep until the next claim is worth attempting
    pub async fn wait(&mut self) -> Wake {
        if self.is_shutdown() {
            return Wake::Shutdown;
        }

        let mut shutdown_rx = self.shutdown_rx.clone();
        if self.slots.available_permits() == 0 {
            let slots = Arc::clone(&self.slots);
            return tokio::select! {
                _ = slots.acquire() => Wake::Claim,
                _ = shutdown_rx.changed() => Wake::Shutdown,
            };
        }

        let delay = self.next_delay().await;
        tokio::select! {
            _ = tokio::time::sleep(delay) => Wake::Claim,
            _ = shutdown_rx.changed() => Wake::Shutdown,
        }
    }

    /// Sleep before the next claim while slots are free
    ///
    /// The idle interval, cut short by a retry falling due sooner but never
    /// below `min_interval`.
    pub async fn next_delay(&self) -> Duration {
        let due = match self.store.next_task_due(&self.step_types).await {
            Ok(due) => due,
            Err(err) => {
                debug!(error = %err, "could not read next due task");
                None
            }
        };
        let until_due = due
            .map(|at| (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(self.idle);
        until_due.clamp(self.config.min_interval, self.idle.max(self.config.min_interval))
    }

    /// Current idle interval
    pub fn idle_interval(&self) -> Duration {
        self.idle
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn stretched_idle(&self) -> Duration {
        let next = self.idle.as_secs_f64() * self.config.backoff_multiplier;
        Duration::from_secs_f64(next.min(self.config.max_interval.as_secs_f64()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// `Duration` as whole milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
