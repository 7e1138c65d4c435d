//! Rate-limited, deduplicating work queue
//!
//! Keys are handed out FIFO. A key is never processed by two callers at
//! once: adding a key that is in flight marks it dirty, and it is queued
//! again when the current holder calls [`TaskQueue::done`].

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use indexmap::IndexSet;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Queue tuning
#[derive(Debug, Clone)]
pub struct TaskQueueConfig {
    /// First retry delay
    pub initial_backoff: Duration,
    /// Retry delay cap
    pub max_backoff: Duration,
    /// Retries before a key is dropped; 0 retries forever
    pub max_retries: u32,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            max_retries: 0,
        }
    }
}

#[derive(Default)]
struct QueueState {
    queue: IndexSet<String>,
    processing: HashSet<String>,
    dirty: HashSet<String>,
    failures: HashMap<String, (u32, ExponentialBackoff)>,
    shutting_down: bool,
}

/// Named work queue
pub struct TaskQueue {
    name: String,
    config: TaskQueueConfig,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new(name: impl Into<String>, config: TaskQueueConfig) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            config,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a key; no-op if it is already waiting
    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let mut state = self.state.lock();
        if state.shutting_down {
            return;
        }
        if state.processing.contains(&key) {
            state.dirty.insert(key);
            return;
        }
        if state.queue.insert(key) {
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Queue a key once `delay` has passed
    pub fn add_after(self: &Arc<Self>, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Queue a key after its next backoff delay.
    ///
    /// Once `max_retries` is exceeded the key is forgotten instead.
    pub fn add_rate_limited(self: &Arc<Self>, key: impl Into<String>) {
        let key = key.into();
        let delay = {
            let mut state = self.state.lock();
            let config = &self.config;
            let (attempts, backoff) = state.failures.entry(key.clone()).or_insert_with(|| {
                (
                    0,
                    ExponentialBackoff {
                        initial_interval: config.initial_backoff,
                        current_interval: config.initial_backoff,
                        max_interval: config.max_backoff,
                        multiplier: 2.0,
                        randomization_factor: 0.0,
                        max_elapsed_time: None,
                        ..Default::default()
                    },
                )
            });
            *attempts += 1;
            if config.max_retries > 0 && *attempts > config.max_retries {
                debug!(queue = %self.name, key = %key, "Retries exhausted, dropping task");
                state.failures.remove(&key);
                return;
            }
            backoff.next_backoff().unwrap_or(config.max_backoff)
        };
        self.add_after(key, delay);
    }

    /// Clear the retry history of a key
    pub fn forget(&self, key: &str) {
        self.state.lock().failures.remove(key);
    }

    /// Number of failed attempts recorded for a key
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.state
            .lock()
            .failures
            .get(key)
            .map(|(n, _)| *n)
            .unwrap_or(0)
    }

    /// Wait for the next key; `None` once the queue is shut down
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.shift_remove_index(0) {
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Release a key handed out by [`TaskQueue::get`]
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.remove(key) && !state.shutting_down {
            state.queue.insert(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Wake every waiter and refuse new work
    pub fn shutdown(&self) {
        self.state.lock().shutting_down = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state.lock().shutting_down
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
