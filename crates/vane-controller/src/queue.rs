//! Work queue — deduplicating, delayable, per-key serialised.
//!
//! - A key is queued at most once; adding it again is a no-op.
//! - A key handed to a worker is not handed out again until `done`. Adds
//!   arriving while it is processed coalesce into a single follow-up.
//! - `add_after` parks the key until its delay passes; the earliest
//!   pending delay for a key wins.
//! - `add_rate_limited` backs off exponentially per key,
//!   `base * 2^(failures-1)` capped at `max`, until `forget` resets it.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// Longest a key is parked by `add_after`; later work is picked up on the
/// next pass.
pub const MAX_DELAY: Duration = Duration::from_secs(24 * 3600);

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    /// Re-added while processing.
    dirty: HashSet<String>,
    delayed: BinaryHeap<Reverse<(Instant, String)>>,
    /// Earliest scheduled time per delayed key.
    scheduled: HashMap<String, Instant>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

impl State {
    fn enqueue(&mut self, key: String) -> bool {
        if self.queued.contains(&key) {
            return false;
        }
        if self.processing.contains(&key) {
            self.dirty.insert(key);
            return false;
        }
        self.queued.insert(key.clone());
        self.queue.push_back(key);
        true
    }

    /// Move due keys onto the queue; returns the next pending deadline.
    fn promote_due(&mut self, now: Instant) -> Option<Instant> {
        while let Some(Reverse((at, _))) = self.delayed.peek() {
            if *at > now {
                return Some(*at);
            }
            let Some(Reverse((at, key))) = self.delayed.pop() else {
                break;
            };
            // Superseded by an earlier schedule that already fired.
            if self.scheduled.get(&key) != Some(&at) {
                continue;
            }
            self.scheduled.remove(&key);
            self.enqueue(key);
        }
        None
    }
}

pub struct WorkQueue {
    name: String,
    state: Mutex<State>,
    notify: Notify,
    base: Duration,
    max: Duration,
}

impl WorkQueue {
    pub fn new(name: &str, base: Duration, max: Duration) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            base,
            max,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add(&self, key: &str) {
        let added = self.state.lock().expect("queue lock").enqueue(key.to_string());
        if added {
            trace!(queue = %self.name, %key, "queued");
            self.notify.notify_one();
        }
    }

    pub fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let delay = delay.min(MAX_DELAY);
        let at = Instant::now() + delay;
        let mut state = self.state.lock().expect("queue lock");
        if state.queued.contains(key) {
            return;
        }
        if state.scheduled.get(key).is_some_and(|existing| *existing <= at) {
            return;
        }
        state.scheduled.insert(key.to_string(), at);
        state.delayed.push(Reverse((at, key.to_string())));
        drop(state);
        trace!(queue = %self.name, %key, ?delay, "scheduled");
        // Wake a waiter so it can shorten its sleep.
        self.notify.notify_one();
    }

    /// Requeue after the key's next backoff delay.
    pub fn add_rate_limited(&self, key: &str) -> Duration {
        let delay = {
            let mut state = self.state.lock().expect("queue lock");
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            *failures += 1;
            backoff(self.base, self.max, *failures)
        };
        self.add_after(key, delay);
        delay
    }

    /// Reset the key's backoff.
    pub fn forget(&self, key: &str) {
        self.state.lock().expect("queue lock").failures.remove(key);
    }

    pub fn failures(&self, key: &str) -> u32 {
        let state = self.state.lock().expect("queue lock");
        state.failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue shuts down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut state = self.state.lock().expect("queue lock");
                if state.shutting_down {
                    return None;
                }
                let deadline = state.promote_due(Instant::now());
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    // Others may be waiting on what is left.
                    if !state.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                deadline
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark a key as finished; a coalesced re-add is queued now.
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.state.lock().expect("queue lock");
            state.processing.remove(key);
            state.dirty.remove(key) && state.enqueue(key.to_string())
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys queued, parked or in flight.
    pub fn pending(&self) -> usize {
        let state = self.state.lock().expect("queue lock");
        state.queue.len() + state.scheduled.len() + state.processing.len()
    }

    /// Release every waiting worker; `get` returns `None` from now on.
    pub fn shutdown(&self) {
        self.state.lock().expect("queue lock").shutting_down = true;
        self.notify.notify_waiters();
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

/// `base * 2^(failures-1)`, capped at `max`.
pub fn backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << exponent).min(max)
}
