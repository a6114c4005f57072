//! Token bucket gating outbound gateway frames.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::time::{Duration, Instant};
use tracing::trace;

type Action = Box<dyn FnOnce() + Send + 'static>;

struct BucketState {
    /// Tokens consumed in the current window
    used: u32,
    /// Start of the current window; `None` while the bucket is full
    window_start: Option<Instant>,
    priority: VecDeque<Action>,
    normal: VecDeque<Action>,
}

/// Rate limiter with a scheduled refill.
///
/// At most `capacity` actions run per `interval`. Normal actions never consume
/// the last `reserved` tokens; priority actions may consume any token and are
/// admitted ahead of queued normal actions. The first token taken from a full
/// bucket starts the window and schedules the refill.
///
/// `queue` must be called from within a tokio runtime.
#[derive(Clone)]
pub struct TokenBucket {
    inner: Arc<Mutex<BucketState>>,
    capacity: u32,
    reserved: u32,
    interval: Duration,
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("reserved", &self.reserved)
            .field("interval", &self.interval)
            .field("queued", &self.len())
            .finish()
    }
}

impl TokenBucket {
    pub fn new(capacity: u32, interval: Duration, reserved: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BucketState {
                used: 0,
                window_start: None,
                priority: VecDeque::new(),
                normal: VecDeque::new(),
            })),
            capacity,
            reserved: reserved.min(capacity),
            interval,
        }
    }

    /// Run `action` once a token is available.
    pub fn queue<F>(&self, action: F, priority: bool)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.inner.lock();
            if priority {
                state.priority.push_back(Box::new(action));
            } else {
                state.normal.push_back(Box::new(action));
            }
        }
        Self::drain(&self.inner, self.capacity, self.reserved, self.interval);
    }

    /// Number of actions waiting for a token
    pub fn len(&self) -> usize {
        let state = self.inner.lock();
        state.priority.len() + state.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tokens left in the current window
    pub fn remaining(&self) -> u32 {
        self.capacity - self.inner.lock().used
    }

    fn drain(inner: &Arc<Mutex<BucketState>>, capacity: u32, reserved: u32, interval: Duration) {
        let mut admitted: Vec<Action> = Vec::new();
        {
            let mut state = inner.lock();
            loop {
                let next = if state.used < capacity && !state.priority.is_empty() {
                    state.priority.pop_front()
                } else if state.used < capacity - reserved && !state.normal.is_empty() {
                    state.normal.pop_front()
                } else {
                    None
                };
                let Some(action) = next else { break };

                if state.window_start.is_none() {
                    let start = Instant::now();
                    state.window_start = Some(start);
                    Self::schedule_refill(Arc::downgrade(inner), start + interval, capacity, reserved, interval);
                }
                state.used += 1;
                admitted.push(action);
            }
        }

        // Run outside the lock so an action may queue follow-ups
        for action in admitted {
            action();
        }
    }

    fn schedule_refill(
        inner: Weak<Mutex<BucketState>>,
        at: Instant,
        capacity: u32,
        reserved: u32,
        interval: Duration,
    ) {
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            let Some(inner) = inner.upgrade() else { return };
            {
                let mut state = inner.lock();
                trace!(
                    "Bucket refilled ({} used, {} queued)",
                    state.used,
                    state.priority.len() + state.normal.len()
                );
                state.used = 0;
                state.window_start = None;
            }
            Self::drain(&inner, capacity, reserved, interval);
        });
    }
}

/// Queue `action` on every bucket; it runs exactly once, after the last bucket admits it.
pub fn queue_all<F>(buckets: &[&TokenBucket], action: F, priority: bool)
where
    F: FnOnce() + Send + 'static,
{
    if buckets.is_empty() {
        action();
        return;
    }

    let remaining = Arc::new(AtomicUsize::new(buckets.len()));
    let action = Arc::new(Mutex::new(Some(action)));
    for bucket in buckets {
        let remaining = remaining.clone();
        let action = action.clone();
        bucket.queue(
            move || {
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    if let Some(action) = action.lock().take() {
                        action();
                    }
                }
            },
            priority,
        );
    }
}
