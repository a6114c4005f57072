//! Registry correlating paginated request/response exchanges by an opaque token.

use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashMap;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::time::Instant;

struct Entry<T> {
    items: Vec<T>,
    /// Total pages, known once the first page arrives
    expected: Option<u32>,
    tx: oneshot::Sender<Vec<T>>,
}

type Entries<T> = Mutex<HashMap<String, Entry<T>>>;

/// In-flight requests keyed by correlation token.
///
/// Each entry resolves exactly once, either when the final page is observed,
/// when its deadline passes, or when the table is flushed. Resolving removes
/// the entry, so whichever path removes it first wins.
pub struct PendingRequests<T> {
    entries: Arc<Entries<T>>,
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> std::fmt::Debug for PendingRequests<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequests")
            .field("in_flight", &self.entries.lock().len())
            .finish()
    }
}

impl<T: Send + 'static> PendingRequests<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `token` and return the handle that resolves with its results.
    pub fn open(&self, token: impl Into<String>, deadline: Instant) -> PendingHandle<T> {
        let token = token.into();
        let (tx, rx) = oneshot::channel();
        self.entries.lock().insert(
            token.clone(),
            Entry {
                items: Vec::new(),
                expected: None,
                tx,
            },
        );
        PendingHandle {
            token,
            deadline,
            rx,
            entries: Arc::downgrade(&self.entries),
        }
    }

    /// Accumulate partial results. Returns false if the token is not in flight.
    pub fn append(&self, token: &str, items: impl IntoIterator<Item = T>) -> bool {
        match self.entries.lock().get_mut(token) {
            Some(entry) => {
                entry.items.extend(items);
                true
            }
            None => false,
        }
    }

    /// Record page `index` of `count`; resolves the entry on the last page.
    ///
    /// Returns true if this call resolved the entry.
    pub fn complete(&self, token: &str, index: u32, count: u32) -> bool {
        let entry = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(token) else {
                return false;
            };
            entry.expected = Some(count);
            if index.saturating_add(1) < count {
                return false;
            }
            entries.remove(token)
        };

        match entry {
            Some(entry) => {
                let _ = entry.tx.send(entry.items);
                true
            }
            None => false,
        }
    }

    /// Resolve every in-flight entry with whatever it has accumulated.
    pub fn flush(&self) -> usize {
        let drained: Vec<Entry<T>> = self.entries.lock().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(entry.items);
        }
        count
    }

    /// Total pages announced for `token`, if any page has arrived yet.
    pub fn expected(&self, token: &str) -> Option<u32> {
        self.entries.lock().get(token).and_then(|e| e.expected)
    }

    pub fn contains(&self, token: &str) -> bool {
        self.entries.lock().contains_key(token)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves with the accumulated results at completion or at the deadline.
///
/// Dropping the handle abandons the request and removes its entry.
pub struct PendingHandle<T> {
    token: String,
    deadline: Instant,
    rx: oneshot::Receiver<Vec<T>>,
    entries: Weak<Entries<T>>,
}

impl<T> std::fmt::Debug for PendingHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingHandle")
            .field("token", &self.token)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl<T: Send + 'static> PendingHandle<T> {
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait for completion, or return partial results once the deadline passes.
    pub async fn wait(mut self) -> Vec<T> {
        match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(items)) => items,
            // Table dropped without resolving
            Ok(Err(_)) => Vec::new(),
            Err(_) => {
                if let Some(entries) = self.entries.upgrade() {
                    if let Some(entry) = entries.lock().remove(&self.token) {
                        return entry.items;
                    }
                }
                // Resolved between the timeout firing and the lock
                self.rx.try_recv().unwrap_or_default()
            }
        }
    }
}

impl<T: Send + 'static> IntoFuture for PendingHandle<T> {
    type Output = Vec<T>;
    type IntoFuture = Pin<Box<dyn Future<Output = Vec<T>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

impl<T> Drop for PendingHandle<T> {
    fn drop(&mut self) {
        if let Some(entries) = self.entries.upgrade() {
            entries.lock().remove(&self.token);
        }
    }
}

/// Random 16-byte correlation token, hex encoded.
pub fn new_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
