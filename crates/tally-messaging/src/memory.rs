//! In-memory channel
//!
//! Keeps every published message in an append-only log. Durable
//! subscriptions are cursors into that log, advanced on delivery, so a
//! resubscription under the same name resumes where the last one stopped.
//! Messages carrying a dedup id already seen within the duplicate window are
//! dropped, as the broker does.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tally_common::{subject, Result};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

use crate::channel::{
    Delivery, MessageChannel, OutboundMessage, StartPosition, Subscription, SubscriptionSpec,
};

/// JetStream's default duplicate window
pub const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(120);

/// A message as recorded in the log
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub subject: String,
    pub payload: Bytes,
    pub msg_id: Option<String>,
}

struct Durable {
    filter: String,
    cursor: usize,
    live: usize,
}

#[derive(Default)]
struct Log {
    messages: Vec<StoredMessage>,
    /// Dedup ids inside the window, oldest first
    recent_ids: VecDeque<(Instant, String)>,
    seen_ids: HashSet<String>,
    durables: HashMap<String, Durable>,
}

impl Log {
    fn forget_ids_before(&mut self, horizon: Instant) {
        while let Some((seen_at, _)) = self.recent_ids.front() {
            if *seen_at > horizon {
                break;
            }
            if let Some((_, id)) = self.recent_ids.pop_front() {
                self.seen_ids.remove(&id);
            }
        }
    }
}

struct Inner {
    log: Mutex<Log>,
    duplicate_window: Duration,
    /// Bumped on every append or durable removal
    notify: watch::Sender<u64>,
}

impl Inner {
    fn wake(&self) {
        self.notify.send_modify(|seq| *seq = seq.wrapping_add(1));
    }
}

#[derive(Clone)]
pub struct MemoryChannel {
    inner: Arc<Inner>,
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::with_duplicate_window(DEFAULT_DUPLICATE_WINDOW)
    }

    pub fn with_duplicate_window(duplicate_window: Duration) -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                log: Mutex::new(Log::default()),
                duplicate_window,
                notify,
            }),
        }
    }

    /// Everything accepted so far, in publish order
    pub fn published(&self) -> Vec<StoredMessage> {
        self.inner.log.lock().messages.clone()
    }

    /// Accepted messages whose subject matches `pattern`
    pub fn published_matching(&self, pattern: &str) -> Vec<StoredMessage> {
        self.inner
            .log
            .lock()
            .messages
            .iter()
            .filter(|m| subject::matches(pattern, &m.subject))
            .cloned()
            .collect()
    }

    /// Names of durable subscriptions that still exist
    pub fn durables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.log.lock().durables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of open subscription streams for a durable
    pub fn live_subscriptions(&self, name: &str) -> usize {
        self.inner
            .log
            .lock()
            .durables
            .get(name)
            .map(|d| d.live)
            .unwrap_or(0)
    }
}

enum Step {
    Ready(Delivery),
    Idle,
    Closed,
}

/// Decrements the live count of its durable when the stream is dropped
struct LiveGuard {
    inner: Arc<Inner>,
    name: String,
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        if let Some(durable) = self.inner.log.lock().durables.get_mut(&self.name) {
            durable.live = durable.live.saturating_sub(1);
        }
    }
}

struct Cursor {
    guard: LiveGuard,
    rx: watch::Receiver<u64>,
}

impl Cursor {
    fn next_ready(&self) -> Step {
        let mut log = self.guard.inner.log.lock();
        let log = &mut *log;
        let Some(durable) = log.durables.get_mut(&self.guard.name) else {
            return Step::Closed;
        };

        while durable.cursor < log.messages.len() {
            let message = &log.messages[durable.cursor];
            durable.cursor += 1;
            if subject::matches(&durable.filter, &message.subject) {
                return Step::Ready(Delivery::new(message.subject.clone(), message.payload.clone()));
            }
        }
        Step::Idle
    }
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    async fn publish(&self, message: OutboundMessage) -> Result<()> {
        {
            let mut log = self.inner.log.lock();
            if let Some(id) = &message.msg_id {
                let now = Instant::now();
                if let Some(horizon) = now.checked_sub(self.inner.duplicate_window) {
                    log.forget_ids_before(horizon);
                }
                if !log.seen_ids.insert(id.clone()) {
                    debug!(msg_id = %id, "Dropped duplicate message");
                    return Ok(());
                }
                log.recent_ids.push_back((now, id.clone()));
            }
            log.messages.push(StoredMessage {
                subject: message.subject,
                payload: message.payload,
                msg_id: message.msg_id,
            });
        }
        self.inner.wake();
        Ok(())
    }

    async fn subscribe(&self, spec: &SubscriptionSpec) -> Result<Subscription> {
        // Subscribe to notifications before reading the log so no append is missed
        let rx = self.inner.notify.subscribe();
        {
            let mut log = self.inner.log.lock();
            let log = &mut *log;
            let tail = log.messages.len();
            let durable = log.durables.entry(spec.name.clone()).or_insert_with(|| Durable {
                filter: spec.filter_subject.clone(),
                cursor: match spec.start {
                    StartPosition::All => 0,
                    StartPosition::New => tail,
                },
                live: 0,
            });
            durable.filter = spec.filter_subject.clone();
            durable.live += 1;
        }

        let cursor = Cursor {
            guard: LiveGuard {
                inner: self.inner.clone(),
                name: spec.name.clone(),
            },
            rx,
        };

        let stream = futures::stream::unfold(cursor, |mut cursor| async move {
            loop {
                match cursor.next_ready() {
                    Step::Ready(delivery) => return Some((Ok(delivery), cursor)),
                    Step::Closed => return None,
                    Step::Idle => {
                        if cursor.rx.changed().await.is_err() {
                            return None;
                        }
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn delete_subscription(&self, name: &str) -> Result<()> {
        let removed = self.inner.log.lock().durables.remove(name).is_some();
        if removed {
            debug!(name, "Deleted durable");
            self.inner.wake();
        }
        Ok(())
    }
}
