//! In-process publish/subscribe with per-subscriber bounded inboxes.
//!
//! Publishing never blocks beyond the cost of a `try_send` into each
//! subscriber's queue.  A subscriber that stops draining its inbox is
//! disconnected the moment its queue fills: its channel is closed and
//! removed so one slow SSE client can never head-of-line-block the others.
//! Drops are announced on a bus-internal diagnostic channel.
//!
//! Delivery guarantees, per (publisher, subscriber) pair: FIFO order and
//! strictly monotonic sequence numbers.  The registry mutex is held only for
//! membership changes and the non-blocking fan-out loop, never across an
//! `.await`.

use crate::evoforge::event::{EventKind, EvolutionEvent};
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Default per-subscriber inbox capacity.
pub const DEFAULT_CAPACITY: usize = 256;

/// Best-effort drain window applied by [`EventBus::shutdown`].
pub const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

/// Diagnostic notices emitted by the bus itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusDiagnostic {
    /// A subscriber's inbox was full; it has been disconnected.
    SlowSubscriberDropped { subscriber: u64, at_seq: u64 },
}

struct SubscriberSlot {
    id: u64,
    tx: mpsc::Sender<EvolutionEvent>,
}

struct BusInner {
    next_seq: u64,
    next_subscriber: u64,
    capacity: usize,
    retain: usize,
    retained: VecDeque<EvolutionEvent>,
    subscribers: Vec<SubscriberSlot>,
    diagnostics: Vec<mpsc::Sender<BusDiagnostic>>,
}

/// A subscriber's receiving end.
pub struct Subscription {
    /// Bus-assigned subscriber id, referenced by diagnostics.
    pub id: u64,
    rx: mpsc::Receiver<EvolutionEvent>,
}

impl Subscription {
    /// Receive the next event; `None` once the bus has disconnected or shut
    /// down this subscriber and the queue is drained.
    pub async fn recv(&mut self) -> Option<EvolutionEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<EvolutionEvent> {
        self.rx.try_recv().ok()
    }

    /// Surrender the underlying receiver, e.g. to wrap it in a
    /// [`tokio_stream::wrappers::ReceiverStream`].
    pub fn into_receiver(self) -> mpsc::Receiver<EvolutionEvent> {
        self.rx
    }
}

/// The run-scoped event bus.  Cloning shares the underlying registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    /// A bus with the given inbox capacity and no replay retention.
    pub fn new(capacity: usize) -> Self {
        Self::with_retention(capacity, 0)
    }

    /// A bus that additionally retains the last `retain` events for
    /// [`subscribe_since`](EventBus::subscribe_since) replay.
    pub fn with_retention(capacity: usize, retain: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                next_seq: 1,
                next_subscriber: 1,
                capacity: capacity.max(1),
                retain,
                retained: VecDeque::new(),
                subscribers: Vec::new(),
                diagnostics: Vec::new(),
            })),
        }
    }

    /// Stamp `kind` with the next sequence number and fan it out to every
    /// subscriber.  Returns the assigned sequence number.
    ///
    /// Subscribers whose inbox is full are disconnected here; survivors are
    /// unaffected and observe no gap.
    pub fn publish(&self, kind: EventKind) -> u64 {
        let mut inner = self.inner.lock().expect("event bus poisoned");
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let event = EvolutionEvent {
            seq,
            timestamp: Utc::now(),
            kind,
        };

        if inner.retain > 0 {
            if inner.retained.len() == inner.retain {
                inner.retained.pop_front();
            }
            inner.retained.push_back(event.clone());
        }

        let mut dropped: Vec<u64> = Vec::new();
        inner.subscribers.retain(|slot| {
            match slot.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped.push(slot.id);
                    false
                }
                // Receiver side already gone; silent removal.
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        for subscriber in dropped {
            log::warn!(
                "event bus: disconnecting slow subscriber {} at seq {}",
                subscriber,
                seq
            );
            let notice = BusDiagnostic::SlowSubscriberDropped {
                subscriber,
                at_seq: seq,
            };
            inner
                .diagnostics
                .retain(|tx| tx.try_send(notice.clone()).is_ok());
        }

        seq
    }

    /// Register a new subscriber with an empty inbox.
    pub fn subscribe(&self) -> Subscription {
        let (replay, subscription) = self.subscribe_since(None);
        debug_assert!(replay.is_empty());
        subscription
    }

    /// Register a new subscriber, returning retained events after the
    /// `since` cursor for replay.
    ///
    /// The replay snapshot and the registration happen under one lock, so
    /// the live stream picks up exactly where the snapshot ends, with no gaps
    /// and no duplicates.
    pub fn subscribe_since(&self, since: Option<u64>) -> (Vec<EvolutionEvent>, Subscription) {
        let mut inner = self.inner.lock().expect("event bus poisoned");
        let cursor = since.unwrap_or(u64::MAX);
        let replay: Vec<EvolutionEvent> = if since.is_some() {
            inner
                .retained
                .iter()
                .filter(|e| e.seq > cursor)
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        let (tx, rx) = mpsc::channel(inner.capacity);
        let id = inner.next_subscriber;
        inner.next_subscriber += 1;
        inner.subscribers.push(SubscriberSlot { id, tx });
        (replay, Subscription { id, rx })
    }

    /// Remove a subscriber explicitly (normally done implicitly by dropping
    /// the [`Subscription`]).
    pub fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().expect("event bus poisoned");
        inner.subscribers.retain(|slot| slot.id != id);
    }

    /// Open a diagnostic channel carrying [`BusDiagnostic`] notices.
    pub fn diagnostics(&self) -> mpsc::Receiver<BusDiagnostic> {
        let (tx, rx) = mpsc::channel(16);
        let mut inner = self.inner.lock().expect("event bus poisoned");
        inner.diagnostics.push(tx);
        rx
    }

    /// Current subscriber count.
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("event bus poisoned").subscribers.len()
    }

    /// Sequence number that will be assigned to the next published event.
    pub fn next_seq(&self) -> u64 {
        self.inner.lock().expect("event bus poisoned").next_seq
    }

    /// Drain pending deliveries with a best-effort deadline, then close all
    /// subscriber channels.
    pub async fn shutdown(&self, drain_deadline: Duration) {
        let deadline = tokio::time::Instant::now() + drain_deadline;
        loop {
            let drained = {
                let inner = self.inner.lock().expect("event bus poisoned");
                inner
                    .subscribers
                    .iter()
                    .all(|slot| slot.tx.capacity() == slot.tx.max_capacity())
            };
            if drained || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let mut inner = self.inner.lock().expect("event bus poisoned");
        inner.subscribers.clear();
        inner.diagnostics.clear();
    }
}
