// src/events.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::types::Event;

#[derive(Default)]
struct Subscribers {
    senders: HashMap<u64, mpsc::Sender<Event>>,
    next_id: u64,
    /// Set once the fan-out loop exits; later subscriptions start closed.
    closed: bool,
}

struct Shared {
    subscribers: Mutex<Subscribers>,
    capacity: usize,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn remove(&self, id: u64) {
        self.lock().senders.remove(&id);
    }
}

/// Publish/subscribe hub.
///
/// `publish` never waits: events go into a bounded inbound queue drained by
/// [`EventStream::run`], which copies each one into every subscriber's own
/// bounded queue. A full subscriber queue drops the newest event for that
/// subscriber only; a closed one is pruned.
#[derive(Clone)]
pub struct EventStream {
    tx: mpsc::Sender<Event>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Event>>>,
    shared: Arc<Shared>,
}

impl EventStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            shared: Arc::new(Shared {
                subscribers: Mutex::new(Subscribers::default()),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Returns false when the event was dropped at the inbound queue.
    pub fn publish(&self, event: Event) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "event hub full, dropping event");
                false
            }
        }
    }

    /// A subscription taken after the hub has stopped is already ended.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.shared.capacity);
        let mut subs = self.shared.lock();
        subs.next_id += 1;
        let id = subs.next_id;
        if subs.closed {
            debug!(id, "event hub stopped, subscription closed");
        } else {
            subs.senders.insert(id, tx);
            debug!(id, "event subscriber added");
        }
        Subscription { id, rx, hub: Arc::downgrade(&self.shared) }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.lock().senders.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    fn fan_out(&self, event: Event) {
        let mut subs = self.shared.lock();
        subs.senders.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(id, "subscriber queue full, event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Fan-out loop. Every subscription ends when this returns.
    pub async fn run(self, cancel: CancellationToken) {
        let mut rx = self.rx.lock().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(event) => self.fan_out(event),
                    None => break,
                },
            }
        }
        rx.close();
        {
            let mut subs = self.shared.lock();
            subs.closed = true;
            subs.senders.clear();
        }
        info!("event stream stopped");
    }
}

/// A subscriber's feed. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
    hub: Weak<Shared>,
}

impl Subscription {
    /// `None` once the hub has shut down.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
        }
    }
}
