//! Event router - demultiplexes runtime messages.
//!
//! Command results go to the [`Dispatcher`]; events fan out to the subscribers
//! registered for their category. The subscriber list is snapshotted before
//! fan-out, so a callback may (un)subscribe from inside its own invocation.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use crate::channel::protocol::{CommandResult, Event, EventKind, Message};
use crate::dispatcher::Dispatcher;

pub type EventCallback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Identity of a registered callback, shared across all categories it subscribed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Subscribers = HashMap<EventKind, Vec<(SubscriberId, EventCallback)>>;

#[derive(Default)]
pub struct EventRouter {
    next_id: AtomicU64,
    subscribers: StdMutex<Subscribers>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Subscriber registry mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Register `callback` for a single event category.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> SubscriberId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(&[kind], callback)
    }

    /// Register one callback identity for several categories.
    pub fn subscribe<F>(&self, kinds: &[EventKind], callback: F) -> SubscriberId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let callback: EventCallback = Arc::new(callback);

        let mut subscribers = self.lock();
        for kind in kinds {
            let set = subscribers.entry(*kind).or_default();
            if !set.iter().any(|(existing, _)| *existing == id) {
                set.push((id, Arc::clone(&callback)));
            }
        }
        tracing::trace!(subscriber = %id, ?kinds, "Subscribed");
        id
    }

    /// Remove `id` from every category, or clear every category when `None`.
    pub fn off(&self, id: Option<SubscriberId>) {
        let mut subscribers = self.lock();
        match id {
            Some(id) => {
                for set in subscribers.values_mut() {
                    set.retain(|(existing, _)| *existing != id);
                }
                tracing::trace!(subscriber = %id, "Unsubscribed");
            }
            None => {
                subscribers.clear();
                tracing::trace!("Cleared all subscribers");
            }
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.lock().get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Process one inbound message. Returns once every subscriber has seen it.
    pub fn route(&self, message: Message, dispatcher: &Dispatcher) {
        match message {
            Message::Result(CommandResult::Succeeded { id, result }) => {
                dispatcher.resolve(&id, result);
            }
            Message::Result(CommandResult::Failed { id, reason }) => {
                if let Some(ref reason) = reason {
                    tracing::debug!(%id, %reason, "Runtime reported command failure");
                }
                dispatcher.reject(&id, reason);
            }
            Message::Event(event) => self.publish(&event),
            Message::Unknown { name, .. } => {
                tracing::trace!(%name, "Ignoring unknown runtime message");
            }
            Message::Command(command) => {
                tracing::warn!(id = %command.id, func = %command.func, "Runtime sent a command; ignoring");
            }
        }
    }

    /// Invoke every subscriber of the event's category.
    ///
    /// A panicking subscriber is logged and skipped; the rest still run.
    pub fn publish(&self, event: &Event) {
        let kind = event.kind();
        let snapshot: Vec<EventCallback> = self
            .lock()
            .get(&kind)
            .map(|set| set.iter().map(|(_, cb)| Arc::clone(cb)).collect())
            .unwrap_or_default();

        tracing::trace!(event = %kind, subscribers = snapshot.len(), "Publishing event");
        for callback in snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
                tracing::error!(event = %kind, panic = panic_message(&*panic), "Event subscriber panicked");
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
