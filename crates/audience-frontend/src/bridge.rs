//! Message bridge - buffered, ordered exchange of strings with the runtime.
//!
//! Two FIFO queues decouple the page from the backend:
//! - outbound drains while the backend is ready, stopping on the first failed send
//! - inbound drains while at least one handler is registered, stopping on the
//!   first failing handler
//!
//! A message leaves its queue only after it was fully handled, so a stalled
//! drain resumes with the same head on the next trigger. Each drain runs under
//! its own guard; a trigger that finds the guard taken leaves the work to the
//! running drain, which re-checks its queue before giving the guard up.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use crate::backend::{Backend, BackendError, BackendKind};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type MessageHandler = Arc<dyn Fn(&str) -> Result<(), HandlerError> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("double initialization of message bridge detected")]
    AlreadyInstalled,
    #[error("only string messages are supported")]
    NonStringPayload,
    #[error("invalid page origin {0:?}")]
    InvalidOrigin(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// A message as it arrives from the page or a backend. Only text is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

impl Payload {
    fn into_text(self) -> Result<String, BridgeError> {
        match self {
            Self::Text(text) => Ok(text),
            Self::Binary(_) => Err(BridgeError::NonStringPayload),
        }
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Self::Binary(data)
    }
}

impl From<&[u8]> for Payload {
    fn from(data: &[u8]) -> Self {
        Self::Binary(data.to_vec())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BridgeState {
    Connecting = 0,
    Ready = 1,
    Closed = 2,
}

impl BridgeState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Ready,
            2 => Self::Closed,
            _ => Self::Connecting,
        }
    }
}

/// Scope in which at most one bridge may be installed.
#[derive(Default)]
pub struct BridgeContext {
    installed: AtomicBool,
}

impl BridgeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    pub fn install(&self, kind: BackendKind) -> Result<MessageBridge, BridgeError> {
        self.install_with(|handle| kind.into_backend(handle))
    }

    /// Install with a custom backend built from the bridge's [`BackendHandle`].
    pub fn install_with<F>(&self, factory: F) -> Result<MessageBridge, BridgeError>
    where
        F: FnOnce(BackendHandle) -> Result<Box<dyn Backend>, BridgeError>,
    {
        if self
            .installed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::error!("Message bridge already installed in this context");
            return Err(BridgeError::AlreadyInstalled);
        }

        let shared = Arc::new(Shared::default());
        let handle = BackendHandle {
            shared: Arc::downgrade(&shared),
        };

        let backend = match factory(handle) {
            Ok(backend) => backend,
            Err(e) => {
                self.installed.store(false, Ordering::Release);
                return Err(e);
            }
        };

        if shared.backend.set(backend).is_err() {
            // Unreachable: the cell was created above and nobody else can see it.
            return Err(BridgeError::AlreadyInstalled);
        }

        if shared.backend_ready() {
            shared.set_state(BridgeState::Ready);
        }
        shared.drain_outbound();

        tracing::debug!("Message bridge installed");
        Ok(MessageBridge { shared })
    }
}

/// Page-facing API of an installed bridge. Cheap to clone.
#[derive(Clone)]
pub struct MessageBridge {
    shared: Arc<Shared>,
}

impl MessageBridge {
    /// Queue `message` for the runtime and drain what the backend accepts.
    pub fn post_message(&self, message: impl Into<Payload>) -> Result<(), BridgeError> {
        let text = message.into().into_text()?;
        lock(&self.shared.outbound).push_back(text);
        self.shared.drain_outbound();
        Ok(())
    }

    /// Register a handler. Messages that queued up while nobody listened are delivered now.
    pub fn on_message<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&str) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = HandlerId(self.shared.next_handler.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.handlers).push((id, Arc::new(handler)));
        self.shared.drain_inbound();
        id
    }

    /// Remove one handler, or every handler when `id` is `None`.
    pub fn off_message(&self, id: Option<HandlerId>) {
        {
            let mut handlers = lock(&self.shared.handlers);
            match id {
                Some(id) => handlers.retain(|(existing, _)| *existing != id),
                None => handlers.clear(),
            }
        }
        self.shared.drain_inbound();
    }

    pub fn state(&self) -> BridgeState {
        BridgeState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Handle a backend (or embedding host) uses to report readiness and deliver messages.
    pub fn handle(&self) -> BackendHandle {
        BackendHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn outbound_len(&self) -> usize {
        lock(&self.shared.outbound).len()
    }

    pub fn inbound_len(&self) -> usize {
        lock(&self.shared.inbound).len()
    }
}

/// Backend side of the bridge. Holds no strong reference; calls after the
/// bridge is dropped are ignored.
#[derive(Clone)]
pub struct BackendHandle {
    shared: Weak<Shared>,
}

impl BackendHandle {
    pub fn notify_ready(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.set_state(BridgeState::Ready);
            shared.drain_outbound();
        }
    }

    pub fn notify_closed(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.set_state(BridgeState::Closed);
            tracing::warn!(
                pending = lock(&shared.outbound).len(),
                "Backend closed; outbound messages retained"
            );
        }
    }

    /// Put messages the backend accepted but never delivered back at the head
    /// of the outbound queue, oldest first.
    pub fn requeue(&self, messages: Vec<String>) {
        if messages.is_empty() {
            return;
        }
        match self.shared.upgrade() {
            Some(shared) => {
                tracing::debug!(count = messages.len(), "Requeueing undelivered messages");
                {
                    let mut outbound = lock(&shared.outbound);
                    for message in messages.into_iter().rev() {
                        outbound.push_front(message);
                    }
                }
                shared.drain_outbound();
            }
            None => tracing::trace!(count = messages.len(), "Dropping undelivered messages: bridge gone"),
        }
    }

    /// Queue an inbound message and fan it out if anyone is listening.
    pub fn deliver(&self, message: impl Into<Payload>) -> Result<(), BridgeError> {
        let text = message.into().into_text()?;
        match self.shared.upgrade() {
            Some(shared) => {
                lock(&shared.inbound).push_back(text);
                shared.drain_inbound();
            }
            None => tracing::trace!("Dropping inbound message: bridge gone"),
        }
        Ok(())
    }
}

#[derive(Default)]
struct Shared {
    backend: OnceLock<Box<dyn Backend>>,
    state: AtomicU8,
    outbound: Mutex<VecDeque<String>>,
    inbound: Mutex<VecDeque<String>>,
    handlers: Mutex<Vec<(HandlerId, MessageHandler)>>,
    next_handler: AtomicU64,
    draining_out: AtomicBool,
    draining_in: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("Bridge mutex poisoned - recovering");
            poisoned.into_inner()
        }
    }
}

impl Shared {
    fn set_state(&self, state: BridgeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn backend_ready(&self) -> bool {
        self.backend.get().is_some_and(|b| b.ready())
    }

    fn drain_outbound(&self) {
        loop {
            if self.draining_out.swap(true, Ordering::AcqRel) {
                return;
            }
            let stalled = self.pump_outbound();
            self.draining_out.store(false, Ordering::Release);

            if stalled || !self.backend_ready() || lock(&self.outbound).is_empty() {
                return;
            }
        }
    }

    /// Returns true when a send failed and the drain should wait for the next trigger.
    fn pump_outbound(&self) -> bool {
        let Some(backend) = self.backend.get() else {
            return false;
        };

        while backend.ready() {
            let Some(message) = lock(&self.outbound).front().cloned() else {
                return false;
            };

            match backend.send(&message) {
                Ok(()) => {
                    lock(&self.outbound).pop_front();
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to send message to backend; will retry");
                    return true;
                }
            }
        }
        false
    }

    fn drain_inbound(&self) {
        loop {
            if self.draining_in.swap(true, Ordering::AcqRel) {
                return;
            }
            let stalled = self.pump_inbound();
            self.draining_in.store(false, Ordering::Release);

            if stalled || lock(&self.handlers).is_empty() || lock(&self.inbound).is_empty() {
                return;
            }
        }
    }

    fn pump_inbound(&self) -> bool {
        loop {
            let snapshot: Vec<MessageHandler> = lock(&self.handlers)
                .iter()
                .map(|(_, handler)| Arc::clone(handler))
                .collect();
            if snapshot.is_empty() {
                return false;
            }

            let Some(message) = lock(&self.inbound).front().cloned() else {
                return false;
            };

            for handler in snapshot {
                if let Err(e) = handler(&message) {
                    tracing::error!(error = %e, "Message handler failed; will retry");
                    return true;
                }
            }
            lock(&self.inbound).pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockBackend {
        ready: AtomicBool,
        failing: AtomicBool,
        sent: Mutex<Vec<String>>,
    }

    impl MockBackend {
        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Backend for MockBackend {
        fn ready(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        fn send(&self, message: &str) -> Result<(), BackendError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(BackendError::Send("mock failure".into()));
            }
            self.sent.lock().unwrap().push(message.to_string());
            Ok(())
        }
    }

    fn install(ready: bool) -> (MessageBridge, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::default());
        backend.ready.store(ready, Ordering::SeqCst);
        let bridge = BridgeContext::new()
            .install_with(|_| Ok(Box::new(Arc::clone(&backend))))
            .unwrap();
        (bridge, backend)
    }

    fn recorder(bridge: &MessageBridge) -> (HandlerId, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let id = bridge.on_message({
            let seen = Arc::clone(&seen);
            move |m| {
                seen.lock().unwrap().push(m.to_string());
                Ok(())
            }
        });
        (id, seen)
    }

    #[test]
    fn outbound_is_fifo_and_waits_for_readiness() {
        let (bridge, backend) = install(false);
        assert_eq!(bridge.state(), BridgeState::Connecting);

        for m in ["a", "b", "c"] {
            bridge.post_message(m).unwrap();
        }
        assert!(backend.sent().is_empty());
        assert_eq!(bridge.outbound_len(), 3);

        backend.ready.store(true, Ordering::SeqCst);
        bridge.handle().notify_ready();

        assert_eq!(backend.sent(), ["a", "b", "c"]);
        assert_eq!(bridge.outbound_len(), 0);
        assert_eq!(bridge.state(), BridgeState::Ready);
    }

    #[test]
    fn failed_send_pauses_and_resumes_in_order() {
        let (bridge, backend) = install(true);

        bridge.post_message("a").unwrap();
        backend.failing.store(true, Ordering::SeqCst);
        bridge.post_message("b").unwrap();
        bridge.post_message("c").unwrap();

        assert_eq!(backend.sent(), ["a"]);
        assert_eq!(bridge.outbound_len(), 2);

        backend.failing.store(false, Ordering::SeqCst);
        bridge.post_message("d").unwrap();

        assert_eq!(backend.sent(), ["a", "b", "c", "d"]);
        assert_eq!(bridge.outbound_len(), 0);
    }

    #[test]
    fn inbound_waits_for_first_handler() {
        let (bridge, _backend) = install(true);
        let handle = bridge.handle();

        handle.deliver("x").unwrap();
        handle.deliver("y").unwrap();
        assert_eq!(bridge.inbound_len(), 2);

        let (_, seen) = recorder(&bridge);
        assert_eq!(*seen.lock().unwrap(), ["x", "y"]);
        assert_eq!(bridge.inbound_len(), 0);
    }

    #[test]
    fn fans_out_to_every_handler_once() {
        let (bridge, _backend) = install(true);
        let recorders: Vec<_> = (0..3).map(|_| recorder(&bridge)).collect();

        bridge.handle().deliver("m").unwrap();

        for (_, seen) in &recorders {
            assert_eq!(*seen.lock().unwrap(), ["m"]);
        }
    }

    #[test]
    fn failing_handler_retains_message() {
        let (bridge, _backend) = install(true);
        let attempts = Arc::new(AtomicUsize::new(0));

        let failing = bridge.on_message({
            let attempts = Arc::clone(&attempts);
            move |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err("not yet".into())
            }
        });

        bridge.handle().deliver("m").unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(bridge.inbound_len(), 1);

        bridge.off_message(Some(failing));
        let (_, seen) = recorder(&bridge);
        assert_eq!(*seen.lock().unwrap(), ["m"]);
        assert_eq!(bridge.inbound_len(), 0);
    }

    #[test]
    fn off_message_without_id_clears_all() {
        let (bridge, _backend) = install(true);
        let (_, a) = recorder(&bridge);
        let (_, b) = recorder(&bridge);

        bridge.off_message(None);
        bridge.handle().deliver("late").unwrap();

        assert!(a.lock().unwrap().is_empty());
        assert!(b.lock().unwrap().is_empty());
        assert_eq!(bridge.inbound_len(), 1);
    }

    #[test]
    fn second_install_in_same_context_fails() {
        let context = BridgeContext::new();
        let factory = |_: BackendHandle| -> Result<Box<dyn Backend>, BridgeError> {
            Ok(Box::new(Arc::new(MockBackend::default())))
        };

        // Not ready, so posts stay queued.
        let first = context.install_with(factory).unwrap();
        let (_, seen) = recorder(&first);
        first.post_message("queued").unwrap();

        assert!(matches!(
            context.install_with(factory),
            Err(BridgeError::AlreadyInstalled)
        ));
        assert!(context.is_installed());
        assert_eq!(first.outbound_len(), 1);
        assert_eq!(first.inbound_len(), 0);
        assert_eq!(first.state(), BridgeState::Connecting);

        first.handle().deliver("m").unwrap();
        assert_eq!(*seen.lock().unwrap(), ["m"]);

        assert!(BridgeContext::new().install_with(factory).is_ok());
    }

    #[test]
    fn failed_backend_construction_allows_retry() {
        let context = BridgeContext::new();
        let result = context.install(BackendKind::Socket {
            origin: "file:///index.html".into(),
        });
        assert!(matches!(result, Err(BridgeError::InvalidOrigin(_))));
        assert!(!context.is_installed());
    }

    #[test]
    fn binary_payloads_are_rejected_and_never_queued() {
        let (bridge, backend) = install(false);
        let (_, seen) = recorder(&bridge);

        assert!(matches!(
            bridge.post_message(vec![1u8, 2, 3]),
            Err(BridgeError::NonStringPayload)
        ));
        assert!(matches!(
            bridge.handle().deliver(&b"raw"[..]),
            Err(BridgeError::NonStringPayload)
        ));

        assert_eq!(bridge.outbound_len(), 0);
        assert_eq!(bridge.inbound_len(), 0);
        assert!(backend.sent().is_empty());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn handler_may_post_and_subscribe_reentrantly() {
        let (bridge, backend) = install(true);
        let late = Arc::new(Mutex::new(Vec::new()));

        bridge.on_message({
            let bridge = bridge.clone();
            let late = Arc::clone(&late);
            let subscribed = AtomicBool::new(false);
            move |m| {
                bridge.post_message(format!("ack:{m}"))?;
                if !subscribed.swap(true, Ordering::SeqCst) {
                    let late = Arc::clone(&late);
                    bridge.on_message(move |m| {
                        late.lock().unwrap().push(m.to_string());
                        Ok(())
                    });
                }
                Ok(())
            }
        });

        let handle = bridge.handle();
        handle.deliver("one").unwrap();
        handle.deliver("two").unwrap();

        assert_eq!(backend.sent(), ["ack:one", "ack:two"]);
        // Registered while "one" was fanning out: sees only later messages.
        assert_eq!(*late.lock().unwrap(), ["two"]);
        assert_eq!(bridge.inbound_len(), 0);
    }

    #[test]
    fn closed_backend_keeps_outbound_messages() {
        let (bridge, backend) = install(true);
        backend.ready.store(false, Ordering::SeqCst);
        bridge.handle().notify_closed();

        bridge.post_message("kept").unwrap();
        assert_eq!(bridge.state(), BridgeState::Closed);
        assert_eq!(bridge.outbound_len(), 1);
    }

    #[test]
    fn requeued_messages_go_ahead_of_later_posts() {
        let (bridge, backend) = install(false);
        bridge.post_message("later").unwrap();

        bridge
            .handle()
            .requeue(vec!["first".to_string(), "second".to_string()]);
        assert_eq!(bridge.outbound_len(), 3);

        backend.ready.store(true, Ordering::SeqCst);
        bridge.handle().notify_ready();

        assert_eq!(backend.sent(), ["first", "second", "later"]);
        assert_eq!(bridge.outbound_len(), 0);
    }

    #[test]
    fn handle_outliving_bridge_is_inert() {
        let (bridge, _backend) = install(true);
        let handle = bridge.handle();
        drop(bridge);

        assert!(handle.deliver("nobody").is_ok());
        handle.notify_ready();
    }
}
