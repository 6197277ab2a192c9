//! Backends carry strings between the bridge and the runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::bridge::{BackendHandle, BridgeError};
use crate::socket::SocketBackend;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend not ready")]
    NotReady,
    #[error("backend connection closed")]
    Closed,
    #[error("socket backend requires a tokio runtime")]
    NoRuntime,
    #[error("send failed: {0}")]
    Send(String),
}

/// Transport capability used by the bridge's outbound drain.
pub trait Backend: Send + Sync {
    fn ready(&self) -> bool;
    fn send(&self, message: &str) -> Result<(), BackendError>;
}

impl<B: Backend + ?Sized> Backend for Arc<B> {
    fn ready(&self) -> bool {
        (**self).ready()
    }

    fn send(&self, message: &str) -> Result<(), BackendError> {
        (**self).send(message)
    }
}

/// Host-provided function that hands a message to the embedding webview.
pub type NotifyFn = Arc<dyn Fn(&str) -> Result<(), BackendError> + Send + Sync>;

/// Which backend to install.
pub enum BackendKind {
    /// WebSocket to the runtime's web server, derived from the page origin.
    Socket { origin: String },
    /// Webview embedded by the host. Inbound messages arrive via [`BackendHandle::deliver`].
    Embedded { notify: NotifyFn },
}

impl BackendKind {
    pub(crate) fn into_backend(self, handle: BackendHandle) -> Result<Box<dyn Backend>, BridgeError> {
        match self {
            Self::Socket { origin } => {
                let url = websocket_url(&origin)?;
                Ok(Box::new(SocketBackend::connect(url, handle)?))
            }
            Self::Embedded { notify } => Ok(Box::new(EmbeddedBackend::new(notify, handle))),
        }
    }
}

/// `http://host:port` becomes `ws://host:port`, `https://` becomes `wss://`.
pub fn websocket_url(origin: &str) -> Result<String, BridgeError> {
    match origin.strip_prefix("http") {
        Some(rest) if rest.starts_with("://") || rest.starts_with("s://") => Ok(format!("ws{rest}")),
        _ => Err(BridgeError::InvalidOrigin(origin.to_string())),
    }
}

/// Ready after the current scheduling turn.
pub struct EmbeddedBackend {
    ready: Arc<AtomicBool>,
    notify: NotifyFn,
}

impl EmbeddedBackend {
    pub fn new(notify: NotifyFn, handle: BackendHandle) -> Self {
        let ready = Arc::new(AtomicBool::new(false));

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let ready = Arc::clone(&ready);
                runtime.spawn(async move {
                    tokio::task::yield_now().await;
                    ready.store(true, Ordering::Release);
                    handle.notify_ready();
                });
            }
            // No scheduler to defer to; the bridge drains once installed.
            Err(_) => ready.store(true, Ordering::Release),
        }

        Self { ready, notify }
    }
}

impl Backend for EmbeddedBackend {
    fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn send(&self, message: &str) -> Result<(), BackendError> {
        (self.notify)(message)
    }
}
