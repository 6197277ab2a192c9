//! WebSocket backend talking to the runtime's built-in web server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::backend::{Backend, BackendError};
use crate::bridge::BackendHandle;

/// Ready once the socket is open. Sends are handed to a writer task.
pub struct SocketBackend {
    open: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<String>,
}

impl SocketBackend {
    /// Start connecting to `url`. Must be called within a tokio runtime.
    pub fn connect(url: String, handle: BackendHandle) -> Result<Self, BackendError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BackendError::NoRuntime)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));

        runtime.spawn(run_socket(url, rx, handle, Arc::clone(&open)));

        Ok(Self { open, tx })
    }
}

impl Backend for SocketBackend {
    fn ready(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Hands `message` to the writer task. `Ok` means queued, not written:
    /// anything still unwritten when the socket fails is requeued on the bridge.
    fn send(&self, message: &str) -> Result<(), BackendError> {
        if !self.ready() {
            return Err(BackendError::NotReady);
        }
        self.tx
            .send(message.to_string())
            .map_err(|_| BackendError::Closed)
    }
}

async fn run_socket(
    url: String,
    mut rx: mpsc::UnboundedReceiver<String>,
    handle: BackendHandle,
    open: Arc<AtomicBool>,
) {
    tracing::debug!(%url, "Connecting message socket");
    let (ws_stream, _) = match connect_async(url.as_str()).await {
        Ok(connected) => connected,
        Err(e) => {
            tracing::error!(%url, error = %e, "Failed to connect message socket");
            handle.notify_closed();
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    open.store(true, Ordering::Release);
    handle.notify_ready();

    let mut unsent = Vec::new();
    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                let Some(text) = outgoing else { break };
                if let Err(e) = ws_sender.send(Message::Text(text.clone())).await {
                    tracing::error!(error = %e, "Message socket write failed");
                    unsent.push(text);
                    break;
                }
            }

            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = handle.deliver(text) {
                        tracing::warn!(error = %e, "Dropping inbound message");
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if let Err(e) = handle.deliver(data) {
                        tracing::warn!(error = %e, "Dropping inbound message");
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::error!(error = %e, "Message socket read failed");
                    break;
                }
            },
        }
    }

    open.store(false, Ordering::Release);
    rx.close();
    while let Ok(text) = rx.try_recv() {
        unsent.push(text);
    }
    handle.requeue(unsent);
    handle.notify_closed();
    tracing::debug!("Message socket closed");
}
