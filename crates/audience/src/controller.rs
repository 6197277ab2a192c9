//! Controller - typed command API and the serialized event loop.
//!
//! Flow:
//! 1. Split the connected channel into reader and writer
//! 2. Writer goes to the Dispatcher (commands out)
//! 3. Event loop reads one line at a time and routes it (results + events in)
//! 4. On EOF, protocol error or shutdown: fail outstanding commands, close the channel

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::channel::codec::LineCodec;
use crate::channel::protocol::{Event, EventKind, WindowHandle};
use crate::channel::transport::{ChannelReader, ChannelStream};
use crate::dispatcher::{CommandError, CommandReply, Dispatcher};
use crate::router::{EventRouter, SubscriberId};
use crate::types::{Rect, ScreenList, WindowDetails, WindowList};

struct Inner {
    dispatcher: Dispatcher,
    router: EventRouter,
    closed: CancellationToken,
}

/// Handle to a connected runtime. Cheap to clone.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    /// Serve an already connected channel. Must be called within a tokio runtime.
    ///
    /// Cancelling `shutdown` stops the event loop as if the channel had closed.
    pub fn start(stream: ChannelStream, shutdown: CancellationToken) -> Self {
        let ChannelStream { reader, writer } = stream;

        let inner = Arc::new(Inner {
            dispatcher: Dispatcher::new(writer),
            router: EventRouter::new(),
            closed: CancellationToken::new(),
        });

        let reader = FramedRead::new(reader, LineCodec::new());
        tokio::spawn(run_event_loop(reader, Arc::clone(&inner), shutdown));

        Self { inner }
    }

    /// Resolves once the event loop has stopped and outstanding commands were failed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.closed.is_cancelled()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn router(&self) -> &EventRouter {
        &self.inner.router
    }

    // Commands

    pub async fn dispatch(&self, func: &str, args: Option<Value>) -> CommandReply {
        self.inner.dispatcher.dispatch(func, args).await
    }

    pub async fn dispatch_with_timeout(
        &self,
        func: &str,
        args: Option<Value>,
        timeout: Duration,
    ) -> CommandReply {
        self.inner
            .dispatcher
            .dispatch_with_timeout(func, args, timeout)
            .await
    }

    pub async fn screen_list(&self) -> Result<ScreenList, CommandError> {
        decode_result(self.dispatch("screen_list", None).await?)
    }

    pub async fn window_list(&self) -> Result<WindowList, CommandError> {
        decode_result(self.dispatch("window_list", None).await?)
    }

    pub async fn window_create(&self, details: &WindowDetails) -> Result<WindowHandle, CommandError> {
        let args = serde_json::to_value(details)
            .map_err(|e| CommandError::InvalidResult(format!("window details: {e}")))?;
        let handle = decode_result(self.dispatch("window_create", Some(args)).await?)?;
        tracing::info!(%handle, "Window created");
        Ok(handle)
    }

    pub async fn window_update_position(
        &self,
        handle: WindowHandle,
        position: Rect,
    ) -> Result<(), CommandError> {
        let args = json!({
            "handle": handle,
            "x": position.x,
            "y": position.y,
            "width": position.width,
            "height": position.height,
        });
        self.dispatch("window_update_position", Some(args)).await?;
        Ok(())
    }

    pub async fn window_post_message(
        &self,
        handle: WindowHandle,
        message: &str,
    ) -> Result<(), CommandError> {
        let args = json!({ "handle": handle, "message": message });
        self.dispatch("window_post_message", Some(args)).await?;
        Ok(())
    }

    pub async fn window_destroy(&self, handle: WindowHandle) -> Result<(), CommandError> {
        self.dispatch("window_destroy", Some(json!({ "handle": handle })))
            .await?;
        Ok(())
    }

    /// Ask the runtime to quit. It is expected, not enforced, to exit afterwards.
    pub async fn quit(&self) -> Result<(), CommandError> {
        self.dispatch("quit", None).await?;
        Ok(())
    }

    // Events

    pub fn on<F>(&self, kind: EventKind, callback: F) -> SubscriberId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.router.on(kind, callback)
    }

    pub fn subscribe<F>(&self, kinds: &[EventKind], callback: F) -> SubscriberId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.inner.router.subscribe(kinds, callback)
    }

    pub fn off(&self, id: Option<SubscriberId>) {
        self.inner.router.off(id);
    }

    pub fn on_window_message<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(WindowHandle, &str) + Send + Sync + 'static,
    {
        self.on(EventKind::WindowMessage, move |event| {
            if let Event::WindowMessage { handle, message } = event {
                callback(*handle, message);
            }
        })
    }

    pub fn on_window_close_intent<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(WindowHandle) + Send + Sync + 'static,
    {
        self.on(EventKind::WindowCloseIntent, move |event| {
            if let Event::WindowCloseIntent { handle } = event {
                callback(*handle);
            }
        })
    }

    pub fn on_window_close<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(WindowHandle, bool) + Send + Sync + 'static,
    {
        self.on(EventKind::WindowClose, move |event| {
            if let Event::WindowClose {
                handle,
                is_last_window,
            } = event
            {
                callback(*handle, *is_last_window);
            }
        })
    }

    pub fn on_app_quit<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on(EventKind::AppQuit, move |_| callback())
    }
}

fn decode_result<T: DeserializeOwned>(value: Value) -> Result<T, CommandError> {
    serde_json::from_value(value).map_err(|e| CommandError::InvalidResult(e.to_string()))
}

/// Settles outstanding commands and fires `closed` if the event loop unwinds
/// or is aborted before reaching its normal teardown.
struct Teardown(Arc<Inner>);

impl Drop for Teardown {
    fn drop(&mut self) {
        if !self.0.closed.is_cancelled() {
            tracing::error!("Event loop stopped abnormally; closing connection");
            self.0.dispatcher.close();
            self.0.closed.cancel();
        }
    }
}

async fn run_event_loop(
    mut reader: FramedRead<ChannelReader, LineCodec>,
    inner: Arc<Inner>,
    shutdown: CancellationToken,
) {
    let _teardown = Teardown(Arc::clone(&inner));

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::debug!("Channel shutdown requested");
                break;
            }

            msg = reader.next() => {
                match msg {
                    Some(Ok(message)) => {
                        inner.router.route(message, &inner.dispatcher);
                    }
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Channel protocol error; closing connection");
                        break;
                    }
                    None => {
                        tracing::warn!("Channel closed by runtime");
                        break;
                    }
                }
            }
        }
    }

    inner.dispatcher.close();
    inner.dispatcher.shutdown_writer().await;
    inner.closed.cancel();

    tracing::info!("Event loop exiting");
}
