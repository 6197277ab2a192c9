//! Command dispatcher - issues correlated commands and settles their replies.
//!
//! Every outstanding command lives in the pending table keyed by its id until
//! exactly one result (or a disconnect) retires it. Id allocation and insertion
//! happen under a single DashMap entry lock, so concurrent dispatches never
//! share an id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::SinkExt;
use rand::Rng;
use serde_json::Value;
use tokio::sync::{Mutex, oneshot};
use tokio_util::codec::FramedWrite;

use crate::channel::codec::LineCodec;
use crate::channel::protocol::{Command, Message};
use crate::channel::transport::ChannelWriter;

/// Largest random step added to a colliding id.
const ID_COLLISION_STEP: i64 = 100;

pub type CommandReply = Result<Value, CommandError>;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Runtime reported failure. `reason` is absent for runtimes that send no detail.
    #[error("command failed: {}", .reason.as_deref().unwrap_or("no reason given"))]
    Failed { reason: Option<String> },
    #[error("failed to write command: {0}")]
    Transport(String),
    #[error("runtime channel disconnected")]
    Disconnected,
    #[error("command timed out after {0:?}")]
    TimedOut(Duration),
    #[error("unexpected command result: {0}")]
    InvalidResult(String),
}

/// Host-side command dispatcher.
pub struct Dispatcher {
    pending: DashMap<String, oneshot::Sender<CommandReply>>,
    writer: Mutex<FramedWrite<ChannelWriter, LineCodec>>,
    disconnected: AtomicBool,
}

impl Dispatcher {
    pub fn new(writer: ChannelWriter) -> Self {
        Self {
            pending: DashMap::new(),
            writer: Mutex::new(FramedWrite::new(writer, LineCodec::new())),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Issue `func` and wait for its result. Never completes if the runtime stays silent.
    pub async fn dispatch(&self, func: &str, args: Option<Value>) -> CommandReply {
        let mut reply = self.register()?;
        self.send(reply.id(), func, args).await?;

        reply.recv().await
    }

    /// Like [`dispatch`](Self::dispatch), but retires the command when `timeout` elapses.
    pub async fn dispatch_with_timeout(
        &self,
        func: &str,
        args: Option<Value>,
        timeout: Duration,
    ) -> CommandReply {
        let mut reply = self.register()?;
        self.send(reply.id(), func, args).await?;

        match tokio::time::timeout(timeout, reply.recv()).await {
            Ok(reply) => reply,
            Err(_) => {
                tracing::warn!(id = %reply.id(), func, ?timeout, "Command timed out");
                Err(CommandError::TimedOut(timeout))
            }
        }
    }

    /// Allocate a free id and insert the pending entry atomically.
    ///
    /// The entry is retired when the returned guard is dropped unless a result
    /// settled it first.
    pub(crate) fn register(&self) -> Result<PendingReply<'_>, CommandError> {
        if self.is_disconnected() {
            return Err(CommandError::Disconnected);
        }

        let (tx, rx) = oneshot::channel();
        let mut candidate = chrono::Utc::now().timestamp_millis();
        let mut rng = rand::thread_rng();

        let id = loop {
            match self.pending.entry(candidate.to_string()) {
                Entry::Vacant(slot) => {
                    let id = slot.key().clone();
                    slot.insert(tx);
                    break id;
                }
                Entry::Occupied(_) => {
                    candidate += rng.gen_range(0..=ID_COLLISION_STEP);
                }
            }
        };

        let reply = PendingReply {
            pending: &self.pending,
            id,
            rx: Some(rx),
        };

        // Lost a race with close(): nobody will ever settle this entry.
        if self.is_disconnected() {
            return Err(CommandError::Disconnected);
        }

        Ok(reply)
    }

    async fn send(&self, id: &str, func: &str, args: Option<Value>) -> Result<(), CommandError> {
        tracing::debug!(%id, func, "Dispatching command");
        let command = Command {
            id: id.to_string(),
            func: func.to_string(),
            args,
        };

        let result = {
            let mut writer = self.writer.lock().await;
            writer.send(Message::Command(command)).await
        };

        result.map_err(|e| {
            tracing::error!(%id, func, error = %e, "Failed to write command");
            CommandError::Transport(e.to_string())
        })
    }

    /// Settle a pending command successfully. Returns false for unknown ids.
    pub fn resolve(&self, id: &str, result: Value) -> bool {
        self.settle(id, Ok(result))
    }

    /// Settle a pending command as failed. Returns false for unknown ids.
    pub fn reject(&self, id: &str, reason: Option<String>) -> bool {
        self.settle(id, Err(CommandError::Failed { reason }))
    }

    fn settle(&self, id: &str, reply: CommandReply) -> bool {
        match self.pending.remove(id) {
            Some((_, tx)) => {
                let ok = reply.is_ok();
                if tx.send(reply).is_err() {
                    tracing::debug!(%id, "Command caller went away before result arrived");
                }
                tracing::debug!(%id, ok, "Command settled");
                true
            }
            None => {
                tracing::trace!(%id, "Dropping result for unknown command id");
                false
            }
        }
    }

    /// Fail every outstanding command and refuse new ones.
    pub fn close(&self) {
        self.disconnected.store(true, Ordering::Release);

        let ids: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        if !ids.is_empty() {
            tracing::warn!(count = ids.len(), "Failing outstanding commands: channel closed");
        }
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(CommandError::Disconnected));
            }
        }
    }

    /// Flush and half-close the write side so the runtime observes EOF.
    pub async fn shutdown_writer(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = SinkExt::<Message>::close(&mut *writer).await {
            tracing::debug!(error = %e, "Channel writer already closed");
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }
}

/// Receiving half of a registered command.
///
/// Dropping it before a result arrives removes the pending entry, whether the
/// command was written or the caller gave up while waiting for the writer.
pub(crate) struct PendingReply<'a> {
    pending: &'a DashMap<String, oneshot::Sender<CommandReply>>,
    id: String,
    rx: Option<oneshot::Receiver<CommandReply>>,
}

impl PendingReply<'_> {
    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) async fn recv(&mut self) -> CommandReply {
        match self.rx.as_mut() {
            Some(rx) => rx.await.unwrap_or(Err(CommandError::Disconnected)),
            None => Err(CommandError::Disconnected),
        }
    }
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        drop(self.rx.take());
        // Only our own sender is closed now; a reused id belongs to a live caller.
        if self
            .pending
            .remove_if(&self.id, |_, tx| tx.is_closed())
            .is_some()
        {
            tracing::trace!(id = %self.id, "Retired abandoned command");
        }
    }
}
