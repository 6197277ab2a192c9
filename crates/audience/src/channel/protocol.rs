//! Wire protocol types for host-runtime communication.
//!
//! Every message is a single JSON object on its own line:
//! - **Commands** (host → runtime): `{"id", "func", "args"?}`
//! - **Runtime messages** (runtime → host): `{"name", "data"}`, which are either
//!   command results (`command_succeeded` / `command_failed`) or events.
//!
//! Lines are classified once here so nothing downstream re-inspects raw fields.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Handle of a window owned by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowHandle(u64);

impl WindowHandle {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for WindowHandle {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for WindowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Command directive sent to the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub func: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

/// Outcome of a previously issued command, correlated by `id`.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    Succeeded {
        id: String,
        result: Value,
    },
    /// `reason` is only sent by runtimes that report failure detail.
    Failed {
        id: String,
        reason: Option<String>,
    },
}

impl CommandResult {
    pub fn id(&self) -> &str {
        match self {
            Self::Succeeded { id, .. } | Self::Failed { id, .. } => id,
        }
    }
}

/// Event categories a subscriber can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WindowMessage,
    WindowCloseIntent,
    WindowClose,
    AppQuit,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::WindowMessage,
        EventKind::WindowCloseIntent,
        EventKind::WindowClose,
        EventKind::AppQuit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WindowMessage => "window_message",
            Self::WindowCloseIntent => "window_close_intent",
            Self::WindowClose => "window_close",
            Self::AppQuit => "app_quit",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fire-and-forget notification from the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    WindowMessage {
        handle: WindowHandle,
        message: String,
    },
    WindowCloseIntent {
        handle: WindowHandle,
    },
    WindowClose {
        handle: WindowHandle,
        is_last_window: bool,
    },
    AppQuit,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::WindowMessage { .. } => EventKind::WindowMessage,
            Self::WindowCloseIntent { .. } => EventKind::WindowCloseIntent,
            Self::WindowClose { .. } => EventKind::WindowClose,
            Self::AppQuit => EventKind::AppQuit,
        }
    }

    fn data(&self) -> Value {
        match self {
            Self::WindowMessage { handle, message } => {
                json!({ "handle": handle, "message": message })
            }
            Self::WindowCloseIntent { handle } => json!({ "handle": handle }),
            Self::WindowClose {
                handle,
                is_last_window,
            } => json!({ "handle": handle, "is_last_window": is_last_window }),
            Self::AppQuit => json!({}),
        }
    }
}

/// One decoded line of the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Command(Command),
    Result(CommandResult),
    Event(Event),
    /// Runtime message with a name this host does not know.
    Unknown { name: String, data: Value },
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("line is neither a command nor a runtime message")]
    UnrecognizedShape,
    #[error("invalid data for {name}: {source}")]
    InvalidData {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Superset of every field either direction may carry.
#[derive(Deserialize)]
struct RawMessage {
    id: Option<String>,
    func: Option<String>,
    args: Option<Value>,
    name: Option<String>,
    data: Option<Value>,
}

#[derive(Serialize)]
struct Envelope<'a> {
    name: &'a str,
    data: Value,
}

#[derive(Deserialize)]
struct SucceededData {
    id: String,
    #[serde(default)]
    result: Value,
}

#[derive(Deserialize)]
struct FailedData {
    id: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct WindowMessageData {
    handle: WindowHandle,
    message: String,
}

#[derive(Deserialize)]
struct HandleData {
    handle: WindowHandle,
}

#[derive(Deserialize)]
struct WindowCloseData {
    handle: WindowHandle,
    is_last_window: bool,
}

fn parse_data<T: DeserializeOwned>(name: &str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::InvalidData {
        name: name.to_string(),
        source,
    })
}

impl Message {
    /// Classify a single line (without its trailing newline).
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let raw: RawMessage = serde_json::from_str(line)?;

        if let (Some(id), Some(func)) = (raw.id, raw.func) {
            return Ok(Message::Command(Command {
                id,
                func,
                args: raw.args,
            }));
        }

        let Some(name) = raw.name else {
            return Err(ProtocolError::UnrecognizedShape);
        };
        // app_quit carries an empty payload; tolerate runtimes that omit it.
        let data = raw.data.unwrap_or(Value::Null);

        let message = match name.as_str() {
            "command_succeeded" => {
                let SucceededData { id, result } = parse_data(&name, data)?;
                Message::Result(CommandResult::Succeeded { id, result })
            }
            "command_failed" => {
                let FailedData { id, reason } = parse_data(&name, data)?;
                Message::Result(CommandResult::Failed { id, reason })
            }
            other => match EventKind::from_name(other) {
                Some(EventKind::WindowMessage) => {
                    let WindowMessageData { handle, message } = parse_data(&name, data)?;
                    Message::Event(Event::WindowMessage { handle, message })
                }
                Some(EventKind::WindowCloseIntent) => {
                    let HandleData { handle } = parse_data(&name, data)?;
                    Message::Event(Event::WindowCloseIntent { handle })
                }
                Some(EventKind::WindowClose) => {
                    let WindowCloseData {
                        handle,
                        is_last_window,
                    } = parse_data(&name, data)?;
                    Message::Event(Event::WindowClose {
                        handle,
                        is_last_window,
                    })
                }
                Some(EventKind::AppQuit) => Message::Event(Event::AppQuit),
                None => Message::Unknown { name, data },
            },
        };

        Ok(message)
    }

    /// Serialize to a single line of JSON, without the trailing newline.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        match self {
            Message::Command(command) => serde_json::to_string(command),
            Message::Result(CommandResult::Succeeded { id, result }) => {
                serde_json::to_string(&Envelope {
                    name: "command_succeeded",
                    data: json!({ "id": id, "result": result }),
                })
            }
            Message::Result(CommandResult::Failed { id, reason }) => {
                let data = match reason {
                    Some(reason) => json!({ "id": id, "reason": reason }),
                    None => json!({ "id": id }),
                };
                serde_json::to_string(&Envelope {
                    name: "command_failed",
                    data,
                })
            }
            Message::Event(event) => serde_json::to_string(&Envelope {
                name: event.kind().as_str(),
                data: event.data(),
            }),
            Message::Unknown { name, data } => serde_json::to_string(&Envelope {
                name,
                data: data.clone(),
            }),
        }
    }
}

impl From<Command> for Message {
    fn from(command: Command) -> Self {
        Message::Command(command)
    }
}

impl From<CommandResult> for Message {
    fn from(result: CommandResult) -> Self {
        Message::Result(result)
    }
}

impl From<Event> for Message {
    fn from(event: Event) -> Self {
        Message::Event(event)
    }
}
