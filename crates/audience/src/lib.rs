//! audience: host-side control plane for the Audience desktop runtime.
//!
//! The host spawns the native runtime, accepts its single channel connection
//! and then drives it with correlated commands while routing its events.

pub mod channel;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod router;
pub mod supervisor;
pub mod types;

pub use channel::protocol::{Command, CommandResult, Event, EventKind, Message, WindowHandle};
pub use config::{ConfigError, LaunchOptions, Nucleus, Platform};
pub use controller::Controller;
pub use dispatcher::{CommandError, CommandReply, Dispatcher};
pub use router::{EventRouter, SubscriberId};
pub use supervisor::{
    ExitSignal, LaunchError, ProcessSpawner, RuntimeExit, RuntimeSpawner, Session, SpawnError,
    SpawnRequest, launch,
};
pub use tokio_util::sync::CancellationToken;
pub use types::{Rect, Screen, ScreenList, Size, WebApp, WindowDetails, WindowInfo, WindowList};
