//! audience-frontend: message bridge for web content shown by the audience runtime.
//!
//! ```no_run
//! use audience_frontend::{BackendKind, BridgeContext};
//!
//! # async fn demo() -> Result<(), audience_frontend::BridgeError> {
//! let context = BridgeContext::new();
//! let bridge = context.install(BackendKind::Socket {
//!     origin: "http://127.0.0.1:4711".into(),
//! })?;
//!
//! bridge.on_message(|message| {
//!     println!("runtime says {message}");
//!     Ok(())
//! });
//! bridge.post_message("hello")?;
//! # Ok(())
//! # }
//! ```

mod backend;
mod bridge;
mod socket;

pub use backend::{Backend, BackendError, BackendKind, EmbeddedBackend, NotifyFn, websocket_url};
pub use bridge::{
    BackendHandle, BridgeContext, BridgeError, BridgeState, HandlerError, HandlerId, MessageBridge,
    MessageHandler, Payload,
};
pub use socket::SocketBackend;
