//! Control channel between the host and the runtime process.
//!
//! This module provides the wire protocol, codec and transport the host uses to
//! talk to the spawned runtime.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Command, CommandResult, Event)
//! - **codec**: Line framing codec for AsyncRead/AsyncWrite
//! - **transport**: Endpoint naming, listener and connected stream

pub mod codec;
pub mod protocol;
pub mod transport;
