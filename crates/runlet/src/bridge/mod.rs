//! Wire protocol, codec and transport for manager-runner sessions.
//!
//! # Architecture
//!
//! - **protocol**: the four frame kinds (Call/Response/Event/Log)
//! - **payload**: MessagePack payload helpers
//! - **codec**: binary framing codec for AsyncRead/AsyncWrite
//! - **transport**: the unix socket pair carrying one session

pub mod codec;
pub mod payload;
pub mod protocol;
pub mod transport;
