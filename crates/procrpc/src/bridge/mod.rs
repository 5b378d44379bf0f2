//! Wire layer shared by both endpoints of a channel.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Call/Result), call ids, argument lists
//! - **transport**: Structured channel (in-memory pair or framed byte pipe)
//! - **codec**: JSON framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
pub mod transport;
