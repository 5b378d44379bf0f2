use thiserror::Error;

use crate::remote_error::RemoteError;

/// Errors surfaced by an [`Endpoint`](crate::Endpoint).
///
/// `AlreadyRegistered`, `NoRuntime`, `PipeNotCaptured` and `FrameTooLarge` are
/// returned synchronously. Failures on the peer side only ever reach the
/// caller as [`RpcError::Remote`].
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("function `{name}` already registered")]
    AlreadyRegistered { name: String },

    /// Produced by the peer's router; travels back as an encoded error.
    #[error("unknown function `{name}`")]
    UnknownFunction { name: String },

    /// The peer reported a failure: unknown function or a handler error.
    #[error("{0}")]
    Remote(RemoteError),

    #[error("channel closed")]
    ChannelClosed,

    #[error("no tokio runtime available to run the message router")]
    NoRuntime,

    #[error("child {0} was not captured as a pipe")]
    PipeNotCaptured(&'static str),

    /// The encoded message does not fit the channel's frame limit.
    #[error("message of {len} bytes exceeds the {max} byte frame limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl RpcError {
    /// Stable name used as the `kind` of an encoded error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AlreadyRegistered { .. } => "AlreadyRegistered",
            Self::UnknownFunction { .. } => "UnknownFunction",
            Self::Remote(_) => "Remote",
            Self::ChannelClosed => "ChannelClosed",
            Self::NoRuntime => "NoRuntime",
            Self::PipeNotCaptured(_) => "PipeNotCaptured",
            Self::FrameTooLarge { .. } => "FrameTooLarge",
            Self::Encode(_) => "Encode",
        }
    }

    /// The peer's error, if this is a remote failure.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }

    /// Message text of the error, as the peer reported it for remote failures.
    pub fn message(&self) -> String {
        match self {
            Self::Remote(e) => e.message(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
