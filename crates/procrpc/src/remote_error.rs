//! Error codec: native errors to and from their transmissible shape.
//!
//! Handler failures cross the channel as data. An error-like value travels as
//! an [`ErrorEnvelope`]; any other value used as an error travels unchanged, so
//! ordinary payloads are never mistaken for failures.
//!
//! Envelope fields use JavaScript-compatible names on the wire (`name`,
//! `message`, `stack`) so either side may be a Node.js process. Properties a
//! foreign peer adds beyond the fixed set are kept in `extra`.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::error::Error as StdError;
use std::fmt;
use std::panic::Location;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const DEFAULT_KIND: &str = "Error";

/// Fixed wire shape of an error-like value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(rename = "name", default = "default_kind")]
    pub kind: String,
    pub message: String,
    #[serde(rename = "stack", default)]
    pub trace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorEnvelope>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_kind() -> String {
    DEFAULT_KIND.to_string()
}

impl ErrorEnvelope {
    /// Envelope whose trace points at the caller.
    #[track_caller]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let kind = kind.into();
        let message = message.into();
        let trace = render_trace(&kind, &message, Location::caller());
        Self {
            kind,
            message,
            trace,
            cause: None,
            extra: Map::new(),
        }
    }

    pub fn with_cause(mut self, cause: ErrorEnvelope) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Iterate this envelope and its causes, outermost first.
    pub fn chain(&self) -> impl Iterator<Item = &ErrorEnvelope> {
        std::iter::successors(Some(self), |e| e.cause.as_deref())
    }

    fn from_source(err: &(dyn StdError + 'static)) -> Self {
        Self {
            kind: DEFAULT_KIND.to_string(),
            message: err.to_string(),
            trace: String::new(),
            cause: err.source().map(|s| Box::new(Self::from_source(s))),
            extra: Map::new(),
        }
    }
}

/// A failure reported by the peer, or produced by a local handler for the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// An error-like value with message and trace.
    Error(ErrorEnvelope),
    /// A non-error value used as an error; carried untouched.
    Value(Value),
}

impl RemoteError {
    /// Capture a native error, recording the caller's location in the trace.
    #[track_caller]
    pub fn from_error<E: StdError + ?Sized>(err: &E) -> Self {
        let kind = short_type_name(std::any::type_name::<E>());
        let mut envelope = ErrorEnvelope::new(kind, err.to_string());
        envelope.cause = err.source().map(|s| Box::new(ErrorEnvelope::from_source(s)));
        Self::Error(envelope)
    }

    #[track_caller]
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error(ErrorEnvelope::new(kind, message))
    }

    /// Plain `Error` with the given message.
    #[track_caller]
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Error(ErrorEnvelope::new(DEFAULT_KIND, message))
    }

    pub fn value(value: Value) -> Self {
        Self::Value(value)
    }

    pub fn envelope(&self) -> Option<&ErrorEnvelope> {
        match self {
            Self::Error(e) => Some(e),
            Self::Value(_) => None,
        }
    }

    pub fn kind(&self) -> Option<&str> {
        self.envelope().map(|e| e.kind.as_str())
    }

    pub fn trace(&self) -> Option<&str> {
        self.envelope().map(|e| e.trace.as_str())
    }

    pub fn message(&self) -> String {
        match self {
            Self::Error(e) => e.message.clone(),
            Self::Value(Value::String(s)) => s.clone(),
            Self::Value(v) => v.to_string(),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error(e) => f.write_str(&e.message),
            Self::Value(Value::String(s)) => f.write_str(s),
            Self::Value(v) => write!(f, "{v}"),
        }
    }
}

/// Lets handlers use `?` on any standard error.
///
/// `RemoteError` deliberately does not implement `std::error::Error` itself,
/// otherwise this impl would overlap with `From<T> for T`.
impl<E> From<E> for RemoteError
where
    E: StdError + Send + Sync + 'static,
{
    #[track_caller]
    fn from(err: E) -> Self {
        Self::from_error(&err)
    }
}

impl From<ErrorEnvelope> for RemoteError {
    fn from(envelope: ErrorEnvelope) -> Self {
        Self::Error(envelope)
    }
}

/// Encode a failure for the `error` field of a result message.
///
/// Non-error values come back unchanged.
pub fn serialize_error(err: &RemoteError) -> Value {
    match err {
        RemoteError::Value(v) => v.clone(),
        RemoteError::Error(envelope) => match serde_json::to_value(envelope) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode error envelope");
                Value::String(envelope.message.clone())
            }
        },
    }
}

/// Decode the `error` field of a result message.
///
/// Objects with a string `message` are error-like; everything else is passed
/// through as [`RemoteError::Value`].
pub fn deserialize_error(value: Value) -> RemoteError {
    let error_like = value
        .get("message")
        .is_some_and(|m| m.is_string());
    if !error_like {
        return RemoteError::Value(value);
    }
    match ErrorEnvelope::deserialize(&value) {
        Ok(envelope) => RemoteError::Error(envelope),
        Err(e) => {
            tracing::debug!(error = %e, "Error-like value does not fit envelope, passing through");
            RemoteError::Value(value)
        }
    }
}

fn render_trace(kind: &str, message: &str, location: &Location<'_>) -> String {
    let mut trace = format!("{kind}: {message}\n    at {location}");
    let backtrace = Backtrace::capture();
    if backtrace.status() == BacktraceStatus::Captured {
        trace.push('\n');
        trace.push_str(&backtrace.to_string());
    }
    trace
}

fn short_type_name(full: &str) -> &str {
    let full = full.trim_start_matches("dyn ");
    let base = full.split(['<', ' ']).next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
