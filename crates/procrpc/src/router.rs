//! Message router - the single inbound listener of an endpoint.
//!
//! Calls go to the registry and are answered with a result under the same id.
//! Results go to the correlator. Nothing raised while dispatching escapes the
//! router: failures become error results for the peer.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{Args, CallId, Message, RpcTag};
use crate::endpoint::Shared;
use crate::error::RpcError;
use crate::remote_error::{RemoteError, deserialize_error, serialize_error};

pub(crate) async fn run_router(
    shared: Weak<Shared>,
    mut inbound: mpsc::UnboundedReceiver<Value>,
    shutdown: CancellationToken,
    label: String,
) {
    tracing::debug!(endpoint = %label, "Message router started");

    loop {
        let value = tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::debug!(endpoint = %label, "Endpoint dropped, router exiting");
                break;
            }

            value = inbound.recv() => match value {
                Some(value) => value,
                None => {
                    tracing::info!(endpoint = %label, "Inbound channel closed, router exiting");
                    break;
                }
            },
        };

        let Some(shared) = shared.upgrade() else {
            break;
        };
        route(&shared, value);
    }
}

fn route(shared: &Arc<Shared>, value: Value) {
    if !RpcTag::is_tagged(&value) {
        tracing::trace!(endpoint = %shared.label, "Ignoring non-rpc message");
        return;
    }

    match Message::from_value(value) {
        Ok(Message::Call { id, name, args, .. }) => dispatch_call(shared, id, name, args),
        Ok(Message::Result {
            id, error, result, ..
        }) => deliver_result(shared, id, error, result),
        Err(e) => {
            tracing::warn!(endpoint = %shared.label, error = %e, "Dropping malformed rpc message");
        }
    }
}

fn dispatch_call(shared: &Arc<Shared>, id: CallId, name: String, args: Args) {
    let Some(handler) = shared.registry.get(&name) else {
        tracing::debug!(endpoint = %shared.label, call_id = %id, function = %name, "Call to unknown function");
        let err = RpcError::UnknownFunction { name };
        let remote = RemoteError::new(err.kind(), err.to_string());
        shared.reply(Message::failure(id, serialize_error(&remote)));
        return;
    };

    tracing::trace!(endpoint = %shared.label, call_id = %id, function = %name, "Dispatching call");

    // Replies are sent in completion order; a slow handler never stalls the listener.
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let outcome = AssertUnwindSafe(handler.call(args)).catch_unwind().await;
        let reply = match outcome {
            Ok(Ok(value)) => Message::success(id, value),
            Ok(Err(err)) => {
                tracing::debug!(endpoint = %shared.label, call_id = %id, function = %name, error = %err, "Handler failed");
                failure(id, err)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(endpoint = %shared.label, call_id = %id, function = %name, %message, "Handler panicked");
                Message::failure(id, serialize_error(&RemoteError::new("Panic", message)))
            }
        };
        shared.reply(reply);
    });
}

/// A null `error` reads as success on the wire, so a null failure value is
/// replaced by a plain error envelope.
fn failure(id: CallId, err: RemoteError) -> Message {
    let err = match err {
        RemoteError::Value(Value::Null) => RemoteError::msg("null"),
        other => other,
    };
    Message::failure(id, serialize_error(&err))
}

fn deliver_result(shared: &Shared, id: CallId, error: Option<Value>, result: Option<Value>) {
    let outcome = match error {
        Some(error) if !error.is_null() => Err(deserialize_error(error)),
        _ => Ok(result.unwrap_or(Value::Null)),
    };

    if shared.correlator.resolve(id, outcome) {
        tracing::trace!(endpoint = %shared.label, call_id = %id, "Call resolved");
    } else {
        tracing::warn!(endpoint = %shared.label, call_id = %id, "Result for unknown call id, ignoring");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_failure_is_never_encoded_as_null() {
        let Message::Result { error, .. } = failure(CallId::new(3), RemoteError::value(Value::Null))
        else {
            panic!("expected a result message");
        };
        let error = error.unwrap();
        assert_eq!(error["name"], "Error");
        assert_eq!(error["message"], "null");

        let Message::Result { error, .. } = failure(CallId::new(4), RemoteError::value(0.into()))
        else {
            panic!("expected a result message");
        };
        assert_eq!(error, Some(Value::from(0)));
    }

    #[test]
    fn panic_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        assert_eq!(panic_message(payload.as_ref()), "owned boom");

        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "handler panicked");
    }
}
