//! Endpoint - protocol state for one side of a channel.
//!
//! Flow:
//! 1. Wrap a [`Channel`] in an [`Endpoint`]
//! 2. First `register*` or `call` attaches the message router (exactly once)
//! 3. `call` allocates an id, records it as pending and sends a call message
//! 4. The router answers peer calls and resolves our pending calls
//!
//! There are no timeouts and no cancellation: a call whose result never
//! arrives stays pending for as long as the endpoint lives.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{Args, Message};
use crate::bridge::transport::Channel;
use crate::correlator::{Correlator, PendingCall};
use crate::error::{Result, RpcError};
use crate::registry::{AsyncFn, FunctionRegistry, Handler, SyncFn};
use crate::remote_error::{ErrorEnvelope, RemoteError, serialize_error};
use crate::router;

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Name of this side in log output, e.g. "parent" or "child".
    pub label: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            label: "endpoint".to_string(),
        }
    }
}

impl EndpointConfig {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// State shared between endpoint handles, the router and in-flight handlers.
pub(crate) struct Shared {
    pub(crate) label: String,
    pub(crate) registry: FunctionRegistry,
    pub(crate) correlator: Correlator,
    outbound: mpsc::UnboundedSender<Value>,
    frame_limit: Option<usize>,
    /// Taken by the router when it is attached.
    inbound: StdMutex<Option<mpsc::UnboundedReceiver<Value>>>,
    listeners: AtomicUsize,
    shutdown: CancellationToken,
}

impl Shared {
    fn send(&self, message: &Message) -> Result<()> {
        let value = message.to_value()?;
        if let Some(max) = self.frame_limit {
            let len = serde_json::to_vec(&value)?.len();
            if len > max {
                return Err(RpcError::FrameTooLarge { len, max });
            }
        }
        self.outbound
            .send(value)
            .map_err(|_| RpcError::ChannelClosed)
    }

    /// Send a result message; the peer being gone is logged, not raised.
    ///
    /// A result that does not fit the channel is replaced by an error result
    /// so the caller still gets exactly one reply.
    pub(crate) fn reply(&self, message: Message) {
        let id = message.id();
        let err = match self.send(&message) {
            Ok(()) => return,
            Err(e @ RpcError::FrameTooLarge { .. }) => e,
            Err(e) => {
                tracing::warn!(endpoint = %self.label, call_id = %id, error = %e, "Failed to send result");
                return;
            }
        };

        tracing::warn!(endpoint = %self.label, call_id = %id, error = %err, "Result too large, replying with error");
        // No trace: the replacement has to fit the same limit.
        let envelope = ErrorEnvelope {
            kind: err.kind().to_string(),
            message: err.to_string(),
            trace: String::new(),
            cause: None,
            extra: Map::new(),
        };
        let fallback = Message::failure(id, serialize_error(&RemoteError::Error(envelope)));
        if let Err(e) = self.send(&fallback) {
            tracing::warn!(endpoint = %self.label, call_id = %id, error = %e, "Failed to send result");
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// One side of a bidirectional RPC channel.
///
/// Cheap to clone; clones share the same registry and pending calls. Dropping
/// the last clone stops the router and fails any still-pending calls with
/// [`RpcError::ChannelClosed`].
///
/// Registered handlers are owned by the endpoint. A handler that needs to call
/// back through its own endpoint should capture a [`WeakEndpoint`] from
/// [`Endpoint::downgrade`]; a captured `Endpoint` clone keeps the endpoint
/// alive for good.
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<Shared>,
}

/// Non-owning handle to an [`Endpoint`].
#[derive(Clone)]
pub struct WeakEndpoint {
    shared: Weak<Shared>,
}

impl WeakEndpoint {
    /// The endpoint, unless every [`Endpoint`] clone has been dropped.
    pub fn upgrade(&self) -> Option<Endpoint> {
        self.shared.upgrade().map(|shared| Endpoint { shared })
    }
}

impl std::fmt::Debug for WeakEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakEndpoint")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

impl Endpoint {
    pub fn new(channel: Channel) -> Self {
        Self::with_config(channel, EndpointConfig::default())
    }

    pub fn with_config(channel: Channel, config: EndpointConfig) -> Self {
        let frame_limit = channel.frame_limit();
        let (outbound, inbound) = channel.into_parts();
        Self {
            shared: Arc::new(Shared {
                label: config.label,
                registry: FunctionRegistry::new(),
                correlator: Correlator::new(),
                outbound,
                frame_limit,
                inbound: StdMutex::new(Some(inbound)),
                listeners: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Expose a synchronous function to the peer.
    ///
    /// # Errors
    /// [`RpcError::AlreadyRegistered`] if `name` is taken; the existing handler
    /// is kept.
    pub fn register<F>(&self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(Args) -> std::result::Result<Value, RemoteError> + Send + Sync + 'static,
    {
        self.register_handler(name, SyncFn(f))
    }

    /// Expose an asynchronous function to the peer.
    pub fn register_async<F, Fut>(&self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Value, RemoteError>> + Send + 'static,
    {
        self.register_handler(name, AsyncFn(f))
    }

    pub fn register_handler<H: Handler>(&self, name: impl Into<String>, handler: H) -> Result<()> {
        self.ensure_router()?;
        self.shared.registry.insert(name, Arc::new(handler))
    }

    /// Invoke `name` on the peer.
    ///
    /// The call message is queued before this returns; the returned future
    /// resolves when the matching result arrives.
    ///
    /// ```no_run
    /// # async fn demo(endpoint: procrpc::Endpoint) -> procrpc::Result<()> {
    /// use serde_json::json;
    ///
    /// let sum = endpoint.call("add", json!([1, 2]))?.await?;
    /// let same = endpoint.call("identity", json!("foo"))?.await?;
    /// let ten = endpoint.call("ten", ())?.await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn call(&self, name: &str, args: impl Into<Args>) -> Result<PendingCall> {
        self.ensure_router()?;

        let (id, pending) = self.shared.correlator.begin();
        let message = Message::call(id, name, args.into());
        if let Err(e) = self.shared.send(&message) {
            self.shared.correlator.abandon(id);
            return Err(e);
        }

        tracing::trace!(endpoint = %self.shared.label, call_id = %id, function = %name, "Call sent");
        Ok(pending)
    }

    /// Number of inbound listeners attached: 0 before first use, then 1.
    pub fn listener_count(&self) -> usize {
        self.shared.listeners.load(Ordering::Acquire)
    }

    /// Calls sent whose result has not arrived yet.
    pub fn pending_calls(&self) -> usize {
        self.shared.correlator.pending()
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.shared.registry.contains(name)
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn downgrade(&self) -> WeakEndpoint {
        WeakEndpoint {
            shared: Arc::downgrade(&self.shared),
        }
    }

    fn ensure_router(&self) -> Result<()> {
        if self.listener_count() > 0 {
            return Ok(());
        }

        let mut parked = self
            .shared
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(inbound) = parked.take() else {
            return Ok(());
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            *parked = Some(inbound);
            return Err(RpcError::NoRuntime);
        };

        runtime.spawn(router::run_router(
            Arc::downgrade(&self.shared),
            inbound,
            self.shared.shutdown.clone(),
            self.shared.label.clone(),
        ));
        self.shared.listeners.fetch_add(1, Ordering::Release);
        tracing::debug!(endpoint = %self.shared.label, "Attached message router");
        Ok(())
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("label", &self.shared.label)
            .field("functions", &self.shared.registry.len())
            .field("pending_calls", &self.pending_calls())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::transport::ChannelConfig;
    use serde_json::json;

    fn ten(_args: Args) -> std::result::Result<Value, RemoteError> {
        Ok(json!(10))
    }

    #[tokio::test]
    async fn router_attached_once() {
        let (channel, _peer) = Channel::pair();
        let endpoint = Endpoint::new(channel);
        assert_eq!(endpoint.listener_count(), 0);

        endpoint.register("ten", ten).unwrap();
        assert_eq!(endpoint.listener_count(), 1);
        assert!(endpoint.has_function("ten"));

        endpoint.register("eleven", |_| Ok(json!(11))).unwrap();
        let _call = endpoint.call("noop", ()).unwrap();
        let _call = endpoint.call("noop", ()).unwrap();
        assert_eq!(endpoint.listener_count(), 1);
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let (channel, _peer) = Channel::pair();
        let endpoint = Endpoint::new(channel);
        endpoint.register("add", ten).unwrap();

        let err = endpoint.register("add", ten).unwrap_err();
        assert!(matches!(err, RpcError::AlreadyRegistered { ref name } if name == "add"));
        assert_eq!(err.to_string(), "function `add` already registered");
        assert_eq!(endpoint.listener_count(), 1);
    }

    #[tokio::test]
    async fn call_message_on_the_wire() {
        let (channel, peer) = Channel::pair();
        let endpoint = Endpoint::new(channel);
        let (_peer_tx, mut peer_rx) = peer.into_parts();

        let pending = endpoint.call("add", json!([1, 2])).unwrap();
        let sent = peer_rx.recv().await.unwrap();
        assert_eq!(
            sent,
            json!({"rpc": true, "type": "call", "id": pending.id(), "name": "add", "args": [1, 2]})
        );
        assert_eq!(endpoint.pending_calls(), 1);
    }

    #[tokio::test]
    async fn result_resolves_pending_call() {
        let (channel, peer) = Channel::pair();
        let endpoint = Endpoint::new(channel);
        let (peer_tx, mut peer_rx) = peer.into_parts();

        let pending = endpoint.call("identity", json!("foo")).unwrap();
        let sent = peer_rx.recv().await.unwrap();
        peer_tx
            .send(json!({"rpc": true, "type": "result", "id": sent["id"], "error": null, "result": "foo"}))
            .unwrap();

        assert_eq!(pending.await.unwrap(), json!("foo"));
        assert_eq!(endpoint.pending_calls(), 0);
    }

    #[tokio::test]
    async fn non_rpc_traffic_ignored() {
        let (channel, peer) = Channel::pair();
        let endpoint = Endpoint::new(channel);
        endpoint.register("ten", ten).unwrap();
        let (peer_tx, mut peer_rx) = peer.into_parts();

        peer_tx.send(json!({"type": "call", "id": 1, "name": "ten"})).unwrap();
        peer_tx.send(json!({"rpc": true, "type": "bogus"})).unwrap();
        peer_tx
            .send(json!({"rpc": true, "type": "call", "id": 2, "name": "ten", "args": []}))
            .unwrap();

        let reply = peer_rx.recv().await.unwrap();
        assert_eq!(reply["id"], json!(2));
        assert_eq!(reply["result"], json!(10));
        assert!(peer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_on_closed_channel_leaves_nothing_pending() {
        let (channel, peer) = Channel::pair();
        let endpoint = Endpoint::new(channel);
        drop(peer);

        let err = endpoint.call("ten", ()).unwrap_err();
        assert!(matches!(err, RpcError::ChannelClosed));
        assert_eq!(endpoint.pending_calls(), 0);
    }

    #[test]
    fn attaching_router_needs_runtime() {
        let (channel, _peer) = Channel::pair();
        let endpoint = Endpoint::new(channel);

        assert!(matches!(endpoint.register("ten", ten), Err(RpcError::NoRuntime)));
        assert!(!endpoint.has_function("ten"));
        assert_eq!(endpoint.listener_count(), 0);
    }

    #[tokio::test]
    async fn handler_holding_weak_handle_does_not_keep_endpoint_alive() {
        let (channel, _peer) = Channel::pair();
        let endpoint = Endpoint::new(channel);
        let weak = endpoint.downgrade();
        let captured = weak.clone();
        endpoint
            .register("label", move |_| {
                let endpoint = captured.upgrade().ok_or_else(|| RemoteError::msg("gone"))?;
                Ok(json!(endpoint.label()))
            })
            .unwrap();
        let pending = endpoint.call("ten", ()).unwrap();

        assert!(weak.upgrade().is_some());
        drop(endpoint);
        assert!(weak.upgrade().is_none());
        assert!(matches!(pending.await, Err(RpcError::ChannelClosed)));
    }

    #[tokio::test]
    async fn oversized_call_is_rejected_before_sending() {
        let (left, _right) = tokio::io::duplex(1024);
        let (r, w) = tokio::io::split(left);
        let channel =
            Channel::from_io_with(r, w, ChannelConfig::default().with_max_frame_length(128)).unwrap();
        let endpoint = Endpoint::new(channel);

        let err = endpoint.call("identity", json!("x".repeat(500))).unwrap_err();
        assert!(matches!(err, RpcError::FrameTooLarge { max: 128, .. }));
        assert_eq!(endpoint.pending_calls(), 0);
    }

    #[tokio::test]
    async fn dropping_endpoint_fails_pending_calls() {
        let (channel, _peer) = Channel::pair();
        let endpoint = Endpoint::new(channel);
        let pending = endpoint.call("ten", ()).unwrap();

        drop(endpoint);
        assert!(matches!(pending.await, Err(RpcError::ChannelClosed)));
    }
}
