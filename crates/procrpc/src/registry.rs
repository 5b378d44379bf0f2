//! Function registry - the functions an endpoint exposes to its peer.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;

use crate::bridge::protocol::Args;
use crate::error::{Result, RpcError};
use crate::remote_error::RemoteError;

/// A function callable by the peer.
///
/// Implemented for you by [`Endpoint::register`](crate::Endpoint::register)
/// and [`Endpoint::register_async`](crate::Endpoint::register_async); implement
/// it directly when the handler carries its own state.
#[async_trait::async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, args: Args) -> std::result::Result<Value, RemoteError>;
}

/// Adapter for synchronous closures.
pub(crate) struct SyncFn<F>(pub F);

#[async_trait::async_trait]
impl<F> Handler for SyncFn<F>
where
    F: Fn(Args) -> std::result::Result<Value, RemoteError> + Send + Sync + 'static,
{
    async fn call(&self, args: Args) -> std::result::Result<Value, RemoteError> {
        (self.0)(args)
    }
}

/// Adapter for closures returning a future.
pub(crate) struct AsyncFn<F>(pub F);

#[async_trait::async_trait]
impl<F, Fut> Handler for AsyncFn<F>
where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, RemoteError>> + Send + 'static,
{
    async fn call(&self, args: Args) -> std::result::Result<Value, RemoteError> {
        (self.0)(args).await
    }
}

/// Name → handler map. Grows only.
#[derive(Default)]
pub struct FunctionRegistry {
    functions: DashMap<String, Arc<dyn Handler>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `handler` under `name`, refusing to replace an existing entry.
    pub fn insert(&self, name: impl Into<String>, handler: Arc<dyn Handler>) -> Result<()> {
        match self.functions.entry(name.into()) {
            Entry::Occupied(entry) => Err(RpcError::AlreadyRegistered {
                name: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                tracing::debug!(function = %entry.key(), "Registered function");
                entry.insert(handler);
                Ok(())
            }
        }
    }

    /// Handler for `name`; cloned out so no map guard is held across an await.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.functions.get(name).map(|h| Arc::clone(h.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
