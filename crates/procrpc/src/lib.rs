//! procrpc: bidirectional RPC between a parent process and its child.
//!
//! Both sides wrap their end of a shared message channel in an [`Endpoint`],
//! register the functions they expose, and call the functions the other side
//! exposes. Any number of calls may be in flight; results are matched to calls
//! by id, in whatever order they come back.

pub mod bridge;
pub mod correlator;
mod endpoint;
mod error;
pub mod registry;
pub mod remote_error;
mod router;

pub use bridge::protocol::{Args, CallId, Message};
pub use bridge::transport::{Channel, ChannelConfig};
pub use correlator::PendingCall;
pub use endpoint::{Endpoint, EndpointConfig, WeakEndpoint};
pub use error::{Result, RpcError};
pub use registry::Handler;
pub use remote_error::{ErrorEnvelope, RemoteError, deserialize_error, serialize_error};
