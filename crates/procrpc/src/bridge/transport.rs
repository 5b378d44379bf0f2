//! Structured message channel between two endpoints.
//!
//! A [`Channel`] is one side of a duplex conduit carrying JSON values, reliable
//! and FIFO per direction. Ways to obtain one:
//! - **pair**: in-memory, both ends in this process
//! - **from_io**: any AsyncRead/AsyncWrite pair, framed with [`JsonCodec`]
//! - **from_child / stdio**: the parent and child halves over child stdio
//!
//! Spawning and tearing down the peer process is the caller's business.

use std::io;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::{DEFAULT_MAX_FRAME_LENGTH, JsonCodec};
use crate::error::{Result, RpcError};

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub max_frame_length: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl ChannelConfig {
    pub fn with_max_frame_length(mut self, n: usize) -> Self {
        self.max_frame_length = n;
        self
    }
}

/// One side of a duplex structured-message channel.
#[derive(Debug)]
pub struct Channel {
    outbound: mpsc::UnboundedSender<Value>,
    inbound: mpsc::UnboundedReceiver<Value>,
    frame_limit: Option<usize>,
}

impl Channel {
    /// Build a channel from raw queue halves.
    pub fn new(
        outbound: mpsc::UnboundedSender<Value>,
        inbound: mpsc::UnboundedReceiver<Value>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            frame_limit: None,
        }
    }

    /// Two connected in-memory ends: what one sends, the other receives.
    pub fn pair() -> (Channel, Channel) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (Channel::new(a_tx, b_rx), Channel::new(b_tx, a_rx))
    }

    /// Bridge a byte pipe to a structured channel using default framing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_io<R, W>(reader: R, writer: W) -> Result<Channel>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::from_io_with(reader, writer, ChannelConfig::default())
    }

    pub fn from_io_with<R, W>(reader: R, writer: W, config: ChannelConfig) -> Result<Channel>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| RpcError::NoRuntime)?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Value>();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Value>();

        let mut frames = FramedRead::new(
            reader,
            JsonCodec::<Value>::with_max_frame_length(config.max_frame_length),
        );
        runtime.spawn(async move {
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(value) => {
                        if inbound_tx.send(value).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Channel read error");
                        break;
                    }
                }
            }
            tracing::debug!("Channel reader task exiting");
        });

        let mut sink = FramedWrite::new(
            writer,
            JsonCodec::<Value>::with_max_frame_length(config.max_frame_length),
        );
        runtime.spawn(async move {
            while let Some(value) = outbound_rx.recv().await {
                match sink.send(value).await {
                    Ok(()) => {}
                    // Rejected by the codec before anything was buffered; later frames still go out.
                    Err(e) if is_encode_error(&e) => {
                        tracing::warn!(error = %e, "Dropping value that cannot be framed");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Channel write error");
                        break;
                    }
                }
            }
            tracing::debug!("Channel writer task exiting");
        });

        Ok(Channel {
            frame_limit: Some(config.max_frame_length),
            ..Channel::new(outbound_tx, inbound_rx)
        })
    }

    /// Parent side: talk to a child over its piped stdin/stdout.
    ///
    /// Takes the pipes out of `child`; both must have been configured as
    /// `Stdio::piped()` at spawn.
    pub fn from_child(child: &mut tokio::process::Child) -> Result<Channel> {
        let stdin = child
            .stdin
            .take()
            .ok_or(RpcError::PipeNotCaptured("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(RpcError::PipeNotCaptured("stdout"))?;
        Self::from_io(stdout, stdin)
    }

    /// Child side: talk to the parent over this process's stdin/stdout.
    pub fn stdio() -> Result<Channel> {
        Self::from_io(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Queue a value for the peer. Never blocks.
    pub fn send(&self, value: Value) -> Result<()> {
        self.outbound
            .send(value)
            .map_err(|_| RpcError::ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    /// Largest encoded value the channel can carry, if it is framed.
    pub fn frame_limit(&self) -> Option<usize> {
        self.frame_limit
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<Value>,
        mpsc::UnboundedReceiver<Value>,
    ) {
        (self.outbound, self.inbound)
    }
}

fn is_encode_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData
    )
}
