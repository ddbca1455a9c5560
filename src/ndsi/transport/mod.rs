//! Socket layer behind the sensor links.
//!
//! A sensor owns one publish socket for frames, one for notifications and one
//! pull socket for commands. The [`Transport`] trait binds them on an
//! ephemeral port and reports the URL subscribers should connect to.

#[cfg(test)]
pub mod memory;
mod zmq;

pub use zmq::ZmqTransport;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// Outbound multi-part socket (data or notification).
#[async_trait]
pub trait PublishSocket: Send {
    async fn send(&mut self, parts: Vec<Bytes>) -> Result<()>;

    async fn close(self: Box<Self>);
}

/// Inbound multi-part socket for commands.
#[async_trait]
pub trait CommandSocket: Send {
    /// Return the next pending message without waiting, `None` if there is none.
    fn try_recv(&mut self) -> Result<Option<Vec<Bytes>>>;

    async fn close(self: Box<Self>);
}

/// A freshly bound socket and the URL advertised for it.
pub struct Bound<S> {
    pub socket: S,
    pub url: String,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind a publish socket; `advertised_host` becomes the host part of the URL.
    async fn bind_publisher(&self, advertised_host: &str) -> Result<Bound<Box<dyn PublishSocket>>>;

    /// Bind a command (pull) socket.
    async fn bind_command(&self, advertised_host: &str) -> Result<Bound<Box<dyn CommandSocket>>>;
}
