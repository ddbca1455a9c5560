//! ZeroMQ PUB/PULL sockets backed by the pure-Rust `zeromq` crate.

use super::{Bound, CommandSocket, PublishSocket, Transport};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::FutureExt;
use log::{debug, warn};
use zeromq::{Endpoint, Socket, SocketRecv, SocketSend, ZmqMessage};

/// Binds sockets on `tcp://<bind_host>:0` and advertises the listen address.
#[derive(Debug, Clone)]
pub struct ZmqTransport {
    bind_host: String,
}

impl ZmqTransport {
    pub fn new(bind_host: impl Into<String>) -> Self {
        Self {
            bind_host: bind_host.into(),
        }
    }

    async fn bind<S: Socket + Send>(&self, socket: &mut S, advertised_host: &str) -> Result<String> {
        let generic = format!("tcp://{}:0", self.bind_host);
        let endpoint = socket
            .bind(&generic)
            .await
            .map_err(|e| BridgeError::BindFailed {
                endpoint: generic.clone(),
                reason: e.to_string(),
            })?;

        match endpoint {
            Endpoint::Tcp(_, port) => {
                let url = format!("tcp://{}:{}", advertised_host, port);
                debug!("Bound {} (advertised as {})", generic, url);
                Ok(url)
            }
            other => Err(BridgeError::BindFailed {
                endpoint: generic,
                reason: format!("unexpected endpoint {}", other),
            }),
        }
    }
}

impl Default for ZmqTransport {
    fn default() -> Self {
        Self::new("0.0.0.0")
    }
}

#[async_trait]
impl Transport for ZmqTransport {
    async fn bind_publisher(&self, advertised_host: &str) -> Result<Bound<Box<dyn PublishSocket>>> {
        let mut socket = zeromq::PubSocket::new();
        let url = self.bind(&mut socket, advertised_host).await?;
        Ok(Bound {
            socket: Box::new(ZmqPublisher { socket }),
            url,
        })
    }

    async fn bind_command(&self, advertised_host: &str) -> Result<Bound<Box<dyn CommandSocket>>> {
        let mut socket = zeromq::PullSocket::new();
        let url = self.bind(&mut socket, advertised_host).await?;
        Ok(Bound {
            socket: Box::new(ZmqPuller { socket }),
            url,
        })
    }
}

struct ZmqPublisher {
    socket: zeromq::PubSocket,
}

#[async_trait]
impl PublishSocket for ZmqPublisher {
    async fn send(&mut self, parts: Vec<Bytes>) -> Result<()> {
        let mut parts = parts.into_iter();
        let Some(first) = parts.next() else {
            return Ok(());
        };

        let mut message = ZmqMessage::from(first);
        for part in parts {
            message.push_back(part);
        }

        self.socket
            .send(message)
            .await
            .map_err(|e| BridgeError::SendFailed {
                socket: "publish",
                reason: e.to_string(),
            })
    }

    async fn close(self: Box<Self>) {
        for e in self.socket.close().await {
            warn!("Error closing publish socket: {}", e);
        }
    }
}

struct ZmqPuller {
    socket: zeromq::PullSocket,
}

#[async_trait]
impl CommandSocket for ZmqPuller {
    fn try_recv(&mut self) -> Result<Option<Vec<Bytes>>> {
        match self.socket.recv().now_or_never() {
            None => Ok(None),
            Some(Ok(message)) => Ok(Some(message.into_vec())),
            Some(Err(e)) => Err(BridgeError::ReceiveFailed(e.to_string())),
        }
    }

    async fn close(self: Box<Self>) {
        for e in self.socket.close().await {
            warn!("Error closing command socket: {}", e);
        }
    }
}
