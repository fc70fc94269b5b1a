//! Authenticated, encrypted connections between peers.
//!
//! A [`Tunnel`] is created by a successful handshake and owns the socket and
//! both direction keys. Any transport error is terminal: callers close the
//! tunnel and drop it, nothing here retries.

mod boxstream;
pub mod handshake;
mod stats;

use std::net::SocketAddr;
use std::time::Duration;

use buildmesh_core::{AppKey, KeyPair, PublicKey};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult};
use crate::protocol::Message;

pub use boxstream::{BoxCodec, DirectionKey, Frame, SessionKeys};
pub use stats::LinkStats;

/// Bound on the goodbye sent while closing.
const GOODBYE_TIMEOUT: Duration = Duration::from_millis(250);

type CloseObserver = Box<dyn FnOnce(Option<&MeshError>) + Send>;

/// One established tunnel.
pub struct Tunnel {
    /// `None` once closed; transport state is torn down as a unit.
    framed: Option<Framed<TcpStream, BoxCodec>>,
    remote_key: PublicKey,
    remote_addr: SocketAddr,
    idle_timeout: Duration,
    stats: LinkStats,
    close_observer: Option<CloseObserver>,
}

impl Tunnel {
    /// Dial `addr` and authenticate, requiring the far end to prove `expected`.
    pub async fn connect(
        addr: SocketAddr,
        app_key: &AppKey,
        identity: &KeyPair,
        expected: &PublicKey,
        config: &MeshConfig,
    ) -> MeshResult<Self> {
        let mut stream = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| MeshError::ConnectionTimeout { addr })??;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(error = %e, "Failed to set TCP_NODELAY");
        }

        let outcome = timeout(
            config.handshake_timeout,
            handshake::client(&mut stream, app_key, identity, expected),
        )
        .await
        .map_err(|_| MeshError::HandshakeTimeout)??;

        tracing::debug!(peer = %outcome.remote_key, addr = %addr, "Outbound tunnel established");
        Ok(Self::established(stream, addr, outcome, config.idle_timeout))
    }

    /// Authenticate an inbound connection. Any client holding the application key is accepted.
    pub async fn accept(
        mut stream: TcpStream,
        addr: SocketAddr,
        app_key: &AppKey,
        identity: &KeyPair,
        config: &MeshConfig,
    ) -> MeshResult<Self> {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(error = %e, "Failed to set TCP_NODELAY");
        }

        let outcome = timeout(
            config.handshake_timeout,
            handshake::server(&mut stream, app_key, identity),
        )
        .await
        .map_err(|_| MeshError::HandshakeTimeout)??;

        tracing::debug!(peer = %outcome.remote_key, addr = %addr, "Inbound tunnel established");
        Ok(Self::established(stream, addr, outcome, config.idle_timeout))
    }

    fn established(
        stream: TcpStream,
        remote_addr: SocketAddr,
        outcome: handshake::Handshake,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            framed: Some(Framed::new(stream, BoxCodec::new(outcome.keys))),
            remote_key: outcome.remote_key,
            remote_addr,
            idle_timeout,
            stats: LinkStats::new(),
            close_observer: None,
        }
    }

    /// Identity of the remote peer.
    pub fn remote_key(&self) -> &PublicKey {
        &self.remote_key
    }

    /// Socket address of the remote peer.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Idle timeout / per-frame deadline.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Liveness data, shared with anyone holding a clone.
    pub fn stats(&self) -> LinkStats {
        self.stats.clone()
    }

    /// Whether [`Tunnel::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.framed.is_none()
    }

    /// Install the callback fired once when the tunnel closes, with the
    /// terminal error if there was one. Replaces any previous callback.
    pub fn set_close_observer<F>(&mut self, observer: F)
    where
        F: FnOnce(Option<&MeshError>) + Send + 'static,
    {
        self.close_observer = Some(Box::new(observer));
    }

    /// Send one frame, failing if it does not go out within the idle timeout.
    pub async fn write_frame(&mut self, payload: Bytes) -> MeshResult<()> {
        let addr = self.remote_addr;
        let deadline = self.idle_timeout;
        let framed = self.framed.as_mut().ok_or(MeshError::TunnelClosed)?;

        timeout(deadline, framed.send(Frame::Data(payload)))
            .await
            .map_err(|_| MeshError::DeadlineExceeded { addr })??;
        self.stats.record_sent();
        Ok(())
    }

    /// Receive one frame, failing if none arrives within the idle timeout.
    pub async fn read_frame(&mut self) -> MeshResult<Bytes> {
        let addr = self.remote_addr;
        timeout(self.idle_timeout, self.next_frame())
            .await
            .map_err(|_| MeshError::DeadlineExceeded { addr })?
    }

    /// Receive one frame with no deadline. Cancel-safe.
    pub async fn next_frame(&mut self) -> MeshResult<Bytes> {
        let framed = self.framed.as_mut().ok_or(MeshError::TunnelClosed)?;
        match framed.next().await {
            Some(Ok(Frame::Data(payload))) => {
                self.stats.record_recv();
                Ok(payload)
            }
            Some(Ok(Frame::Goodbye)) => Err(MeshError::PeerDisconnected {
                reason: "goodbye".to_string(),
            }),
            Some(Err(e)) => Err(e),
            None => Err(MeshError::PeerDisconnected {
                reason: "connection closed".to_string(),
            }),
        }
    }

    /// Encode and send a message.
    pub async fn write_message(&mut self, message: &Message) -> MeshResult<()> {
        let bytes = message.encode()?;
        self.write_frame(Bytes::from(bytes)).await
    }

    /// Receive and decode a message, within the idle timeout.
    pub async fn read_message(&mut self) -> MeshResult<Message> {
        let bytes = self.read_frame().await?;
        Message::decode(&bytes)
    }

    /// Tell the remote side we are leaving.
    pub async fn write_goodbye(&mut self) -> MeshResult<()> {
        let addr = self.remote_addr;
        let deadline = self.idle_timeout.min(GOODBYE_TIMEOUT);
        let framed = self.framed.as_mut().ok_or(MeshError::TunnelClosed)?;
        timeout(deadline, framed.send(Frame::Goodbye))
            .await
            .map_err(|_| MeshError::DeadlineExceeded { addr })?
    }

    /// Send a goodbye (best effort), shut the socket down and drop all
    /// session state. The close observer fires on the first call only.
    pub async fn close(&mut self, error: Option<&MeshError>) {
        if self.framed.is_some() {
            if let Err(e) = self.write_goodbye().await {
                tracing::trace!(addr = %self.remote_addr, error = %e, "Goodbye not delivered");
            }
        }

        if let Some(framed) = self.framed.take() {
            let mut stream = framed.into_inner();
            match stream.shutdown().await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotConnected => {}
                Err(e) => tracing::trace!(addr = %self.remote_addr, error = %e, "Socket shutdown failed"),
            }
            tracing::debug!(peer = %self.remote_key, addr = %self.remote_addr, "Tunnel closed");
        }

        if let Some(observer) = self.close_observer.take() {
            observer(error);
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if let Some(observer) = self.close_observer.take() {
            observer(None);
        }
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("remote_key", &self.remote_key.to_base64())
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
