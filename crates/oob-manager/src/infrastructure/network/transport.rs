//! Datagram transport to one management controller.
//!
//! The connector never touches a socket directly; it talks to a
//! [`Transport`].  Production code uses [`UdpTransport`]; unit tests use the
//! `mockall`-generated `MockTransport`.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

/// Largest datagram a controller sends in practice.
const MAX_DATAGRAM: usize = 1024;

/// Connected, unreliable datagram channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Binds a local socket and fixes `peer` as the only counterpart.
    async fn connect(&mut self, peer: SocketAddr) -> io::Result<()>;

    async fn send(&self, datagram: &[u8]) -> io::Result<()>;

    /// Waits up to `timeout` for one datagram.  `Ok(None)` means the wait
    /// timed out.
    async fn recv(&self, timeout: Duration) -> io::Result<Option<Vec<u8>>>;

    /// Releases the socket.  Idempotent.
    async fn close(&mut self);

    fn is_connected(&self) -> bool;
}

/// [`Transport`] over a connected tokio `UdpSocket`.
#[derive(Default)]
pub struct UdpTransport {
    socket: Option<UdpSocket>,
}

impl UdpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn socket(&self) -> io::Result<&UdpSocket> {
        self.socket
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "transport not connected"))
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn connect(&mut self, peer: SocketAddr) -> io::Result<()> {
        let local: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;
        debug!(peer = %peer, local = ?socket.local_addr().ok(), "udp transport connected");
        self.socket = Some(socket);
        Ok(())
    }

    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.socket()?.send(datagram).await?;
        Ok(())
    }

    async fn recv(&self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        let socket = self.socket()?;
        let mut buf = vec![0u8; MAX_DATAGRAM];
        match tokio::time::timeout(timeout, socket.recv(&mut buf)).await {
            Ok(Ok(len)) => {
                buf.truncate(len);
                Ok(Some(buf))
            }
            Ok(Err(e)) => Err(e),
            Err(_elapsed) => Ok(None),
        }
    }

    async fn close(&mut self) {
        if self.socket.take().is_some() {
            debug!("udp transport closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.socket.is_some()
    }
}
