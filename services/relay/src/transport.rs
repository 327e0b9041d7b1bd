//! Overlay network transport.
//!
//! The relay listens and dials over a private overlay network. It only needs
//! two primitives from it, `listen(port)` and `dial(address)`, which the
//! [`OverlayTransport`] trait captures. [`TcpTransport`] implements them with
//! plain TCP sockets bound to the overlay interface address.

use std::io;
use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// A byte stream the relay can pipe.
pub trait RelayStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> RelayStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// A connection handed out by a listener.
#[derive(Debug)]
pub struct Accepted<S> {
    pub stream: S,
    /// Remote end of the connection.
    pub peer_addr: SocketAddr,
    /// Local address the connection arrived on.
    pub local_addr: SocketAddr,
}

/// A bound overlay listener.
#[async_trait]
pub trait OverlayListener: Send + Sync + 'static {
    type Stream: RelayStream;

    /// Wait for the next connection. `Ok(None)` means the listener is closed.
    async fn accept(&self) -> io::Result<Option<Accepted<Self::Stream>>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Listener/dialer factory for the overlay network.
#[async_trait]
pub trait OverlayTransport: Send + Sync + 'static {
    type Stream: RelayStream;
    type Listener: OverlayListener<Stream = Self::Stream>;

    async fn listen(&self, port: u16) -> io::Result<Self::Listener>;

    /// Dial `address` in `host:port` form.
    async fn dial(&self, address: &str) -> io::Result<Self::Stream>;
}

/// TCP on the overlay interface address.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    listen_ip: IpAddr,
}

impl TcpTransport {
    pub fn new(listen_ip: IpAddr) -> Self {
        Self { listen_ip }
    }
}

/// A bound TCP listener.
#[derive(Debug)]
pub struct TcpOverlayListener {
    inner: TcpListener,
}

#[async_trait]
impl OverlayListener for TcpOverlayListener {
    type Stream = TcpStream;

    async fn accept(&self) -> io::Result<Option<Accepted<TcpStream>>> {
        let (stream, peer_addr) = self.inner.accept().await?;
        let local_addr = stream.local_addr()?;
        Ok(Some(Accepted {
            stream,
            peer_addr,
            local_addr,
        }))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[async_trait]
impl OverlayTransport for TcpTransport {
    type Stream = TcpStream;
    type Listener = TcpOverlayListener;

    async fn listen(&self, port: u16) -> io::Result<TcpOverlayListener> {
        let inner = TcpListener::bind(SocketAddr::new(self.listen_ip, port)).await?;
        Ok(TcpOverlayListener { inner })
    }

    async fn dial(&self, address: &str) -> io::Result<TcpStream> {
        debug!(address = %address, "Dialing backend");
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}
