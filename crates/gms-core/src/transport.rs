//! TCP (optionally TLS) transport: listening, accepting and connecting.
//!
//! Everything above this module sees a [`RawConnection`]: a split byte
//! stream plus the peer address.

use crate::error::{GmsError, GmsResult};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A host name (or address literal) plus port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPointer {
    pub host: String,
    pub port: u16,
}

impl HostPointer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Resolve to the first socket address the resolver returns.
    pub async fn resolve(&self) -> GmsResult<SocketAddr> {
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| GmsError::Transport(format!("cannot resolve {self}: {e}")))?
            .next()
            .ok_or_else(|| GmsError::Transport(format!("no address found for {self}")))
    }
}

impl fmt::Display for HostPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One live byte stream, already split into halves.
pub struct RawConnection {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub peer_addr: SocketAddr,
}

impl RawConnection {
    pub fn from_stream<S>(stream: S, peer_addr: SocketAddr) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer_addr,
        }
    }
}

/// Listening side of the transport.
#[derive(Clone)]
pub struct ServerSocketConfig {
    pub bind: HostPointer,
    /// Listen backlog.
    pub backlog: u32,
    pub accept_timeout: Duration,
    pub handshake_timeout: Duration,
    pub tls: Option<TlsAcceptor>,
}

impl ServerSocketConfig {
    pub fn new(bind: HostPointer) -> Self {
        Self {
            bind,
            backlog: 128,
            accept_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(5),
            tls: None,
        }
    }
}

/// A bound listener.
pub struct ServerSocket {
    listener: TcpListener,
    handshake_timeout: Duration,
    tls: Option<TlsAcceptor>,
}

impl ServerSocket {
    pub async fn bind(config: &ServerSocketConfig) -> GmsResult<Self> {
        let addr = config.bind.resolve().await?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| GmsError::Transport(format!("socket creation failed: {e}")))?;

        socket
            .set_reuseaddr(true)
            .map_err(|e| GmsError::Transport(format!("SO_REUSEADDR failed: {e}")))?;
        socket
            .bind(addr)
            .map_err(|e| GmsError::Transport(format!("bind to {addr} failed: {e}")))?;
        let listener = socket
            .listen(config.backlog)
            .map_err(|e| GmsError::Transport(format!("listen on {addr} failed: {e}")))?;

        Ok(Self {
            listener,
            handshake_timeout: config.handshake_timeout,
            tls: config.tls.clone(),
        })
    }

    pub fn local_addr(&self) -> GmsResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept the next TCP connection without running the TLS handshake, or
    /// `None` once `timeout` elapses. Finish it with
    /// [`PendingConnection::establish`], off the accept loop when TLS is on.
    pub async fn accept_pending(&self, timeout: Duration) -> GmsResult<Option<PendingConnection>> {
        let (stream, peer_addr) = match time::timeout(timeout, self.listener.accept()).await {
            Err(_) => return Ok(None),
            Ok(accepted) => {
                accepted.map_err(|e| GmsError::Transport(format!("accept failed: {e}")))?
            }
        };
        let _ = stream.set_nodelay(true);
        Ok(Some(PendingConnection {
            stream,
            peer_addr,
            tls: self.tls.clone(),
            handshake_timeout: self.handshake_timeout,
        }))
    }

    /// Accept and establish the next connection, or `None` once `timeout`
    /// elapses. The TLS handshake runs inline.
    pub async fn accept(&self, timeout: Duration) -> GmsResult<Option<RawConnection>> {
        match self.accept_pending(timeout).await? {
            Some(pending) => pending.establish().await.map(Some),
            None => Ok(None),
        }
    }
}

/// A TCP connection whose TLS handshake, if any, has not run yet.
pub struct PendingConnection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    handshake_timeout: Duration,
}

impl PendingConnection {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether [`PendingConnection::establish`] waits on the peer.
    pub fn needs_handshake(&self) -> bool {
        self.tls.is_some()
    }

    /// Run the TLS handshake, bounded by the handshake timeout.
    pub async fn establish(self) -> GmsResult<RawConnection> {
        let Self {
            stream,
            peer_addr,
            tls,
            handshake_timeout,
        } = self;
        match tls {
            None => Ok(RawConnection::from_stream(stream, peer_addr)),
            Some(acceptor) => {
                let tls_stream = time::timeout(handshake_timeout, acceptor.accept(stream))
                    .await
                    .map_err(|_| GmsError::Timeout)?
                    .map_err(|e| {
                        GmsError::Transport(format!("TLS handshake with {peer_addr} failed: {e}"))
                    })?;
                debug!(remote = %peer_addr, "TLS handshake complete");
                Ok(RawConnection::from_stream(tls_stream, peer_addr))
            }
        }
    }
}

impl fmt::Debug for PendingConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingConnection")
            .field("peer_addr", &self.peer_addr)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

/// Connecting side of the transport.
#[derive(Clone)]
pub struct ClientSocketConfig {
    pub connect_timeout: Duration,
    pub tls: Option<TlsConnector>,
}

impl Default for ClientSocketConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            tls: None,
        }
    }
}

/// Open a connection to `server`, bounded by the connect timeout.
pub async fn connect(server: &HostPointer, config: &ClientSocketConfig) -> GmsResult<RawConnection> {
    let attempt = async {
        let addr = server.resolve().await?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| GmsError::Transport(format!("connect to {server} failed: {e}")))?;
        let _ = stream.set_nodelay(true);

        match &config.tls {
            None => Ok(RawConnection::from_stream(stream, addr)),
            Some(connector) => {
                let name = rustls::pki_types::ServerName::try_from(server.host.clone())
                    .map_err(|e| GmsError::Transport(format!("invalid TLS server name: {e}")))?;
                let tls_stream = connector.connect(name, stream).await.map_err(|e| {
                    GmsError::Transport(format!("TLS handshake with {server} failed: {e}"))
                })?;
                Ok(RawConnection::from_stream(tls_stream, addr))
            }
        }
    };

    time::timeout(config.connect_timeout, attempt)
        .await
        .map_err(|_| GmsError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{read_packet, write_packet};

    fn loopback() -> ServerSocketConfig {
        ServerSocketConfig::new(HostPointer::new("127.0.0.1", 0))
    }

    #[tokio::test]
    async fn accept_times_out_with_none() {
        let socket = ServerSocket::bind(&loopback()).await.unwrap();
        let accepted = socket.accept(Duration::from_millis(50)).await.unwrap();
        assert!(accepted.is_none());
    }

    #[tokio::test]
    async fn connect_and_exchange() {
        let socket = ServerSocket::bind(&loopback()).await.unwrap();
        let addr = socket.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let server = HostPointer::new("127.0.0.1", addr.port());
            let mut conn = connect(&server, &ClientSocketConfig::default())
                .await
                .unwrap();
            write_packet(&mut conn.writer, b"ping").await.unwrap();
            read_packet(&mut conn.reader, 64).await.unwrap().unwrap()
        });

        let mut conn = socket
            .accept(Duration::from_secs(5))
            .await
            .unwrap()
            .expect("client should connect");
        let got = read_packet(&mut conn.reader, 64).await.unwrap().unwrap();
        assert_eq!(got, b"ping");
        write_packet(&mut conn.writer, b"pong").await.unwrap();

        assert_eq!(client.await.unwrap(), b"pong");
    }

    #[tokio::test]
    async fn connect_refused_is_transport_error() {
        let socket = ServerSocket::bind(&loopback()).await.unwrap();
        let port = socket.local_addr().unwrap().port();
        drop(socket);

        let result = connect(
            &HostPointer::new("127.0.0.1", port),
            &ClientSocketConfig::default(),
        )
        .await;
        assert!(matches!(result, Err(GmsError::Transport(_))));
    }

    #[test]
    fn host_pointer_display() {
        assert_eq!(HostPointer::new("localhost", 35125).to_string(), "localhost:35125");
    }
}
