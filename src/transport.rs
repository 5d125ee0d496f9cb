//! Socket transport.

use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Error, Result};

/// QMP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// A Unix domain socket.
    Unix {
        /// Socket path.
        path: PathBuf,
    },

    /// A TCP socket.
    Tcp {
        /// Hostname or IP.
        host: String,
        /// Port.
        port: u16,
    },
}

impl Endpoint {
    /// Create a Unix socket endpoint.
    #[must_use]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Create a TCP endpoint.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix { path } => write!(f, "{}", path.display()),
            Self::Tcp { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            Self::Tcp { host, port } => write!(f, "{host}:{port}"),
        }
    }
}

/// Parses `host:port` (or `[v6]:port`) as TCP and anything else as a path.
impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::protocol("empty endpoint address"));
        }

        if !s.contains('/') {
            if let Some((host, port)) = s.rsplit_once(':') {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::protocol(format!("invalid port in '{s}'")))?;
                let host = host.trim_start_matches('[').trim_end_matches(']');
                return Ok(Self::tcp(host, port));
            }
        }

        Ok(Self::unix(s))
    }
}

/// Trait object representing an async stream that can be used for QMP I/O.
pub trait AsyncQmpStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncQmpStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// A connected QMP stream.
///
/// Internally this is a boxed stream so the rest of the crate does not care
/// whether the underlying connection is Unix, TCP or an in-memory pipe.
pub type QmpStream = Box<dyn AsyncQmpStream>;

/// Connect to a QMP endpoint. No data is exchanged.
pub(crate) async fn connect(endpoint: &Endpoint) -> Result<QmpStream> {
    match endpoint {
        #[cfg(unix)]
        Endpoint::Unix { path } => {
            let s = tokio::net::UnixStream::connect(path)
                .await
                .map_err(Error::from)?;
            Ok(Box::new(s))
        }
        #[cfg(not(unix))]
        Endpoint::Unix { .. } => Err(Error::from(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "unix sockets are not supported on this platform",
        ))),
        Endpoint::Tcp { host, port } => {
            let s = tokio::net::TcpStream::connect((host.as_str(), *port))
                .await
                .map_err(Error::from)?;
            // Best effort: disable Nagle for request/response latency.
            let _ = s.set_nodelay(true);
            Ok(Box::new(s))
        }
    }
}

/// Bind `endpoint`, listen with a backlog of one and wait up to `timeout` for
/// the peer to connect.
///
/// Bind failures surface as I/O errors; an expired wait or a failed accept is
/// a connect error.
pub(crate) async fn accept(endpoint: &Endpoint, timeout: Duration) -> Result<QmpStream> {
    match endpoint {
        #[cfg(unix)]
        Endpoint::Unix { path } => {
            // A stale socket file from a previous run would make bind fail.
            let _ = std::fs::remove_file(path);
            let listener = tokio::net::UnixListener::bind(path).map_err(Error::from)?;
            let accepted = tokio::time::timeout(timeout, listener.accept()).await;
            let _ = std::fs::remove_file(path);
            let (stream, _addr) = settle_accept(accepted, timeout)?;
            Ok(Box::new(stream))
        }
        #[cfg(not(unix))]
        Endpoint::Unix { .. } => Err(Error::from(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "unix sockets are not supported on this platform",
        ))),
        Endpoint::Tcp { host, port } => {
            let addr = tokio::net::lookup_host((host.as_str(), *port))
                .await
                .map_err(Error::from)?
                .next()
                .ok_or_else(|| {
                    Error::from(std::io::Error::new(
                        std::io::ErrorKind::AddrNotAvailable,
                        format!("{host}:{port} did not resolve"),
                    ))
                })?;

            let socket = if addr.is_ipv4() {
                tokio::net::TcpSocket::new_v4()
            } else {
                tokio::net::TcpSocket::new_v6()
            }
            .map_err(Error::from)?;
            socket.set_reuseaddr(true).map_err(Error::from)?;
            socket.bind(addr).map_err(Error::from)?;
            let listener = socket.listen(1).map_err(Error::from)?;

            let accepted = tokio::time::timeout(timeout, listener.accept()).await;
            let (stream, _peer) = settle_accept(accepted, timeout)?;
            let _ = stream.set_nodelay(true);
            Ok(Box::new(stream))
        }
    }
}

fn settle_accept<T>(
    accepted: std::result::Result<std::io::Result<T>, tokio::time::error::Elapsed>,
    timeout: Duration,
) -> Result<T> {
    match accepted {
        Ok(Ok(conn)) => Ok(conn),
        Ok(Err(e)) => Err(Error::connect(format!("accept failed: {e}"))),
        Err(_elapsed) => Err(Error::connect(format!(
            "no peer connected within {timeout:?}"
        ))),
    }
}
