use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Result, TransportError};
use crate::stream::RipcStream;
use crate::tcp::TcpTransport;

#[cfg(unix)]
use crate::unix::UnixTransport;

/// Where a channel listens or connects.
///
/// Parsed from `host:port` for TCP and `unix:<path>` (or an absolute path)
/// for Unix domain sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(TransportError::InvalidEndpoint(s.to_string()));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if s.starts_with('/') || s.starts_with("./") {
            return Ok(Self::Unix(PathBuf::from(s)));
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Self::Tcp(s.to_string()))
            }
            _ => Err(TransportError::InvalidEndpoint(s.to_string())),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => f.write_str(addr),
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Connect to `endpoint` (blocking).
pub fn connect(endpoint: &Endpoint) -> Result<RipcStream> {
    match endpoint {
        Endpoint::Tcp(addr) => TcpTransport::connect(addr),
        #[cfg(unix)]
        Endpoint::Unix(path) => UnixTransport::connect(path),
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(TransportError::InvalidEndpoint(endpoint.to_string())),
    }
}

/// A bound listener of either kind.
pub enum Listener {
    Tcp(TcpTransport),
    #[cfg(unix)]
    Unix(UnixTransport),
}

impl Listener {
    /// Bind and listen on `endpoint`.
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => TcpTransport::bind(addr).map(Self::Tcp),
            #[cfg(unix)]
            Endpoint::Unix(path) => UnixTransport::bind(path).map(Self::Unix),
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(TransportError::InvalidEndpoint(endpoint.to_string())),
        }
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<RipcStream> {
        match self {
            Self::Tcp(listener) => listener.accept(),
            #[cfg(unix)]
            Self::Unix(listener) => listener.accept(),
        }
    }

    /// The endpoint clients should connect to.
    ///
    /// For TCP this carries the actual port when bound to port 0.
    pub fn local_endpoint(&self) -> Endpoint {
        match self {
            Self::Tcp(listener) => Endpoint::Tcp(listener.local_addr().to_string()),
            #[cfg(unix)]
            Self::Unix(listener) => Endpoint::Unix(listener.path().to_path_buf()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let ep: Endpoint = "127.0.0.1:14002".parse().unwrap();
        assert_eq!(ep, Endpoint::Tcp("127.0.0.1:14002".to_string()));
        assert_eq!(ep.to_string(), "127.0.0.1:14002");
    }

    #[test]
    fn test_parse_unix() {
        let ep: Endpoint = "unix:/tmp/ripc.sock".parse().unwrap();
        assert_eq!(ep, Endpoint::Unix(PathBuf::from("/tmp/ripc.sock")));
        assert_eq!(ep.to_string(), "unix:/tmp/ripc.sock");

        let bare: Endpoint = "/tmp/ripc.sock".parse().unwrap();
        assert_eq!(bare, ep);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("localhost".parse::<Endpoint>().is_err());
        assert!("host:notaport".parse::<Endpoint>().is_err());
        assert!("unix:".parse::<Endpoint>().is_err());
    }

    #[test]
    fn test_listener_reports_bound_port() {
        let listener = Listener::bind(&Endpoint::Tcp("127.0.0.1:0".to_string())).unwrap();
        match listener.local_endpoint() {
            Endpoint::Tcp(addr) => assert!(!addr.ends_with(":0")),
            other => panic!("unexpected endpoint {other:?}"),
        }
    }
}
