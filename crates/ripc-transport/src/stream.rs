use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use crate::error::{Result, TransportError};

/// Per-connection socket tuning applied after connect or accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    /// Disable Nagle's algorithm (TCP only).
    pub tcp_nodelay: bool,
    /// `SO_RCVBUF` in bytes; `None` keeps the system default.
    pub sys_recv_buf_size: Option<usize>,
    /// `SO_SNDBUF` in bytes; `None` keeps the system default.
    pub sys_send_buf_size: Option<usize>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            sys_recv_buf_size: None,
            sys_send_buf_size: None,
        }
    }
}

/// A connected byte stream carrying RIPC records; implements Read and Write.
pub struct RipcStream {
    inner: StreamInner,
}

enum StreamInner {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl Read for RipcStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            StreamInner::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for RipcStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            StreamInner::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            StreamInner::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.flush(),
        }
    }
}

impl From<TcpStream> for RipcStream {
    fn from(stream: TcpStream) -> Self {
        Self {
            inner: StreamInner::Tcp(stream),
        }
    }
}

#[cfg(unix)]
impl From<std::os::unix::net::UnixStream> for RipcStream {
    fn from(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: StreamInner::Unix(stream),
        }
    }
}

impl RipcStream {
    /// A connected pair of in-process streams, used for loopback channels.
    #[cfg(unix)]
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = std::os::unix::net::UnixStream::pair()?;
        Ok((a.into(), b.into()))
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            StreamInner::Tcp(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
        }
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            StreamInner::Tcp(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
        }
    }

    /// Switch between blocking and non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match &self.inner {
            StreamInner::Tcp(stream) => stream.set_nonblocking(nonblocking).map_err(Into::into),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.set_nonblocking(nonblocking).map_err(Into::into),
        }
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            StreamInner::Tcp(stream) => Ok(stream.try_clone()?.into()),
            #[cfg(unix)]
            StreamInner::Unix(stream) => Ok(stream.try_clone()?.into()),
        }
    }

    /// Shut down both halves of the connection.
    pub fn shutdown(&self) -> Result<()> {
        let result = match &self.inner {
            StreamInner::Tcp(stream) => stream.shutdown(Shutdown::Both),
            #[cfg(unix)]
            StreamInner::Unix(stream) => stream.shutdown(Shutdown::Both),
        };
        match result {
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            other => other.map_err(Into::into),
        }
    }

    /// Apply [`SocketOptions`] to this stream.
    pub fn apply_options(&self, options: &SocketOptions) -> Result<()> {
        if let StreamInner::Tcp(stream) = &self.inner {
            stream
                .set_nodelay(options.tcp_nodelay)
                .map_err(|source| TransportError::SocketOption {
                    option: "TCP_NODELAY",
                    source,
                })?;
        }
        #[cfg(unix)]
        {
            if let Some(size) = options.sys_recv_buf_size {
                self.set_buffer_size(libc::SO_RCVBUF, "SO_RCVBUF", size)?;
            }
            if let Some(size) = options.sys_send_buf_size {
                self.set_buffer_size(libc::SO_SNDBUF, "SO_SNDBUF", size)?;
            }
        }
        Ok(())
    }

    #[cfg(unix)]
    fn set_buffer_size(&self, name: libc::c_int, option: &'static str, size: usize) -> Result<()> {
        use std::os::fd::AsRawFd;

        let fd = match &self.inner {
            StreamInner::Tcp(stream) => stream.as_raw_fd(),
            StreamInner::Unix(stream) => stream.as_raw_fd(),
        };
        let value = libc::c_int::try_from(size).unwrap_or(libc::c_int::MAX);

        // SAFETY: `value` lives for the duration of the call and its size is
        // passed alongside it; `fd` is an open socket owned by this stream.
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                name,
                (&value as *const libc::c_int).cast::<libc::c_void>(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };

        if rc == 0 {
            Ok(())
        } else {
            Err(TransportError::SocketOption {
                option,
                source: std::io::Error::last_os_error(),
            })
        }
    }

    /// Short transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        match &self.inner {
            StreamInner::Tcp(_) => "tcp",
            #[cfg(unix)]
            StreamInner::Unix(_) => "unix",
        }
    }
}

impl std::fmt::Debug for RipcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            StreamInner::Tcp(stream) => f
                .debug_struct("RipcStream")
                .field("type", &"tcp")
                .field("peer", &stream.peer_addr().ok())
                .finish(),
            #[cfg(unix)]
            StreamInner::Unix(_) => f.debug_struct("RipcStream").field("type", &"unix").finish(),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_pair_round_trip() {
        let (mut a, mut b) = RipcStream::pair().unwrap();
        a.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        assert_eq!(a.transport_name(), "unix");
    }

    #[test]
    fn test_apply_buffer_sizes_on_unix_pair() {
        let (a, _b) = RipcStream::pair().unwrap();
        let options = SocketOptions {
            tcp_nodelay: true,
            sys_recv_buf_size: Some(64 * 1024),
            sys_send_buf_size: Some(64 * 1024),
        };
        a.apply_options(&options).unwrap();
    }

    #[test]
    fn test_shutdown_signals_eof() {
        let (a, mut b) = RipcStream::pair().unwrap();
        a.shutdown().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(b.read(&mut buf).unwrap(), 0);
    }
}
