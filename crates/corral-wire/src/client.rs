//! Daemon-side clients for the event and log channels.

use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::net::UnixStream;

use corral_config::Endpoint;
use serde_json::Value;

use crate::frame::{FrameError, write_frame};
use crate::{EventFrame, LogFrame, LogLevel};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

enum ChannelStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl ChannelStream {
    fn connect(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let address = resolve(host, *port)?;
                let stream = TcpStream::connect_timeout(&address, CONNECT_TIMEOUT)?;
                stream.set_nodelay(true)?;
                stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
                Ok(Self::Tcp(stream))
            }
            #[cfg(unix)]
            Endpoint::Unix { path } => {
                let stream = UnixStream::connect(path.as_std_path())?;
                stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
                Ok(Self::Unix(stream))
            }
            #[cfg(not(unix))]
            Endpoint::Unix { .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets unsupported on this platform",
            )),
        }
    }
}

impl Write for ChannelStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Self::Unix(stream) => stream.flush(),
        }
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no resolved address"))
}

fn lock(stream: &Mutex<ChannelStream>) -> MutexGuard<'_, ChannelStream> {
    stream.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publishes tagged events onto the host's event channel.
pub struct EventPublisher {
    daemon_id: String,
    stream: Mutex<ChannelStream>,
}

impl EventPublisher {
    /// Connects to the event channel at `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Io`] when the connection cannot be established.
    pub fn connect(endpoint: &Endpoint, daemon_id: impl Into<String>) -> Result<Self, FrameError> {
        let stream = ChannelStream::connect(endpoint).map_err(FrameError::Io)?;
        Ok(Self {
            daemon_id: daemon_id.into(),
            stream: Mutex::new(stream),
        })
    }

    /// Identifier stamped on every published frame.
    #[must_use]
    pub fn daemon_id(&self) -> &str {
        &self.daemon_id
    }

    /// Publishes one event.
    ///
    /// # Errors
    ///
    /// Returns an error when the frame cannot be encoded or written.
    pub fn publish(&self, tag: &str, data: Value) -> Result<(), FrameError> {
        let frame = EventFrame::new(self.daemon_id.as_str(), tag, data);
        write_frame(&mut *lock(&self.stream), &frame)
    }
}

/// Forwards log records to the host's log server.
///
/// Records below the threshold are dropped locally. When a prefix is set it
/// is prepended to every message as `[prefix] message`.
pub struct LogForwarder {
    daemon_id: String,
    threshold: LogLevel,
    prefix: Option<String>,
    stream: Mutex<ChannelStream>,
}

impl LogForwarder {
    /// Connects to the log server at `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::Io`] when the connection cannot be established.
    pub fn connect(
        endpoint: &Endpoint,
        daemon_id: impl Into<String>,
        threshold: LogLevel,
    ) -> Result<Self, FrameError> {
        let stream = ChannelStream::connect(endpoint).map_err(FrameError::Io)?;
        Ok(Self {
            daemon_id: daemon_id.into(),
            threshold,
            prefix: None,
            stream: Mutex::new(stream),
        })
    }

    /// Sets the message prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: Option<String>) -> Self {
        self.prefix = prefix.filter(|value| !value.is_empty());
        self
    }

    /// Minimum forwarded level.
    #[must_use]
    pub const fn threshold(&self) -> LogLevel {
        self.threshold
    }

    /// Reports whether a record at `level` would be forwarded.
    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level.passes(self.threshold)
    }

    /// Forwards one record. Returns `false` when the level filtered it out.
    ///
    /// # Errors
    ///
    /// Returns an error when the frame cannot be encoded or written.
    pub fn forward(&self, level: LogLevel, logger: &str, message: &str) -> Result<bool, FrameError> {
        if !self.enabled(level) {
            return Ok(false);
        }
        let rendered = self
            .prefix
            .as_ref()
            .map_or_else(|| message.to_owned(), |prefix| format!("[{prefix}] {message}"));
        let frame = LogFrame::now(self.daemon_id.as_str(), level, logger, rendered);
        write_frame(&mut *lock(&self.stream), &frame)?;
        Ok(true)
    }
}
