//! Socket endpoints for the event and log channels.

use std::fmt;
use std::fs::DirBuilder;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Address a channel listens on or a daemon connects to.
///
/// TCP endpoints with port `0` ask the operating system for an ephemeral port;
/// the bound address is reported back by the listener once it is running.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum Endpoint {
    /// Unix domain socket endpoint.
    Unix {
        /// Filesystem path of the socket.
        path: Utf8PathBuf,
    },
    /// TCP socket endpoint.
    Tcp {
        /// Host name or IP address.
        host: String,
        /// Port number; `0` requests an ephemeral port.
        port: u16,
    },
}

impl Endpoint {
    /// Builds a Unix domain socket endpoint.
    #[must_use]
    pub fn unix(path: impl Into<Utf8PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Builds a TCP socket endpoint.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Builds a TCP endpoint on the IPv4 loopback interface.
    #[must_use]
    pub fn loopback(port: u16) -> Self {
        Self::tcp("127.0.0.1", port)
    }

    /// Returns the Unix socket path when the endpoint uses the Unix transport.
    #[must_use]
    pub fn unix_path(&self) -> Option<&Utf8Path> {
        match self {
            Self::Unix { path } => Some(path.as_ref()),
            Self::Tcp { .. } => None,
        }
    }

    /// Returns the TCP port when the endpoint uses the TCP transport.
    #[must_use]
    pub const fn tcp_port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => Some(*port),
            Self::Unix { .. } => None,
        }
    }

    /// Reports whether the endpoint defers port selection to the OS.
    #[must_use]
    pub const fn is_ephemeral(&self) -> bool {
        matches!(self, Self::Tcp { port: 0, .. })
    }

    /// Returns a copy of a TCP endpoint with `port` substituted.
    ///
    /// Unix endpoints are returned unchanged.
    #[must_use]
    pub fn with_port(&self, new_port: u16) -> Self {
        match self {
            Self::Tcp { host, .. } => Self::tcp(host.clone(), new_port),
            Self::Unix { .. } => self.clone(),
        }
    }

    /// Ensures the socket's parent directory exists with restrictive permissions.
    ///
    /// # Errors
    ///
    /// Returns an error when the path has no parent or the directory cannot
    /// be created.
    pub fn prepare_filesystem(&self) -> Result<(), EndpointPreparationError> {
        let Some(path) = self.unix_path() else {
            return Ok(());
        };
        let Some(parent) = path.parent() else {
            return Err(EndpointPreparationError::MissingParent {
                path: path.to_path_buf(),
            });
        };

        let mut builder = DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }

        if let Err(source) = builder.create(parent.as_std_path())
            && source.kind() != std::io::ErrorKind::AlreadyExists
        {
            return Err(EndpointPreparationError::CreateDirectory {
                path: parent.to_path_buf(),
                source,
            });
        }

        Ok(())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix { path } => write!(formatter, "unix://{path}"),
            Self::Tcp { host, port } => write!(formatter, "tcp://{host}:{port}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(input)?;
        match url.scheme() {
            "unix" => {
                let path = url.path();
                if path.is_empty() {
                    return Err(EndpointParseError::MissingUnixPath(input.to_owned()));
                }
                Ok(Self::unix(path))
            }
            "tcp" => {
                let host = url
                    .host_str()
                    .ok_or_else(|| EndpointParseError::MissingHost(input.to_owned()))?;
                let port = url
                    .port()
                    .ok_or_else(|| EndpointParseError::MissingPort(input.to_owned()))?;
                Ok(Self::tcp(host.trim_matches(['[', ']']), port))
            }
            other => Err(EndpointParseError::UnsupportedScheme(other.to_owned())),
        }
    }
}

/// Errors encountered while parsing an [`Endpoint`] from text.
#[derive(Debug, Error)]
pub enum EndpointParseError {
    /// Scheme was not recognised.
    #[error("unsupported endpoint scheme '{0}'")]
    UnsupportedScheme(String),
    /// TCP host name was missing.
    #[error("missing TCP host in '{0}'")]
    MissingHost(String),
    /// TCP port was missing from the address.
    #[error("missing TCP port in '{0}'")]
    MissingPort(String),
    /// Unix socket path was absent.
    #[error("missing Unix socket path in '{0}'")]
    MissingUnixPath(String),
    /// URL failed to parse.
    #[error(transparent)]
    Url(#[from] url::ParseError),
}

/// Errors raised when preparing socket directories.
#[derive(Debug, Error)]
pub enum EndpointPreparationError {
    /// Parent directory is missing when creating a Unix socket path.
    #[error("socket path '{path}' has no parent directory")]
    MissingParent {
        /// Offending path.
        path: Utf8PathBuf,
    },
    /// Failed to create socket directories.
    #[error("failed to create socket directory '{path}': {source}")]
    CreateDirectory {
        /// Offending path.
        path: Utf8PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn display_unix_socket() {
        let endpoint = Endpoint::unix(Utf8PathBuf::from("/tmp/corral/events.sock"));
        assert_eq!(endpoint.to_string(), "unix:///tmp/corral/events.sock");
    }

    #[rstest]
    #[case("tcp://127.0.0.1:9000", Endpoint::loopback(9000))]
    #[case("tcp://localhost:0", Endpoint::tcp("localhost", 0))]
    #[case("unix:///run/corral/logs.sock", Endpoint::unix("/run/corral/logs.sock"))]
    fn parses_supported_schemes(#[case] input: &str, #[case] expected: Endpoint) {
        let endpoint: Endpoint = input.parse().expect("endpoint should parse");
        assert_eq!(endpoint, expected);
    }

    #[rstest]
    #[case("udp://127.0.0.1:9000")]
    #[case("tcp://127.0.0.1")]
    #[case("not a url")]
    fn rejects_invalid_endpoints(#[case] input: &str) {
        assert!(input.parse::<Endpoint>().is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        let endpoint = Endpoint::loopback(4506);
        let reparsed: Endpoint = endpoint.to_string().parse().expect("reparse");
        assert_eq!(reparsed, endpoint);
    }

    #[test]
    fn ephemeral_ports_are_substituted() {
        let endpoint = Endpoint::loopback(0);
        assert!(endpoint.is_ephemeral());
        let bound = endpoint.with_port(41_000);
        assert_eq!(bound.tcp_port(), Some(41_000));
        assert!(!bound.is_ephemeral());
    }

    #[test]
    fn prepare_filesystem_creates_parent_directory() {
        let dir = tempfile::tempdir().expect("temp dir");
        let nested = dir.path().join("nested").join("events.sock");
        let path = Utf8PathBuf::from_path_buf(nested).expect("utf8 path");
        let endpoint = Endpoint::unix(path.clone());

        endpoint.prepare_filesystem().expect("prepare filesystem");

        let parent = path.parent().expect("parent directory");
        assert!(parent.as_std_path().is_dir());
    }
}
