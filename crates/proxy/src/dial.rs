//! Upstream dialing: splits a `HOST:PORT` identifier and connects to it.

use std::io;
use std::net::{TcpStream as StdTcpStream, ToSocketAddrs};

use mio::net::TcpStream;

use crate::error::ReactorError;

/// Splits `identifier` at the rightmost `:`, mirroring the backward scan
/// in the original's `extract_host_port`. Returns `None` when there is no
/// `:`, or it is the first character (empty host).
#[must_use]
pub fn split_host_port(identifier: &str) -> Option<(&str, &str)> {
    let idx = identifier.rfind(':')?;
    if idx == 0 {
        return None;
    }
    Some((&identifier[..idx], &identifier[idx + 1..]))
}

/// Resolves and connects to the host:port named by `identifier`, trying
/// each resolved IPv4 candidate in turn (IPv6 is out of scope; see
/// `DESIGN.md`). The returned stream is already non-blocking.
pub fn connect_remote(identifier: &str) -> Result<TcpStream, ReactorError> {
    let (host, port) = split_host_port(identifier).ok_or_else(|| {
        ReactorError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid service identifier {identifier:?}"),
        ))
    })?;
    let port: u16 = port.parse().map_err(|_| {
        ReactorError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid port in service identifier {identifier:?}"),
        ))
    })?;

    let mut last_error = None;
    for addr in (host, port).to_socket_addrs()? {
        if !addr.is_ipv4() {
            continue;
        }
        match StdTcpStream::connect(addr) {
            Ok(stream) => {
                stream.set_nonblocking(true)?;
                return Ok(TcpStream::from_std(stream));
            }
            Err(err) => last_error = Some(err),
        }
    }

    Err(last_error
        .unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no IPv4 address resolved")
        })
        .into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_rightmost_colon() {
        assert_eq!(
            split_host_port("example.com:8080"),
            Some(("example.com", "8080"))
        );
        assert_eq!(split_host_port("127.0.0.1:9001"), Some(("127.0.0.1", "9001")));
    }

    #[test]
    fn splits_on_rightmost_colon_with_multiple_colons() {
        // IPv6-looking input isn't supported end-to-end, but the split
        // itself should still pick the last colon, same as the original.
        assert_eq!(split_host_port("a:b:9001"), Some(("a:b", "9001")));
    }

    #[test]
    fn rejects_missing_colon() {
        assert_eq!(split_host_port("no-port-here"), None);
    }

    #[test]
    fn rejects_empty_host() {
        assert_eq!(split_host_port(":8080"), None);
    }

    #[test]
    fn connect_remote_fails_on_unroutable_port() {
        // Port 0 never accepts connections; exercises the error path
        // without depending on an external service being reachable.
        let result = connect_remote("127.0.0.1:0");
        assert!(result.is_err());
    }

    #[test]
    fn connect_remote_rejects_malformed_identifier() {
        assert!(connect_remote("no-port-here").is_err());
    }
}
