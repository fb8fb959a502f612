#![deny(unsafe_code)]
//! Non-blocking socket helpers shared by the reactor and supervisor.
//!
//! Mirrors the original C `netutil.{c,h}` pair: a non-blocking flag setter,
//! an `SO_REUSEPORT` listener constructor, and a "send everything you can"
//! helper. The listener and flag-setting halves translate directly; `send_all`
//! is adapted for a non-blocking socket (the reactor drives it, rather than
//! looping until the kernel accepts every byte) — see the note on
//! [`send_all`] for the resulting behavioural difference from the original.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use thiserror::Error;

/// Errors raised by network setup helpers.
#[derive(Debug, Error)]
pub enum NetError {
    /// Any underlying OS-level socket failure.
    #[error("network I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Puts `fd` into non-blocking mode via `fcntl(F_GETFL)`/`fcntl(F_SETFL)`.
///
/// Kept as a standalone `libc` call (rather than relying solely on
/// `socket2::Socket::set_nonblocking`) so it can be applied to descriptors
/// accepted via raw `libc::accept4`-style paths, matching the original
/// `mk_nonblock`.
pub fn make_nonblocking(fd: RawFd) -> io::Result<()> {
    #[allow(unsafe_code)]
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    #[allow(unsafe_code)]
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Builds a non-blocking, `SO_REUSEPORT` IPv4 TCP listener bound to
/// `0.0.0.0:port`.
///
/// Several worker processes each call this with the same `port`; the kernel
/// load-balances incoming connections across all of their listening sockets.
/// IPv4-only by design (see `DESIGN.md`'s Open Question decisions).
pub fn setup_listener(port: u16) -> Result<TcpListener, NetError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_port(true)?;

    let addr: SocketAddr = (std::net::Ipv4Addr::UNSPECIFIED, port).into();
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(libc::SOMAXCONN)?;

    tracing::debug!(port, "listener bound with SO_REUSEPORT");
    Ok(socket.into())
}

/// Attempts to send all of `buf` on `stream` without blocking.
///
/// Returns the number of bytes actually written. Unlike the original
/// `sendall`, which loops on a (potentially blocking) socket until every
/// byte is accepted by the kernel or an error occurs, this version is meant
/// for a non-blocking socket driven by the reactor: it stops and returns
/// early (with a count smaller than `buf.len()`) the moment the kernel
/// socket buffer is full, rather than spinning. Callers are expected to
/// retain the unsent tail and retry once the reactor reports the socket
/// writable again.
pub fn send_all(stream: &impl AsRawFd, buf: &[u8]) -> Result<usize, NetError> {
    let mut sent = 0;
    while sent < buf.len() {
        let fd = stream.as_raw_fd();
        #[allow(unsafe_code)]
        let rc = unsafe {
            libc::send(
                fd,
                buf[sent..].as_ptr().cast(),
                buf.len() - sent,
                libc::MSG_NOSIGNAL,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => break,
                _ => return Err(err.into()),
            }
        }
        if rc == 0 {
            break;
        }
        sent += rc as usize;
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream as StdStream;

    #[test]
    fn setup_listener_binds_and_accepts() {
        let listener = setup_listener(0).expect("bind on ephemeral port");
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0, "kernel assigns a concrete ephemeral port");

        let client = StdStream::connect(addr);
        assert!(client.is_ok());
    }

    #[test]
    fn send_all_delivers_full_buffer_under_normal_conditions() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();

        let payload = b"HELLO WORLD";
        let sent = send_all(&client, payload).unwrap();
        assert_eq!(sent, payload.len());

        drop(client);
        let mut received = Vec::new();
        let mut server_side = server_side;
        std::io::Read::read_to_end(&mut server_side, &mut received).unwrap();
        assert_eq!(received, payload);
    }

    #[test]
    fn make_nonblocking_sets_o_nonblock() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        make_nonblocking(listener.as_raw_fd()).unwrap();
        #[allow(unsafe_code)]
        let flags = unsafe { libc::fcntl(listener.as_raw_fd(), libc::F_GETFL) };
        assert!(flags & libc::O_NONBLOCK != 0);
    }
}
