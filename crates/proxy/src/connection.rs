//! Per-fd connection state tracked by the reactor.
//!
//! Replaces the original's `struct command` (a tagged union keyed on a
//! `uint8_t cmd` field with `void*` event-loop payload) with a Rust enum
//! indexed by `mio::Token` in a `slab::Slab`.

use mio::net::TcpStream;
use mio::Token;

/// One slot in the reactor's connection table.
pub enum Connection {
    /// A client's control connection, reading newline-terminated
    /// `HOST:PORT` commands (`READ_CMD` in the original).
    Client(ClientConn),
    /// An in-flight read from an upstream host, started on a cache miss
    /// (`READ_REMOTE` in the original; `RELAY_BACK` is collapsed into the
    /// handling of this variant, see `DESIGN.md`).
    Remote(RemoteConn),
}

/// State for a client's control connection.
pub struct ClientConn {
    pub stream: TcpStream,
    /// Bytes relayed from an upstream read that didn't fit in one
    /// non-blocking `send`. Flushed on subsequent writable events.
    pub pending_write: Vec<u8>,
}

impl ClientConn {
    #[must_use]
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            pending_write: Vec::new(),
        }
    }
}

/// State for an upstream connection opened to satisfy a cache miss.
pub struct RemoteConn {
    pub stream: TcpStream,
    /// The service identifier this read will be cached under.
    pub service: String,
    /// The client connection to relay the response back to.
    pub client_token: Token,
}
