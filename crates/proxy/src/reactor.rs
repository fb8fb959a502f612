//! Edge-triggered reactor: one instance runs per forked worker process.
//!
//! Built on `mio::Poll`, which is edge-triggered by construction on Linux
//! (`EPOLLET`), matching the readiness model of the original's raw
//! `epoll_wait` loop. Connections live in a `slab::Slab`, keyed by
//! `mio::Token`, replacing the original's `event.data.ptr` payload.

use std::io::{ErrorKind, Read};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use slab::Slab;

use cache::Cache;

use crate::command::extract_commands;
use crate::config::{BUFLEN, MAX_EVENTS};
use crate::connection::{ClientConn, Connection, RemoteConn};
use crate::dial::connect_remote;
use crate::error::ReactorError;

const LISTENER: Token = Token(usize::MAX);

/// Runs the reactor loop on `listener` until a fatal I/O error occurs.
///
/// Blocks forever. The supervisor's `SIGINT` handling terminates the
/// whole worker process rather than asking the reactor to shut down
/// gracefully (no graceful drain on shutdown is in scope).
pub fn run(
    listener: std::net::TcpListener,
    cache: &Cache,
    worker_index: usize,
) -> Result<(), ReactorError> {
    listener.set_nonblocking(true)?;
    let mut listener = TcpListener::from_std(listener);

    let mut poll = Poll::new()?;
    poll.registry()
        .register(&mut listener, LISTENER, Interest::READABLE)?;

    let mut connections: Slab<Connection> = Slab::new();
    let mut events = Events::with_capacity(MAX_EVENTS);

    tracing::info!(worker = worker_index, "entering reactor loop");

    loop {
        poll.poll(&mut events, None)?;

        for event in events.iter() {
            let token = event.token();

            if token == LISTENER {
                accept_all(&poll, &mut listener, &mut connections);
                continue;
            }

            if event.is_error() {
                remove_connection(&poll, &mut connections, token);
                continue;
            }

            if event.is_readable() {
                handle_readable(&poll, &mut connections, cache, token);
            }

            if event.is_writable() {
                handle_writable(&poll, &mut connections, token);
            }
        }
    }
}

/// Drains every pending connection on `listener`.
///
/// A transient accept failure is a recoverable per-connection error, not
/// a reason to tear down the whole worker: it is logged and the accept
/// loop for this pass simply ends, matching the original's `do_accept`
/// (which `perror`s and stops accepting for that pass without aborting).
fn accept_all(poll: &Poll, listener: &mut TcpListener, connections: &mut Slab<Connection>) {
    loop {
        match listener.accept() {
            Ok((stream, _addr)) => {
                let entry = connections.vacant_entry();
                let token = Token(entry.key());
                let mut conn = ClientConn::new(stream);
                if let Err(err) = poll
                    .registry()
                    .register(&mut conn.stream, token, Interest::READABLE)
                {
                    tracing::warn!(error = %err, "could not register accepted connection");
                    continue;
                }
                entry.insert(Connection::Client(conn));
            }
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => return,
            Err(err) => {
                tracing::warn!(error = %err, "accept failed");
                return;
            }
        }
    }
}

fn handle_readable(poll: &Poll, connections: &mut Slab<Connection>, cache: &Cache, token: Token) {
    match connections.get(token.0) {
        Some(Connection::Client(_)) => handle_client_readable(poll, connections, cache, token),
        Some(Connection::Remote(_)) => handle_remote_readable(poll, connections, cache, token),
        None => {}
    }
}

fn handle_client_readable(
    poll: &Poll,
    connections: &mut Slab<Connection>,
    cache: &Cache,
    token: Token,
) {
    let mut buf = [0u8; BUFLEN];
    let read = {
        let Some(Connection::Client(client)) = connections.get_mut(token.0) else {
            return;
        };
        client.stream.read(&mut buf)
    };

    match read {
        Ok(0) => remove_connection(poll, connections, token),
        Ok(n) => {
            for service in extract_commands(&buf[..n]) {
                dispatch_command(poll, connections, cache, token, service);
            }
        }
        Err(ref err) if err.kind() == ErrorKind::WouldBlock => {}
        Err(err) => {
            tracing::warn!(error = %err, "client read error");
            remove_connection(poll, connections, token);
        }
    }
}

/// Serves `service` from cache if possible, otherwise dials upstream and
/// registers a new [`RemoteConn`] to collect the response.
fn dispatch_command(
    poll: &Poll,
    connections: &mut Slab<Connection>,
    cache: &Cache,
    client_token: Token,
    service: String,
) {
    let sent = {
        let Some(Connection::Client(client)) = connections.get_mut(client_token.0) else {
            return;
        };
        cache.sendfile(&client.stream, &service)
    };

    match sent {
        Ok(bytes) if bytes > 0 => {
            tracing::debug!(service = %service, bytes, "served from cache");
        }
        Ok(_) => match connect_remote(&service) {
            Ok(remote_stream) => {
                let entry = connections.vacant_entry();
                let remote_token = Token(entry.key());
                let mut remote_conn = RemoteConn {
                    stream: remote_stream,
                    service,
                    client_token,
                };
                if let Err(err) = poll.registry().register(
                    &mut remote_conn.stream,
                    remote_token,
                    Interest::READABLE,
                ) {
                    tracing::warn!(error = %err, "could not register upstream socket");
                    return;
                }
                entry.insert(Connection::Remote(remote_conn));
            }
            Err(err) => {
                tracing::warn!(service = %service, error = %err, "could not connect upstream");
            }
        },
        Err(err) => {
            tracing::warn!(service = %service, error = %err, "cache read error");
        }
    }
}

fn handle_remote_readable(
    poll: &Poll,
    connections: &mut Slab<Connection>,
    cache: &Cache,
    token: Token,
) {
    let mut buf = [0u8; BUFLEN];
    let read = {
        let Some(Connection::Remote(remote)) = connections.get_mut(token.0) else {
            return;
        };
        remote.stream.read(&mut buf)
    };

    if matches!(&read, Err(err) if err.kind() == ErrorKind::WouldBlock) {
        return;
    }

    let (client_token, service) = {
        let Some(Connection::Remote(remote)) = connections.get(token.0) else {
            return;
        };
        (remote.client_token, remote.service.clone())
    };

    let n = match read {
        Ok(n) => n,
        Err(err) => {
            tracing::warn!(service = %service, error = %err, "upstream read error");
            0
        }
    };

    if n > 0 {
        let data = &buf[..n];
        if let Err(err) = cache.write(&service, data) {
            tracing::warn!(service = %service, error = %err, "cache write failed");
        }
        relay_to_client(poll, connections, client_token, data);
    }

    remove_connection(poll, connections, token);
}

/// Sends `data` back to the client, arming the writable interest for
/// whatever doesn't fit in one non-blocking `send`.
fn relay_to_client(poll: &Poll, connections: &mut Slab<Connection>, client_token: Token, data: &[u8]) {
    let Some(Connection::Client(client)) = connections.get_mut(client_token.0) else {
        return;
    };

    match netutil::send_all(&client.stream, data) {
        Ok(sent) if sent == data.len() => {}
        Ok(sent) => {
            client.pending_write = data[sent..].to_vec();
            if let Err(err) = poll.registry().reregister(
                &mut client.stream,
                client_token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                tracing::warn!(error = %err, "could not arm client socket for writable");
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to relay upstream data to client");
        }
    }
}

fn handle_writable(poll: &Poll, connections: &mut Slab<Connection>, token: Token) {
    let Some(Connection::Client(client)) = connections.get_mut(token.0) else {
        return;
    };

    if client.pending_write.is_empty() {
        return;
    }

    match netutil::send_all(&client.stream, &client.pending_write) {
        Ok(sent) => {
            client.pending_write.drain(..sent);
            if client.pending_write.is_empty() {
                if let Err(err) =
                    poll.registry()
                        .reregister(&mut client.stream, token, Interest::READABLE)
                {
                    tracing::warn!(error = %err, "could not disarm writable interest");
                }
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed flushing pending data to client");
            remove_connection(poll, connections, token);
        }
    }
}

fn remove_connection(poll: &Poll, connections: &mut Slab<Connection>, token: Token) {
    if let Some(mut conn) = connections.try_remove(token.0) {
        let _ = match &mut conn {
            Connection::Client(client) => poll.registry().deregister(&mut client.stream),
            Connection::Remote(remote) => poll.registry().deregister(&mut remote.stream),
        };
    }
}
