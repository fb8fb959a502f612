#![deny(unsafe_code)]
//! Reactor, command parsing, and multi-process supervisor for the caching
//! proxy.
//!
//! # Overview
//!
//! A control connection sends newline-terminated `HOST:PORT` service
//! identifiers ([`command::extract_commands`]). Each one is served from
//! the on-disk cache or dialed upstream ([`dial::connect_remote`]) and the
//! response is cached and relayed back. [`reactor::run`] drives this for
//! one worker process; [`supervisor::run`] forks `N` of them sharing a
//! single `SO_REUSEPORT` listener and tears them all down on `SIGINT`.
//!
//! # Design
//!
//! Connections are tracked in a `slab::Slab<connection::Connection>`
//! keyed by `mio::Token`, replacing the original C's `event.data.ptr`
//! payload. `mio::Poll` is edge-triggered by construction on Linux,
//! matching the original's raw `epoll_wait`/`EPOLLET` loop.

pub mod command;
pub mod config;
pub mod connection;
pub mod dial;
pub mod error;
pub mod reactor;
pub mod supervisor;

pub use error::{ReactorError, SupervisorError};
