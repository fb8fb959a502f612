use thiserror::Error;

/// Errors raised while running a single worker's reactor loop.
#[derive(Debug, Error)]
pub enum ReactorError {
    /// A cache-layer failure (see [`cache::CacheError`]).
    #[error(transparent)]
    Cache(#[from] cache::CacheError),
    /// A listener/socket-layer failure (see [`netutil::NetError`]).
    #[error(transparent)]
    Net(#[from] netutil::NetError),
    /// Any other OS-level I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by the supervisor before or while managing workers.
///
/// A worker's own setup/reactor failures ([`ReactorError`]) are logged and
/// turned into a process exit code inside the worker itself, not
/// propagated back up through this type — the supervisor only ever learns
/// a worker died via `waitpid`.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// `fork(2)` itself failed for the given worker index.
    #[error("could not fork worker {index}: {source}")]
    Fork { index: usize, source: nix::Error },
    /// Installing the `SIGINT` handler failed.
    #[error("could not install SIGINT handler: {0}")]
    Signal(#[from] std::io::Error),
}
