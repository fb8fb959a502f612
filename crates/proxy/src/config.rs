//! Named tunables, centralizing the values the original C scatters as
//! preprocessor defines.

/// Default listen port used when the supervisor isn't given one on argv.
pub const DEFAULT_PORT: u16 = 8090;

/// Per-read buffer size. Upstream responses longer than this are
/// truncated — preserved from the original, not fixed (see `DESIGN.md`'s
/// Open Question decisions).
pub const BUFLEN: usize = 8192;

/// Cache base directory, relative to the worker's current directory.
pub const CACHE_BASEDIR: &str = "cache-ombud";

/// Maximum events drained per `Poll::poll` call.
pub const MAX_EVENTS: usize = 64;
