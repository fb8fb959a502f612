//! CLI parsing, forking `N` workers sharing one `SO_REUSEPORT` port, and
//! tearing them all down on `SIGINT`.
//!
//! Mirrors the original's `main()`/`sighandler()`/`child()` split: the
//! supervisor process parses argv, forks, records child PIDs, and kills
//! them all on `SIGINT`; each child becomes a worker running its own
//! reactor loop and never returns to the supervisor's control flow.

use clap::Parser;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::config::{CACHE_BASEDIR, DEFAULT_PORT};
use crate::error::{ReactorError, SupervisorError};
use crate::reactor;

/// Command-line surface for the supervisor.
///
/// Both positionals accept arbitrary strings rather than typed numbers:
/// the original silently falls back to its defaults on an invalid port or
/// worker count instead of aborting, so range/parse validation happens by
/// hand in [`resolve_port`]/[`resolve_worker_count`] rather than via
/// clap's own parse-or-exit behaviour. `--help`/`--version` still work,
/// since those are clap derive defaults rather than positional parsing.
#[derive(Parser, Debug)]
#[command(name = "ombud", version, about = "Command-driven caching TCP proxy")]
struct Cli {
    /// TCP port to listen on. Falls back to the default if missing or out
    /// of range.
    port: Option<String>,
    /// Number of worker processes to fork. Falls back to one per CPU core
    /// if missing or out of range.
    workers: Option<String>,
}

/// Parses `args`, forks the configured number of workers, and blocks
/// until every worker has exited (or `SIGINT` kills them all first).
pub fn run<I, T>(args: I) -> Result<(), SupervisorError>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    let port = resolve_port(cli.port.as_deref());
    let worker_count = resolve_worker_count(cli.workers.as_deref());

    tracing::info!(port, worker_count, "starting supervisor");

    let mut child_pids = Vec::with_capacity(worker_count);

    for index in 0..worker_count {
        // SAFETY: no additional threads have been spawned in this
        // process yet at the point each fork happens (the SIGINT-handling
        // thread is only spawned afterward, once forking is complete).
        #[allow(unsafe_code)]
        let fork_result =
            unsafe { fork() }.map_err(|source| SupervisorError::Fork { index, source })?;

        match fork_result {
            ForkResult::Child => {
                run_worker(index, port);
                unreachable!("run_worker never returns");
            }
            ForkResult::Parent { child } => {
                tracing::debug!(index, pid = child.as_raw(), "forked worker");
                child_pids.push(child.as_raw());
            }
        }
    }

    install_sigint_handler(child_pids)?;
    reap_children();
    Ok(())
}

/// Becomes a worker process: binds the shared listener, opens the cache,
/// and runs the reactor loop. Never returns; exits the process on any
/// fatal setup or reactor error.
fn run_worker(index: usize, port: u16) -> ! {
    let span = tracing::info_span!("worker", index);
    let _guard = span.enter();

    let outcome: Result<(), ReactorError> = (|| {
        let listener = netutil::setup_listener(port)?;
        tracing::info!(port, "listening");
        let cache = cache::Cache::init(CACHE_BASEDIR)?;
        tracing::info!(basedir = CACHE_BASEDIR, "cache initialized");
        reactor::run(listener, &cache, index)
    })();

    match outcome {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            tracing::error!(error = %err, "worker exiting");
            std::process::exit(1);
        }
    }
}

/// Spawns a background thread that kills every recorded worker PID as
/// soon as `SIGINT` arrives, then exits the supervisor process.
fn install_sigint_handler(child_pids: Vec<i32>) -> Result<(), SupervisorError> {
    let mut signals = signal_hook::iterator::Signals::new([signal_hook::consts::SIGINT])?;
    std::thread::spawn(move || {
        for _ in signals.forever() {
            tracing::warn!(count = child_pids.len(), "SIGINT received, killing workers");
            for &pid in &child_pids {
                let _ = nix::sys::signal::kill(Pid::from_raw(pid), nix::sys::signal::Signal::SIGKILL);
            }
            std::process::exit(130);
        }
    });
    Ok(())
}

/// Reaps worker processes until none remain, logging how each one ended.
fn reap_children() {
    loop {
        match waitpid(None, None) {
            Ok(WaitStatus::Exited(pid, code)) => {
                tracing::info!(pid = pid.as_raw(), code, "worker exited");
            }
            Ok(WaitStatus::Signaled(pid, signal, _)) => {
                tracing::warn!(pid = pid.as_raw(), ?signal, "worker terminated by signal");
            }
            Ok(_) => {}
            Err(nix::errno::Errno::ECHILD) => break,
            Err(err) => {
                tracing::warn!(error = %err, "waitpid failed");
                break;
            }
        }
    }
}

fn resolve_port(raw: Option<&str>) -> u16 {
    raw.and_then(|s| s.parse::<u32>().ok())
        .filter(|&port| port < 65536)
        .map(|port| port as u16)
        .unwrap_or(DEFAULT_PORT)
}

fn resolve_worker_count(raw: Option<&str>) -> usize {
    let child_max = sysconf_child_max();
    raw.and_then(|s| s.parse::<i64>().ok())
        .filter(|&count| count > 0 && count < child_max)
        .map(|count| count as usize)
        .unwrap_or_else(default_worker_count)
}

fn default_worker_count() -> usize {
    #[allow(unsafe_code)]
    let cores = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if cores > 0 {
        cores as usize
    } else {
        1
    }
}

fn sysconf_child_max() -> i64 {
    #[allow(unsafe_code)]
    let value = unsafe { libc::sysconf(libc::_SC_CHILD_MAX) };
    if value > 0 {
        value
    } else {
        i64::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_port_falls_back_on_missing_value() {
        assert_eq!(resolve_port(None), DEFAULT_PORT);
    }

    #[test]
    fn resolve_port_falls_back_on_out_of_range_value() {
        assert_eq!(resolve_port(Some("70000")), DEFAULT_PORT);
    }

    #[test]
    fn resolve_port_falls_back_on_non_numeric_value() {
        assert_eq!(resolve_port(Some("not-a-port")), DEFAULT_PORT);
    }

    #[test]
    fn resolve_port_accepts_valid_value() {
        assert_eq!(resolve_port(Some("9001")), 9001);
    }

    #[test]
    fn resolve_worker_count_falls_back_on_missing_value() {
        assert!(resolve_worker_count(None) >= 1);
    }

    #[test]
    fn resolve_worker_count_falls_back_on_zero() {
        assert_eq!(resolve_worker_count(Some("0")), default_worker_count());
    }

    #[test]
    fn resolve_worker_count_accepts_valid_value() {
        assert_eq!(resolve_worker_count(Some("4")), 4);
    }

    #[test]
    fn cli_parses_positional_port_and_workers() {
        let cli = Cli::parse_from(["ombud", "9100", "2"]);
        assert_eq!(cli.port.as_deref(), Some("9100"));
        assert_eq!(cli.workers.as_deref(), Some("2"));
    }

    #[test]
    fn cli_allows_missing_positionals() {
        let cli = Cli::parse_from(["ombud"]);
        assert_eq!(cli.port, None);
        assert_eq!(cli.workers, None);
    }
}
