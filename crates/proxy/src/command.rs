//! Parses newline-terminated service-identifier commands out of a raw
//! read buffer.
//!
//! Mirrors the original's `strtok`-based `extract_cmds`: commands are
//! split on `\n`, a trailing `\r` is stripped from each, and empty
//! segments (leading or consecutive delimiters) are dropped. A final
//! segment with no trailing newline is incomplete and is dropped rather
//! than returned, since the caller hasn't seen the command's terminator
//! yet (it may still arrive on a later read).

/// Splits `buf` into individual service-identifier commands.
///
/// Only complete, newline-terminated lines are returned; a trailing
/// chunk with no final `\n` is an incomplete command and is dropped —
/// it may still arrive in full on a later read.
#[must_use]
pub fn extract_commands(buf: &[u8]) -> Vec<String> {
    let complete_len = match buf.iter().rposition(|&b| b == b'\n') {
        Some(i) => i + 1,
        None => return Vec::new(),
    };

    buf[..complete_len]
        .split(|&b| b == b'\n')
        .filter_map(|chunk| {
            let chunk = chunk.strip_suffix(b"\r").unwrap_or(chunk);
            if chunk.is_empty() {
                None
            } else {
                Some(String::from_utf8_lossy(chunk).into_owned())
            }
        })
        .collect()
}
