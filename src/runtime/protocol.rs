//! Canned current-time response.
//!
//! Every runtime answers a connection with the same framing:
//!
//! ```text
//! HTTP/1.1 200 OK\r\n
//! \r\n
//! Sun Oct 18 09:05:03 2026\r\n
//! ```
//!
//! The timestamp is the server's local time at the moment the response is
//! formatted, rendered in the classic `ctime` layout and cut to exactly
//! [`TIMESTAMP_WIDTH`] bytes. Request bytes are never inspected.

use chrono::{DateTime, Local};
use std::io::{self, Write};

/// Size of the per-connection scratch buffer (request in, response out).
pub const BUFFER_SIZE: usize = 1024;

/// Status line plus the empty header block.
pub const RESPONSE_PREFIX: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// Line terminator after the timestamp.
pub const RESPONSE_SUFFIX: &[u8] = b"\r\n";

/// Width of the rendered timestamp.
pub const TIMESTAMP_WIDTH: usize = 24;

/// Total length of every response.
pub const RESPONSE_LEN: usize = RESPONSE_PREFIX.len() + TIMESTAMP_WIDTH + RESPONSE_SUFFIX.len();

/// `ctime(3)` layout: `Www Mmm dd hh:mm:ss yyyy` with a space-padded day.
const CTIME_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

/// Source of the wall-clock time used for responses.
pub type Clock = fn() -> DateTime<Local>;

/// The system clock.
pub fn system_clock() -> DateTime<Local> {
    Local::now()
}

/// Render `now` into exactly [`TIMESTAMP_WIDTH`] bytes.
///
/// Longer renderings (years past 9999) are truncated, shorter ones padded
/// with spaces, so the framing never changes.
pub fn timestamp(now: &DateTime<Local>) -> [u8; TIMESTAMP_WIDTH] {
    let rendered = now.format(CTIME_FORMAT).to_string();
    let mut out = [b' '; TIMESTAMP_WIDTH];
    let n = rendered.len().min(TIMESTAMP_WIDTH);
    out[..n].copy_from_slice(&rendered.as_bytes()[..n]);
    out
}

/// Write the response for `now` into the start of `output`.
///
/// Returns the number of bytes written, always [`RESPONSE_LEN`].
pub fn write_response(output: &mut [u8], now: &DateTime<Local>) -> io::Result<usize> {
    if output.len() < RESPONSE_LEN {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "buffer too small for response",
        ));
    }

    let mut cursor = &mut output[..];
    cursor.write_all(RESPONSE_PREFIX)?;
    cursor.write_all(&timestamp(now))?;
    cursor.write_all(RESPONSE_SUFFIX)?;

    Ok(RESPONSE_LEN)
}

/// Build an owned response for runtimes that don't keep a slot buffer.
pub fn response(now: &DateTime<Local>) -> Vec<u8> {
    let mut out = vec![0u8; RESPONSE_LEN];
    // The buffer is sized exactly, so this cannot fail.
    let _ = write_response(&mut out, now);
    out
}
