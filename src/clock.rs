//! HTTP-date and log-timestamp formatting.
//!
//! Clock access itself is out of scope per spec.md §1 — we reach straight
//! for `std::time::SystemTime`/`Instant`, no crate needed. What *is* in
//! scope is reproducing the original's exact date strings
//! (`request.c`/`log.c` both call `strftime` with a literal format string),
//! so this hand-rolls the two formats via `libc::strftime` rather than
//! pulling in `chrono`/`time` — the teacher doesn't depend on either, and
//! a three-line `strftime` wrapper is the idiomatic libc-adjacent way to
//! get this exact byte-for-byte output.

use std::time::{SystemTime, UNIX_EPOCH};

/// `%a, %d %b %Y %H:%M:%S GMT`, used for the `Date` and `Last-Modified`
/// response headers. Grounded on `request_put_common` / `request_process`
/// in `request.c`.
pub fn http_date(t: SystemTime) -> String {
    strftime_at(t, "%a, %d %b %Y %H:%M:%S GMT\0", true)
}

/// `[%Y-%m-%d %H:%M:%S %z]`, used for log line timestamps. Grounded on
/// `vlog_raw` in `log.c` (which uses local time, unlike the HTTP dates).
pub fn log_timestamp(t: SystemTime) -> String {
    format!("[{}]", strftime_at(t, "%Y-%m-%d %H:%M:%S %z\0", false))
}

fn strftime_at(t: SystemTime, fmt_nul: &str, utc: bool) -> String {
    let secs = t
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as libc::time_t)
        .unwrap_or(0);

    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    unsafe {
        if utc {
            libc::gmtime_r(&secs, &mut tm);
        } else {
            libc::localtime_r(&secs, &mut tm);
        }
    }

    let mut buf = [0u8; 64];
    let written = unsafe {
        libc::strftime(
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
            fmt_nul.as_ptr() as *const libc::c_char,
            &tm,
        )
    };

    String::from_utf8_lossy(&buf[..written]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_date_has_gmt_suffix() {
        let s = http_date(UNIX_EPOCH);
        assert!(s.ends_with("GMT"));
        assert!(s.starts_with("Thu, 01 Jan 1970"));
    }

    #[test]
    fn log_timestamp_is_bracketed() {
        let s = log_timestamp(SystemTime::now());
        assert!(s.starts_with('['));
        assert!(s.ends_with(']'));
    }
}
