//! Request line / header parser.
//!
//! Grounded on `request_getline`/`request_populate` in `request.c`: a
//! fixed 4096-byte line buffer filled one byte at a time (the original
//! drives this off `getc_unlocked` on a `FILE*`; here the equivalent is a
//! raw single-byte `libc::read` loop on the connection's fd, since a
//! `BufReader` would fight the per-read `SO_RCVTIMEO` semantics this
//! needs), a 100-header cap, and `SO_RCVTIMEO`-enforced timeouts (1s for
//! the very first request line on a freshly-accepted socket, 5s for
//! everything after — header lines within a request, and the wait for the
//! next request line during keep-alive).

use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::request::uri;

/// Minimum size of the per-line buffer (spec.md §4.3: "at minimum 4096
/// bytes for each line").
pub const MAX_LINE: usize = 4096;
/// Hard cap on header lines before the empty terminator.
pub const MAX_HEADERS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
}

/// One successfully parsed HTTP request.
#[derive(Debug)]
pub struct ParsedRequest {
    pub version_major: u8,
    pub version_minor: u8,
    pub method: Method,
    pub path: String,
    pub user_agent: Option<String>,
    pub raw_line: String,
}

/// Outcome of attempting to parse one request off the connection.
pub enum ParseOutcome {
    Request(ParsedRequest),
    /// A response with this code should be written (table in spec.md
    /// §4.3). Carries the raw request line text when one was already
    /// read off the wire, so the caller can still log it even though
    /// parsing failed partway through headers.
    Error(u16, Option<String>),
    /// Peer closed, or timed out, before producing any byte: drop the
    /// connection silently, no response written.
    NoResponse,
}

/// Parses one request line plus its headers. `first_line_timeout` is 1s
/// for the very first request on a freshly-accepted socket, 5s for a
/// request arriving during keep-alive (spec.md §5 cancellation rules).
pub fn parse_request(fd: RawFd, first_line_timeout: Duration) -> ParseOutcome {
    if set_timeout(fd, first_line_timeout).is_err() {
        return ParseOutcome::Error(500, None);
    }

    let line = match read_line(fd) {
        LineResult::Line(bytes) => bytes,
        LineResult::Closed => return ParseOutcome::NoResponse,
        LineResult::TooLong => return ParseOutcome::Error(431, None),
        LineResult::Malformed => return ParseOutcome::Error(400, None),
        LineResult::IoError => return ParseOutcome::Error(500, None),
    };

    // `raw_line` is a lossy rendering kept for logging and error responses
    // only; every field actually parsed below is split and validated off
    // the real bytes in `line`, so a raw (non-percent-encoded) invalid
    // UTF-8 byte the client puts directly in the request line cannot be
    // laundered into a valid path by this substitution.
    let raw_line = String::from_utf8_lossy(&line).into_owned();

    let mut parts = line.split(|&b| b == b' ');
    let (method_bytes, raw_path, version_bytes) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(p), Some(v), None) => (m, p, v),
        _ => return ParseOutcome::Error(400, Some(raw_line)),
    };

    let method = match method_bytes {
        b"GET" => Method::Get,
        b"HEAD" => Method::Head,
        b"BREW" => return ParseOutcome::Error(418, Some(raw_line)),
        _ => return ParseOutcome::Error(400, Some(raw_line)),
    };

    let version_str = match std::str::from_utf8(version_bytes) {
        Ok(s) => s,
        Err(_) => return ParseOutcome::Error(400, Some(raw_line)),
    };
    let (major, minor) = match parse_version(version_str) {
        Some(v) => v,
        None => return ParseOutcome::Error(400, Some(raw_line)),
    };
    if (major, minor) < (1, 0) {
        return ParseOutcome::Error(400, Some(raw_line));
    }
    if (major, minor) != (1, 0) && (major, minor) != (1, 1) {
        return ParseOutcome::Error(505, Some(raw_line));
    }

    let path_no_query = match raw_path.iter().position(|&b| b == b'?') {
        Some(idx) => &raw_path[..idx],
        None => raw_path,
    };
    if path_no_query.first() != Some(&b'/') {
        return ParseOutcome::Error(400, Some(raw_line));
    }

    let decoded = uri::decode(path_no_query);
    if uri::has_control_byte(&decoded) {
        return ParseOutcome::Error(400, Some(raw_line));
    }
    let path = match uri::validate_utf8(&decoded) {
        Some(s) => s.to_string(),
        None => return ParseOutcome::Error(400, Some(raw_line)),
    };

    if set_timeout(fd, Duration::from_secs(5)).is_err() {
        return ParseOutcome::Error(500, Some(raw_line));
    }

    let mut user_agent = None;
    let mut header_count = 0usize;
    loop {
        if header_count >= MAX_HEADERS {
            // "parser stops; the last code stands" — proceed with what's
            // been captured so far rather than erroring out.
            break;
        }

        let header_bytes = match read_line(fd) {
            LineResult::Line(bytes) => bytes,
            LineResult::Closed => return ParseOutcome::NoResponse,
            LineResult::TooLong => return ParseOutcome::Error(431, Some(raw_line)),
            LineResult::Malformed => return ParseOutcome::Error(400, Some(raw_line)),
            LineResult::IoError => return ParseOutcome::Error(500, Some(raw_line)),
        };

        if header_bytes.is_empty() {
            break;
        }

        let header_line = String::from_utf8_lossy(&header_bytes).into_owned();
        let (name, value) = match header_line.split_once(": ") {
            Some(nv) => nv,
            None => return ParseOutcome::Error(400, Some(raw_line)),
        };

        if name.eq_ignore_ascii_case("user-agent") {
            user_agent = Some(value.to_string());
        }

        header_count += 1;
    }

    ParseOutcome::Request(ParsedRequest {
        version_major: major,
        version_minor: minor,
        method,
        path,
        user_agent,
        raw_line,
    })
}

fn parse_version(s: &str) -> Option<(u8, u8)> {
    let rest = s.strip_prefix("HTTP/")?;
    let (maj, min) = rest.split_once('.')?;
    Some((maj.parse().ok()?, min.parse().ok()?))
}

enum LineResult {
    Line(Vec<u8>),
    /// EOF with zero bytes read for this line.
    Closed,
    TooLong,
    Malformed,
    IoError,
}

/// Reads one CRLF-terminated line (CRLF stripped), matching
/// `request_getline`'s byte-at-a-time scan with an embedded-NUL check.
fn read_line(fd: RawFd) -> LineResult {
    let mut buf = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    let mut saw_any_byte = false;

    loop {
        if buf.len() >= MAX_LINE {
            return LineResult::TooLong;
        }

        let n = unsafe { libc::read(fd, byte.as_mut_ptr() as *mut libc::c_void, 1) };
        if n == 0 {
            return if saw_any_byte {
                LineResult::Malformed
            } else {
                LineResult::Closed
            };
        }
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return if saw_any_byte {
                LineResult::Malformed
            } else {
                LineResult::Closed
            };
        }

        saw_any_byte = true;
        let b = byte[0];

        if b == b'\n' {
            if buf.last() != Some(&b'\r') {
                return LineResult::Malformed;
            }
            buf.pop();
            if buf.iter().any(|&c| c == 0) {
                return LineResult::Malformed;
            }
            return LineResult::Line(buf);
        }

        buf.push(b);
    }
}

fn set_timeout(fd: RawFd, timeout: Duration) -> io::Result<()> {
    let tv = libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parses_major_minor() {
        assert_eq!(parse_version("HTTP/1.1"), Some((1, 1)));
        assert_eq!(parse_version("HTTP/1.0"), Some((1, 0)));
        assert_eq!(parse_version("HTTP/0.9"), Some((0, 9)));
        assert_eq!(parse_version("HTTP/2"), None);
        assert_eq!(parse_version("ftp/1.1"), None);
    }

    #[test]
    fn old_versions_sort_below_one_dot_zero() {
        assert!((0u8, 9u8) < (1u8, 0u8));
        assert!(!((1u8, 1u8) < (1u8, 0u8)));
    }

    /// A raw (non-percent-encoded) invalid UTF-8 byte in the request
    /// line — `0xFF` is an explicitly rejected lead byte per spec.md
    /// §4.3 — must be rejected with 400, not silently replaced with
    /// U+FFFD and accepted as a path.
    #[test]
    fn raw_invalid_utf8_byte_in_path_is_rejected() {
        use std::io::{Read as _, Write as _};
        use std::net::{TcpListener, TcpStream};
        use std::os::fd::AsRawFd as _;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let fd = stream.as_raw_fd();
            parse_request(fd, Duration::from_secs(1))
        });

        let mut client = TcpStream::connect(addr).unwrap();
        let mut line = b"GET /abc".to_vec();
        line.push(0xFF);
        line.extend_from_slice(b"def HTTP/1.1\r\n\r\n");
        client.write_all(&line).unwrap();

        match server.join().unwrap() {
            ParseOutcome::Error(400, _) => {}
            other => panic!("expected 400 for a raw invalid UTF-8 byte, got a different outcome: {}",
                match other {
                    ParseOutcome::Request(_) => "Request(..)".to_string(),
                    ParseOutcome::Error(c, _) => format!("Error({c}, ..)"),
                    ParseOutcome::NoResponse => "NoResponse".to_string(),
                }),
        }

        let mut buf = [0u8; 1];
        let _ = client.read(&mut buf);
    }
}
