//! Response-line/header/body composition and the built-in error body.
//!
//! Grounded on `request_put_common`/`request_put_error_body`/the
//! response-writing tail of `request_process` in `request.c`: reason
//! strings are a fixed table (`request_get_respstr`), the error body is a
//! byte-exact literal template, and 200 bodies are streamed from the open
//! file handle in modest chunks rather than read fully into memory first.

use std::fs::File;
use std::io::{self, Read, Write};
use std::time::SystemTime;

use crate::clock;
use crate::request::parser::Method;

/// Fixed reason-phrase table (spec.md §6). Unknown codes fall back to
/// "Unknown Response Code".
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        302 => "Found",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Request Entity Too Large",
        418 => "I'm a teapot",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        505 => "HTTP Version Not Supported",
        _ => "Unknown Response Code",
    }
}

/// Whether this response code forces `Connection: close` (spec.md §4.5
/// step 3 / §9's kill-flag note): any 5xx, or exactly 400 or 418.
pub fn should_kill(code: u16) -> bool {
    code >= 500 || code == 400 || code == 418
}

/// The byte-exact built-in error body, with `code`/`reason` substituted
/// into both the `<title>` and `<h1>`.
pub fn error_body(code: u16) -> Vec<u8> {
    let reason = reason_phrase(code);
    format!(
        "<!DOCTYPE html>\n\
<html xmlns=\"http://www.w3.org/1999/xhtml\">\n\
<head>\n\
<meta charset=\"utf-8\" />\n\
<title>{code} {reason}</title>\n\
</head>\n\
<body>\n\
<h1>{code} {reason}</h1>\n\
<p>Your request could not be served.</p>\n\
</body>\n\
</html>\n"
    )
    .into_bytes()
}

/// What's being served alongside the status line, beyond the mandatory
/// `Server`/`Date` pair.
pub enum Body<'a> {
    /// No file involved (pure error response, or an internal 500 with
    /// nothing else set).
    None,
    /// A redirect list: `location` is its first line, CRLF-stripped. The
    /// file is still stat'd for `Last-Modified`/`Content-Length`, but no
    /// body bytes are sent (matches spec.md §8 scenario S3).
    Redirect {
        location: &'a str,
        len: u64,
        modified: SystemTime,
    },
    /// A servable file (`index.html`/`robots.txt`/bucket target without a
    /// redirect reinterpretation); streamed as the body for `GET`.
    File {
        content_type: &'static str,
        file: &'a mut File,
        len: u64,
        modified: SystemTime,
    },
}

/// Streaming chunk size for file bodies. Spec.md §4.5 only requires "≤64
/// bytes is enough; larger is fine" — this is comfortably larger, which
/// the spec explicitly permits.
const COPY_CHUNK: usize = 8192;

/// Writes one complete HTTP response: status line, headers, and body
/// (unless `method` is `HEAD`). Best-effort: write errors are returned to
/// the caller, which logs and moves on per spec.md §7's "I/O write error
/// on the response socket" policy — this function does not retry.
pub fn write_response(
    w: &mut impl Write,
    code: u16,
    method: Method,
    version_major: u8,
    version_minor: u8,
    kill: bool,
    body: Body<'_>,
) -> io::Result<()> {
    let reason = reason_phrase(code);
    let date = clock::http_date(SystemTime::now());

    write!(w, "HTTP/{version_major}.{version_minor} {code} {reason}\r\n")?;
    write!(w, "Server: mek.lu\r\n")?;
    write!(w, "Date: {date}\r\n")?;

    match &body {
        Body::Redirect { location, .. } => {
            write!(w, "Location: {location}\r\n")?;
        }
        _ => {}
    }

    match &body {
        Body::Redirect {
            modified, len, ..
        } => {
            write!(w, "Last-Modified: {}\r\n", clock::http_date(*modified))?;
            write!(w, "Content-Type: text/plain; charset=utf-8\r\n")?;
            write!(w, "Content-Length: {len}\r\n")?;
        }
        Body::File {
            content_type,
            modified,
            len,
            ..
        } => {
            write!(w, "Last-Modified: {}\r\n", clock::http_date(*modified))?;
            write!(w, "Content-Type: {content_type}\r\n")?;
            write!(w, "Content-Length: {len}\r\n")?;
        }
        Body::None => {}
    }

    if kill {
        write!(w, "Connection: close\r\n")?;
    } else if (version_major, version_minor) == (1, 0) {
        write!(w, "Connection: keep-alive\r\n")?;
    }

    let error_bytes = if code >= 400 { Some(error_body(code)) } else { None };
    if let Some(ref bytes) = error_bytes {
        write!(w, "Content-Type: application/xhtml+xml; charset=utf-8\r\n")?;
        write!(w, "Content-Length: {}\r\n", bytes.len())?;
    }

    write!(w, "\r\n")?;

    if method == Method::Head {
        return Ok(());
    }

    if let Some(bytes) = error_bytes {
        w.write_all(&bytes)?;
        return Ok(());
    }

    if let Body::File { file, .. } = body {
        stream_file(w, file)?;
    }

    Ok(())
}

fn stream_file(w: &mut impl Write, file: &mut File) -> io::Result<()> {
    let mut buf = [0u8; COPY_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        w.write_all(&buf[..n])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_phrases_match_fixed_table() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(418), "I'm a teapot");
        assert_eq!(reason_phrase(999), "Unknown Response Code");
    }

    #[test]
    fn kill_flag_matches_spec_table() {
        assert!(should_kill(500));
        assert!(should_kill(400));
        assert!(should_kill(418));
        assert!(!should_kill(403));
        assert!(!should_kill(404));
        assert!(!should_kill(405));
        assert!(!should_kill(408));
        assert!(!should_kill(413));
        assert!(!should_kill(431));
        assert!(!should_kill(501));
    }

    #[test]
    fn error_body_substitutes_code_and_reason_twice() {
        let body = String::from_utf8(error_body(404)).unwrap();
        assert_eq!(body.matches("404 Not Found").count(), 2);
        assert!(body.starts_with("<!DOCTYPE html>"));
        assert!(body.ends_with("</html>\n"));
    }

    #[test]
    fn s1_index_response_shape() {
        use std::io::{Seek, SeekFrom};

        let path = std::env::temp_dir().join(format!("mekdotlu-test-{}.html", std::process::id()));
        std::fs::write(&path, b"<html/>").unwrap();
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let len = file.metadata().unwrap().len();
        let modified = file.metadata().unwrap().modified().unwrap();

        let mut out: Vec<u8> = Vec::new();
        write_response(
            &mut out,
            200,
            Method::Get,
            1,
            1,
            false,
            Body::File {
                content_type: "application/xhtml+xml; charset=utf-8",
                file: &mut file,
                len,
                modified,
            },
        )
        .unwrap();
        std::fs::remove_file(&path).ok();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Server: mek.lu\r\n"));
        assert!(text.contains("Content-Type: application/xhtml+xml; charset=utf-8\r\n"));
        assert!(text.contains("Content-Length: 7\r\n"));
        assert!(text.ends_with("<html/>"));
    }

    #[test]
    fn status_line_reflects_the_requests_actual_version() {
        let mut out: Vec<u8> = Vec::new();
        write_response(&mut out, 200, Method::Head, 1, 0, false, Body::None).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.0 200 OK\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
    }
}
