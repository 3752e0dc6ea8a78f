//! Supervisor ↔ listener-worker control channel.
//!
//! A connected `UnixStream` pair per worker, asymmetric by convention
//! (supervisor keeps one half, the worker keeps the other; each side
//! closes the fd it didn't keep right after `fork()`), carrying exactly
//! one recognised framed message: the literal 4 bytes `"quit"`. Grounded
//! on `server.c`'s `socketpair(AF_UNIX, SOCK_STREAM, 0, ...)` and
//! `worker.c`'s fragment-tolerant read loop.

use std::io;
use std::io::Write;
use std::os::unix::net::UnixStream;

/// The only recognised IPC message.
pub const QUIT: [u8; 4] = *b"quit";

/// Creates a connected pair of Unix domain sockets for one worker's IPC
/// link.
pub fn pair() -> io::Result<(UnixStream, UnixStream)> {
    UnixStream::pair()
}

/// Sends the `"quit"` message. Best-effort: failures are left for the
/// caller to log, matching `IPCSEND`'s `log_perror` treatment of a failed
/// `write`.
pub fn send_quit(stream: &mut UnixStream) -> io::Result<()> {
    stream.write_all(&QUIT)
}
