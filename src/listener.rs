//! Listener worker: owns one address family's listening socket, accepts
//! connections, forks a request handler per connection under a fixed
//! concurrency budget, and watches its IPC link for a shutdown command.
//!
//! Grounded on `worker_loop` in `worker.c`: a `poll()` tick over the
//! listen fd and the IPC fd together, fork-budget accounting reaped
//! opportunistically, and IPC framed as the literal 4 bytes `"quit"`.

use std::io::Read;
use std::net::TcpStream;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Instant;

use crate::ipc;
use crate::net::{self, Family, Listener};
use crate::request;
use crate::supervisor::reset_child_signals;

/// Maximum concurrently outstanding request handlers per worker
/// (spec.md §4.2/§5).
pub const FORK_BUDGET: usize = 8;

/// `poll()` tick, bounding child-reap and IPC latency (spec.md §5).
const POLL_TICK_MS: i32 = 250;

/// Runs until the parent requests `"quit"`, the parent's IPC link dies, or
/// a fatal `accept`/`poll` error occurs. Never returns; calls
/// `std::process::exit`.
pub fn worker_loop(mut ipc_sock: UnixStream, family: Family, listen: &Listener, root: PathBuf) -> ! {
    let listen_fd = listen.as_raw_fd();
    let ipc_fd = ipc_sock.as_raw_fd();

    let mut forks_avail = FORK_BUDGET;
    let mut ipc_buf: Vec<u8> = Vec::with_capacity(ipc::QUIT.len());

    loop {
        let mut fds = [
            libc::pollfd {
                fd: listen_fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: ipc_fd,
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        let n = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_TICK_MS) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            tracing::error!(family = family.name(), %err, "fatal poll error");
            drain_children(&mut forks_avail, true);
            std::process::exit(1);
        }

        if n == 0 || forks_avail == 0 {
            drain_children(&mut forks_avail, forks_avail == 0);
        }

        let ipc_ready = fds[1].revents & libc::POLLIN != 0;
        let listen_ready = fds[0].revents & libc::POLLIN != 0;

        if ipc_ready {
            let mut byte = [0u8; 4];
            let want = ipc::QUIT.len() - ipc_buf.len();
            match ipc_sock.read(&mut byte[..want]) {
                Ok(0) => {
                    tracing::warn!(family = family.name(), "ipc link closed, parent presumed dead");
                    drain_children(&mut forks_avail, true);
                    std::process::exit(1);
                }
                Ok(got) => {
                    ipc_buf.extend_from_slice(&byte[..got]);
                    if ipc_buf.len() >= ipc::QUIT.len() {
                        if ipc_buf[..ipc::QUIT.len()] == ipc::QUIT[..] {
                            tracing::info!(family = family.name(), "quit received, draining");
                            drain_children(&mut forks_avail, true);
                            std::process::exit(0);
                        }
                        ipc_buf.clear();
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::warn!(family = family.name(), %e, "ipc read error, parent presumed dead");
                    drain_children(&mut forks_avail, true);
                    std::process::exit(1);
                }
            }
        }

        if listen_ready && forks_avail > 0 {
            match listen.accept() {
                Ok((stream, peer_addr)) => {
                    let accepted_at = Instant::now();
                    forks_avail -= 1;
                    fork_handler(listen, stream, peer_addr, accepted_at, &root);
                }
                Err(e) => {
                    if !is_transient_accept_error(&e) {
                        tracing::error!(family = family.name(), %e, "fatal accept error");
                        drain_children(&mut forks_avail, true);
                        std::process::exit(1);
                    }
                }
            }
        }
    }
}

fn fork_handler(listen: &Listener, stream: TcpStream, peer_addr: std::net::SocketAddr, accepted_at: Instant, root: &std::path::Path) {
    match unsafe { libc::fork() } {
        -1 => {
            tracing::error!(err = %std::io::Error::last_os_error(), "fork failed, dropping connection");
        }
        0 => {
            reset_child_signals();
            net::close_raw(listen.as_raw_fd());
            let wait_time = accepted_at.elapsed();
            let code = request::serve_connection(stream, peer_addr, wait_time, root);
            std::process::exit(code);
        }
        _child_pid => {
            drop(stream);
        }
    }
}

/// Reaps terminated children, incrementing `forks_avail` per reap.
/// `must_block_once` forces at least one blocking `waitpid` before
/// switching to non-blocking drains, matching spec.md §4.2 step 2's "at
/// least once if `forks_avail == 0`" rule.
fn drain_children(forks_avail: &mut usize, must_block_once: bool) {
    if must_block_once && *forks_avail < FORK_BUDGET {
        let mut status = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
        if pid > 0 {
            *forks_avail = (*forks_avail + 1).min(FORK_BUDGET);
        }
    }

    loop {
        if *forks_avail >= FORK_BUDGET {
            break;
        }
        let mut status = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
        *forks_avail = (*forks_avail + 1).min(FORK_BUDGET);
    }
}

/// Accept errors that are transient or peer-fault and should not bring
/// the worker down (spec.md §4.2 step 6).
fn is_transient_accept_error(e: &std::io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(
            libc::EAGAIN
                | libc::EPROTO
                | libc::ENOPROTOOPT
                | libc::EHOSTDOWN
                | libc::ENONET
                | libc::EHOSTUNREACH
                | libc::EOPNOTSUPP
                | libc::ENETUNREACH
        )
    )
}
