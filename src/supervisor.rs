//! Supervisor: owns both listening sockets, forks/respawns a listener
//! worker per address family, relays shutdown, and reaps children.
//!
//! Grounded on `server_loop`/`server_constrain`/the `FORKWORKER`/`IPCSEND`
//! macros in `server.c`. Signal handling uses the original's three-signal
//! policy (`SIGINT`/`SIGTERM`/`SIGQUIT` set a flag and rely on `wait`
//! returning `EINTR`) rather than anything async-runtime-flavored, since
//! the whole point of this architecture is that there is no runtime.

use std::io;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::{self, ServerConfig};
use crate::ipc;
use crate::listener;
use crate::net::{Family, Listener};

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_signum: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Installs the supervisor's signal policy: `SIGINT`/`SIGTERM`/`SIGQUIT`
/// set a flag and let the blocking `wait` in [`Supervisor::run`] observe
/// `EINTR`. Call once, before `run`.
pub fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, request_shutdown as usize);
        libc::signal(libc::SIGTERM, request_shutdown as usize);
        libc::signal(libc::SIGQUIT, request_shutdown as usize);
    }
}

/// Resets signal disposition in a freshly forked child (a listener worker
/// forked from the supervisor, or a request handler forked from a
/// listener worker): `SIGINT` is ignored, `SIGTERM`/`SIGQUIT` take their
/// default action (spec.md §5).
pub fn reset_child_signals() {
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_IGN);
        libc::signal(libc::SIGTERM, libc::SIG_DFL);
        libc::signal(libc::SIGQUIT, libc::SIG_DFL);
    }
}

/// Child-exit classification feeding the respawn decision (spec.md §9).
enum ChildExit {
    Clean,
    Broken(i32),
    Signaled(i32),
}

struct WorkerDescriptor {
    pid: Option<libc::pid_t>,
    respawn: bool,
    ipc: Option<UnixStream>,
}

impl WorkerDescriptor {
    fn for_listener(has_listener: bool) -> Self {
        Self {
            pid: None,
            respawn: has_listener,
            ipc: None,
        }
    }

    fn is_retired(&self) -> bool {
        self.pid.is_none() && !self.respawn
    }
}

pub struct Supervisor {
    cfg: ServerConfig,
    v4: Option<Listener>,
    v6: Option<Listener>,
    v4_worker: WorkerDescriptor,
    v6_worker: WorkerDescriptor,
    quit_relayed: bool,
}

impl Supervisor {
    /// Binds IPv4 and IPv6 listening sockets on `cfg.port`, then performs
    /// the privilege-reduction step. Fails only if *both* families fail
    /// to bind (spec.md §4.1).
    pub fn init(cfg: ServerConfig) -> io::Result<Self> {
        let v4 = Listener::bind(Family::V4, cfg.port);
        let v6 = Listener::bind(Family::V6, cfg.port);

        if let Err(ref e) = v4 {
            tracing::warn!(family = "ipv4", %e, "bind failed");
        }
        if let Err(ref e) = v6 {
            tracing::warn!(family = "ipv6", %e, "bind failed");
        }

        let (v4, v6) = (v4.ok(), v6.ok());
        if v4.is_none() && v6.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "could not bind either address family",
            ));
        }

        config::constrain(&cfg)?;

        Ok(Self {
            v4_worker: WorkerDescriptor::for_listener(v4.is_some()),
            v6_worker: WorkerDescriptor::for_listener(v6.is_some()),
            v4,
            v6,
            cfg,
            quit_relayed: false,
        })
    }

    /// Runs until both listener workers have permanently exited.
    pub fn run(&mut self) {
        loop {
            self.maybe_spawn(Family::V4);
            self.maybe_spawn(Family::V6);

            if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) && !self.quit_relayed {
                self.relay_quit();
            }

            match blocking_wait_any() {
                WaitOutcome::Interrupted => continue,
                WaitOutcome::NoChildren => break,
                WaitOutcome::Reaped(pid, status) => self.handle_exit(pid, status),
                WaitOutcome::Error(e) => {
                    tracing::error!(%e, "wait failed, exiting supervisor loop");
                    break;
                }
            }

            if self.v4_worker.is_retired() && self.v6_worker.is_retired() {
                break;
            }
        }
    }

    /// Closes both listening sockets.
    pub fn kill(&mut self) {
        self.v4 = None;
        self.v6 = None;
    }

    fn maybe_spawn(&mut self, family: Family) {
        let (listener_slot, worker) = match family {
            Family::V4 => (&self.v4, &mut self.v4_worker),
            Family::V6 => (&self.v6, &mut self.v6_worker),
        };

        let listen = match listener_slot {
            Some(l) => l,
            None => return,
        };
        if !worker.respawn || worker.pid.is_some() {
            return;
        }

        let (supervisor_half, worker_half) = match ipc::pair() {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(family = family.name(), %e, "socketpair failed, retrying next tick");
                return;
            }
        };

        match unsafe { libc::fork() } {
            -1 => {
                tracing::warn!(family = family.name(), err = %io::Error::last_os_error(), "fork failed, retrying next tick");
            }
            0 => {
                drop(supervisor_half);
                reset_child_signals();
                if let Family::V4 = family {
                    if let Some(sibling) = &self.v6 {
                        crate::net::close_raw(sibling.as_raw_fd());
                    }
                } else if let Some(sibling) = &self.v4 {
                    crate::net::close_raw(sibling.as_raw_fd());
                }
                listener::worker_loop(worker_half, family, listen, self.cfg.root.clone());
            }
            pid => {
                drop(worker_half);
                worker.pid = Some(pid);
                worker.ipc = Some(supervisor_half);
                tracing::info!(family = family.name(), pid, "listener worker started");
            }
        }
    }

    fn relay_quit(&mut self) {
        for (name, worker) in [("ipv4", &mut self.v4_worker), ("ipv6", &mut self.v6_worker)] {
            if let Some(ipc) = worker.ipc.as_mut() {
                if let Err(e) = ipc::send_quit(ipc) {
                    tracing::warn!(family = name, %e, "failed to relay quit");
                }
            }
        }
        self.quit_relayed = true;
    }

    fn handle_exit(&mut self, pid: libc::pid_t, status: i32) {
        for (name, worker) in [("ipv4", &mut self.v4_worker), ("ipv6", &mut self.v6_worker)] {
            if worker.pid == Some(pid) {
                match classify(status) {
                    ChildExit::Clean => {
                        tracing::info!(family = name, pid, "listener worker exited cleanly");
                        worker.pid = None;
                    }
                    ChildExit::Broken(code) => {
                        tracing::warn!(family = name, pid, code, "listener worker exited non-zero, not respawning");
                        worker.pid = None;
                        worker.respawn = false;
                    }
                    ChildExit::Signaled(sig) => {
                        tracing::warn!(family = name, pid, sig, "listener worker terminated by signal");
                        worker.pid = None;
                        worker.respawn = false;
                    }
                }
                worker.ipc = None;
                return;
            }
        }
    }
}

enum WaitOutcome {
    Interrupted,
    NoChildren,
    Reaped(libc::pid_t, i32),
    Error(io::Error),
}

fn blocking_wait_any() -> WaitOutcome {
    let mut status = 0;
    let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
    if pid > 0 {
        return WaitOutcome::Reaped(pid, status);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINTR) => WaitOutcome::Interrupted,
        Some(libc::ECHILD) => WaitOutcome::NoChildren,
        _ => WaitOutcome::Error(err),
    }
}

fn classify(status: i32) -> ChildExit {
    if libc::WIFEXITED(status) {
        let code = libc::WEXITSTATUS(status);
        if code == 0 {
            ChildExit::Clean
        } else {
            ChildExit::Broken(code)
        }
    } else if libc::WIFSIGNALED(status) {
        ChildExit::Signaled(libc::WTERMSIG(status))
    } else {
        ChildExit::Broken(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(code: i32) -> i32 {
        (code & 0xff) << 8
    }

    fn signaled(sig: i32) -> i32 {
        sig & 0x7f
    }

    #[test]
    fn clean_exit_classified_as_clean() {
        assert!(matches!(classify(exited(0)), ChildExit::Clean));
    }

    #[test]
    fn nonzero_exit_classified_as_broken() {
        match classify(exited(1)) {
            ChildExit::Broken(code) => assert_eq!(code, 1),
            _ => panic!("expected Broken"),
        }
    }

    #[test]
    fn signal_termination_classified_as_signaled() {
        match classify(signaled(libc::SIGSEGV)) {
            ChildExit::Signaled(sig) => assert_eq!(sig, libc::SIGSEGV),
            _ => panic!("expected Signaled"),
        }
    }

    #[test]
    fn worker_descriptor_retires_once_pid_gone_and_respawn_cleared() {
        let mut w = WorkerDescriptor::for_listener(true);
        assert!(!w.is_retired());
        w.pid = Some(123);
        assert!(!w.is_retired());
        w.pid = None;
        w.respawn = false;
        assert!(w.is_retired());
    }

    #[test]
    fn worker_descriptor_without_a_listener_starts_retired() {
        assert!(WorkerDescriptor::for_listener(false).is_retired());
    }

    /// Spec.md §8 property 7: each worker receives exactly one `"quit"`
    /// IPC message before being reaped. Drives `relay_quit` over a real
    /// `UnixStream` pair and confirms both that the literal 4 bytes
    /// arrive and that nothing further is ever sent on the wire — the
    /// second half of the guarantee, which `Supervisor::run`'s
    /// `!self.quit_relayed` check is what actually enforces.
    #[test]
    fn relay_quit_sends_exactly_one_quit_message_per_worker() {
        use std::io::Read;
        use std::time::Duration;

        let (v4_sup_half, mut v4_worker_half) = UnixStream::pair().unwrap();
        let (v6_sup_half, mut v6_worker_half) = UnixStream::pair().unwrap();
        v4_worker_half.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
        v6_worker_half.set_read_timeout(Some(Duration::from_millis(200))).unwrap();

        let cfg = ServerConfig {
            root: std::env::temp_dir(),
            port: 0,
            drop_to: None,
            log: crate::logging::LogConfig::new(None),
        };

        let mut sup = Supervisor {
            v4: None,
            v6: None,
            v4_worker: WorkerDescriptor {
                pid: Some(111),
                respawn: true,
                ipc: Some(v4_sup_half),
            },
            v6_worker: WorkerDescriptor {
                pid: Some(222),
                respawn: true,
                ipc: Some(v6_sup_half),
            },
            cfg,
            quit_relayed: false,
        };

        assert!(!sup.quit_relayed);
        sup.relay_quit();
        assert!(sup.quit_relayed);

        for worker_half in [&mut v4_worker_half, &mut v6_worker_half] {
            let mut buf = [0u8; 4];
            worker_half.read_exact(&mut buf).expect("quit message never arrived");
            assert_eq!(&buf, &ipc::QUIT);

            // `run`'s loop only calls `relay_quit` while `!quit_relayed`,
            // so once it's true nothing more should ever land on the wire.
            let mut trailing = [0u8; 1];
            match worker_half.read(&mut trailing) {
                Ok(0) => {}
                Err(e) => assert!(
                    matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut),
                    "unexpected error waiting for trailing bytes: {e}"
                ),
                Ok(n) => panic!("unexpected extra byte(s) after quit: {n}"),
            }
        }
    }
}
