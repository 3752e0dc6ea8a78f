//! Binary entry point: parse arguments, build the server configuration,
//! initialize logging exactly once, bind the listening sockets, and hand
//! off to the supervisor loop.

use clap::Parser;

use mekdotlu::config::{Args, ServerConfig};
use mekdotlu::supervisor::{self, Supervisor};

fn main() {
    let args = Args::parse();

    let cfg = match ServerConfig::from_args(args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("mekdotlu: {e}");
            std::process::exit(1);
        }
    };

    mekdotlu::logging::init(&cfg.log);

    let mut sup = match Supervisor::init(cfg) {
        Ok(sup) => sup,
        Err(e) => {
            tracing::error!(%e, "failed to start");
            std::process::exit(1);
        }
    };

    supervisor::install_signal_handlers();
    sup.run();
    sup.kill();
}
