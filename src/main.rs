use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};

use webserv::config::{self, Options};
use webserv::listener::Listener;
use webserv::reactor::Reactor;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

fn main() -> Result<()> {
    println!("{}/{}.", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let options = Options::from_command_line()?;
    let configs = config::load(&options.config_path)?;

    let mut reactor = Reactor::new(options.log_sink, options.timeout, options.cgi_timeout)?;
    for config in configs {
        reactor.add_listener(Listener::bind(config)?);
    }

    // set signal handlers
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;

    // main loop
    while is_running() {
        reactor.turn()?;
    }

    reactor.stats().print()
}
