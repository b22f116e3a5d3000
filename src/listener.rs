use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use anyhow::{Context as _, Result};
use nix::poll::PollFlags;

use crate::config::ListenerConfig;
use crate::connection::Connection;
use crate::reactor::{Context, Disposition, Entity, Handler};
use crate::registry::{Pollable, Token};

/// A bound, non-blocking server socket and the configuration its connections share.
#[derive(Debug)]
pub struct Listener {
    socket: TcpListener,
    config: Rc<ListenerConfig>,
}

impl Listener {
    pub fn bind(config: ListenerConfig) -> Result<Self> {
        let addr = config.socket_addr();
        let socket = TcpListener::bind(addr)
            .with_context(|| format!("failed to create listening socket for {}", addr))?;
        socket
            .set_nonblocking(true)
            .context("failed to set listening socket non-blocking")?;
        let listener = Self {
            socket,
            config: Rc::new(config),
        };
        println!("listening on: http://{}/", listener.local_addr()?);
        Ok(listener)
    }

    /// Routing settings shared read-only with every accepted connection.
    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .context("failed to get listening socket address")
    }
}

impl Pollable for Listener {
    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    fn interest(&self) -> PollFlags {
        PollFlags::POLLIN
    }
}

impl Handler for Listener {
    /// Accept one pending connection. The new connection is registered once the turn settles.
    fn on_readable(&mut self, _token: Token, ctx: &mut Context) -> Disposition {
        match self.socket.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nonblocking(true) {
                    eprintln!("warning: failed to set connection from {} non-blocking: {}", peer, e);
                    return Disposition::Keep;
                }
                ctx.stats.connections += 1;
                let connection = Connection::new(stream, peer, Rc::clone(&self.config), ctx.now);
                ctx.pending.push(Entity::Connection(connection));
            }
            // Someone else got there first, or the client already went away.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => eprintln!("warning: accept() failed: {}", e),
        }
        Disposition::Keep
    }
}
