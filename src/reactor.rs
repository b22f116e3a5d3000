//! Single-threaded poll loop.
//!
//! Each turn polls every registered entity, dispatches readiness to the entity's handler, hands
//! finished CGI runs back to their connections and closes idle connections. Handlers never block;
//! a handler that wants a new entity registered pushes it to [`Context::pending`].

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use nix::errno::Errno;
use nix::poll::PollFlags;

use crate::cgi::{CgiCompletion, CgiSpawner, CompletionQueue};
use crate::connection::Connection;
use crate::listener::Listener;
use crate::log::LogSink;
use crate::registry::{Pollable, Registry, Token};
use crate::stats::ServerStats;

/// How often idle connections are checked for, when a timeout is set.
const TIMEOUT_CHECK_MS: libc::c_int = 1000;

/// What a handler wants done with its entity after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    /// Deregister the entity, which closes its descriptor.
    Close,
}

pub trait Handler {
    fn on_readable(&mut self, token: Token, ctx: &mut Context) -> Disposition;

    fn on_writable(&mut self, _token: Token, _ctx: &mut Context) -> Disposition {
        Disposition::Keep
    }
}

/// State shared by every handler.
#[derive(Debug)]
pub struct Context {
    /// Time the current turn started.
    pub now: Instant,
    pub cgi: CgiSpawner,
    pub log: LogSink,
    pub stats: ServerStats,
    /// Entities to register once the current event has been handled.
    pub pending: Vec<Entity>,
    pub completions: Vec<CgiCompletion>,
}

impl Context {
    pub fn new(log: LogSink, cgi_timeout: Option<Duration>) -> Result<(Self, CompletionQueue)> {
        let (cgi, queue) = CgiSpawner::new(cgi_timeout)?;
        let ctx = Self {
            now: Instant::now(),
            cgi,
            log,
            stats: ServerStats::default(),
            pending: Vec::new(),
            completions: Vec::new(),
        };
        Ok((ctx, queue))
    }
}

/// Everything the reactor polls.
#[derive(Debug)]
pub enum Entity {
    Listener(Listener),
    Connection(Connection),
    Completions(CompletionQueue),
}

impl Pollable for Entity {
    fn fd(&self) -> RawFd {
        match self {
            Self::Listener(listener) => listener.fd(),
            Self::Connection(conn) => conn.fd(),
            Self::Completions(queue) => queue.fd(),
        }
    }

    fn interest(&self) -> PollFlags {
        match self {
            Self::Listener(listener) => listener.interest(),
            Self::Connection(conn) => conn.interest(),
            Self::Completions(_) => PollFlags::POLLIN,
        }
    }
}

impl Handler for Entity {
    fn on_readable(&mut self, token: Token, ctx: &mut Context) -> Disposition {
        match self {
            Self::Listener(listener) => listener.on_readable(token, ctx),
            Self::Connection(conn) => conn.on_readable(token, ctx),
            Self::Completions(queue) => {
                if let Err(e) = queue.drain(&mut ctx.completions) {
                    eprintln!("warning: failed to drain CGI completions: {}", e);
                }
                Disposition::Keep
            }
        }
    }

    fn on_writable(&mut self, token: Token, ctx: &mut Context) -> Disposition {
        match self {
            Self::Listener(listener) => listener.on_writable(token, ctx),
            Self::Connection(conn) => conn.on_writable(token, ctx),
            Self::Completions(_) => Disposition::Keep,
        }
    }
}

pub struct Reactor {
    registry: Registry<Entity>,
    ctx: Context,
    timeout: Option<Duration>,
}

impl Reactor {
    /// `timeout` closes connections idle for that long; `cgi_timeout` kills slow scripts.
    pub fn new(log: LogSink, timeout: Option<Duration>, cgi_timeout: Option<Duration>) -> Result<Self> {
        let (ctx, queue) = Context::new(log, cgi_timeout)?;
        let mut registry = Registry::new();
        registry.register(Entity::Completions(queue));
        Ok(Self {
            registry,
            ctx,
            timeout,
        })
    }

    pub fn add_listener(&mut self, listener: Listener) -> Token {
        self.registry.register(Entity::Listener(listener))
    }

    pub fn stats(&self) -> &ServerStats {
        &self.ctx.stats
    }

    /// Number of registered entities, including listeners and the completion queue.
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn connections(&self) -> usize {
        self.registry
            .entities()
            .filter(|(_, entity)| matches!(entity, Entity::Connection(_)))
            .count()
    }

    /// Wait for readiness once and handle everything that became ready.
    pub fn turn(&mut self) -> Result<()> {
        let poll_timeout = match self.timeout {
            Some(_) if self.connections() > 0 => TIMEOUT_CHECK_MS,
            _ => -1,
        };
        match self.registry.poll(poll_timeout) {
            Ok(_) => {}
            Err(e) if e.as_errno() == Some(Errno::EINTR) => return Ok(()), // interrupted by signal
            Err(e) => return Err(e).context("poll() failed"),
        }

        self.ctx.now = Instant::now();

        // Handlers may close entities, so every token is looked up again before dispatch.
        for (token, revents) in self.registry.ready() {
            let entity = match self.registry.get_mut(token) {
                Some(entity) => entity,
                None => continue,
            };
            let mut disposition = Disposition::Keep;
            if revents.contains(PollFlags::POLLNVAL) {
                disposition = Disposition::Close;
            } else {
                if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
                    disposition = entity.on_readable(token, &mut self.ctx);
                }
                if disposition == Disposition::Keep && revents.contains(PollFlags::POLLOUT) {
                    disposition = entity.on_writable(token, &mut self.ctx);
                }
            }
            self.settle(token, disposition);
        }

        self.deliver_completions();
        self.close_idle();
        Ok(())
    }

    /// Hand finished CGI runs to their connections. Runs whose client has gone are dropped.
    fn deliver_completions(&mut self) {
        for completion in std::mem::take(&mut self.ctx.completions) {
            let disposition = match self.registry.get_mut(completion.token) {
                Some(Entity::Connection(conn)) => conn.finish_cgi(completion.result, &mut self.ctx),
                _ => continue,
            };
            self.settle(completion.token, disposition);
        }
    }

    fn close_idle(&mut self) {
        let timeout = match self.timeout {
            Some(timeout) => timeout,
            None => return,
        };
        let now = self.ctx.now;
        let idle: Vec<Token> = self
            .registry
            .entities()
            .filter_map(|(token, entity)| match entity {
                Entity::Connection(conn) if conn.is_idle(now, timeout) => Some(token),
                _ => None,
            })
            .collect();
        for token in idle {
            self.registry.deregister(token);
        }
    }

    fn settle(&mut self, token: Token, disposition: Disposition) {
        if disposition == Disposition::Close {
            self.registry.deregister(token);
        }
        for entity in self.ctx.pending.drain(..) {
            self.registry.register(entity);
        }
    }
}
