//! Descriptor registry: the entities the reactor polls, and their poll state.
//!
//! Entities and poll specs live in two vectors of equal length, where index `i` of both always
//! refers to the same descriptor. Removal swaps the last entry into the hole in both vectors at
//! once. Because indices move, callers hold on to a [`Token`] instead; tokens are never reused, so
//! a token that outlives its entity simply stops resolving.

use std::collections::HashMap;
use std::fmt;
use std::os::unix::io::RawFd;

use nix::poll::{poll, PollFd, PollFlags};

/// Stable handle to a registered entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Token(u64);

impl Token {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Something with a descriptor that can be waited on.
pub trait Pollable {
    fn fd(&self) -> RawFd;
    /// Events to wait for on the next turn. Empty means "registered but idle".
    fn interest(&self) -> PollFlags;
}

/// Poll state of one registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSpec {
    pub fd: RawFd,
    pub events: PollFlags,
    pub revents: PollFlags,
}

#[derive(Debug)]
pub struct Registry<E> {
    tokens: Vec<Token>,
    entities: Vec<E>,
    specs: Vec<PollSpec>,
    index: HashMap<Token, usize>,
    next_token: u64,
}

impl<E> Default for Registry<E> {
    fn default() -> Self {
        Self {
            tokens: Vec::new(),
            entities: Vec::new(),
            specs: Vec::new(),
            index: HashMap::new(),
            next_token: 0,
        }
    }
}

impl<E: Pollable> Registry<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `entity` and its poll spec. Returns the handle it is reachable by.
    pub fn register(&mut self, entity: E) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.index.insert(token, self.entities.len());
        self.tokens.push(token);
        self.specs.push(PollSpec {
            fd: entity.fd(),
            events: entity.interest(),
            revents: PollFlags::empty(),
        });
        self.entities.push(entity);
        token
    }

    /// Remove the entity and its poll spec. The caller drops the returned entity, which closes its
    /// descriptor. Removing a token twice is a no-op.
    pub fn deregister(&mut self, token: Token) -> Option<E> {
        let i = self.index.remove(&token)?;
        self.tokens.swap_remove(i);
        self.specs.swap_remove(i);
        let entity = self.entities.swap_remove(i);
        if let Some(&moved) = self.tokens.get(i) {
            self.index.insert(moved, i);
        }
        Some(entity)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.index.contains_key(&token)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut E> {
        let i = *self.index.get(&token)?;
        self.entities.get_mut(i)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entities(&self) -> impl Iterator<Item = (Token, &E)> {
        self.tokens.iter().copied().zip(self.entities.iter())
    }

    /// Wait until a registered descriptor is ready or `timeout_ms` passes (-1 waits forever).
    ///
    /// Interest is refreshed from every entity first, so state changes made since the last turn
    /// take effect.
    pub fn poll(&mut self, timeout_ms: libc::c_int) -> nix::Result<usize> {
        for (spec, entity) in self.specs.iter_mut().zip(&self.entities) {
            spec.events = entity.interest();
            spec.revents = PollFlags::empty();
        }
        let mut fds: Vec<PollFd> = self
            .specs
            .iter()
            .map(|spec| PollFd::new(spec.fd, spec.events))
            .collect();
        let ready = poll(&mut fds, timeout_ms)?;
        for (spec, fd) in self.specs.iter_mut().zip(&fds) {
            spec.revents = fd.revents().unwrap_or_else(PollFlags::empty);
        }
        Ok(ready as usize)
    }

    /// Tokens with pending events after `poll`, in registry order.
    pub fn ready(&self) -> Vec<(Token, PollFlags)> {
        self.tokens
            .iter()
            .zip(&self.specs)
            .filter(|(_, spec)| !spec.revents.is_empty())
            .map(|(&token, spec)| (token, spec.revents))
            .collect()
    }
}
