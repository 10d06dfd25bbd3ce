//! Network-level access control for the status server.
//!
//! Every request goes through four checks, in this order, and the first one
//! that fails decides the status code the client sees:
//!
//! 1. source address prefix (403)
//! 2. per-client sliding-window rate limit (429)
//! 3. method, `GET` only (405)
//! 4. path, exact match against the route table (403)
//!
//! Rate accounting happens for every request that gets past the address
//! check, whatever the later outcome. The limiter lives on the server's single
//! scheduler thread and is not locked.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::AccessConfig;
use crate::http::{Method, Request, Route, Status};

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rejection {
    /// Peer missing or outside the allowed prefix.
    AddressNotAllowed,
    /// Too many requests inside the window.
    RateLimited,
    /// Method other than `GET`.
    MethodNotAllowed,
    /// Path not in the route table.
    PathNotAllowed,
}

impl Rejection {
    /// Status code sent for this rejection.
    #[must_use]
    pub const fn status(self) -> Status {
        match self {
            Self::AddressNotAllowed | Self::PathNotAllowed => Status::Forbidden,
            Self::RateLimited => Status::TooManyRequests,
            Self::MethodNotAllowed => Status::MethodNotAllowed,
        }
    }
}

#[derive(Debug)]
struct ClientWindow {
    hits: VecDeque<Instant>,
    last_seen: Instant,
}

impl ClientWindow {
    fn new(now: Instant) -> Self {
        Self {
            hits: VecDeque::new(),
            last_seen: now,
        }
    }

    fn purge(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.hits.front() {
            if now.saturating_duration_since(oldest) > window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Address filter plus per-client sliding-window rate limiter.
#[derive(Debug)]
pub struct AccessControl {
    allowed_prefix: String,
    window: Duration,
    max_requests: usize,
    max_clients: usize,
    clients: HashMap<IpAddr, ClientWindow>,
}

impl AccessControl {
    /// Build from configuration.
    #[must_use]
    pub fn new(config: &AccessConfig) -> Self {
        Self {
            allowed_prefix: config.allowed_prefix.clone(),
            window: config.window(),
            max_requests: config.max_requests,
            max_clients: config.max_tracked_clients.max(1),
            clients: HashMap::new(),
        }
    }

    /// Whether the peer's address string starts with the allowed prefix.
    ///
    /// This is a plain string prefix, not a CIDR match. IPv4-mapped IPv6
    /// addresses are compared in their IPv4 form. A missing peer is rejected.
    #[must_use]
    pub fn ip_allowed(&self, peer: Option<SocketAddr>) -> bool {
        peer.is_some_and(|addr| {
            addr.ip()
                .to_canonical()
                .to_string()
                .starts_with(&self.allowed_prefix)
        })
    }

    /// Record a request from `ip` now and report whether it is over the limit.
    pub fn rate_limited(&mut self, ip: IpAddr) -> bool {
        self.rate_limited_at(ip, Instant::now())
    }

    /// Record a request from `ip` at `now` and report whether it is over the
    /// limit.
    pub fn rate_limited_at(&mut self, ip: IpAddr, now: Instant) -> bool {
        if !self.clients.contains_key(&ip) && self.clients.len() >= self.max_clients {
            self.make_room(now);
        }

        let window = self.window;
        let entry = self
            .clients
            .entry(ip)
            .or_insert_with(|| ClientWindow::new(now));
        entry.purge(now, window);
        entry.hits.push_back(now);
        entry.last_seen = now;

        entry.hits.len() > self.max_requests
    }

    /// Run all checks in order and resolve the route.
    ///
    /// # Errors
    ///
    /// Returns the first [`Rejection`] that applies.
    pub fn check(&mut self, request: &Request) -> Result<Route, Rejection> {
        self.check_at(request, Instant::now())
    }

    /// [`AccessControl::check`] with an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns the first [`Rejection`] that applies.
    pub fn check_at(&mut self, request: &Request, now: Instant) -> Result<Route, Rejection> {
        let peer = match request.peer {
            Some(peer) if self.ip_allowed(Some(peer)) => peer,
            _ => return Err(Rejection::AddressNotAllowed),
        };

        if self.rate_limited_at(peer.ip().to_canonical(), now) {
            return Err(Rejection::RateLimited);
        }

        if request.method != Method::Get {
            return Err(Rejection::MethodNotAllowed);
        }

        Route::from_path(&request.path).ok_or(Rejection::PathNotAllowed)
    }

    /// Number of client windows currently held.
    #[must_use]
    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }

    fn make_room(&mut self, now: Instant) {
        let window = self.window;
        self.clients
            .retain(|_, client| now.saturating_duration_since(client.last_seen) <= window);

        if self.clients.len() < self.max_clients {
            return;
        }

        let stalest = self
            .clients
            .iter()
            .min_by_key(|(_, client)| client.last_seen)
            .map(|(ip, _)| *ip);
        if let Some(ip) = stalest {
            debug!(%ip, "Evicting least recently seen client window");
            self.clients.remove(&ip);
        }
    }
}
