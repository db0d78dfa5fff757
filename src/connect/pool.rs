//! Client connection pooling.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::client::Call;

use super::conn::{Connection, IdleStats};
use super::{Address, Route};

/// Manages reuse of HTTP and HTTP/2 connections.
///
/// Connections sharing an [`Address`] may be reused. The pool keeps at
/// most `max_idle_connections` idle and evicts any connection idle past
/// `keep_alive`; a single background task does the sweeping and parks
/// when there is nothing left to sweep.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    max_idle_connections: usize,
    keep_alive: Duration,
    state: Mutex<PoolState>,
    cond: Condvar,
}

struct PoolState {
    connections: Vec<Arc<Connection>>,
    cleanup_running: bool,
}

impl ConnectionPool {
    /// A pool holding up to `max_idle_connections` idle connections, each
    /// for at most `keep_alive`.
    pub fn new(max_idle_connections: usize, keep_alive: Duration) -> ConnectionPool {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                max_idle_connections,
                keep_alive,
                state: Mutex::new(PoolState {
                    connections: Vec::new(),
                    cleanup_running: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// The number of idle connections.
    pub fn idle_connection_count(&self) -> usize {
        let now = Instant::now();
        let state = self.inner.state.lock().unwrap();
        state
            .connections
            .iter()
            .filter(|c| matches!(c.idle_stats(now), IdleStats::Idle(_)))
            .count()
    }

    /// The total number of connections.
    pub fn connection_count(&self) -> usize {
        self.inner.state.lock().unwrap().connections.len()
    }

    /// Closes and removes every idle connection.
    pub fn evict_all(&self) {
        let now = Instant::now();
        let evicted: Vec<Arc<Connection>> = {
            let mut state = self.inner.state.lock().unwrap();
            let (idle, busy): (Vec<_>, Vec<_>) = state
                .connections
                .drain(..)
                .partition(|c| matches!(c.idle_stats(now), IdleStats::Idle(_)));
            state.connections = busy;
            idle
        };
        for connection in evicted {
            connection.close();
        }
    }

    /// Attempts to pull an eligible pooled connection for `address`,
    /// registering `call` on it. `routes` enables HTTP/2 coalescing onto
    /// other-host connections; `require_multiplexed` restricts the search
    /// to HTTP/2, for deduplicating racing connects.
    pub(crate) fn acquire(
        &self,
        address: &Address,
        call: &Call,
        routes: Option<&[Route]>,
        require_multiplexed: bool,
    ) -> Option<Arc<Connection>> {
        let state = self.inner.state.lock().unwrap();
        for connection in state.connections.iter() {
            if connection.acquire_if_eligible(address, routes, call, require_multiplexed) {
                trace!("reusing connection {}", connection.id());
                return Some(connection.clone());
            }
        }
        None
    }

    /// Adds a freshly connected connection, starting the eviction task if
    /// it is not running.
    pub(crate) fn put(&self, connection: Arc<Connection>) {
        let mut state = self.inner.state.lock().unwrap();
        state.connections.push(connection);
        if !state.cleanup_running {
            state.cleanup_running = true;
            let pool = Arc::downgrade(&self.inner);
            let _ = thread::Builder::new()
                .name("courier ConnectionPool".to_owned())
                .spawn(move || cleanup_loop(pool));
        }
        self.inner.cond.notify_all();
    }

    /// Wakes the eviction task to recompute its schedule, after a
    /// connection went idle.
    pub(crate) fn connection_became_idle(&self) {
        self.inner.cond.notify_all();
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.connection_count())
            .finish()
    }
}

impl Default for ConnectionPool {
    /// Five idle connections, five minute keep-alive.
    fn default() -> ConnectionPool {
        ConnectionPool::new(5, Duration::from_secs(5 * 60))
    }
}

fn cleanup_loop(pool: Weak<PoolInner>) {
    loop {
        let inner = match pool.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        match inner.cleanup(Instant::now()) {
            Some(wait) if wait.is_zero() => continue,
            Some(wait) => {
                let state = inner.state.lock().unwrap();
                let _ = inner.cond.wait_timeout(state, wait).unwrap();
            }
            None => {
                // Nothing to watch. Exit; the next put() restarts us.
                let mut state = inner.state.lock().unwrap();
                if state.connections.is_empty() {
                    state.cleanup_running = false;
                    return;
                }
            }
        }
    }
}

impl PoolInner {
    /// Performs one maintenance pass: evicts the connection that has been
    /// idle the longest if it is due, and reports how long to sleep until
    /// the next pass. `None` parks the task.
    fn cleanup(&self, now: Instant) -> Option<Duration> {
        let mut in_use_count = 0;
        let mut idle_count = 0;
        let mut longest_idle: Option<(Duration, usize)> = None;

        let to_close: Option<Arc<Connection>> = {
            let mut state = self.state.lock().unwrap();
            for (i, connection) in state.connections.iter().enumerate() {
                match connection.idle_stats(now) {
                    IdleStats::InUse => in_use_count += 1,
                    IdleStats::Idle(duration) => {
                        idle_count += 1;
                        if longest_idle.map_or(true, |(longest, _)| duration > longest) {
                            longest_idle = Some((duration, i));
                        }
                    }
                }
            }

            match longest_idle {
                Some((duration, i))
                    if duration >= self.keep_alive || idle_count > self.max_idle_connections =>
                {
                    Some(state.connections.swap_remove(i))
                }
                _ => None,
            }
        };

        if let Some(connection) = to_close {
            debug!("evicting connection {}", connection.id());
            connection.close();
            return Some(Duration::ZERO); // recompute immediately
        }

        if let Some((longest, _)) = longest_idle {
            return Some(self.keep_alive - longest);
        }
        if in_use_count > 0 {
            return Some(self.keep_alive);
        }
        None
    }
}
