//! Connection pool keyed by [`Address`].
//!
//! Idle HTTP/1.x connections are checked out exclusively; a live HTTP/2
//! connection is handed to any number of engines at once. A background
//! sweep evicts connections idle past the keep-alive duration or beyond
//! the idle-count cap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::address::Address;
use crate::connection::Connection;

/// Pool limits.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections kept, across all addresses.
    pub max_idle_connections: usize,
    /// How long an idle connection may wait for reuse.
    pub keep_alive: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_connections: 5,
            keep_alive: Duration::from_secs(5 * 60),
        }
    }
}

/// A pool of live connections, shared by every engine of a client.
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    connections: Mutex<Vec<Arc<Connection>>>,
    sweeper_started: AtomicBool,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> ConnectionPool {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                connections: Mutex::new(Vec::new()),
                sweeper_started: AtomicBool::new(false),
            }),
        }
    }

    /// A connection for `address`: a shared HTTP/2 connection if one is
    /// live, else the most recently used idle HTTP/1.x connection,
    /// checked out of the pool. Liveness is the caller's probe; stale
    /// sockets come back here via [`recycle`](ConnectionPool::recycle) or
    /// get closed.
    pub fn get(&self, address: &Address) -> Option<Arc<Connection>> {
        let mut connections = self.inner.connections.lock();

        // A multiplexed connection is shared without being removed.
        if let Some(shared) = connections
            .iter()
            .rev()
            .find(|c| c.is_multiplexed() && !c.is_closed() && c.route().address().as_ref() == address)
        {
            return Some(shared.clone());
        }

        // Newest idle exclusive connection wins.
        for i in (0..connections.len()).rev() {
            let candidate = &connections[i];
            if !candidate.is_multiplexed()
                && candidate.is_idle()
                && !candidate.is_closed()
                && candidate.route().address().as_ref() == address
            {
                return Some(connections.remove(i));
            }
        }
        None
    }

    /// Return `connection` to the pool for reuse. Closed connections are
    /// dropped instead.
    pub fn recycle(&self, connection: Arc<Connection>) {
        if connection.is_closed() {
            return;
        }
        connection.increment_recycle_count();
        connection.mark_idle_now();

        {
            let mut connections = self.inner.connections.lock();
            if !connections.iter().any(|c| Arc::ptr_eq(c, &connection)) {
                connections.push(connection);
            }
        }

        self.inner.evict();
        self.start_sweeper();
    }

    /// Insert a freshly opened multiplexed connection so other engines
    /// can share it immediately.
    pub fn share(&self, connection: Arc<Connection>) {
        if !connection.is_multiplexed() {
            return;
        }
        let mut connections = self.inner.connections.lock();
        if !connections.iter().any(|c| Arc::ptr_eq(c, &connection)) {
            connections.push(connection);
        }
    }

    /// Connections currently held, idle or shared.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().len()
    }

    /// Idle connections currently held.
    pub fn idle_connection_count(&self) -> usize {
        self.inner
            .connections
            .lock()
            .iter()
            .filter(|c| c.is_idle())
            .count()
    }

    /// Close and forget everything.
    pub fn evict_all(&self) {
        let drained: Vec<_> = std::mem::take(&mut *self.inner.connections.lock());
        for connection in drained {
            connection.close();
        }
    }

    fn start_sweeper(&self) {
        if self.inner.sweeper_started.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.keep_alive.min(Duration::from_secs(60));
        let spawned = thread::Builder::new()
            .name("hawser-pool-sweeper".to_string())
            .spawn(move || loop {
                thread::sleep(interval);
                match weak.upgrade() {
                    Some(inner) => inner.evict(),
                    None => return,
                }
            });
        if spawned.is_err() {
            // Inline eviction on recycle still enforces the caps.
            self.inner.sweeper_started.store(false, Ordering::Release);
        }
    }
}

impl PoolInner {
    /// Drop idle connections past keep-alive, then enforce the idle cap,
    /// oldest first.
    fn evict(&self) {
        let mut evicted = Vec::new();
        {
            let mut connections = self.connections.lock();

            connections.retain(|c| {
                if c.is_closed() {
                    return false;
                }
                if c.is_idle() && c.idle_duration() > self.config.keep_alive {
                    evicted.push(c.clone());
                    return false;
                }
                true
            });

            let mut idle: Vec<usize> = connections
                .iter()
                .enumerate()
                .filter(|(_, c)| c.is_idle())
                .map(|(i, _)| i)
                .collect();
            while idle.len() > self.config.max_idle_connections {
                // Connections are ordered oldest-first.
                let index = idle.remove(0);
                evicted.push(connections.remove(index));
                for i in idle.iter_mut() {
                    *i -= 1;
                }
            }
        }

        for connection in evicted {
            debug!(route = %connection.route(), "evicting pooled connection");
            connection.close();
        }
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        ConnectionPool::new(PoolConfig::default())
    }
}
