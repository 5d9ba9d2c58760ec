//! Bounded connection pool.
//!
//! A counting semaphore caps concurrent borrows at `max_connections`; the
//! free list recycles wires between borrows and a live set tracks every wire
//! the pool still owns. Wires that close themselves are forgotten via their
//! close event.

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::Config;
use crate::connection::{Wire, WireEvent};
use crate::error::{Error, Result};
use crate::query::{Query, Row};
use crate::sql::SqlFragment;
use crate::transaction::Transaction;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub config: Config,
    /// Upper bound on concurrently borrowed wires.
    pub max_connections: usize,
    /// Accepted for compatibility; free wires are currently only reclaimed
    /// by [`Pool::close`] or their own close events, never by age.
    pub idle_timeout: Option<Duration>,
}

impl PoolOptions {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            max_connections: 10,
            idle_timeout: None,
        }
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

struct PoolState {
    /// Every wire the pool still owns, borrowed or free.
    all: HashMap<u64, Wire>,
    /// Ids currently available for borrowing.
    free: Vec<u64>,
    closed: bool,
}

struct PoolInner {
    options: PoolOptions,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
    next_id: AtomicU64,
}

/// A bounded pool of [`Wire`]s.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(options: PoolOptions) -> Self {
        let permits = options.max_connections;
        Pool {
            inner: Arc::new(PoolInner {
                options,
                semaphore: Arc::new(Semaphore::new(permits)),
                state: Mutex::new(PoolState {
                    all: HashMap::new(),
                    free: Vec::new(),
                    closed: false,
                }),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    /// Borrow a wire, waiting for capacity. Pops the free list when it can,
    /// connects a fresh wire otherwise.
    pub async fn acquire(&self) -> Result<PoolGuard> {
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        loop {
            let candidate = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(Error::ConnectionClosed);
                }
                state
                    .free
                    .pop()
                    .and_then(|id| state.all.get(&id).cloned().map(|w| (id, w)))
            };
            match candidate {
                Some((id, wire)) if wire.is_connected() => {
                    return Ok(PoolGuard {
                        id,
                        wire,
                        pool: Arc::clone(&self.inner),
                        _permit: permit,
                    });
                }
                Some((id, wire)) => {
                    // A dead wire on the free list: drop it and keep looking.
                    self.inner.forget(id);
                    wire.close().await;
                }
                None => break,
            }
        }

        let wire = Wire::connect(self.inner.options.config.clone()).await?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                drop(state);
                wire.close().await;
                return Err(Error::ConnectionClosed);
            }
            state.all.insert(id, wire.clone());
        }
        // Forget the wire if it closes underneath us.
        let mut events = wire.events();
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(WireEvent::Close { .. }) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            if let Some(pool) = inner.upgrade() {
                debug!(id, "forgetting closed pool wire");
                pool.forget(id);
            }
        });

        Ok(PoolGuard {
            id,
            wire,
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Acquire a wire and open a transaction on it. The wire returns to the
    /// pool when the transaction commits or rolls back.
    pub async fn begin(&self) -> Result<PoolTransaction> {
        let guard = self.acquire().await?;
        let tx = match guard.wire.begin().await {
            Ok(tx) => tx,
            Err(e) => return Err(e), // guard drop releases the wire
        };
        Ok(PoolTransaction {
            guard,
            tx: Some(tx),
        })
    }

    /// Acquire-run-release convenience around [`Wire::query`].
    pub async fn query(&self, fragment: &SqlFragment) -> Result<(Vec<Row>, String)> {
        let guard = self.acquire().await?;
        guard.query(fragment).collect().await
    }

    /// Acquire-run-release convenience around [`Query::execute`].
    pub async fn execute(&self, fragment: &SqlFragment) -> Result<String> {
        let guard = self.acquire().await?;
        guard.query(fragment).execute().await
    }

    /// Close every wire and reject future borrows.
    pub async fn close(&self) {
        let wires: Vec<Wire> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.free.clear();
            state.all.drain().map(|(_, w)| w).collect()
        };
        for wire in wires {
            wire.close().await;
        }
    }

    /// Number of wires currently available without connecting.
    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().free.len()
    }

    /// Number of wires the pool currently owns.
    pub fn size(&self) -> usize {
        self.inner.state.lock().all.len()
    }
}

impl PoolInner {
    fn forget(&self, id: u64) {
        let mut state = self.state.lock();
        state.all.remove(&id);
        state.free.retain(|&f| f != id);
    }

    fn release(&self, id: u64) {
        let mut state = self.state.lock();
        if state.all.contains_key(&id) && !state.free.contains(&id) && !state.closed {
            state.free.push(id);
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Pool")
            .field("size", &state.all.len())
            .field("free", &state.free.len())
            .field("max", &self.inner.options.max_connections)
            .finish()
    }
}

/// A borrowed wire. Dropping it returns the wire to the pool and releases
/// the capacity permit.
pub struct PoolGuard {
    id: u64,
    wire: Wire,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PoolGuard {
    type Target = Wire;

    fn deref(&self) -> &Wire {
        &self.wire
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        self.pool.release(self.id);
    }
}

/// A transaction holding its pool wire until it finishes.
pub struct PoolTransaction {
    guard: PoolGuard,
    tx: Option<Transaction>,
}

impl PoolTransaction {
    /// The borrowed wire, for queries inside the transaction.
    pub fn wire(&self) -> &Wire {
        &self.guard
    }

    pub fn query(&self, fragment: &SqlFragment) -> Query {
        self.guard.query(fragment)
    }

    pub async fn commit(mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => tx.commit().await,
            None => Err(Error::TransactionClosed),
        }
    }

    pub async fn rollback(mut self) -> Result<()> {
        match self.tx.take() {
            Some(tx) => tx.rollback().await,
            None => Err(Error::TransactionClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_builder() {
        let options = PoolOptions::new(Config::new("localhost", "postgres"))
            .max_connections(3)
            .idle_timeout(Some(Duration::from_secs(30)));
        assert_eq!(options.max_connections, 3);
        assert_eq!(options.idle_timeout, Some(Duration::from_secs(30)));

        // The cap never drops below one wire.
        let options = PoolOptions::new(Config::new("localhost", "postgres")).max_connections(0);
        assert_eq!(options.max_connections, 1);
    }

    #[test]
    fn release_ignores_forgotten_wires() {
        let pool = Pool::new(PoolOptions::new(Config::new("localhost", "postgres")));
        // No wire with id 7 was ever tracked; releasing it must not place a
        // phantom entry on the free list.
        pool.inner.release(7);
        assert_eq!(pool.idle_count(), 0);
    }
}
