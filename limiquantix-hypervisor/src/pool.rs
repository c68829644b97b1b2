//! Bounded pool of backend connections.
//!
//! The pool hands out at most `max_connections` live connections at once.
//! A connection is opened when a slot is acquired and closed when it is
//! released, so no link outlives the request that used it. The slot is given
//! back on every path: successful release, failed open, failed close, or a
//! [`PooledConnection`] dropped without an explicit release.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::{HypervisorError, Result};
use crate::traits::{Backend, Connection};

/// Default number of simultaneous backend connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 4;

/// Bounded pool of connections to one backend.
#[derive(Clone)]
pub struct ConnectionPool {
    backend: Arc<dyn Backend>,
    slots: Arc<Semaphore>,
    max_connections: usize,
}

impl ConnectionPool {
    /// Create a pool allowing `max_connections` concurrent connections.
    pub fn new(backend: Arc<dyn Backend>, max_connections: usize) -> Result<Self> {
        if max_connections == 0 {
            return Err(HypervisorError::InvalidArgument(
                "connection pool size must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            backend,
            slots: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        })
    }

    /// Maximum number of simultaneous connections.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Wait for a free slot, then open a connection in it.
    ///
    /// Blocks while the pool is saturated. The connection is opened on the
    /// blocking thread pool so a slow backend never stalls the runtime. If
    /// opening fails, the slot is returned before the error is.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| HypervisorError::PoolClosed)?;

        let backend = Arc::clone(&self.backend);
        let conn = tokio::task::spawn_blocking(move || open(backend.as_ref(), permit)).await??;

        debug!(
            backend = %self.backend.name(),
            available = self.slots.available_permits(),
            "Acquired backend connection"
        );

        Ok(conn)
    }

    /// Refuse further acquisitions. Connections already handed out stay valid.
    pub fn close(&self) {
        self.slots.close();
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }
}

/// Open a connection into an already held slot.
fn open(backend: &dyn Backend, permit: OwnedSemaphorePermit) -> Result<PooledConnection> {
    // `permit` drops with the error if the backend refuses us.
    let connection = backend.connect().map_err(|e| match e {
        HypervisorError::ConnectionFailed(_) => e,
        other => HypervisorError::ConnectionFailed(other.to_string()),
    })?;

    Ok(PooledConnection {
        connection,
        released: false,
        _permit: permit,
    })
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("backend", &self.backend.name())
            .field("capacity", &self.max_connections)
            .field("available", &self.available())
            .finish()
    }
}

/// A connection holding one pool slot.
///
/// Call [`release`](Self::release) to close it and observe the close result.
/// Dropping it without releasing still closes the connection and frees the
/// slot; a close failure is then only logged.
pub struct PooledConnection {
    connection: Box<dyn Connection>,
    released: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Close the connection and give the slot back.
    ///
    /// The slot is returned even when closing fails.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.connection.close()
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.connection.as_ref()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.connection.close() {
            warn!(error = %e, "Failed to close dropped backend connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::mock::MockBackend;

    fn pool(max: usize) -> (MockBackend, ConnectionPool) {
        let backend = MockBackend::new();
        let pool = ConnectionPool::new(Arc::new(backend.clone()), max).unwrap();
        (backend, pool)
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let backend: Arc<dyn Backend> = Arc::new(MockBackend::new());
        let err = ConnectionPool::new(backend, 0).unwrap_err();
        assert!(matches!(err, HypervisorError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_acquire_blocks_when_saturated() {
        let (_backend, pool) = pool(2);

        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);

        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.acquire()).await;
        assert!(blocked.is_err(), "third acquire should wait for a slot");

        first.release().unwrap();
        let third = tokio::time::timeout(Duration::from_secs(1), pool.acquire())
            .await
            .expect("slot should be free after release")
            .unwrap();

        second.release().unwrap();
        third.release().unwrap();
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_slot_returned_after_connect_failure() {
        let (backend, pool) = pool(1);

        backend.fail_on("connect");
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, HypervisorError::ConnectionFailed(_)));
        assert_eq!(pool.available(), 1);

        backend.clear_failures();
        pool.acquire().await.unwrap().release().unwrap();
        assert_eq!(backend.counters().open_connections(), 0);
    }

    #[tokio::test]
    async fn test_slot_returned_after_close_failure() {
        let (backend, pool) = pool(1);

        let conn = pool.acquire().await.unwrap();
        backend.fail_on("close");
        assert!(conn.release().is_err());
        assert_eq!(pool.available(), 1);
        backend.clear_failures();

        let counters = backend.counters();
        assert_eq!(counters.connections_opened, 1);
        assert_eq!(counters.connections_closed, 1);
    }

    #[tokio::test]
    async fn test_drop_closes_connection() {
        let (backend, pool) = pool(1);

        {
            let _conn = pool.acquire().await.unwrap();
            assert_eq!(backend.counters().open_connections(), 1);
        }

        assert_eq!(backend.counters().open_connections(), 0);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_closed_pool_refuses_acquire() {
        let (_backend, pool) = pool(1);
        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(pool.acquire().await, Err(HypervisorError::PoolClosed)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_connect_leaves_runtime_responsive() {
        let (backend, pool) = pool(4);
        backend.set_connect_latency(Duration::from_millis(300));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                pool.acquire().await.unwrap().release().unwrap();
            }));
        }

        let started = std::time::Instant::now();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(
            started.elapsed() < Duration::from_millis(200),
            "timer delayed by blocking connects: {:?}",
            started.elapsed()
        );

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(backend.counters().open_connections(), 0);
        assert_eq!(pool.available(), 4);
    }

    #[tokio::test]
    async fn test_concurrent_use_stays_within_capacity() {
        let (backend, pool) = pool(3);

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                let conn = pool.acquire().await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                conn.release().unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let counters = backend.counters();
        assert_eq!(counters.connections_opened, 12);
        assert_eq!(counters.open_connections(), 0);
        assert!(counters.peak_open_connections <= 3);
        assert_eq!(pool.available(), 3);
    }
}
