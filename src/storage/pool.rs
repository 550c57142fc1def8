//! Bounded pool of read-only catalog connections.
//!
//! Connections open lazily, up to `size`, and idle ones wait in a crossbeam
//! channel. A checkout blocks for at most `checkout_timeout` when every
//! connection is in use.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use rusqlite::{Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("catalog not found at {0}")]
    NotFound(PathBuf),
    #[error("failed to open catalog at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("no catalog connection free after {0:?}")]
    Timeout(Duration),
}

pub struct ConnectionPool {
    path: PathBuf,
    size: usize,
    opened: AtomicUsize,
    checkout_timeout: Duration,
    busy_timeout: Duration,
    idle_tx: Sender<Connection>,
    idle_rx: Receiver<Connection>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("opened", &self.opened.load(Ordering::Relaxed))
            .finish()
    }
}

/// A checked-out connection; returns to the pool on drop.
pub struct PooledConnection<'a> {
    conn: Option<Connection>,
    pool: &'a ConnectionPool,
}

impl std::ops::Deref for PooledConnection<'_> {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn
            .as_ref()
            .expect("pooled connection is present until drop")
    }
}

impl PooledConnection<'_> {
    /// Close this connection instead of returning it, freeing its slot.
    pub fn discard(mut self) {
        if self.conn.take().is_some() {
            self.pool.opened.fetch_sub(1, Ordering::AcqRel);
            debug!(path = %self.pool.path.display(), "discarded catalog connection");
        }
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Capacity equals the slot count, so this only fails if the
            // pool itself is gone.
            if self.pool.idle_tx.try_send(conn).is_err() {
                self.pool.opened.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

impl ConnectionPool {
    /// Create a pool for the catalog at `path`. No I/O is performed.
    pub fn new(path: impl Into<PathBuf>, size: usize, checkout_timeout: Duration) -> Self {
        let size = size.max(1);
        let (idle_tx, idle_rx) = bounded(size);
        Self {
            path: path.into(),
            size,
            opened: AtomicUsize::new(0),
            checkout_timeout,
            busy_timeout: super::sqlite::DEFAULT_BUSY_TIMEOUT,
            idle_tx,
            idle_rx,
        }
    }

    /// Busy timeout set on each connection this pool opens.
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of connections currently open (idle or checked out).
    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::Acquire)
    }

    /// Check out a connection, opening a new one if a slot is free.
    pub fn get(&self) -> Result<PooledConnection<'_>, PoolError> {
        if let Ok(conn) = self.idle_rx.try_recv() {
            return Ok(self.wrap(conn));
        }

        if self.reserve_slot() {
            return match self.open() {
                Ok(conn) => Ok(self.wrap(conn)),
                Err(err) => {
                    self.opened.fetch_sub(1, Ordering::AcqRel);
                    Err(err)
                }
            };
        }

        match self.idle_rx.recv_timeout(self.checkout_timeout) {
            Ok(conn) => Ok(self.wrap(conn)),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                Err(PoolError::Timeout(self.checkout_timeout))
            }
        }
    }

    fn wrap(&self, conn: Connection) -> PooledConnection<'_> {
        PooledConnection {
            conn: Some(conn),
            pool: self,
        }
    }

    fn reserve_slot(&self) -> bool {
        self.opened
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.size).then_some(n + 1)
            })
            .is_ok()
    }

    fn open(&self) -> Result<Connection, PoolError> {
        if !self.path.exists() {
            return Err(PoolError::NotFound(self.path.clone()));
        }
        let start = Instant::now();
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .and_then(|conn| {
            super::sqlite::apply_read_pragmas(&conn, self.busy_timeout)?;
            Ok(conn)
        })
        .map_err(|source| PoolError::OpenFailed {
            path: self.path.clone(),
            source,
        })?;
        info!(
            path = %self.path.display(),
            elapsed_ms = start.elapsed().as_millis(),
            open = self.open_count(),
            "opened catalog connection"
        );
        Ok(conn)
    }
}
