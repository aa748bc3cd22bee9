//! SQLite database setup with WAL mode, a bounded connection pool, and
//! contention retry.
//!
//! The [`Database`] struct owns a small pool of `rusqlite::Connection`s
//! and exposes async methods that use `tokio::task::spawn_blocking` so
//! SQLite work never blocks the async runtime. Every connection checked
//! out of the pool is pinged first; broken connections are discarded and
//! recreated.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::migration;

/// Default number of pooled connections.
pub const DEFAULT_POOL_SIZE: usize = 10;

/// Maximum retry attempts for a locked database.
const BUSY_RETRIES: u32 = 3;

/// How the pool creates connections.
enum Backing {
    /// A database file on disk.
    File(PathBuf),
    /// A named shared in-memory database. The URI keeps all pooled
    /// connections pointed at the same page cache; tests use this.
    Memory(String),
}

impl Backing {
    fn connect(&self) -> rusqlite::Result<Connection> {
        match self {
            Backing::File(path) => Connection::open(path),
            Backing::Memory(uri) => Connection::open(uri),
        }
    }
}

struct PoolInner {
    backing: Backing,
    idle: Mutex<VecDeque<Connection>>,
    pool_size: usize,
}

/// A connection checked out of the pool.
///
/// `temporary` connections were created because the pool was empty and
/// are closed instead of returned.
struct Checkout {
    conn: Connection,
    temporary: bool,
}

impl PoolInner {
    /// Take a healthy connection from the pool, or open a temporary one
    /// when the pool is exhausted.
    fn checkout(&self) -> StoreResult<Checkout> {
        let pooled = self
            .idle
            .lock()
            .map_err(|e| StoreError::TaskJoin(format!("pool mutex poisoned: {e}")))?
            .pop_front();

        if let Some(conn) = pooled {
            // Ping before use; replace broken connections.
            if conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).is_ok() {
                return Ok(Checkout {
                    conn,
                    temporary: false,
                });
            }
            warn!("discarding broken pooled connection");
            drop(conn);
            let fresh = self.backing.connect()?;
            apply_pragmas(&fresh)?;
            return Ok(Checkout {
                conn: fresh,
                temporary: false,
            });
        }

        debug!("connection pool exhausted, opening temporary connection");
        let conn = self.backing.connect()?;
        apply_pragmas(&conn)?;
        Ok(Checkout {
            conn,
            temporary: true,
        })
    }

    /// Return a connection to the pool. Temporary connections and
    /// overflow beyond `pool_size` are simply dropped (closed).
    fn checkin(&self, checkout: Checkout) {
        if checkout.temporary {
            return;
        }
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < self.pool_size {
                idle.push_back(checkout.conn);
            }
        }
    }
}

/// Thread-safe, pooled handle to the Atelier SQLite database.
///
/// Cheap to clone; all read/write operations go through
/// [`Database::execute`] / [`Database::execute_retry`] which dispatch
/// onto the blocking thread pool.
#[derive(Clone)]
pub struct Database {
    inner: Arc<PoolInner>,
}

impl Database {
    /// Open (or create) a database at `path` with the default pool size.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        Self::open_with_pool(path, DEFAULT_POOL_SIZE)
    }

    /// Open (or create) a database at `path` with `pool_size` pooled
    /// connections.
    ///
    /// This call blocks briefly (file I/O), so call it during startup
    /// before entering the main async loop, or wrap it in
    /// `spawn_blocking` yourself.
    pub fn open_with_pool(path: impl AsRef<Path>, pool_size: usize) -> StoreResult<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), pool_size, "opening database");
        Self::build(Backing::File(path.to_path_buf()), pool_size)
    }

    /// Create a shared in-memory database — useful for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        debug!("opening in-memory database");
        let uri = format!(
            "file:atelier_{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4().simple()
        );
        Self::build(Backing::Memory(uri), 2)
    }

    fn build(backing: Backing, pool_size: usize) -> StoreResult<Self> {
        let mut idle = VecDeque::with_capacity(pool_size);
        for _ in 0..pool_size.max(1) {
            let conn = backing.connect()?;
            apply_pragmas(&conn)?;
            idle.push_back(conn);
        }

        Ok(Self {
            inner: Arc::new(PoolInner {
                backing,
                idle: Mutex::new(idle),
                pool_size: pool_size.max(1),
            }),
        })
    }

    /// Open the database and run all pending migrations.
    ///
    /// Schema failures are fatal by design: a process must not start
    /// against a database it cannot migrate.
    pub async fn open_and_migrate(path: impl AsRef<Path> + Send + 'static) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let db = tokio::task::spawn_blocking(move || Self::open(&path)).await??;
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run all pending schema migrations.
    pub async fn run_migrations(&self) -> StoreResult<()> {
        self.execute(|conn| migration::run_all(conn)).await
    }

    /// Execute an arbitrary closure against a pooled connection on the
    /// blocking pool.
    ///
    /// This is the primary way to interact with the database from async
    /// code. The closure receives a `&Connection` and must return a
    /// `StoreResult<T>`.
    pub async fn execute<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let checkout = inner.checkout()?;
            let result = f(&checkout.conn);
            inner.checkin(checkout);
            result
        })
        .await?
    }

    /// Execute a closure with retry on lock contention.
    ///
    /// The closure may run up to four times (one initial attempt plus
    /// [`BUSY_RETRIES`]), with `0.1 × 2^i` seconds of back-off between
    /// attempts. Exhaustion surfaces as [`StoreError::Busy`].
    pub async fn execute_retry<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: Fn(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            for attempt in 0..=BUSY_RETRIES {
                let checkout = inner.checkout()?;
                let result = f(&checkout.conn);
                inner.checkin(checkout);

                match result {
                    Err(ref err) if is_busy(err) && attempt < BUSY_RETRIES => {
                        let wait = Duration::from_millis(100 * (1 << attempt));
                        warn!(attempt = attempt + 1, wait_ms = wait.as_millis() as u64,
                              "database locked, retrying");
                        std::thread::sleep(wait);
                    }
                    Err(err) if is_busy(&err) => {
                        return Err(StoreError::Busy {
                            attempts: BUSY_RETRIES + 1,
                        });
                    }
                    other => return other,
                }
            }
            unreachable!("retry loop always returns")
        })
        .await?
    }
}

/// Run `f` inside a `BEGIN IMMEDIATE` transaction, committing on `Ok`
/// and rolling back on `Err`.
///
/// Immediate mode takes the write lock up front so concurrent callers
/// observe disjoint state — the foundation of the atomic-claim contract.
pub fn immediate_tx<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> StoreResult<T>,
) -> StoreResult<T> {
    conn.execute_batch("BEGIN IMMEDIATE;")?;
    match f(conn) {
        Ok(value) => {
            conn.execute_batch("COMMIT;")?;
            Ok(value)
        }
        Err(err) => {
            let _ = conn.execute_batch("ROLLBACK;");
            Err(err)
        }
    }
}

/// Whether a store error is SQLite lock contention.
fn is_busy(err: &StoreError) -> bool {
    match err {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
            e.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

// ── pragmas ──────────────────────────────────────────────────────────

/// Apply journal and performance pragmas to a fresh connection.
fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
    // WAL mode: concurrent readers, non-blocking writes.
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // NORMAL sync is safe with WAL — a power failure loses at most the
    // last transaction, never corrupts.
    conn.pragma_update(None, "synchronous", "NORMAL")?;

    // Writers wait up to 60 s for the lock instead of failing fast.
    conn.pragma_update(None, "busy_timeout", 60_000_i32)?;

    // Negative value means KiB: -64000 = 64 MiB page cache.
    conn.pragma_update(None, "cache_size", -64_000_i32)?;

    // Temp tables and indices in memory, not on disk.
    conn.pragma_update(None, "temp_store", "MEMORY")?;

    // 256 MiB memory-mapped I/O.
    conn.pragma_update(None, "mmap_size", 268_435_456_i64)?;

    // Checkpoint the WAL every 1000 pages.
    conn.pragma_update(None, "wal_autocheckpoint", 1_000_i32)?;

    Ok(())
}

// ── tests ────────────────────────────────────────────────────────────
