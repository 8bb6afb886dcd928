//! Shared SQLite-backed storage primitives.
//!
//! All persistent stores (Registry, Historical Log, Rollback snapshots,
//! Deployment records, Guardrails violations, Fine-tune jobs) hold a clone
//! of the same [`Db`] handle and open their own `with_conn` closures against
//! it, the same pattern the host crate uses for its tiered memory store.

pub mod schema;

use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::error::{Error, Result};

/// A cheaply-cloneable handle to a single SQLite connection guarded by a
/// mutex. `rusqlite::Connection` is `Send` but not `Sync`; wrapping it this
/// way lets every store share one physical connection without each holding
/// its own pool.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (or create) a SQLite database file at `path` and apply the
    /// schema migrations.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database, primarily for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the guarded connection, mapping a poisoned lock to
    /// an internal error rather than panicking.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        let guard = self
            .conn
            .lock()
            .map_err(|_| Error::internal("storage connection mutex poisoned"))?;
        Ok(f(&guard)?)
    }

    /// Run `f` inside an explicit transaction, committing on `Ok` and
    /// rolling back on `Err`. Used by operations needing atomicity across
    /// several statements (e.g. registry promotion, §4.1).
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| Error::internal("storage connection mutex poisoned"))?;
        let tx = guard.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}
