//! A connection shared between threads.
//!
//! Callers serialize on a `parking_lot` mutex, so a command always runs to
//! completion before the next one starts.

use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use sqlwire_core::{Result, Value};

use crate::config::MySqlConfig;
use crate::connection::MySqlConnection;
use crate::resultset::ResultSet;
use crate::statement::UpdateResult;
use crate::stream::{MySqlStream, Socket};

/// Cloneable handle to one [`MySqlConnection`].
pub struct SharedConnection<S: Socket = MySqlStream> {
    inner: Arc<Mutex<MySqlConnection<S>>>,
}

impl SharedConnection<MySqlStream> {
    pub fn connect(config: MySqlConfig) -> Result<Self> {
        MySqlConnection::connect(config).map(Self::new)
    }
}

impl<S: Socket> SharedConnection<S> {
    pub fn new(conn: MySqlConnection<S>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(conn)),
        }
    }

    /// Exclusive access for a sequence of commands.
    pub fn lock(&self) -> MutexGuard<'_, MySqlConnection<S>> {
        self.inner.lock()
    }

    pub fn query(&self, sql: &str, params: &[Value]) -> Result<ResultSet> {
        self.lock().query(sql, params)
    }

    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<UpdateResult> {
        self.lock().execute(sql, params)
    }

    pub fn ping(&self) -> Result<()> {
        self.lock().ping()
    }

    /// Run `f` inside a transaction, holding the lock throughout.
    ///
    /// Commits when `f` succeeds and rolls back when it fails; autocommit
    /// is restored afterwards either way.
    pub fn transaction<T>(&self, f: impl FnOnce(&mut MySqlConnection<S>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let restore = conn.autocommit();
        conn.begin()?;
        let result = f(&mut conn);
        let finish = match &result {
            Ok(_) => conn.commit(),
            Err(e) => {
                tracing::debug!(error = %e, "rolling back shared transaction");
                conn.rollback()
            }
        };
        if restore && conn.is_usable() {
            conn.set_autocommit(true)?;
        }
        let value = result?;
        finish?;
        Ok(value)
    }

    pub fn is_usable(&self) -> bool {
        self.lock().is_usable()
    }

    pub fn close(&self) -> Result<()> {
        self.lock().close()
    }
}

impl<S: Socket> Clone for SharedConnection<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Socket> std::fmt::Debug for SharedConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConnection")
            .field("inner", &"Arc<Mutex<MySqlConnection>>")
            .finish()
    }
}
