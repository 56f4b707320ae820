//! Bounded, tenant-agnostic connection pool.

use crate::engine::Engine;
use crate::error::{StorageError, StorageResult};
use crate::transaction::Transaction;
use parking_lot::Mutex;
use practice_core::config::Credential;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Pool sizing and hygiene options.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub size: usize,
    pub checkout_timeout: Duration,
    /// Clear connection-persistent settings before every checkout.
    pub reset_on_checkout: bool,
    pub credential: Credential,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: 16,
            checkout_timeout: Duration::from_secs(5),
            reset_on_checkout: true,
            credential: Credential::Owner,
        }
    }
}

/// A physical connection. Owned by the pool, lent out through [`PooledConnection`].
pub struct Connection {
    id: u64,
    credential: Credential,
    /// Settings that outlive transactions (`set_config(.., false)`).
    session: HashMap<String, String>,
    checkouts: u64,
    engine: Arc<Engine>,
}

impl Connection {
    fn open(engine: Arc<Engine>, credential: Credential) -> Self {
        Self {
            id: engine.next_connection_id(),
            credential,
            session: HashMap::new(),
            checkouts: 0,
            engine,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn credential(&self) -> Credential {
        self.credential
    }

    /// How many times this connection has been handed out.
    pub fn checkouts(&self) -> u64 {
        self.checkouts
    }

    pub fn session_setting(&self, name: &str) -> Option<&str> {
        self.session.get(name).map(String::as_str)
    }

    /// `RESET ALL`.
    pub fn reset(&mut self) {
        if !self.session.is_empty() {
            debug!(connection_id = self.id, settings = self.session.len(), "Connection reset");
        }
        self.session.clear();
    }

    pub(crate) fn session(&self) -> &HashMap<String, String> {
        &self.session
    }

    pub(crate) fn session_mut(&mut self) -> &mut HashMap<String, String> {
        &mut self.session
    }

    pub(crate) fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
}

struct PoolInner {
    engine: Arc<Engine>,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
    options: PoolOptions,
}

/// Connection pool shared by every request regardless of tenant.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(engine: Arc<Engine>, options: PoolOptions) -> Self {
        let size = options.size.max(1);
        let idle = (0..size)
            .map(|_| Connection::open(engine.clone(), options.credential))
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                engine,
                idle: Mutex::new(idle),
                permits: Arc::new(Semaphore::new(size)),
                options,
            }),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.inner.engine
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Wait for a free connection, up to the checkout timeout.
    pub async fn checkout(&self) -> StorageResult<PooledConnection> {
        let permit = tokio::time::timeout(
            self.inner.options.checkout_timeout,
            self.inner.permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| StorageError::PoolTimeout)?
        .map_err(|_| StorageError::PoolClosed)?;

        let mut conn = self.inner.idle.lock().pop().unwrap_or_else(|| {
            Connection::open(self.inner.engine.clone(), self.inner.options.credential)
        });
        if self.inner.options.reset_on_checkout {
            conn.reset();
        }
        conn.checkouts += 1;

        Ok(PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }

    /// Stop handing out connections. Pending and future checkouts fail.
    pub fn close(&self) {
        self.inner.permits.close();
    }
}

/// A checked-out connection; returns to the pool on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// `BEGIN`.
    pub fn begin(self) -> Transaction {
        Transaction::new(self)
    }

    /// `SET name = value` outside a transaction: persists on the connection.
    pub fn set_session(&mut self, name: &str, value: &str) -> StorageResult<()> {
        crate::transaction::validate_setting_name(name)?;
        self.connection_mut()
            .session
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }

    pub(crate) fn connection_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.idle.lock().push(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(size: usize, reset: bool) -> Pool {
        Pool::new(
            Arc::new(Engine::new()),
            PoolOptions {
                size,
                checkout_timeout: Duration::from_millis(50),
                reset_on_checkout: reset,
                credential: Credential::Restricted,
            },
        )
    }

    #[tokio::test]
    async fn test_checkout_returns_connection_on_drop() {
        let pool = pool(1, true);
        let conn = pool.checkout().await.unwrap();
        let id = conn.connection().id();
        assert_eq!(pool.idle_count(), 0);
        drop(conn);
        assert_eq!(pool.idle_count(), 1);

        let again = pool.checkout().await.unwrap();
        assert_eq!(again.connection().id(), id);
        assert_eq!(again.connection().checkouts(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let pool = pool(1, true);
        let _held = pool.checkout().await.unwrap();
        let err = pool.checkout().await.err().unwrap();
        assert_eq!(err, StorageError::PoolTimeout);
    }

    #[tokio::test]
    async fn test_reset_on_checkout_clears_session_settings() {
        let pool = pool(1, true);
        let mut conn = pool.checkout().await.unwrap();
        conn.set_session("app.tenant_id", "acme").unwrap();
        drop(conn);

        let conn = pool.checkout().await.unwrap();
        assert_eq!(conn.connection().session_setting("app.tenant_id"), None);
    }

    #[tokio::test]
    async fn test_without_reset_session_settings_leak() {
        let pool = pool(1, false);
        let mut conn = pool.checkout().await.unwrap();
        conn.set_session("app.tenant_id", "acme").unwrap();
        drop(conn);

        let conn = pool.checkout().await.unwrap();
        assert_eq!(conn.connection().session_setting("app.tenant_id"), Some("acme"));
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_checkout() {
        let pool = pool(1, true);
        pool.close();
        assert_eq!(pool.checkout().await.err().unwrap(), StorageError::PoolClosed);
    }
}
