use std::{
    ops::{Deref, DerefMut},
    time::Duration,
};

use parking_lot::Mutex;
use redis::{Client, aio::MultiplexedConnection};
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::{TollgateError, runtime::with_timeout};

/// Sizing and timeouts of a [`TollgateRedisPool`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolOptions {
    /// Upper bound on connections checked out at once. Must be at least 1.
    pub max_size: usize,
    /// Connections opened eagerly at startup. Must not exceed `max_size`.
    pub min_idle: usize,
    /// How long [`TollgateRedisPool::get`] waits for a free slot. `None` waits
    /// forever.
    pub acquire_timeout: Option<Duration>,
    /// How long opening one connection may take. `None` waits forever.
    pub connect_timeout: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_size: 16,
            min_idle: 1,
            acquire_timeout: Some(Duration::from_secs(5)),
            connect_timeout: Some(Duration::from_secs(5)),
        }
    }
}

impl PoolOptions {
    pub(crate) fn validate(&self) -> Result<(), TollgateError> {
        if self.max_size == 0 {
            return Err(TollgateError::InvalidOptions(
                "Pool max size must be at least 1".to_string(),
            ));
        }
        if self.min_idle > self.max_size {
            return Err(TollgateError::InvalidOptions(format!(
                "Pool min idle ({}) must not exceed max size ({})",
                self.min_idle, self.max_size
            )));
        }

        Ok(())
    }
}

/// Point-in-time counters of a [`TollgateRedisPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStatus {
    /// Configured upper bound.
    pub max_size: usize,
    /// Open connections waiting to be checked out.
    pub idle: usize,
    /// Connections currently checked out.
    pub in_use: usize,
}

/// Bounded pool of multiplexed Redis connections.
///
/// A semaphore caps the number of checked-out connections at `max_size`;
/// idle connections are kept in a stack and reused most-recently-returned
/// first. A connection that saw a transport error is discarded instead of
/// returned.
pub struct TollgateRedisPool {
    client: Client,
    idle: Mutex<Vec<MultiplexedConnection>>,
    permits: Semaphore,
    options: PoolOptions,
}

impl std::fmt::Debug for TollgateRedisPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TollgateRedisPool")
            .field("options", &self.options)
            .field("status", &self.status())
            .finish()
    }
}

impl TollgateRedisPool {
    /// Build a pool and open `options.min_idle` connections.
    pub async fn new(client: Client, options: PoolOptions) -> Result<Self, TollgateError> {
        options.validate()?;

        let pool = Self {
            client,
            idle: Mutex::new(Vec::with_capacity(options.max_size)),
            permits: Semaphore::new(options.max_size),
            options,
        };

        for _ in 0..pool.options.min_idle {
            let connection = pool.connect().await?;
            pool.idle.lock().push(connection);
        }

        tracing::debug!(
            max_size = pool.options.max_size,
            min_idle = pool.options.min_idle,
            "redis.pool.ready"
        );

        Ok(pool)
    }

    async fn connect(&self) -> Result<MultiplexedConnection, TollgateError> {
        with_timeout(
            self.options.connect_timeout,
            async {
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(TollgateError::from)
            },
            TollgateError::CommandTimeout,
        )
        .await
    }

    /// Check out a connection, opening a new one if none is idle.
    ///
    /// Fails with [`TollgateError::PoolTimeout`] when no slot frees up within the
    /// acquire timeout and with [`TollgateError::PoolClosed`] after
    /// [`TollgateRedisPool::close`].
    pub async fn get(&self) -> Result<PooledConnection<'_>, TollgateError> {
        let permit = with_timeout(
            self.options.acquire_timeout,
            async {
                self.permits
                    .acquire()
                    .await
                    .map_err(|_| TollgateError::PoolClosed)
            },
            TollgateError::PoolTimeout,
        )
        .await?;

        let idle = self.idle.lock().pop();
        let connection = match idle {
            Some(connection) => connection,
            None => self.connect().await?,
        };

        Ok(PooledConnection {
            pool: self,
            connection,
            _permit: permit,
            broken: false,
        })
    }

    /// Close the pool. Pending and later checkouts fail, idle connections are
    /// dropped, and connections still checked out are dropped on return.
    pub fn close(&self) {
        self.permits.close();
        self.idle.lock().clear();
    }

    /// Whether [`TollgateRedisPool::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    /// Current pool counters.
    pub fn status(&self) -> PoolStatus {
        let available = self.permits.available_permits();

        PoolStatus {
            max_size: self.options.max_size,
            idle: self.idle.lock().len(),
            in_use: if self.is_closed() {
                0
            } else {
                self.options.max_size.saturating_sub(available)
            },
        }
    }

    /// Configured options.
    pub fn options(&self) -> &PoolOptions {
        &self.options
    }
}

/// A connection checked out of a [`TollgateRedisPool`].
///
/// Returned to the pool on drop unless [`PooledConnection::discard`] was called
/// or the pool has been closed.
pub struct PooledConnection<'a> {
    pool: &'a TollgateRedisPool,
    connection: MultiplexedConnection,
    _permit: SemaphorePermit<'a>,
    broken: bool,
}

impl PooledConnection<'_> {
    /// Drop this connection instead of returning it to the pool.
    pub fn discard(&mut self) {
        self.broken = true;
    }
}

impl Deref for PooledConnection<'_> {
    type Target = MultiplexedConnection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl DerefMut for PooledConnection<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.connection
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if self.broken {
            tracing::debug!("redis.pool.discard");
            return;
        }

        // handles share one multiplexed pipeline, so the clone is the same connection
        if !self.pool.is_closed() {
            self.pool.idle.lock().push(self.connection.clone());
        }
    }
}
