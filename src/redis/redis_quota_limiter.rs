use std::{collections::HashMap, sync::Arc, time::Duration};

use redis::{Client, FromRedisValue, ScriptInvocation, Value};

use crate::{
    CUSTOM_WINDOW_FIELD, KeyPrefix, LimiterKey, LimiterRule, OverageRecord, QuotaDecision,
    RedisKeyGenerator, RedisQuotaLimiterOptions, ScriptSet, TollgateError, TollgateRedisPool,
    WindowSeconds,
    pattern::validate_pattern,
    redis::reply::{
        parse_batch_set_reply, parse_limiter_reply, parse_overages, parse_rule_query_reply,
    },
    runtime::with_timeout,
};

#[derive(Clone, Copy)]
enum Request<'a> {
    Script(&'a ScriptInvocation<'a>),
    Command(&'a redis::Cmd),
}

/// Quota limiter backed by Redis.
///
/// Every operation checks one connection out of the owned
/// [`TollgateRedisPool`], runs one atomic Lua script (or one command) and
/// returns the connection on every exit path. Window boundaries use the Redis
/// server's clock.
///
/// # Examples
///
/// ```no_run
/// use tollgate::{
///     Category, Granularity, LimiterKey, LimiterRule, RedisQuotaLimiter,
///     RedisQuotaLimiterOptions,
/// };
///
/// # async fn run() -> Result<(), tollgate::TollgateError> {
/// let limiter =
///     RedisQuotaLimiter::start(RedisQuotaLimiterOptions::new("redis://127.0.0.1:6379/"))
///         .await?;
///
/// let key = LimiterKey::from_segments(["api", "user1"])?;
/// limiter
///     .set_limiter_rule(&LimiterRule::new(
///         key,
///         vec![
///             Granularity::new(Category::Second, 5),
///             Granularity::new(Category::Minute, 100),
///         ],
///     )?)
///     .await?;
///
/// if limiter.allow(&["api", "user1"], None).await {
///     // serve the request
/// }
///
/// limiter.shutdown();
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct RedisQuotaLimiter {
    pool: Arc<TollgateRedisPool>,
    scripts: ScriptSet,
    key_generator: RedisKeyGenerator,
    command_timeout: Option<Duration>,
    scan_count: u32,
}

impl RedisQuotaLimiter {
    /// Validate `options`, load the scripts, open the pool and register the
    /// scripts with the server.
    ///
    /// Any failure is logged and returned as [`TollgateError::Startup`].
    pub async fn start(options: RedisQuotaLimiterOptions) -> Result<Self, TollgateError> {
        match Self::connect(options).await {
            Ok(limiter) => {
                tracing::info!(
                    max_size = limiter.pool.options().max_size,
                    "redis.limiter.started"
                );
                Ok(limiter)
            }
            Err(err) => {
                tracing::error!(error = ?err, "redis.limiter.start.error");
                Err(TollgateError::Startup(Box::new(err)))
            }
        }
    }

    async fn connect(options: RedisQuotaLimiterOptions) -> Result<Self, TollgateError> {
        options.validate()?;

        let scripts = ScriptSet::load(&options.scripts)?;
        let client = Client::open(options.url.as_str())?;
        let pool = TollgateRedisPool::new(client, options.pool.clone()).await?;

        let limiter = Self::with_pool(
            Arc::new(pool),
            scripts,
            options.prefix.as_ref(),
            options.command_timeout,
        );
        let limiter = Self {
            scan_count: options.scan_count,
            ..limiter
        };

        limiter.load_scripts().await?;
        Ok(limiter)
    }

    /// Build a limiter on an existing pool.
    ///
    /// Scripts are not pre-registered; the first call of each falls back from
    /// `EVALSHA` to `EVAL`.
    pub fn with_pool(
        pool: Arc<TollgateRedisPool>,
        scripts: ScriptSet,
        prefix: Option<&KeyPrefix>,
        command_timeout: Option<Duration>,
    ) -> Self {
        Self {
            pool,
            scripts,
            key_generator: RedisKeyGenerator::new(prefix),
            command_timeout,
            scan_count: 100,
        }
    }

    async fn load_scripts(&self) -> Result<(), TollgateError> {
        let mut connection = self.pool.get().await?;

        for script in [
            &self.scripts.limiter,
            &self.scripts.rule_batch_set,
            &self.scripts.rule_query,
        ] {
            let hash: String = with_timeout(
                self.command_timeout,
                async {
                    script
                        .prepare_invoke()
                        .load_async(&mut *connection)
                        .await
                        .map_err(TollgateError::from)
                },
                TollgateError::CommandTimeout,
            )
            .await?;

            tracing::debug!(sha = %hash, "redis.script.registered");
        }

        Ok(())
    }

    /// Record one unit of consumption for the key built from `keys`.
    ///
    /// `override_expire` replaces the window length of a
    /// [`Category::Custom`](crate::Category::Custom) granularity for this call.
    pub async fn increment<S: AsRef<str>>(
        &self,
        keys: &[S],
        override_expire: Option<WindowSeconds>,
    ) -> Result<QuotaDecision, TollgateError> {
        let key = LimiterKey::from_segments(keys)?;

        let mut invocation = self.scripts.limiter.prepare_invoke();
        invocation
            .key(&*self.key_generator.get_rule_key(&key))
            .key(&*self.key_generator.get_mark_key(&key));
        for incr_key in self.key_generator.get_incr_keys(&key).iter() {
            invocation.key(&**incr_key);
        }
        invocation.arg(override_expire.map_or_else(String::new, |w| (*w).to_string()));

        let reply: Value = self.run(Request::Script(&invocation)).await?;
        let decision = parse_limiter_reply(&reply)?;

        if let QuotaDecision::Rejected {
            category,
            overage_count,
            ..
        } = decision
        {
            tracing::debug!(key = %key, %category, overage_count, "redis.increment.rejected");
        }

        Ok(decision)
    } // end method increment

    /// [`RedisQuotaLimiter::increment`] collapsed to a boolean.
    ///
    /// Errors are logged and reported as `false`.
    pub async fn allow<S: AsRef<str>>(
        &self,
        keys: &[S],
        override_expire: Option<WindowSeconds>,
    ) -> bool {
        match self.increment(keys, override_expire).await {
            Ok(decision) => decision.is_accepted(),
            Err(err) => {
                tracing::error!(error = ?err, kind = ?err.kind(), "redis.increment.error");
                false
            }
        }
    }

    /// Replace the whole granularity set for `rule.key`.
    ///
    /// An empty set removes the rule.
    pub async fn set_limiter_rule(&self, rule: &LimiterRule) -> Result<(), TollgateError> {
        let rule = LimiterRule::new(rule.key.clone(), rule.granularities.clone())?;

        let mut invocation = self.scripts.rule_batch_set.prepare_invoke();
        invocation.key(&*self.key_generator.get_rule_key(&rule.key));

        for granularity in &rule.granularities {
            invocation
                .arg(granularity.category.as_str())
                .arg(granularity.max_amount);

            if let Some(window) = granularity.window {
                invocation.arg(CUSTOM_WINDOW_FIELD).arg(*window);
            }
        }

        let reply: Value = self.run(Request::Script(&invocation)).await?;
        parse_batch_set_reply(&reply)?;

        tracing::debug!(
            key = %rule.key,
            granularities = rule.granularities.len(),
            "redis.rule.set"
        );
        Ok(())
    }

    /// Rules whose key matches the glob `pattern`, joined with live usage.
    ///
    /// Rules come back sorted by key; granularities ascending by `max_amount`.
    /// Any malformed stored rule fails the whole query.
    pub async fn query_limiter_rules(
        &self,
        pattern: &str,
    ) -> Result<Vec<LimiterRule>, TollgateError> {
        validate_pattern(pattern)?;

        let mut invocation = self.scripts.rule_query.prepare_invoke();
        invocation
            .arg(self.key_generator.rule_prefix())
            .arg(self.key_generator.incr_prefix())
            .arg(pattern)
            .arg(self.scan_count);

        let reply: Value = self.run(Request::Script(&invocation)).await?;
        parse_rule_query_reply(&reply)
    }

    /// Overage ledger entries for `key`, ordered by category then bucket.
    pub async fn query_overages(
        &self,
        key: &LimiterKey,
    ) -> Result<Vec<OverageRecord>, TollgateError> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(&*self.key_generator.get_mark_key(key));

        let fields: HashMap<String, u64> = self.run(Request::Command(&cmd)).await?;
        parse_overages(fields)
    }

    /// Close the pool. Later calls fail with [`TollgateError::PoolClosed`].
    pub fn shutdown(&self) {
        self.pool.close();
        tracing::info!("redis.limiter.shutdown");
    }

    /// The pool this limiter draws connections from.
    pub fn pool(&self) -> &Arc<TollgateRedisPool> {
        &self.pool
    }

    async fn run<T: FromRedisValue>(&self, request: Request<'_>) -> Result<T, TollgateError> {
        let mut connection = self.pool.get().await?;

        let result = with_timeout(
            self.command_timeout,
            async {
                let reply = match request {
                    Request::Script(invocation) => invocation.invoke_async(&mut *connection).await,
                    Request::Command(cmd) => cmd.query_async(&mut *connection).await,
                };
                reply.map_err(TollgateError::from)
            },
            TollgateError::CommandTimeout,
        )
        .await;

        match &result {
            Err(TollgateError::CommandTimeout(_)) => connection.discard(),
            Err(TollgateError::RedisError(err))
                if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() =>
            {
                connection.discard()
            }
            _ => {}
        }

        result
    }
}
