use std::{path::PathBuf, str::FromStr, time::Duration};

use crate::{KeyPrefix, PoolOptions, ScriptSource, TollgateError};

/// Environment variable holding the Redis URL.
pub const ENV_REDIS_URL: &str = "TOLLGATE_REDIS_URL";
/// Environment variable holding the key prefix.
pub const ENV_KEY_PREFIX: &str = "TOLLGATE_KEY_PREFIX";
/// Environment variable holding [`PoolOptions::max_size`].
pub const ENV_POOL_MAX_SIZE: &str = "TOLLGATE_POOL_MAX_SIZE";
/// Environment variable holding [`PoolOptions::min_idle`].
pub const ENV_POOL_MIN_IDLE: &str = "TOLLGATE_POOL_MIN_IDLE";
/// Environment variable holding [`PoolOptions::acquire_timeout`] in milliseconds.
pub const ENV_POOL_ACQUIRE_TIMEOUT_MS: &str = "TOLLGATE_POOL_ACQUIRE_TIMEOUT_MS";
/// Environment variable holding [`PoolOptions::connect_timeout`] in milliseconds.
pub const ENV_CONNECT_TIMEOUT_MS: &str = "TOLLGATE_CONNECT_TIMEOUT_MS";
/// Environment variable holding the command timeout in milliseconds.
pub const ENV_COMMAND_TIMEOUT_MS: &str = "TOLLGATE_COMMAND_TIMEOUT_MS";
/// Environment variable holding a directory to load scripts from.
pub const ENV_SCRIPT_DIR: &str = "TOLLGATE_SCRIPT_DIR";
/// Environment variable holding the `SCAN COUNT` hint of rule queries.
pub const ENV_SCAN_COUNT: &str = "TOLLGATE_SCAN_COUNT";

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/";
const DEFAULT_SCAN_COUNT: u32 = 100;

/// Configuration of a [`RedisQuotaLimiter`](crate::RedisQuotaLimiter).
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use tollgate::{KeyPrefix, RedisQuotaLimiterOptions};
///
/// let mut options = RedisQuotaLimiterOptions::new("redis://127.0.0.1:6379/");
/// options.prefix = Some(KeyPrefix::try_from("myapp").unwrap());
/// options.command_timeout = Some(Duration::from_millis(250));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedisQuotaLimiterOptions {
    /// Connection URL, e.g. `redis://127.0.0.1:6379/`.
    pub url: String,

    /// Optional namespace for all Redis keys.
    ///
    /// With a prefix every key starts with `<prefix>:`; without one the key
    /// layout is `rate_limiter_rule:<KEY>`, `rate_limiter_incr:<KEY>:<CATEGORY>`
    /// and `rate_limiter_mark:<KEY>`.
    pub prefix: Option<KeyPrefix>,

    /// Connection pool sizing and timeouts.
    pub pool: PoolOptions,

    /// Where the Lua scripts come from.
    pub scripts: ScriptSource,

    /// Bound on every script round trip. `None` waits forever.
    pub command_timeout: Option<Duration>,

    /// `SCAN COUNT` hint used by rule queries. Must be at least 1.
    pub scan_count: u32,
}

impl Default for RedisQuotaLimiterOptions {
    fn default() -> Self {
        Self::new(DEFAULT_REDIS_URL)
    }
}

impl RedisQuotaLimiterOptions {
    /// Options with defaults for everything but the URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            prefix: None,
            pool: PoolOptions::default(),
            scripts: ScriptSource::Embedded,
            command_timeout: Some(Duration::from_secs(2)),
            scan_count: DEFAULT_SCAN_COUNT,
        }
    }

    /// Read options from `TOLLGATE_*` environment variables.
    ///
    /// Unset variables keep their defaults; set but unparsable ones are an
    /// [`TollgateError::InvalidOptions`]. A timeout of `0` disables it.
    pub fn from_env() -> Result<Self, TollgateError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// [`RedisQuotaLimiterOptions::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, TollgateError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();

        if let Some(url) = lookup(ENV_REDIS_URL) {
            options.url = url;
        }
        if let Some(prefix) = lookup(ENV_KEY_PREFIX) {
            options.prefix = Some(KeyPrefix::try_from(prefix)?);
        }
        if let Some(max_size) = parse_var(&lookup, ENV_POOL_MAX_SIZE)? {
            options.pool.max_size = max_size;
        }
        if let Some(min_idle) = parse_var(&lookup, ENV_POOL_MIN_IDLE)? {
            options.pool.min_idle = min_idle;
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_POOL_ACQUIRE_TIMEOUT_MS)? {
            options.pool.acquire_timeout = millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_CONNECT_TIMEOUT_MS)? {
            options.pool.connect_timeout = millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_COMMAND_TIMEOUT_MS)? {
            options.command_timeout = millis(ms);
        }
        if let Some(dir) = lookup(ENV_SCRIPT_DIR) {
            options.scripts = ScriptSource::Directory(PathBuf::from(dir));
        }
        if let Some(scan_count) = parse_var(&lookup, ENV_SCAN_COUNT)? {
            options.scan_count = scan_count;
        }

        options.validate()?;
        Ok(options)
    }

    pub(crate) fn validate(&self) -> Result<(), TollgateError> {
        if self.url.is_empty() {
            return Err(TollgateError::InvalidOptions(
                "Redis URL must not be empty".to_string(),
            ));
        }
        if self.scan_count == 0 {
            return Err(TollgateError::InvalidOptions(
                "Scan count must be at least 1".to_string(),
            ));
        }

        self.pool.validate()
    }
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>, TollgateError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            TollgateError::InvalidOptions(format!("{name}=`{raw}` is not a valid number"))
        }),
    }
}
