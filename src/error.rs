use std::time::Duration;

/// Error type for this crate.
#[derive(Debug, thiserror::Error)]
pub enum TollgateError {
    /// Redis error.
    #[cfg(feature = "redis-tokio")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-tokio")))]
    #[error("redis error: {0}")]
    RedisError(#[from] redis::RedisError),

    /// No pooled connection became available within the acquire timeout.
    #[error("timed out after {0:?} waiting for a pooled connection")]
    PoolTimeout(Duration),

    /// The pool was shut down.
    #[error("connection pool is closed")]
    PoolClosed,

    /// A store round trip did not complete within the command timeout.
    #[error("store command timed out after {0:?}")]
    CommandTimeout(Duration),

    /// A script reply was absent, empty or of an unexpected shape.
    #[error("malformed reply: {0}")]
    MalformedReply(String),

    /// Invalid limiter key.
    #[error("invalid limiter key: {0}")]
    InvalidKey(String),

    /// Invalid limiter rule.
    #[error("invalid limiter rule: {0}")]
    InvalidRule(String),

    /// Invalid window length.
    #[error("invalid window: {0}")]
    InvalidWindow(String),

    /// Invalid key match pattern.
    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    /// Invalid options.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// A named script could not be loaded.
    #[error("failed to load script `{name}`: {source}")]
    ScriptLoad {
        /// Script name, e.g. `limiter.lua`.
        name: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Startup failed; the wrapped error is the cause.
    #[error("startup failed: {0}")]
    Startup(Box<TollgateError>),
}

/// Coarse classification of a [`TollgateError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Store or pool unusable at start, or a script could not be loaded.
    Configuration,
    /// Connection, pool or timeout failure.
    Transport,
    /// The store answered with something the client cannot interpret.
    Protocol,
    /// The caller passed an invalid key, rule, window or pattern.
    InvalidInput,
}

impl TollgateError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            #[cfg(feature = "redis-tokio")]
            TollgateError::RedisError(_) => ErrorKind::Transport,
            TollgateError::PoolTimeout(_)
            | TollgateError::PoolClosed
            | TollgateError::CommandTimeout(_) => ErrorKind::Transport,
            TollgateError::MalformedReply(_) => ErrorKind::Protocol,
            TollgateError::InvalidKey(_)
            | TollgateError::InvalidRule(_)
            | TollgateError::InvalidWindow(_)
            | TollgateError::InvalidPattern(_) => ErrorKind::InvalidInput,
            TollgateError::InvalidOptions(_)
            | TollgateError::ScriptLoad { .. }
            | TollgateError::Startup(_) => ErrorKind::Configuration,
        }
    }
}
