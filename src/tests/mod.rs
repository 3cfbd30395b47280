
mod test_common_validation;

#[cfg(feature = "redis-tokio")]
mod test_redis_quota_limiter;
