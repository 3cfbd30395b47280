use std::{ops::Deref, sync::Arc};

use dashmap::DashMap;

use crate::{Category, LimiterKey, TollgateError};

pub(crate) const RULE_NAMESPACE: &str = "rate_limiter_rule";
pub(crate) const INCR_NAMESPACE: &str = "rate_limiter_incr";
pub(crate) const MARK_NAMESPACE: &str = "rate_limiter_mark";

/// A validated namespace prepended to every Redis key the limiter touches.
///
/// This is a string with the following constraints:
/// - Must not be empty
/// - Must not be longer than 255 bytes
/// - Must not contain colons
/// - Must not contain glob characters (`*`, `?`, `[`, `]`, `\`)
#[derive(Debug, Clone, PartialEq, PartialOrd, Hash, Eq)]
pub struct KeyPrefix(Arc<str>);

impl Deref for KeyPrefix {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<String> for KeyPrefix {
    type Error = TollgateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            Err(TollgateError::InvalidOptions(
                "Key prefix must not be empty".to_string(),
            ))
        } else if value.len() > 255 {
            Err(TollgateError::InvalidOptions(
                "Key prefix must not be longer than 255 characters".to_string(),
            ))
        } else if value.contains(':') {
            Err(TollgateError::InvalidOptions(
                "Key prefix must not contain colons".to_string(),
            ))
        } else if value.contains(['*', '?', '[', ']', '\\']) {
            Err(TollgateError::InvalidOptions(
                "Key prefix must not contain glob characters".to_string(),
            ))
        } else {
            Ok(Self(Arc::from(value)))
        }
    }
}

impl TryFrom<&str> for KeyPrefix {
    type Error = TollgateError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

/// Most limiter keys each name cache holds before it is emptied.
pub(crate) const KEY_CACHE_CAPACITY: usize = 10_000;

/// Builds (and caches) the Redis key names of the rule, counter and overage
/// families.
///
/// Without a prefix:
/// - `rate_limiter_rule:<KEY>`
/// - `rate_limiter_incr:<KEY>:<CATEGORY>`
/// - `rate_limiter_mark:<KEY>`
///
/// With a prefix every name starts with `<prefix>:`.
///
/// Each cache is cleared once it reaches its capacity, so per-user keys cannot
/// grow it without bound.
#[derive(Debug)]
pub(crate) struct RedisKeyGenerator {
    rule_prefix: Arc<str>,
    incr_prefix: Arc<str>,
    mark_prefix: Arc<str>,

    // caches
    cache_capacity: usize,
    rule_key_cache: DashMap<LimiterKey, Arc<str>>,
    mark_key_cache: DashMap<LimiterKey, Arc<str>>,
    incr_keys_cache: DashMap<LimiterKey, Arc<[Arc<str>]>>,
}

impl RedisKeyGenerator {
    pub(crate) fn new(prefix: Option<&KeyPrefix>) -> Self {
        Self::with_cache_capacity(prefix, KEY_CACHE_CAPACITY)
    }

    pub(crate) fn with_cache_capacity(prefix: Option<&KeyPrefix>, cache_capacity: usize) -> Self {
        let namespaced = |namespace: &str| -> Arc<str> {
            match prefix {
                Some(prefix) => Arc::from(format!("{}:{namespace}:", &**prefix)),
                None => Arc::from(format!("{namespace}:")),
            }
        };

        Self {
            rule_prefix: namespaced(RULE_NAMESPACE),
            incr_prefix: namespaced(INCR_NAMESPACE),
            mark_prefix: namespaced(MARK_NAMESPACE),
            cache_capacity,
            rule_key_cache: DashMap::new(),
            mark_key_cache: DashMap::new(),
            incr_keys_cache: DashMap::new(),
        }
    }

    /// `…rate_limiter_rule:`, the part of a rule key before the limiter key.
    pub(crate) fn rule_prefix(&self) -> &str {
        &self.rule_prefix
    }

    /// `…rate_limiter_incr:`, the part of a counter key before the limiter key.
    pub(crate) fn incr_prefix(&self) -> &str {
        &self.incr_prefix
    }

    fn cached<V: Clone>(
        &self,
        cache: &DashMap<LimiterKey, V>,
        key: &LimiterKey,
        build: impl FnOnce() -> V,
    ) -> V {
        if let Some(value) = cache.get(key) {
            return value.clone();
        }

        let value = build();
        if self.cache_capacity == 0 {
            return value;
        }
        if cache.len() >= self.cache_capacity {
            cache.clear();
        }
        cache.insert(key.clone(), value.clone());

        value
    }

    pub(crate) fn get_rule_key(&self, key: &LimiterKey) -> Arc<str> {
        self.cached(&self.rule_key_cache, key, || {
            Arc::from(format!("{}{}", self.rule_prefix, &**key))
        })
    }

    pub(crate) fn get_mark_key(&self, key: &LimiterKey) -> Arc<str> {
        self.cached(&self.mark_key_cache, key, || {
            Arc::from(format!("{}{}", self.mark_prefix, &**key))
        })
    }

    pub(crate) fn get_incr_key(&self, key: &LimiterKey, category: Category) -> String {
        format!("{}{}:{}", self.incr_prefix, &**key, category.as_str())
    }

    /// Counter keys for every category, in [`Category::ALL`] order.
    pub(crate) fn get_incr_keys(&self, key: &LimiterKey) -> Arc<[Arc<str>]> {
        self.cached(&self.incr_keys_cache, key, || {
            Category::ALL
                .iter()
                .map(|category| Arc::from(self.get_incr_key(key, *category)))
                .collect()
        })
    }

    /// Largest number of limiter keys held by any one cache.
    #[cfg(test)]
    pub(crate) fn cached_keys(&self) -> usize {
        self.rule_key_cache
            .len()
            .max(self.mark_key_cache.len())
            .max(self.incr_keys_cache.len())
    }
}
