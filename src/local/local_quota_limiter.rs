use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use dashmap::DashMap;

use crate::{
    Category, Clock, Granularity, LimiterKey, LimiterRule, OverageRecord, QuotaDecision,
    SystemClock, TollgateError, WindowBucket, WindowSeconds,
    pattern::{glob_match, validate_pattern},
    runtime,
};

#[derive(Debug, Clone, Copy)]
struct Counter {
    bucket: WindowBucket,
    amount: u64,
}

#[derive(Debug, Default)]
struct KeyState {
    counters: HashMap<Category, Counter>,
    overages: HashMap<(Category, i64), u64>,
}

/// In-process quota limiter.
///
/// Same rule, counter and overage model as the Redis provider, held in memory.
/// Evaluation for one key runs under that key's map entry lock, so concurrent
/// increments against the same key never over-admit.
///
/// # Semantics
///
/// - No rule for a key: [`QuotaDecision::AcceptedNoRule`], nothing recorded
/// - Any window already at `max_amount`: [`QuotaDecision::Rejected`], one overage
///   recorded for the first such window, no counter touched
/// - Otherwise every window's counter is incremented
///
/// Counters belong to the bucket they were last written in and read as zero once
/// that bucket has ended. Call [`LocalQuotaLimiter::cleanup`] (or run
/// [`LocalQuotaLimiter::run_cleanup_loop`]) to drop them from memory.
///
/// # Examples
///
/// ```
/// use tollgate::{Category, Granularity, LimiterKey, LimiterRule, LocalQuotaLimiter};
///
/// let limiter = LocalQuotaLimiter::default();
/// let key = LimiterKey::from_segments(["api", "user1"]).unwrap();
///
/// limiter
///     .set_limiter_rule(
///         &LimiterRule::new(key, vec![Granularity::new(Category::Minute, 100)]).unwrap(),
///     )
///     .unwrap();
///
/// assert!(limiter.allow(&["api", "user1"], None));
/// ```
pub struct LocalQuotaLimiter {
    clock: Arc<dyn Clock>,
    rules: DashMap<LimiterKey, Arc<[Granularity]>>,
    state: DashMap<LimiterKey, KeyState>,
    cleanup_active: AtomicBool,
}

impl Default for LocalQuotaLimiter {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl LocalQuotaLimiter {
    /// Create a limiter reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            rules: DashMap::new(),
            state: DashMap::new(),
            cleanup_active: AtomicBool::new(false),
        }
    } // end constructor

    /// Record one unit of consumption for the key built from `keys`.
    ///
    /// `override_expire` replaces the window length of a [`Category::Custom`]
    /// granularity for this call.
    pub fn increment<S: AsRef<str>>(
        &self,
        keys: &[S],
        override_expire: Option<WindowSeconds>,
    ) -> Result<QuotaDecision, TollgateError> {
        let key = LimiterKey::from_segments(keys)?;
        self.evaluate(&key, override_expire)
    }

    /// [`LocalQuotaLimiter::increment`] collapsed to a boolean.
    ///
    /// Errors are logged and reported as `false`.
    pub fn allow<S: AsRef<str>>(&self, keys: &[S], override_expire: Option<WindowSeconds>) -> bool {
        match self.increment(keys, override_expire) {
            Ok(decision) => decision.is_accepted(),
            Err(err) => {
                tracing::error!(error = ?err, "local.increment.error");
                false
            }
        }
    }

    fn evaluate(
        &self,
        key: &LimiterKey,
        override_expire: Option<WindowSeconds>,
    ) -> Result<QuotaDecision, TollgateError> {
        let Some(granularities) = self.rules.get(key).map(|rule| Arc::clone(rule.value())) else {
            return Ok(QuotaDecision::AcceptedNoRule);
        };

        let now_secs = self.clock.now_ms().div_euclid(1000);

        let mut plan = Vec::with_capacity(granularities.len());
        for granularity in granularities.iter() {
            let custom = match granularity.category {
                Category::Custom => override_expire.or(granularity.window),
                _ => None,
            };
            let bucket = WindowBucket::at(granularity.category, now_secs, custom).ok_or_else(|| {
                TollgateError::InvalidRule(format!(
                    "no window for {} at {now_secs}",
                    granularity.category
                ))
            })?;

            plan.push((granularity, bucket));
        }

        // holds the shard write lock until return
        let mut state = self.state.entry(key.clone()).or_default();

        for (granularity, bucket) in &plan {
            let current_amount = state
                .counters
                .get(&granularity.category)
                .filter(|counter| counter.bucket.contains(now_secs))
                .map_or(0, |counter| counter.amount);

            if current_amount >= granularity.max_amount {
                let overage = state
                    .overages
                    .entry((granularity.category, bucket.start))
                    .or_insert(0);
                *overage += 1;

                return Ok(QuotaDecision::Rejected {
                    category: granularity.category,
                    current_amount,
                    overage_count: *overage,
                });
            }
        }

        for (granularity, bucket) in plan {
            let counter = state
                .counters
                .entry(granularity.category)
                .or_insert(Counter { bucket, amount: 0 });

            if !counter.bucket.contains(now_secs) {
                counter.amount = 0;
            }
            counter.amount += 1;
            counter.bucket = bucket;
        }

        Ok(QuotaDecision::Accepted)
    } // end method evaluate

    /// Replace the whole granularity set for `rule.key`.
    ///
    /// An empty set removes the rule.
    pub fn set_limiter_rule(&self, rule: &LimiterRule) -> Result<(), TollgateError> {
        let rule = LimiterRule::new(rule.key.clone(), rule.granularities.clone())?;

        if rule.granularities.is_empty() {
            self.rules.remove(&rule.key);
            return Ok(());
        }

        let granularities: Arc<[Granularity]> = rule
            .granularities
            .into_iter()
            .map(|g| Granularity {
                now_amount: None,
                ..g
            })
            .collect();

        self.rules.insert(rule.key, granularities);
        Ok(())
    }

    /// Rules whose key matches the glob `pattern`, joined with live usage.
    ///
    /// Rules come back sorted by key; granularities ascending by `max_amount`.
    pub fn query_limiter_rules(&self, pattern: &str) -> Result<Vec<LimiterRule>, TollgateError> {
        validate_pattern(pattern)?;

        let now_ms = self.clock.now_ms();
        let now_secs = now_ms.div_euclid(1000);
        let as_of_ms = u64::try_from(now_ms).unwrap_or(0);

        let matched: Vec<(LimiterKey, Arc<[Granularity]>)> = self
            .rules
            .iter()
            .filter(|entry| glob_match(pattern, entry.key()))
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut rules = Vec::with_capacity(matched.len());
        for (key, granularities) in matched {
            let state = self.state.get(&key);

            let granularities = granularities
                .iter()
                .map(|granularity| {
                    let now_amount = state
                        .as_ref()
                        .and_then(|state| state.counters.get(&granularity.category).copied())
                        .filter(|counter| counter.bucket.contains(now_secs))
                        .map_or(0, |counter| counter.amount);

                    Granularity {
                        now_amount: Some(now_amount),
                        ..granularity.clone()
                    }
                })
                .collect();

            drop(state);
            rules.push(LimiterRule::snapshot(key, granularities, as_of_ms));
        }

        rules.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(rules)
    }

    /// Overage ledger entries for `key`, ordered by category then bucket.
    pub fn query_overages(&self, key: &LimiterKey) -> Vec<OverageRecord> {
        let Some(state) = self.state.get(key) else {
            return Vec::new();
        };

        let mut records: Vec<OverageRecord> = state
            .overages
            .iter()
            .map(|(&(category, bucket_start), &count)| OverageRecord {
                category,
                bucket_start,
                count,
            })
            .collect();

        records.sort();
        records
    }

    /// Drop counters whose bucket has ended.
    ///
    /// Keys left with neither counters nor overage records are removed.
    pub fn cleanup(&self) {
        let now_secs = self.clock.now_ms().div_euclid(1000);

        self.state.retain(|_, state| {
            state
                .counters
                .retain(|_, counter| counter.bucket.contains(now_secs));

            !state.counters.is_empty() || !state.overages.is_empty()
        });
    } // end method cleanup

    /// Number of keys currently holding counters or overage records.
    pub fn tracked_keys(&self) -> usize {
        self.state.len()
    }

    /// Run [`LocalQuotaLimiter::cleanup`] every `period` on the tokio runtime.
    ///
    /// The loop holds a weak reference and ends once the limiter is dropped or
    /// [`LocalQuotaLimiter::stop_cleanup_loop`] is called. Must be called from
    /// within a tokio runtime.
    pub fn run_cleanup_loop(self: &Arc<Self>, period: Duration) {
        self.cleanup_active.store(true, Ordering::SeqCst);
        let limiter: Weak<Self> = Arc::downgrade(self);

        runtime::spawn_task(async move {
            let mut interval = runtime::new_interval(period);
            // the first tick completes immediately
            runtime::tick(&mut interval).await;

            loop {
                runtime::tick(&mut interval).await;

                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                if !limiter.cleanup_active.load(Ordering::SeqCst) {
                    break;
                }

                limiter.cleanup();
                tracing::trace!(keys = limiter.tracked_keys(), "local.cleanup");
            }
        });
    }

    /// Stop a loop started with [`LocalQuotaLimiter::run_cleanup_loop`].
    pub fn stop_cleanup_loop(&self) {
        self.cleanup_active.store(false, Ordering::SeqCst);
    }
} // end of impl
