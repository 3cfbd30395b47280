use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use redis::AsyncCommands;

use super::runtime::{async_sleep, block_on, redis_url};
use crate::{
    Category, ErrorKind, Granularity, KeyPrefix, LimiterKey, LimiterRule, MAX_WINDOW_SECONDS,
    PoolOptions, QuotaDecision, RedisKeyGenerator, RedisQuotaLimiter, RedisQuotaLimiterOptions,
    ScriptSet, ScriptSource, TollgateError, TollgateRedisPool, WindowBucket, WindowSeconds,
};

fn unique_prefix() -> KeyPrefix {
    let n: u64 = rand::random();
    KeyPrefix::try_from(format!("tollgate_test_{n}")).unwrap()
}

fn key(s: &str) -> LimiterKey {
    LimiterKey::try_from(s).unwrap()
}

async fn build_limiter(url: &str) -> (RedisQuotaLimiter, KeyPrefix) {
    let prefix = unique_prefix();

    let mut options = RedisQuotaLimiterOptions::new(url);
    options.prefix = Some(prefix.clone());

    (RedisQuotaLimiter::start(options).await.unwrap(), prefix)
}

async fn set_rule(limiter: &RedisQuotaLimiter, k: &str, granularities: Vec<Granularity>) {
    limiter
        .set_limiter_rule(&LimiterRule::new(key(k), granularities).unwrap())
        .await
        .unwrap();
}

#[test]
fn no_rule_is_accepted() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let (limiter, _prefix) = build_limiter(&url).await;

        for _ in 0..5 {
            assert_eq!(
                limiter.increment(&["api", "user1"], None).await.unwrap(),
                QuotaDecision::AcceptedNoRule
            );
        }
        assert!(limiter.query_overages(&key("api/user1")).await.unwrap().is_empty());
    });
}

#[test]
fn rejects_after_max_amount_and_counts_overages() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let (limiter, _prefix) = build_limiter(&url).await;
        set_rule(&limiter, "k", vec![Granularity::new(Category::Day, 3)]).await;

        for _ in 0..3 {
            assert_eq!(
                limiter.increment(&["k"], None).await.unwrap(),
                QuotaDecision::Accepted
            );
        }
        for overage in 1..=2 {
            assert_eq!(
                limiter.increment(&["k"], None).await.unwrap(),
                QuotaDecision::Rejected {
                    category: Category::Day,
                    current_amount: 3,
                    overage_count: overage,
                }
            );
        }

        let records = limiter.query_overages(&key("k")).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].category, Category::Day);
        assert_eq!(records[0].bucket_start % 86_400, 0);
        assert_eq!(records[0].count, 2);
    });
}

#[test]
fn rejections_never_change_counters() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let (limiter, _prefix) = build_limiter(&url).await;
        set_rule(
            &limiter,
            "k",
            vec![
                Granularity::new(Category::Year, 100),
                Granularity::new(Category::Day, 2),
            ],
        )
        .await;

        assert!(limiter.allow(&["k"], None).await);
        assert!(limiter.allow(&["k"], None).await);
        for _ in 0..3 {
            assert!(!limiter.allow(&["k"], None).await);
        }

        let rules = limiter.query_limiter_rules("k").await.unwrap();
        let usage: Vec<_> = rules[0]
            .granularities
            .iter()
            .map(|g| (g.category, g.max_amount, g.now_amount))
            .collect();
        assert_eq!(
            usage,
            vec![
                (Category::Day, 2, Some(2)),
                (Category::Year, 100, Some(2))
            ]
        );
    });
}

#[test]
fn counter_resets_after_window_boundary() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let (limiter, _prefix) = build_limiter(&url).await;
        set_rule(&limiter, "k", vec![Granularity::new(Category::Second, 1)]).await;

        let mut rejected = false;
        for _ in 0..10 {
            if !limiter.allow(&["k"], None).await {
                rejected = true;
                break;
            }
        }
        assert!(rejected);

        async_sleep(Duration::from_millis(1_100)).await;
        assert!(limiter.allow(&["k"], None).await);
    });
}

#[test]
fn custom_window_and_rule_storage() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let (limiter, prefix) = build_limiter(&url).await;
        let window = WindowSeconds::try_from(3_600).unwrap();
        set_rule(
            &limiter,
            "api/user1",
            vec![
                Granularity::new(Category::Minute, 100),
                Granularity::custom(window, 1),
            ],
        )
        .await;

        let client = redis::Client::open(url.as_str()).unwrap();
        let mut conn = client.get_multiplexed_async_connection().await.unwrap();
        let generator = RedisKeyGenerator::new(Some(&prefix));

        let stored: HashMap<String, String> =
            conn.hgetall(&*generator.get_rule_key(&key("api/user1"))).await.unwrap();
        assert_eq!(stored.get("MINUTE").map(String::as_str), Some("100"));
        assert_eq!(stored.get("CUSTOM").map(String::as_str), Some("1"));
        assert_eq!(stored.get("CUSTOM_window").map(String::as_str), Some("3600"));

        assert!(limiter.allow(&["api", "user1"], None).await);
        assert!(
            !limiter
                .allow(&["api", "user1"], Some(WindowSeconds::try_from(7_200).unwrap()))
                .await
        );

        let ttl: i64 = conn
            .ttl(generator.get_incr_key(&key("api/user1"), Category::Custom))
            .await
            .unwrap();
        assert!(ttl > 0 && ttl <= 3_600, "ttl {ttl}");

        let rules = limiter.query_limiter_rules("api/*").await.unwrap();
        assert_eq!(
            rules[0].granularity(Category::Custom).unwrap().window,
            Some(window)
        );
    });
}

async fn server_now(conn: &mut redis::aio::MultiplexedConnection) -> i64 {
    let (secs, _micros): (i64, i64) = redis::cmd("TIME").query_async(conn).await.unwrap();
    secs
}

async fn expire_time(conn: &mut redis::aio::MultiplexedConnection, counter: String) -> i64 {
    redis::cmd("EXPIRETIME")
        .arg(counter)
        .query_async(conn)
        .await
        .unwrap()
}

// EXPIRETIME needs Redis 7
#[test]
fn calendar_and_custom_buckets_follow_server_time() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let (limiter, prefix) = build_limiter(&url).await;
        let client = redis::Client::open(url.as_str()).unwrap();
        let mut conn = client.get_multiplexed_async_connection().await.unwrap();
        let generator = RedisKeyGenerator::new(Some(&prefix));

        let odd_week = WindowSeconds::try_from(7 * 86_400 + 13).unwrap();
        let cases = [
            ("month", Granularity::new(Category::Month, 1)),
            ("year", Granularity::new(Category::Year, 1)),
            ("custom", Granularity::custom(odd_week, 1)),
        ];

        for (k, granularity) in cases {
            set_rule(&limiter, k, vec![granularity.clone()]).await;

            let before = server_now(&mut conn).await;
            assert!(limiter.allow(&[k], None).await);
            assert!(!limiter.allow(&[k], None).await);
            let after = server_now(&mut conn).await;

            let Granularity { category, window, .. } = granularity;
            let bucket = WindowBucket::at(category, before, window).unwrap();
            if WindowBucket::at(category, after, window) != Some(bucket) {
                // crossed a boundary mid-test
                continue;
            }

            let records = limiter.query_overages(&key(k)).await.unwrap();
            assert_eq!(records.len(), 1, "{k}");
            assert_eq!(records[0].category, category);
            assert_eq!(records[0].bucket_start, bucket.start, "{k}");
            assert_eq!(records[0].count, 1);

            let counter = generator.get_incr_key(&key(k), category);
            assert_eq!(expire_time(&mut conn, counter).await, bucket.end, "{k}");
        }
    });
}

#[test]
fn longest_override_window_expires_in_range() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let (limiter, prefix) = build_limiter(&url).await;
        let client = redis::Client::open(url.as_str()).unwrap();
        let mut conn = client.get_multiplexed_async_connection().await.unwrap();
        let generator = RedisKeyGenerator::new(Some(&prefix));

        set_rule(
            &limiter,
            "k",
            vec![Granularity::custom(WindowSeconds::try_from(60).unwrap(), 5)],
        )
        .await;

        let longest = WindowSeconds::try_from(MAX_WINDOW_SECONDS).unwrap();
        assert_eq!(
            limiter.increment(&["k"], Some(longest)).await.unwrap(),
            QuotaDecision::Accepted
        );

        let counter = generator.get_incr_key(&key("k"), Category::Custom);
        assert_eq!(
            expire_time(&mut conn, counter).await,
            MAX_WINDOW_SECONDS as i64
        );
    });
}

#[test]
fn oversized_stored_window_fails_without_writes() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let (limiter, prefix) = build_limiter(&url).await;
        let client = redis::Client::open(url.as_str()).unwrap();
        let mut conn = client.get_multiplexed_async_connection().await.unwrap();
        let generator = RedisKeyGenerator::new(Some(&prefix));

        let _: () = conn
            .hset_multiple(
                &*generator.get_rule_key(&key("k")),
                &[
                    ("SECOND", "10"),
                    ("CUSTOM", "5"),
                    ("CUSTOM_window", "9000000000000000"),
                ],
            )
            .await
            .unwrap();

        let err = limiter.increment(&["k"], None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);

        for category in [Category::Second, Category::Custom] {
            let exists: bool = conn
                .exists(generator.get_incr_key(&key("k"), category))
                .await
                .unwrap();
            assert!(!exists, "{category} counter was written");
        }
    });
}

#[test]
fn rule_hash_without_categories_is_no_rule() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let (limiter, prefix) = build_limiter(&url).await;
        let client = redis::Client::open(url.as_str()).unwrap();
        let mut conn = client.get_multiplexed_async_connection().await.unwrap();
        let generator = RedisKeyGenerator::new(Some(&prefix));

        let _: () = conn
            .hset(&*generator.get_rule_key(&key("k")), "WEEK", "5")
            .await
            .unwrap();

        for _ in 0..3 {
            assert_eq!(
                limiter.increment(&["k"], None).await.unwrap(),
                QuotaDecision::AcceptedNoRule
            );
        }
    });
}

#[test]
fn empty_rule_removes_the_rule() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let (limiter, _prefix) = build_limiter(&url).await;
        set_rule(&limiter, "k", vec![Granularity::new(Category::Day, 1)]).await;
        assert_eq!(limiter.query_limiter_rules("*").await.unwrap().len(), 1);

        set_rule(&limiter, "k", Vec::new()).await;

        assert!(limiter.query_limiter_rules("*").await.unwrap().is_empty());
        assert_eq!(
            limiter.increment(&["k"], None).await.unwrap(),
            QuotaDecision::AcceptedNoRule
        );
    });
}

#[test]
fn query_matches_pattern_and_sorts() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let (limiter, _prefix) = build_limiter(&url).await;
        set_rule(&limiter, "b/1", vec![Granularity::new(Category::Day, 1)]).await;
        set_rule(
            &limiter,
            "a/2",
            vec![
                Granularity::new(Category::Hour, 50),
                Granularity::new(Category::Day, 20),
            ],
        )
        .await;
        set_rule(&limiter, "a/1", vec![Granularity::new(Category::Day, 9)]).await;

        let rules = limiter.query_limiter_rules("a/*").await.unwrap();
        let keys: Vec<_> = rules.iter().map(|r| r.key.to_string()).collect();
        assert_eq!(keys, vec!["a/1", "a/2"]);
        assert_eq!(rules[1].granularities[0].category, Category::Day);
        assert_eq!(rules[1].granularities[1].category, Category::Hour);
        assert!(rules[0].as_of_ms.is_some());

        assert!(matches!(
            limiter.query_limiter_rules("").await,
            Err(TollgateError::InvalidPattern(_))
        ));
    });
}

#[test]
fn parallel_callers_admit_exactly_max_amount() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let (limiter, _prefix) = build_limiter(&url).await;
        let limiter = Arc::new(limiter);
        set_rule(&limiter, "k", vec![Granularity::new(Category::Day, 25)]).await;

        let accepted = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let limiter = Arc::clone(&limiter);
            let accepted = Arc::clone(&accepted);

            handles.push(tokio::spawn(async move {
                for _ in 0..10 {
                    if limiter.allow(&["k"], None).await {
                        accepted.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(accepted.load(Ordering::Relaxed), 25);
        assert_eq!(limiter.query_overages(&key("k")).await.unwrap()[0].count, 55);
    });
}

#[test]
fn shutdown_closes_the_pool() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let (limiter, _prefix) = build_limiter(&url).await;
        limiter.shutdown();

        assert!(limiter.pool().is_closed());
        assert!(matches!(
            limiter.increment(&["k"], None).await,
            Err(TollgateError::PoolClosed)
        ));
        assert!(!limiter.allow(&["k"], None).await);
    });
}

#[test]
fn pool_times_out_when_exhausted() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let client = redis::Client::open(url.as_str()).unwrap();
        let pool = TollgateRedisPool::new(
            client,
            PoolOptions {
                max_size: 1,
                min_idle: 0,
                acquire_timeout: Some(Duration::from_millis(50)),
                ..PoolOptions::default()
            },
        )
        .await
        .unwrap();

        let held = pool.get().await.unwrap();
        assert_eq!(pool.status().in_use, 1);
        assert!(matches!(
            pool.get().await,
            Err(TollgateError::PoolTimeout(_))
        ));

        drop(held);
        let status = pool.status();
        assert_eq!(status.in_use, 0);
        assert_eq!(status.idle, 1);
        assert!(pool.get().await.is_ok());
    });
}

#[test]
fn limiter_on_an_existing_pool() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let client = redis::Client::open(url.as_str()).unwrap();
        let pool = TollgateRedisPool::new(client, PoolOptions::default())
            .await
            .unwrap();
        let prefix = unique_prefix();

        let limiter = RedisQuotaLimiter::with_pool(
            Arc::new(pool),
            ScriptSet::embedded(),
            Some(&prefix),
            Some(Duration::from_secs(2)),
        );

        set_rule(&limiter, "k", vec![Granularity::new(Category::Day, 1)]).await;
        assert!(limiter.allow(&["k"], None).await);
        assert!(!limiter.allow(&["k"], None).await);
    });
}

#[test]
fn start_failures_are_configuration_errors() {
    let Some(url) = redis_url() else { return };

    block_on(async {
        let mut options = RedisQuotaLimiterOptions::new(url.as_str());
        options.scripts = ScriptSource::Directory(PathBuf::from("/nonexistent/tollgate"));

        let err = RedisQuotaLimiter::start(options).await.unwrap_err();
        assert!(matches!(
            err,
            TollgateError::Startup(ref inner) if matches!(**inner, TollgateError::ScriptLoad { .. })
        ));
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err = RedisQuotaLimiter::start(RedisQuotaLimiterOptions::new("not a url"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    });
}
