use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use clap::{Parser, ValueEnum};
use hdrhistogram::Histogram;

use tollgate::{
    Category, Granularity, LimiterKey, LimiterRule, LocalQuotaLimiter, QuotaDecision,
    TollgateError, WindowSeconds,
};

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum Provider {
    Local,
    Redis,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KeyDist {
    Hot,
    Uniform,
    Skewed,
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum Mode {
    Max,
    TargetQps,
}

#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
enum Window {
    Second,
    Minute,
    Hour,
    Day,
    Month,
    Year,
    Custom,
}

impl Window {
    fn category(self) -> Category {
        match self {
            Window::Second => Category::Second,
            Window::Minute => Category::Minute,
            Window::Hour => Category::Hour,
            Window::Day => Category::Day,
            Window::Month => Category::Month,
            Window::Year => Category::Year,
            Window::Custom => Category::Custom,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "tollgate-stress",
    about = "Load test harness for tollgate quota limiters"
)]
struct Args {
    #[arg(long, value_enum, default_value_t = Provider::Local)]
    provider: Provider,

    #[arg(long, value_enum, default_value_t = KeyDist::Hot)]
    key_dist: KeyDist,

    #[arg(long, value_enum, default_value_t = Mode::Max)]
    mode: Mode,

    #[arg(long, default_value_t = 8)]
    workers: usize,

    #[arg(long, default_value_t = 10)]
    duration_s: u64,

    /// Window the quota is enforced over.
    #[arg(long, value_enum, default_value_t = Window::Minute)]
    window: Window,

    /// Length of the window when `--window custom`.
    #[arg(long, default_value_t = 30)]
    custom_window_s: u64,

    /// Allowed increments per key and window.
    #[arg(long, default_value_t = 1000)]
    max_amount: u64,

    #[arg(long, default_value_t = 10_000)]
    key_space: usize,

    #[arg(long, default_value_t = 0.8)]
    hot_fraction: f64,

    #[arg(long, default_value_t = 100)]
    sample_every: u64,

    /// Only used when `--mode target-qps`, per worker.
    #[arg(long)]
    target_qps: Option<u64>,

    #[arg(long, env = "TOLLGATE_REDIS_URL", default_value = "redis://127.0.0.1:6379/")]
    redis_url: String,

    #[arg(long, env = "TOLLGATE_KEY_PREFIX", default_value = "stress")]
    redis_prefix: String,

    #[arg(long, default_value_t = 32)]
    pool_size: usize,
}

#[derive(Default)]
struct Counts {
    accepted: AtomicU64,
    accepted_no_rule: AtomicU64,
    rejected: AtomicU64,
    errors: AtomicU64,
}

impl Counts {
    fn record(&self, result: &Result<QuotaDecision, TollgateError>) {
        let counter = match result {
            Ok(QuotaDecision::Accepted) => &self.accepted,
            Ok(QuotaDecision::AcceptedNoRule) => &self.accepted_no_rule,
            Ok(QuotaDecision::Rejected { .. }) => &self.rejected,
            Err(err) => {
                tracing::warn!(error = ?err, "stress.increment.error");
                &self.errors
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Rng(u64);

impl Rng {
    fn new(worker: usize) -> Self {
        Self((worker as u64 + 1) * 0x9E37_79B9_7F4A_7C15)
    }

    // xorshift64*
    fn next_u64(&mut self) -> u64 {
        self.0 ^= self.0 >> 12;
        self.0 ^= self.0 << 25;
        self.0 ^= self.0 >> 27;
        self.0 = self.0.wrapping_mul(0x2545_F491_4F6C_DD1D);
        self.0
    }
}

fn build_keys(args: &Args) -> Vec<String> {
    let n = match args.key_dist {
        KeyDist::Hot => 1,
        _ => args.key_space.max(1),
    };
    (0..n).map(|i| format!("user_{i}")).collect()
}

fn build_rule(args: &Args, key: &str) -> LimiterRule {
    let granularity = match args.window {
        Window::Custom => Granularity::custom(
            WindowSeconds::try_from(args.custom_window_s).unwrap(),
            args.max_amount,
        ),
        window => Granularity::new(window.category(), args.max_amount),
    };

    LimiterRule::new(
        LimiterKey::from_segments(["stress", key]).unwrap(),
        vec![granularity],
    )
    .unwrap()
}

fn pick_key<'a>(args: &Args, keys: &'a [String], rng: &mut Rng) -> &'a str {
    match args.key_dist {
        KeyDist::Hot => &keys[0],
        KeyDist::Uniform => &keys[(rng.next_u64() as usize) % keys.len()],
        KeyDist::Skewed => {
            let r = (rng.next_u64() % 10_000) as f64 / 10_000.0;
            if r < args.hot_fraction {
                &keys[0]
            } else {
                let tail = keys.len().saturating_sub(1).max(1);
                &keys[(1 + (rng.next_u64() as usize) % tail) % keys.len()]
            }
        }
    }
}

fn should_sample(iter: u64, sample_every: u64) -> bool {
    sample_every <= 1 || iter.is_multiple_of(sample_every)
}

fn per_op(args: &Args) -> Option<Duration> {
    match (args.mode, args.target_qps) {
        (Mode::TargetQps, Some(qps)) => Some(Duration::from_nanos(1_000_000_000 / qps.max(1))),
        _ => None,
    }
}

/// Most increments the quota can admit over the run, across every key touched.
fn accepted_upper_bound(args: &Args, keys: usize, elapsed: Duration) -> Option<u64> {
    let length = match args.window {
        Window::Custom => args.custom_window_s,
        window => window.category().fixed_length_seconds()?,
    };
    let windows = elapsed.as_secs() / length.max(1) + 2;

    Some(args.max_amount * windows * keys as u64)
}

fn new_histogram() -> Histogram<u64> {
    Histogram::<u64>::new_with_bounds(1, 60_000_000, 3).unwrap()
}

fn print_results(
    args: &Args,
    keys: usize,
    elapsed: Duration,
    hist: &Histogram<u64>,
    counts: &Counts,
) {
    let accepted = counts.accepted.load(Ordering::Relaxed);
    let rejected = counts.rejected.load(Ordering::Relaxed);
    let no_rule = counts.accepted_no_rule.load(Ordering::Relaxed);
    let errors = counts.errors.load(Ordering::Relaxed);
    let ops = accepted + rejected + no_rule + errors;

    println!("provider={:?} mode={:?} window={:?}", args.provider, args.mode, args.window);
    println!(
        "workers={} duration_s={} max_amount={} key_dist={:?} keys={}",
        args.workers, args.duration_s, args.max_amount, args.key_dist, keys
    );
    println!(
        "elapsed_s={:.3} ops={} ops_per_s={:.0}",
        elapsed.as_secs_f64(),
        ops,
        ops as f64 / elapsed.as_secs_f64()
    );
    println!("accepted={accepted} rejected={rejected} accepted_no_rule={no_rule} errors={errors}");

    match accepted_upper_bound(args, keys, elapsed) {
        Some(bound) if accepted > bound => {
            println!("quota_check=FAILED accepted={accepted} bound={bound}");
        }
        Some(bound) => println!("quota_check=ok bound={bound}"),
        None => println!("quota_check=skipped"),
    }

    if !hist.is_empty() {
        println!(
            "lat_us p50={} p95={} p99={} p999={} max={}",
            hist.value_at_quantile(0.50),
            hist.value_at_quantile(0.95),
            hist.value_at_quantile(0.99),
            hist.value_at_quantile(0.999),
            hist.max()
        );
        println!("sample_every={} samples={}", args.sample_every, hist.len());
    } else {
        println!("no latency samples collected");
    }
}

fn run_local(args: &Args) {
    let keys = build_keys(args);
    let limiter = Arc::new(LocalQuotaLimiter::default());
    for key in &keys {
        limiter.set_limiter_rule(&build_rule(args, key)).unwrap();
    }

    let stop = Arc::new(AtomicBool::new(false));
    let counts = Arc::new(Counts::default());
    let started = Instant::now();

    let mut handles = Vec::with_capacity(args.workers);
    for worker in 0..args.workers {
        let limiter = Arc::clone(&limiter);
        let keys = keys.clone();
        let stop = Arc::clone(&stop);
        let counts = Arc::clone(&counts);
        let args = args.clone();

        handles.push(std::thread::spawn(move || {
            let mut hist = new_histogram();
            let mut rng = Rng::new(worker);
            let mut i = 0_u64;
            let mut next_deadline = Instant::now();

            while !stop.load(Ordering::Relaxed) {
                if let Some(per_op) = per_op(&args) {
                    let now = Instant::now();
                    if now < next_deadline {
                        std::thread::sleep(next_deadline - now);
                    }
                    next_deadline += per_op;
                }

                i = i.wrapping_add(1);
                let key = pick_key(&args, &keys, &mut rng);
                let t0 = should_sample(i, args.sample_every).then(Instant::now);

                let result = limiter.increment(&["stress", key], None);

                if let Some(t0) = t0 {
                    let _ = hist.record((t0.elapsed().as_micros() as u64).max(1));
                }
                counts.record(&result);
            }

            hist
        }));
    }

    std::thread::sleep(Duration::from_secs(args.duration_s));
    stop.store(true, Ordering::Relaxed);

    let mut merged = new_histogram();
    for handle in handles {
        merged.add(&handle.join().unwrap()).unwrap();
    }

    print_results(args, keys.len(), started.elapsed(), &merged, &counts);
}

#[cfg(feature = "redis-tokio")]
fn run_redis(args: &Args) {
    use tollgate::{KeyPrefix, RedisQuotaLimiter, RedisQuotaLimiterOptions};

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.workers.max(2))
        .build()
        .unwrap();

    rt.block_on(async {
        let keys = build_keys(args);

        let mut options = RedisQuotaLimiterOptions::new(args.redis_url.as_str());
        options.prefix = Some(KeyPrefix::try_from(args.redis_prefix.as_str()).unwrap());
        options.pool.max_size = args.pool_size;

        let limiter = match RedisQuotaLimiter::start(options).await {
            Ok(limiter) => Arc::new(limiter),
            Err(err) => {
                eprintln!("failed to start: {err}");
                std::process::exit(1);
            }
        };
        for key in &keys {
            limiter.set_limiter_rule(&build_rule(args, key)).await.unwrap();
        }

        let stop = Arc::new(AtomicBool::new(false));
        let counts = Arc::new(Counts::default());
        let started = Instant::now();

        let mut join = Vec::with_capacity(args.workers);
        for worker in 0..args.workers {
            let limiter = Arc::clone(&limiter);
            let keys = keys.clone();
            let stop = Arc::clone(&stop);
            let counts = Arc::clone(&counts);
            let args = args.clone();

            join.push(tokio::spawn(async move {
                let mut hist = new_histogram();
                let mut rng = Rng::new(worker);
                let mut i = 0_u64;
                let mut next_deadline = Instant::now();

                while !stop.load(Ordering::Relaxed) {
                    if let Some(per_op) = per_op(&args) {
                        let now = Instant::now();
                        if now < next_deadline {
                            tokio::time::sleep(next_deadline - now).await;
                        }
                        next_deadline += per_op;
                    }

                    i = i.wrapping_add(1);
                    let key = pick_key(&args, &keys, &mut rng);
                    let t0 = should_sample(i, args.sample_every).then(Instant::now);

                    let result = limiter.increment(&["stress", key], None).await;

                    if let Some(t0) = t0 {
                        let _ = hist.record((t0.elapsed().as_micros() as u64).max(1));
                    }
                    counts.record(&result);
                }

                hist
            }));
        }

        tokio::time::sleep(Duration::from_secs(args.duration_s)).await;
        stop.store(true, Ordering::Relaxed);

        let mut merged = new_histogram();
        for j in join {
            merged.add(&j.await.unwrap()).unwrap();
        }

        let status = limiter.pool().status();
        print_results(args, keys.len(), started.elapsed(), &merged, &counts);
        println!(
            "pool max_size={} idle={} in_use={}",
            status.max_size, status.idle, status.in_use
        );

        limiter.shutdown();
    });
}

#[cfg(not(feature = "redis-tokio"))]
fn run_redis(_: &Args) {
    eprintln!("redis provider requires the redis-tokio feature");
    std::process::exit(2);
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    match args.provider {
        Provider::Local => run_local(&args),
        Provider::Redis => run_redis(&args),
    }
}
