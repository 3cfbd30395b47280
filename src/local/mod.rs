//! In-process quota provider.
//!
//! [`LocalQuotaLimiter`] keeps rules, counters and the overage ledger in
//! [`DashMap`](dashmap::DashMap)s inside the current process. It follows the same
//! decision procedure as the Redis limiter script, so it is useful both for
//! single-process deployments and for exercising quota logic in tests without a
//! store.
//!
//! # When to Use
//!
//! ✅ **Use the local provider when:**
//! - One process owns the quota
//! - Tests need deterministic time (see [`ManualClock`])
//!
//! ❌ **Use the Redis provider when:**
//! - Several processes or hosts share a quota
//! - Quotas must survive a process restart

mod clock;
pub use clock::*;

mod local_quota_limiter;
pub use local_quota_limiter::*;
