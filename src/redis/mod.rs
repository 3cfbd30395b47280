//! Redis quota provider.
//!
//! Rules, counters and the overage ledger live in Redis and are evaluated by Lua
//! scripts, so every decision is atomic on the server no matter how many
//! processes share the quota.
//!
//! # Key layout
//!
//! | key | type | content |
//! |---|---|---|
//! | `rate_limiter_rule:<KEY>` | hash | `<CATEGORY>` → max amount, plus `CUSTOM_window` |
//! | `rate_limiter_incr:<KEY>:<CATEGORY>` | string | counter, expires at the window end |
//! | `rate_limiter_mark:<KEY>` | hash | `<CATEGORY>_<window start>` → rejections |
//!
//! A configured [`KeyPrefix`] prepends `<prefix>:` to every key.

mod common;
pub use common::*;

mod options;
pub use options::*;

mod pool;
pub use pool::*;

pub(crate) mod reply;

mod scripts;
pub use scripts::*;

mod redis_quota_limiter;
pub use redis_quota_limiter::*;
