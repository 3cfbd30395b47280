#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod common;
pub use common::*;

mod error;
pub use error::*;

mod window;
pub use window::*;

mod pattern;
mod runtime;

mod local;
pub use local::*;

#[cfg(feature = "redis-tokio")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-tokio")))]
mod redis;
#[cfg(feature = "redis-tokio")]
pub use redis::*;

#[cfg(test)]
mod tests;
