//! Small, dependency-light helpers shared by the `stripe-cache` engine:
//! allocated-size accounting (used for RAM cache eviction and aggregation
//! backlog limits) and the cache key type used throughout directory hashing.

mod byte_size_of;
mod key;

pub use byte_size_of::ByteSizeOf;
pub use key::{CacheKey, KeyHasher};
