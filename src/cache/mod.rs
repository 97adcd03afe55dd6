/// read-through (cache-aside) layer in front of a slow upstream source.
///
/// Think of it as a level 1 application cache: the store (in-process memory or
/// redis) is the fast level, the upstream source is the slow one. On a miss the
/// coordinator fetches once per key, no matter how many requests are waiting,
/// and writes the result back with a ttl.
///
pub mod coordinator;
pub mod inflight;

pub use self::coordinator::{CacheStats, ReadThrough, ReadThroughConfig, DEFAULT_TTL};
