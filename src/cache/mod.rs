//! Rendered-frame cache.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`frame`]: Bitmap, FrameKey, CacheEntry definitions
//! - [`recency`]: O(1) LRU tracker over an index-addressed arena
//! - [`evictor`]: Two-dimensional capacity policy (frame count + bytes)
//! - [`store`]: Frame store with composition index and memory accounting
//! - [`codec`]: Pluggable lossy preview codec (quantize + zstd)
//! - [`prefetcher`]: Pre-cache planning and session cancellation
//! - [`frame_cache`]: Shared handle tying the pieces together

pub mod codec;
pub mod evictor;
pub mod frame;
pub mod frame_cache;
pub mod prefetcher;
pub mod recency;
pub mod store;

pub use frame::{Bitmap, FrameKey, FrameNumber};
pub use frame_cache::{FrameCache, PrefetchReport};
pub use prefetcher::Direction;
pub use store::CacheStats;
