//! frame-cache: bounded in-memory cache for rendered video frames.
//!
//! Keeps interactive timeline scrubbing smooth when per-frame rendering is
//! expensive:
//!   O(1) LRU recency → count + byte ceilings → optional lossy compression
//!   → state-hash staleness checks → cancellable predictive pre-caching
//!
//! The cache stores, evicts and pre-caches bitmaps supplied by the caller;
//! it never renders anything itself.

pub mod cache;
pub mod config;
pub mod gpu;
pub mod metrics;
pub mod render;
pub mod server;
