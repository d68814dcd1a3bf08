//! GPU capability handling.
//!
//! - [`tier`]: capability tiers, the injected detector trait and cache presets

pub mod tier;
