//! Runtime configuration for frame-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Cache ceilings, compression and pre-cache knobs live in [`CacheConfig`] and
//! can be patched at runtime with a [`ConfigPatch`].

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::gpu::tier::GpuTier;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "frame-cache", about = "Rendered-frame cache scrub simulator and admin server")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Serve the admin API after the simulation.
    #[arg(long)]
    pub serve: bool,

    /// Admin API listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// GPU tier to apply instead of the configured default.
    #[arg(long, value_enum)]
    pub gpu_tier: Option<GpuTier>,

    /// Number of frames to scrub through in the simulation.
    #[arg(long, default_value_t = 120)]
    pub frames: u64,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Admin server configuration.
    pub server: ServerConfig,

    /// Frame cache configuration.
    pub cache: CacheConfig,
}

/// Admin HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Admin API listen address (e.g. "127.0.0.1:8080").
    pub listen: String,

    /// GPU tier assumed when no override is passed on the command line.
    pub gpu_tier: GpuTier,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            gpu_tier: GpuTier::Integrated,
        }
    }
}

/// Frame cache ceilings and feature switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached frames.
    pub max_frames: usize,

    /// Maximum total payload bytes.
    pub max_memory_bytes: usize,

    /// Store frames in compressed form when it saves enough space.
    pub compression: bool,

    /// Encoder quality in `[0.0, 1.0]` (1.0 keeps every bit).
    pub compression_quality: f32,

    /// Number of frames on each requested side of the playhead to pre-cache.
    pub pre_cache_window: u64,

    /// Enable predictive pre-caching.
    pub predictive_pre_cache: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_frames: 100,
            max_memory_bytes: 1024 * 1024 * 1024, // 1 GB
            compression: false,
            compression_quality: 0.8,
            pre_cache_window: 10,
            predictive_pre_cache: true,
        }
    }
}

/// Partial update for [`CacheConfig`]. Absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigPatch {
    pub max_frames: Option<usize>,
    pub max_memory_bytes: Option<usize>,
    pub compression: Option<bool>,
    pub compression_quality: Option<f32>,
    pub pre_cache_window: Option<u64>,
    pub predictive_pre_cache: Option<bool>,
}

impl CacheConfig {
    /// Merge a patch onto this config.
    ///
    /// Limits are not enforced here; the next capacity check applies them.
    pub fn apply(&mut self, patch: &ConfigPatch) {
        if let Some(v) = patch.max_frames {
            self.max_frames = v;
        }
        if let Some(v) = patch.max_memory_bytes {
            self.max_memory_bytes = v;
        }
        if let Some(v) = patch.compression {
            self.compression = v;
        }
        if let Some(v) = patch.compression_quality {
            self.compression_quality = sanitize_quality(v, self.compression_quality);
        }
        if let Some(v) = patch.pre_cache_window {
            self.pre_cache_window = v;
        }
        if let Some(v) = patch.predictive_pre_cache {
            self.predictive_pre_cache = v;
        }
    }
}

/// Clamp a quality into `[0.0, 1.0]`. Non-finite values keep `current`.
fn sanitize_quality(quality: f32, current: f32) -> f32 {
    if quality.is_finite() {
        quality.clamp(0.0, 1.0)
    } else {
        tracing::warn!(quality, "Ignoring non-finite compression quality");
        current
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let mut config: Config = serde_json::from_str(&data)?;
            config.cache.compression_quality = sanitize_quality(
                config.cache.compression_quality,
                CacheConfig::default().compression_quality,
            );
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}
