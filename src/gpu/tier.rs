//! GPU capability tiers and their cache presets.
//!
//! Detection itself is an external concern: callers inject a
//! [`GpuTierDetector`]. This module only maps a detected tier onto cache
//! ceilings, compression and pre-cache window.

use async_trait::async_trait;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::config::ConfigPatch;

/// Coarse rendering capability of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum GpuTier {
    /// No usable GPU; software rendering.
    Cpu,
    /// Integrated / shared-memory GPU.
    Integrated,
    /// Dedicated consumer GPU.
    Discrete,
    /// Large-VRAM workstation GPU.
    Workstation,
}

impl std::fmt::Display for GpuTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GpuTier::Cpu => write!(f, "cpu"),
            GpuTier::Integrated => write!(f, "integrated"),
            GpuTier::Discrete => write!(f, "discrete"),
            GpuTier::Workstation => write!(f, "workstation"),
        }
    }
}

/// Cache settings applied for a given tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPreset {
    pub max_frames: usize,
    pub max_memory_bytes: usize,
    pub compression: bool,
    pub pre_cache_window: u64,
}

const MB: usize = 1024 * 1024;

impl GpuTier {
    /// Preset for this tier.
    ///
    /// Higher tiers trade memory for fidelity: larger ceilings, no
    /// compression, wider pre-cache window.
    pub fn preset(&self) -> TierPreset {
        match self {
            GpuTier::Cpu => TierPreset {
                max_frames: 30,
                max_memory_bytes: 256 * MB,
                compression: true,
                pre_cache_window: 3,
            },
            GpuTier::Integrated => TierPreset {
                max_frames: 60,
                max_memory_bytes: 512 * MB,
                compression: true,
                pre_cache_window: 5,
            },
            GpuTier::Discrete => TierPreset {
                max_frames: 150,
                max_memory_bytes: 2048 * MB,
                compression: false,
                pre_cache_window: 10,
            },
            GpuTier::Workstation => TierPreset {
                max_frames: 300,
                max_memory_bytes: 8192 * MB,
                compression: false,
                pre_cache_window: 20,
            },
        }
    }
}

impl From<TierPreset> for ConfigPatch {
    fn from(preset: TierPreset) -> Self {
        ConfigPatch {
            max_frames: Some(preset.max_frames),
            max_memory_bytes: Some(preset.max_memory_bytes),
            compression: Some(preset.compression),
            pre_cache_window: Some(preset.pre_cache_window),
            ..Default::default()
        }
    }
}

/// Injected capability detector.
///
/// Implementations should fall back to [`GpuTier::Cpu`] when detection fails.
#[async_trait]
pub trait GpuTierDetector: Send + Sync {
    async fn detect(&self) -> GpuTier;
}

/// Detector that always reports a fixed tier (CLI override, tests).
#[derive(Debug, Clone, Copy)]
pub struct StaticTierDetector(pub GpuTier);

#[async_trait]
impl GpuTierDetector for StaticTierDetector {
    async fn detect(&self) -> GpuTier {
        self.0
    }
}
