//! Prometheus instrumentation for the frame cache.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Collectors for one cache instance, registered in their own registry.
///
/// Cloning shares the underlying collectors.
#[derive(Clone)]
pub struct CacheMetrics {
    registry: Registry,
    pub hits: IntCounter,
    pub misses: IntCounter,
    pub evictions: IntCounter,
    pub prefetch_rendered: IntCounter,
    pub prefetch_failures: IntCounter,
    pub frames: IntGauge,
    pub memory_bytes: IntGauge,
}

impl CacheMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let hits = IntCounter::new("frame_cache_hits_total", "Frame lookups served from cache")?;
        let misses = IntCounter::new(
            "frame_cache_misses_total",
            "Frame lookups that missed, were stale or could not be decoded",
        )?;
        let evictions = IntCounter::new(
            "frame_cache_evictions_total",
            "Entries evicted by the capacity policy",
        )?;
        let prefetch_rendered = IntCounter::new(
            "frame_cache_prefetch_rendered_total",
            "Frames rendered and stored by predictive pre-caching",
        )?;
        let prefetch_failures = IntCounter::new(
            "frame_cache_prefetch_failures_total",
            "Pre-cache renders that failed and were skipped",
        )?;
        let frames = IntGauge::new("frame_cache_frames", "Frames currently cached")?;
        let memory_bytes = IntGauge::new("frame_cache_memory_bytes", "Payload bytes currently cached")?;

        registry.register(Box::new(hits.clone()))?;
        registry.register(Box::new(misses.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(prefetch_rendered.clone()))?;
        registry.register(Box::new(prefetch_failures.clone()))?;
        registry.register(Box::new(frames.clone()))?;
        registry.register(Box::new(memory_bytes.clone()))?;

        Ok(Self {
            registry,
            hits,
            misses,
            evictions,
            prefetch_rendered,
            prefetch_failures,
            frames,
            memory_bytes,
        })
    }

    /// Set the occupancy gauges.
    pub fn set_usage(&self, frames: usize, bytes: usize) {
        self.frames.set(frames as i64);
        self.memory_bytes.set(bytes as i64);
    }

    /// Text exposition format.
    pub fn render(&self) -> prometheus::Result<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
