//! Render boundary.
//!
//! The cache never rasterizes anything; pre-caching calls out through
//! [`FrameRenderer`]. Any `Fn(FrameNumber) -> Future<Output = anyhow::Result<Bitmap>>`
//! closure can be registered directly.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::cache::frame::{Bitmap, FrameNumber, BYTES_PER_PIXEL};

/// External renderer for a single frame of the active composition.
#[async_trait]
pub trait FrameRenderer: Send + Sync {
    async fn render(&self, frame: FrameNumber) -> anyhow::Result<Bitmap>;
}

#[async_trait]
impl<F, Fut> FrameRenderer for F
where
    F: Fn(FrameNumber) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Bitmap>> + Send + 'static,
{
    async fn render(&self, frame: FrameNumber) -> anyhow::Result<Bitmap> {
        (self)(frame).await
    }
}

/// Produces a moving gradient; stands in for a real render pipeline in the
/// simulator and benchmarks.
#[derive(Debug)]
pub struct SyntheticRenderer {
    width: u32,
    height: u32,
    delay: Duration,
    renders: AtomicU64,
}

impl SyntheticRenderer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            delay: Duration::ZERO,
            renders: AtomicU64::new(0),
        }
    }

    /// Simulated render latency per frame.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of frames rendered so far.
    pub fn renders(&self) -> u64 {
        self.renders.load(Ordering::Relaxed)
    }

    /// Rasterize a frame synchronously.
    pub fn draw(&self, frame: FrameNumber) -> Bitmap {
        let (w, h) = (self.width as usize, self.height as usize);
        let mut data = Vec::with_capacity(w * h * BYTES_PER_PIXEL);
        let phase = (frame % 256) as usize;
        for y in 0..h {
            for x in 0..w {
                let r = ((x * 255 / w.max(1)) + phase) % 256;
                let g = ((y * 255 / h.max(1)) + phase / 2) % 256;
                data.extend_from_slice(&[r as u8, g as u8, 96, 255]);
            }
        }
        match Bitmap::new(self.width, self.height, data) {
            Ok(bitmap) => bitmap,
            Err(_) => Bitmap::solid(self.width, self.height, [0, 0, 0, 255]),
        }
    }
}

#[async_trait]
impl FrameRenderer for SyntheticRenderer {
    async fn render(&self, frame: FrameNumber) -> anyhow::Result<Bitmap> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.renders.fetch_add(1, Ordering::Relaxed);
        Ok(self.draw(frame))
    }
}
