//! Frame bitmap, cache key and cache entry types.
//!
//! A [`Bitmap`] is the only payload the cache transports. Entries are owned by
//! the frame store and replaced wholesale on re-insert.

use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bytes per pixel (RGBA8).
pub const BYTES_PER_PIXEL: usize = 4;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BitmapError {
    #[error("Bitmap buffer is {actual} bytes, expected {expected} for {width}x{height} RGBA")]
    SizeMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },
}

/// Row-major RGBA8 pixel buffer.
///
/// Pixel data is held in [`Bytes`], so clones handed out on cache hits share
/// the underlying allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    data: Bytes,
}

impl Bitmap {
    /// Wrap a pixel buffer, checking it matches `width * height * 4`.
    pub fn new(width: u32, height: u32, data: impl Into<Bytes>) -> Result<Self, BitmapError> {
        let data = data.into();
        let expected = raw_size(width, height);
        if data.len() != expected {
            return Err(BitmapError::SizeMismatch {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// A bitmap filled with a single RGBA colour.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let pixels = width as usize * height as usize;
        let mut data = Vec::with_capacity(pixels * BYTES_PER_PIXEL);
        for _ in 0..pixels {
            data.extend_from_slice(&rgba);
        }
        Self {
            width,
            height,
            data: Bytes::from(data),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw RGBA bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Uncompressed size in bytes.
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

/// Uncompressed RGBA size for the given dimensions.
pub fn raw_size(width: u32, height: u32) -> usize {
    width as usize * height as usize * BYTES_PER_PIXEL
}

/// Frame number within a composition's timeline.
pub type FrameNumber = u64;

/// Total identity of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameKey {
    pub composition_id: String,
    pub frame: FrameNumber,
}

impl FrameKey {
    pub fn new(composition_id: impl Into<String>, frame: FrameNumber) -> Self {
        Self {
            composition_id: composition_id.into(),
            frame,
        }
    }
}

impl std::fmt::Display for FrameKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.composition_id, self.frame)
    }
}

/// Stored form of a frame.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Uncompressed bitmap.
    Raw(Bitmap),
    /// Encoded blob; dimensions live on the entry.
    Compressed(Bytes),
}

/// A single cached frame.
#[derive(Debug)]
pub struct CacheEntry {
    pub key: FrameKey,

    pub payload: Payload,

    pub width: u32,

    pub height: u32,

    /// Bytes charged against the memory ceiling (blob length when compressed).
    pub size_bytes: usize,

    /// Fingerprint of every input that affected the pixels.
    pub state_hash: String,

    pub last_touched_at: Instant,

    /// Write sequence number of the `set` that produced this entry.
    pub write_seq: u64,
}

impl CacheEntry {
    /// Entry holding an uncompressed bitmap.
    pub fn raw(key: FrameKey, bitmap: Bitmap, state_hash: String, write_seq: u64) -> Self {
        Self {
            key,
            width: bitmap.width(),
            height: bitmap.height(),
            size_bytes: bitmap.size_bytes(),
            payload: Payload::Raw(bitmap),
            state_hash,
            last_touched_at: Instant::now(),
            write_seq,
        }
    }

    /// Entry holding an encoded blob for a `width` x `height` frame.
    pub fn compressed(
        key: FrameKey,
        blob: Bytes,
        width: u32,
        height: u32,
        state_hash: String,
        write_seq: u64,
    ) -> Self {
        Self {
            key,
            width,
            height,
            size_bytes: blob.len(),
            payload: Payload::Compressed(blob),
            state_hash,
            last_touched_at: Instant::now(),
            write_seq,
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self.payload, Payload::Compressed(_))
    }

    /// Record an access.
    pub fn touch(&mut self) {
        self.last_touched_at = Instant::now();
    }

    /// Whether a caller-supplied hash marks this entry stale.
    pub fn is_stale_for(&self, state_hash: Option<&str>) -> bool {
        matches!(state_hash, Some(h) if h != self.state_hash)
    }
}
