//! Lossy preview compression for cached frames.
//!
//! Frames are encoded behind the [`FrameCodec`] trait so the cache never
//! depends on a particular encoder. The default [`QuantizedZstdCodec`]
//! drops low-order bits of every channel according to the requested quality
//! and zstd-compresses the result. Output is scrub-preview quality only.

use bytemuck::{Pod, Zeroable};
use bytes::Bytes;
use thiserror::Error;

use crate::cache::frame::{raw_size, Bitmap, BitmapError};

/// Savings gate: keep the encoded form only if it is below 70% of raw size.
pub const COMPRESSION_THRESHOLD_NUM: usize = 7;
pub const COMPRESSION_THRESHOLD_DEN: usize = 10;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Zstd stream failed: {0}")]
    Zstd(#[from] std::io::Error),

    #[error("Decoded {actual} bytes, expected {expected} for {width}x{height}")]
    DimensionMismatch {
        width: u32,
        height: u32,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid bitmap: {0}")]
    Bitmap(#[from] BitmapError),

    #[error("Codec task failed: {0}")]
    Task(String),
}

/// Pluggable frame encoder.
pub trait FrameCodec: Send + Sync {
    /// Encode a bitmap. `quality` is in `[0.0, 1.0]`.
    fn encode(&self, bitmap: &Bitmap, quality: f32) -> Result<Bytes, CodecError>;

    /// Decode a blob produced by [`FrameCodec::encode`] back to a bitmap with
    /// exactly these dimensions.
    fn decode(&self, blob: &[u8], width: u32, height: u32) -> Result<Bitmap, CodecError>;
}

/// Whether an encoded size passes the savings gate for a raw size.
pub fn worth_compressing(compressed_size: usize, raw_size: usize) -> bool {
    compressed_size * COMPRESSION_THRESHOLD_DEN < raw_size * COMPRESSION_THRESHOLD_NUM
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
struct Rgba {
    r: u8,
    g: u8,
    b: u8,
    a: u8,
}

/// Bit-depth reduction followed by zstd.
///
/// The first byte of a blob records how many low bits were dropped so decode
/// does not depend on the quality used at encode time.
#[derive(Debug, Clone)]
pub struct QuantizedZstdCodec {
    zstd_level: i32,
}

impl Default for QuantizedZstdCodec {
    fn default() -> Self {
        Self { zstd_level: 3 }
    }
}

impl QuantizedZstdCodec {
    pub fn new(zstd_level: i32) -> Self {
        Self { zstd_level }
    }

    /// Low bits to drop per channel: quality 1.0 keeps all 8, 0.0 keeps 1.
    /// A non-finite quality keeps all 8. Alpha is never quantized.
    fn dropped_bits(quality: f32) -> u8 {
        if !quality.is_finite() {
            return 0;
        }
        let kept = 1.0 + quality.clamp(0.0, 1.0) * 7.0;
        (8 - kept.round() as u8).min(7)
    }
}

impl FrameCodec for QuantizedZstdCodec {
    fn encode(&self, bitmap: &Bitmap, quality: f32) -> Result<Bytes, CodecError> {
        let shift = Self::dropped_bits(quality);
        let mask = 0xFFu8 << shift;

        let src: &[Rgba] = bytemuck::cast_slice(&bitmap.data()[..]);
        let mut quantized: Vec<Rgba> = Vec::with_capacity(src.len());
        quantized.extend(src.iter().map(|px| Rgba {
            r: px.r & mask,
            g: px.g & mask,
            b: px.b & mask,
            a: px.a,
        }));

        let compressed = zstd::encode_all(bytemuck::cast_slice::<Rgba, u8>(&quantized), self.zstd_level)?;

        let mut blob = Vec::with_capacity(compressed.len() + 1);
        blob.push(shift);
        blob.extend_from_slice(&compressed);
        Ok(Bytes::from(blob))
    }

    fn decode(&self, blob: &[u8], width: u32, height: u32) -> Result<Bitmap, CodecError> {
        let expected = raw_size(width, height);
        let (&shift, body) = blob.split_first().ok_or(CodecError::DimensionMismatch {
            width,
            height,
            expected,
            actual: 0,
        })?;

        let mut data = zstd::decode_all(body)?;
        if data.len() != expected {
            return Err(CodecError::DimensionMismatch {
                width,
                height,
                expected,
                actual: data.len(),
            });
        }

        // Re-centre quantized channels in their bucket to halve the error.
        if shift > 0 && shift < 8 {
            let half = 1u8 << (shift - 1);
            let pixels: &mut [Rgba] = bytemuck::cast_slice_mut(&mut data);
            for px in pixels {
                px.r |= half;
                px.g |= half;
                px.b |= half;
            }
        }

        Ok(Bitmap::new(width, height, data)?)
    }
}
