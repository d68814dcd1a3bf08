//! The frame cache handle.
//!
//! [`FrameCache`] is a cheap `Clone` handle owned by the editing session. All
//! bookkeeping (store + active pre-cache session) sits behind one coarse
//! lock that is never held across an `.await`; encoding, decoding and
//! rendering happen with the lock released.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::codec::{worth_compressing, CodecError, FrameCodec, QuantizedZstdCodec};
use crate::cache::frame::{raw_size, Bitmap, CacheEntry, FrameKey, FrameNumber};
use crate::cache::prefetcher::{plan_requests, Direction, Prefetcher};
use crate::cache::store::{CacheStats, FrameStore, InsertOutcome, InvariantError, Lookup};
use crate::config::{CacheConfig, ConfigPatch};
use crate::gpu::tier::{GpuTier, GpuTierDetector};
use crate::metrics::CacheMetrics;
use crate::render::FrameRenderer;

/// Summary of one pre-cache session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefetchReport {
    pub session: Option<Uuid>,
    /// Frames rendered and stored.
    pub rendered: usize,
    /// Frames already cached.
    pub skipped: usize,
    /// Renders that failed.
    pub failed: usize,
    /// Whether the session stopped before draining its queue.
    pub cancelled: bool,
}

struct CacheState {
    store: FrameStore,
    prefetcher: Prefetcher,
}

struct Inner {
    state: Mutex<CacheState>,
    codec: Arc<dyn FrameCodec>,
    metrics: CacheMetrics,
}

/// Bounded in-memory cache of rendered frames.
#[derive(Clone)]
pub struct FrameCache {
    inner: Arc<Inner>,
}

impl FrameCache {
    /// Create a cache with the default quantize + zstd codec.
    pub fn new(config: CacheConfig) -> anyhow::Result<Self> {
        Self::with_codec(config, Arc::new(QuantizedZstdCodec::default()))
    }

    /// Create a cache with a custom codec.
    pub fn with_codec(config: CacheConfig, codec: Arc<dyn FrameCodec>) -> anyhow::Result<Self> {
        let metrics = CacheMetrics::new()?;
        let store = FrameStore::new(config, metrics.clone());
        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(CacheState {
                    store,
                    prefetcher: Prefetcher::new(),
                }),
                codec,
                metrics,
            }),
        })
    }

    /// Synchronous read. Compressed entries always miss here; use
    /// [`FrameCache::get_async`] for them.
    pub fn get(
        &self,
        frame: FrameNumber,
        composition_id: &str,
        state_hash: Option<&str>,
    ) -> Option<Bitmap> {
        self.inner
            .state
            .lock()
            .store
            .get(frame, composition_id, state_hash)
    }

    /// Read, decoding compressed entries. A decode failure is a miss for this
    /// read only; the stored entry is kept.
    pub async fn get_async(
        &self,
        frame: FrameNumber,
        composition_id: &str,
        state_hash: Option<&str>,
    ) -> Option<Bitmap> {
        let key = FrameKey::new(composition_id, frame);
        let lookup = self.inner.state.lock().store.lookup(&key, state_hash);

        match lookup {
            Lookup::Miss => None,
            Lookup::Raw(bitmap) => Some(bitmap),
            Lookup::Compressed {
                blob,
                width,
                height,
                write_seq,
            } => {
                let decoded = self.decode(blob, width, height).await;
                self.inner
                    .state
                    .lock()
                    .store
                    .settle_decode(&key, write_seq, decoded.is_ok());
                match decoded {
                    Ok(bitmap) => Some(bitmap),
                    Err(e) => {
                        warn!(key = %key, "Failed to decode cached frame: {e}");
                        None
                    }
                }
            }
        }
    }

    /// Store a frame, replacing any prior entry under the same key.
    pub async fn set(
        &self,
        frame: FrameNumber,
        composition_id: &str,
        bitmap: Bitmap,
        state_hash: impl Into<String>,
    ) {
        let key = FrameKey::new(composition_id, frame);
        self.store_frame(key, bitmap, state_hash.into(), None).await;
    }

    pub fn remove(&self, frame: FrameNumber, composition_id: &str) -> bool {
        self.inner.state.lock().store.remove(frame, composition_id)
    }

    /// Membership check with no stats or recency side effects.
    pub fn has(&self, frame: FrameNumber, composition_id: &str) -> bool {
        self.inner.state.lock().store.has(frame, composition_id)
    }

    pub fn clear_composition(&self, composition_id: &str) -> usize {
        self.inner
            .state
            .lock()
            .store
            .clear_composition(composition_id)
    }

    /// Drop everything, reset stats and cancel any pre-cache session.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.prefetcher.abort();
        state.store.clear();
    }

    /// Clear a composition when its state hash changed since the last call.
    pub fn invalidate(&self, composition_id: &str, state_hash: &str) -> bool {
        self.inner
            .state
            .lock()
            .store
            .invalidate(composition_id, state_hash)
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.state.lock().store.stats()
    }

    pub fn config(&self) -> CacheConfig {
        self.inner.state.lock().store.config().clone()
    }

    /// Patch the config. Tighter limits are enforced on the next insert.
    pub fn set_config(&self, patch: &ConfigPatch) -> CacheConfig {
        self.inner.state.lock().store.set_config(patch)
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.inner.metrics
    }

    /// Verify the store's internal structures agree.
    pub fn check_invariants(&self) -> Result<(), InvariantError> {
        self.inner.state.lock().store.check_invariants()
    }

    /// Detect the GPU tier and merge its preset onto the config.
    pub async fn initialize_for_gpu(&self, detector: &dyn GpuTierDetector) -> GpuTier {
        let tier = detector.detect().await;
        let preset = tier.preset();
        self.set_config(&ConfigPatch::from(preset));
        info!(
            tier = %tier,
            max_frames = preset.max_frames,
            max_memory_bytes = preset.max_memory_bytes,
            compression = preset.compression,
            pre_cache_window = preset.pre_cache_window,
            "Applied GPU tier preset"
        );
        tier
    }

    /// Register the renderer used for pre-caching.
    pub fn set_render_callback(&self, renderer: Arc<dyn FrameRenderer>) {
        self.inner.state.lock().prefetcher.set_renderer(renderer);
    }

    pub fn is_pre_caching(&self) -> bool {
        self.inner.state.lock().prefetcher.in_progress()
    }

    /// Requests still queued in the active pre-cache session.
    pub fn pending_pre_cache(&self) -> usize {
        self.inner.state.lock().prefetcher.pending()
    }

    /// Cancel the running pre-cache session, if any.
    pub fn abort_pre_cache(&self) -> bool {
        self.inner.state.lock().prefetcher.abort()
    }

    /// Render and store frames around `frame` until the queue drains or the
    /// session is superseded. Starting a session cancels the previous one.
    pub async fn start_pre_cache(
        &self,
        frame: FrameNumber,
        composition_id: &str,
        state_hash: &str,
        direction: Direction,
    ) -> PrefetchReport {
        let (id, cancel, renderer) = {
            let mut state = self.inner.state.lock();
            let config = state.store.config().clone();
            if !config.predictive_pre_cache {
                return PrefetchReport::default();
            }
            let Some(renderer) = state.prefetcher.renderer() else {
                return PrefetchReport::default();
            };
            let requests = plan_requests(frame, config.pre_cache_window, direction);
            let (id, cancel) = state.prefetcher.begin(requests);
            (id, cancel, renderer)
        };

        debug!(
            session = %id,
            composition = composition_id,
            frame,
            ?direction,
            "Pre-cache session started"
        );

        let mut report = PrefetchReport {
            session: Some(id),
            ..Default::default()
        };

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let request = {
                let mut state = self.inner.state.lock();
                let Some(request) = state.prefetcher.next_for(id) else {
                    break;
                };
                if state.store.has(request.frame, composition_id) {
                    report.skipped += 1;
                    continue;
                }
                request
            };

            match renderer.render(request.frame).await {
                Ok(bitmap) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let key = FrameKey::new(composition_id, request.frame);
                    if self
                        .store_frame(key, bitmap, state_hash.to_string(), Some(id))
                        .await
                    {
                        report.rendered += 1;
                        self.inner.metrics.prefetch_rendered.inc();
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    self.inner.metrics.prefetch_failures.inc();
                    warn!(
                        session = %id,
                        frame = request.frame,
                        "Pre-cache render failed: {e:#}"
                    );
                }
            }
        }

        report.cancelled = cancel.is_cancelled();
        self.inner.state.lock().prefetcher.finish(id);

        debug!(
            session = %id,
            rendered = report.rendered,
            skipped = report.skipped,
            failed = report.failed,
            cancelled = report.cancelled,
            "Pre-cache session ended"
        );
        report
    }

    /// Run [`FrameCache::start_pre_cache`] on the tokio runtime.
    pub fn spawn_pre_cache(
        &self,
        frame: FrameNumber,
        composition_id: impl Into<String>,
        state_hash: impl Into<String>,
        direction: Direction,
    ) -> JoinHandle<PrefetchReport> {
        let cache = self.clone();
        let composition_id = composition_id.into();
        let state_hash = state_hash.into();
        tokio::spawn(async move {
            cache
                .start_pre_cache(frame, &composition_id, &state_hash, direction)
                .await
        })
    }

    /// Encode (if enabled) and commit. `session` restricts the commit to a
    /// still-current pre-cache session. Returns whether the entry landed.
    async fn store_frame(
        &self,
        key: FrameKey,
        bitmap: Bitmap,
        state_hash: String,
        session: Option<Uuid>,
    ) -> bool {
        let (write_seq, compression, quality) = {
            let mut state = self.inner.state.lock();
            let config = state.store.config();
            let (compression, quality) = (config.compression, config.compression_quality);
            (state.store.next_write_seq(&key), compression, quality)
        };

        let entry = if compression {
            match self
                .encode_entry(key.clone(), bitmap, state_hash, write_seq, quality)
                .await
            {
                Some(entry) => entry,
                None => {
                    self.inner.state.lock().store.abandon_write(&key, write_seq);
                    return false;
                }
            }
        } else {
            CacheEntry::raw(key, bitmap, state_hash, write_seq)
        };

        let mut state = self.inner.state.lock();
        if let Some(id) = session {
            if !state.prefetcher.is_current(id) {
                state.store.abandon_write(&entry.key, write_seq);
                return false;
            }
        }
        matches!(state.store.insert(entry), InsertOutcome::Stored { .. })
    }

    /// Build an entry, keeping the encoded form only if it saves enough.
    /// `None` if the encode task itself died and took the bitmap with it.
    async fn encode_entry(
        &self,
        key: FrameKey,
        bitmap: Bitmap,
        state_hash: String,
        write_seq: u64,
        quality: f32,
    ) -> Option<CacheEntry> {
        let codec = self.inner.codec.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let encoded = codec.encode(&bitmap, quality);
            (bitmap, encoded)
        })
        .await;

        let (bitmap, encoded) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                warn!(key = %key, "Encode task failed, frame not stored: {e}");
                return None;
            }
        };

        let raw = raw_size(bitmap.width(), bitmap.height());
        let entry = match encoded {
            Ok(blob) if worth_compressing(blob.len(), raw) => CacheEntry::compressed(
                key,
                blob,
                bitmap.width(),
                bitmap.height(),
                state_hash,
                write_seq,
            ),
            Ok(blob) => {
                debug!(
                    key = %key,
                    compressed = blob.len(),
                    raw,
                    "Compression saving below threshold, storing raw"
                );
                CacheEntry::raw(key, bitmap, state_hash, write_seq)
            }
            Err(e) => {
                warn!(key = %key, "Encode failed, storing raw: {e}");
                CacheEntry::raw(key, bitmap, state_hash, write_seq)
            }
        };
        Some(entry)
    }

    async fn decode(&self, blob: Bytes, width: u32, height: u32) -> Result<Bitmap, CodecError> {
        let codec = self.inner.codec.clone();
        tokio::task::spawn_blocking(move || codec.decode(&blob, width, height))
            .await
            .map_err(|e| CodecError::Task(e.to_string()))?
    }
}
