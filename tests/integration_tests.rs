//! End-to-end tests for compression, pre-caching, GPU presets and the admin API.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tower::ServiceExt;

use frame_cache::cache::codec::{CodecError, FrameCodec};
use frame_cache::cache::{Bitmap, Direction, FrameCache, FrameNumber};
use frame_cache::config::{CacheConfig, ConfigPatch};
use frame_cache::gpu::tier::{GpuTier, StaticTierDetector};
use frame_cache::render::FrameRenderer;
use frame_cache::server::admin_api::{build_router, AppState};

/// Codec that always produces a blob of a fixed size.
struct FixedSizeCodec {
    size: usize,
}

impl FrameCodec for FixedSizeCodec {
    fn encode(&self, _bitmap: &Bitmap, _quality: f32) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(vec![0u8; self.size]))
    }

    fn decode(&self, _blob: &[u8], width: u32, height: u32) -> Result<Bitmap, CodecError> {
        Ok(Bitmap::solid(width, height, [7, 7, 7, 255]))
    }
}

/// Codec whose blobs can never be decoded.
struct CorruptingCodec;

impl FrameCodec for CorruptingCodec {
    fn encode(&self, _bitmap: &Bitmap, _quality: f32) -> Result<Bytes, CodecError> {
        Ok(Bytes::from_static(&[1]))
    }

    fn decode(&self, _blob: &[u8], _width: u32, _height: u32) -> Result<Bitmap, CodecError> {
        Err(CodecError::Task("corrupt blob".to_string()))
    }
}

/// Codec that blocks encoding of bitmaps whose first byte is 1 until released.
struct GatedCodec {
    entered: AtomicBool,
    release: Notify,
}

impl GatedCodec {
    fn new() -> Self {
        Self {
            entered: AtomicBool::new(false),
            release: Notify::new(),
        }
    }
}

impl FrameCodec for GatedCodec {
    fn encode(&self, bitmap: &Bitmap, _quality: f32) -> Result<Bytes, CodecError> {
        if bitmap.data().first() == Some(&1) {
            self.entered.store(true, Ordering::SeqCst);
            futures::executor::block_on(self.release.notified());
        }
        Ok(Bytes::copy_from_slice(&bitmap.data()[..8]))
    }

    fn decode(&self, blob: &[u8], width: u32, height: u32) -> Result<Bitmap, CodecError> {
        Ok(Bitmap::solid(width, height, [blob[0]; 4]))
    }
}

/// Holds a render of one frame until the test releases it.
struct RenderGate {
    frame: FrameNumber,
    entered: Notify,
    release: Notify,
}

/// Renderer with an optional failing frame and an optional gated frame.
struct TestRenderer {
    fail_on: Option<FrameNumber>,
    gate: Option<Arc<RenderGate>>,
    rendered: Mutex<Vec<FrameNumber>>,
}

impl TestRenderer {
    fn new() -> Self {
        Self {
            fail_on: None,
            gate: None,
            rendered: Mutex::new(Vec::new()),
        }
    }

    fn failing_on(mut self, frame: FrameNumber) -> Self {
        self.fail_on = Some(frame);
        self
    }

    fn gated_on(mut self, frame: FrameNumber) -> (Self, Arc<RenderGate>) {
        let gate = Arc::new(RenderGate {
            frame,
            entered: Notify::new(),
            release: Notify::new(),
        });
        self.gate = Some(gate.clone());
        (self, gate)
    }

    fn rendered(&self) -> Vec<FrameNumber> {
        self.rendered.lock().clone()
    }
}

#[async_trait]
impl FrameRenderer for TestRenderer {
    async fn render(&self, frame: FrameNumber) -> anyhow::Result<Bitmap> {
        if let Some(gate) = self.gate.as_ref().filter(|g| g.frame == frame) {
            gate.entered.notify_one();
            gate.release.notified().await;
        }
        if self.fail_on == Some(frame) {
            anyhow::bail!("render of frame {frame} failed");
        }
        self.rendered.lock().push(frame);
        Ok(Bitmap::solid(4, 4, [frame as u8, 0, 0, 255]))
    }
}

fn compressing_config() -> CacheConfig {
    CacheConfig {
        compression: true,
        ..Default::default()
    }
}

fn window_config(window: u64) -> CacheConfig {
    CacheConfig {
        pre_cache_window: window,
        ..Default::default()
    }
}

// ─── Compression ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_compression_threshold_boundary() {
    // 4x4 RGBA = 64 raw bytes; 70% is 44.8.
    let keeps = FrameCache::with_codec(compressing_config(), Arc::new(FixedSizeCodec { size: 44 })).unwrap();
    keeps.set(0, "A", Bitmap::solid(4, 4, [1; 4]), "h").await;
    let stats = keeps.stats();
    assert_eq!(stats.compressed_frames, 1);
    assert_eq!(stats.memory_used, 44);

    let rejects = FrameCache::with_codec(compressing_config(), Arc::new(FixedSizeCodec { size: 45 })).unwrap();
    rejects.set(0, "A", Bitmap::solid(4, 4, [1; 4]), "h").await;
    let stats = rejects.stats();
    assert_eq!(stats.compressed_frames, 0);
    assert_eq!(stats.memory_used, 64);
    assert!(rejects.get(0, "A", None).is_some());
}

#[tokio::test]
async fn test_compressed_entry_decodes_on_async_get() {
    let cache = FrameCache::with_codec(compressing_config(), Arc::new(FixedSizeCodec { size: 8 })).unwrap();
    cache.set(3, "A", Bitmap::solid(4, 4, [1; 4]), "h").await;

    let decoded = cache.get_async(3, "A", Some("h")).await.unwrap();
    assert_eq!((decoded.width(), decoded.height()), (4, 4));
    assert_eq!(&decoded.data()[..4], &[7, 7, 7, 255]);

    // A stale hash evicts even compressed entries.
    assert!(cache.get_async(3, "A", Some("other")).await.is_none());
    assert!(!cache.has(3, "A"));

    let stats = cache.stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
}

#[tokio::test]
async fn test_default_codec_roundtrip_through_cache() {
    let cache = FrameCache::new(CacheConfig {
        compression: true,
        compression_quality: 1.0,
        ..Default::default()
    })
    .unwrap();
    let original = Bitmap::solid(32, 32, [10, 20, 30, 255]);
    cache.set(0, "A", original.clone(), "h").await;

    assert_eq!(cache.stats().compressed_frames, 1);
    assert_eq!(cache.get_async(0, "A", None).await, Some(original));
}

#[tokio::test]
async fn test_non_finite_quality_still_stores_frames() {
    let cache = FrameCache::new(CacheConfig {
        compression: true,
        compression_quality: f32::NAN,
        ..Default::default()
    })
    .unwrap();
    let original = Bitmap::solid(16, 16, [10, 20, 30, 255]);
    cache.set(0, "A", original.clone(), "h").await;
    assert_eq!(cache.get_async(0, "A", None).await, Some(original));

    cache.set_config(&ConfigPatch {
        compression_quality: Some(0.5),
        ..Default::default()
    });
    let config = cache.set_config(&ConfigPatch {
        compression_quality: Some(f32::NAN),
        ..Default::default()
    });
    assert_eq!(config.compression_quality, 0.5);
    cache.set(1, "A", Bitmap::solid(16, 16, [0; 4]), "h").await;
    assert!(cache.has(1, "A"));
}

#[tokio::test]
async fn test_decode_failure_is_miss_and_keeps_entry() {
    let cache = FrameCache::with_codec(compressing_config(), Arc::new(CorruptingCodec)).unwrap();
    cache.set(1, "A", Bitmap::solid(4, 4, [1; 4]), "h").await;

    assert!(cache.get_async(1, "A", None).await.is_none());
    assert!(cache.has(1, "A"));

    let stats = cache.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 0);
    assert_eq!(stats.cached_frames, 1);
    cache.check_invariants().unwrap();
}

// ─── Concurrency ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_sets_keep_accounting_consistent() {
    let cache = FrameCache::new(CacheConfig {
        max_frames: 16,
        ..Default::default()
    })
    .unwrap();

    let writers = (0..64u64).map(|f| {
        let cache = cache.clone();
        async move {
            cache
                .set(f, "A", Bitmap::solid(4, 4, [f as u8; 4]), "h")
                .await
        }
    });
    futures::future::join_all(writers).await;

    let stats = cache.stats();
    assert_eq!(stats.cached_frames, 16);
    assert_eq!(stats.memory_used, 16 * 64);
    cache.check_invariants().unwrap();
}

#[tokio::test]
async fn test_last_issued_set_wins_under_encoding() {
    let cache = FrameCache::with_codec(compressing_config(), Arc::new(FixedSizeCodec { size: 8 })).unwrap();

    let writers = (0..10).map(|i| {
        let cache = cache.clone();
        async move {
            cache
                .set(0, "A", Bitmap::solid(4, 4, [i as u8; 4]), format!("h{i}"))
                .await
        }
    });
    futures::future::join_all(writers).await;

    assert_eq!(cache.stats().cached_frames, 1);
    assert!(cache.get_async(0, "A", Some("h9")).await.is_some());
}

#[tokio::test]
async fn test_earlier_set_cannot_land_after_later_set_and_remove() {
    let codec = Arc::new(GatedCodec::new());
    let cache = FrameCache::with_codec(compressing_config(), codec.clone()).unwrap();

    let first = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .set(0, "A", Bitmap::solid(4, 4, [1; 4]), "h1")
                .await
        })
    };
    while !codec.entered.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    cache.set(0, "A", Bitmap::solid(4, 4, [2; 4]), "h2").await;
    assert!(cache.get_async(0, "A", Some("h2")).await.is_some());
    assert!(cache.remove(0, "A"));

    codec.release.notify_one();
    first.await.unwrap();

    assert!(!cache.has(0, "A"));
    cache.check_invariants().unwrap();
}

#[tokio::test]
async fn test_set_after_clear_ignores_writes_issued_before_it() {
    let codec = Arc::new(GatedCodec::new());
    let cache = FrameCache::with_codec(compressing_config(), codec.clone()).unwrap();

    let first = {
        let cache = cache.clone();
        tokio::spawn(async move {
            cache
                .set(0, "A", Bitmap::solid(4, 4, [1; 4]), "h1")
                .await
        })
    };
    while !codec.entered.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    cache.clear();
    codec.release.notify_one();
    first.await.unwrap();

    assert!(!cache.has(0, "A"));
}

// ─── Pre-caching ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_pre_cache_renders_window_in_priority_order() {
    let cache = FrameCache::new(window_config(3)).unwrap();
    let renderer = Arc::new(TestRenderer::new());
    cache.set_render_callback(renderer.clone());

    let report = cache.start_pre_cache(10, "A", "h", Direction::Both).await;

    assert_eq!(report.rendered, 6);
    assert!(!report.cancelled);
    assert_eq!(renderer.rendered(), vec![11, 9, 12, 8, 13, 7]);
    for f in [7, 8, 9, 11, 12, 13] {
        assert!(cache.get(f, "A", Some("h")).is_some());
    }
    assert!(!cache.is_pre_caching());
    assert_eq!(cache.metrics().prefetch_rendered.get(), 6);
}

#[tokio::test]
async fn test_pre_cache_skips_cached_and_clamps_at_zero() {
    let cache = FrameCache::new(window_config(2)).unwrap();
    let renderer = Arc::new(TestRenderer::new());
    cache.set_render_callback(renderer.clone());
    cache.set(2, "A", Bitmap::solid(4, 4, [0; 4]), "h").await;

    let report = cache.start_pre_cache(1, "A", "h", Direction::Both).await;

    // Candidates: 2 (cached), 0, 3. Frame -1 does not exist.
    assert_eq!(report.skipped, 1);
    assert_eq!(report.rendered, 2);
    assert_eq!(renderer.rendered(), vec![0, 3]);
}

#[tokio::test]
async fn test_failed_render_does_not_stop_queue() {
    let cache = FrameCache::new(window_config(5)).unwrap();
    let renderer = Arc::new(TestRenderer::new().failing_on(3));
    cache.set_render_callback(renderer.clone());

    let report = cache.start_pre_cache(0, "A", "h", Direction::Forward).await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.rendered, 4);
    assert!(!cache.has(3, "A"));
    assert!(cache.has(5, "A"));
    assert_eq!(cache.metrics().prefetch_failures.get(), 1);
}

#[tokio::test]
async fn test_closure_renderer() {
    let cache = FrameCache::new(window_config(2)).unwrap();
    cache.set_render_callback(Arc::new(|frame: FrameNumber| async move {
        Ok::<_, anyhow::Error>(Bitmap::solid(2, 2, [frame as u8; 4]))
    }));

    let report = cache.start_pre_cache(0, "A", "h", Direction::Forward).await;
    assert_eq!(report.rendered, 2);
    assert_eq!(cache.get(2, "A", None), Some(Bitmap::solid(2, 2, [2; 4])));
}

#[tokio::test]
async fn test_pre_cache_disabled_is_noop() {
    let cache = FrameCache::new(CacheConfig {
        predictive_pre_cache: false,
        ..Default::default()
    })
    .unwrap();
    let renderer = Arc::new(TestRenderer::new());
    cache.set_render_callback(renderer.clone());

    let report = cache.start_pre_cache(0, "A", "h", Direction::Forward).await;
    assert_eq!(report.session, None);
    assert!(renderer.rendered().is_empty());
}

#[tokio::test]
async fn test_new_session_preempts_old_one() {
    let cache = FrameCache::new(window_config(5)).unwrap();
    let (renderer, gate) = TestRenderer::new().gated_on(2);
    cache.set_render_callback(Arc::new(renderer));

    // The first session stores frame 1, then stalls rendering frame 2.
    let first = cache.spawn_pre_cache(0, "A", "h", Direction::Forward);
    gate.entered.notified().await;

    let second = cache.start_pre_cache(100, "A", "h", Direction::Forward).await;
    gate.release.notify_one();
    let first = first.await.unwrap();

    assert!(first.cancelled);
    assert_eq!(first.rendered, 1);
    assert_ne!(first.session, second.session);

    // Frame 2 finished rendering after preemption and was discarded.
    assert!(cache.has(1, "A"));
    for f in 2..=5 {
        assert!(!cache.has(f, "A"));
    }

    assert_eq!(second.rendered, 5);
    assert!(!second.cancelled);
    for f in 101..=105 {
        assert!(cache.has(f, "A"));
    }
    assert!(!cache.is_pre_caching());
}

#[tokio::test]
async fn test_abort_stops_running_session() {
    let cache = FrameCache::new(window_config(5)).unwrap();
    let (renderer, gate) = TestRenderer::new().gated_on(1);
    cache.set_render_callback(Arc::new(renderer));

    let handle = cache.spawn_pre_cache(0, "A", "h", Direction::Forward);
    gate.entered.notified().await;

    assert!(cache.is_pre_caching());
    assert!(cache.abort_pre_cache());
    assert_eq!(cache.pending_pre_cache(), 0);

    gate.release.notify_one();
    let report = handle.await.unwrap();
    assert!(report.cancelled);
    assert_eq!(report.rendered, 0);
    assert_eq!(cache.stats().cached_frames, 0);
    assert!(!cache.abort_pre_cache());
}

// ─── GPU presets ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_initialize_for_gpu_applies_preset() {
    let cache = FrameCache::new(CacheConfig {
        compression_quality: 0.3,
        ..Default::default()
    })
    .unwrap();

    let tier = cache
        .initialize_for_gpu(&StaticTierDetector(GpuTier::Cpu))
        .await;
    assert_eq!(tier, GpuTier::Cpu);

    let config = cache.config();
    assert_eq!(config.max_frames, 30);
    assert_eq!(config.max_memory_bytes, 256 * 1024 * 1024);
    assert!(config.compression);
    assert_eq!(config.pre_cache_window, 3);
    // Fields outside the preset are untouched.
    assert_eq!(config.compression_quality, 0.3);
}

// ─── Admin API ─────────────────────────────────────────────────────────────

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn admin_app(cache: FrameCache) -> axum::Router {
    build_router(Arc::new(AppState {
        cache,
        start_time: Instant::now(),
    }))
}

#[tokio::test]
async fn test_admin_stats_and_clear() {
    let cache = FrameCache::new(CacheConfig::default()).unwrap();
    cache.set(1, "A", Bitmap::solid(4, 4, [0; 4]), "h").await;
    cache.set(2, "B", Bitmap::solid(4, 4, [0; 4]), "h").await;
    let app = admin_app(cache.clone());

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/v1/cache/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stats = body_json(response).await;
    assert_eq!(stats["cached_frames"], 2);
    assert_eq!(stats["memory_used"], 128);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/v1/cache/compositions/A")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_json(response).await["removed"], 1);
    assert!(cache.has(2, "B"));

    let response = app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/v1/cache")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_json(response).await["removed"], 1);
    assert_eq!(cache.stats().cached_frames, 0);
}

#[tokio::test]
async fn test_admin_config_patch_and_invalidate() {
    let cache = FrameCache::new(CacheConfig::default()).unwrap();
    let app = admin_app(cache.clone());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PATCH")
                .uri("/v1/cache/config")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"max_frames": 5, "compression": true}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let config = body_json(response).await;
    assert_eq!(config["max_frames"], 5);
    assert_eq!(config["compression"], true);
    assert_eq!(cache.config().max_frames, 5);

    let invalidate = |hash: &'static str| {
        Request::builder()
            .method("POST")
            .uri("/v1/cache/compositions/A/invalidate")
            .header("content-type", "application/json")
            .body(Body::from(format!(r#"{{"state_hash": "{hash}"}}"#)))
            .unwrap()
    };

    let first = app.clone().oneshot(invalidate("h1")).await.unwrap();
    assert_eq!(body_json(first).await["cleared"], false);
    let second = app.clone().oneshot(invalidate("h2")).await.unwrap();
    assert_eq!(body_json(second).await["cleared"], true);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/cache/prefetch/abort")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(body_json(response).await["aborted"], false);
}

#[tokio::test]
async fn test_admin_health_and_metrics() {
    let cache = FrameCache::new(CacheConfig::default()).unwrap();
    cache.get(0, "A", None);
    let app = admin_app(cache);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let health = body_json(response).await;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["pre_caching"], false);
    assert_eq!(health["cache"]["misses"], 1);

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("frame_cache_misses_total 1"));
}
