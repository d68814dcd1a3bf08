//! frame-cache: scrub simulator and admin server.
//!
//! Drives a [`FrameCache`] through a simulated forward scrub with a synthetic
//! renderer (get → render on miss → set → pre-cache ahead), reports the
//! resulting statistics, and optionally serves the admin API afterwards.

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, info};

use frame_cache::cache::{Direction, FrameCache};
use frame_cache::config::{Cli, Config};
use frame_cache::gpu::tier::StaticTierDetector;
use frame_cache::render::{FrameRenderer, SyntheticRenderer};
use frame_cache::server::admin_api::{build_router, AppState};

const COMPOSITION: &str = "main";
const STATE_HASH: &str = "v1";
const FRAME_INTERVAL: Duration = Duration::from_millis(1000 / 30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "frame_cache=debug,tower_http=debug"
    } else {
        "frame_cache=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("frame-cache v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;

    // Build the cache and apply the GPU tier preset.
    let cache = FrameCache::new(config.cache.clone())?;
    let tier = cli.gpu_tier.unwrap_or(config.server.gpu_tier);
    cache.initialize_for_gpu(&StaticTierDetector(tier)).await;

    let effective = cache.config();
    info!(
        max_frames = effective.max_frames,
        max_memory_bytes = effective.max_memory_bytes,
        compression = effective.compression,
        pre_cache_window = effective.pre_cache_window,
        "Cache configured"
    );

    let renderer = Arc::new(SyntheticRenderer::new(640, 360).with_delay(Duration::from_millis(8)));
    cache.set_render_callback(renderer.clone());

    // Simulated forward scrub.
    let started = Instant::now();
    for frame in 0..cli.frames {
        if cache
            .get_async(frame, COMPOSITION, Some(STATE_HASH))
            .await
            .is_none()
        {
            let bitmap = renderer.render(frame).await?;
            cache.set(frame, COMPOSITION, bitmap, STATE_HASH).await;
            debug!(frame, "Rendered on demand");
        }
        cache.spawn_pre_cache(frame, COMPOSITION, STATE_HASH, Direction::Forward);
        tokio::time::sleep(FRAME_INTERVAL).await;
    }
    cache.abort_pre_cache();

    let stats = cache.stats();
    info!(
        frames = cli.frames,
        elapsed_ms = started.elapsed().as_millis() as u64,
        renders = renderer.renders(),
        hits = stats.hits,
        misses = stats.misses,
        hit_ratio = stats.hit_ratio,
        cached_frames = stats.cached_frames,
        memory_used = stats.memory_used,
        evictions = stats.evictions,
        "Scrub simulation complete"
    );

    // Serve the admin API if requested.
    if cli.serve {
        let listen_addr = cli.listen.unwrap_or(config.server.listen);
        let state = Arc::new(AppState {
            cache,
            start_time: Instant::now(),
        });
        let app = build_router(state);

        info!(addr = listen_addr, "Starting admin server");
        let listener = TcpListener::bind(&listen_addr).await?;
        info!("Listening on {listen_addr}");

        axum::serve(listener, app).await?;
    }

    Ok(())
}
