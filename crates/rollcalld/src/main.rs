use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use rollcall_core::{AttendanceGate, FrameBuffer, RegistryCache};

mod capture;
mod config;
mod dbus_interface;
mod service;
mod store;

use capture::SharedAnalyzer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = config::Config::load()?;
    let store = Arc::new(
        store::SqliteStore::open(&config.db_path).context("failed to open attendance database")?,
    );

    // Fail fast on missing models or camera — the supervisor decides
    // whether to retry, not this process.
    let pipeline = rollcall_vision::FacePipeline::load(
        &config.detector_model_path(),
        &config.encoder_model_path(),
    )
    .context("failed to load face models")?;
    let analyzer: SharedAnalyzer = Arc::new(Mutex::new(Box::new(pipeline)));

    let camera =
        rollcall_hw::Camera::open(&config.camera_device).context("failed to open camera")?;

    let frames = Arc::new(FrameBuffer::new());
    let cache = Arc::new(RegistryCache::new(Arc::clone(&store), config.cache_ttl()));
    let stop = Arc::new(AtomicBool::new(false));
    let (stream_tx, mut stream_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(4);

    let capture_handle = capture::spawn_capture_loop(
        Box::new(camera),
        Arc::clone(&analyzer),
        Arc::clone(&frames),
        Arc::clone(&cache),
        capture::CaptureSettings {
            frame_skip_rate: config.frame_skip_rate,
            downscale_factor: config.downscale_factor,
            confidence_threshold: config.confidence_threshold,
            warmup_frames: config.warmup_frames,
            jpeg_quality: config.jpeg_quality,
        },
        Arc::clone(&stop),
        stream_tx,
    )
    .context("failed to spawn capture thread")?;

    // The web layer consumes this stream as multipart chunks; until one
    // is attached we drain it so the capture loop keeps running.
    let stream_task = tokio::spawn(async move {
        let mut streamed: u64 = 0;
        while let Some(jpeg) = stream_rx.recv().await {
            streamed += 1;
            if streamed % 100 == 0 {
                tracing::debug!(streamed, bytes = jpeg.len(), "stream heartbeat");
            }
        }
    });

    let service = Arc::new(service::AttendanceService::new(
        Arc::clone(&frames),
        Arc::clone(&cache),
        AttendanceGate::new(Arc::clone(&store)),
        Arc::clone(&analyzer),
        config.confidence_threshold,
        config.downscale_factor,
    ));

    let iface = dbus_interface::RollcallInterface::new(
        Arc::clone(&service),
        Arc::clone(&store),
        Arc::clone(&analyzer),
    );
    let _conn = zbus::connection::Builder::session()?
        .name("org.rollcall.Attendance1")?
        .serve_at("/org/rollcall/Attendance1", iface)?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!("rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    stop.store(true, Ordering::Relaxed);
    stream_task.abort();
    tokio::task::spawn_blocking(move || {
        if capture_handle.join().is_err() {
            tracing::error!("capture thread panicked");
        }
    })
    .await?;

    Ok(())
}
