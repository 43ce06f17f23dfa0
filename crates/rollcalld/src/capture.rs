//! The frame capture loop: owns the camera for the daemon's lifetime,
//! paces detection with frame skipping, annotates matches, and feeds
//! both the shared frame buffer and the outgoing JPEG stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;

use rollcall_core::{
    CacheError, DetectedFace, EuclideanMatcher, FaceAnalyzer, FrameBuffer, MatchOutcome, Matcher,
    RegistryCache, RegistrySource,
};
use rollcall_hw::{annotate, FrameSource, RgbFrame};

const BOX_COLOR: [u8; 3] = [0, 255, 0];
const LABEL_FG: [u8; 3] = [255, 255, 255];

/// The analyzer is shared between the capture loop and on-demand
/// requests; contention is bounded by one inference per holder.
pub type SharedAnalyzer = Arc<Mutex<Box<dyn FaceAnalyzer>>>;

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub frame_skip_rate: u32,
    pub downscale_factor: f32,
    pub confidence_threshold: f32,
    pub warmup_frames: usize,
    pub jpeg_quality: u8,
}

/// Spawn the capture loop on a dedicated OS thread.
///
/// The camera (or any other frame source) must already be open — a
/// device that cannot be opened is the supervisor's problem, not
/// retried here. The thread stops on read failure, on `stop`, or when
/// the stream consumer goes away, releasing the source in every case.
pub fn spawn_capture_loop<S>(
    source: Box<dyn FrameSource + Send>,
    analyzer: SharedAnalyzer,
    frames: Arc<FrameBuffer<RgbFrame>>,
    cache: Arc<RegistryCache<S>>,
    settings: CaptureSettings,
    stop: Arc<AtomicBool>,
    stream_tx: mpsc::Sender<Vec<u8>>,
) -> std::io::Result<std::thread::JoinHandle<()>>
where
    S: RegistrySource + Send + Sync + 'static,
{
    std::thread::Builder::new()
        .name("rollcall-capture".into())
        .spawn(move || run_capture(source, analyzer, frames, cache, settings, stop, stream_tx))
}

fn run_capture<S: RegistrySource>(
    mut source: Box<dyn FrameSource + Send>,
    analyzer: SharedAnalyzer,
    frames: Arc<FrameBuffer<RgbFrame>>,
    cache: Arc<RegistryCache<S>>,
    settings: CaptureSettings,
    stop: Arc<AtomicBool>,
    stream_tx: mpsc::Sender<Vec<u8>>,
) {
    tracing::info!(
        skip_rate = settings.frame_skip_rate,
        downscale = settings.downscale_factor,
        "capture loop started"
    );

    for _ in 0..settings.warmup_frames {
        let _ = source.next_frame();
    }

    let mut counter: u64 = 0;
    loop {
        if stop.load(Ordering::Relaxed) {
            tracing::info!("capture loop cancelled");
            break;
        }

        let mut frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(err) if err.is_per_frame() => {
                tracing::warn!(error = %err, "bad frame, skipping");
                continue;
            }
            Err(err) => {
                tracing::error!(error = %err, "frame capture failed");
                break;
            }
        };

        counter += 1;
        if counter % settings.frame_skip_rate as u64 != 0 {
            continue;
        }

        let small = frame.downscale(settings.downscale_factor);
        let detected = {
            let mut analyzer = analyzer.lock().unwrap_or_else(PoisonError::into_inner);
            analyzer.detect_and_encode(&small.data, small.width, small.height)
        };
        let faces = match detected {
            Ok(faces) => faces,
            Err(err) => {
                tracing::warn!(error = %err, seq = frame.sequence, "detection failed, skipping frame");
                continue;
            }
        };

        match_and_annotate(
            &mut frame,
            &faces,
            &frames,
            &cache,
            settings.confidence_threshold,
            settings.downscale_factor,
        );

        // JPEG encoding stays outside the critical section.
        let jpeg = match encode_jpeg(&frame, settings.jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(err) => {
                tracing::warn!(error = %err, seq = frame.sequence, "JPEG encoding failed");
                continue;
            }
        };

        match stream_tx.try_send(jpeg) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::trace!(seq = frame.sequence, "stream consumer behind, dropping frame");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::info!("stream consumer gone, stopping capture");
                break;
            }
        }
    }

    tracing::info!("capture loop stopped");
    // Dropping the source here releases the camera on every exit path.
}

/// The pipeline's single critical section.
///
/// The clean frame is published and the registry snapshot fetched
/// together, so every annotation drawn below reflects exactly one frame
/// and one registry — never a mix of two.
fn match_and_annotate<S: RegistrySource>(
    frame: &mut RgbFrame,
    faces: &[DetectedFace],
    frames: &FrameBuffer<RgbFrame>,
    cache: &RegistryCache<S>,
    threshold: f32,
    downscale_factor: f32,
) {
    frames.publish(frame.clone());

    let registry = match cache.get() {
        Ok(snapshot) => snapshot,
        Err(CacheError::LoadFailed {
            stale: Some(previous),
            cause,
        }) => {
            tracing::warn!(error = %cause, "registry reload failed, serving stale snapshot");
            previous
        }
        Err(CacheError::LoadFailed { cause, .. }) => {
            tracing::warn!(error = %cause, "no registry available, frame left unannotated");
            return;
        }
    };

    let upscale = 1.0 / downscale_factor;
    for face in faces {
        if let MatchOutcome::Matched {
            display_name,
            confidence,
            ..
        } = EuclideanMatcher.match_probe(&face.embedding, &registry, threshold)
        {
            let bbox = face.bbox.scale(upscale);
            let (x, y) = (bbox.x as i64, bbox.y as i64);
            let (w, h) = (bbox.width as i64, bbox.height as i64);

            annotate::draw_box(frame, x, y, w, h, BOX_COLOR, 2);
            let label = format!("{display_name} ({confidence:.2})");
            let label_y = y + h - annotate::label_height() - 2;
            annotate::draw_label(frame, x + 2, label_y, &label, LABEL_FG, BOX_COLOR);
        }
    }
}

fn encode_jpeg(frame: &RgbFrame, quality: u8) -> image::ImageResult<Vec<u8>> {
    let mut buf = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality);
    encoder.encode(
        &frame.data,
        frame.width,
        frame.height,
        image::ExtendedColorType::Rgb8,
    )?;
    Ok(buf)
}
