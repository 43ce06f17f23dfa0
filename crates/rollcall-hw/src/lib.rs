//! rollcall-hw — Hardware abstraction for camera capture.
//!
//! Provides V4L2-based camera access producing packed RGB24 frames,
//! plus the frame-level image operations the capture pipeline needs:
//! YUYV conversion, bilinear downscaling, and annotation drawing.

pub mod annotate;
pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, FrameSource, PixelFormat};
pub use frame::RgbFrame;
