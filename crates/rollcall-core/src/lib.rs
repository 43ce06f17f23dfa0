//! rollcall-core — The real-time attendance matching pipeline.
//!
//! Pure domain logic shared by the daemon and its tests: embedding and
//! registry types, the TTL-bounded registry cache, the latest-frame
//! buffer, the nearest-neighbor match engine, and the once-per-day
//! attendance gate. No camera, no inference, no SQL — those arrive
//! through the trait seams defined in [`types`] and [`attendance`].

pub mod attendance;
pub mod framebuf;
pub mod matcher;
pub mod registry;
pub mod types;

pub use attendance::{AttendanceDecision, AttendanceGate, AttendanceLedger, AttendanceRow, LedgerError};
pub use framebuf::FrameBuffer;
pub use matcher::{EuclideanMatcher, MatchOutcome, Matcher};
pub use registry::{CacheError, RegistryCache};
pub use types::{
    BoxError, DetectedFace, Embedding, FaceAnalyzer, FaceBox, KnownFaceEntry, RegistrySnapshot,
    RegistrySource,
};
