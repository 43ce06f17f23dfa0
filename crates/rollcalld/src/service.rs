//! The on-demand attendance service: snapshot the latest frame, re-run
//! detection, match against the registry, and gate the attendance
//! record. Implements the endpoint contract the web layer serves.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{Local, NaiveDateTime};
use serde::Serialize;

use rollcall_core::{
    AttendanceDecision, AttendanceGate, AttendanceLedger, CacheError, EuclideanMatcher,
    FrameBuffer, MatchOutcome, Matcher, RegistryCache, RegistrySource,
};
use rollcall_hw::RgbFrame;

use crate::capture::SharedAnalyzer;
use crate::store::SqliteStore;

const TIME_FORMAT: &str = "%H:%M:%S";

/// The concrete service the daemon wires up.
pub type DaemonService = AttendanceService<Arc<SqliteStore>, Arc<SqliteStore>>;

/// Endpoint response, JSON-tagged by `status`. The HTTP-equivalent
/// status code rides alongside for the web layer; it is not part of the
/// serialized body.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum MarkResponse {
    Success {
        name: String,
        time: String,
        confidence: f32,
    },
    Info {
        message: String,
        time: String,
    },
    Error {
        message: String,
        #[serde(skip)]
        http_status: u16,
    },
}

impl MarkResponse {
    pub fn http_status(&self) -> u16 {
        match self {
            MarkResponse::Success { .. } | MarkResponse::Info { .. } => 200,
            MarkResponse::Error { http_status, .. } => *http_status,
        }
    }

    fn bad_request(message: &str) -> Self {
        MarkResponse::Error {
            message: message.to_string(),
            http_status: 400,
        }
    }

    fn server_error(message: &str) -> Self {
        MarkResponse::Error {
            message: message.to_string(),
            http_status: 500,
        }
    }
}

pub struct AttendanceService<R: RegistrySource, L: AttendanceLedger> {
    frames: Arc<FrameBuffer<RgbFrame>>,
    cache: Arc<RegistryCache<R>>,
    gate: AttendanceGate<L>,
    analyzer: SharedAnalyzer,
    confidence_threshold: f32,
    downscale_factor: f32,
}

impl<R: RegistrySource, L: AttendanceLedger> AttendanceService<R, L> {
    pub fn new(
        frames: Arc<FrameBuffer<RgbFrame>>,
        cache: Arc<RegistryCache<R>>,
        gate: AttendanceGate<L>,
        analyzer: SharedAnalyzer,
        confidence_threshold: f32,
        downscale_factor: f32,
    ) -> Self {
        Self {
            frames,
            cache,
            gate,
            analyzer,
            confidence_threshold,
            downscale_factor,
        }
    }

    /// Run the on-demand attendance decision against the current clock.
    pub fn mark_attendance(&self) -> MarkResponse {
        self.mark_attendance_at(Local::now().naive_local())
    }

    /// Clock-injected variant, exercised directly by tests.
    ///
    /// Every failure resolves to a definite response — nothing in here
    /// retries or blocks beyond one detection pass. The frame snapshot
    /// and registry snapshot taken below are the ones the whole request
    /// uses; the result never mixes two frames or two registries.
    pub fn mark_attendance_at(&self, now: NaiveDateTime) -> MarkResponse {
        let Some(frame) = self.frames.snapshot() else {
            tracing::error!("no frame available for attendance marking");
            return MarkResponse::bad_request("Camera feed not available");
        };

        let small = frame.downscale(self.downscale_factor);
        let detected = {
            let mut analyzer = self.analyzer.lock().unwrap_or_else(PoisonError::into_inner);
            analyzer.detect_and_encode(&small.data, small.width, small.height)
        };
        let faces = match detected {
            Ok(faces) => faces,
            Err(err) => {
                tracing::error!(error = %err, "detection failed during attendance marking");
                return MarkResponse::server_error("Recognition system error");
            }
        };
        let Some(probe) = faces.first() else {
            tracing::warn!("no face detected in frame");
            return MarkResponse::bad_request("No face detected - please face the camera");
        };

        let registry = match self.cache.get() {
            Ok(snapshot) => snapshot,
            Err(CacheError::LoadFailed {
                stale: Some(previous),
                cause,
            }) => {
                tracing::warn!(error = %cause, "registry reload failed, using stale snapshot");
                previous
            }
            Err(CacheError::LoadFailed { cause, .. }) => {
                tracing::error!(error = %cause, "registry unavailable");
                return MarkResponse::server_error("Database operation failed");
            }
        };

        match EuclideanMatcher.match_probe(&probe.embedding, &registry, self.confidence_threshold) {
            MatchOutcome::EmptyRegistry => {
                tracing::error!("no registered faces in database");
                MarkResponse::bad_request("System has no registered users")
            }
            MatchOutcome::BelowThreshold { confidence } => {
                tracing::info!(confidence, "recognition confidence too low");
                MarkResponse::bad_request("Recognition confidence too low")
            }
            MatchOutcome::Matched {
                identity,
                display_name,
                confidence,
            } => {
                let time = now.format(TIME_FORMAT).to_string();
                match self.gate.mark(identity, &display_name, now) {
                    Ok(AttendanceDecision::Recorded { .. }) => {
                        tracing::info!(name = %display_name, confidence, "attendance marked");
                        MarkResponse::Success {
                            name: display_name,
                            time,
                            confidence: (confidence * 100.0).round() / 100.0,
                        }
                    }
                    Ok(AttendanceDecision::AlreadyMarkedToday) => MarkResponse::Info {
                        message: format!("{display_name} already marked today"),
                        time,
                    },
                    Ok(AttendanceDecision::Rejected { reason }) => {
                        tracing::warn!(name = %display_name, reason = %reason, "attendance rejected");
                        MarkResponse::bad_request(&reason)
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "attendance recording failed");
                        MarkResponse::server_error("Database operation failed")
                    }
                }
            }
        }
    }

    /// Drop the memoized registry so the next lookup reloads.
    pub fn refresh_registry(&self) {
        self.cache.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use rollcall_core::{BoxError, DetectedFace, Embedding, FaceAnalyzer, FaceBox};
    use std::time::Duration;

    struct FakeAnalyzer {
        faces: Vec<DetectedFace>,
    }

    impl FaceAnalyzer for FakeAnalyzer {
        fn detect_and_encode(
            &mut self,
            _rgb: &[u8],
            _width: u32,
            _height: u32,
        ) -> Result<Vec<DetectedFace>, BoxError> {
            Ok(self.faces.clone())
        }
    }

    fn face(values: Vec<f32>) -> DetectedFace {
        DetectedFace {
            bbox: FaceBox {
                x: 4.0,
                y: 4.0,
                width: 16.0,
                height: 16.0,
                confidence: 0.9,
            },
            embedding: Embedding::new(values),
        }
    }

    fn test_frame() -> RgbFrame {
        RgbFrame {
            data: vec![100u8; 32 * 24 * 3],
            width: 32,
            height: 24,
            sequence: 1,
            captured_at: std::time::Instant::now(),
        }
    }

    fn now(time: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("2026-08-07 {time}"), "%Y-%m-%d %H:%M:%S").unwrap()
    }

    /// Service over an in-memory store, a pre-published frame, and an
    /// analyzer that reports the given faces.
    fn service(
        enrolled: &[(&str, Vec<f32>)],
        detected: Vec<DetectedFace>,
        publish_frame: bool,
    ) -> DaemonService {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        for (name, values) in enrolled {
            let id = store.add_user(name, None).unwrap();
            store.add_embedding(id, &Embedding::new(values.clone())).unwrap();
        }

        let frames = Arc::new(FrameBuffer::new());
        if publish_frame {
            frames.publish(test_frame());
        }

        AttendanceService::new(
            frames,
            Arc::new(RegistryCache::new(
                Arc::clone(&store),
                Duration::from_secs(300),
            )),
            AttendanceGate::new(Arc::clone(&store)),
            Arc::new(Mutex::new(Box::new(FakeAnalyzer { faces: detected }))),
            0.6,
            0.25,
        )
    }

    #[test]
    fn test_exact_probe_marks_with_full_confidence() {
        let e1 = vec![1.0, 0.0, 0.0, 0.0];
        let service = service(&[("Alice", e1.clone())], vec![face(e1)], true);

        let response = service.mark_attendance_at(now("09:00:00"));
        assert_eq!(response.http_status(), 200);
        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["status"], "success");
        assert_eq!(body["name"], "Alice");
        assert_eq!(body["time"], "09:00:00");
        assert_eq!(body["confidence"], 1.0);
    }

    #[test]
    fn test_second_mark_same_day_is_info() {
        let e1 = vec![1.0, 0.0, 0.0, 0.0];
        let service = service(&[("Alice", e1.clone())], vec![face(e1)], true);

        service.mark_attendance_at(now("09:00:00"));
        let response = service.mark_attendance_at(now("09:05:00"));

        assert_eq!(response.http_status(), 200);
        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["status"], "info");
        assert_eq!(body["message"], "Alice already marked today");
        assert_eq!(body["time"], "09:05:00");
    }

    #[test]
    fn test_next_day_marks_again() {
        let e1 = vec![1.0, 0.0, 0.0, 0.0];
        let service = service(&[("Alice", e1.clone())], vec![face(e1)], true);

        service.mark_attendance_at(now("09:00:00"));
        let next_day =
            NaiveDateTime::parse_from_str("2026-08-08 00:00:00", "%Y-%m-%d %H:%M:%S").unwrap();
        let response = service.mark_attendance_at(next_day);

        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["status"], "success");
    }

    #[test]
    fn test_unrelated_probe_is_low_confidence_400() {
        let service = service(
            &[("Alice", vec![1.0, 0.0, 0.0, 0.0])],
            vec![face(vec![0.0, 1.0, 0.0, 0.0])],
            true,
        );

        let response = service.mark_attendance_at(now("09:00:00"));
        assert_eq!(response.http_status(), 400);
        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["message"], "Recognition confidence too low");
    }

    #[test]
    fn test_no_frame_yet_is_400() {
        let e1 = vec![1.0, 0.0, 0.0, 0.0];
        let service = service(&[("Alice", e1.clone())], vec![face(e1)], false);

        let response = service.mark_attendance_at(now("09:00:00"));
        assert_eq!(response.http_status(), 400);
        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["message"], "Camera feed not available");
    }

    #[test]
    fn test_no_face_detected_is_400() {
        let service = service(&[("Alice", vec![1.0, 0.0])], vec![], true);

        let response = service.mark_attendance_at(now("09:00:00"));
        assert_eq!(response.http_status(), 400);
        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["message"], "No face detected - please face the camera");
    }

    #[test]
    fn test_empty_registry_is_400_not_low_confidence() {
        let service = service(&[], vec![face(vec![1.0, 0.0])], true);

        let response = service.mark_attendance_at(now("09:00:00"));
        assert_eq!(response.http_status(), 400);
        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["message"], "System has no registered users");
    }

    #[test]
    fn test_error_body_has_no_http_field() {
        let response = MarkResponse::bad_request("nope");
        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["status"], "error");
        assert!(body.get("http_status").is_none());
    }
}
