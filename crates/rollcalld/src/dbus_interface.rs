//! D-Bus interface for the Rollcall attendance daemon.
//!
//! Bus name: org.rollcall.Attendance1
//! Object path: /org/rollcall/Attendance1
//!
//! Every method returns a JSON string in the endpoint contract shapes;
//! the web layer wrapping this interface translates them 1:1 into HTTP
//! responses.

use std::sync::{Arc, PoisonError};

use zbus::interface;

use crate::capture::SharedAnalyzer;
use crate::service::DaemonService;
use crate::store::SqliteStore;

pub struct RollcallInterface {
    service: Arc<DaemonService>,
    store: Arc<SqliteStore>,
    analyzer: SharedAnalyzer,
}

impl RollcallInterface {
    pub fn new(service: Arc<DaemonService>, store: Arc<SqliteStore>, analyzer: SharedAnalyzer) -> Self {
        Self {
            service,
            store,
            analyzer,
        }
    }
}

fn internal(err: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(err.to_string())
}

fn to_json(value: &impl serde::Serialize) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(internal)
}

#[interface(name = "org.rollcall.Attendance1")]
impl RollcallInterface {
    /// Run the on-demand attendance decision for whoever is in front of
    /// the camera.
    async fn mark_attendance(&self) -> zbus::fdo::Result<String> {
        let service = Arc::clone(&self.service);
        let response = tokio::task::spawn_blocking(move || service.mark_attendance())
            .await
            .map_err(internal)?;
        to_json(&response)
    }

    /// Enroll a new user from a photo on disk. An empty email is
    /// treated as absent.
    async fn register_user(
        &self,
        name: &str,
        email: &str,
        photo_path: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(name, photo_path, "register requested");
        let store = Arc::clone(&self.store);
        let analyzer = Arc::clone(&self.analyzer);
        let service = Arc::clone(&self.service);
        let name = name.to_string();
        let email = email.to_string();
        let photo_path = photo_path.to_string();

        let result = tokio::task::spawn_blocking(move || {
            register_user_blocking(&store, &analyzer, &service, &name, &email, &photo_path)
        })
        .await
        .map_err(internal)?;
        to_json(&result)
    }

    /// List registered users.
    async fn list_users(&self) -> zbus::fdo::Result<String> {
        let users = self.store.list_users().map_err(internal)?;
        let rows: Vec<serde_json::Value> = users
            .into_iter()
            .map(|u| {
                serde_json::json!({
                    "user_id": u.user_id,
                    "name": u.name,
                    "email": u.email,
                    "created_at": u.created_at,
                })
            })
            .collect();
        to_json(&rows)
    }

    /// Attendance counts per user; `date` is YYYY-MM-DD or empty for
    /// all time.
    async fn attendance_report(&self, date: &str) -> zbus::fdo::Result<String> {
        let filter = if date.is_empty() {
            None
        } else {
            Some(
                chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d")
                    .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("bad date {date:?}: {e}")))?,
            )
        };
        let report = self.store.attendance_report(filter).map_err(internal)?;
        let rows: Vec<serde_json::Value> = report
            .into_iter()
            .map(|(name, count)| serde_json::json!({ "name": name, "count": count }))
            .collect();
        to_json(&rows)
    }

    /// Force the known-face registry to reload on next use.
    async fn refresh_registry(&self) -> zbus::fdo::Result<()> {
        self.service.refresh_registry();
        Ok(())
    }

    /// Delete malformed embedding rows; returns how many were removed.
    async fn repair_embeddings(&self) -> zbus::fdo::Result<u32> {
        let removed = self.store.repair_embeddings().map_err(internal)?;
        if removed > 0 {
            self.service.refresh_registry();
        }
        Ok(removed as u32)
    }

    /// Daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let users = self.store.list_users().map_err(internal)?.len();
        to_json(&serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "users": users,
        }))
    }
}

/// Decode the photo, extract the strongest face embedding, persist the
/// user, and invalidate the registry cache.
fn register_user_blocking(
    store: &SqliteStore,
    analyzer: &SharedAnalyzer,
    service: &DaemonService,
    name: &str,
    email: &str,
    photo_path: &str,
) -> serde_json::Value {
    let photo = match image::open(photo_path) {
        Ok(img) => img.to_rgb8(),
        Err(err) => {
            tracing::warn!(photo_path, error = %err, "could not read photo");
            return serde_json::json!({
                "status": "error",
                "message": format!("could not read photo: {err}"),
            });
        }
    };

    let (width, height) = photo.dimensions();
    let detected = {
        let mut analyzer = analyzer.lock().unwrap_or_else(PoisonError::into_inner);
        analyzer.detect_and_encode(photo.as_raw(), width, height)
    };
    let faces = match detected {
        Ok(faces) => faces,
        Err(err) => {
            tracing::error!(error = %err, "detection failed during registration");
            return serde_json::json!({
                "status": "error",
                "message": "Recognition system error",
            });
        }
    };
    let Some(face) = faces.first() else {
        return serde_json::json!({
            "status": "error",
            "message": "No face found in image",
        });
    };

    let email = (!email.is_empty()).then_some(email);
    let user_id = match store
        .add_user(name, email)
        .and_then(|id| store.add_embedding(id, &face.embedding).map(|_| id))
    {
        Ok(id) => id,
        Err(err) => {
            tracing::error!(error = %err, "registration failed");
            return serde_json::json!({
                "status": "error",
                "message": "Database operation failed",
            });
        }
    };

    // New enrollment becomes visible without waiting out the TTL.
    service.refresh_registry();
    tracing::info!(name, user_id, "user registered");

    serde_json::json!({
        "status": "success",
        "user_id": user_id,
        "name": name,
    })
}
