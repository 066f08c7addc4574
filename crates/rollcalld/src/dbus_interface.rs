use std::sync::Arc;
use tokio::sync::RwLock;
use zbus::interface;

use crate::config::Config;
use crate::engine::{CaptureReport, EngineHandle};
use crate::store::{ReportFilter, SqliteStore};
use rollcall_core::types::{NewAttendance, NewIdentity};
use rollcall_core::registration::registered_message;
use rollcall_core::{AttendanceStatus, Gallery, RegistrationForm, RegistrationOutcome};

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub config: Config,
    pub engine: EngineHandle,
    pub store: SqliteStore,
    /// Current gallery snapshot. Reloads swap in a new `Arc`.
    pub gallery: RwLock<Arc<Gallery>>,
}

impl AppState {
    /// Rebuild the gallery from the store and swap it in.
    pub async fn reload_gallery(&self) -> Result<usize, crate::store::StoreError> {
        let fresh = Arc::new(self.store.gallery().await?);
        let n = fresh.len();
        *self.gallery.write().await = fresh;
        tracing::info!(entries = n, "gallery reloaded");
        Ok(n)
    }
}

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    pub state: Arc<AppState>,
}

fn failed(context: &str, e: impl std::fmt::Display) -> zbus::fdo::Error {
    tracing::error!(error = %e, "{context} failed");
    zbus::fdo::Error::Failed(e.to_string())
}

fn invalid(msg: impl Into<String>) -> zbus::fdo::Error {
    zbus::fdo::Error::InvalidArgs(msg.into())
}

/// D-Bus has no optional integers; non-positive ids mean "none".
fn actor(actor_id: i64) -> Option<i64> {
    (actor_id > 0).then_some(actor_id)
}

/// Empty strings mean "no filter".
fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn capture_json(report: &CaptureReport) -> serde_json::Value {
    let o = &report.outcome;
    serde_json::json!({
        "capture_id": o.capture_id,
        "frames_captured": o.frames_captured,
        "faces": o.faces,
        "labels": o.faces.iter().map(|f| f.label()).collect::<Vec<_>>(),
        "partition": o.partition,
        "marked": o.marked,
        "logs": o.logs,
        "pending_registration": o.pending_crop.is_some(),
    })
}

/// Reply for a registration attempt.
///
/// On success the shared gallery is reloaded from the store; the snapshot
/// carried by the outcome is never installed.
async fn registered_reply(state: &AppState, outcome: RegistrationOutcome) -> (bool, String) {
    let RegistrationOutcome::Registered { identity_id, .. } = outcome else {
        return (false, outcome.message());
    };
    let reloaded = match state.reload_gallery().await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(identity_id, error = %e, "gallery reload after registration failed");
            false
        }
    };
    (true, registered_message(identity_id, reloaded))
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Run one capture cycle.
    ///
    /// Returns the cycle as JSON and the annotated frame as PNG bytes.
    async fn capture(&self, actor_id: i64) -> zbus::fdo::Result<(String, Vec<u8>)> {
        tracing::info!(actor_id, "capture requested");
        let gallery = self.state.gallery.read().await.clone();
        let report = self
            .state
            .engine
            .capture(gallery, actor(actor_id))
            .await
            .map_err(|e| failed("capture", e))?;
        Ok((capture_json(&report).to_string(), report.png))
    }

    /// Register the pending unknown face as a new student.
    async fn register_pending(
        &self,
        roll_no: &str,
        name: &str,
        class: &str,
        section: &str,
        email: &str,
    ) -> zbus::fdo::Result<(bool, String)> {
        tracing::info!(roll_no, "register_pending requested");
        let form = RegistrationForm {
            roll_no: roll_no.to_string(),
            name: name.to_string(),
            class: class.to_string(),
            section: section.to_string(),
            email: email.to_string(),
        };
        let outcome = self
            .state
            .engine
            .register(form)
            .await
            .map_err(|e| failed("register_pending", e))?;

        Ok(registered_reply(&self.state, outcome).await)
    }

    /// Discard the pending unknown face. Returns false if none was pending.
    async fn abandon_pending(&self) -> zbus::fdo::Result<bool> {
        self.state
            .engine
            .abandon_pending()
            .await
            .map_err(|e| failed("abandon_pending", e))
    }

    /// Reload the gallery from the store. Returns the number of entries.
    async fn reload_gallery(&self) -> zbus::fdo::Result<u32> {
        let n = self
            .state
            .reload_gallery()
            .await
            .map_err(|e| failed("reload_gallery", e))?;
        Ok(n as u32)
    }

    /// Forget today's marks for this session. A pending face is kept.
    async fn reset_session(&self) -> zbus::fdo::Result<()> {
        self.state
            .engine
            .reset_session()
            .await
            .map_err(|e| failed("reset_session", e))
    }

    /// Record attendance by hand. Not deduplicated against existing rows.
    async fn mark_manual(&self, identity_id: i64, date: &str, status: &str, actor_id: i64) -> zbus::fdo::Result<i64> {
        let date = chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .map_err(|e| invalid(format!("invalid date {date:?}: {e}")))?;
        let status: AttendanceStatus = status.parse().map_err(|e| invalid(format!("{e}")))?;

        let state = &self.state;
        if state
            .store
            .student(identity_id)
            .await
            .map_err(|e| failed("mark_manual", e))?
            .is_none()
        {
            return Err(invalid(format!("no student with id {identity_id}")));
        }

        let record = NewAttendance {
            identity_id,
            date,
            time: chrono::Local::now().time(),
            status,
            marked_by: actor(actor_id),
        };
        let id = state
            .store
            .insert_attendance(&record)
            .await
            .map_err(|e| failed("mark_manual", e))?;
        tracing::info!(identity_id, %date, %status, record = id, "manual attendance recorded");
        Ok(id)
    }

    /// Students as JSON, filtered by class and section (empty = any).
    async fn list_students(&self, class: &str, section: &str) -> zbus::fdo::Result<String> {
        let students = self
            .state
            .store
            .list_students(non_empty(class), non_empty(section))
            .await
            .map_err(|e| failed("list_students", e))?;
        to_json(&students)
    }

    async fn update_student(
        &self,
        id: i64,
        roll_no: &str,
        name: &str,
        class: &str,
        section: &str,
        email: &str,
    ) -> zbus::fdo::Result<bool> {
        let (roll_no, name) = (roll_no.trim(), name.trim());
        if roll_no.is_empty() || name.is_empty() {
            return Err(invalid("roll number and name are required"));
        }
        let student = NewIdentity {
            roll_no: roll_no.to_string(),
            name: name.to_string(),
            class: class.trim().to_string(),
            section: section.trim().to_string(),
            email: email.trim().to_string(),
        };
        let updated = self
            .state
            .store
            .update_student(id, student)
            .await
            .map_err(|e| failed("update_student", e))?;
        if updated {
            // Names are part of the gallery snapshot.
            self.state
                .reload_gallery()
                .await
                .map_err(|e| failed("update_student", e))?;
        }
        Ok(updated)
    }

    /// Delete a student and reload the gallery.
    async fn delete_student(&self, id: i64, delete_attendance: bool) -> zbus::fdo::Result<bool> {
        tracing::info!(id, delete_attendance, "delete_student requested");
        let removed = self
            .state
            .store
            .delete_student(id, delete_attendance)
            .await
            .map_err(|e| failed("delete_student", e))?;
        if removed {
            self.state
                .reload_gallery()
                .await
                .map_err(|e| failed("delete_student", e))?;
        }
        Ok(removed)
    }

    /// Drop every stored embedding and reload the (now empty) gallery.
    async fn clear_embeddings(&self) -> zbus::fdo::Result<u64> {
        let cleared = self
            .state
            .store
            .clear_embeddings()
            .await
            .map_err(|e| failed("clear_embeddings", e))?;
        self.state
            .reload_gallery()
            .await
            .map_err(|e| failed("clear_embeddings", e))?;
        tracing::warn!(cleared, "all embeddings cleared");
        Ok(cleared)
    }

    /// Attendance report as JSON. `filter_json` may be empty.
    async fn report(&self, filter_json: &str) -> zbus::fdo::Result<String> {
        let filter: ReportFilter = if filter_json.trim().is_empty() {
            ReportFilter::default()
        } else {
            serde_json::from_str(filter_json).map_err(|e| invalid(format!("invalid filter: {e}")))?
        };
        let report = self
            .state
            .store
            .report(filter)
            .await
            .map_err(|e| failed("report", e))?;
        to_json(&report)
    }

    async fn update_attendance(&self, record_id: i64, status: &str) -> zbus::fdo::Result<bool> {
        let status: AttendanceStatus = status.parse().map_err(|e| invalid(format!("{e}")))?;
        self.state
            .store
            .update_attendance_status(record_id, status)
            .await
            .map_err(|e| failed("update_attendance", e))
    }

    async fn delete_attendance(&self, record_id: i64) -> zbus::fdo::Result<bool> {
        self.state
            .store
            .delete_attendance(record_id)
            .await
            .map_err(|e| failed("delete_attendance", e))
    }

    /// Return daemon status information as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let state = &self.state;
        let (students, with_embedding) = state.store.count_students().await.unwrap_or((0, 0));
        let gallery = state.gallery.read().await.len();
        let session = state.engine.session().await.map_err(|e| failed("status", e))?;

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": state.config.camera_device,
            "students": students,
            "students_with_embedding": with_embedding,
            "gallery_entries": gallery,
            "match_threshold": state.config.match_threshold,
            "motion_threshold": state.config.motion_threshold,
            "session": session,
        })
        .to_string())
    }
}
