use crate::engine::EngineError;
use crate::service::{AttendanceService, ServiceError};
use chrono::{Local, NaiveDate};
use facetrack_core::{EmployeeUpdate, ManualEntry, NewEmployee, PunchKind};
use facetrack_hw::CameraError;
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "org.facetrack.Attendance1";
pub const OBJECT_PATH: &str = "/org/facetrack/Attendance1";

/// D-Bus interface for the FaceTrack attendance daemon.
///
/// Bus name: org.facetrack.Attendance1
/// Object path: /org/facetrack/Attendance1
///
/// Structured arguments and results are JSON strings.
pub struct AttendanceBus {
    service: Arc<AttendanceService>,
}

impl AttendanceBus {
    pub fn new(service: Arc<AttendanceService>) -> Self {
        Self { service }
    }
}

#[interface(name = "org.facetrack.Attendance1")]
impl AttendanceBus {
    /// Add an employee from a JSON object. Returns the stored employee.
    async fn add_employee(&self, employee: &str) -> zbus::fdo::Result<String> {
        let new: NewEmployee = parse_arg(employee)?;
        tracing::info!(name = %new.name, "add_employee requested");
        to_json(&self.service.add_employee(new).await.map_err(to_fdo)?)
    }

    /// Apply a partial update (JSON object) to an employee.
    async fn update_employee(&self, id: u32, update: &str) -> zbus::fdo::Result<String> {
        let update: EmployeeUpdate = parse_arg(update)?;
        tracing::info!(id, "update_employee requested");
        to_json(&self.service.update_employee(id, update).await.map_err(to_fdo)?)
    }

    /// Delete an employee together with their enrollment.
    async fn remove_employee(&self, id: u32) -> zbus::fdo::Result<bool> {
        tracing::info!(id, "remove_employee requested");
        self.service.delete_employee(id).await.map_err(to_fdo)?;
        Ok(true)
    }

    async fn get_employee(&self, id: u32) -> zbus::fdo::Result<String> {
        to_json(&self.service.employee(id).await.map_err(to_fdo)?)
    }

    /// List employees. An empty `search` lists everyone.
    async fn list_employees(&self, search: &str) -> zbus::fdo::Result<String> {
        let search = Some(search.trim()).filter(|s| !s.is_empty());
        to_json(&self.service.employees(search).await.map_err(to_fdo)?)
    }

    /// Run the enrollment sequence for an employee.
    ///
    /// `prompts` is a JSON array of prompt strings, or empty for the defaults.
    async fn enroll(&self, id: u32, prompts: &str) -> zbus::fdo::Result<String> {
        let prompts: Option<Vec<String>> = if prompts.trim().is_empty() {
            None
        } else {
            Some(parse_arg(prompts)?)
        };
        tracing::info!(id, custom_prompts = prompts.is_some(), "enroll requested");
        to_json(&self.service.enroll(id, prompts).await.map_err(to_fdo)?)
    }

    /// Cancel the running enrollment. Returns false if none was running.
    async fn cancel_enrollment(&self) -> zbus::fdo::Result<bool> {
        Ok(self.service.cancel_enrollment())
    }

    async fn enrollment_progress(&self) -> zbus::fdo::Result<String> {
        to_json(&self.service.enrollment_progress())
    }

    /// Capture a frame and identify it, without punching.
    async fn recognize(&self) -> zbus::fdo::Result<String> {
        tracing::info!("recognize requested");
        to_json(&self.service.recognize().await.map_err(to_fdo)?)
    }

    /// Record a punch for an employee. `kind` is "in", "out" or empty for automatic.
    async fn punch(&self, id: u32, kind: &str) -> zbus::fdo::Result<String> {
        let kind = parse_kind(kind)?;
        tracing::info!(id, ?kind, "punch requested");
        to_json(&self.service.punch(id, kind).await.map_err(to_fdo)?)
    }

    /// Record a hand-entered check-in (and optional check-out) from a JSON
    /// object. Returns the punches written.
    async fn record_manual(&self, entry: &str) -> zbus::fdo::Result<String> {
        let entry: ManualEntry = parse_arg(entry)?;
        tracing::info!(id = entry.employee_id, date = %entry.date, "record_manual requested");
        to_json(&self.service.record_manual(entry).await.map_err(to_fdo)?)
    }

    /// Present, late and absent counts for a `YYYY-MM-DD` date, or today when empty.
    async fn daily_overview(&self, date: &str) -> zbus::fdo::Result<String> {
        let date = parse_date(date)?;
        to_json(&self.service.daily_overview(date).await.map_err(to_fdo)?)
    }

    /// Recognize and punch in one step.
    async fn check_in(&self, kind: &str) -> zbus::fdo::Result<String> {
        let kind = parse_kind(kind)?;
        tracing::info!(?kind, "check_in requested");
        to_json(&self.service.check_in(kind).await.map_err(to_fdo)?)
    }

    /// All punches, newest first.
    async fn attendance(&self) -> zbus::fdo::Result<String> {
        to_json(&self.service.attendance(None).await.map_err(to_fdo)?)
    }

    async fn employee_attendance(&self, id: u32) -> zbus::fdo::Result<String> {
        to_json(&self.service.attendance(Some(id)).await.map_err(to_fdo)?)
    }

    async fn monthly_summary(&self, id: u32, year: i32, month: u32) -> zbus::fdo::Result<String> {
        to_json(&self.service.monthly_summary(id, year, month).await.map_err(to_fdo)?)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.service.status().await.map_err(to_fdo)?)
    }
}

fn parse_arg<T: serde::de::DeserializeOwned>(json: &str) -> zbus::fdo::Result<T> {
    serde_json::from_str(json).map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid JSON: {e}")))
}

fn parse_kind(kind: &str) -> zbus::fdo::Result<Option<PunchKind>> {
    let kind = kind.trim();
    if kind.is_empty() || kind.eq_ignore_ascii_case("auto") {
        return Ok(None);
    }
    kind.parse().map(Some).map_err(zbus::fdo::Error::InvalidArgs)
}

fn parse_date(date: &str) -> zbus::fdo::Result<NaiveDate> {
    let date = date.trim();
    if date.is_empty() {
        return Ok(Local::now().date_naive());
    }
    date.parse()
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("invalid date {date:?}: {e}")))
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn to_fdo(e: ServiceError) -> zbus::fdo::Error {
    tracing::warn!(error = %e, "request failed");
    let msg = e.to_string();
    match e {
        ServiceError::NotFound(_)
        | ServiceError::DuplicateId(_)
        | ServiceError::Inactive(_)
        | ServiceError::Validation(_)
        | ServiceError::Punch(_) => zbus::fdo::Error::InvalidArgs(msg),
        ServiceError::Engine(EngineError::Camera(CameraError::PermissionDenied(_))) => {
            zbus::fdo::Error::AccessDenied(msg)
        }
        ServiceError::Engine(EngineError::Busy) => zbus::fdo::Error::LimitsExceeded(msg),
        ServiceError::Engine(EngineError::Prompts(_)) => zbus::fdo::Error::InvalidArgs(msg),
        _ => zbus::fdo::Error::Failed(msg),
    }
}
