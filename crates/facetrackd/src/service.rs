//! Attendance operations behind the D-Bus surface.
//!
//! The record store sits behind a `std::sync::Mutex` and is only touched
//! from the blocking pool via [`AttendanceService::with_store`], so SQLite
//! I/O never runs on an async worker and the lock is never held across an
//! await.

use crate::config::RecognitionMode;
use crate::engine::{EngineError, EngineHandle};
use crate::recognition::Recognizer;
use crate::remote::{EnrollPayload, ServiceStats};
use crate::session::EnrollmentProgress;
use crate::store::{RecordStore, StoreError};
use chrono::{DateTime, Local, NaiveDate, Utc};
use facetrack_core::{
    AttendancePunch, AttendanceRules, DailyOverview, Employee, EmployeeStatus, EmployeeUpdate,
    EnrolledIdentity, FaceEnrollment, ManualEntry, MonthlySummary, NewEmployee, ProcessingInfo,
    PunchError, PunchKind, RecognitionOutcome, ValidationError,
};
use facetrack_hw::frame::SAMPLE_IMAGE_SIZE;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("employee {0} not found")]
    NotFound(u32),
    #[error("employee {0} already exists")]
    DuplicateId(u32),
    #[error("employee {0} is inactive")]
    Inactive(u32),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Punch(#[from] PunchError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("record store: {0}")]
    Store(#[from] StoreError),
    #[error("record store lock poisoned")]
    Poisoned,
    #[error("record store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Employee with a short view of their enrollment.
#[derive(Debug, Clone, Serialize)]
pub struct EmployeeDetails {
    #[serde(flatten)]
    pub employee: Employee,
    pub enrollment: Option<EnrollmentInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentInfo {
    pub samples: usize,
    pub prompts: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnrollmentReport {
    pub employee_id: u32,
    pub samples: usize,
    pub timestamp: DateTime<Utc>,
    /// Confirmation from the recognition service, when it accepted the samples.
    pub remote: Option<String>,
    /// Why the push to the recognition service failed, if it did.
    pub remote_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckInReport {
    pub outcome: RecognitionOutcome,
    pub punch: Option<AttendancePunch>,
    /// Why no punch was recorded for a recognized employee.
    pub punch_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub version: &'static str,
    pub camera: String,
    pub camera_busy: bool,
    pub enrolling: bool,
    pub employees: usize,
    pub enrollments: usize,
    pub punches: usize,
    pub recognition_mode: RecognitionMode,
    pub recognition_url: Option<String>,
    pub recognition_available: Option<bool>,
    pub recognition_stats: Option<ServiceStats>,
}

pub struct AttendanceService {
    store: Arc<Mutex<RecordStore>>,
    engine: EngineHandle,
    recognizer: Recognizer,
    rules: AttendanceRules,
}

impl AttendanceService {
    pub fn new(
        store: RecordStore,
        engine: EngineHandle,
        recognizer: Recognizer,
        rules: AttendanceRules,
    ) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            engine,
            recognizer,
            rules,
        }
    }

    /// Run `f` with the store locked, on the blocking pool. Everything `f`
    /// does happens under one lock, so reads and writes in it are atomic
    /// with respect to other store calls.
    async fn with_store<T, F>(&self, f: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(&RecordStore) -> Result<T, ServiceError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            let store = store.lock().map_err(|_| ServiceError::Poisoned)?;
            f(&store)
        })
        .await?
    }

    // Employees

    pub async fn add_employee(&self, new: NewEmployee) -> Result<Employee, ServiceError> {
        let employee = self
            .with_store(move |store| {
                let id = match new.id {
                    Some(id) if store.employee(id)?.is_some() => {
                        return Err(ServiceError::DuplicateId(id))
                    }
                    Some(id) => id,
                    None => store.next_employee_id()?,
                };
                let employee = new.into_employee(id);
                employee.validate()?;
                store.save_employee(&employee)?;
                Ok(employee)
            })
            .await?;
        tracing::info!(id = employee.id, name = %employee.name, "employee added");
        Ok(employee)
    }

    pub async fn update_employee(&self, id: u32, update: EmployeeUpdate) -> Result<Employee, ServiceError> {
        let employee = self
            .with_store(move |store| {
                let mut employee = store.employee(id)?.ok_or(ServiceError::NotFound(id))?;
                employee.apply(update);
                employee.validate()?;
                store.save_employee(&employee)?;
                Ok(employee)
            })
            .await?;
        tracing::info!(id, "employee updated");
        Ok(employee)
    }

    /// Remove the employee and their enrollment, then ask the recognition
    /// service to forget them. The remote call is best effort.
    pub async fn delete_employee(&self, id: u32) -> Result<(), ServiceError> {
        let existed = self.with_store(move |store| Ok(store.delete_employee(id)?)).await?;
        if !existed {
            return Err(ServiceError::NotFound(id));
        }
        tracing::info!(id, "employee deleted");

        if let Some(remote) = self.recognizer.remote() {
            if let Err(e) = remote.delete_employee(id).await {
                tracing::warn!(id, error = %e, "recognition service did not drop employee");
            }
        }
        Ok(())
    }

    pub async fn employee(&self, id: u32) -> Result<EmployeeDetails, ServiceError> {
        self.with_store(move |store| {
            let employee = store.employee(id)?.ok_or(ServiceError::NotFound(id))?;
            let enrollment = store.enrollment(id)?.map(|e| EnrollmentInfo {
                samples: e.samples.len(),
                prompts: e.samples.into_iter().map(|s| s.prompt).collect(),
                timestamp: e.timestamp,
            });
            Ok(EmployeeDetails {
                employee,
                enrollment,
            })
        })
        .await
    }

    /// All employees, optionally filtered by a case-insensitive search term.
    pub async fn employees(&self, search: Option<&str>) -> Result<Vec<Employee>, ServiceError> {
        let mut all = self.with_store(|store| Ok(store.employees()?)).await?;
        if let Some(term) = search {
            all.retain(|e| e.matches(term));
        }
        all.sort_by_key(|e| e.id);
        Ok(all)
    }

    // Enrollment

    /// Capture a fresh set of samples for `id` and store them, replacing any
    /// earlier enrollment.
    ///
    /// The employee is checked again when the samples are saved. If they were
    /// deleted while the camera ran, the samples are dropped, nothing is sent
    /// to the recognition service and the call fails with `NotFound`.
    pub async fn enroll(
        &self,
        id: u32,
        prompts: Option<Vec<String>>,
    ) -> Result<EnrollmentReport, ServiceError> {
        let employee = self
            .with_store(move |store| store.employee(id)?.ok_or(ServiceError::NotFound(id)))
            .await?;
        tracing::info!(id, name = %employee.name, "enrollment requested");

        let capture = self.engine.enroll(prompts).await?;
        let enrollment = FaceEnrollment {
            employee_id: id,
            samples: capture.samples,
            timestamp: capture.completed_at,
            processing_info: Some(ProcessingInfo {
                image_size: SAMPLE_IMAGE_SIZE,
                format: "JPEG".into(),
            }),
        };
        let saved = self
            .with_store(move |store| {
                let employee = store.employee(id)?.ok_or(ServiceError::NotFound(id))?;
                store.save_enrollment(&enrollment)?;
                Ok((employee, enrollment))
            })
            .await;
        let (employee, enrollment) = match saved {
            Ok(saved) => saved,
            Err(ServiceError::NotFound(id)) => {
                tracing::warn!(id, "employee deleted during enrollment; samples discarded");
                return Err(ServiceError::NotFound(id));
            }
            Err(e) => return Err(e),
        };
        tracing::info!(id, samples = enrollment.samples.len(), "enrollment stored");

        let mut report = EnrollmentReport {
            employee_id: id,
            samples: enrollment.samples.len(),
            timestamp: enrollment.timestamp,
            remote: None,
            remote_error: None,
        };
        if let Some(remote) = self.recognizer.remote() {
            let payload = EnrollPayload {
                employee_id: id,
                employee_name: &employee.name,
                department: &employee.department,
                position: &employee.position,
                samples: &enrollment.samples,
            };
            match remote.enroll(payload).await {
                Ok(message) => report.remote = Some(message),
                Err(e) => {
                    tracing::warn!(id, error = %e, "recognition service enrollment failed; kept locally");
                    report.remote_error = Some(e.to_string());
                }
            }
        }
        Ok(report)
    }

    pub fn cancel_enrollment(&self) -> bool {
        self.engine.cancel()
    }

    pub fn enrollment_progress(&self) -> EnrollmentProgress {
        self.engine.progress()
    }

    // Recognition and punches

    /// Capture a frame and identify it. Camera problems are errors; the
    /// recognition itself always resolves to an outcome.
    pub async fn recognize(&self) -> Result<RecognitionOutcome, ServiceError> {
        let jpeg = self.engine.capture().await?;
        let enrolled = self.enrolled_identities().await?;
        let outcome = self.recognizer.recognize(&jpeg, &enrolled).await;
        tracing::info!(?outcome, "recognition finished");
        Ok(outcome)
    }

    async fn enrolled_identities(&self) -> Result<Vec<EnrolledIdentity>, ServiceError> {
        self.with_store(|store| {
            let employees = store.employees()?;
            Ok(store
                .enrollments()?
                .iter()
                .filter_map(|enrollment| {
                    employees
                        .iter()
                        .find(|e| e.id == enrollment.employee_id && e.status == EmployeeStatus::Active)
                        .map(|e| EnrolledIdentity {
                            employee_id: e.id,
                            name: e.name.clone(),
                        })
                })
                .collect())
        })
        .await
    }

    pub async fn punch(&self, id: u32, kind: Option<PunchKind>) -> Result<AttendancePunch, ServiceError> {
        self.punch_at(id, kind, Local::now()).await
    }

    /// Record a punch at `now`. The direction alternates when `kind` is `None`.
    pub async fn punch_at(
        &self,
        id: u32,
        kind: Option<PunchKind>,
        now: DateTime<Local>,
    ) -> Result<AttendancePunch, ServiceError> {
        let rules = self.rules.clone();
        let punch = self
            .with_store(move |store| {
                let employee = store.employee(id)?.ok_or(ServiceError::NotFound(id))?;
                if employee.status == EmployeeStatus::Inactive {
                    return Err(ServiceError::Inactive(id));
                }
                rules.check_debounce(store.last_punch()?.as_ref(), id, now)?;

                let punches = store.punches()?;
                let kind = kind.unwrap_or_else(|| rules.next_kind(&punches, id, now));
                let punch = AttendancePunch {
                    id: Uuid::new_v4(),
                    employee_id: id,
                    employee_name: employee.name,
                    timestamp: now,
                    kind,
                    status: rules.status_for(kind, &punches, id, now),
                };
                store.append_punch(&punch)?;
                Ok(punch)
            })
            .await?;
        tracing::info!(id, kind = %punch.kind, status = ?punch.status, "punch recorded");
        Ok(punch)
    }

    /// Record a hand-entered day for an employee. Manual entries skip the
    /// duplicate-punch check and do not count as the last punch.
    pub async fn record_manual(&self, entry: ManualEntry) -> Result<Vec<AttendancePunch>, ServiceError> {
        let rules = self.rules.clone();
        let punches = self
            .with_store(move |store| {
                let id = entry.employee_id;
                let employee = store.employee(id)?.ok_or(ServiceError::NotFound(id))?;
                let punches = rules.manual_punches(&entry, &employee.name)?;
                store.append_manual_punches(&punches)?;
                Ok(punches)
            })
            .await?;
        if let Some(first) = punches.first() {
            tracing::info!(
                id = first.employee_id,
                date = %first.timestamp.date_naive(),
                status = ?first.status,
                punches = punches.len(),
                "manual attendance recorded"
            );
        }
        Ok(punches)
    }

    /// Recognize whoever is in front of the camera and punch for them.
    ///
    /// A rejected punch (too soon, inactive) does not hide the recognition
    /// result; it is reported in `punch_error` instead.
    pub async fn check_in(&self, kind: Option<PunchKind>) -> Result<CheckInReport, ServiceError> {
        let outcome = self.recognize().await?;
        let mut report = CheckInReport {
            outcome,
            punch: None,
            punch_error: None,
        };
        if let Some(id) = report.outcome.employee_id() {
            match self.punch(id, kind).await {
                Ok(punch) => report.punch = Some(punch),
                Err(e) => {
                    tracing::warn!(id, error = %e, "recognized but no punch recorded");
                    report.punch_error = Some(e.to_string());
                }
            }
        }
        Ok(report)
    }

    /// Punches, newest first, optionally for one employee.
    pub async fn attendance(&self, employee_id: Option<u32>) -> Result<Vec<AttendancePunch>, ServiceError> {
        let mut punches = self.with_store(|store| Ok(store.punches()?)).await?;
        if let Some(id) = employee_id {
            punches.retain(|p| p.employee_id == id);
        }
        punches.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(punches)
    }

    pub async fn monthly_summary(&self, id: u32, year: i32, month: u32) -> Result<MonthlySummary, ServiceError> {
        let rules = self.rules.clone();
        self.with_store(move |store| {
            if store.employee(id)?.is_none() {
                return Err(ServiceError::NotFound(id));
            }
            let punches = store.punches()?;
            let today = Local::now().date_naive();
            Ok(rules.monthly_summary(&punches, id, year, month, today)?)
        })
        .await
    }

    /// Present, late and absent counts for `date` across active employees.
    pub async fn daily_overview(&self, date: NaiveDate) -> Result<DailyOverview, ServiceError> {
        let rules = self.rules.clone();
        self.with_store(move |store| {
            let active: Vec<u32> = store
                .employees()?
                .iter()
                .filter(|e| e.status == EmployeeStatus::Active)
                .map(|e| e.id)
                .collect();
            Ok(rules.daily_overview(&store.punches()?, &active, date))
        })
        .await
    }

    pub async fn status(&self) -> Result<ServiceStatus, ServiceError> {
        let (employees, enrollments, punches) = self
            .with_store(|store| {
                Ok((
                    store.employees()?.len(),
                    store.enrollments()?.len(),
                    store.punches()?.len(),
                ))
            })
            .await?;

        let remote = self.recognizer.remote();
        let (available, stats) = match remote {
            Some(remote) => {
                let healthy = remote.health().await;
                let stats = if healthy {
                    remote
                        .stats()
                        .await
                        .map_err(|e| tracing::debug!(error = %e, "stats unavailable"))
                        .ok()
                } else {
                    None
                };
                (Some(healthy), stats)
            }
            None => (None, None),
        };

        Ok(ServiceStatus {
            version: env!("CARGO_PKG_VERSION"),
            camera: self.engine.device().to_string(),
            camera_busy: self.engine.is_busy(),
            enrolling: self.engine.is_enrolling(),
            employees,
            enrollments,
            punches,
            recognition_mode: self.recognizer.mode(),
            recognition_url: remote.map(|r| r.base_url().to_string()),
            recognition_available: available,
            recognition_stats: stats,
        })
    }
}
