//! facetrack-core: Attendance domain logic.
//!
//! Employee and attendance records, the enrollment prompt sequence and its
//! state machine, attendance rules, and recognition outcomes. No I/O.

pub mod attendance;
pub mod prompts;
pub mod recognition;
pub mod sequencer;
pub mod types;

pub use attendance::{AttendanceRules, DailyOverview, ManualEntry, MonthlySummary, PunchError};
pub use recognition::{EnrolledIdentity, RecognitionOutcome};
pub use sequencer::{Progress, SequenceState, Sequencer};
pub use types::{
    AttendancePunch, AttendanceStatus, Employee, EmployeeStatus, EmployeeUpdate, FaceEnrollment,
    FaceSample, LastPunch, NewEmployee, ProcessingInfo, PunchKind, ValidationError,
};
