//! Attendance rules: punch status, punch direction, debouncing and
//! monthly summaries.

use crate::types::{AttendancePunch, AttendanceStatus, LastPunch, PunchKind};
use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, NaiveTime, TimeZone, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PunchError {
    #[error("employee {employee_id} already punched {seconds_ago}s ago")]
    TooSoon { employee_id: u32, seconds_ago: i64 },
    #[error("invalid month {year}-{month:02}")]
    InvalidMonth { year: i32, month: u32 },
    #[error("check-out {check_out} must be after check-in {check_in}")]
    CheckOutBeforeCheckIn { check_in: NaiveTime, check_out: NaiveTime },
    #[error("manual entries record a visit; absence is a day without a check-in")]
    ManualAbsent,
    #[error("{date} {time} does not exist in the local time zone")]
    NonexistentTime { date: NaiveDate, time: NaiveTime },
}

#[derive(Debug, Clone)]
pub struct AttendanceRules {
    /// Check-ins after this time (plus grace) are late.
    pub expected_check_in: NaiveTime,
    pub grace: Duration,
    /// Minimum gap between two punches by the same employee.
    pub debounce: Duration,
}

impl Default for AttendanceRules {
    fn default() -> Self {
        Self {
            expected_check_in: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
            grace: Duration::zero(),
            debounce: Duration::seconds(60),
        }
    }
}

/// Attendance counts for one employee and calendar month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonthlySummary {
    pub employee_id: u32,
    pub year: i32,
    pub month: u32,
    pub present: u32,
    pub late: u32,
    pub absent: u32,
    pub total_working_days: u32,
    pub weeks: Vec<WeekSummary>,
}

/// A check-in (and optional check-out) entered by hand for a past or present day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualEntry {
    pub employee_id: u32,
    pub date: NaiveDate,
    pub check_in: NaiveTime,
    #[serde(default)]
    pub check_out: Option<NaiveTime>,
    /// Overrides the status derived from the check-in time.
    #[serde(default)]
    pub status: Option<AttendanceStatus>,
}

/// Present, late and absent counts across employees for one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyOverview {
    pub date: NaiveDate,
    pub total: u32,
    pub present: u32,
    pub late: u32,
    pub absent: u32,
}

/// Counts for days 1–7, 8–14, … of the month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WeekSummary {
    pub week: u32,
    pub on_time: u32,
    pub late: u32,
    pub absent: u32,
}

impl AttendanceRules {
    pub fn status_for_check_in(&self, at: NaiveTime) -> AttendanceStatus {
        let deadline = self.expected_check_in + self.grace;
        // `NaiveTime + Duration` wraps at midnight; a grace that wraps means never late.
        if deadline < self.expected_check_in || at <= deadline {
            AttendanceStatus::Present
        } else {
            AttendanceStatus::Late
        }
    }

    /// Direction for an unspecified punch: out if today's latest punch was in.
    pub fn next_kind(
        &self,
        punches: &[AttendancePunch],
        employee_id: u32,
        now: DateTime<Local>,
    ) -> PunchKind {
        let today = now.date_naive();
        let latest = punches
            .iter()
            .filter(|p| p.employee_id == employee_id && p.timestamp.date_naive() == today)
            .max_by_key(|p| p.timestamp);
        match latest {
            Some(p) if p.kind == PunchKind::In => PunchKind::Out,
            _ => PunchKind::In,
        }
    }

    /// Status recorded on a new punch. Check-outs inherit the day's check-in status.
    pub fn status_for(
        &self,
        kind: PunchKind,
        punches: &[AttendancePunch],
        employee_id: u32,
        now: DateTime<Local>,
    ) -> AttendanceStatus {
        match kind {
            PunchKind::In => self.status_for_check_in(now.time()),
            PunchKind::Out => first_check_in(punches, employee_id, now.date_naive())
                .map(|p| p.status)
                .unwrap_or(AttendanceStatus::Present),
        }
    }

    /// Reject a punch by the employee who punched last, inside the debounce window.
    pub fn check_debounce(
        &self,
        last: Option<&LastPunch>,
        employee_id: u32,
        now: DateTime<Local>,
    ) -> Result<(), PunchError> {
        let Some(last) = last else {
            return Ok(());
        };
        if last.employee_id != employee_id {
            return Ok(());
        }
        let elapsed = now.signed_duration_since(last.timestamp);
        if elapsed < self.debounce {
            return Err(PunchError::TooSoon {
                employee_id,
                seconds_ago: elapsed.num_seconds().max(0),
            });
        }
        Ok(())
    }

    /// Summarize working days (Mon–Fri) of `year-month` up to and including `today`.
    pub fn monthly_summary(
        &self,
        punches: &[AttendancePunch],
        employee_id: u32,
        year: i32,
        month: u32,
        today: NaiveDate,
    ) -> Result<MonthlySummary, PunchError> {
        let first =
            NaiveDate::from_ymd_opt(year, month, 1).ok_or(PunchError::InvalidMonth { year, month })?;

        let mut summary = MonthlySummary {
            employee_id,
            year,
            month,
            present: 0,
            late: 0,
            absent: 0,
            total_working_days: 0,
            weeks: Vec::new(),
        };

        let mut day = first;
        while day.month() == month && day <= today {
            if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
                let week = (day.day() - 1) / 7 + 1;
                if summary.weeks.last().map(|w| w.week) != Some(week) {
                    summary.weeks.push(WeekSummary {
                        week,
                        on_time: 0,
                        late: 0,
                        absent: 0,
                    });
                }
                let status = first_check_in(punches, employee_id, day)
                    .map(|p| p.status)
                    .unwrap_or(AttendanceStatus::Absent);

                summary.total_working_days += 1;
                if let Some(w) = summary.weeks.last_mut() {
                    match status {
                        AttendanceStatus::Present => {
                            summary.present += 1;
                            w.on_time += 1;
                        }
                        AttendanceStatus::Late => {
                            summary.late += 1;
                            w.late += 1;
                        }
                        AttendanceStatus::Absent => {
                            summary.absent += 1;
                            w.absent += 1;
                        }
                    }
                }
            }
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }

        Ok(summary)
    }

    /// Turn a manual entry into punches: a check-in, then the check-out if given.
    pub fn manual_punches(
        &self,
        entry: &ManualEntry,
        employee_name: &str,
    ) -> Result<Vec<AttendancePunch>, PunchError> {
        if entry.status == Some(AttendanceStatus::Absent) {
            return Err(PunchError::ManualAbsent);
        }
        if let Some(check_out) = entry.check_out {
            if check_out <= entry.check_in {
                return Err(PunchError::CheckOutBeforeCheckIn {
                    check_in: entry.check_in,
                    check_out,
                });
            }
        }

        let status = entry
            .status
            .unwrap_or_else(|| self.status_for_check_in(entry.check_in));
        let mut times = vec![(PunchKind::In, entry.check_in)];
        times.extend(entry.check_out.map(|t| (PunchKind::Out, t)));

        times
            .into_iter()
            .map(|(kind, time)| {
                let timestamp = Local
                    .from_local_datetime(&entry.date.and_time(time))
                    .earliest()
                    .ok_or(PunchError::NonexistentTime {
                        date: entry.date,
                        time,
                    })?;
                Ok(AttendancePunch {
                    id: Uuid::new_v4(),
                    employee_id: entry.employee_id,
                    employee_name: employee_name.to_string(),
                    timestamp,
                    kind,
                    status,
                })
            })
            .collect()
    }

    /// Classify each employee in `employee_ids` by their first check-in on `date`.
    pub fn daily_overview(
        &self,
        punches: &[AttendancePunch],
        employee_ids: &[u32],
        date: NaiveDate,
    ) -> DailyOverview {
        let mut overview = DailyOverview {
            date,
            total: 0,
            present: 0,
            late: 0,
            absent: 0,
        };
        for &id in employee_ids {
            overview.total += 1;
            match first_check_in(punches, id, date).map(|p| p.status) {
                Some(AttendanceStatus::Present) => overview.present += 1,
                Some(AttendanceStatus::Late) => overview.late += 1,
                Some(AttendanceStatus::Absent) | None => overview.absent += 1,
            }
        }
        overview
    }
}

fn first_check_in(
    punches: &[AttendancePunch],
    employee_id: u32,
    day: NaiveDate,
) -> Option<&AttendancePunch> {
    punches
        .iter()
        .filter(|p| {
            p.employee_id == employee_id
                && p.kind == PunchKind::In
                && p.timestamp.date_naive() == day
        })
        .min_by_key(|p| p.timestamp)
}
