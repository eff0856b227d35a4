use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Employment status. Inactive employees stay on record but cannot punch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmployeeStatus {
    #[default]
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employee {
    pub id: u32,
    pub name: String,
    pub email: String,
    pub department: String,
    pub position: String,
    pub status: EmployeeStatus,
}

impl Employee {
    /// Case-insensitive substring match over name, email, department and position.
    pub fn matches(&self, term: &str) -> bool {
        let term = term.trim().to_lowercase();
        if term.is_empty() {
            return true;
        }
        [&self.name, &self.email, &self.department, &self.position]
            .iter()
            .any(|field| field.to_lowercase().contains(&term))
    }

    /// Apply the fields present in `update`.
    pub fn apply(&mut self, update: EmployeeUpdate) {
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(email) = update.email {
            self.email = email;
        }
        if let Some(department) = update.department {
            self.department = department;
        }
        if let Some(position) = update.position {
            self.position = position;
        }
        if let Some(status) = update.status {
            self.status = status;
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyName);
        }
        let email = self.email.trim();
        match email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
            _ => Err(ValidationError::InvalidEmail(self.email.clone())),
        }
    }
}

/// Fields for a new employee. `id` is assigned when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewEmployee {
    #[serde(default)]
    pub id: Option<u32>,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub department: String,
    #[serde(default)]
    pub position: String,
    #[serde(default)]
    pub status: EmployeeStatus,
}

impl NewEmployee {
    pub fn into_employee(self, id: u32) -> Employee {
        Employee {
            id,
            name: self.name.trim().to_string(),
            email: self.email.trim().to_string(),
            department: self.department,
            position: self.position,
            status: self.status,
        }
    }
}

/// Partial update; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmployeeUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub position: Option<String>,
    #[serde(default)]
    pub status: Option<EmployeeStatus>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("employee name must not be empty")]
    EmptyName,
    #[error("invalid email address: {0:?}")]
    InvalidEmail(String),
}

/// One still image captured under a pose prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceSample {
    pub prompt: String,
    /// JPEG bytes; base64 in JSON.
    #[serde(with = "base64_bytes")]
    pub image: Vec<u8>,
}

/// How samples were processed before storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingInfo {
    pub image_size: u32,
    pub format: String,
}

/// The stored enrollment for one employee. At most one per employee.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceEnrollment {
    pub employee_id: u32,
    pub samples: Vec<FaceSample>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub processing_info: Option<ProcessingInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PunchKind {
    In,
    Out,
}

impl std::fmt::Display for PunchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PunchKind::In => f.write_str("in"),
            PunchKind::Out => f.write_str("out"),
        }
    }
}

impl std::str::FromStr for PunchKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "in" | "check-in" => Ok(PunchKind::In),
            "out" | "check-out" => Ok(PunchKind::Out),
            other => Err(format!("unknown punch kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
}

impl std::str::FromStr for AttendanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "present" | "on-time" => Ok(AttendanceStatus::Present),
            "late" => Ok(AttendanceStatus::Late),
            "absent" => Ok(AttendanceStatus::Absent),
            other => Err(format!("unknown attendance status: {other}")),
        }
    }
}

/// A single check-in or check-out. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendancePunch {
    pub id: Uuid,
    pub employee_id: u32,
    pub employee_name: String,
    pub timestamp: DateTime<Local>,
    pub kind: PunchKind,
    pub status: AttendanceStatus,
}

/// Most recent punch, kept separately for duplicate-punch debouncing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastPunch {
    pub employee_id: u32,
    pub name: String,
    pub timestamp: DateTime<Local>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        // Accept data URLs as produced by browser canvases.
        let payload = match encoded.split_once(',') {
            Some((prefix, data)) if prefix.starts_with("data:") => data,
            _ => encoded.as_str(),
        };
        STANDARD
            .decode(payload)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn employee() -> Employee {
        Employee {
            id: 3,
            name: "Robert Johnson".into(),
            email: "robert@example.com".into(),
            department: "Engineering".into(),
            position: "Senior Developer".into(),
            status: EmployeeStatus::Active,
        }
    }

    #[test]
    fn test_employee_search() {
        let e = employee();
        assert!(e.matches("robert"));
        assert!(e.matches("ENGINEER"));
        assert!(e.matches("senior dev"));
        assert!(e.matches(""));
        assert!(!e.matches("marketing"));
    }

    #[test]
    fn test_employee_validation() {
        let mut e = employee();
        assert!(e.validate().is_ok());
        e.email = "not-an-email".into();
        assert!(matches!(e.validate(), Err(ValidationError::InvalidEmail(_))));
        e.email = "a@b.io".into();
        e.name = "   ".into();
        assert_eq!(e.validate(), Err(ValidationError::EmptyName));
    }

    #[test]
    fn test_employee_partial_update() {
        let mut e = employee();
        e.apply(EmployeeUpdate {
            position: Some("Staff Engineer".into()),
            status: Some(EmployeeStatus::Inactive),
            ..Default::default()
        });
        assert_eq!(e.position, "Staff Engineer");
        assert_eq!(e.status, EmployeeStatus::Inactive);
        assert_eq!(e.name, "Robert Johnson");
    }

    #[test]
    fn test_sample_image_is_base64_in_json() {
        let sample = FaceSample {
            prompt: "center".into(),
            image: vec![0xFF, 0xD8, 0xFF, 0xD9],
        };
        let json = serde_json::to_value(&sample).unwrap();
        assert_eq!(json["image"], "/9j/2Q==");

        let back: FaceSample = serde_json::from_value(json).unwrap();
        assert_eq!(back, sample);
    }

    #[test]
    fn test_sample_accepts_data_url() {
        let json = r#"{"prompt":"left","image":"data:image/jpeg;base64,/9j/2Q=="}"#;
        let sample: FaceSample = serde_json::from_str(json).unwrap();
        assert_eq!(sample.image, vec![0xFF, 0xD8, 0xFF, 0xD9]);
    }

    #[test]
    fn test_punch_kind_parse() {
        assert_eq!("IN".parse::<PunchKind>(), Ok(PunchKind::In));
        assert_eq!("check-out".parse::<PunchKind>(), Ok(PunchKind::Out));
        assert!("sideways".parse::<PunchKind>().is_err());
    }
}
