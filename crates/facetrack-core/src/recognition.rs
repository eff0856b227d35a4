//! Recognition outcomes and the placeholder matcher.
//!
//! FaceTrack never compares faces itself. A recognition attempt resolves to
//! one of three outcomes, whichever strategy produced it.

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecognitionOutcome {
    Matched {
        employee_id: u32,
        name: String,
        /// Reported by the delegated service; absent for placeholder picks.
        confidence: Option<f32>,
    },
    NotMatched,
    ServiceUnavailable {
        reason: String,
    },
}

impl RecognitionOutcome {
    pub fn employee_id(&self) -> Option<u32> {
        match self {
            RecognitionOutcome::Matched { employee_id, .. } => Some(*employee_id),
            _ => None,
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, RecognitionOutcome::Matched { .. })
    }
}

/// An employee with a stored enrollment, eligible to be recognized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrolledIdentity {
    pub employee_id: u32,
    pub name: String,
}

/// Pick a pseudo-random enrolled identity without looking at the image.
///
/// Exercises the check-in flow when no recognition service is configured.
/// Not product logic: any enrolled face "matches".
pub fn pick_placeholder<R: Rng + ?Sized>(
    identities: &[EnrolledIdentity],
    rng: &mut R,
) -> RecognitionOutcome {
    if identities.is_empty() {
        return RecognitionOutcome::NotMatched;
    }
    let chosen = &identities[rng.gen_range(0..identities.len())];
    RecognitionOutcome::Matched {
        employee_id: chosen.employee_id,
        name: chosen.name.clone(),
        confidence: None,
    }
}
