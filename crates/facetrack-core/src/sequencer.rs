//! Enrollment sample sequencer.
//!
//! A pure state machine: it never touches the camera or the clock. The
//! driver (the daemon's enrollment session) waits, captures, and reports
//! back through the transition functions below.
//!
//! ```text
//! Idle ─start─▶ AwaitingPrompt(k) ─begin_capture─▶ Capturing(k)
//!                    ▲                                 │
//!                    ├──────── record_capture_failure ─┤
//!                    └──────── record_capture (k+1<N) ─┤
//!                                                      └─ record_capture (k+1=N) ─▶ Completed
//! any non-terminal ─cancel─▶ Cancelled     any non-terminal ─fail─▶ Failed
//! ```

use crate::prompts::{normalize_prompts, PromptError};
use crate::types::FaceSample;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "index", rename_all = "snake_case")]
pub enum SequenceState {
    Idle,
    AwaitingPrompt(usize),
    Capturing(usize),
    Completed,
    Cancelled,
    Failed,
}

impl SequenceState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SequenceState::Completed | SequenceState::Cancelled | SequenceState::Failed
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SequenceError {
    #[error("invalid prompts: {0}")]
    Prompts(#[from] PromptError),
    #[error("cannot {action} while {state:?}")]
    InvalidTransition {
        action: &'static str,
        state: SequenceState,
    },
}

/// Samples captured so far out of the prompt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub captured: usize,
    pub total: usize,
}

impl Progress {
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            return 0.0;
        }
        self.captured as f32 / self.total as f32
    }

    /// Whole percent, rounded down. 100 only when every sample is in.
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }
        (self.captured * 100 / self.total) as u8
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.captured == self.total
    }
}

/// Result of a failed capture on the current prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureRetry {
    /// The prompt will be shown again; `attempt` failures so far.
    Retry { attempt: u32 },
    /// Retries exhausted; the sequence is now `Failed`.
    GaveUp,
}

/// All samples from a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrollmentCapture {
    pub samples: Vec<FaceSample>,
    pub completed_at: DateTime<Utc>,
}

pub struct Sequencer {
    prompts: Vec<String>,
    state: SequenceState,
    samples: Vec<FaceSample>,
    max_capture_retries: u32,
    failed_attempts: u32,
    completed_at: Option<DateTime<Utc>>,
    failure: Option<String>,
}

impl Sequencer {
    pub fn new(prompts: Vec<String>, max_capture_retries: u32) -> Result<Self, SequenceError> {
        let prompts = normalize_prompts(prompts)?;
        Ok(Self {
            samples: Vec::with_capacity(prompts.len()),
            prompts,
            state: SequenceState::Idle,
            max_capture_retries,
            failed_attempts: 0,
            completed_at: None,
            failure: None,
        })
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    pub fn progress(&self) -> Progress {
        Progress {
            captured: self.samples.len(),
            total: self.prompts.len(),
        }
    }

    /// Prompt the user should be following right now, if any.
    pub fn current_prompt(&self) -> Option<&str> {
        match self.state {
            SequenceState::AwaitingPrompt(k) | SequenceState::Capturing(k) => {
                self.prompts.get(k).map(String::as_str)
            }
            _ => None,
        }
    }

    /// Why the sequence failed, once it has.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn start(&mut self) -> Result<(), SequenceError> {
        match self.state {
            SequenceState::Idle => {
                self.state = SequenceState::AwaitingPrompt(0);
                Ok(())
            }
            state => Err(SequenceError::InvalidTransition {
                action: "start",
                state,
            }),
        }
    }

    /// The settle delay for the current prompt has elapsed.
    pub fn begin_capture(&mut self) -> Result<usize, SequenceError> {
        match self.state {
            SequenceState::AwaitingPrompt(k) => {
                self.state = SequenceState::Capturing(k);
                Ok(k)
            }
            state => Err(SequenceError::InvalidTransition {
                action: "begin capture",
                state,
            }),
        }
    }

    /// Store the frame for the current prompt and advance.
    pub fn record_capture(&mut self, image: Vec<u8>) -> Result<Progress, SequenceError> {
        let k = match self.state {
            SequenceState::Capturing(k) => k,
            state => {
                return Err(SequenceError::InvalidTransition {
                    action: "record capture",
                    state,
                })
            }
        };

        self.samples.push(FaceSample {
            prompt: self.prompts[k].clone(),
            image,
        });
        self.failed_attempts = 0;

        if k + 1 == self.prompts.len() {
            self.state = SequenceState::Completed;
            self.completed_at = Some(Utc::now());
        } else {
            self.state = SequenceState::AwaitingPrompt(k + 1);
        }
        Ok(self.progress())
    }

    /// The capture for the current prompt produced no usable frame.
    ///
    /// The counter does not advance; the same prompt is awaited again until
    /// `max_capture_retries` consecutive failures, after which the sequence fails.
    pub fn record_capture_failure(&mut self, reason: &str) -> Result<CaptureRetry, SequenceError> {
        let k = match self.state {
            SequenceState::Capturing(k) => k,
            state => {
                return Err(SequenceError::InvalidTransition {
                    action: "record capture failure",
                    state,
                })
            }
        };

        self.failed_attempts += 1;
        if self.failed_attempts > self.max_capture_retries {
            self.fail(format!(
                "prompt {:?} failed {} times: {reason}",
                self.prompts[k], self.failed_attempts
            ))?;
            return Ok(CaptureRetry::GaveUp);
        }

        self.state = SequenceState::AwaitingPrompt(k);
        Ok(CaptureRetry::Retry {
            attempt: self.failed_attempts,
        })
    }

    /// Stop the sequence and discard partial samples.
    pub fn cancel(&mut self) -> Result<usize, SequenceError> {
        if self.state.is_terminal() {
            return Err(SequenceError::InvalidTransition {
                action: "cancel",
                state: self.state,
            });
        }
        let discarded = self.samples.len();
        self.samples.clear();
        self.state = SequenceState::Cancelled;
        Ok(discarded)
    }

    /// Abort with an error and discard partial samples.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), SequenceError> {
        if self.state.is_terminal() {
            return Err(SequenceError::InvalidTransition {
                action: "fail",
                state: self.state,
            });
        }
        self.samples.clear();
        self.failure = Some(reason.into());
        self.state = SequenceState::Failed;
        Ok(())
    }

    /// Hand out the captured samples. Returns `Some` exactly once, after completion.
    pub fn take_completion(&mut self) -> Option<EnrollmentCapture> {
        if self.state != SequenceState::Completed {
            return None;
        }
        let completed_at = self.completed_at.take()?;
        Some(EnrollmentCapture {
            samples: std::mem::take(&mut self.samples),
            completed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts::default_prompts;

    fn prompts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("pose {i}")).collect()
    }

    fn capture_next(seq: &mut Sequencer, byte: u8) -> Progress {
        seq.begin_capture().unwrap();
        seq.record_capture(vec![byte]).unwrap()
    }

    #[test]
    fn test_full_run_yields_one_sample_per_prompt() {
        for n in [1, 2, 5, 19] {
            let mut seq = Sequencer::new(prompts(n), 3).unwrap();
            seq.start().unwrap();

            let mut full_reports = 0;
            for i in 0..n {
                let p = capture_next(&mut seq, i as u8);
                assert_eq!(p.captured, i + 1);
                if p.percent() == 100 {
                    full_reports += 1;
                }
            }

            assert_eq!(full_reports, 1, "100% must be reported exactly once");
            assert_eq!(seq.state(), SequenceState::Completed);
            let done = seq.take_completion().unwrap();
            assert_eq!(done.samples.len(), n);
            assert_eq!(done.samples[n - 1].prompt, format!("pose {}", n - 1));
            assert!(seq.take_completion().is_none());
        }
    }

    #[test]
    fn test_samples_follow_prompt_order() {
        let mut seq = Sequencer::new(default_prompts(), 0).unwrap();
        seq.start().unwrap();
        assert_eq!(seq.current_prompt(), Some("center"));
        capture_next(&mut seq, 0);
        assert_eq!(seq.current_prompt(), Some("slightly right"));
        for i in 1..19 {
            capture_next(&mut seq, i);
        }
        let done = seq.take_completion().unwrap();
        let order: Vec<_> = done.samples.iter().map(|s| s.prompt.as_str()).collect();
        assert_eq!(order, crate::prompts::DEFAULT_PROMPTS.to_vec());
    }

    #[test]
    fn test_cancel_discards_partial_samples() {
        for k in 0..4 {
            let mut seq = Sequencer::new(prompts(4), 3).unwrap();
            seq.start().unwrap();
            for i in 0..k {
                capture_next(&mut seq, i as u8);
            }
            assert_eq!(seq.cancel(), Ok(k));
            assert_eq!(seq.state(), SequenceState::Cancelled);
            assert_eq!(seq.progress().captured, 0);
            assert!(seq.take_completion().is_none());
        }
    }

    #[test]
    fn test_cancel_mid_capture() {
        let mut seq = Sequencer::new(prompts(3), 3).unwrap();
        seq.start().unwrap();
        capture_next(&mut seq, 1);
        seq.begin_capture().unwrap();
        assert_eq!(seq.cancel(), Ok(1));
        assert!(seq.record_capture(vec![2]).is_err());
    }

    #[test]
    fn test_capture_failure_does_not_advance() {
        let mut seq = Sequencer::new(prompts(3), 2).unwrap();
        seq.start().unwrap();
        seq.begin_capture().unwrap();
        assert_eq!(
            seq.record_capture_failure("zero dimensions"),
            Ok(CaptureRetry::Retry { attempt: 1 })
        );
        assert_eq!(seq.state(), SequenceState::AwaitingPrompt(0));
        assert_eq!(seq.progress().captured, 0);

        let p = capture_next(&mut seq, 9);
        assert_eq!(p.captured, 1);
        assert_eq!(seq.state(), SequenceState::AwaitingPrompt(1));
    }

    #[test]
    fn test_retry_budget_resets_after_success() {
        let mut seq = Sequencer::new(prompts(2), 1).unwrap();
        seq.start().unwrap();
        seq.begin_capture().unwrap();
        seq.record_capture_failure("dark").unwrap();
        capture_next(&mut seq, 0);
        seq.begin_capture().unwrap();
        assert_eq!(
            seq.record_capture_failure("dark"),
            Ok(CaptureRetry::Retry { attempt: 1 })
        );
    }

    #[test]
    fn test_retries_exhausted_fails_sequence() {
        let mut seq = Sequencer::new(prompts(3), 1).unwrap();
        seq.start().unwrap();
        capture_next(&mut seq, 0);
        seq.begin_capture().unwrap();
        seq.record_capture_failure("dark").unwrap();
        seq.begin_capture().unwrap();
        assert_eq!(seq.record_capture_failure("dark"), Ok(CaptureRetry::GaveUp));
        assert_eq!(seq.state(), SequenceState::Failed);
        assert_eq!(seq.progress().captured, 0);
        assert!(seq.failure().unwrap().contains("pose 1"));
    }

    #[test]
    fn test_invalid_transitions_leave_state() {
        let mut seq = Sequencer::new(prompts(2), 1).unwrap();
        assert!(seq.begin_capture().is_err());
        assert!(seq.record_capture(vec![]).is_err());
        assert_eq!(seq.state(), SequenceState::Idle);

        seq.start().unwrap();
        assert!(seq.start().is_err());
        assert!(seq.record_capture(vec![]).is_err());
        assert_eq!(seq.state(), SequenceState::AwaitingPrompt(0));

        seq.fail("camera unplugged").unwrap();
        assert!(seq.cancel().is_err());
        assert!(seq.fail("again").is_err());
        assert_eq!(seq.failure(), Some("camera unplugged"));
    }

    #[test]
    fn test_empty_prompts_rejected() {
        assert!(matches!(
            Sequencer::new(vec![], 1),
            Err(SequenceError::Prompts(PromptError::Empty))
        ));
    }

    #[test]
    fn test_progress_math() {
        let p = Progress { captured: 1, total: 3 };
        assert_eq!(p.percent(), 33);
        assert!((p.fraction() - 1.0 / 3.0).abs() < 1e-6);
        assert!(!p.is_complete());
        assert_eq!(Progress { captured: 0, total: 0 }.percent(), 0);
    }
}
