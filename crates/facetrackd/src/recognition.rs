//! Recognition strategies.
//!
//! `Recognizer::recognize` never fails: every transport or service problem
//! degrades to `ServiceUnavailable`, or to the placeholder pick when the
//! fallback is enabled.

use crate::config::RecognitionMode;
use crate::remote::RemoteClient;
use facetrack_core::recognition::pick_placeholder;
use facetrack_core::{EnrolledIdentity, RecognitionOutcome};
use std::time::Duration;

pub struct Recognizer {
    mode: RecognitionMode,
    remote: Option<RemoteClient>,
    fallback_to_placeholder: bool,
    recognize_timeout: Duration,
    placeholder_delay: Duration,
}

impl Recognizer {
    pub fn new(
        mode: RecognitionMode,
        remote: Option<RemoteClient>,
        fallback_to_placeholder: bool,
        recognize_timeout: Duration,
        placeholder_delay: Duration,
    ) -> Self {
        if mode == RecognitionMode::Delegated && remote.is_none() {
            tracing::warn!("delegated recognition selected without a service URL; every attempt will be unavailable");
        }
        Self {
            mode,
            remote,
            fallback_to_placeholder,
            recognize_timeout,
            placeholder_delay,
        }
    }

    /// Placeholder-only recognizer with the given artificial delay.
    pub fn placeholder(delay: Duration) -> Self {
        Self::new(RecognitionMode::Placeholder, None, false, Duration::ZERO, delay)
    }

    pub fn mode(&self) -> RecognitionMode {
        self.mode
    }

    pub fn remote(&self) -> Option<&RemoteClient> {
        self.remote.as_ref()
    }

    pub async fn recognize(&self, jpeg: &[u8], enrolled: &[EnrolledIdentity]) -> RecognitionOutcome {
        match self.mode {
            RecognitionMode::Placeholder => self.placeholder_pick(enrolled).await,
            RecognitionMode::Delegated => {
                let outcome = self.delegated(jpeg).await;
                match outcome {
                    RecognitionOutcome::ServiceUnavailable { ref reason }
                        if self.fallback_to_placeholder =>
                    {
                        tracing::warn!(reason = %reason, "recognition service unavailable; using placeholder");
                        self.placeholder_pick(enrolled).await
                    }
                    other => other,
                }
            }
        }
    }

    async fn delegated(&self, jpeg: &[u8]) -> RecognitionOutcome {
        let Some(remote) = &self.remote else {
            return RecognitionOutcome::ServiceUnavailable {
                reason: "no recognition service configured".into(),
            };
        };

        let attempt = async {
            if !remote.health().await {
                return RecognitionOutcome::ServiceUnavailable {
                    reason: format!("health check against {} failed", remote.base_url()),
                };
            }
            match remote.recognize(jpeg).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(error = %e, "delegated recognition failed");
                    RecognitionOutcome::ServiceUnavailable {
                        reason: e.to_string(),
                    }
                }
            }
        };

        match tokio::time::timeout(self.recognize_timeout, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.recognize_timeout.as_millis() as u64,
                    "delegated recognition timed out"
                );
                RecognitionOutcome::ServiceUnavailable {
                    reason: "recognition timed out".into(),
                }
            }
        }
    }

    async fn placeholder_pick(&self, enrolled: &[EnrolledIdentity]) -> RecognitionOutcome {
        if !self.placeholder_delay.is_zero() {
            tokio::time::sleep(self.placeholder_delay).await;
        }
        let outcome = pick_placeholder(enrolled, &mut rand::thread_rng());
        tracing::debug!(enrolled = enrolled.len(), ?outcome, "placeholder recognition");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::stub;

    fn ana() -> Vec<EnrolledIdentity> {
        vec![EnrolledIdentity {
            employee_id: 7,
            name: "Ana".into(),
        }]
    }

    fn delegated(url: &str, fallback: bool) -> Recognizer {
        Recognizer::new(
            RecognitionMode::Delegated,
            Some(RemoteClient::new(
                url,
                Duration::from_secs(2),
                Duration::from_millis(300),
            )),
            fallback,
            Duration::from_secs(3),
            Duration::ZERO,
        )
    }

    #[tokio::test]
    async fn test_placeholder_with_nobody_enrolled() {
        let r = Recognizer::placeholder(Duration::ZERO);
        assert_eq!(r.recognize(&[1], &[]).await, RecognitionOutcome::NotMatched);
        assert_eq!(r.recognize(&[1], &ana()).await.employee_id(), Some(7));
    }

    #[tokio::test]
    async fn test_unavailable_service_resolves() {
        let r = delegated("http://127.0.0.1:9", false);
        let outcome = r.recognize(&[1], &ana()).await;
        assert!(matches!(outcome, RecognitionOutcome::ServiceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_unavailable_service_falls_back() {
        let r = delegated("http://127.0.0.1:9", true);
        let outcome = r.recognize(&[1], &ana()).await;
        assert_eq!(outcome.employee_id(), Some(7));
        let nobody = r.recognize(&[1], &[]).await;
        assert_eq!(nobody, RecognitionOutcome::NotMatched);
    }

    #[tokio::test]
    async fn test_missing_url_is_unavailable() {
        let r = Recognizer::new(
            RecognitionMode::Delegated,
            None,
            false,
            Duration::from_secs(1),
            Duration::ZERO,
        );
        assert!(matches!(
            r.recognize(&[1], &ana()).await,
            RecognitionOutcome::ServiceUnavailable { .. }
        ));
    }

    #[tokio::test]
    async fn test_delegated_trusts_service_answer() {
        let server = stub::serve(vec![
            ("GET /api/health", 200, r#"{"status":"ok"}"#),
            (
                "POST /api/recognize",
                200,
                r#"{"success":true,"person":{"id":"3","name":"Robert Johnson","confidence":0.71}}"#,
            ),
        ])
        .await;
        let r = delegated(&server.url(), true);
        // The service's answer wins even though only Ana is enrolled locally.
        let outcome = r.recognize(&[1], &ana()).await;
        assert_eq!(outcome.employee_id(), Some(3));
    }

    #[tokio::test]
    async fn test_server_error_is_unavailable() {
        let server = stub::serve(vec![
            ("GET /api/health", 200, r#"{"status":"ok"}"#),
            ("POST /api/recognize", 500, r#"{"success":false,"error":"boom"}"#),
        ])
        .await;
        let r = delegated(&server.url(), false);
        assert!(matches!(
            r.recognize(&[1], &ana()).await,
            RecognitionOutcome::ServiceUnavailable { .. }
        ));
    }

    #[tokio::test]
    async fn test_hanging_service_times_out() {
        // Accepts connections but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                held.push(sock);
            }
        });

        let r = Recognizer::new(
            RecognitionMode::Delegated,
            Some(RemoteClient::new(
                &format!("http://{addr}"),
                Duration::from_secs(30),
                Duration::from_secs(30),
            )),
            false,
            Duration::from_millis(200),
            Duration::ZERO,
        );
        let started = std::time::Instant::now();
        let outcome = r.recognize(&[1], &ana()).await;
        assert!(matches!(outcome, RecognitionOutcome::ServiceUnavailable { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
