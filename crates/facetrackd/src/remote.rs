//! Client for the external face recognition service.
//!
//! Raw JSON responses are translated into typed results right here; nothing
//! past this module sees the service's wire shapes.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use facetrack_core::{FaceSample, RecognitionOutcome};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("cannot reach recognition service at {url}: {source}")]
    Unreachable { url: String, source: reqwest::Error },
    #[error("recognition service timed out")]
    Timeout,
    #[error("recognition service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected response from recognition service: {0}")]
    Malformed(String),
    #[error("recognition service rejected the request: {0}")]
    Rejected(String),
}

#[derive(Debug, Serialize)]
struct RecognizeRequest<'a> {
    image: &'a str,
}

#[derive(Debug, Deserialize)]
struct RecognizeResponse {
    success: bool,
    #[serde(default)]
    person: Option<Person>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Person {
    id: serde_json::Value,
    name: String,
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnrollRequest<'a> {
    employee_id: u32,
    employee_name: &'a str,
    face_samples: Vec<String>,
    department: &'a str,
    position: &'a str,
}

#[derive(Debug, Deserialize)]
struct EnrollResponse {
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SuccessResponse {
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    success: bool,
    #[serde(default)]
    stats: Option<ServiceStats>,
}

/// Enrollment counts reported by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub total_employees: u64,
    pub total_samples: u64,
}

/// Employee details sent along with enrollment samples.
pub struct EnrollPayload<'a> {
    pub employee_id: u32,
    pub employee_name: &'a str,
    pub department: &'a str,
    pub position: &'a str,
    pub samples: &'a [FaceSample],
}

#[derive(Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    base_url: String,
    health_timeout: Duration,
}

impl RemoteClient {
    pub fn new(base_url: &str, request_timeout: Duration, health_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "custom HTTP client failed; using defaults");
                reqwest::Client::new()
            });
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            health_timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn send_error(&self, e: reqwest::Error) -> RemoteError {
        if e.is_timeout() {
            RemoteError::Timeout
        } else {
            RemoteError::Unreachable {
                url: self.base_url.clone(),
                source: e,
            }
        }
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(RemoteError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn parse<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, RemoteError> {
        resp.json::<T>()
            .await
            .map_err(|e| RemoteError::Malformed(e.to_string()))
    }

    /// GET /api/health with the short health timeout. Any failure means unavailable.
    pub async fn health(&self) -> bool {
        let result = self
            .http
            .get(self.url("/api/health"))
            .timeout(self.health_timeout)
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::warn!(status = resp.status().as_u16(), "recognition service unhealthy");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "recognition service health check failed");
                false
            }
        }
    }

    /// POST /api/recognize with a base64 JPEG.
    ///
    /// Returns `Matched` or `NotMatched`; transport and protocol failures are errors
    /// for the caller to degrade.
    pub async fn recognize(&self, jpeg: &[u8]) -> Result<RecognitionOutcome, RemoteError> {
        let image = STANDARD.encode(jpeg);
        let resp = self
            .http
            .post(self.url("/api/recognize"))
            .json(&RecognizeRequest { image: &image })
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        let resp = Self::check_status(resp).await?;
        let body: RecognizeResponse = Self::parse(resp).await?;
        translate_recognition(body)
    }

    /// POST /api/enroll. Returns the service's confirmation message.
    pub async fn enroll(&self, payload: EnrollPayload<'_>) -> Result<String, RemoteError> {
        let request = EnrollRequest {
            employee_id: payload.employee_id,
            employee_name: payload.employee_name,
            face_samples: payload
                .samples
                .iter()
                .map(|s| STANDARD.encode(&s.image))
                .collect(),
            department: payload.department,
            position: payload.position,
        };
        let resp = self
            .http
            .post(self.url("/api/enroll"))
            .json(&request)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        let resp = Self::check_status(resp).await?;
        let body: EnrollResponse = Self::parse(resp).await?;
        if !body.success {
            return Err(RemoteError::Rejected(
                body.error.unwrap_or_else(|| "unknown enrollment error".into()),
            ));
        }
        Ok(body
            .message
            .unwrap_or_else(|| format!("enrolled {} samples", payload.samples.len())))
    }

    /// DELETE /api/employees/{id}.
    pub async fn delete_employee(&self, employee_id: u32) -> Result<(), RemoteError> {
        let resp = self
            .http
            .delete(self.url(&format!("/api/employees/{employee_id}")))
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        let resp = Self::check_status(resp).await?;
        let body: SuccessResponse = Self::parse(resp).await?;
        if body.success {
            Ok(())
        } else {
            Err(RemoteError::Rejected(body.error.unwrap_or_default()))
        }
    }

    /// GET /api/stats with the health timeout.
    pub async fn stats(&self) -> Result<ServiceStats, RemoteError> {
        let resp = self
            .http
            .get(self.url("/api/stats"))
            .timeout(self.health_timeout)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;
        let resp = Self::check_status(resp).await?;
        let body: StatsResponse = Self::parse(resp).await?;
        match body {
            StatsResponse {
                success: true,
                stats: Some(stats),
            } => Ok(stats),
            _ => Err(RemoteError::Malformed("stats missing".into())),
        }
    }
}

fn translate_recognition(body: RecognizeResponse) -> Result<RecognitionOutcome, RemoteError> {
    if !body.success {
        return Err(RemoteError::Rejected(
            body.error.unwrap_or_else(|| "recognition failed".into()),
        ));
    }
    let Some(person) = body.person else {
        return Ok(RecognitionOutcome::NotMatched);
    };
    // The service keys people by string; ours are numeric.
    let employee_id = match &person.id {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    match employee_id {
        Some(employee_id) => Ok(RecognitionOutcome::Matched {
            employee_id,
            name: person.name,
            confidence: person.confidence,
        }),
        None => Err(RemoteError::Malformed(format!(
            "person id {} is not an employee id",
            person.id
        ))),
    }
}

#[cfg(test)]
pub(crate) mod stub {
    //! Loopback recognition service answering fixed JSON bodies per route.

    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{header, Method, StatusCode, Uri};
    use axum::response::IntoResponse;
    use axum::Router;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};
    use tokio::net::TcpListener;

    pub struct StubServer {
        pub addr: SocketAddr,
        /// Every request seen, as ("METHOD /path", body).
        pub requests: Arc<Mutex<Vec<(String, String)>>>,
    }

    impl StubServer {
        pub fn url(&self) -> String {
            format!("http://{}", self.addr)
        }
    }

    #[derive(Clone)]
    struct StubState {
        routes: Arc<HashMap<String, (u16, &'static str)>>,
        requests: Arc<Mutex<Vec<(String, String)>>>,
    }

    async fn answer(
        State(state): State<StubState>,
        method: Method,
        uri: Uri,
        body: Bytes,
    ) -> impl IntoResponse {
        let route = format!("{method} {}", uri.path());
        state
            .requests
            .lock()
            .unwrap()
            .push((route.clone(), String::from_utf8_lossy(&body).into_owned()));

        let (status, payload) = state.routes.get(&route).copied().unwrap_or((404, "{}"));
        (
            StatusCode::from_u16(status).unwrap(),
            [(header::CONTENT_TYPE, "application/json")],
            payload,
        )
    }

    /// Serve `routes` ("METHOD /path", status, body) until the test ends.
    /// Anything else gets a 404 and is still recorded.
    pub async fn serve(routes: Vec<(&'static str, u16, &'static str)>) -> StubServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = StubState {
            routes: Arc::new(
                routes
                    .into_iter()
                    .map(|(route, status, body)| (route.to_string(), (status, body)))
                    .collect(),
            ),
            requests: Arc::clone(&requests),
        };

        let router = Router::new().fallback(answer).with_state(state);
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        StubServer { addr, requests }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: &str) -> RemoteClient {
        RemoteClient::new(url, Duration::from_secs(2), Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_recognize_match() {
        let server = stub::serve(vec![(
            "POST /api/recognize",
            200,
            r#"{"success":true,"person":{"id":"7","name":"Ana","confidence":0.82}}"#,
        )])
        .await;

        let outcome = client(&server.url()).recognize(&[0xFF, 0xD8]).await.unwrap();
        assert_eq!(
            outcome,
            RecognitionOutcome::Matched {
                employee_id: 7,
                name: "Ana".into(),
                confidence: Some(0.82)
            }
        );

        let requests = server.requests.lock().unwrap();
        let (_, body) = &requests[0];
        let sent: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(sent["image"], "/9g=");
    }

    #[tokio::test]
    async fn test_recognize_no_match() {
        let server = stub::serve(vec![(
            "POST /api/recognize",
            200,
            r#"{"success":true,"person":null,"message":"No match found"}"#,
        )])
        .await;
        let outcome = client(&server.url()).recognize(&[1, 2, 3]).await.unwrap();
        assert_eq!(outcome, RecognitionOutcome::NotMatched);
    }

    #[tokio::test]
    async fn test_recognize_error_status() {
        let server = stub::serve(vec![(
            "POST /api/recognize",
            400,
            r#"{"success":false,"error":"No face detected in image"}"#,
        )])
        .await;
        let err = client(&server.url()).recognize(&[1]).await.unwrap_err();
        assert!(matches!(err, RemoteError::Status { status: 400, .. }), "{err}");
    }

    #[tokio::test]
    async fn test_health_and_unreachable() {
        let server = stub::serve(vec![("GET /api/health", 200, r#"{"status":"ok"}"#)]).await;
        assert!(client(&server.url()).health().await);

        // Nothing listens on the discard port.
        let down = client("http://127.0.0.1:9");
        assert!(!down.health().await);
        assert!(down.recognize(&[1]).await.is_err());
    }

    #[tokio::test]
    async fn test_enroll_sends_samples() {
        let server = stub::serve(vec![(
            "POST /api/enroll",
            200,
            r#"{"success":true,"employeeId":"7","message":"Successfully enrolled 2 face samples for Ana"}"#,
        )])
        .await;
        let samples = vec![
            FaceSample { prompt: "center".into(), image: vec![1] },
            FaceSample { prompt: "left".into(), image: vec![2] },
        ];
        let msg = client(&server.url())
            .enroll(EnrollPayload {
                employee_id: 7,
                employee_name: "Ana",
                department: "HR",
                position: "Specialist",
                samples: &samples,
            })
            .await
            .unwrap();
        assert!(msg.contains("2 face samples"));

        let requests = server.requests.lock().unwrap();
        let sent: serde_json::Value = serde_json::from_str(&requests[0].1).unwrap();
        assert_eq!(sent["employeeId"], 7);
        assert_eq!(sent["employeeName"], "Ana");
        assert_eq!(sent["faceSamples"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_enroll_rejected() {
        let server = stub::serve(vec![(
            "POST /api/enroll",
            200,
            r#"{"success":false,"error":"No valid face encodings could be extracted"}"#,
        )])
        .await;
        let err = client(&server.url())
            .enroll(EnrollPayload {
                employee_id: 7,
                employee_name: "Ana",
                department: "",
                position: "",
                samples: &[],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_stats() {
        let server = stub::serve(vec![(
            "GET /api/stats",
            200,
            r#"{"success":true,"stats":{"totalEmployees":3,"totalSamples":57}}"#,
        )])
        .await;
        let stats = client(&server.url()).stats().await.unwrap();
        assert_eq!(stats, ServiceStats { total_employees: 3, total_samples: 57 });
    }

    #[tokio::test]
    async fn test_unknown_route_is_a_status_error() {
        let server = stub::serve(vec![]).await;
        let err = client(&server.url()).stats().await.unwrap_err();
        assert!(matches!(err, RemoteError::Status { status: 404, .. }), "{err}");

        client(&server.url()).delete_employee(3).await.unwrap_err();
        let requests = server.requests.lock().unwrap();
        let routes: Vec<_> = requests.iter().map(|(route, _)| route.as_str()).collect();
        assert_eq!(routes, vec!["GET /api/stats", "DELETE /api/employees/3"]);
    }

    #[test]
    fn test_translate_numeric_and_bad_ids() {
        let ok = translate_recognition(RecognizeResponse {
            success: true,
            person: Some(Person {
                id: serde_json::json!(12),
                name: "Sarah Brown".into(),
                confidence: None,
            }),
            error: None,
        })
        .unwrap();
        assert_eq!(ok.employee_id(), Some(12));

        let bad = translate_recognition(RecognizeResponse {
            success: true,
            person: Some(Person {
                id: serde_json::json!("emp-x"),
                name: "?".into(),
                confidence: None,
            }),
            error: None,
        });
        assert!(matches!(bad, Err(RemoteError::Malformed(_))));
    }
}
