use chrono::NaiveTime;
use facetrack_core::prompts::{default_prompts, normalize_prompts};
use facetrack_core::AttendanceRules;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which recognition strategy answers check-in requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecognitionMode {
    /// Forward frames to the external recognition service.
    Delegated,
    /// Pick a random enrolled employee. Demo only.
    Placeholder,
}

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Camera backend: "synthetic" or a V4L2 device path such as /dev/video0.
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Path to the SQLite record store.
    pub db_path: PathBuf,
    /// Base URL of the recognition service, e.g. http://localhost:5000.
    pub recognition_url: Option<String>,
    pub recognition_mode: RecognitionMode,
    /// Fall back to the placeholder pick when the service is unavailable.
    pub fallback_to_placeholder: bool,
    /// Timeout for the service health check.
    pub health_timeout: Duration,
    /// Upper bound on one delegated recognition attempt.
    pub recognize_timeout: Duration,
    /// Artificial latency of the placeholder strategy.
    pub placeholder_delay: Duration,
    /// Delay after opening the camera before the first prompt.
    pub warmup: Duration,
    /// Time the user gets to follow a prompt before the capture.
    pub settle_delay: Duration,
    /// Pause between a capture and the next prompt.
    pub capture_interval: Duration,
    /// Consecutive bad frames tolerated on one prompt.
    pub max_capture_retries: u32,
    /// Frames discarded before a recognition capture.
    pub warmup_frames: usize,
    pub prompts: Vec<String>,
    pub rules: AttendanceRules,
}

impl Config {
    /// Load configuration from `FACETRACK_*` environment variables with defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facetrack");

        let db_path = std::env::var("FACETRACK_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("records.db"));

        let recognition_url = std::env::var("FACETRACK_RECOGNITION_URL")
            .ok()
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty());

        // Delegation is the default whenever a service is configured.
        let recognition_mode = match std::env::var("FACETRACK_RECOGNITION_MODE").ok().as_deref() {
            Some("placeholder") => RecognitionMode::Placeholder,
            Some("delegated") => RecognitionMode::Delegated,
            _ if recognition_url.is_some() => RecognitionMode::Delegated,
            _ => RecognitionMode::Placeholder,
        };

        let prompts = match std::env::var("FACETRACK_PROMPTS_FILE") {
            Ok(path) => load_prompts_file(Path::new(&path))?,
            Err(_) => default_prompts(),
        };

        let expected_check_in = match std::env::var("FACETRACK_EXPECTED_CHECK_IN") {
            Ok(v) => NaiveTime::parse_from_str(&v, "%H:%M")
                .map_err(|e| anyhow::anyhow!("FACETRACK_EXPECTED_CHECK_IN={v:?}: {e}"))?,
            Err(_) => AttendanceRules::default().expected_check_in,
        };

        Ok(Self {
            camera_device: std::env::var("FACETRACK_CAMERA_DEVICE")
                .unwrap_or_else(|_| "synthetic".to_string()),
            camera_width: env_parse("FACETRACK_CAMERA_WIDTH", 640),
            camera_height: env_parse("FACETRACK_CAMERA_HEIGHT", 480),
            db_path,
            recognition_url,
            recognition_mode,
            fallback_to_placeholder: std::env::var("FACETRACK_FALLBACK_TO_PLACEHOLDER")
                .map(|v| v != "0")
                .unwrap_or(false),
            health_timeout: env_millis("FACETRACK_HEALTH_TIMEOUT_MS", 2000),
            recognize_timeout: env_millis("FACETRACK_RECOGNIZE_TIMEOUT_MS", 10_000),
            placeholder_delay: env_millis("FACETRACK_PLACEHOLDER_DELAY_MS", 2000),
            warmup: env_millis("FACETRACK_WARMUP_MS", 2000),
            settle_delay: env_millis("FACETRACK_SETTLE_MS", 2000),
            capture_interval: env_millis("FACETRACK_CAPTURE_INTERVAL_MS", 1500),
            max_capture_retries: env_parse("FACETRACK_MAX_CAPTURE_RETRIES", 3),
            warmup_frames: env_parse("FACETRACK_WARMUP_FRAMES", 4),
            prompts,
            rules: AttendanceRules {
                expected_check_in,
                grace: chrono::Duration::minutes(env_parse("FACETRACK_GRACE_MINUTES", 0)),
                debounce: chrono::Duration::seconds(env_parse("FACETRACK_DEBOUNCE_SECS", 60)),
            },
        })
    }
}

/// Prompt list file, e.g.
///
/// ```toml
/// prompts = ["center", "left", "right", "big smile"]
/// ```
#[derive(Debug, Deserialize)]
struct PromptsFile {
    prompts: Vec<String>,
}

fn load_prompts_file(path: &Path) -> anyhow::Result<Vec<String>> {
    let src = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
    parse_prompts(&src).map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))
}

fn parse_prompts(src: &str) -> anyhow::Result<Vec<String>> {
    let file: PromptsFile = toml::from_str(src)?;
    Ok(normalize_prompts(file.prompts)?)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: u64) -> Duration {
    Duration::from_millis(env_parse(key, default))
}
