use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod recognition;
mod remote;
mod service;
mod session;
mod store;

use config::Config;
use engine::{spawn_engine, EngineSettings};
use facetrack_hw::{CameraDevice, SyntheticCamera};
use recognition::Recognizer;
use remote::RemoteClient;
use service::AttendanceService;
use session::Timing;
use store::{KvStore, RecordStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facetrackd starting");

    let config = Config::from_env()?;
    tracing::info!(
        db = %config.db_path.display(),
        camera = %config.camera_device,
        mode = ?config.recognition_mode,
        url = ?config.recognition_url,
        prompts = config.prompts.len(),
        "configuration loaded"
    );

    let store = RecordStore::new(KvStore::open(&config.db_path)?);

    let camera = open_camera(&config);
    let engine = spawn_engine(
        camera,
        EngineSettings {
            prompts: config.prompts.clone(),
            max_capture_retries: config.max_capture_retries,
            timing: Timing {
                warmup: config.warmup,
                settle: config.settle_delay,
                interval: config.capture_interval,
            },
            warmup_frames: config.warmup_frames,
        },
    )?;

    let remote = config
        .recognition_url
        .as_deref()
        .map(|url| RemoteClient::new(url, config.recognize_timeout, config.health_timeout));
    let recognizer = Recognizer::new(
        config.recognition_mode,
        remote,
        config.fallback_to_placeholder,
        config.recognize_timeout,
        config.placeholder_delay,
    );

    let service = Arc::new(AttendanceService::new(store, engine, recognizer, config.rules.clone()));

    let _conn = zbus::connection::Builder::session()?
        .name(dbus_interface::BUS_NAME)?
        .serve_at(
            dbus_interface::OBJECT_PATH,
            dbus_interface::AttendanceBus::new(Arc::clone(&service)),
        )?
        .build()
        .await?;

    tracing::info!(bus_name = dbus_interface::BUS_NAME, "facetrackd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    if service.cancel_enrollment() {
        tracing::info!("cancelled running enrollment");
    }
    tracing::info!("facetrackd shutting down");

    Ok(())
}

/// Pick the camera backend named by `FACETRACK_CAMERA_DEVICE`.
///
/// The device is opened lazily per request, so a missing camera does not
/// stop the daemon; requests fail with a camera error instead.
fn open_camera(config: &Config) -> Box<dyn CameraDevice> {
    if config.camera_device == "synthetic" {
        tracing::info!("using synthetic camera");
        return Box::new(SyntheticCamera::new(config.camera_width, config.camera_height));
    }

    #[cfg(feature = "v4l2")]
    {
        Box::new(facetrack_hw::V4lCamera::new(
            &config.camera_device,
            config.camera_width,
            config.camera_height,
        ))
    }

    #[cfg(not(feature = "v4l2"))]
    {
        tracing::warn!(
            device = %config.camera_device,
            "built without v4l2 support; falling back to synthetic camera"
        );
        Box::new(SyntheticCamera::new(config.camera_width, config.camera_height))
    }
}
