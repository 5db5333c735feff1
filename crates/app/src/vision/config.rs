//! Environment-driven service settings.
//!
//! All knobs come from `PV_*` variables, parsed once at startup and passed by
//! `Arc` into each component. Out-of-range values abort startup.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};

#[derive(Clone, Debug)]
pub struct Settings {
    pub camera_source: String,
    pub backend_base_url: String,
    pub backend_detection_endpoint: String,
    pub frame_width: i32,
    pub frame_height: i32,
    pub detection_interval_frames: u64,
    pub confidence_threshold: f32,
    pub enable_telemetry_snapshots: bool,
    pub snapshot_dir: PathBuf,
    pub enable_dataset_collection: bool,
    pub dataset_dir: PathBuf,
    pub excluded_labels: Vec<String>,
    pub max_track_history: usize,
    pub service_name: String,
    pub skip_backend_push: bool,
    pub listen_addr: String,
    pub jpeg_quality: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            camera_source: "0".into(),
            backend_base_url: "http://localhost:8080".into(),
            backend_detection_endpoint: "/api/detections".into(),
            frame_width: 1280,
            frame_height: 720,
            detection_interval_frames: 5,
            confidence_threshold: 0.6,
            enable_telemetry_snapshots: true,
            snapshot_dir: PathBuf::from("storage/snapshots"),
            enable_dataset_collection: true,
            dataset_dir: PathBuf::from("storage/dataset"),
            excluded_labels: vec!["human".into(), "person".into()],
            max_track_history: 30,
            service_name: "vision-service".into(),
            skip_backend_push: false,
            listen_addr: "0.0.0.0:8000".into(),
            jpeg_quality: 85,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_source(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary lookup source (injectable for tests).
    pub fn from_source(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut settings = Settings::default();

        if let Some(value) = get("PV_CAMERA_SOURCE") {
            settings.camera_source = value;
        }
        if let Some(value) = get("PV_BACKEND_BASE_URL") {
            settings.backend_base_url = value;
        }
        settings.backend_base_url = settings.backend_base_url.trim_end_matches('/').to_string();
        if let Some(value) = get("PV_BACKEND_DETECTION_ENDPOINT") {
            settings.backend_detection_endpoint = value;
        }
        if let Some(value) = get("PV_FRAME_WIDTH") {
            settings.frame_width = value
                .parse()
                .with_context(|| "PV_FRAME_WIDTH must be an integer")?;
        }
        if let Some(value) = get("PV_FRAME_HEIGHT") {
            settings.frame_height = value
                .parse()
                .with_context(|| "PV_FRAME_HEIGHT must be an integer")?;
        }
        if let Some(value) = get("PV_DETECTION_INTERVAL") {
            settings.detection_interval_frames = value
                .parse()
                .with_context(|| "PV_DETECTION_INTERVAL must be an integer")?;
        }
        if let Some(value) = get("PV_CONFIDENCE_THRESHOLD") {
            settings.confidence_threshold = value
                .parse()
                .with_context(|| "PV_CONFIDENCE_THRESHOLD must be a number")?;
        }
        if let Some(value) = get("PV_ENABLE_SNAPSHOTS") {
            settings.enable_telemetry_snapshots = parse_bool(&value);
        }
        if let Some(value) = get("PV_SNAPSHOT_DIR") {
            settings.snapshot_dir = PathBuf::from(value);
        }
        if let Some(value) = get("PV_ENABLE_DATASET") {
            settings.enable_dataset_collection = parse_bool(&value);
        }
        if let Some(value) = get("PV_DATASET_DIR") {
            settings.dataset_dir = PathBuf::from(value);
        }
        if let Some(value) = get("PV_EXCLUDED_LABELS") {
            settings.excluded_labels = parse_labels(&value);
        }
        if let Some(value) = get("PV_MAX_TRACK_HISTORY") {
            settings.max_track_history = value
                .parse()
                .with_context(|| "PV_MAX_TRACK_HISTORY must be an integer")?;
        }
        if let Some(value) = get("PV_SERVICE_NAME") {
            settings.service_name = value;
        }
        if let Some(value) = get("PV_SKIP_BACKEND") {
            settings.skip_backend_push = parse_bool(&value);
        }
        if let Some(value) = get("PV_LISTEN_ADDR") {
            settings.listen_addr = value;
        }
        if let Some(value) = get("PV_JPEG_QUALITY") {
            settings.jpeg_quality = value
                .parse()
                .with_context(|| "PV_JPEG_QUALITY must be an integer between 1 and 100")?;
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Case-insensitive membership test against the exclusion set.
    pub fn is_excluded(&self, label: &str) -> bool {
        let label = label.to_lowercase();
        self.excluded_labels.iter().any(|entry| *entry == label)
    }

    fn validate(&self) -> Result<()> {
        if !(320..=3840).contains(&self.frame_width) {
            bail!("PV_FRAME_WIDTH must be between 320 and 3840");
        }
        if !(240..=2160).contains(&self.frame_height) {
            bail!("PV_FRAME_HEIGHT must be between 240 and 2160");
        }
        if !(1..=30).contains(&self.detection_interval_frames) {
            bail!("PV_DETECTION_INTERVAL must be between 1 and 30");
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            bail!("PV_CONFIDENCE_THRESHOLD must be between 0.0 and 1.0");
        }
        if self.max_track_history > 120 {
            bail!("PV_MAX_TRACK_HISTORY must be at most 120");
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            bail!("PV_JPEG_QUALITY must be between 1 and 100");
        }
        if self.service_name.is_empty() {
            bail!("PV_SERVICE_NAME must not be empty");
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

fn parse_labels(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|label| label.trim().to_lowercase())
        .filter(|label| !label.is_empty())
        .collect()
}
