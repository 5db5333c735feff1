mod vision;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::Result;
use tracing::{info, warn};
use video_ingest::CameraSource;

use crate::vision::{
    config::Settings,
    dataset::DatasetCollector,
    detector::MotionDetector,
    pipeline::VisionPipeline,
    publisher::DetectionPublisher,
    server::spawn_preview_server,
    snapshot::SnapshotWriter,
    telemetry,
};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    telemetry::init_tracing();
    let _ = telemetry::init_metrics_recorder();

    let settings = Arc::new(Settings::from_env()?);
    info!(
        "Starting {} with camera source {}",
        settings.service_name, settings.camera_source
    );

    let source = CameraSource::open(
        &settings.camera_source,
        (settings.frame_width, settings.frame_height),
    );
    let detector = MotionDetector::new(settings.confidence_threshold)?;
    let publisher = DetectionPublisher::spawn(settings.clone())?;
    let dataset = DatasetCollector::new(&settings)?;
    let snapshots = SnapshotWriter::new(&settings)?;

    let mut pipeline = VisionPipeline::new(
        settings.clone(),
        Box::new(source),
        Box::new(detector),
        publisher,
        dataset,
        snapshots,
    );
    pipeline.start();

    let server = spawn_preview_server(pipeline.query(), settings.clone())?;
    info!(
        "Preview available at http://{}/video/feed",
        settings.listen_addr
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_shutdown = shutdown.clone();
    if let Err(err) = ctrlc::set_handler(move || {
        handler_shutdown.store(true, Ordering::SeqCst);
    }) {
        warn!("Failed to install Ctrl+C handler: {err}");
    }

    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }

    info!("Shutting down {}", settings.service_name);
    pipeline.shutdown();
    server.stop();
    Ok(())
}
