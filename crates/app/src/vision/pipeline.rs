//! The capture → detect → track → publish producer loop.
//!
//! One dedicated thread owns the capture source and all tracker state; an
//! arbitrary number of readers observe the latest encoded frame and box list
//! through [`SharedFrame`] without ever blocking the producer for long.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use chrono::Utc;
use tracing::{debug, error, info, warn};
use video_ingest::FrameSource;

use crate::vision::{
    config::Settings,
    data::{BoundingBox, DetectionEnvelope, DetectionEvent, FramePacket, SharedFrame},
    dataset::DatasetCollector,
    detector::Detector,
    encoding,
    publisher::{DetectionPublisher, PublisherHandle},
    snapshot::SnapshotWriter,
    tracker::TrackManager,
};

/// Backoff applied when the capture source has nothing for us.
const READ_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Everything the producer thread needs, kept behind a mutex so a stopped
/// pipeline can be restarted with its tracker and detector state intact.
struct PipelineWorker {
    source: Box<dyn FrameSource>,
    detector: Box<dyn Detector>,
    tracker: TrackManager,
    dataset: DatasetCollector,
    snapshots: SnapshotWriter,
    publish: PublisherHandle,
}

pub struct VisionPipeline {
    settings: Arc<Settings>,
    shared: SharedFrame,
    running: Arc<AtomicBool>,
    worker: Arc<Mutex<PipelineWorker>>,
    producer: Option<thread::JoinHandle<()>>,
    publisher: Option<DetectionPublisher>,
}

impl VisionPipeline {
    pub fn new(
        settings: Arc<Settings>,
        source: Box<dyn FrameSource>,
        detector: Box<dyn Detector>,
        publisher: DetectionPublisher,
        dataset: DatasetCollector,
        snapshots: SnapshotWriter,
    ) -> Self {
        let worker = PipelineWorker {
            source,
            detector,
            tracker: TrackManager::new(settings.max_track_history),
            dataset,
            snapshots,
            publish: publisher.handle(),
        };
        Self {
            settings,
            shared: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            worker: Arc::new(Mutex::new(worker)),
            producer: None,
            publisher: Some(publisher),
        }
    }

    /// Spin up the single producer thread. A no-op while already running.
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let settings = self.settings.clone();
        let shared = self.shared.clone();
        let running = self.running.clone();
        let worker = self.worker.clone();
        let handle = thread::Builder::new()
            .name("vision-pipeline".into())
            .spawn(move || match worker.lock() {
                Ok(mut guard) => run_loop(&settings, &shared, &running, &mut guard),
                Err(_) => error!("Pipeline worker state poisoned; producer exiting"),
            })
            .expect("failed to spawn pipeline producer thread");
        self.producer = Some(handle);
    }

    /// Signal the producer to exit (checked once per iteration) and wait for
    /// it to finish; the capture source is released on the way out.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.producer.take() {
            let _ = handle.join();
        }
    }

    /// Stop the loop, then release the publisher's network resources.
    pub fn shutdown(&mut self) {
        self.stop();
        if let Some(publisher) = self.publisher.take() {
            publisher.close();
        }
    }

    /// Reader-facing view of the pipeline, handed to the preview server.
    pub fn query(&self) -> PipelineQuery {
        PipelineQuery {
            shared: self.shared.clone(),
        }
    }
}

/// Read-only query surface over the pipeline's shared state. Cheap to clone;
/// readers never mutate and only briefly hold the shared-state lock.
#[derive(Clone)]
pub struct PipelineQuery {
    shared: SharedFrame,
}

impl PipelineQuery {
    /// Consistent point-in-time copy of the latest packet, if any.
    pub fn latest_packet(&self) -> Option<FramePacket> {
        match self.shared.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        }
    }

    /// Immutable copy of the most recently published box list. Blocks only on
    /// the shared-state lock, never on I/O.
    pub fn latest_boxes(&self) -> Vec<BoundingBox> {
        match self.shared.lock() {
            Ok(guard) => guard
                .as_ref()
                .map(|packet| packet.boxes.clone())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }
}

/// Format one part of the `multipart/x-mixed-replace` MJPEG stream.
pub fn mjpeg_chunk(packet: &FramePacket) -> Vec<u8> {
    let mut payload = Vec::with_capacity(packet.jpeg.len() + 96);
    payload.extend_from_slice(b"--frame\r\n");
    payload.extend_from_slice(format!("X-Sequence: {}\r\n", packet.frame_id).as_bytes());
    payload.extend_from_slice(format!("X-Timestamp: {}\r\n", packet.timestamp_ms).as_bytes());
    payload.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
    payload.extend_from_slice(&packet.jpeg);
    payload.extend_from_slice(b"\r\n");
    payload
}

fn run_loop(
    settings: &Settings,
    shared: &SharedFrame,
    running: &AtomicBool,
    worker: &mut PipelineWorker,
) {
    let interval = settings.detection_interval_frames.max(1);
    let mut frame_counter: u64 = 0;

    while running.load(Ordering::Relaxed) {
        let frame = match worker.source.read() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                thread::sleep(READ_RETRY_BACKOFF);
                continue;
            }
            Err(err) => {
                warn!("Capture read error: {err}");
                metrics::counter!("vision_capture_errors_total").increment(1);
                thread::sleep(READ_RETRY_BACKOFF);
                continue;
            }
        };

        frame_counter += 1;
        metrics::counter!("vision_frames_total").increment(1);

        let (frame_id, boxes, frame_metrics) = match worker.detector.detect(&frame) {
            Ok(result) => result,
            Err(err) => {
                warn!("Detector error on frame #{frame_counter}: {err}");
                continue;
            }
        };
        debug!(
            "frame {}: {} region(s), max confidence {:.2}",
            frame_metrics.frame_id, frame_metrics.pest_count, frame_metrics.max_confidence
        );

        let mut filtered: Vec<BoundingBox> = boxes
            .into_iter()
            .filter(|bx| !settings.is_excluded(&bx.label))
            .collect();

        let encoded = if filtered.is_empty() {
            encoding::encode_frame_jpeg(&frame, settings.jpeg_quality)
        } else {
            worker.tracker.update_tracks(&mut filtered);
            worker
                .tracker
                .draw_annotations(&frame, &filtered)
                .and_then(|annotated| encoding::encode_rgba_jpeg(annotated, settings.jpeg_quality))
        };

        // On encode failure the previous packet stays visible to readers.
        let jpeg = match encoded {
            Ok(jpeg) => Some(jpeg),
            Err(err) => {
                warn!("Frame encode failed: {err}");
                None
            }
        };

        if let Some(jpeg) = &jpeg {
            if let Ok(mut guard) = shared.lock() {
                *guard = Some(FramePacket {
                    jpeg: jpeg.clone(),
                    boxes: filtered.clone(),
                    frame_id,
                    timestamp_ms: frame.timestamp_ms,
                });
            }
        }
        metrics::gauge!("vision_latest_detections").set(filtered.len() as f64);
        metrics::gauge!("vision_active_tracks").set(worker.tracker.track_count() as f64);

        if !filtered.is_empty() {
            worker.dataset.record(&frame, frame_id, &filtered);
        }

        if !filtered.is_empty() && frame_counter % interval == 0 {
            let snapshot_path = jpeg
                .as_deref()
                .and_then(|bytes| worker.snapshots.store(frame_id, bytes));
            let envelope = DetectionEnvelope {
                service_name: settings.service_name.clone(),
                payload: DetectionEvent {
                    frame_id,
                    stream_id: settings.camera_source.clone(),
                    detected_at: Utc::now(),
                    pest_type: "general".to_string(),
                    pest_count: filtered.len(),
                    boxes: filtered.clone(),
                    max_confidence: frame_metrics.max_confidence,
                    snapshot_path,
                },
            };
            worker.publish.submit(envelope);
            metrics::counter!("vision_events_submitted_total").increment(1);
            debug!(
                "Submitted detection event for frame {frame_id} ({} box(es))",
                filtered.len()
            );
        }
    }

    worker.source.release();
    info!("Vision pipeline stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::detector::DetectorMetrics;
    use anyhow::Result;
    use std::{
        sync::atomic::AtomicUsize,
        time::Instant,
    };
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;
    use video_ingest::{CaptureError, Frame, FrameFormat};

    const WIDTH: i32 = 64;
    const HEIGHT: i32 = 48;

    fn test_frame() -> Frame {
        Frame {
            data: vec![0; (WIDTH * HEIGHT * 3) as usize],
            width: WIDTH,
            height: HEIGHT,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        }
    }

    /// Yields frames while its budget lasts, then reports "nothing available".
    struct ScriptedSource {
        budget: Arc<AtomicUsize>,
        released: Arc<AtomicBool>,
    }

    impl FrameSource for ScriptedSource {
        fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
            let mut remaining = self.budget.load(Ordering::SeqCst);
            loop {
                if remaining == 0 {
                    return Ok(None);
                }
                match self.budget.compare_exchange(
                    remaining,
                    remaining - 1,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => return Ok(Some(test_frame())),
                    Err(current) => remaining = current,
                }
            }
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    /// Returns the same boxes every frame and records the ids it issued.
    struct ScriptedDetector {
        next_id: u64,
        boxes_per_frame: Vec<BoundingBox>,
        seen: Arc<Mutex<Vec<u64>>>,
    }

    impl Detector for ScriptedDetector {
        fn detect(&mut self, _frame: &Frame) -> Result<(u64, Vec<BoundingBox>, DetectorMetrics)> {
            let frame_id = self.next_id;
            self.next_id += 1;
            self.seen.lock().unwrap().push(frame_id);
            let boxes = self.boxes_per_frame.clone();
            let max_confidence = boxes.iter().map(|bx| bx.confidence).fold(0.0, f32::max);
            Ok((
                frame_id,
                boxes,
                DetectorMetrics {
                    frame_id,
                    pest_count: self.boxes_per_frame.len(),
                    max_confidence,
                },
            ))
        }
    }

    fn pest(x: i32, y: i32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: 12,
            height: 10,
            confidence: 0.9,
            label: "pest".into(),
            track_id: None,
        }
    }

    struct Harness {
        pipeline: VisionPipeline,
        events: UnboundedReceiver<DetectionEnvelope>,
        seen: Arc<Mutex<Vec<u64>>>,
        budget: Arc<AtomicUsize>,
        released: Arc<AtomicBool>,
        dirs: TempDir,
    }

    fn harness(frames: usize, boxes_per_frame: Vec<BoundingBox>) -> Harness {
        let dirs = TempDir::new().unwrap();
        let settings = Arc::new(Settings {
            detection_interval_frames: 5,
            snapshot_dir: dirs.path().join("snapshots"),
            dataset_dir: dirs.path().join("dataset"),
            skip_backend_push: true,
            ..Settings::default()
        });

        let budget = Arc::new(AtomicUsize::new(frames));
        let released = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let source = ScriptedSource {
            budget: budget.clone(),
            released: released.clone(),
        };
        let detector = ScriptedDetector {
            next_id: 0,
            boxes_per_frame,
            seen: seen.clone(),
        };
        let (publisher, events) = DetectionPublisher::stub();
        let dataset = DatasetCollector::new(&settings).unwrap();
        let snapshots = SnapshotWriter::new(&settings).unwrap();

        let pipeline = VisionPipeline::new(
            settings,
            Box::new(source),
            Box::new(detector),
            publisher,
            dataset,
            snapshots,
        );
        Harness {
            pipeline,
            events,
            seen,
            budget,
            released,
            dirs,
        }
    }

    fn wait_for_frames(seen: &Arc<Mutex<Vec<u64>>>, count: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while seen.lock().unwrap().len() < count {
            assert!(Instant::now() < deadline, "pipeline stalled before {count} frames");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn drain(events: &mut UnboundedReceiver<DetectionEnvelope>) -> Vec<DetectionEnvelope> {
        let mut drained = Vec::new();
        while let Ok(envelope) = events.try_recv() {
            drained.push(envelope);
        }
        drained
    }

    #[test]
    fn frame_ids_are_gapless_and_events_fire_on_interval() {
        let mut harness = harness(12, vec![pest(10, 10)]);
        harness.pipeline.start();
        wait_for_frames(&harness.seen, 12);
        harness.pipeline.stop();

        assert_eq!(*harness.seen.lock().unwrap(), (0..12).collect::<Vec<u64>>());

        // Interval 5 over 12 frames: loop counters 5 and 10, detector ids 4 and 9.
        let events = drain(&mut harness.events);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].payload.frame_id, 4);
        assert_eq!(events[1].payload.frame_id, 9);
        for envelope in &events {
            assert_eq!(envelope.service_name, "vision-service");
            assert_eq!(envelope.payload.pest_count, 1);
            assert_eq!(envelope.payload.max_confidence, 0.9);
            let snapshot = envelope.payload.snapshot_path.as_ref().unwrap();
            assert!(std::path::Path::new(snapshot).exists());
        }
    }

    #[test]
    fn zero_region_detector_never_reaches_the_sinks() {
        let mut harness = harness(12, Vec::new());
        harness.pipeline.start();
        wait_for_frames(&harness.seen, 12);
        harness.pipeline.stop();

        assert!(drain(&mut harness.events).is_empty());
        assert!(harness.pipeline.query().latest_boxes().is_empty());

        // Raw frames still flow to readers.
        let packet = harness.pipeline.query().latest_packet().unwrap();
        assert_eq!(packet.frame_id, 11);
        assert!(!packet.jpeg.is_empty());

        // Sinks were never invoked: no snapshots, no crops beyond the header.
        let snapshots: Vec<_> = std::fs::read_dir(harness.dirs.path().join("snapshots"))
            .unwrap()
            .collect();
        assert!(snapshots.is_empty());
        let dataset = std::fs::read_to_string(harness.dirs.path().join("dataset/metadata.csv")).unwrap();
        assert_eq!(dataset.lines().count(), 1);
    }

    #[test]
    fn latest_boxes_are_self_consistent_copies() {
        let mut harness = harness(6, vec![pest(10, 10)]);
        harness.pipeline.start();
        wait_for_frames(&harness.seen, 6);
        harness.pipeline.stop();

        let boxes = harness.pipeline.query().latest_boxes();
        assert_eq!(boxes.len(), 1);
        let bx = &boxes[0];
        assert_eq!(bx.label, "pest");
        assert_eq!((bx.width, bx.height), (12, 10));
        assert_eq!(bx.confidence, 0.9);
        // The same object keeps the same identity across all six frames.
        assert_eq!(bx.track_id, Some(1));
    }

    #[test]
    fn excluded_labels_never_surface() {
        let mut person = pest(30, 30);
        person.label = "Person".into();
        let mut harness = harness(5, vec![person, pest(10, 10)]);
        harness.pipeline.start();
        wait_for_frames(&harness.seen, 5);
        harness.pipeline.stop();

        let boxes = harness.pipeline.query().latest_boxes();
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].label, "pest");

        let events = drain(&mut harness.events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload.pest_count, 1);
    }

    #[test]
    fn concurrent_readers_always_see_self_consistent_boxes() {
        let mut harness = harness(30, vec![pest(10, 10)]);
        let query = harness.pipeline.query();
        harness.pipeline.start();
        let reader = thread::spawn(move || {
            for _ in 0..200 {
                for bx in query.latest_boxes() {
                    assert_eq!(bx.label, "pest");
                    assert_eq!((bx.width, bx.height), (12, 10));
                    assert!(bx.track_id.is_some());
                }
                thread::sleep(Duration::from_millis(1));
            }
        });
        wait_for_frames(&harness.seen, 30);
        reader.join().unwrap();
        harness.pipeline.stop();
    }

    #[test]
    fn start_is_idempotent() {
        let mut harness = harness(4, vec![pest(10, 10)]);
        harness.pipeline.start();
        harness.pipeline.start();
        wait_for_frames(&harness.seen, 4);
        harness.pipeline.stop();
        assert_eq!(harness.seen.lock().unwrap().len(), 4);
    }

    #[test]
    fn stop_releases_the_source_and_restart_keeps_tracker_state() {
        let mut harness = harness(5, vec![pest(10, 10)]);
        harness.pipeline.start();
        wait_for_frames(&harness.seen, 5);
        harness.pipeline.stop();
        assert!(harness.released.load(Ordering::SeqCst));
        assert_eq!(harness.pipeline.query().latest_boxes()[0].track_id, Some(1));

        // Refill the source and run again: the same object must keep id 1.
        harness.budget.store(5, Ordering::SeqCst);
        harness.pipeline.start();
        wait_for_frames(&harness.seen, 10);
        harness.pipeline.stop();
        assert_eq!(harness.pipeline.query().latest_boxes()[0].track_id, Some(1));
    }
}
