//! Wire schema and shared state passed between pipeline stages.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One candidate object in one frame, as produced by the detector.
///
/// `track_id` stays unset until the track manager assigns it; once assigned it
/// is never rewritten for the remainder of that frame's result set.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub confidence: f32,
    pub label: String,
    pub track_id: Option<i64>,
}

impl BoundingBox {
    /// Geometric centre, integer division matching the tracker's position
    /// signal.
    pub fn centroid(&self) -> (i32, i32) {
        (self.x + self.width / 2, self.y + self.height / 2)
    }
}

/// Immutable report of one qualifying frame, handed to the publisher.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionEvent {
    pub frame_id: u64,
    pub stream_id: String,
    pub detected_at: DateTime<Utc>,
    pub pest_type: String,
    pub pest_count: usize,
    pub boxes: Vec<BoundingBox>,
    pub max_confidence: f32,
    pub snapshot_path: Option<String>,
}

/// Outbound JSON body for the backend's detection endpoint.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionEnvelope {
    pub service_name: String,
    pub payload: DetectionEvent,
}

/// Reply shape for `/detections/latest`.
#[derive(Serialize)]
pub struct BoxesResponse {
    pub count: usize,
    pub boxes: Vec<BoundingBox>,
}

/// Latest encoded frame plus the boxes it was annotated with, replaced
/// wholesale by the producer each tick.
#[derive(Clone)]
pub struct FramePacket {
    pub jpeg: Vec<u8>,
    pub boxes: Vec<BoundingBox>,
    pub frame_id: u64,
    pub timestamp_ms: i64,
}

pub type SharedFrame = Arc<Mutex<Option<FramePacket>>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serializes_camel_case() {
        let envelope = DetectionEnvelope {
            service_name: "vision-service".into(),
            payload: DetectionEvent {
                frame_id: 7,
                stream_id: "0".into(),
                detected_at: Utc::now(),
                pest_type: "general".into(),
                pest_count: 1,
                boxes: vec![BoundingBox {
                    x: 4,
                    y: 8,
                    width: 16,
                    height: 12,
                    confidence: 0.75,
                    label: "pest".into(),
                    track_id: Some(3),
                }],
                max_confidence: 0.75,
                snapshot_path: None,
            },
        };

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["serviceName"], "vision-service");
        let payload = &value["payload"];
        assert_eq!(payload["frameId"], 7);
        assert_eq!(payload["streamId"], "0");
        assert!(payload["detectedAt"].is_string());
        assert_eq!(payload["pestType"], "general");
        assert_eq!(payload["pestCount"], 1);
        assert_eq!(payload["maxConfidence"], 0.75);
        assert!(payload["snapshotPath"].is_null());
        assert_eq!(payload["boxes"][0]["trackId"], 3);
        assert_eq!(payload["boxes"][0]["width"], 16);
    }

    #[test]
    fn centroid_uses_integer_division() {
        let bx = BoundingBox {
            x: 10,
            y: 20,
            width: 5,
            height: 7,
            confidence: 1.0,
            label: "pest".into(),
            track_id: None,
        };
        assert_eq!(bx.centroid(), (12, 23));
    }
}
