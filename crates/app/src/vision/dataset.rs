//! Dataset sink persisting detection crops for future training runs.

use std::{
    fs,
    io::Write,
    path::PathBuf,
};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use image::{Rgb, RgbImage};
use tracing::{debug, info};
use uuid::Uuid;
use video_ingest::Frame;

use crate::vision::{config::Settings, data::BoundingBox};

const METADATA_HEADER: &str = "timestamp,frame_id,label,confidence,track_id,image_path\n";

pub struct DatasetCollector {
    enabled: bool,
    dataset_dir: PathBuf,
    excluded_labels: Vec<String>,
    metadata_path: PathBuf,
}

impl DatasetCollector {
    pub fn new(settings: &Settings) -> Result<Self> {
        let dataset_dir = settings.dataset_dir.clone();
        let collector = Self {
            enabled: settings.enable_dataset_collection,
            metadata_path: dataset_dir.join("metadata.csv"),
            excluded_labels: settings.excluded_labels.clone(),
            dataset_dir,
        };

        if !collector.enabled {
            info!("Dataset collection disabled via configuration");
            return Ok(collector);
        }

        fs::create_dir_all(&collector.dataset_dir).with_context(|| {
            format!(
                "Failed to create dataset directory {}",
                collector.dataset_dir.display()
            )
        })?;
        if !collector.metadata_path.exists() {
            fs::write(&collector.metadata_path, METADATA_HEADER).with_context(|| {
                format!(
                    "Failed to create dataset metadata log {}",
                    collector.metadata_path.display()
                )
            })?;
        }
        Ok(collector)
    }

    /// Persist crops and metadata rows for this frame's boxes.
    ///
    /// A degenerate box is skipped; it never aborts the remaining boxes.
    pub fn record(&self, frame: &Frame, frame_id: u64, boxes: &[BoundingBox]) {
        if !self.enabled {
            return;
        }

        let timestamp = Utc::now();
        let mut rows = Vec::new();
        for bx in boxes {
            let label = bx.label.to_lowercase();
            if self.excluded_labels.iter().any(|entry| *entry == label) {
                continue;
            }

            let Some(crop) = crop_frame(frame, bx) else {
                debug!("Skipping invalid crop for frame {frame_id}");
                continue;
            };

            let filename = format!(
                "{}_{}_{}.jpg",
                timestamp.format("%Y%m%dT%H%M%S%6f"),
                &Uuid::new_v4().simple().to_string()[..8],
                label
            );
            let output_path = self.dataset_dir.join(&filename);
            if let Err(err) = crop.save(&output_path) {
                debug!("Failed to save crop for frame {frame_id}: {err}");
                continue;
            }

            rows.push(format!(
                "{},{},{},{:.3},{},{}",
                timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                frame_id,
                label,
                bx.confidence,
                bx.track_id.map(|id| id.to_string()).unwrap_or_default(),
                output_path.display()
            ));
        }

        if rows.is_empty() {
            return;
        }

        match fs::OpenOptions::new().append(true).open(&self.metadata_path) {
            Ok(mut handle) => {
                for row in &rows {
                    let _ = writeln!(handle, "{row}");
                }
                debug!("Persisted {} dataset crops for frame {frame_id}", rows.len());
            }
            Err(err) => debug!("Failed to append dataset metadata: {err}"),
        }
    }
}

/// Extract the box's pixels, clamped to the frame bounds.
fn crop_frame(frame: &Frame, bx: &BoundingBox) -> Option<RgbImage> {
    let x1 = bx.x.max(0);
    let y1 = bx.y.max(0);
    let x2 = (bx.x + bx.width).min(frame.width);
    let y2 = (bx.y + bx.height).min(frame.height);
    if x2 <= x1 || y2 <= y1 {
        return None;
    }

    let crop_width = (x2 - x1) as u32;
    let crop_height = (y2 - y1) as u32;
    let stride = frame.width as usize * 3;
    let mut crop = RgbImage::new(crop_width, crop_height);
    for row in 0..crop_height {
        for col in 0..crop_width {
            let src = (y1 as usize + row as usize) * stride + (x1 as usize + col as usize) * 3;
            let b = frame.data[src];
            let g = frame.data[src + 1];
            let r = frame.data[src + 2];
            crop.put_pixel(col, row, Rgb([r, g, b]));
        }
    }
    Some(crop)
}
