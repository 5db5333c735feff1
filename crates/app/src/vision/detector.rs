//! Pluggable region scorer and its motion-based default implementation.

use anyhow::{bail, Result};
use opencv::{
    core::{self, Mat, Ptr},
    imgproc,
    prelude::*,
    video::{self, BackgroundSubtractorMOG2},
};
use video_ingest::Frame;

use crate::vision::data::BoundingBox;

/// Per-call detector output recorded before the confidence threshold filter.
pub struct DetectorMetrics {
    pub frame_id: u64,
    pub pest_count: usize,
    pub max_confidence: f32,
}

/// Anything that can turn a frame into scored regions.
///
/// The frame id is the detector's own monotonic counter, starting at 0; the
/// pipeline treats it as the canonical sequence number for that call.
pub trait Detector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<(u64, Vec<BoundingBox>, DetectorMetrics)>;
}

/// Contours smaller than this are sensor noise, not candidate objects.
const MIN_CONTOUR_AREA: f64 = 600.0;

/// Motion and contour based detector standing in for a trained classifier.
///
/// Foreground pixels come from MOG2 background subtraction; blurred and
/// thresholded masks are segmented into external contours whose bounding
/// rectangles become candidate regions.
pub struct MotionDetector {
    subtractor: Ptr<BackgroundSubtractorMOG2>,
    confidence_threshold: f32,
    frame_id: u64,
}

impl MotionDetector {
    pub fn new(confidence_threshold: f32) -> Result<Self> {
        let subtractor = video::create_background_subtractor_mog2(500, 16.0, true)?;
        Ok(Self {
            subtractor,
            confidence_threshold,
            frame_id: 0,
        })
    }
}

impl Detector for MotionDetector {
    fn detect(&mut self, frame: &Frame) -> Result<(u64, Vec<BoundingBox>, DetectorMetrics)> {
        let frame_id = self.frame_id;
        self.frame_id += 1;

        let mat = frame_to_mat(frame)?;
        let mut fg_mask = Mat::default();
        BackgroundSubtractorTrait::apply(&mut self.subtractor, &mat, &mut fg_mask, -1.0)?;

        let mut blurred = Mat::default();
        imgproc::gaussian_blur(
            &fg_mask,
            &mut blurred,
            core::Size {
                width: 9,
                height: 9,
            },
            0.0,
            0.0,
            core::BORDER_DEFAULT,
        )?;

        let mut binary = Mat::default();
        imgproc::threshold(&blurred, &mut binary, 200.0, 255.0, imgproc::THRESH_BINARY)?;

        let mut contours: core::Vector<core::Vector<core::Point>> = core::Vector::new();
        imgproc::find_contours(
            &binary,
            &mut contours,
            imgproc::RETR_EXTERNAL,
            imgproc::CHAIN_APPROX_SIMPLE,
            core::Point::new(0, 0),
        )?;

        let mut boxes = Vec::new();
        let mut max_confidence: f32 = 0.0;
        for contour in contours.iter() {
            let area = imgproc::contour_area(&contour, false)?;
            if area < MIN_CONTOUR_AREA {
                continue;
            }

            let rect = imgproc::bounding_rect(&contour)?;
            let confidence = confidence_for_area(area);
            max_confidence = max_confidence.max(confidence);
            if confidence < self.confidence_threshold {
                continue;
            }

            boxes.push(BoundingBox {
                x: rect.x,
                y: rect.y,
                width: rect.width,
                height: rect.height,
                confidence,
                label: "pest".to_string(),
                track_id: None,
            });
        }

        let metrics = DetectorMetrics {
            frame_id,
            pest_count: boxes.len(),
            max_confidence,
        };
        Ok((frame_id, boxes, metrics))
    }
}

/// Area-based stand-in for a classifier score: saturates at four times the
/// minimum contour area, floored so even marginal contours keep some weight.
fn confidence_for_area(area: f64) -> f32 {
    ((area / (MIN_CONTOUR_AREA * 4.0)) as f32).clamp(0.2, 1.0)
}

fn frame_to_mat(frame: &Frame) -> Result<Mat> {
    let expected = (frame.width as usize) * (frame.height as usize) * 3;
    if frame.data.len() != expected {
        bail!(
            "frame buffer holds {} bytes, expected {expected} for {}x{} BGR",
            frame.data.len(),
            frame.width,
            frame.height
        );
    }
    let mut mat = unsafe { Mat::new_rows_cols(frame.height, frame.width, core::CV_8UC3)? };
    mat.data_bytes_mut()?.copy_from_slice(&frame.data);
    Ok(mat)
}
