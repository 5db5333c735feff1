//! OpenCV-backed camera capture.

use chrono::Utc;
use opencv::{
    core::{self, MatTraitConstManual},
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait},
};
use tracing::warn;

use crate::types::{CaptureError, Frame, FrameFormat, FrameSource};

/// Synchronous camera source owned by the pipeline's producer thread.
///
/// Frames are resized to `target_size` (width, height) when the device
/// disagrees and handed out as BGR8 byte buffers.
pub struct CameraSource {
    cap: Option<VideoCapture>,
    target: (i32, i32),
    scratch: Mat,
}

impl CameraSource {
    /// Open `uri` (a device index, `/dev/videoN` path, or stream URL).
    ///
    /// Never fails: an unopenable source is logged and the returned instance
    /// simply yields no frames, so the pipeline runs degraded instead of
    /// refusing to start.
    pub fn open(uri: &str, target_size: (i32, i32)) -> Self {
        let cap = match open_video_capture(uri) {
            Ok(mut cap) => {
                configure_camera(&mut cap, target_size, 30.0);
                Some(cap)
            }
            Err(err) => {
                warn!("Unable to open camera source {uri}: {err}");
                None
            }
        };
        Self {
            cap,
            target: target_size,
            scratch: Mat::default(),
        }
    }
}

impl FrameSource for CameraSource {
    fn read(&mut self) -> Result<Option<Frame>, CaptureError> {
        let Some(cap) = self.cap.as_mut() else {
            return Ok(None);
        };

        let mut frame = Mat::default();
        let grabbed = cap
            .read(&mut frame)
            .map_err(|e| CaptureError::Other(e.into()))?;
        if !grabbed {
            return Ok(None);
        }

        let size = frame.size().map_err(|e| CaptureError::Other(e.into()))?;
        if size.width <= 0 || size.height <= 0 {
            return Ok(None);
        }

        let (target_w, target_h) = self.target;
        let working = if size.width != target_w || size.height != target_h {
            opencv::imgproc::resize(
                &frame,
                &mut self.scratch,
                core::Size {
                    width: target_w,
                    height: target_h,
                },
                0.0,
                0.0,
                opencv::imgproc::INTER_LINEAR,
            )
            .map_err(|e| CaptureError::Other(e.into()))?;
            &self.scratch
        } else {
            &frame
        };

        let data = working
            .data_bytes()
            .map_err(|e| CaptureError::Other(e.into()))?
            .to_vec();

        Ok(Some(Frame {
            data,
            width: target_w,
            height: target_h,
            timestamp_ms: Utc::now().timestamp_millis(),
            format: FrameFormat::Bgr8,
        }))
    }

    fn release(&mut self) {
        self.cap = None;
    }
}

/// Parse a `/dev/videoX` style URI and return the zero-based index if present.
pub fn parse_device_index(uri: &str) -> Option<i32> {
    if let Ok(index) = uri.parse::<i32>() {
        return Some(index);
    }
    if let Some(stripped) = uri.strip_prefix("/dev/video") {
        if stripped.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(index) = stripped.parse::<i32>() {
                return Some(index);
            }
        }
    }
    None
}

/// Attempt to open a camera input either by index or URI.
fn open_video_capture(uri: &str) -> Result<VideoCapture, CaptureError> {
    if let Some(index) = parse_device_index(uri) {
        for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
            match VideoCapture::new(index, backend) {
                Ok(cap) => {
                    if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                        return Ok(cap);
                    }
                }
                Err(err) => {
                    warn!("failed to open device #{index} with backend {backend}: {err}");
                }
            }
        }
    }

    for backend in [videoio::CAP_V4L, videoio::CAP_ANY] {
        match VideoCapture::from_file(uri, backend) {
            Ok(cap) => {
                if cap.is_opened().map_err(|e| CaptureError::Other(e.into()))? {
                    return Ok(cap);
                }
            }
            Err(err) => {
                warn!("failed to open {uri} with backend {backend}: {err}");
            }
        }
    }

    Err(CaptureError::Open {
        uri: uri.to_string(),
    })
}

/// Apply common capture settings (resolution, fps, preferred pixel format).
fn configure_camera(cap: &mut VideoCapture, target_size: (i32, i32), fps: f64) {
    let mut fourcc_set = false;
    if let Ok(mjpg) = videoio::VideoWriter::fourcc('M', 'J', 'P', 'G') {
        if matches!(cap.set(videoio::CAP_PROP_FOURCC, mjpg as f64), Ok(true)) {
            fourcc_set = true;
        }
    }
    if !fourcc_set {
        if let Ok(yuyv) = videoio::VideoWriter::fourcc('Y', 'U', 'Y', 'V') {
            let _ = cap.set(videoio::CAP_PROP_FOURCC, yuyv as f64);
        }
    }
    let _ = cap.set(videoio::CAP_PROP_FRAME_WIDTH, target_size.0 as f64);
    let _ = cap.set(videoio::CAP_PROP_FRAME_HEIGHT, target_size.1 as f64);
    let _ = cap.set(videoio::CAP_PROP_FPS, fps);
}
