use thiserror::Error;

/// Raw BGR frame captured from a video source.
pub struct Frame {
    pub data: Vec<u8>,
    pub width: i32,
    pub height: i32,
    pub timestamp_ms: i64,
    pub format: FrameFormat,
}

#[derive(Clone, Copy)]
pub enum FrameFormat {
    Bgr8,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open video source {uri:?}")]
    Open { uri: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A source of frames, polled once per pipeline tick.
///
/// `Ok(None)` means no frame was available this tick (a closed device, a
/// dropped stream packet, or a source that was never opened). The caller is
/// expected to back off briefly and poll again.
pub trait FrameSource: Send {
    fn read(&mut self) -> Result<Option<Frame>, CaptureError>;

    /// Release the underlying device. Subsequent reads yield `Ok(None)`.
    fn release(&mut self) {}
}
