//! JPEG encoding for annotated and raw frames.

use anyhow::{anyhow, Result};
use image::{codecs::jpeg::JpegEncoder, DynamicImage, RgbaImage};
use video_ingest::Frame;

use crate::vision::annotation;

pub(crate) fn encode_rgba_jpeg(image: RgbaImage, quality: u8) -> Result<Vec<u8>> {
    let rgb = DynamicImage::ImageRgba8(image).to_rgb8();
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

/// Encode an unannotated BGR frame as-is.
pub(crate) fn encode_frame_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    encode_rgba_jpeg(annotation::frame_to_rgba(frame)?, quality)
}

#[cfg(test)]
mod tests {
    use super::*;
    use video_ingest::{Frame, FrameFormat};

    #[test]
    fn raw_frame_encodes_to_jpeg_bytes() {
        let frame = Frame {
            data: vec![64; 32 * 24 * 3],
            width: 32,
            height: 24,
            timestamp_ms: 0,
            format: FrameFormat::Bgr8,
        };
        let jpeg = encode_frame_jpeg(&frame, 85).unwrap();
        // JPEG SOI marker.
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }
}
