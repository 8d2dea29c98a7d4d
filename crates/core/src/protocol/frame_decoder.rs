use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use image::imageops::FilterType;

use crate::session::stream_error::StreamError;
use crate::shared::constants::{DEFAULT_MAX_PAYLOAD_BYTES, DEFAULT_MAX_RESOLUTION, MIN_BASE64_LEN};
use crate::shared::frame::Frame;

/// A client image decoded to RGB at processing resolution.
#[derive(Clone, Debug)]
pub struct DecodedFrame {
    pub frame: Frame,
    /// Multiplier from processing coordinates back to client pixels.
    pub scale: f64,
}

/// Validates and decodes base64 image payloads from `video_frame` events.
#[derive(Clone, Debug)]
pub struct FrameDecoder {
    max_payload_bytes: usize,
    max_resolution: [u32; 2],
}

impl FrameDecoder {
    pub fn new(max_payload_bytes: usize, max_resolution: [u32; 2]) -> Self {
        Self {
            max_payload_bytes,
            max_resolution: [max_resolution[0].max(1), max_resolution[1].max(1)],
        }
    }

    pub fn decode(&self, data: &str, frame_id: u64) -> Result<DecodedFrame, StreamError> {
        let encoded = strip_data_uri(data.trim());
        if encoded.is_empty() {
            return Err(StreamError::validation("No image data provided"));
        }
        if encoded.len() < MIN_BASE64_LEN {
            return Err(StreamError::validation("Image data too short"));
        }
        // Reject before decoding when the text alone proves the payload too big.
        if encoded.len() / 4 * 3 > self.max_payload_bytes + 2 {
            return Err(self.too_large(encoded.len() / 4 * 3));
        }

        let bytes = BASE64_STANDARD
            .decode(encoded)
            .map_err(|e| StreamError::validation(format!("Invalid base64 image data: {e}")))?;
        if bytes.len() > self.max_payload_bytes {
            return Err(self.too_large(bytes.len()));
        }

        let rgb = image::load_from_memory(&bytes)
            .map_err(|e| StreamError::validation(format!("Invalid image format: {e}")))?
            .to_rgb8();
        let (width, height) = rgb.dimensions();
        if width == 0 || height == 0 {
            return Err(StreamError::validation("Image has no pixels"));
        }

        let [max_w, max_h] = self.max_resolution;
        if width <= max_w && height <= max_h {
            return Ok(DecodedFrame {
                frame: Frame::new(rgb.into_raw(), width, height, 3, frame_id),
                scale: 1.0,
            });
        }

        let factor = (max_w as f64 / width as f64).min(max_h as f64 / height as f64);
        let new_w = ((width as f64 * factor).round() as u32).clamp(1, max_w);
        let new_h = ((height as f64 * factor).round() as u32).clamp(1, max_h);
        let resized = image::imageops::resize(&rgb, new_w, new_h, FilterType::Triangle);
        log::debug!("Frame {frame_id}: downscaled {width}x{height} to {new_w}x{new_h}");

        Ok(DecodedFrame {
            frame: Frame::new(resized.into_raw(), new_w, new_h, 3, frame_id),
            scale: width as f64 / new_w as f64,
        })
    }

    fn too_large(&self, size: usize) -> StreamError {
        StreamError::PayloadTooLarge(format!(
            "Image payload of {size} bytes exceeds limit of {} bytes",
            self.max_payload_bytes
        ))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_BYTES, DEFAULT_MAX_RESOLUTION)
    }
}

/// Removes a `data:image/...;base64,` prefix if present.
pub fn strip_data_uri(data: &str) -> &str {
    if data.starts_with("data:") {
        if let Some((_, payload)) = data.split_once(',') {
            return payload;
        }
    }
    data
}
