use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame is empty")]
    Empty,
    #[error("unrecognised image format")]
    UnknownFormat,
    #[error("unreadable image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("image has zero width or height")]
    ZeroSized,
}

/// A captured camera frame whose bytes are known to decode.
///
/// The original encoded bytes are kept (not the decoded pixels) so they can be
/// forwarded unchanged to the detector and verifier. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct Frame {
    bytes: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub format: image::ImageFormat,
}

impl Frame {
    /// Validate raw upload bytes and record their dimensions.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.is_empty() {
            return Err(FrameError::Empty);
        }
        let format = image::guess_format(bytes).map_err(|_| FrameError::UnknownFormat)?;
        let img = image::load_from_memory_with_format(bytes, format)?;
        if img.width() == 0 || img.height() == 0 {
            return Err(FrameError::ZeroSized);
        }

        Ok(Self {
            bytes: Arc::from(bytes),
            width: img.width(),
            height: img.height(),
            format,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}
