//! Frame validation.
//!
//! A frame is accepted when it fits the size limit and carries JPEG
//! start-of-image and end-of-image markers. Nothing here decodes the image;
//! pipelines are expected to cope with a corrupt body between valid markers.

use std::fmt;

use frameflow_proto::{ErrorCode, ServerMessage};

/// JPEG start-of-image marker.
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// JPEG end-of-image marker.
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// Smallest buffer that can hold both markers without overlap.
pub const MIN_FRAME_LEN: usize = JPEG_SOI.len() + JPEG_EOI.len();

/// A rejected frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameError {
    /// Either `InvalidFrame` or `FrameTooLarge`.
    pub code: ErrorCode,
    /// Human readable reason.
    pub detail: String,
}

impl FrameError {
    fn invalid(detail: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidFrame,
            detail: detail.into(),
        }
    }

    /// Convert into the outbound error message.
    #[must_use]
    pub fn into_message(self) -> ServerMessage {
        ServerMessage::error(self.code, self.detail)
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.detail)
    }
}

impl std::error::Error for FrameError {}

/// Stateless frame checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameValidator {
    max_frame_size_bytes: usize,
}

impl FrameValidator {
    /// Create a validator with the given size limit.
    #[must_use]
    pub const fn new(max_frame_size_bytes: usize) -> Self {
        Self {
            max_frame_size_bytes,
        }
    }

    /// Configured size limit.
    #[must_use]
    pub const fn max_frame_size_bytes(&self) -> usize {
        self.max_frame_size_bytes
    }

    /// Check that `frame` is a size-bounded JPEG.
    ///
    /// # Errors
    ///
    /// Returns `FrameTooLarge` when over the limit, otherwise `InvalidFrame`
    /// when a marker is missing or the buffer is too short to hold both.
    pub fn validate(&self, frame: &[u8]) -> Result<(), FrameError> {
        if frame.len() > self.max_frame_size_bytes {
            return Err(FrameError {
                code: ErrorCode::FrameTooLarge,
                detail: format!(
                    "frame is {} bytes, limit is {} bytes",
                    frame.len(),
                    self.max_frame_size_bytes
                ),
            });
        }

        if frame.is_empty() {
            return Err(FrameError::invalid("frame is empty"));
        }

        if frame.len() < MIN_FRAME_LEN {
            return Err(FrameError::invalid(format!(
                "frame is {} bytes, too short for a JPEG image",
                frame.len()
            )));
        }

        if !frame.starts_with(&JPEG_SOI) {
            return Err(FrameError::invalid("missing JPEG start-of-image marker"));
        }

        if !frame.ends_with(&JPEG_EOI) {
            return Err(FrameError::invalid("missing JPEG end-of-image marker"));
        }

        Ok(())
    }
}
