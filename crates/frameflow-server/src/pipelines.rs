//! Built-in pipelines shipped with the server binary.

use serde_json::json;

use crate::pipeline::{Pipeline, PipelineError, PipelineOutput, PipelineRegistry};

/// Registry with every built-in pipeline.
#[must_use]
pub fn builtin_registry() -> PipelineRegistry {
    PipelineRegistry::new()
        .with_pipeline(JpegInfo)
        .with_pipeline(FrameStats)
}

/// Reads image geometry from the JPEG start-of-frame segment.
#[derive(Debug, Clone, Copy, Default)]
pub struct JpegInfo;

/// Image geometry from a start-of-frame segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Width in pixels.
    pub width: u16,
    /// Height in pixels.
    pub height: u16,
    /// Number of colour components.
    pub components: u8,
    /// Sample precision in bits.
    pub precision: u8,
}

/// Find the start-of-frame header in a JPEG stream.
///
/// Walks the marker segments after SOI until an SOF marker is found. Returns
/// `None` when scan data or end-of-image is reached first, or when the
/// segment structure is truncated.
#[must_use]
pub fn parse_frame_header(data: &[u8]) -> Option<FrameHeader> {
    let mut pos = 2;

    loop {
        if *data.get(pos)? != 0xFF {
            return None;
        }
        // Markers may be preceded by any number of fill bytes.
        while *data.get(pos + 1)? == 0xFF {
            pos += 1;
        }
        let marker = *data.get(pos + 1)?;
        pos += 2;

        match marker {
            // TEM and RSTn carry no length
            0x01 | 0xD0..=0xD7 => continue,
            // SOS or EOI before any SOF
            0xDA | 0xD9 => return None,
            _ => {}
        }

        let len = usize::from(u16::from_be_bytes([*data.get(pos)?, *data.get(pos + 1)?]));
        if len < 2 {
            return None;
        }

        // SOF0..SOF15, excluding DHT (C4), JPG (C8) and DAC (CC)
        if matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC) {
            let segment = data.get(pos + 2..pos + len)?;
            if segment.len() < 6 {
                return None;
            }
            return Some(FrameHeader {
                precision: segment[0],
                height: u16::from_be_bytes([segment[1], segment[2]]),
                width: u16::from_be_bytes([segment[3], segment[4]]),
                components: segment[5],
            });
        }

        pos += len;
    }
}

impl Pipeline for JpegInfo {
    fn name(&self) -> &str {
        "jpeg_info"
    }

    fn process(&self, _frame_index: u64, frame: &[u8]) -> Result<PipelineOutput, PipelineError> {
        let header = parse_frame_header(frame)
            .ok_or_else(|| PipelineError::failed(self.name(), "no start-of-frame segment"))?;

        Ok(json!({
            "width": header.width,
            "height": header.height,
            "components": header.components,
            "precision": header.precision,
            "bytes": frame.len(),
        }))
    }
}

/// Byte-level statistics; works on any frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameStats;

impl Pipeline for FrameStats {
    fn name(&self) -> &str {
        "frame_stats"
    }

    fn process(&self, _frame_index: u64, frame: &[u8]) -> Result<PipelineOutput, PipelineError> {
        let sum: u64 = frame.iter().map(|&b| u64::from(b)).sum();
        let mean = if frame.is_empty() {
            0.0
        } else {
            sum as f64 / frame.len() as f64
        };

        Ok(json!({
            "bytes": frame.len(),
            "mean_byte": mean,
        }))
    }
}
