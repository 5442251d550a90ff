//! JPEG frame validation.
//!
//! Cheap structural checks on captured frames: marker framing and the
//! dimensions declared in the start-of-frame header. Used by the demo binary
//! before writing images and by the hardware integration tests.

use crate::traits::{CameraError, Resolution, Result};

const MARKER: u8 = 0xFF;
const SOI: u8 = 0xD8;
const EOI: u8 = 0xD9;
const SOS: u8 = 0xDA;
const TEM: u8 = 0x01;

/// Validates that a buffer is framed as a single JPEG image.
///
/// Checks for the SOI marker at the start and an EOI marker at the end.
/// Some drivers pad MJPEG buffers, so trailing zero bytes after EOI are
/// accepted.
///
/// # Errors
///
/// Returns `InvalidFrame` if either marker is missing.
pub fn validate_jpeg(frame: &[u8]) -> Result<()> {
    if frame.len() < 4 {
        return Err(CameraError::InvalidFrame(format!(
            "{} bytes is too short for a JPEG",
            frame.len()
        )));
    }

    if !frame.starts_with(&[MARKER, SOI]) {
        return Err(CameraError::InvalidFrame("missing SOI marker".to_owned()));
    }

    let end = frame
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |last| last + 1);
    let trimmed = frame.get(..end).unwrap_or_default();
    if !trimmed.ends_with(&[MARKER, EOI]) {
        return Err(CameraError::InvalidFrame("missing EOI marker".to_owned()));
    }

    Ok(())
}

/// Reads the image size from the first start-of-frame header.
///
/// Returns `None` when the buffer is not a JPEG or the scan starts before
/// any SOF segment.
pub fn jpeg_dimensions(frame: &[u8]) -> Option<Resolution> {
    if !frame.starts_with(&[MARKER, SOI]) {
        return None;
    }

    let mut pos = 2;
    loop {
        if *frame.get(pos)? != MARKER {
            return None;
        }
        // Markers may be preceded by any number of fill bytes.
        while *frame.get(pos)? == MARKER {
            pos += 1;
        }
        let marker = *frame.get(pos)?;
        pos += 1;

        if marker == TEM || (0xD0..=0xD7).contains(&marker) {
            continue;
        }
        if marker == SOS || marker == EOI {
            return None;
        }

        let length = usize::from(read_u16(frame, pos)?);
        if length < 2 {
            return None;
        }

        if is_sof(marker) {
            // Segment: length(2) precision(1) height(2) width(2).
            let height = read_u16(frame, pos + 3)?;
            let width = read_u16(frame, pos + 5)?;
            if width == 0 || height == 0 {
                return None;
            }
            return Some(Resolution::new(u32::from(width), u32::from(height)));
        }

        pos += length;
    }
}

/// Validates JPEG framing and that the declared size matches `expected`.
///
/// # Errors
///
/// Returns `InvalidFrame` if the buffer is not a JPEG, declares no size,
/// or declares a different size.
pub fn validate_dimensions(frame: &[u8], expected: Resolution) -> Result<()> {
    validate_jpeg(frame)?;

    let actual = jpeg_dimensions(frame)
        .ok_or_else(|| CameraError::InvalidFrame("no start-of-frame header".to_owned()))?;
    if actual != expected {
        return Err(CameraError::InvalidFrame(format!(
            "expected {expected}, got {actual}"
        )));
    }

    Ok(())
}

/// SOF0 through SOF15, excluding DHT, JPG and DAC which share the range.
const fn is_sof(marker: u8) -> bool {
    matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC)
}

fn read_u16(buf: &[u8], pos: usize) -> Option<u16> {
    let hi = *buf.get(pos)?;
    let lo = *buf.get(pos + 1)?;
    Some(u16::from_be_bytes([hi, lo]))
}
