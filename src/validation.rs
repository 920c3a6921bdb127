//! Frame validation utilities for test pattern verification.
//!
//! This module checks that captured YUYV payloads contain expected test
//! patterns by sampling luma bytes directly. Useful for integration testing
//! with virtual cameras.

use crate::traits::{Format, FrameMetadata};

/// Luma of the eight 100% SMPTE color bars, in order: White, Yellow, Cyan,
/// Green, Magenta, Red, Blue, Black.
pub const COLOR_BAR_LUMA: [u8; 8] = [235, 210, 170, 145, 106, 81, 41, 16];

/// Tolerance for luma matching.
const LUMA_TOLERANCE: u8 = 15;

/// Minimum luma rise across a gradient frame.
const MIN_GRADIENT_RISE: i32 = 50;

/// Why a frame failed validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The sample point lies outside the payload.
    #[error("no pixel at ({x}, {y}) in a {len}-byte payload")]
    OutOfBounds {
        /// Column.
        x: u32,
        /// Row.
        y: u32,
        /// Payload length.
        len: usize,
    },
    /// A color bar has the wrong luma.
    #[error("color bar {bar} at x={x}: expected luma {expected}, got {actual}")]
    BarMismatch {
        /// Bar number, 0-7.
        bar: usize,
        /// Sampled column.
        x: u32,
        /// Expected luma.
        expected: u8,
        /// Sampled luma.
        actual: u8,
    },
    /// Luma drops along the gradient.
    #[error("gradient not monotonically increasing at x={x}: {luma} < previous {previous}")]
    NotMonotonic {
        /// Sampled column.
        x: u32,
        /// Luma at `x`.
        luma: u8,
        /// Luma at the previous sample.
        previous: u8,
    },
    /// The gradient is too flat to be a ramp.
    #[error("insufficient luma change for gradient: {0} (expected at least {MIN_GRADIENT_RISE})")]
    FlatGradient(i32),
    /// No frames to compare.
    #[error("cannot validate empty frame sequence")]
    EmptySequence,
    /// Sequence numbers skip.
    #[error("frame sequence gap at position {position}: expected {expected}, got {actual}")]
    SequenceGap {
        /// Position in the slice.
        position: usize,
        /// Expected sequence number.
        expected: u32,
        /// Actual sequence number.
        actual: u32,
    },
}

/// Result type for validation.
pub type Result<T> = std::result::Result<T, ValidationError>;

/// Luma of pixel `(x, y)` in a packed YUYV payload.
pub fn luma_at(data: &[u8], format: &Format, x: u32, y: u32) -> Result<u8> {
    let offset = (u64::from(y) * u64::from(format.stride) + u64::from(x) * 2) as usize;
    data.get(offset).copied().ok_or(ValidationError::OutOfBounds {
        x,
        y,
        len: data.len(),
    })
}

/// Validates that a YUYV payload contains the color bar pattern.
///
/// Samples the center of each of the 8 vertical stripes on the middle row.
pub fn validate_color_bars(data: &[u8], format: &Format) -> Result<()> {
    let bar_width = format.width / 8;
    let center_y = format.height / 2;

    for (bar, &expected) in COLOR_BAR_LUMA.iter().enumerate() {
        #[allow(clippy::cast_possible_truncation)]
        let x = (bar as u32 * bar_width) + (bar_width / 2);
        let actual = luma_at(data, format, x, center_y)?;

        if actual.abs_diff(expected) > LUMA_TOLERANCE {
            return Err(ValidationError::BarMismatch {
                bar,
                x,
                expected,
                actual,
            });
        }
    }

    Ok(())
}

/// Validates that a YUYV payload contains a left-to-right gray ramp.
///
/// Luma sampled every 10 pixels along the middle row must not drop by more
/// than 1 and must rise by at least 50 overall.
pub fn validate_gradient(data: &[u8], format: &Format) -> Result<()> {
    let center_y = format.height / 2;
    let mut first = None;
    let mut previous: Option<u8> = None;

    for x in (0..format.width).step_by(10) {
        let luma = luma_at(data, format, x, center_y)?;
        first.get_or_insert(luma);

        if let Some(prev) = previous {
            if luma.saturating_add(1) < prev {
                return Err(ValidationError::NotMonotonic {
                    x,
                    luma,
                    previous: prev,
                });
            }
        }
        previous = Some(luma);
    }

    if let (Some(first), Some(last)) = (first, previous) {
        let rise = i32::from(last) - i32::from(first);
        if rise < MIN_GRADIENT_RISE {
            return Err(ValidationError::FlatGradient(rise));
        }
    }

    Ok(())
}

/// Validates that sequence numbers increment by exactly 1.
pub fn validate_frame_sequence(frames: &[FrameMetadata]) -> Result<()> {
    if frames.is_empty() {
        return Err(ValidationError::EmptySequence);
    }

    for (position, pair) in frames.windows(2).enumerate() {
        if let [prev, curr] = pair {
            let expected = prev.sequence.wrapping_add(1);
            if curr.sequence != expected {
                return Err(ValidationError::SequenceGap {
                    position: position + 1,
                    expected,
                    actual: curr.sequence,
                });
            }
        }
    }

    Ok(())
}
