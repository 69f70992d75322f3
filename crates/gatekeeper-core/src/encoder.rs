//! Face detection + embedding seam.
//!
//! How embeddings are computed is outside this crate: anything that turns a
//! grayscale frame into zero or more probes can drive the pipeline.

use crate::types::Probe;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("encoder unavailable: {0}")]
    Unavailable(String),
    #[error("encoding failed: {0}")]
    Failed(String),
    #[error("invalid frame: expected {expected} bytes, got {actual}")]
    InvalidFrame { expected: usize, actual: usize },
}

/// Detects faces in a grayscale frame and returns one probe per face,
/// sorted by detector confidence (best first).
pub trait FaceEncoder: Send {
    fn encode(&mut self, frame: &[u8], width: u32, height: u32) -> Result<Vec<Probe>, EncoderError>;
}

impl<E: FaceEncoder + ?Sized> FaceEncoder for Box<E> {
    fn encode(&mut self, frame: &[u8], width: u32, height: u32) -> Result<Vec<Probe>, EncoderError> {
        (**self).encode(frame, width, height)
    }
}

/// Check that `frame` holds at least `width * height` grayscale bytes.
/// Trailing bytes beyond that are ignored by encoders.
pub fn check_frame_len(frame: &[u8], width: u32, height: u32) -> Result<(), EncoderError> {
    let expected = width as usize * height as usize;
    if frame.len() < expected {
        return Err(EncoderError::InvalidFrame {
            expected,
            actual: frame.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_frame_len() {
        assert!(check_frame_len(&[0u8; 12], 4, 3).is_ok());
        assert!(check_frame_len(&[0u8; 16], 4, 3).is_ok());
        assert!(matches!(
            check_frame_len(&[0u8; 11], 4, 3),
            Err(EncoderError::InvalidFrame { expected: 12, actual: 11 })
        ));
    }
}
