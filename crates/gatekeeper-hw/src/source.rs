//! Frame source seam for the capture loop.

use crate::frame::Frame;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    /// The source is gone (device unplugged, never opened). Retrying is pointless.
    #[error("capture source unavailable: {0}")]
    Unavailable(String),
    /// A single acquisition failed; the next one may succeed.
    #[error("capture failed: {0}")]
    Transient(String),
}

impl CaptureError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, CaptureError::Unavailable(_))
    }
}

/// Anything that can hand out sequential grayscale frames.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Frame, CaptureError>;

    /// Pull and drop `count` frames so exposure/gain can settle.
    fn discard(&mut self, count: usize) {
        for _ in 0..count {
            if let Err(e) = self.next_frame() {
                tracing::debug!(error = %e, "warmup frame failed");
            }
        }
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Frame, CaptureError> {
        (**self).next_frame()
    }
}
