//! gatekeeper-hw: frame acquisition for the recognition pipeline.
//!
//! Provides the `FrameSource` seam the capture loop pulls from, and a
//! V4L2-backed camera implementing it.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use source::{CaptureError, FrameSource};
