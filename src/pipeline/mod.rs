//! Audio pipelines
//!
//! The capture pipeline ("listen") streams device audio to the session
//! server; the playback pipeline ("speak") buffers server audio and drains
//! it into the selected sink. Each runs at most one task at a time, replaced
//! through a cancellation token and a bounded join.

pub mod capture;
pub mod playback;

pub use capture::{AudioCapture, CaptureHost};
pub use playback::{AudioPlayback, FinishedCallback};
