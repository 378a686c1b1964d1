pub mod capture;
pub mod election_closer;

pub use capture::{run_capture, CaptureConfig, CaptureError, CaptureState, CaptureStatus, CardCapture, FrameSource};
pub use election_closer::check_expired_elections_task;
