//! Time-of-flight camera driver interface.
//!
//! The driver is an opaque device handle: capture start/stop, a use-case
//! list, exposure get/set, and callbacks fired from the driver's own thread
//! for encoded depth data and confirmed exposure times.

use bytes::Bytes;
use std::sync::Arc;
use strum::Display;
use thiserror::Error;

/// Driver code for a device that is in use by another operation.
pub const CODE_DEVICE_IS_BUSY: i32 = 4100;
/// Driver code for a device that went away.
pub const CODE_DISCONNECTED: i32 = 1026;
/// Driver code for a request the device did not answer in time.
pub const CODE_TIMEOUT: i32 = 1028;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum CameraErrorKind {
    Busy,
    Disconnected,
    Timeout,
    Other,
}

/// Error reported by the camera driver, carrying its numeric code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("camera error {code}: {message}")]
pub struct CameraError {
    pub code: i32,
    pub message: String,
}

impl CameraError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> CameraErrorKind {
        match self.code {
            CODE_DEVICE_IS_BUSY => CameraErrorKind::Busy,
            CODE_DISCONNECTED => CameraErrorKind::Disconnected,
            CODE_TIMEOUT => CameraErrorKind::Timeout,
            _ => CameraErrorKind::Other,
        }
    }
}

pub type CameraResult<T> = std::result::Result<T, CameraError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ExposureMode {
    Manual,
    Automatic,
}

impl ExposureMode {
    pub fn is_automatic(self) -> bool {
        self == ExposureMode::Automatic
    }

    pub fn from_auto(auto: bool) -> Self {
        if auto {
            ExposureMode::Automatic
        } else {
            ExposureMode::Manual
        }
    }
}

/// Exposure range of the active use case, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExposureLimits {
    pub min: u32,
    pub max: u32,
}

/// Called with each encoded depth frame.
pub type DepthDataCallback = Box<dyn Fn(Bytes) + Send + Sync>;

/// Called with the exposure times the device confirmed, one per stream.
pub type ExposureTimeCallback = Box<dyn Fn(&[u32]) + Send + Sync>;

pub trait DepthCamera: Send + Sync {
    fn camera_id(&self) -> CameraResult<String>;

    fn camera_name(&self) -> CameraResult<String>;

    fn max_sensor_width(&self) -> CameraResult<u32>;

    fn max_sensor_height(&self) -> CameraResult<u32>;

    fn use_cases(&self) -> CameraResult<Vec<String>>;

    fn current_use_case(&self) -> CameraResult<String>;

    fn set_use_case(&self, use_case: &str) -> CameraResult<()>;

    fn exposure_mode(&self) -> CameraResult<ExposureMode>;

    fn set_exposure_mode(&self, mode: ExposureMode) -> CameraResult<()>;

    fn exposure_limits(&self) -> CameraResult<ExposureLimits>;

    fn set_exposure_time(&self, micros: u32) -> CameraResult<()>;

    fn frame_rate(&self) -> CameraResult<u16>;

    fn max_frame_rate(&self) -> CameraResult<u16>;

    fn start_capture(&self) -> CameraResult<()>;

    fn stop_capture(&self) -> CameraResult<()>;

    fn add_encoded_depth_data_callback(&self, callback: DepthDataCallback);

    fn add_exposure_time_callback(&self, callback: ExposureTimeCallback);

    /// Stop capturing and release the device. Safe to call more than once.
    fn close(&self);
}

/// Source of attached cameras.
pub trait CameraProvider: Send + Sync {
    /// Open the first available camera; `Ok(None)` when none is attached.
    fn open_camera(&self) -> CameraResult<Option<Arc<dyn DepthCamera>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_from_code() {
        assert_eq!(CameraError::new(4100, "busy").kind(), CameraErrorKind::Busy);
        assert_eq!(
            CameraError::new(1026, "gone").kind(),
            CameraErrorKind::Disconnected
        );
        assert_eq!(CameraError::new(1028, "slow").kind(), CameraErrorKind::Timeout);
        assert_eq!(CameraError::new(7, "?").kind(), CameraErrorKind::Other);
        assert_eq!(
            CameraError::new(1026, "gone").to_string(),
            "camera error 1026: gone"
        );
    }

    #[test]
    fn test_exposure_mode_from_auto() {
        assert!(ExposureMode::from_auto(true).is_automatic());
        assert_eq!(ExposureMode::from_auto(false), ExposureMode::Manual);
    }
}
