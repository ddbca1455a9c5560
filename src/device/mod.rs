//! Concrete NDSI sensors backed by camera hardware.

pub mod capture_queue;
pub mod depth_camera;

pub use capture_queue::{CaptureQueue, QueuedCapture};
pub use depth_camera::{DepthCameraSensor, PipelineConfig, SENSOR_TYPE};
