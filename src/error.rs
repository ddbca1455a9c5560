use crate::input::camera::CameraError;
use std::time::Duration;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum BridgeError {
    #[error("No listen address available")]
    NoListenAddress,

    #[error("Failed to bind socket on {endpoint}: {reason}")]
    BindFailed { endpoint: String, reason: String },

    #[error("Socket bind timed out after {0:?}")]
    BindTimeout(Duration),

    #[error("Sensor sockets are not bound")]
    NotBound,

    #[error("Sensor link is closed")]
    LinkClosed,

    #[error("Failed to send on {socket} socket: {reason}")]
    SendFailed { socket: &'static str, reason: String },

    #[error("Failed to receive on command socket: {0}")]
    ReceiveFailed(String),

    #[error("Sensor not found: {0}")]
    SensorNotFound(String),

    #[error("Sensor coordinator is not running")]
    CoordinatorStopped,

    #[error("Camera is already being connected")]
    AttachInProgress,

    #[error("No camera available")]
    NoCamera,

    #[error(transparent)]
    Camera(#[from] CameraError),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
