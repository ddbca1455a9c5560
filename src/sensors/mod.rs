//! Sensor abstraction shared by every NDSI sensor type.
//!
//! A [`Sensor`] is the hardware-facing half: identity, frame source, control
//! registry and health check. The network-facing half (sockets, sequence
//! counters, command polling) is the [`SensorLink`] the coordinator wraps
//! around it.

pub mod controls;
pub mod link;
pub mod notifier;
pub mod scheduler;

pub use controls::{ControlHandle, ControlRegistry, ControlUpdate, IntRange};
pub use link::{LinkState, SensorLink};
pub use notifier::ReadyNotifier;
pub use scheduler::{ScheduledTask, Scheduler, TokioScheduler};

use crate::ndsi::ControlValue;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

/// Stable identity of a sensor on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorIdentity {
    pub uuid: Uuid,
    pub name: String,
    pub sensor_type: String,
}

impl SensorIdentity {
    /// Identity whose UUID is derived from a hardware identifier, so the same
    /// device keeps its UUID across reattachments.
    pub fn from_device_id(device_id: &str, name: impl Into<String>, sensor_type: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v3(&Uuid::NAMESPACE_OID, device_id.as_bytes()),
            name: name.into(),
            sensor_type: sensor_type.into(),
        }
    }

    /// Hyphenated UUID string, as sent in the first part of every message.
    pub fn uuid_string(&self) -> String {
        self.uuid.hyphenated().to_string()
    }
}

/// A frame ready for publication.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub flag: u32,
    /// Capture time in seconds.
    pub timestamp: f64,
    pub extra: i32,
    pub payload: Bytes,
}

/// Last compression result of a frame pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CompressionInfo {
    pub compressed_size: usize,
    pub uncompressed_size: usize,
    pub time_micros: u64,
}

impl CompressionInfo {
    pub fn ratio(&self) -> f64 {
        if self.compressed_size == 0 {
            0.0
        } else {
            self.uncompressed_size as f64 / self.compressed_size as f64
        }
    }
}

/// Observable state of a sensor's frame pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub queued: usize,
    pub dropped: u64,
    pub last_compression: CompressionInfo,
}

#[async_trait]
pub trait Sensor: Send + Sync {
    fn identity(&self) -> &SensorIdentity;

    fn width(&self) -> u32;

    fn height(&self) -> u32;

    /// Cheap, non-blocking check for a pending frame.
    fn has_frame(&self) -> bool;

    /// Wait up to `wait` for the next frame; `None` on timeout.
    async fn next_frame(&self, wait: Duration) -> Option<Frame>;

    /// Round-trip health check. Transient hardware errors count as healthy.
    fn ping(&self) -> bool {
        true
    }

    /// State of every control, to resynchronize a fresh subscriber.
    fn refresh_controls(&self) -> Vec<ControlUpdate>;

    /// Apply a client write; returns the control's fresh state on success.
    fn set_control_value(&self, control_id: &str, value: ControlValue) -> Option<ControlUpdate>;

    /// Drain pending control changes.
    fn take_updated_controls(&self) -> Vec<ControlUpdate>;

    /// Release the hardware handle. Called once when the sensor is unlinked.
    fn release(&self) {}

    fn pipeline_stats(&self) -> Option<PipelineStats> {
        None
    }
}
