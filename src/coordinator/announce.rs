//! Discovery announcements for attached and detached sensors.

use crate::ndsi::SensorAttach;
use log::{info, warn};

/// Receives attach descriptors and detach events for network discovery.
pub trait Announcer: Send + Sync {
    fn attach(&self, descriptor: &SensorAttach);

    fn detach(&self, sensor_uuid: &str);
}

/// Writes announcements to the log as `sensor_attach` / `sensor_detach` JSON.
#[derive(Debug, Clone)]
pub struct LoggingAnnouncer {
    host_name: String,
}

impl LoggingAnnouncer {
    pub fn new(host_name: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
        }
    }
}

impl Announcer for LoggingAnnouncer {
    fn attach(&self, descriptor: &SensorAttach) {
        let mut message = match serde_json::to_value(descriptor) {
            Ok(message) => message,
            Err(e) => {
                warn!("[Announce] Failed to encode attach descriptor: {}", e);
                return;
            }
        };
        message["subject"] = "attach".into();
        info!("[Announce] {}: {}", self.host_name, message);
    }

    fn detach(&self, sensor_uuid: &str) {
        let message = serde_json::json!({
            "subject": "detach",
            "sensor_uuid": sensor_uuid,
        });
        info!("[Announce] {}: {}", self.host_name, message);
    }
}

#[cfg(test)]
pub use recording::{Announcement, RecordingAnnouncer};
