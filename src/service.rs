//! Host-facing operations of the bridge.
//!
//! Hot-plug, reset and health-check triggers from the host environment land
//! here and are turned into coordinator requests.

use crate::coordinator::{Coordinator, SensorHealth};
use crate::device::{DepthCameraSensor, PipelineConfig};
use crate::error::{BridgeError, Result};
use crate::input::camera::{CameraProvider, CameraResult};
use crate::ndsi::SensorAttach;
use crate::sensors::link::spawn_release;
use crate::sensors::{PipelineStats, Scheduler, Sensor};
use log::{info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Serialize)]
pub struct SensorStatus {
    pub uuid: String,
    pub name: String,
    pub sensor_type: String,
    pub pipeline: Option<PipelineStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub listen_address: Option<String>,
    pub sensors: Vec<SensorStatus>,
}

/// Clears the in-progress flag when an attach attempt ends, however it ends.
struct AttachGuard<'a>(&'a AtomicBool);

impl Drop for AttachGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct BridgeService {
    coordinator: Coordinator,
    provider: Arc<dyn CameraProvider>,
    scheduler: Arc<dyn Scheduler>,
    pipeline: PipelineConfig,
    connecting: AtomicBool,
}

impl BridgeService {
    pub fn new(
        coordinator: Coordinator,
        provider: Arc<dyn CameraProvider>,
        scheduler: Arc<dyn Scheduler>,
        pipeline: PipelineConfig,
    ) -> Self {
        Self {
            coordinator,
            provider,
            scheduler,
            pipeline,
            connecting: AtomicBool::new(false),
        }
    }

    /// Open the next available camera and attach it as a sensor. Only one
    /// attach runs at a time; concurrent calls fail with `AttachInProgress`.
    pub async fn attach(&self) -> Result<SensorAttach> {
        if self.connecting.swap(true, Ordering::SeqCst) {
            warn!("Already in the process of connecting existing device");
            return Err(BridgeError::AttachInProgress);
        }
        let _guard = AttachGuard(&self.connecting);

        let provider = self.provider.clone();
        let notifier = self.coordinator.ready_notifier();
        let scheduler = self.scheduler.clone();
        let pipeline = self.pipeline.clone();
        let opened = tokio::task::spawn_blocking(move || -> CameraResult<Option<Arc<DepthCameraSensor>>> {
            let Some(camera) = provider.open_camera()? else {
                return Ok(None);
            };
            match DepthCameraSensor::open(camera.clone(), notifier, scheduler, pipeline) {
                Ok(sensor) => Ok(Some(sensor)),
                Err(e) => {
                    camera.close();
                    Err(e)
                }
            }
        })
        .await
        .map_err(|e| BridgeError::IoError(std::io::Error::other(e)))??;

        let Some(sensor) = opened else {
            info!("No camera attached");
            return Err(BridgeError::NoCamera);
        };
        info!("Opened camera {}", sensor.identity().name);

        match self.coordinator.add_sensor(sensor.clone()).await {
            Ok(descriptor) => Ok(descriptor),
            Err(e) => {
                let _ = spawn_release(sensor).await;
                Err(e)
            }
        }
    }

    /// Rebind every sensor (soft) or recreate every sensor link (hard).
    pub async fn restart_manager(&self, soft: bool) -> Result<()> {
        self.coordinator.reset_network(soft).await
    }

    pub async fn detach_all(&self) -> Result<usize> {
        self.coordinator.remove_all_sensors().await
    }

    pub async fn check_all_sensors(&self) -> Result<Vec<SensorHealth>> {
        self.coordinator.check_all_sensors().await
    }

    pub fn status(&self) -> ServiceStatus {
        let mut sensors: Vec<SensorStatus> = self
            .coordinator
            .sensors()
            .iter()
            .map(|sensor| {
                let identity = sensor.identity();
                SensorStatus {
                    uuid: identity.uuid_string(),
                    name: identity.name.clone(),
                    sensor_type: identity.sensor_type.clone(),
                    pipeline: sensor.pipeline_stats(),
                }
            })
            .collect();
        sensors.sort_by(|a, b| a.name.cmp(&b.name));

        ServiceStatus {
            listen_address: self.coordinator.listen_address(),
            sensors,
        }
    }

    /// One log line per sensor with its queue depth and last compression.
    pub fn log_status(&self) {
        let status = self.status();
        if status.sensors.is_empty() {
            info!("[Status] No sensors attached");
            return;
        }
        for sensor in &status.sensors {
            match &sensor.pipeline {
                Some(stats) => info!(
                    "[Status] {} queue={} dropped={} compressed={}B uncompressed={}B ratio={:.2} time={}us",
                    sensor.name,
                    stats.queued,
                    stats.dropped,
                    stats.last_compression.compressed_size,
                    stats.last_compression.uncompressed_size,
                    stats.last_compression.ratio(),
                    stats.last_compression.time_micros
                ),
                None => info!("[Status] {}", sensor.name),
            }
        }
    }
}
