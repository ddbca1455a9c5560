//! Time-of-flight camera exposed as an NDSI `royale_full` sensor.
//!
//! Frames flow camera callback → [`CaptureQueue`] → `next_frame` (zstd) →
//! the sensor link. Exposure writes are debounced through the injected
//! [`Scheduler`]; the camera's exposure confirmations update the control
//! directly so subscribers always see what the hardware applied.

use super::capture_queue::{CaptureQueue, DEFAULT_CAPACITY, QueuedCapture};
use crate::input::camera::{CameraErrorKind, CameraResult, DepthCamera, ExposureMode};
use crate::ndsi::{ControlChanges, ControlValue, FLAG_ALL, ValueType};
use crate::sensors::{
    CompressionInfo, ControlHandle, ControlRegistry, ControlUpdate, Frame, PipelineStats,
    ReadyNotifier, ScheduledTask, Scheduler, Sensor, SensorIdentity,
};
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

pub const SENSOR_TYPE: &str = "royale_full";

const CONTROL_USE_CASE: &str = "usecase";
const CONTROL_AUTO_EXPOSURE: &str = "auto_exposure";
const CONTROL_EXPOSURE_TIME: &str = "exposure_time";
const CONTROL_FRAME_RATE: &str = "frame_rate";

/// Tunables of the frame pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub queue_capacity: usize,
    pub exposure_debounce: Duration,
    pub compression_level: i32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_CAPACITY,
            exposure_debounce: Duration::from_millis(200),
            compression_level: 1,
        }
    }
}

struct Handles {
    exposure: ControlHandle,
    auto_exposure: ControlHandle,
    min_exposure: ControlHandle,
    max_exposure: ControlHandle,
    frame_rate: ControlHandle,
    max_frame_rate: ControlHandle,
    use_case: ControlHandle,
}

pub struct DepthCameraSensor {
    me: Weak<DepthCameraSensor>,
    identity: SensorIdentity,
    width: u32,
    height: u32,
    camera: Arc<dyn DepthCamera>,
    use_cases: Vec<String>,
    controls: ControlRegistry<DepthCameraSensor>,
    handles: Handles,
    queue: Arc<CaptureQueue>,
    scheduler: Arc<dyn Scheduler>,
    pending_exposure: Mutex<Option<ScheduledTask>>,
    /// Last exposure the hardware reported.
    confirmed_exposure: Mutex<Option<i64>>,
    last_compression: Mutex<CompressionInfo>,
    config: PipelineConfig,
}

fn build_controls(use_cases: &[String]) -> (ControlRegistry<DepthCameraSensor>, Handles) {
    let mut controls: ControlRegistry<DepthCameraSensor> = ControlRegistry::new();

    let exposure = controls.register_control(
        Some(CONTROL_EXPOSURE_TIME),
        Some(Box::new(|s: &DepthCameraSensor, value: &ControlValue| {
            let max = s.controls.get_int(s.handles.max_exposure);
            ControlChanges {
                value: Some(value.clone()),
                readonly: Some(s.controls.get_bool(s.handles.auto_exposure)),
                min: Some(s.controls.get_int(s.handles.min_exposure)),
                max: Some(max),
                default: Some(ControlValue::Int(max)),
                resolution: Some(1),
                dtype: Some(ValueType::Integer.to_string()),
                caption: Some("Exposure time".into()),
                ..Default::default()
            }
        })),
        Some(Box::new(|s: &DepthCameraSensor, value: ControlValue| {
            if let Some(micros) = value.as_int() {
                s.request_exposure(micros);
            }
        })),
        0i64,
        None,
    );
    let auto_exposure = controls.register_bool_control(
        CONTROL_AUTO_EXPOSURE,
        "Auto exposure",
        true,
        Box::new(|s: &DepthCameraSensor, auto| s.apply_auto_exposure(auto)),
    );
    let min_exposure = controls.register_pseudo_control(CONTROL_EXPOSURE_TIME, 0i64);
    let max_exposure = controls.register_pseudo_control(CONTROL_EXPOSURE_TIME, 2000i64);

    let frame_rate = controls.register_control(
        Some(CONTROL_FRAME_RATE),
        Some(Box::new(|s: &DepthCameraSensor, value: &ControlValue| {
            let max = s.controls.get_int(s.handles.max_frame_rate);
            ControlChanges {
                value: Some(value.clone()),
                min: Some(1),
                max: Some(max),
                default: Some(ControlValue::Int(max)),
                readonly: Some(true),
                dtype: Some(ValueType::Integer.to_string()),
                caption: Some("Frame rate".into()),
                ..Default::default()
            }
        })),
        None,
        2i64,
        None,
    );
    let max_frame_rate = controls.register_pseudo_control(CONTROL_FRAME_RATE, 2i64);

    let use_case = controls.register_string_map_control(
        CONTROL_USE_CASE,
        "Use Case",
        0,
        use_cases.to_vec(),
        Box::new(|s: &DepthCameraSensor, index| s.apply_use_case(index)),
    );

    let handles = Handles {
        exposure,
        auto_exposure,
        min_exposure,
        max_exposure,
        frame_rate,
        max_frame_rate,
        use_case,
    };
    (controls, handles)
}

impl DepthCameraSensor {
    /// Wrap an opened camera, hook its callbacks and start capturing.
    pub fn open(
        camera: Arc<dyn DepthCamera>,
        notifier: ReadyNotifier,
        scheduler: Arc<dyn Scheduler>,
        config: PipelineConfig,
    ) -> CameraResult<Arc<Self>> {
        let camera_id = camera.camera_id()?;
        let camera_name = camera.camera_name()?;
        let use_cases = camera.use_cases()?;
        let width = camera.max_sensor_width()?;
        let height = camera.max_sensor_height()?;

        info!("Camera use cases: {:?}", use_cases);
        info!("Camera name: {}", camera_name);
        info!("Camera id: {}", camera_id);
        info!("Camera max sensor size: {}x{}", width, height);

        let (controls, handles) = build_controls(&use_cases);
        let queue = Arc::new(CaptureQueue::new(config.queue_capacity));

        let sensor = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            identity: SensorIdentity::from_device_id(
                &camera_id,
                format!("{} - {}", camera_name, camera_id),
                SENSOR_TYPE,
            ),
            width,
            height,
            camera: camera.clone(),
            use_cases,
            controls,
            handles,
            queue: queue.clone(),
            scheduler,
            pending_exposure: Mutex::new(None),
            confirmed_exposure: Mutex::new(None),
            last_compression: Mutex::new(CompressionInfo::default()),
            config,
        });

        camera.add_encoded_depth_data_callback(Box::new(move |payload| {
            let capture = QueuedCapture {
                payload,
                timestamp_ms: chrono::Utc::now().timestamp_millis(),
            };
            if queue.push(capture) {
                notifier.notify();
            }
        }));
        let me = Arc::downgrade(&sensor);
        camera.add_exposure_time_callback(Box::new(move |times| {
            if let Some(sensor) = me.upgrade() {
                sensor.on_exposure_confirmed(times);
            }
        }));

        camera.start_capture()?;
        sensor.update_control_state()?;
        Ok(sensor)
    }

    /// Re-derive every hardware-dependent control in one refresh.
    fn update_control_state(&self) -> CameraResult<()> {
        let current = self.camera.current_use_case()?;
        let index = self
            .use_cases
            .iter()
            .position(|u| *u == current)
            .map_or(-1, |i| i as i64);
        let auto = self.camera.exposure_mode()?.is_automatic();
        let limits = self.camera.exposure_limits()?;
        let frame_rate = self.camera.frame_rate()?;
        let max_frame_rate = self.camera.max_frame_rate()?;

        let (min, max) = (i64::from(limits.min), i64::from(limits.max));

        // The exposure value itself only follows hardware confirmations.
        let h = &self.handles;
        self.controls.set_all([
            (h.use_case, ControlValue::Int(index)),
            (h.auto_exposure, ControlValue::Bool(auto)),
            (h.min_exposure, ControlValue::Int(min)),
            (h.max_exposure, ControlValue::Int(max)),
            (h.frame_rate, ControlValue::Int(i64::from(frame_rate))),
            (h.max_frame_rate, ControlValue::Int(i64::from(max_frame_rate))),
        ]);
        Ok(())
    }

    fn on_exposure_confirmed(&self, times: &[u32]) {
        let Some(&exposure) = times.get(1).or(times.first()) else {
            return;
        };
        let exposure = i64::from(exposure);
        *self.confirmed_exposure.lock() = Some(exposure);
        self.controls.set(self.handles.exposure, exposure);
    }

    /// Debounced exposure write: supersedes any request not yet applied.
    fn request_exposure(&self, micros: i64) {
        let Ok(value) = u32::try_from(micros) else {
            warn!("{}: Ignoring negative exposure {}", self.identity.name, micros);
            return;
        };

        self.controls.set(self.handles.exposure, micros);

        let camera = self.camera.clone();
        let me = self.me.clone();
        let task = self.scheduler.schedule(
            self.config.exposure_debounce,
            Box::new(move || {
                debug!("Applying exposure time {}", value);
                if let Err(e) = camera.set_exposure_time(value) {
                    warn!("Failed to set exposure time {}: {}", value, e);
                    if let Some(sensor) = me.upgrade() {
                        sensor.revert_exposure();
                    }
                }
            }),
        );
        if let Some(previous) = self.pending_exposure.lock().replace(task) {
            previous.cancel();
        }
    }

    fn revert_exposure(&self) {
        if let Some(confirmed) = *self.confirmed_exposure.lock() {
            self.controls.set(self.handles.exposure, confirmed);
        }
    }

    fn apply_auto_exposure(&self, auto: bool) {
        if let Err(e) = self.camera.set_exposure_mode(ExposureMode::from_auto(auto)) {
            warn!("{}: Failed to set auto exposure={}: {}", self.identity.name, auto, e);
            return;
        }
        if let Err(e) = self.update_control_state() {
            warn!("{}: Failed to refresh controls: {}", self.identity.name, e);
        }
        // Read-only status of the exposure control follows auto exposure.
        self.controls.mark_dirty(CONTROL_EXPOSURE_TIME);
    }

    fn apply_use_case(&self, index: i64) {
        let Some(use_case) = usize::try_from(index)
            .ok()
            .and_then(|i| self.use_cases.get(i))
        else {
            return;
        };
        if let Err(e) = self.camera.set_use_case(use_case) {
            warn!("{}: Failed to set use case {}: {}", self.identity.name, use_case, e);
            return;
        }
        info!("{}: Use case set to {}", self.identity.name, use_case);
        if let Err(e) = self.update_control_state() {
            warn!("{}: Failed to refresh controls: {}", self.identity.name, e);
        }
    }

    fn round_trip(&self) -> CameraResult<()> {
        let original = ExposureMode::from_auto(self.controls.get_bool(self.handles.auto_exposure));
        let min = self.controls.get_int(self.handles.min_exposure);
        let max = self.controls.get_int(self.handles.max_exposure).max(min);
        // Before the first confirmation the tracked value may sit outside the limits.
        let exposure = self.controls.get_int(self.handles.exposure).clamp(min, max);
        let exposure = u32::try_from(exposure).unwrap_or_default();

        self.camera.set_exposure_mode(ExposureMode::Manual)?;
        let checked = self.camera.set_exposure_time(exposure);
        let restored = self.camera.set_exposure_mode(original);
        checked.and(restored)
    }

    pub fn last_compression(&self) -> CompressionInfo {
        *self.last_compression.lock()
    }
}

#[async_trait]
impl Sensor for DepthCameraSensor {
    fn identity(&self) -> &SensorIdentity {
        &self.identity
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn has_frame(&self) -> bool {
        !self.queue.is_empty()
    }

    async fn next_frame(&self, wait: Duration) -> Option<Frame> {
        let capture = self.queue.pop(wait).await?;

        let started = Instant::now();
        let compressed = match zstd::bulk::compress(&capture.payload, self.config.compression_level)
        {
            Ok(compressed) => compressed,
            Err(e) => {
                error!("{}: Failed to compress frame: {}", self.identity.name, e);
                return None;
            }
        };
        let info = CompressionInfo {
            compressed_size: compressed.len(),
            uncompressed_size: capture.payload.len(),
            time_micros: started.elapsed().as_micros() as u64,
        };
        *self.last_compression.lock() = info;
        debug!(
            "{}: compressed {} -> {} bytes ({:.2}x) in {}us",
            self.identity.name,
            info.uncompressed_size,
            info.compressed_size,
            info.ratio(),
            info.time_micros
        );

        let exposure = self.controls.get_int(self.handles.exposure);
        Some(Frame {
            flag: FLAG_ALL,
            timestamp: capture.timestamp_ms as f64 / 1000.0,
            extra: i32::try_from(exposure).unwrap_or(i32::MAX),
            payload: Bytes::from(compressed),
        })
    }

    /// Toggle auto exposure off, re-apply the current exposure and restore
    /// the previous mode.
    fn ping(&self) -> bool {
        match self.round_trip() {
            Ok(()) => true,
            Err(e) => match e.kind() {
                CameraErrorKind::Busy => {
                    warn!("{}: Busy {}", self.identity.name, e);
                    true
                }
                CameraErrorKind::Disconnected | CameraErrorKind::Timeout => {
                    warn!("{}: Disconnected {}", self.identity.name, e);
                    false
                }
                CameraErrorKind::Other => {
                    error!("{}: Ping failed: {:?}", self.identity.name, e);
                    false
                }
            },
        }
    }

    fn refresh_controls(&self) -> Vec<ControlUpdate> {
        self.controls.refresh_controls(self)
    }

    fn set_control_value(&self, control_id: &str, value: ControlValue) -> Option<ControlUpdate> {
        self.controls.set_control_value(self, control_id, value)
    }

    fn take_updated_controls(&self) -> Vec<ControlUpdate> {
        self.controls.take_updated_controls(self)
    }

    fn release(&self) {
        if let Some(pending) = self.pending_exposure.lock().take() {
            pending.cancel();
        }
        self.camera.close();
    }

    fn pipeline_stats(&self) -> Option<PipelineStats> {
        Some(PipelineStats {
            queued: self.queue.len(),
            dropped: self.queue.dropped(),
            last_compression: self.last_compression(),
        })
    }
}
