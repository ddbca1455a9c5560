//! Simulated time-of-flight camera.
//!
//! Produces synthetic depth frames on its own thread at the active use
//! case's frame rate and confirms exposure changes through the exposure
//! callback, like a real driver would.

use crate::input::camera::{
    CODE_DISCONNECTED, CameraError, CameraProvider, CameraResult, DepthCamera, DepthDataCallback,
    ExposureLimits, ExposureMode, ExposureTimeCallback,
};
use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Auto exposure re-evaluates every this many frames.
const AUTO_EXPOSURE_PERIOD: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedUseCase {
    pub name: String,
    pub frame_rate: u16,
    pub exposure: ExposureLimits,
}

impl SimulatedUseCase {
    pub fn new(name: &str, frame_rate: u16, min: u32, max: u32) -> Self {
        Self {
            name: name.to_string(),
            frame_rate,
            exposure: ExposureLimits { min, max },
        }
    }
}

/// Use cases of a small time-of-flight module.
pub fn default_use_cases() -> Vec<SimulatedUseCase> {
    vec![
        SimulatedUseCase::new("MODE_9_5FPS_2000", 5, 1, 2000),
        SimulatedUseCase::new("MODE_9_10FPS_1000", 10, 1, 1000),
        SimulatedUseCase::new("MODE_9_15FPS_700", 15, 1, 700),
        SimulatedUseCase::new("MODE_9_25FPS_450", 25, 1, 450),
        SimulatedUseCase::new("MODE_5_45FPS_500", 45, 1, 500),
    ]
}

struct CameraState {
    use_case: usize,
    mode: ExposureMode,
    exposure: u32,
    open: bool,
    fail_next: Option<CameraError>,
    disconnected: bool,
}

struct Inner {
    id: String,
    name: String,
    width: u32,
    height: u32,
    use_cases: Vec<SimulatedUseCase>,
    state: Mutex<CameraState>,
    depth_callbacks: RwLock<Vec<DepthDataCallback>>,
    exposure_callbacks: RwLock<Vec<ExposureTimeCallback>>,
    capturing: AtomicBool,
    frames: AtomicU64,
}

impl Inner {
    /// Fail with an injected error or a disconnect, if any.
    fn check(&self) -> CameraResult<()> {
        let mut state = self.state.lock();
        if let Some(error) = state.fail_next.take() {
            return Err(error);
        }
        if state.disconnected {
            return Err(CameraError::new(CODE_DISCONNECTED, "device disconnected"));
        }
        Ok(())
    }

    fn active_use_case(&self) -> &SimulatedUseCase {
        let index = self.state.lock().use_case;
        &self.use_cases[index.min(self.use_cases.len() - 1)]
    }

    fn confirm_exposure(&self, exposure: u32) {
        // Two streams per frame, the second one carries the depth exposure.
        let times = [exposure / 4, exposure];
        for callback in self.exposure_callbacks.read().iter() {
            callback(&times);
        }
    }

    fn synthesize_frame(&self, frame: u64) -> Bytes {
        let mut rng = rand::thread_rng();
        let mut buf = BytesMut::with_capacity((self.width * self.height * 2) as usize);
        let wave = (frame % 200) as u32;
        for y in 0..self.height {
            for x in 0..self.width {
                let base = 500 + (x + y + wave) % 1500;
                let noise: i32 = rng.gen_range(-8..=8);
                buf.put_u16_le((base as i32 + noise).clamp(0, u16::MAX as i32) as u16);
            }
        }
        buf.freeze()
    }

    fn capture_loop(self: Arc<Self>) {
        info!("[Sim] Camera {} capture started", self.id);
        let mut rng = rand::thread_rng();
        while self.capturing.load(Ordering::SeqCst) {
            let use_case = self.active_use_case().clone();
            let frame = self.frames.fetch_add(1, Ordering::Relaxed);

            let payload = self.synthesize_frame(frame);
            for callback in self.depth_callbacks.read().iter() {
                callback(payload.clone());
            }

            if frame % AUTO_EXPOSURE_PERIOD == 0 {
                let exposure = {
                    let mut state = self.state.lock();
                    if state.mode.is_automatic() {
                        let limits = use_case.exposure;
                        state.exposure = rng.gen_range(limits.min..=limits.max);
                        Some(state.exposure)
                    } else {
                        None
                    }
                };
                if let Some(exposure) = exposure {
                    self.confirm_exposure(exposure);
                }
            }

            let period = 1.0 / f64::from(use_case.frame_rate.max(1));
            std::thread::sleep(Duration::from_secs_f64(period));
        }
        info!("[Sim] Camera {} capture stopped", self.id);
    }
}

/// Software stand-in for a depth camera.
pub struct SimulatedCamera {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedCamera {
    pub fn new(id: &str, width: u32, height: u32, use_cases: Vec<SimulatedUseCase>) -> Self {
        let use_cases = if use_cases.is_empty() {
            default_use_cases()
        } else {
            use_cases
        };
        let exposure = use_cases[0].exposure.max;
        Self {
            inner: Arc::new(Inner {
                id: id.to_string(),
                name: "Simulated ToF".to_string(),
                width,
                height,
                use_cases,
                state: Mutex::new(CameraState {
                    use_case: 0,
                    mode: ExposureMode::Automatic,
                    exposure,
                    open: true,
                    fail_next: None,
                    disconnected: false,
                }),
                depth_callbacks: RwLock::new(Vec::new()),
                exposure_callbacks: RwLock::new(Vec::new()),
                capturing: AtomicBool::new(false),
                frames: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Make the next fallible driver call fail with `error`.
    pub fn inject_error(&self, error: CameraError) {
        self.inner.state.lock().fail_next = Some(error);
    }

    /// Simulate unplugging the device: every call fails until reopened.
    pub fn disconnect(&self) {
        self.inner.state.lock().disconnected = true;
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().open
    }

    pub fn is_capturing(&self) -> bool {
        self.inner.capturing.load(Ordering::SeqCst)
    }

    pub fn current_exposure(&self) -> u32 {
        self.inner.state.lock().exposure
    }

    fn reopen(&self) {
        let mut state = self.inner.state.lock();
        state.open = true;
        state.disconnected = false;
        state.fail_next = None;
        drop(state);
        self.inner.depth_callbacks.write().clear();
        self.inner.exposure_callbacks.write().clear();
    }
}

impl DepthCamera for SimulatedCamera {
    fn camera_id(&self) -> CameraResult<String> {
        Ok(self.inner.id.clone())
    }

    fn camera_name(&self) -> CameraResult<String> {
        Ok(self.inner.name.clone())
    }

    fn max_sensor_width(&self) -> CameraResult<u32> {
        Ok(self.inner.width)
    }

    fn max_sensor_height(&self) -> CameraResult<u32> {
        Ok(self.inner.height)
    }

    fn use_cases(&self) -> CameraResult<Vec<String>> {
        Ok(self.inner.use_cases.iter().map(|u| u.name.clone()).collect())
    }

    fn current_use_case(&self) -> CameraResult<String> {
        Ok(self.inner.active_use_case().name.clone())
    }

    fn set_use_case(&self, use_case: &str) -> CameraResult<()> {
        self.inner.check()?;
        let index = self
            .inner
            .use_cases
            .iter()
            .position(|u| u.name == use_case)
            .ok_or_else(|| CameraError::new(3, format!("unknown use case {}", use_case)))?;

        let exposure = {
            let mut state = self.inner.state.lock();
            state.use_case = index;
            let limits = self.inner.use_cases[index].exposure;
            state.exposure = state.exposure.clamp(limits.min, limits.max);
            state.exposure
        };
        info!("[Sim] Camera {} switched to use case {}", self.inner.id, use_case);
        self.inner.confirm_exposure(exposure);
        Ok(())
    }

    fn exposure_mode(&self) -> CameraResult<ExposureMode> {
        Ok(self.inner.state.lock().mode)
    }

    fn set_exposure_mode(&self, mode: ExposureMode) -> CameraResult<()> {
        self.inner.check()?;
        self.inner.state.lock().mode = mode;
        debug!("[Sim] Camera {} exposure mode {}", self.inner.id, mode);
        Ok(())
    }

    fn exposure_limits(&self) -> CameraResult<ExposureLimits> {
        Ok(self.inner.active_use_case().exposure)
    }

    fn set_exposure_time(&self, micros: u32) -> CameraResult<()> {
        self.inner.check()?;
        let limits = self.inner.active_use_case().exposure;
        if micros < limits.min || micros > limits.max {
            return Err(CameraError::new(
                4,
                format!("exposure {} outside {}..={}", micros, limits.min, limits.max),
            ));
        }
        let exposure = {
            let mut state = self.inner.state.lock();
            if state.mode.is_automatic() {
                return Err(CameraError::new(5, "exposure is managed automatically"));
            }
            state.exposure = micros;
            micros
        };
        self.inner.confirm_exposure(exposure);
        Ok(())
    }

    fn frame_rate(&self) -> CameraResult<u16> {
        Ok(self.inner.active_use_case().frame_rate)
    }

    fn max_frame_rate(&self) -> CameraResult<u16> {
        Ok(self.inner.active_use_case().frame_rate)
    }

    fn start_capture(&self) -> CameraResult<()> {
        self.inner.check()?;
        if self.inner.capturing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name(format!("sim-camera-{}", self.inner.id))
            .spawn(move || inner.capture_loop())
            .map_err(|e| CameraError::new(1, e.to_string()))?;
        *self.worker.lock() = Some(handle);
        Ok(())
    }

    fn stop_capture(&self) -> CameraResult<()> {
        self.inner.capturing.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn add_encoded_depth_data_callback(&self, callback: DepthDataCallback) {
        self.inner.depth_callbacks.write().push(callback);
    }

    fn add_exposure_time_callback(&self, callback: ExposureTimeCallback) {
        self.inner.exposure_callbacks.write().push(callback);
    }

    fn close(&self) {
        let _ = self.stop_capture();
        let mut state = self.inner.state.lock();
        if state.open {
            state.open = false;
            info!("[Sim] Camera {} closed", self.inner.id);
        }
    }
}

impl Drop for SimulatedCamera {
    fn drop(&mut self) {
        self.inner.capturing.store(false, Ordering::SeqCst);
    }
}

/// A fixed set of simulated cameras, handed out one per attach.
pub struct SimulatedCameraProvider {
    cameras: Vec<Arc<SimulatedCamera>>,
    handed_out: Mutex<Vec<bool>>,
}

impl SimulatedCameraProvider {
    pub fn new(count: usize) -> Self {
        Self::with_resolution(count, 224, 172)
    }

    pub fn with_resolution(count: usize, width: u32, height: u32) -> Self {
        let cameras: Vec<_> = (0..count)
            .map(|n| {
                Arc::new(SimulatedCamera::new(
                    &format!("SIM-{:04}", n + 1),
                    width,
                    height,
                    default_use_cases(),
                ))
            })
            .collect();
        Self {
            handed_out: Mutex::new(vec![false; cameras.len()]),
            cameras,
        }
    }
}

impl CameraProvider for SimulatedCameraProvider {
    fn open_camera(&self) -> CameraResult<Option<Arc<dyn DepthCamera>>> {
        let mut handed_out = self.handed_out.lock();
        for (camera, taken) in self.cameras.iter().zip(handed_out.iter_mut()) {
            // A closed camera is free to be opened again.
            if *taken && camera.is_open() {
                continue;
            }
            camera.reopen();
            *taken = true;
            info!("[Sim] Opened camera {}", camera.inner.id);
            return Ok(Some(camera.clone()));
        }
        Ok(None)
    }
}
