//! Simulated hardware for running the bridge without a camera attached.

mod camera;

pub use camera::{SimulatedCamera, SimulatedCameraProvider, SimulatedUseCase, default_use_cases};
