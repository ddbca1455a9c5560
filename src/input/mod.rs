//! Hardware input sources feeding the NDSI sensors.
//!
//! - `camera`: time-of-flight camera driver interface
//! - `simulation`: software cameras implementing that interface

pub mod camera;
pub mod simulation;
