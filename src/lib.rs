//! NDSI depth bridge library.
//!
//! Exposes time-of-flight depth cameras as NDSI sensors: each camera gets a
//! frame publisher, a notification publisher and a command socket, announced
//! for network discovery and driven by a single coordinator loop.

pub mod config;
pub mod coordinator;
pub mod device;
pub mod error;
pub mod input;
pub mod instance_lock;
pub mod ndsi;
pub mod netif;
pub mod sensors;
pub mod service;
