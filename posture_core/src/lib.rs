#![forbid(unsafe_code)]

//! Core library for the dual-sensor posture monitor.
//!
//! This crate provides:
//! - Domain types (samples, angles, profiles, sessions, daily stats)
//! - Telemetry codec for the sensors' line protocol
//! - Device cycle controller and its async runtime
//! - Calibration, classification and session lifecycle
//! - Persistence (tree store, JSON file backend, CSV export)

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod codec;
pub mod timer;
pub mod radio;
pub mod cycle;
pub mod runtime;
pub mod store;
pub mod file_store;
pub mod records;
pub mod classifier;
pub mod calibration;
pub mod lifecycle;
pub mod monitor;
pub mod training;
pub mod export;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::Config;
pub use codec::TelemetryDecoder;
pub use cycle::{ControllerEvent, CycleRequest, HoldMode};
pub use runtime::{spawn_controller, CycleDriver, CycleHandle};
pub use store::{MemoryStore, SharedStore, Store, StorePath};
pub use file_store::JsonFileStore;
pub use records::Records;
pub use classifier::PostureClassifier;
pub use calibration::CalibrationEngine;
pub use lifecycle::SessionLifecycle;
pub use monitor::PostureMonitor;
pub use training::{TrainingCapture, TrainingRecord};
