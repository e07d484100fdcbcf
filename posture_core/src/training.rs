//! High-rate training data capture.
//!
//! One long-hold, high-priority cycle; every sample from both roles is kept
//! and stored under a pose label for offline model training.

use crate::config::{CycleConfig, TrainingConfig};
use crate::cycle::{ControllerEvent, CycleRequest};
use crate::records::Records;
use crate::runtime::CycleDriver;
use crate::{now_ms, DeviceRole, Error, Result, SensorSample, TimestampMs};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;

/// One raw IMU reading in the training export format
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImuReading {
    pub ax: f64,
    pub ay: f64,
    pub az: f64,
    pub gx: f64,
    pub gy: f64,
    pub gz: f64,
}

impl From<&SensorSample> for ImuReading {
    fn from(sample: &SensorSample) -> Self {
        Self {
            ax: sample.accel_x,
            ay: sample.accel_y,
            az: sample.accel_z,
            gx: sample.gyro_x,
            gy: sample.gyro_y,
            gz: sample.gyro_z,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub sample_rate_hz: u32,
    /// Connection hold per sensor
    pub duration_seconds: u64,
    /// Samples across both sensors
    pub sample_count: usize,
    pub collection_timestamp: TimestampMs,
    pub upper_back: Vec<ImuReading>,
    pub lower_back: Vec<ImuReading>,
}

/// Labels become store path segments
pub fn validate_label(label: &str) -> Result<()> {
    let label = label.trim();
    if label.is_empty() || label.contains('/') || label.starts_with('.') {
        return Err(Error::Other(format!("invalid pose label {:?}", label)));
    }
    Ok(())
}

pub struct TrainingCapture {
    training: TrainingConfig,
    long_hold_ms: u64,
    clock: fn() -> TimestampMs,
}

impl TrainingCapture {
    pub fn new(training: TrainingConfig, cycle: &CycleConfig) -> Self {
        Self {
            training,
            long_hold_ms: cycle.long_hold_ms,
            clock: now_ms,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> TimestampMs) -> Self {
        self.clock = clock;
        self
    }

    /// Capture one labelled recording and store it
    pub async fn capture<D: CycleDriver>(
        &self,
        driver: &D,
        records: &Records,
        label: &str,
    ) -> Result<TrainingRecord> {
        validate_label(label)?;
        let label = label.trim();

        let mut upper = Vec::new();
        let mut lower = Vec::new();
        let mut events = driver.subscribe();
        driver.start_cycle(CycleRequest::training())?;
        tracing::info!("Capturing training data for pose {:?}", label);

        loop {
            match events.recv().await {
                Ok(ControllerEvent::Sample { role, sample }) => match role {
                    DeviceRole::UpperBack => upper.push(ImuReading::from(&sample)),
                    DeviceRole::LowerBack => lower.push(ImuReading::from(&sample)),
                },
                Ok(ControllerEvent::CycleComplete { .. }) => break,
                Ok(ControllerEvent::ScanTimedOut { role, waited_ms }) => {
                    return Err(Error::ConnectionTimeout {
                        role: Some(role),
                        waited_ms,
                    });
                }
                Ok(ControllerEvent::ScanFailed { reason, .. }) => return Err(Error::Radio(reason)),
                Ok(ControllerEvent::CycleRejected) => return Err(Error::CycleBusy),
                Ok(ControllerEvent::Status(_)) => {}
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Training capture lost {} events", missed);
                }
                Err(RecvError::Closed) => return Err(Error::ControllerClosed),
            }
        }
        drop(events);

        for (role, readings) in [(DeviceRole::UpperBack, &upper), (DeviceRole::LowerBack, &lower)] {
            if readings.is_empty() {
                tracing::warn!("No {} samples captured for pose {:?}", role, label);
            }
        }

        let record = TrainingRecord {
            sample_rate_hz: self.training.sample_rate_hz,
            duration_seconds: self.long_hold_ms / 1000,
            sample_count: upper.len() + lower.len(),
            collection_timestamp: (self.clock)(),
            upper_back: upper,
            lower_back: lower,
        };
        records.save_training_record(label, &record)?;
        tracing::info!(
            "Stored {} training samples for pose {:?}",
            record.sample_count,
            label
        );
        Ok(record)
    }
}
