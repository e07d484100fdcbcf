//! Core domain types for the posture monitor.
//!
//! This module defines the fundamental types used throughout the system:
//! - Sensor roles, raw IMU samples and the angles derived from them
//! - Connection status and calibration steps
//! - Calibration profiles, posture sessions and daily aggregates

use crate::{Error, Result};
use chrono::{Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Milliseconds since the Unix epoch
pub type TimestampMs = i64;

/// Current wall-clock time in milliseconds
pub fn now_ms() -> TimestampMs {
    Utc::now().timestamp_millis()
}

/// Calendar day (`YYYY-MM-DD`, local time) a timestamp falls on
pub fn date_key(timestamp: TimestampMs) -> String {
    Local
        .timestamp_millis_opt(timestamp)
        .earliest()
        .map(|dt| dt.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| "1970-01-01".into())
}

// ============================================================================
// Sensor Types
// ============================================================================

/// Logical sensor position on the back
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    UpperBack,
    LowerBack,
}

impl DeviceRole {
    /// Both roles in cycle order
    pub const ALL: [DeviceRole; 2] = [DeviceRole::UpperBack, DeviceRole::LowerBack];

    /// Position of this role within a cycle
    pub fn index(self) -> usize {
        match self {
            DeviceRole::UpperBack => 0,
            DeviceRole::LowerBack => 1,
        }
    }

    /// Role at a cycle position (wraps)
    pub fn from_index(index: usize) -> Self {
        Self::ALL[index % Self::ALL.len()]
    }

    /// Device id used on the wire
    pub fn wire_id(self) -> &'static str {
        match self {
            DeviceRole::UpperBack => "UB",
            DeviceRole::LowerBack => "LB",
        }
    }

    pub fn from_wire_id(id: &str) -> Option<Self> {
        match id {
            "UB" => Some(DeviceRole::UpperBack),
            "LB" => Some(DeviceRole::LowerBack),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRole::UpperBack => write!(f, "upper back"),
            DeviceRole::LowerBack => write!(f, "lower back"),
        }
    }
}

/// One paired accelerometer + gyroscope reading
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorSample {
    pub accel_x: f64,
    pub accel_y: f64,
    pub accel_z: f64,
    pub gyro_x: f64,
    pub gyro_y: f64,
    pub gyro_z: f64,
    pub timestamp: TimestampMs,
}

impl SensorSample {
    pub fn new(accel: [f64; 3], gyro: [f64; 3], timestamp: TimestampMs) -> Self {
        Self {
            accel_x: accel[0],
            accel_y: accel[1],
            accel_z: accel[2],
            gyro_x: gyro[0],
            gyro_y: gyro[1],
            gyro_z: gyro[2],
            timestamp,
        }
    }

    /// The six IMU components in `[ax, ay, az, gx, gy, gz]` order
    pub fn components(&self) -> [f64; 6] {
        [
            self.accel_x,
            self.accel_y,
            self.accel_z,
            self.gyro_x,
            self.gyro_y,
            self.gyro_z,
        ]
    }

    /// Orientation estimate from the accelerometer triple
    pub fn angles(&self) -> SensorAngles {
        SensorAngles::from_accel(self.accel_x, self.accel_y, self.accel_z)
    }
}

/// Orientation in degrees
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct SensorAngles {
    pub roll: f64,
    pub pitch: f64,
    pub yaw: f64,
}

impl SensorAngles {
    /// Gravity-vector angles. Yaw is not observable from the accelerometer
    /// alone and is always 0.
    pub fn from_accel(ax: f64, ay: f64, az: f64) -> Self {
        let roll = ay.atan2(az).to_degrees();
        let pitch = (-ax).atan2((ay * ay + az * az).sqrt()).to_degrees();
        Self {
            roll,
            pitch,
            yaw: 0.0,
        }
    }
}

/// Upper-minus-lower angle differences, independent of absolute device orientation
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpineCurvature {
    pub pitch_diff: f64,
    pub roll_diff: f64,
}

impl SpineCurvature {
    pub fn between(upper: &SensorAngles, lower: &SensorAngles) -> Self {
        Self {
            pitch_diff: upper.pitch - lower.pitch,
            roll_diff: upper.roll - lower.roll,
        }
    }
}

/// Connection status of the device cycle controller
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Scanning(DeviceRole),
    Connecting(DeviceRole),
    Connected(DeviceRole),
    Disconnecting(DeviceRole),
}

impl ConnectionStatus {
    pub fn role(&self) -> Option<DeviceRole> {
        match *self {
            ConnectionStatus::Disconnected => None,
            ConnectionStatus::Scanning(role)
            | ConnectionStatus::Connecting(role)
            | ConnectionStatus::Connected(role)
            | ConnectionStatus::Disconnecting(role) => Some(role),
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Scanning(role) => write!(f, "scanning for {}", role),
            ConnectionStatus::Connecting(role) => write!(f, "connecting to {}", role),
            ConnectionStatus::Connected(role) => write!(f, "connected to {}", role),
            ConnectionStatus::Disconnecting(role) => write!(f, "disconnecting from {}", role),
        }
    }
}

// ============================================================================
// Calibration Types
// ============================================================================

/// Guided calibration progress
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationStep {
    Idle,
    WaitingUpright,
    CollectingUpright,
    WaitingSlouch,
    CollectingSlouch,
    Complete,
    Cancelled,
}

impl CalibrationStep {
    pub fn is_terminal(self) -> bool {
        matches!(self, CalibrationStep::Complete | CalibrationStep::Cancelled)
    }

    pub fn is_collecting(self) -> bool {
        matches!(
            self,
            CalibrationStep::CollectingUpright | CalibrationStep::CollectingSlouch
        )
    }

    /// Transition table. Failed collection phases fall back to their waiting
    /// step so the phase can be retried.
    pub fn can_transition_to(self, next: CalibrationStep) -> bool {
        use CalibrationStep::*;
        match (self, next) {
            (_, Cancelled) => !self.is_terminal(),
            (Idle | Complete | Cancelled, WaitingUpright) => true,
            (WaitingUpright, CollectingUpright) => true,
            (CollectingUpright, WaitingSlouch | WaitingUpright) => true,
            (WaitingSlouch, CollectingSlouch) => true,
            (CollectingSlouch, Complete | WaitingSlouch) => true,
            _ => false,
        }
    }

    /// Checked transition
    pub fn transition(self, next: CalibrationStep) -> Result<CalibrationStep> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

/// Personal upright/slouch baselines for one user, as stored
///
/// Partially populated while calibration is in progress; only a profile with
/// `calibrated == true` and every field present can be used for classification.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationProfile {
    #[serde(default)]
    pub upper_upright: Option<SensorAngles>,
    #[serde(default)]
    pub upper_slouch: Option<SensorAngles>,
    #[serde(default)]
    pub lower_upright: Option<SensorAngles>,
    #[serde(default)]
    pub lower_slouch: Option<SensorAngles>,
    #[serde(default)]
    pub upper_threshold: Option<f64>,
    #[serde(default)]
    pub lower_threshold: Option<f64>,
    #[serde(default)]
    pub timestamp: TimestampMs,
    #[serde(default)]
    pub calibrated: bool,
}

impl CalibrationProfile {
    /// Fully calibrated view of this profile
    ///
    /// Fails with `MissingCalibration` when the profile is not marked calibrated
    /// or any baseline/threshold is absent.
    pub fn require_calibrated(&self) -> Result<CalibratedProfile> {
        if !self.calibrated {
            return Err(Error::MissingCalibration);
        }
        match (
            self.upper_upright,
            self.upper_slouch,
            self.lower_upright,
            self.lower_slouch,
            self.upper_threshold,
            self.lower_threshold,
        ) {
            (Some(uu), Some(us), Some(lu), Some(ls), Some(ut), Some(lt)) => Ok(CalibratedProfile {
                upper_upright: uu,
                upper_slouch: us,
                lower_upright: lu,
                lower_slouch: ls,
                upper_threshold: ut,
                lower_threshold: lt,
                timestamp: self.timestamp,
            }),
            _ => Err(Error::MissingCalibration),
        }
    }
}

/// A complete calibration profile
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalibratedProfile {
    pub upper_upright: SensorAngles,
    pub upper_slouch: SensorAngles,
    pub lower_upright: SensorAngles,
    pub lower_slouch: SensorAngles,
    pub upper_threshold: f64,
    pub lower_threshold: f64,
    pub timestamp: TimestampMs,
}

impl CalibratedProfile {
    /// Spine curvature of the upright baseline
    pub fn upright_curvature(&self) -> SpineCurvature {
        SpineCurvature::between(&self.upper_upright, &self.lower_upright)
    }

    /// Spine curvature of the slouch baseline
    pub fn slouch_curvature(&self) -> SpineCurvature {
        SpineCurvature::between(&self.upper_slouch, &self.lower_slouch)
    }
}

impl From<CalibratedProfile> for CalibrationProfile {
    fn from(profile: CalibratedProfile) -> Self {
        CalibrationProfile {
            upper_upright: Some(profile.upper_upright),
            upper_slouch: Some(profile.upper_slouch),
            lower_upright: Some(profile.lower_upright),
            lower_slouch: Some(profile.lower_slouch),
            upper_threshold: Some(profile.upper_threshold),
            lower_threshold: Some(profile.lower_threshold),
            timestamp: profile.timestamp,
            calibrated: true,
        }
    }
}

// ============================================================================
// Session and Aggregate Types
// ============================================================================

/// Outcome of classifying one sample pair
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PostureAnalysis {
    pub slouching: bool,
    pub overall_score: u32,
    pub upper_deviation: f64,
    pub lower_deviation: f64,
    pub upper_score: u32,
    pub lower_score: u32,
    /// Smoothed upper-minus-lower pitch used for the decision
    pub filtered_pitch_diff: f64,
    pub roll_diff: f64,
}

/// One captured sample pair, analysed later
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostureSession {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub timestamp: TimestampMs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_back: Option<SensorSample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_back: Option<SensorSample>,
    #[serde(default)]
    pub analyzed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slouching: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overall_score: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_deviation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_deviation: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upper_score: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lower_score: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration_timestamp: Option<TimestampMs>,
}

impl PostureSession {
    /// New unanalysed session. Ids are time-ordered so key order is creation order.
    pub fn new(
        user_id: impl Into<String>,
        timestamp: TimestampMs,
        upper_back: Option<SensorSample>,
        lower_back: Option<SensorSample>,
    ) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            user_id: user_id.into(),
            timestamp,
            upper_back,
            lower_back,
            analyzed: false,
            slouching: None,
            overall_score: None,
            upper_deviation: None,
            lower_deviation: None,
            upper_score: None,
            lower_score: None,
            calibration_timestamp: None,
        }
    }

    /// The sample pair, if both halves were captured
    pub fn sample_pair(&self) -> Option<(&SensorSample, &SensorSample)> {
        match (&self.upper_back, &self.lower_back) {
            (Some(upper), Some(lower)) => Some((upper, lower)),
            _ => None,
        }
    }

    pub fn apply_analysis(&mut self, analysis: &PostureAnalysis, calibration_timestamp: TimestampMs) {
        self.analyzed = true;
        self.slouching = Some(analysis.slouching);
        self.overall_score = Some(analysis.overall_score);
        self.upper_deviation = Some(analysis.upper_deviation);
        self.lower_deviation = Some(analysis.lower_deviation);
        self.upper_score = Some(analysis.upper_score);
        self.lower_score = Some(analysis.lower_score);
        self.calibration_timestamp = Some(calibration_timestamp);
    }

    pub fn date_key(&self) -> String {
        date_key(self.timestamp)
    }
}

/// Per-calendar-day running counters of classified sessions
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStat {
    pub date_key: String,
    #[serde(default)]
    pub total_sessions: u32,
    #[serde(default)]
    pub slouching_sessions: u32,
    #[serde(default)]
    pub good_posture_sessions: u32,
    #[serde(default)]
    pub slouch_percentage: f64,
    #[serde(default)]
    pub last_updated: TimestampMs,
}

impl DailyStat {
    /// All-zero counters for a day
    pub fn empty(date_key: impl Into<String>) -> Self {
        Self {
            date_key: date_key.into(),
            total_sessions: 0,
            slouching_sessions: 0,
            good_posture_sessions: 0,
            slouch_percentage: 0.0,
            last_updated: 0,
        }
    }

    /// Fold one classified session into the counters
    pub fn record(&mut self, slouching: bool, now: TimestampMs) {
        self.total_sessions += 1;
        if slouching {
            self.slouching_sessions += 1;
        } else {
            self.good_posture_sessions += 1;
        }
        self.slouch_percentage =
            self.slouching_sessions as f64 / self.total_sessions as f64 * 100.0;
        self.last_updated = now;
    }
}
