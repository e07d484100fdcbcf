//! Posture classification.
//!
//! Compares the live spine curvature (upper-back pitch/roll minus lower-back
//! pitch/roll) against the user's upright baseline. Only the pitch difference
//! is smoothed; the slouch decision uses the smoothed pitch deviation against
//! a fraction of the calibrated threshold.

use crate::config::ClassifierConfig;
use crate::{CalibratedProfile, CalibrationProfile, PostureAnalysis, Result, SensorSample, SpineCurvature};

/// Score for a deviation relative to its threshold, capped at 100
///
/// A zero threshold scores 0 for no deviation and 100 otherwise.
pub fn deviation_score(deviation: f64, threshold: f64) -> u32 {
    if threshold <= 0.0 {
        return if deviation > 0.0 { 100 } else { 0 };
    }
    (deviation / threshold * 100.0).round().clamp(0.0, 100.0) as u32
}

/// Stateful classifier; the smoothing filter carries over between calls
#[derive(Debug, Clone)]
pub struct PostureClassifier {
    config: ClassifierConfig,
    previous_pitch_diff: Option<f64>,
}

impl PostureClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            config,
            previous_pitch_diff: None,
        }
    }

    /// Classify one sample pair. Fails with `MissingCalibration` unless the
    /// profile is complete.
    pub fn classify(
        &mut self,
        upper: &SensorSample,
        lower: &SensorSample,
        profile: &CalibrationProfile,
    ) -> Result<PostureAnalysis> {
        let calibrated = profile.require_calibrated()?;
        Ok(self.classify_calibrated(upper, lower, &calibrated))
    }

    pub fn classify_calibrated(
        &mut self,
        upper: &SensorSample,
        lower: &SensorSample,
        profile: &CalibratedProfile,
    ) -> PostureAnalysis {
        let live = SpineCurvature::between(&upper.angles(), &lower.angles());
        let upright = profile.upright_curvature();

        let filtered_pitch_diff = self.smooth(live.pitch_diff);
        let upper_deviation = (filtered_pitch_diff - upright.pitch_diff).abs();
        let lower_deviation = (live.roll_diff - upright.roll_diff).abs();

        let upper_score = deviation_score(upper_deviation, profile.upper_threshold);
        let lower_score = deviation_score(lower_deviation, profile.lower_threshold);

        PostureAnalysis {
            slouching: self.is_slouching(upper_deviation, profile.upper_threshold),
            overall_score: upper_score.max(lower_score),
            upper_deviation,
            lower_deviation,
            upper_score,
            lower_score,
            filtered_pitch_diff,
            roll_diff: live.roll_diff,
        }
    }

    /// Strictly above the effective threshold
    pub fn is_slouching(&self, upper_deviation: f64, upper_threshold: f64) -> bool {
        upper_deviation > upper_threshold * self.config.threshold_multiplier
    }

    fn smooth(&mut self, raw: f64) -> f64 {
        let filtered = match self.previous_pitch_diff {
            Some(previous) => {
                let alpha = self.config.smoothing_alpha;
                alpha * raw + (1.0 - alpha) * previous
            }
            None => raw,
        };
        self.previous_pitch_diff = Some(filtered);
        filtered
    }

    pub fn previous_pitch_diff(&self) -> Option<f64> {
        self.previous_pitch_diff
    }

    /// Put back a value taken from `previous_pitch_diff`
    pub fn restore_smoothing(&mut self, previous: Option<f64>) {
        self.previous_pitch_diff = previous;
    }

    /// Forget the smoothing history
    pub fn reset(&mut self) {
        self.previous_pitch_diff = None;
    }
}

impl Default for PostureClassifier {
    fn default() -> Self {
        Self::new(ClassifierConfig::default())
    }
}
