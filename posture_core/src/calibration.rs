//! Guided two-phase calibration.
//!
//! The user holds an upright posture, then a slouched one. Each phase runs one
//! full device cycle, averages every sample collected per role and turns the
//! average into orientation angles. After the slouch phase the per-user
//! thresholds are derived and the whole profile is persisted in one write.
//!
//! Steps: `Idle → WaitingUpright → CollectingUpright → WaitingSlouch →
//! CollectingSlouch → Complete`, with `Cancelled` reachable from any
//! non-terminal step. A failed phase returns to its waiting step so it can be
//! retried.

use crate::config::CalibrationConfig;
use crate::cycle::{ControllerEvent, CycleRequest};
use crate::records::Records;
use crate::runtime::CycleDriver;
use crate::{
    now_ms, CalibratedProfile, CalibrationProfile, CalibrationStep, ConnectionStatus, DeviceRole,
    Error, Result, SensorAngles, SensorSample, SpineCurvature, TimestampMs,
};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;

/// Per-component arithmetic mean; `None` for an empty slice
pub fn average_samples(samples: &[SensorSample]) -> Option<SensorSample> {
    if samples.is_empty() {
        return None;
    }
    let count = samples.len() as f64;
    let mut sums = [0.0; 6];
    for sample in samples {
        for (sum, value) in sums.iter_mut().zip(sample.components()) {
            *sum += value;
        }
    }
    let [ax, ay, az, gx, gy, gz] = sums.map(|sum| sum / count);
    let timestamp = samples.iter().map(|s| s.timestamp).max().unwrap_or_default();
    Some(SensorSample::new([ax, ay, az], [gx, gy, gz], timestamp))
}

/// `(upper_threshold, lower_threshold)` from the two baselines
///
/// The upper threshold is the change in pitch difference between upright and
/// slouched, the lower threshold the change in roll difference.
pub fn derive_thresholds(
    upper_upright: &SensorAngles,
    lower_upright: &SensorAngles,
    upper_slouch: &SensorAngles,
    lower_slouch: &SensorAngles,
) -> (f64, f64) {
    let upright = SpineCurvature::between(upper_upright, lower_upright);
    let slouch = SpineCurvature::between(upper_slouch, lower_slouch);
    (
        (slouch.pitch_diff - upright.pitch_diff).abs(),
        (slouch.roll_diff - upright.roll_diff).abs(),
    )
}

/// Averaged angles of one collection phase
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PhaseCapture {
    pub upper: SensorAngles,
    pub lower: SensorAngles,
    pub upper_samples: usize,
    pub lower_samples: usize,
}

/// Cancels a running calibration from another task
///
/// A request made while no phase is collecting is honoured by the next phase;
/// `CalibrationEngine::begin` clears it.
#[derive(Clone)]
pub struct CalibrationCanceller {
    tx: Arc<watch::Sender<bool>>,
}

impl CalibrationCanceller {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Cancels the running cycle if a phase ends without the cycle finishing
struct CycleGuard<'a, D: CycleDriver> {
    driver: &'a D,
    armed: bool,
}

impl<'a, D: CycleDriver> CycleGuard<'a, D> {
    fn new(driver: &'a D) -> Self {
        Self { driver, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<D: CycleDriver> Drop for CycleGuard<'_, D> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!("Calibration phase abandoned, cancelling device cycle");
            self.driver.cancel();
        }
    }
}

pub struct CalibrationEngine {
    records: Records,
    config: CalibrationConfig,
    step: CalibrationStep,
    profile: CalibrationProfile,
    upper_buffer: Vec<SensorSample>,
    lower_buffer: Vec<SensorSample>,
    cancel_tx: Arc<watch::Sender<bool>>,
    clock: fn() -> TimestampMs,
}

impl CalibrationEngine {
    pub fn new(records: Records, config: CalibrationConfig) -> Self {
        Self {
            records,
            config,
            step: CalibrationStep::Idle,
            profile: CalibrationProfile::default(),
            upper_buffer: Vec::new(),
            lower_buffer: Vec::new(),
            cancel_tx: Arc::new(watch::channel(false).0),
            clock: now_ms,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> TimestampMs) -> Self {
        self.clock = clock;
        self
    }

    pub fn step(&self) -> CalibrationStep {
        self.step
    }

    pub fn canceller(&self) -> CalibrationCanceller {
        CalibrationCanceller {
            tx: self.cancel_tx.clone(),
        }
    }

    /// The profile built so far (complete once the step is `Complete`)
    pub fn profile(&self) -> &CalibrationProfile {
        &self.profile
    }

    /// Start (or restart) calibration from scratch
    pub fn begin(&mut self) -> Result<()> {
        self.step = self.step.transition(CalibrationStep::WaitingUpright)?;
        self.profile = CalibrationProfile::default();
        self.clear_buffers();
        self.cancel_tx.send_replace(false);
        tracing::info!("Calibration started for user {}", self.records.user_id());
        Ok(())
    }

    /// Collect the upright baseline
    pub async fn collect_upright<D: CycleDriver>(&mut self, driver: &D) -> Result<PhaseCapture> {
        self.recover_abandoned(CalibrationStep::CollectingUpright, CalibrationStep::WaitingUpright);
        self.step = self.step.transition(CalibrationStep::CollectingUpright)?;

        match self.collect_phase(driver).await {
            Ok(capture) => {
                self.profile.upper_upright = Some(capture.upper);
                self.profile.lower_upright = Some(capture.lower);
                self.step = CalibrationStep::WaitingSlouch;
                tracing::info!(
                    "Upright baseline captured (upper pitch {:.1}°, lower pitch {:.1}°)",
                    capture.upper.pitch,
                    capture.lower.pitch
                );
                Ok(capture)
            }
            Err(e) => {
                if !self.step.is_terminal() {
                    self.step = CalibrationStep::WaitingUpright;
                }
                Err(e)
            }
        }
    }

    /// Collect the slouch baseline, derive thresholds and persist the profile
    pub async fn collect_slouch<D: CycleDriver>(
        &mut self,
        driver: &D,
    ) -> Result<CalibrationProfile> {
        self.recover_abandoned(CalibrationStep::CollectingSlouch, CalibrationStep::WaitingSlouch);
        self.step = self.step.transition(CalibrationStep::CollectingSlouch)?;

        let capture = match self.collect_phase(driver).await {
            Ok(capture) => capture,
            Err(e) => {
                if !self.step.is_terminal() {
                    self.step = CalibrationStep::WaitingSlouch;
                }
                return Err(e);
            }
        };

        let (upper_upright, lower_upright) =
            match (self.profile.upper_upright, self.profile.lower_upright) {
                (Some(upper), Some(lower)) => (upper, lower),
                _ => {
                    self.step = CalibrationStep::WaitingUpright;
                    return Err(Error::MissingCalibration);
                }
            };

        let (upper_threshold, lower_threshold) =
            derive_thresholds(&upper_upright, &lower_upright, &capture.upper, &capture.lower);
        let profile = CalibrationProfile::from(CalibratedProfile {
            upper_upright,
            upper_slouch: capture.upper,
            lower_upright,
            lower_slouch: capture.lower,
            upper_threshold,
            lower_threshold,
            timestamp: (self.clock)(),
        });

        if let Err(e) = self.records.save_profile(&profile) {
            tracing::warn!("Failed to save calibration profile: {}", e);
            self.step = CalibrationStep::WaitingSlouch;
            return Err(e);
        }

        self.profile = profile.clone();
        self.step = CalibrationStep::Complete;
        tracing::info!(
            "Calibration complete: upper threshold {:.2}°, lower threshold {:.2}°",
            upper_threshold,
            lower_threshold
        );
        Ok(profile)
    }

    /// Abort calibration. Nothing is persisted. No-op once finished.
    pub fn cancel<D: CycleDriver>(&mut self, driver: &D) {
        if self.step.is_terminal() {
            return;
        }
        driver.cancel();
        self.clear_buffers();
        self.profile = CalibrationProfile::default();
        self.step = CalibrationStep::Cancelled;
        tracing::info!("Calibration cancelled");
    }

    /// A collection future dropped mid-phase leaves its collecting step behind
    fn recover_abandoned(&mut self, collecting: CalibrationStep, waiting: CalibrationStep) {
        if self.step == collecting {
            tracing::warn!("Previous {:?} phase was abandoned, restarting it", collecting);
            self.step = waiting;
        }
    }

    fn clear_buffers(&mut self) {
        self.upper_buffer.clear();
        self.lower_buffer.clear();
    }

    fn buffer_mut(&mut self, role: DeviceRole) -> &mut Vec<SensorSample> {
        match role {
            DeviceRole::UpperBack => &mut self.upper_buffer,
            DeviceRole::LowerBack => &mut self.lower_buffer,
        }
    }

    /// Run one single-shot cycle and average what it delivered
    ///
    /// Fails with `ConnectionTimeout` when nothing connects within the
    /// configured window; the window is disarmed by the first connection.
    async fn collect_phase<D: CycleDriver>(&mut self, driver: &D) -> Result<PhaseCapture> {
        self.clear_buffers();

        let mut cancelled = self.cancel_tx.subscribe();
        if *cancelled.borrow_and_update() {
            self.cancel(driver);
            return Err(Error::CalibrationCancelled);
        }

        let mut events = driver.subscribe();
        driver.start_cycle(CycleRequest::single())?;
        let mut guard = CycleGuard::new(driver);

        let timeout = self.config.connection_timeout();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut connected = false;

        loop {
            tokio::select! {
                Ok(()) = cancelled.changed() => {
                    if *cancelled.borrow_and_update() {
                        guard.disarm();
                        self.cancel(driver);
                        return Err(Error::CalibrationCancelled);
                    }
                }
                _ = &mut deadline, if !connected => {
                    tracing::warn!("No sensor connected within {:?}", timeout);
                    guard.disarm();
                    driver.cancel();
                    return Err(Error::ConnectionTimeout {
                        role: None,
                        waited_ms: self.config.connection_timeout_ms,
                    });
                }
                received = events.recv() => match received {
                    Ok(ControllerEvent::Sample { role, sample }) => self.buffer_mut(role).push(sample),
                    Ok(ControllerEvent::Status(ConnectionStatus::Connected(role))) => {
                        if !connected {
                            tracing::debug!("{} connected, connection window disarmed", role);
                        }
                        connected = true;
                    }
                    Ok(ControllerEvent::CycleComplete { .. }) => {
                        guard.disarm();
                        break;
                    }
                    Ok(ControllerEvent::ScanTimedOut { role, waited_ms }) => {
                        guard.disarm();
                        return Err(Error::ConnectionTimeout { role: Some(role), waited_ms });
                    }
                    Ok(ControllerEvent::ScanFailed { reason, .. }) => {
                        guard.disarm();
                        return Err(Error::Radio(reason));
                    }
                    Ok(ControllerEvent::CycleRejected) => {
                        guard.disarm();
                        return Err(Error::CycleBusy);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("Calibration missed {} controller events", missed);
                    }
                    Err(RecvError::Closed) => return Err(Error::ControllerClosed),
                },
            }
        }

        // Unsubscribe before reading the buffers
        drop(events);

        let upper = average_samples(&self.upper_buffer).ok_or(Error::IncompleteCalibrationData {
            role: DeviceRole::UpperBack,
        })?;
        let lower = average_samples(&self.lower_buffer).ok_or(Error::IncompleteCalibrationData {
            role: DeviceRole::LowerBack,
        })?;
        tracing::debug!(
            "Phase collected {} upper and {} lower samples",
            self.upper_buffer.len(),
            self.lower_buffer.len()
        );

        Ok(PhaseCapture {
            upper: upper.angles(),
            lower: lower.angles(),
            upper_samples: self.upper_buffer.len(),
            lower_samples: self.lower_buffer.len(),
        })
    }
}
