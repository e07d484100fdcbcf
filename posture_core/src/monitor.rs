//! Continuous posture monitoring.
//!
//! Runs repeating device cycles, keeps the last sample per role from each
//! cycle and turns every completed cycle into one session, analysing pending
//! sessions right after. A cycle that finds no sensor is retried after a
//! delay.

use crate::config::MonitorConfig;
use crate::cycle::{ControllerEvent, CycleRequest};
use crate::lifecycle::{AnalysisReport, SessionLifecycle};
use crate::runtime::CycleDriver;
use crate::{now_ms, DeviceRole, Error, Result, SensorSample, TimestampMs};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

/// Totals for one monitoring run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MonitorReport {
    pub cycles: usize,
    /// Sessions with both samples
    pub sessions: usize,
    /// Sessions missing a sample
    pub incomplete: usize,
    pub scan_timeouts: usize,
    pub analysis: AnalysisReport,
}

pub struct PostureMonitor {
    config: MonitorConfig,
    clock: fn() -> TimestampMs,
}

impl PostureMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            clock: now_ms,
        }
    }

    pub fn with_clock(mut self, clock: fn() -> TimestampMs) -> Self {
        self.clock = clock;
        self
    }

    /// Monitor until `max_cycles` cycles completed (forever when `None`)
    ///
    /// The controller is cancelled on return, whether the run finished or
    /// failed.
    pub async fn run<D: CycleDriver>(
        &self,
        driver: &D,
        lifecycle: &mut SessionLifecycle,
        max_cycles: Option<usize>,
    ) -> Result<MonitorReport> {
        let result = self.run_cycles(driver, lifecycle, max_cycles).await;
        driver.cancel();
        if let Ok(report) = &result {
            tracing::info!(
                "Monitoring finished: {} cycles, {} sessions, {} analysed",
                report.cycles,
                report.sessions,
                report.analysis.analyzed
            );
        }
        result
    }

    async fn run_cycles<D: CycleDriver>(
        &self,
        driver: &D,
        lifecycle: &mut SessionLifecycle,
        max_cycles: Option<usize>,
    ) -> Result<MonitorReport> {
        let mut report = MonitorReport::default();
        let mut latest: [Option<SensorSample>; 2] = [None, None];
        let retry_delay = Duration::from_millis(self.config.retry_delay_ms);

        let mut events = driver.subscribe();
        driver.start_cycle(CycleRequest::repeating())?;

        loop {
            match events.recv().await {
                Ok(ControllerEvent::Sample { role, sample }) => latest[role.index()] = Some(sample),
                Ok(ControllerEvent::CycleComplete { cycle }) => {
                    let [upper, lower] = std::mem::take(&mut latest);
                    report.cycles += 1;

                    let session = lifecycle.create_session(upper, lower, (self.clock)())?;
                    if session.sample_pair().is_some() {
                        report.sessions += 1;
                    } else {
                        report.incomplete += 1;
                    }
                    match lifecycle.analyze_pending((self.clock)()) {
                        Ok(analysis) => report.analysis.absorb(analysis),
                        Err(Error::MissingCalibration) => {
                            tracing::warn!("Cycle {}: calibrate to analyse sessions", cycle);
                        }
                        Err(e) => return Err(e),
                    }

                    if max_cycles.is_some_and(|max| report.cycles >= max) {
                        return Ok(report);
                    }
                }
                Ok(ControllerEvent::ScanTimedOut { role, .. }) => {
                    report.scan_timeouts += 1;
                    self.retry(driver, role, retry_delay, &mut latest).await?;
                }
                Ok(ControllerEvent::ScanFailed { role, reason }) => {
                    tracing::warn!("Scan for {} failed: {}", role, reason);
                    report.scan_timeouts += 1;
                    self.retry(driver, role, retry_delay, &mut latest).await?;
                }
                Ok(ControllerEvent::CycleRejected) => return Err(Error::CycleBusy),
                Ok(ControllerEvent::Status(_)) => {}
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Monitor missed {} controller events", missed);
                }
                Err(RecvError::Closed) => return Err(Error::ControllerClosed),
            }
        }
    }

    async fn retry<D: CycleDriver>(
        &self,
        driver: &D,
        role: DeviceRole,
        delay: Duration,
        latest: &mut [Option<SensorSample>; 2],
    ) -> Result<()> {
        *latest = [None, None];
        tracing::warn!("No {} sensor found, retrying in {:?}", role, delay);
        tokio::time::sleep(delay).await;
        driver.start_cycle(CycleRequest::repeating())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::PostureClassifier;
    use crate::config::LifecycleConfig;
    use crate::records::Records;
    use crate::store::MemoryStore;
    use crate::testing::{cycle_events, tilted, ScriptedDriver};
    use crate::{CalibratedProfile, CalibrationProfile};

    fn lifecycle() -> SessionLifecycle {
        SessionLifecycle::new(
            Records::new(MemoryStore::shared(), "user1"),
            LifecycleConfig::default(),
            PostureClassifier::default(),
        )
    }

    fn calibrate(lifecycle: &SessionLifecycle) {
        let profile = CalibrationProfile::from(CalibratedProfile {
            upper_upright: tilted(5.0).angles(),
            upper_slouch: tilted(25.0).angles(),
            lower_upright: tilted(2.0).angles(),
            lower_slouch: tilted(3.0).angles(),
            upper_threshold: 19.0,
            lower_threshold: 1.0,
            timestamp: 1,
        });
        lifecycle.records().save_profile(&profile).unwrap();
    }

    #[tokio::test]
    async fn test_one_session_per_cycle_with_last_samples() {
        let mut lifecycle = lifecycle();
        calibrate(&lifecycle);
        let mut script = cycle_events(1, &[tilted(10.0), tilted(24.0)], &[tilted(2.0)]);
        script.extend(cycle_events(2, &[tilted(6.0)], &[]));
        let driver = ScriptedDriver::new(vec![script]);

        let report = PostureMonitor::new(MonitorConfig::default())
            .with_clock(|| 5_000)
            .run(&driver, &mut lifecycle, Some(2))
            .await
            .unwrap();

        assert_eq!(report.cycles, 2);
        assert_eq!(report.sessions, 1);
        assert_eq!(report.incomplete, 1);
        assert_eq!(report.analysis.analyzed, 1);
        assert_eq!(report.analysis.slouching, 1);
        assert_eq!(driver.cancel_count(), 1);
        assert_eq!(driver.requests(), vec![CycleRequest::repeating()]);

        let sessions = lifecycle.records().all_sessions().unwrap();
        assert_eq!(sessions.len(), 2);
        let complete = sessions.iter().find(|s| s.analyzed).unwrap();
        assert_eq!(complete.upper_back, Some(tilted(24.0)));
        assert_eq!(complete.timestamp, 5_000);
        assert!(sessions.iter().any(|s| s.lower_back.is_none()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_timeout_restarts_after_delay() {
        let mut lifecycle = lifecycle();
        let timed_out = vec![ControllerEvent::ScanTimedOut {
            role: DeviceRole::UpperBack,
            waited_ms: 10_000,
        }];
        let driver = ScriptedDriver::new(vec![
            timed_out,
            cycle_events(1, &[tilted(6.0)], &[tilted(2.0)]),
        ]);

        let report = PostureMonitor::new(MonitorConfig::default())
            .run(&driver, &mut lifecycle, Some(1))
            .await
            .unwrap();

        assert_eq!(report.scan_timeouts, 1);
        assert_eq!(report.sessions, 1);
        // Uncalibrated sessions stay pending
        assert_eq!(report.analysis.analyzed, 0);
        assert_eq!(driver.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_cycle_stops_monitoring() {
        let mut lifecycle = lifecycle();
        let driver = ScriptedDriver::new(vec![vec![ControllerEvent::CycleRejected]]);

        let result = PostureMonitor::new(MonitorConfig::default())
            .run(&driver, &mut lifecycle, None)
            .await;

        assert!(matches!(result, Err(Error::CycleBusy)));
        assert_eq!(driver.cancel_count(), 1);
    }
}
