//! Session and aggregate lifecycle.
//!
//! Sessions are written unanalysed, picked up in small batches by
//! [`SessionLifecycle::analyze_pending`], classified against the stored
//! calibration profile and folded into the per-day aggregate. Old and
//! incomplete sessions are cleaned up in bounded batches.

use crate::classifier::PostureClassifier;
use crate::config::LifecycleConfig;
use crate::records::Records;
use crate::store::StoreChange;
use crate::{DailyStat, Error, PostureSession, Result, SensorSample, TimestampMs};
use tokio::sync::broadcast::{self, error::RecvError};

const HOUR_MS: TimestampMs = 60 * 60 * 1000;
const DAY_MS: TimestampMs = 24 * HOUR_MS;

/// Process-lifetime bookkeeping
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleState {
    retention_done: bool,
}

impl LifecycleState {
    pub fn retention_done(&self) -> bool {
        self.retention_done
    }
}

/// What one analysis pass did
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisReport {
    pub analyzed: usize,
    pub slouching: usize,
    /// Sessions left unanalysed because a sample was missing
    pub skipped: usize,
}

impl AnalysisReport {
    pub fn absorb(&mut self, other: AnalysisReport) {
        self.analyzed += other.analyzed;
        self.slouching += other.slouching;
        self.skipped += other.skipped;
    }
}

pub struct SessionLifecycle {
    records: Records,
    config: LifecycleConfig,
    classifier: PostureClassifier,
    state: LifecycleState,
}

impl SessionLifecycle {
    pub fn new(records: Records, config: LifecycleConfig, classifier: PostureClassifier) -> Self {
        Self {
            records,
            config,
            classifier,
            state: LifecycleState::default(),
        }
    }

    pub fn records(&self) -> &Records {
        &self.records
    }

    pub fn classifier(&self) -> &PostureClassifier {
        &self.classifier
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Store a new unanalysed session
    ///
    /// A missing sample is left unset rather than zero-filled; such sessions
    /// are never analysed and are removed by incomplete-session cleanup.
    pub fn create_session(
        &self,
        upper: Option<SensorSample>,
        lower: Option<SensorSample>,
        now: TimestampMs,
    ) -> Result<PostureSession> {
        let session = PostureSession::new(self.records.user_id(), now, upper, lower);
        self.records.insert_session(&session)?;
        if session.sample_pair().is_some() {
            tracing::debug!("Created session {}", session.id);
        } else {
            tracing::warn!("Created session {} with a missing sensor sample", session.id);
        }
        Ok(session)
    }

    /// Classify the most recent batch of unanalysed sessions
    ///
    /// The calibration profile is read once per batch and is required only
    /// when there is something to analyse.
    pub fn analyze_pending(&mut self, now: TimestampMs) -> Result<AnalysisReport> {
        let batch = self.records.fetch_unanalyzed(self.config.analysis_batch_size)?;
        let report = self.analyze_batch(batch, now)?;
        if report != AnalysisReport::default() {
            tracing::info!(
                "Analysed {} sessions ({} slouching, {} skipped)",
                report.analyzed,
                report.slouching,
                report.skipped
            );
        }
        Ok(report)
    }

    /// Analyse every pending session, newest batch first
    ///
    /// Sessions skipped for a missing sample stay unanalysed but do not hide
    /// older complete sessions behind them.
    pub fn analyze_all_pending(&mut self, now: TimestampMs) -> Result<AnalysisReport> {
        let pending = self.records.fetch_unanalyzed(usize::MAX)?;
        let batch_size = self.config.analysis_batch_size.max(1);

        let mut total = AnalysisReport::default();
        for chunk in pending.rchunks(batch_size) {
            total.absorb(self.analyze_batch(chunk.to_vec(), now)?);
        }
        tracing::info!(
            "Analysed {} of {} pending sessions ({} slouching)",
            total.analyzed,
            pending.len(),
            total.slouching
        );
        Ok(total)
    }

    fn analyze_batch(
        &mut self,
        batch: Vec<PostureSession>,
        now: TimestampMs,
    ) -> Result<AnalysisReport> {
        let mut report = AnalysisReport::default();
        if batch.is_empty() {
            return Ok(report);
        }

        let profile = self
            .records
            .load_profile()?
            .unwrap_or_default()
            .require_calibrated()?;

        for mut session in batch {
            let Some((&upper, &lower)) = session.sample_pair() else {
                tracing::debug!("Session {} is missing a sample, not analysing", session.id);
                report.skipped += 1;
                continue;
            };

            // An unsaved result must not advance the smoothing filter
            let previous = self.classifier.previous_pitch_diff();
            let analysis = self.classifier.classify_calibrated(&upper, &lower, &profile);
            session.apply_analysis(&analysis, profile.timestamp);
            if let Err(e) = self.records.write_analysis(&session) {
                self.classifier.restore_smoothing(previous);
                return Err(e);
            }
            self.record_daily(&session.date_key(), analysis.slouching, now)?;

            report.analyzed += 1;
            if analysis.slouching {
                report.slouching += 1;
            }
        }
        Ok(report)
    }

    /// Fold one classified session into its day's aggregate
    ///
    /// Read-modify-write without a transaction; concurrent writers for the
    /// same day can lose an increment.
    pub fn record_daily(&self, date_key: &str, slouching: bool, now: TimestampMs) -> Result<DailyStat> {
        let mut stat = self
            .records
            .load_daily_stat(date_key)?
            .unwrap_or_else(|| DailyStat::empty(date_key));
        stat.record(slouching, now);
        self.records.save_daily_stat(&stat)?;
        Ok(stat)
    }

    /// Delete sessions older than the retention window, one bounded batch,
    /// at most once per lifecycle instance
    pub fn run_retention_cleanup(&mut self, now: TimestampMs) -> Result<usize> {
        if self.state.retention_done {
            tracing::debug!("Retention cleanup already ran");
            return Ok(0);
        }

        let cutoff = now - self.config.retention_days * DAY_MS;
        let expired = self
            .records
            .sessions_before(cutoff, self.config.retention_batch_size)?;
        for id in &expired {
            self.records.delete_session(id)?;
        }

        self.state.retention_done = true;
        tracing::info!(
            "Retention cleanup removed {} sessions older than {} days",
            expired.len(),
            self.config.retention_days
        );
        Ok(expired.len())
    }

    /// Delete unanalysed sessions that are missing a sample or too old to
    /// be worth analysing
    pub fn cleanup_incomplete(&self, now: TimestampMs) -> Result<usize> {
        let cutoff = now - self.config.incomplete_max_age_hours * HOUR_MS;
        let candidates = self
            .records
            .oldest_unanalyzed(self.config.incomplete_batch_size)?;

        let mut removed = 0;
        for session in candidates {
            if session.sample_pair().is_none() || session.timestamp < cutoff {
                self.records.delete_session(&session.id)?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!("Removed {} incomplete sessions", removed);
        }
        Ok(removed)
    }

    /// Analyse whenever the session collection changes, until the change
    /// stream closes
    ///
    /// Passes without a calibration profile are skipped; any other failure
    /// stops the loop.
    pub async fn run_auto_analysis(
        &mut self,
        mut changes: broadcast::Receiver<StoreChange>,
        clock: fn() -> TimestampMs,
    ) -> Result<AnalysisReport> {
        let mut total = AnalysisReport::default();
        loop {
            match changes.recv().await {
                Ok(_) | Err(RecvError::Lagged(_)) => match self.analyze_pending(clock()) {
                    Ok(report) => total.absorb(report),
                    Err(Error::MissingCalibration) => {
                        tracing::warn!("Sessions waiting for calibration before analysis");
                    }
                    Err(e) => return Err(e),
                },
                Err(RecvError::Closed) => return Ok(total),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Records;
    use crate::store::{MemoryStore, SharedStore};
    use crate::testing::{tilted, FlakyStore};
    use crate::{CalibratedProfile, CalibrationProfile, SensorAngles};
    use approx::assert_relative_eq;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;

    const NOW: TimestampMs = 1_760_000_000_000;

    fn pitch(degrees: f64) -> SensorAngles {
        SensorAngles {
            roll: 0.0,
            pitch: degrees,
            yaw: 0.0,
        }
    }

    fn lifecycle(store: SharedStore) -> SessionLifecycle {
        SessionLifecycle::new(
            Records::new(store, "user1"),
            LifecycleConfig::default(),
            PostureClassifier::default(),
        )
    }

    fn calibrate(lifecycle: &SessionLifecycle) {
        let profile = CalibrationProfile::from(CalibratedProfile {
            upper_upright: pitch(5.0),
            upper_slouch: pitch(25.0),
            lower_upright: pitch(2.0),
            lower_slouch: pitch(3.0),
            upper_threshold: 19.0,
            lower_threshold: 1.0,
            timestamp: 99,
        });
        lifecycle.records().save_profile(&profile).unwrap();
    }

    fn pair(upper_pitch: f64) -> (Option<SensorSample>, Option<SensorSample>) {
        (Some(tilted(upper_pitch)), Some(tilted(2.0)))
    }

    #[test]
    fn test_daily_aggregate_counts() {
        let lifecycle = lifecycle(MemoryStore::shared());
        for i in 0..10 {
            lifecycle.record_daily("2026-10-16", i < 3, NOW).unwrap();
        }

        let stat = lifecycle
            .records()
            .load_daily_stat("2026-10-16")
            .unwrap()
            .unwrap();
        assert_eq!(stat.total_sessions, 10);
        assert_eq!(stat.slouching_sessions, 3);
        assert_eq!(stat.good_posture_sessions, 7);
        assert_relative_eq!(stat.slouch_percentage, 30.0);
        assert_eq!(stat.last_updated, NOW);
    }

    #[test]
    fn test_analyze_pending_classifies_and_aggregates() {
        let mut lifecycle = lifecycle(MemoryStore::shared());
        calibrate(&lifecycle);
        // Identical pairs keep the smoothed pitch steady
        for _ in 0..2 {
            let (upper, lower) = pair(24.0);
            lifecycle.create_session(upper, lower, NOW).unwrap();
        }

        let report = lifecycle.analyze_pending(NOW).unwrap();
        assert_eq!(report.analyzed, 2);
        assert_eq!(report.slouching, 2);

        let sessions = lifecycle.records().all_sessions().unwrap();
        assert!(sessions.iter().all(|s| s.analyzed));
        assert!(sessions.iter().all(|s| s.calibration_timestamp == Some(99)));

        let stat = lifecycle
            .records()
            .load_daily_stat(&crate::date_key(NOW))
            .unwrap()
            .unwrap();
        assert_eq!(stat.total_sessions, 2);

        // Nothing left to do
        assert_eq!(lifecycle.analyze_pending(NOW).unwrap(), AnalysisReport::default());
    }

    #[test]
    fn test_analyze_pending_is_batched() {
        let mut lifecycle = lifecycle(MemoryStore::shared());
        calibrate(&lifecycle);
        for _ in 0..5 {
            let (upper, lower) = pair(6.0);
            lifecycle.create_session(upper, lower, NOW).unwrap();
        }

        assert_eq!(lifecycle.analyze_pending(NOW).unwrap().analyzed, 3);
        assert_eq!(lifecycle.analyze_pending(NOW).unwrap().analyzed, 2);
    }

    #[test]
    fn test_analyze_requires_calibration() {
        let mut lifecycle = lifecycle(MemoryStore::shared());
        let (upper, lower) = pair(6.0);
        lifecycle.create_session(upper, lower, NOW).unwrap();

        assert!(matches!(
            lifecycle.analyze_pending(NOW),
            Err(Error::MissingCalibration)
        ));
        // Without pending sessions no profile is needed
        let mut empty = self::lifecycle(MemoryStore::shared());
        assert!(empty.analyze_pending(NOW).is_ok());
    }

    #[test]
    fn test_incomplete_sessions_are_skipped_then_cleaned() {
        let mut lifecycle = lifecycle(MemoryStore::shared());
        calibrate(&lifecycle);
        let incomplete = lifecycle.create_session(Some(tilted(6.0)), None, NOW).unwrap();

        let report = lifecycle.analyze_pending(NOW).unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.analyzed, 0);

        assert_eq!(lifecycle.cleanup_incomplete(NOW).unwrap(), 1);
        assert!(lifecycle
            .records()
            .load_session(&incomplete.id)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_analyze_all_reaches_sessions_behind_incomplete_ones() {
        let mut lifecycle = lifecycle(MemoryStore::shared());
        calibrate(&lifecycle);
        let (upper, lower) = pair(24.0);
        let complete = lifecycle.create_session(upper, lower, NOW).unwrap();
        for _ in 0..3 {
            lifecycle.create_session(upper, None, NOW).unwrap();
        }

        let report = lifecycle.analyze_all_pending(NOW).unwrap();
        assert_eq!(report.analyzed, 1);
        assert_eq!(report.skipped, 3);

        let stored = lifecycle
            .records()
            .load_session(&complete.id)
            .unwrap()
            .unwrap();
        assert!(stored.analyzed);

        // Only the incomplete sessions remain pending
        let again = lifecycle.analyze_all_pending(NOW).unwrap();
        assert_eq!(again.analyzed, 0);
        assert_eq!(again.skipped, 3);
    }

    #[test]
    fn test_analyze_all_drains_every_batch() {
        let mut lifecycle = lifecycle(MemoryStore::shared());
        calibrate(&lifecycle);
        for _ in 0..7 {
            let (upper, lower) = pair(6.0);
            lifecycle.create_session(upper, lower, NOW).unwrap();
        }

        assert_eq!(lifecycle.analyze_all_pending(NOW).unwrap().analyzed, 7);
        assert!(lifecycle
            .records()
            .all_sessions()
            .unwrap()
            .iter()
            .all(|s| s.analyzed));
    }

    #[test]
    fn test_failed_write_does_not_advance_smoothing() {
        let store = Arc::new(FlakyStore::default());
        let mut lifecycle = lifecycle(store.clone());
        calibrate(&lifecycle);
        let (upper, lower) = pair(24.0);
        lifecycle.create_session(upper, lower, NOW).unwrap();

        store.fail_updates.store(true, Ordering::SeqCst);
        assert!(matches!(
            lifecycle.analyze_pending(NOW),
            Err(Error::Persistence(_))
        ));
        assert_eq!(lifecycle.classifier().previous_pitch_diff(), None);

        store.fail_updates.store(false, Ordering::SeqCst);
        assert_eq!(lifecycle.analyze_pending(NOW).unwrap().analyzed, 1);
        let raw = tilted(24.0).angles().pitch - tilted(2.0).angles().pitch;
        assert_relative_eq!(
            lifecycle.classifier().previous_pitch_diff().unwrap(),
            raw,
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_cleanup_removes_stale_unanalysed_sessions() {
        let lifecycle = lifecycle(MemoryStore::shared());
        let (upper, lower) = pair(6.0);
        let stale = lifecycle
            .create_session(upper, lower, NOW - 25 * HOUR_MS)
            .unwrap();
        let fresh = lifecycle.create_session(upper, lower, NOW).unwrap();

        assert_eq!(lifecycle.cleanup_incomplete(NOW).unwrap(), 1);
        let records = lifecycle.records();
        assert!(records.load_session(&stale.id).unwrap().is_none());
        assert!(records.load_session(&fresh.id).unwrap().is_some());
    }

    #[test]
    fn test_retention_removes_only_expired_sessions_once() {
        let mut lifecycle = lifecycle(MemoryStore::shared());
        let (upper, lower) = pair(6.0);
        let old = lifecycle.create_session(upper, lower, NOW - 8 * DAY_MS).unwrap();
        let recent = lifecycle.create_session(upper, lower, NOW - 6 * DAY_MS).unwrap();
        let today = lifecycle.create_session(upper, lower, NOW).unwrap();

        assert_eq!(lifecycle.run_retention_cleanup(NOW).unwrap(), 1);
        assert!(lifecycle.state().retention_done());

        let records = lifecycle.records();
        assert!(records.load_session(&old.id).unwrap().is_none());
        assert!(records.load_session(&recent.id).unwrap().is_some());
        assert!(records.load_session(&today.id).unwrap().is_some());

        // Second call in the same lifetime does nothing
        lifecycle
            .create_session(upper, lower, NOW - 9 * DAY_MS)
            .unwrap();
        assert_eq!(lifecycle.run_retention_cleanup(NOW).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_auto_analysis_follows_new_sessions() {
        let store = MemoryStore::shared();
        let mut lifecycle = lifecycle(store.clone());
        calibrate(&lifecycle);
        let changes = lifecycle.records().watch_sessions();

        let writer = SessionLifecycle::new(
            Records::new(store, "user1"),
            LifecycleConfig::default(),
            PostureClassifier::default(),
        );
        let (upper, lower) = pair(24.0);
        writer.create_session(upper, lower, NOW).unwrap();

        let run = lifecycle.run_auto_analysis(changes, || NOW);
        let _ = tokio::time::timeout(Duration::from_millis(100), run).await;

        let sessions = writer.records().all_sessions().unwrap();
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].analyzed);
        assert_eq!(sessions[0].slouching, Some(true));
    }
}
