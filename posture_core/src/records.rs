//! Typed access to the records kept in the store.
//!
//! Layout:
//!
//! ```text
//! posture_sessions/{user}/{session_id}   PostureSession
//! daily_stats/{user}/{YYYY-MM-DD}        DailyStat
//! calibration_data/{user}                CalibrationProfile
//! users/{user}/training_data/{label}     TrainingRecord
//! ```

use crate::store::{Query, SharedStore, StoreChange, StorePath};
use crate::training::TrainingRecord;
use crate::{CalibrationProfile, DailyStat, Error, PostureSession, Result, TimestampMs};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;

pub const SESSIONS_ROOT: &str = "posture_sessions";
pub const DAILY_STATS_ROOT: &str = "daily_stats";
pub const CALIBRATION_ROOT: &str = "calibration_data";
pub const USERS_ROOT: &str = "users";
pub const TRAINING_DATA: &str = "training_data";

/// One user's view of the store
#[derive(Clone)]
pub struct Records {
    store: SharedStore,
    user_id: String,
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

fn encode<T: serde::Serialize>(record: &T) -> Result<Value> {
    Ok(serde_json::to_value(record)?)
}

impl Records {
    pub fn new(store: SharedStore, user_id: impl Into<String>) -> Self {
        Self {
            store,
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn sessions_path(&self) -> StorePath {
        StorePath::parse(SESSIONS_ROOT).child(&self.user_id)
    }

    fn session_path(&self, id: &str) -> StorePath {
        self.sessions_path().child(id)
    }

    fn daily_stats_path(&self) -> StorePath {
        StorePath::parse(DAILY_STATS_ROOT).child(&self.user_id)
    }

    fn calibration_path(&self) -> StorePath {
        StorePath::parse(CALIBRATION_ROOT).child(&self.user_id)
    }

    fn training_path(&self, label: &str) -> StorePath {
        StorePath::parse(USERS_ROOT)
            .child(&self.user_id)
            .child(TRAINING_DATA)
            .child(label)
    }

    // ------------------------------------------------------------------
    // Calibration
    // ------------------------------------------------------------------

    pub fn load_profile(&self) -> Result<Option<CalibrationProfile>> {
        self.store
            .get(&self.calibration_path())?
            .map(decode)
            .transpose()
    }

    /// Replace the stored profile as a whole
    pub fn save_profile(&self, profile: &CalibrationProfile) -> Result<()> {
        self.store.set(&self.calibration_path(), encode(profile)?)
    }

    pub fn delete_profile(&self) -> Result<()> {
        self.store.remove(&self.calibration_path())
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    pub fn insert_session(&self, session: &PostureSession) -> Result<()> {
        self.store
            .set(&self.session_path(&session.id), encode(session)?)
    }

    pub fn load_session(&self, id: &str) -> Result<Option<PostureSession>> {
        match self.store.get(&self.session_path(id))? {
            Some(value) => self.decode_session(id, value).map(Some),
            None => Ok(None),
        }
    }

    pub fn delete_session(&self, id: &str) -> Result<()> {
        self.store.remove(&self.session_path(id))
    }

    /// The store key is the session id
    fn decode_session(&self, key: &str, value: Value) -> Result<PostureSession> {
        let mut session: PostureSession = decode(value)?;
        session.id = key.to_string();
        if session.user_id.is_empty() {
            session.user_id = self.user_id.clone();
        }
        Ok(session)
    }

    fn query_sessions(&self, query: &Query) -> Result<Vec<PostureSession>> {
        let rows = self.store.query(&self.sessions_path(), query)?;
        let mut sessions = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            match self.decode_session(&key, value) {
                Ok(session) => sessions.push(session),
                Err(e) => tracing::warn!("Skipping unreadable session {}: {}", key, e),
            }
        }
        Ok(sessions)
    }

    /// The `limit` most recently created unanalysed sessions, oldest first
    pub fn fetch_unanalyzed(&self, limit: usize) -> Result<Vec<PostureSession>> {
        self.query_sessions(
            &Query::order_by_child("analyzed")
                .equal_to(false)
                .limit_to_last(limit),
        )
    }

    /// The `limit` oldest unanalysed sessions
    pub fn oldest_unanalyzed(&self, limit: usize) -> Result<Vec<PostureSession>> {
        self.query_sessions(
            &Query::order_by_child("analyzed")
                .equal_to(false)
                .limit_to_first(limit),
        )
    }

    /// Ids of up to `limit` sessions created strictly before `cutoff`, oldest first
    pub fn sessions_before(&self, cutoff: TimestampMs, limit: usize) -> Result<Vec<String>> {
        let rows = self.store.query(
            &self.sessions_path(),
            &Query::order_by_child("timestamp")
                .end_at(cutoff - 1)
                .limit_to_first(limit),
        )?;
        Ok(rows.into_iter().map(|(key, _)| key).collect())
    }

    /// All sessions, oldest first
    pub fn all_sessions(&self) -> Result<Vec<PostureSession>> {
        self.query_sessions(&Query::by_key())
    }

    /// Persist analysis results and the analysed flag in one write
    pub fn write_analysis(&self, session: &PostureSession) -> Result<()> {
        if !session.analyzed {
            return Err(Error::Other(format!(
                "session {} has no analysis to write",
                session.id
            )));
        }
        let mut fields = Map::new();
        fields.insert("analyzed".into(), json!(true));
        fields.insert("slouching".into(), json!(session.slouching));
        fields.insert("overallScore".into(), json!(session.overall_score));
        fields.insert("upperDeviation".into(), json!(session.upper_deviation));
        fields.insert("lowerDeviation".into(), json!(session.lower_deviation));
        fields.insert("upperScore".into(), json!(session.upper_score));
        fields.insert("lowerScore".into(), json!(session.lower_score));
        fields.insert(
            "calibrationTimestamp".into(),
            json!(session.calibration_timestamp),
        );
        self.store.update(&self.session_path(&session.id), fields)
    }

    pub fn watch_sessions(&self) -> broadcast::Receiver<StoreChange> {
        self.store.watch(&self.sessions_path())
    }

    // ------------------------------------------------------------------
    // Daily stats
    // ------------------------------------------------------------------

    pub fn load_daily_stat(&self, date_key: &str) -> Result<Option<DailyStat>> {
        self.store
            .get(&self.daily_stats_path().child(date_key))?
            .map(decode)
            .transpose()
    }

    pub fn save_daily_stat(&self, stat: &DailyStat) -> Result<()> {
        self.store.set(
            &self.daily_stats_path().child(&stat.date_key),
            encode(stat)?,
        )
    }

    /// Up to `limit` most recent days, newest first
    pub fn recent_daily_stats(&self, limit: usize) -> Result<Vec<DailyStat>> {
        let rows = self
            .store
            .query(&self.daily_stats_path(), &Query::by_key().limit_to_last(limit))?;
        let mut stats = Vec::with_capacity(rows.len());
        for (key, value) in rows.into_iter().rev() {
            match decode::<DailyStat>(value) {
                Ok(stat) => stats.push(stat),
                Err(e) => tracing::warn!("Skipping unreadable daily stat {}: {}", key, e),
            }
        }
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Training
    // ------------------------------------------------------------------

    pub fn save_training_record(&self, label: &str, record: &TrainingRecord) -> Result<()> {
        self.store.set(&self.training_path(label), encode(record)?)
    }

    pub fn load_training_record(&self, label: &str) -> Result<Option<TrainingRecord>> {
        self.store
            .get(&self.training_path(label))?
            .map(decode)
            .transpose()
    }
}
