//! CSV export of posture history.
//!
//! Rows are appended to the target file; headers are written only when the
//! file is new or empty, so repeated exports build up one table.

use crate::{DailyStat, PostureSession, Result, TimestampMs};
use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::path::Path;

fn rfc3339(timestamp: TimestampMs) -> String {
    DateTime::<Utc>::from_timestamp_millis(timestamp)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

#[derive(Debug, serde::Serialize)]
struct DailyRow {
    date: String,
    total_sessions: u32,
    slouching_sessions: u32,
    good_posture_sessions: u32,
    slouch_percentage: String,
    last_updated: String,
}

impl From<&DailyStat> for DailyRow {
    fn from(stat: &DailyStat) -> Self {
        DailyRow {
            date: stat.date_key.clone(),
            total_sessions: stat.total_sessions,
            slouching_sessions: stat.slouching_sessions,
            good_posture_sessions: stat.good_posture_sessions,
            slouch_percentage: format!("{:.1}", stat.slouch_percentage),
            last_updated: rfc3339(stat.last_updated),
        }
    }
}

#[derive(Debug, serde::Serialize)]
struct SessionRow {
    id: String,
    recorded_at: String,
    analyzed: bool,
    slouching: Option<bool>,
    overall_score: Option<u32>,
    upper_deviation: Option<f64>,
    lower_deviation: Option<f64>,
}

impl From<&PostureSession> for SessionRow {
    fn from(session: &PostureSession) -> Self {
        SessionRow {
            id: session.id.clone(),
            recorded_at: rfc3339(session.timestamp),
            analyzed: session.analyzed,
            slouching: session.slouching,
            overall_score: session.overall_score,
            upper_deviation: session.upper_deviation,
            lower_deviation: session.lower_deviation,
        }
    }
}

fn append_rows<R: serde::Serialize>(rows: impl IntoIterator<Item = R>, csv_path: &Path) -> Result<usize> {
    if let Some(parent) = csv_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(csv_path)?;
    let needs_headers = file.metadata()?.len() == 0;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(needs_headers)
        .from_writer(file);

    let mut count = 0;
    for row in rows {
        writer.serialize(row)?;
        count += 1;
    }

    writer.flush()?;
    let file = writer
        .into_inner()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    file.sync_all()?;

    Ok(count)
}

/// Append daily aggregates to `csv_path`
pub fn export_daily_stats(stats: &[DailyStat], csv_path: &Path) -> Result<usize> {
    if stats.is_empty() {
        tracing::info!("No daily stats to export");
        return Ok(0);
    }
    let count = append_rows(stats.iter().map(DailyRow::from), csv_path)?;
    tracing::info!("Exported {} days to {:?}", count, csv_path);
    Ok(count)
}

/// Append sessions to `csv_path`
pub fn export_sessions(sessions: &[PostureSession], csv_path: &Path) -> Result<usize> {
    if sessions.is_empty() {
        tracing::info!("No sessions to export");
        return Ok(0);
    }
    let count = append_rows(sessions.iter().map(SessionRow::from), csv_path)?;
    tracing::info!("Exported {} sessions to {:?}", count, csv_path);
    Ok(count)
}
