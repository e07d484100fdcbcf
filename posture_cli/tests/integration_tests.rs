//! Integration tests for the posture binary.
//!
//! These tests drive the full pipeline over replayed sensor recordings:
//! - Calibration from upright/slouch recordings
//! - Monitoring cycles, session storage and analysis
//! - Training capture, statistics, export and cleanup

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Fast timings so a replayed cycle takes well under a second
const CONFIG: &str = r#"
[cycle]
scan_timeout_ms = 2000
short_hold_ms = 100
long_hold_ms = 300
role_pause_ms = 20

[calibration]
connection_timeout_ms = 3000

[monitor]
retry_delay_ms = 50
"#;

fn cli() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("posture"))
}

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        fs::write(dir.path().join("config.toml"), CONFIG).unwrap();
        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn data_dir(&self) -> PathBuf {
        self.path("data")
    }

    fn cmd(&self) -> Command {
        let mut cmd = cli();
        cmd.arg("--data-dir")
            .arg(self.data_dir())
            .arg("--config")
            .arg(self.path("config.toml"))
            .arg("--user")
            .arg("tester");
        cmd
    }

    /// Recording with `count` samples per sensor at the given pitches
    fn recording(&self, name: &str, upper_pitch: f64, lower_pitch: f64, count: usize) -> PathBuf {
        let mut log = String::from("# replayed telemetry\n");
        for _ in 0..count {
            log.push_str(&line("UB", upper_pitch));
            log.push_str(&line("LB", lower_pitch));
        }
        let path = self.path(name);
        fs::write(&path, log).unwrap();
        path
    }

    fn store(&self) -> serde_json::Value {
        let contents = fs::read_to_string(self.data_dir().join("store.json")).unwrap();
        serde_json::from_str(&contents).unwrap()
    }

    fn calibrate(&self) {
        let upright = self.recording("upright.log", 5.0, 2.0, 4);
        let slouch = self.recording("slouch.log", 25.0, 3.0, 4);
        self.cmd()
            .arg("calibrate")
            .arg("--upright")
            .arg(&upright)
            .arg("--slouch")
            .arg(&slouch)
            .assert()
            .success();
    }

    fn monitor(&self, recording: &Path, cycles: usize) -> assert_cmd::assert::Assert {
        self.cmd()
            .arg("monitor")
            .arg("--replay")
            .arg(recording)
            .arg("--cycles")
            .arg(cycles.to_string())
            .assert()
    }
}

/// Accelerometer + gyroscope record pair for a device tilted by `pitch` degrees
fn line(id: &str, pitch: f64) -> String {
    let ax = -pitch.to_radians().tan();
    format!("{id}|A {ax:.6},0.000000,1.000000\n{id}|G 0.5,-0.25,0.0\n")
}

#[test]
fn test_cli_help() {
    cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Dual-sensor posture monitor"));
}

#[test]
fn test_calibration_stores_profile() {
    let ws = Workspace::new();
    let upright = ws.recording("upright.log", 5.0, 2.0, 4);
    let slouch = ws.recording("slouch.log", 25.0, 3.0, 4);

    ws.cmd()
        .arg("calibrate")
        .arg("--upright")
        .arg(&upright)
        .arg("--slouch")
        .arg(&slouch)
        .assert()
        .success()
        .stdout(predicate::str::contains("Calibration complete"))
        .stdout(predicate::str::contains("Upper threshold: 19.00°"));

    let store = ws.store();
    let profile = &store["calibration_data"]["tester"];
    assert_eq!(profile["calibrated"], true);
    let threshold = profile["upperThreshold"].as_f64().unwrap();
    assert!((threshold - 19.0).abs() < 1e-3);

    ws.cmd()
        .arg("profile")
        .assert()
        .success()
        .stdout(predicate::str::contains("Calibrated at"));
}

#[test]
fn test_calibration_without_sensor_data_fails() {
    let ws = Workspace::new();
    let upright = ws.path("empty.log");
    // Only the upper sensor is present
    fs::write(&upright, line("UB", 5.0)).unwrap();

    ws.cmd()
        .arg("calibrate")
        .arg("--upright")
        .arg(&upright)
        .arg("--slouch")
        .arg(&upright)
        .assert()
        .failure()
        .stderr(predicate::str::contains("Connection timeout"));

    let store_path = ws.data_dir().join("store.json");
    assert!(!store_path.exists() || ws.store()["calibration_data"].is_null());
}

#[test]
fn test_monitor_records_and_analyses_sessions() {
    let ws = Workspace::new();
    ws.calibrate();
    let slouched = ws.recording("slouched.log", 24.0, 3.0, 3);

    ws.monitor(&slouched, 2)
        .success()
        .stdout(predicate::str::contains("Monitored 2 cycles"))
        .stdout(predicate::str::contains("Analysed: 2 (2 slouching)"));

    let store = ws.store();
    let sessions = store["posture_sessions"]["tester"].as_object().unwrap();
    assert_eq!(sessions.len(), 2);
    for session in sessions.values() {
        assert_eq!(session["analyzed"], true);
        assert_eq!(session["slouching"], true);
        assert!(session["upperBack"].is_object());
        assert!(session["lowerBack"].is_object());
    }

    ws.cmd()
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("100.0%"));
}

#[test]
fn test_sessions_wait_for_calibration() {
    let ws = Workspace::new();
    let upright = ws.recording("upright_live.log", 6.0, 2.0, 2);

    ws.monitor(&upright, 1)
        .success()
        .stdout(predicate::str::contains("pending"));

    ws.cmd()
        .arg("analyze")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Missing calibration"));

    ws.calibrate();
    ws.cmd()
        .arg("analyze")
        .assert()
        .success()
        .stdout(predicate::str::contains("Analysed 1 sessions (0 slouching)"));
}

#[test]
fn test_training_capture_keeps_all_samples() {
    let ws = Workspace::new();
    let recording = ws.recording("pose.log", 10.0, 1.0, 6);

    ws.cmd()
        .arg("train")
        .arg("--replay")
        .arg(&recording)
        .arg("--label")
        .arg("lean_forward")
        .assert()
        .success()
        .stdout(predicate::str::contains("Total: 12"));

    let store = ws.store();
    let record = &store["users"]["tester"]["training_data"]["lean_forward"];
    assert_eq!(record["sample_count"], 12);
    assert_eq!(record["upper_back"].as_array().unwrap().len(), 6);
    assert_eq!(record["upper_back"][0]["gx"], 0.5);
}

#[test]
fn test_export_daily_stats_csv() {
    let ws = Workspace::new();
    ws.calibrate();
    let upright = ws.recording("good.log", 6.0, 2.0, 2);
    ws.monitor(&upright, 1).success();

    let csv_path = ws.path("export/daily.csv");
    ws.cmd()
        .arg("export")
        .arg("--out")
        .arg(&csv_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Exported 1 rows"));

    let contents = fs::read_to_string(&csv_path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("date,total_sessions,slouching_sessions"));
    assert!(lines[1].contains(",1,0,1,0.0,"));
}

#[test]
fn test_cleanup_removes_incomplete_sessions() {
    let ws = Workspace::new();

    // A session whose lower-back sample never arrived
    let data_dir = ws.data_dir();
    fs::create_dir_all(&data_dir).unwrap();
    let now = chrono::Utc::now().timestamp_millis();
    let seeded = serde_json::json!({
        "posture_sessions": {
            "tester": {
                "0190a000-0000-7000-8000-000000000001": {
                    "userId": "tester",
                    "timestamp": now,
                    "upperBack": {
                        "accelX": 0.0, "accelY": 0.0, "accelZ": 1.0,
                        "gyroX": 0.0, "gyroY": 0.0, "gyroZ": 0.0,
                        "timestamp": now
                    },
                    "analyzed": false
                }
            }
        }
    });
    fs::write(data_dir.join("store.json"), seeded.to_string()).unwrap();

    ws.cmd()
        .arg("cleanup")
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 1 incomplete sessions"));

    assert!(ws.store()["posture_sessions"].is_null());
}

#[test]
fn test_corrupted_store_is_recovered() {
    let ws = Workspace::new();
    let data_dir = ws.data_dir();
    fs::create_dir_all(&data_dir).unwrap();
    fs::write(data_dir.join("store.json"), "{ invalid json }}}").unwrap();

    ws.cmd()
        .arg("profile")
        .assert()
        .success()
        .stdout(predicate::str::contains("Not calibrated"));

    assert!(data_dir.join("store.json.corrupt").exists());
}

#[test]
fn test_profile_reset() {
    let ws = Workspace::new();
    ws.calibrate();

    ws.cmd().arg("profile").arg("--reset").assert().success();
    ws.cmd()
        .arg("profile")
        .assert()
        .success()
        .stdout(predicate::str::contains("Not calibrated"));
}

fn seeded_sample(now: i64, pitch: f64) -> serde_json::Value {
    serde_json::json!({
        "accelX": -pitch.to_radians().tan(), "accelY": 0.0, "accelZ": 1.0,
        "gyroX": 0.0, "gyroY": 0.0, "gyroZ": 0.0,
        "timestamp": now
    })
}

/// Add sessions to the store file next to whatever is already there
fn seed_sessions(ws: &Workspace, sessions: serde_json::Value) {
    let path = ws.data_dir().join("store.json");
    let mut store = if path.exists() {
        ws.store()
    } else {
        fs::create_dir_all(ws.data_dir()).unwrap();
        serde_json::json!({})
    };
    store["posture_sessions"]["tester"] = sessions;
    fs::write(&path, store.to_string()).unwrap();
}

#[test]
fn test_analyze_is_not_blocked_by_newer_incomplete_sessions() {
    let ws = Workspace::new();
    ws.calibrate();

    let now = chrono::Utc::now().timestamp_millis();
    let mut sessions = serde_json::json!({
        "0190a000-0000-7000-8000-000000000001": {
            "userId": "tester",
            "timestamp": now,
            "upperBack": seeded_sample(now, 24.0),
            "lowerBack": seeded_sample(now, 3.0),
            "analyzed": false
        }
    });
    for n in 2..=4 {
        sessions[format!("0190a000-0000-7000-8000-00000000000{n}")] = serde_json::json!({
            "userId": "tester",
            "timestamp": now,
            "upperBack": seeded_sample(now, 24.0),
            "analyzed": false
        });
    }
    seed_sessions(&ws, sessions);

    ws.cmd()
        .arg("analyze")
        .assert()
        .success()
        .stdout(predicate::str::contains("Analysed 1 sessions (1 slouching)"))
        .stdout(predicate::str::contains("3 sessions are missing a sensor sample"));

    let store = ws.store();
    let complete = &store["posture_sessions"]["tester"]["0190a000-0000-7000-8000-000000000001"];
    assert_eq!(complete["analyzed"], true);
}

#[test]
fn test_export_drops_expired_sessions_first() {
    let ws = Workspace::new();
    let now = chrono::Utc::now().timestamp_millis();
    let old = now - 8 * 24 * 60 * 60 * 1000;
    seed_sessions(
        &ws,
        serde_json::json!({
            "0190a000-0000-7000-8000-000000000001": {
                "userId": "tester",
                "timestamp": old,
                "upperBack": seeded_sample(old, 5.0),
                "lowerBack": seeded_sample(old, 2.0),
                "analyzed": true
            },
            "0190a000-0000-7000-8000-000000000002": {
                "userId": "tester",
                "timestamp": now,
                "upperBack": seeded_sample(now, 5.0),
                "lowerBack": seeded_sample(now, 2.0),
                "analyzed": true
            }
        }),
    );

    let csv_path = ws.path("sessions.csv");
    ws.cmd()
        .arg("export")
        .arg("--sessions")
        .arg("--out")
        .arg(&csv_path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Exported 1 rows"));

    let contents = fs::read_to_string(&csv_path).unwrap();
    assert!(contents.contains("0190a000-0000-7000-8000-000000000002"));
    assert!(!contents.contains("0190a000-0000-7000-8000-000000000001"));
}

#[test]
fn test_quiet_flag_silences_logs() {
    let ws = Workspace::new();
    ws.cmd()
        .env_remove("RUST_LOG")
        .arg("-q")
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("No posture data yet."))
        .stderr(predicate::str::is_empty());
}
