//! Jittered half-hourly heartbeat.
//!
//! One synthetic always-on schedule with its own small state file. Per
//! 30-minute epoch it draws a due time once (base ± up to 10 minutes) and
//! tracks whether that epoch's opportunity was used, skipped, or is still
//! pending. Re-checking `busy` on every tick instead of skipping on the
//! first busy observation lets a heartbeat still fire once the agent frees
//! up, without ever firing twice in one epoch.

use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use fs2::FileExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use minder_types::{JobKind, Trigger};

use crate::store::{fmt_rfc3339, parse_rfc3339, sibling};

/// Fixed job id carried by heartbeat triggers.
pub const HEARTBEAT_JOB_ID: &str = "heartbeat";

const EPOCH_MINUTES: u32 = 30;
const JITTER_MINUTES: i64 = 10;
const WINDOW_MINUTES: i64 = 10;

#[derive(Debug, Error)]
pub enum HeartbeatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid stored timestamp: {0}")]
    Parse(#[from] chrono::ParseError),
}

pub type Result<T> = std::result::Result<T, HeartbeatError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    Scheduled,
    Executed,
    Skipped,
}

/// Persisted heartbeat state for one half-hour epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatState {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cycle_base: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub due_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub window_end: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub offset_min: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<HeartbeatStatus>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// Outcome of a heartbeat tick, logged on every check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatDecision {
    Disabled,
    AlreadyHandled,
    Waiting,
    SkippedBusyOrMissed,
    DelayedBusy,
    Executed,
}

impl HeartbeatDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            HeartbeatDecision::Disabled => "disabled",
            HeartbeatDecision::AlreadyHandled => "already_handled",
            HeartbeatDecision::Waiting => "waiting",
            HeartbeatDecision::SkippedBusyOrMissed => "skipped_busy_or_missed",
            HeartbeatDecision::DelayedBusy => "delayed_busy",
            HeartbeatDecision::Executed => "executed",
        }
    }
}

/// The heartbeat state machine. Owns its state file exclusively.
pub struct Heartbeat {
    path: PathBuf,
    lock_path: PathBuf,
    enabled: bool,
    chat_id: i64,
    prompt: String,
    // Serializes ticks and owns the jitter source.
    rng: Mutex<StdRng>,
}

impl Heartbeat {
    pub fn new(
        path: impl Into<PathBuf>,
        enabled: bool,
        chat_id: i64,
        prompt: impl Into<String>,
    ) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let lock_path = sibling(&path, ".lock");
        Ok(Self {
            path,
            lock_path,
            enabled,
            chat_id,
            prompt: prompt.into(),
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }

    /// Advance the state machine for `now` and report whether the
    /// heartbeat should fire. `busy` never advances the status, so a later
    /// tick in the same epoch can still succeed before the window closes.
    pub fn tick(
        &self,
        now: DateTime<Utc>,
        busy: bool,
    ) -> Result<(Option<Trigger>, HeartbeatDecision, bool)> {
        if !self.enabled || self.chat_id == 0 {
            return Ok((None, HeartbeatDecision::Disabled, false));
        }

        let mut rng = self.rng.lock().unwrap();
        let _flock = self.file_lock()?;
        let mut state = self.load()?;

        let cycle_base = floor_half_hour(now);
        let same_epoch = parse_rfc3339(&state.cycle_base)
            .map(|t| t == cycle_base)
            .unwrap_or(false);
        if !same_epoch {
            // New epoch: draw jitter exactly once and persist before
            // deciding anything else.
            let offset = rng.gen_range(-JITTER_MINUTES..=JITTER_MINUTES);
            state = HeartbeatState {
                cycle_base: fmt_rfc3339(cycle_base),
                due_at: fmt_rfc3339(cycle_base + Duration::minutes(offset)),
                window_end: fmt_rfc3339(cycle_base + Duration::minutes(WINDOW_MINUTES)),
                offset_min: offset,
                status: Some(HeartbeatStatus::Scheduled),
            };
            self.save(&state)?;
        }

        if matches!(
            state.status,
            Some(HeartbeatStatus::Executed | HeartbeatStatus::Skipped)
        ) {
            return Ok((None, HeartbeatDecision::AlreadyHandled, false));
        }

        let due_at = parse_rfc3339(&state.due_at)?;
        let window_end = parse_rfc3339(&state.window_end)?;

        if now < due_at {
            return Ok((None, HeartbeatDecision::Waiting, false));
        }
        if now > window_end {
            state.status = Some(HeartbeatStatus::Skipped);
            self.save(&state)?;
            return Ok((None, HeartbeatDecision::SkippedBusyOrMissed, false));
        }
        if busy {
            return Ok((None, HeartbeatDecision::DelayedBusy, false));
        }

        state.status = Some(HeartbeatStatus::Executed);
        self.save(&state)?;

        let trigger = Trigger {
            kind: JobKind::Heartbeat,
            job_id: HEARTBEAT_JOB_ID.to_string(),
            chat_id: self.chat_id,
            prompt: self.prompt.clone(),
            source: "heartbeat".to_string(),
        };
        Ok((Some(trigger), HeartbeatDecision::Executed, true))
    }

    fn file_lock(&self) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)?;
        file.lock_exclusive()?;
        Ok(file)
    }

    fn load(&self) -> Result<HeartbeatState> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(HeartbeatState::default());
            }
            Err(err) => return Err(err.into()),
        };
        if data.is_empty() {
            return Ok(HeartbeatState::default());
        }
        Ok(serde_json::from_slice(&data)?)
    }

    fn save(&self, state: &HeartbeatState) -> Result<()> {
        let data = serde_json::to_vec_pretty(state)?;
        let tmp = sibling(&self.path, ".tmp");
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Floor to the enclosing half-hour boundary (minute 00 or 30), in UTC.
fn floor_half_hour(t: DateTime<Utc>) -> DateTime<Utc> {
    let minutes = (t.minute() / EPOCH_MINUTES) * EPOCH_MINUTES;
    Utc.with_ymd_and_hms(t.year(), t.month(), t.day(), t.hour(), minutes, 0)
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_heartbeat(dir: &tempfile::TempDir) -> Heartbeat {
        Heartbeat::new(dir.path().join("heartbeat.json"), true, 123, "hb prompt").unwrap()
    }

    fn seed_state(hb: &Heartbeat, state: &HeartbeatState) {
        hb.save(state).unwrap();
    }

    #[test]
    fn test_disabled_returns_no_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let hb = Heartbeat::new(dir.path().join("hb.json"), false, 123, "p").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 2, 21, 12, 5, 0).unwrap();
        let (trigger, decision, should_run) = hb.tick(now, false).unwrap();
        assert!(trigger.is_none());
        assert_eq!(decision, HeartbeatDecision::Disabled);
        assert!(!should_run);
        // No state file is created for a disabled heartbeat.
        assert!(!dir.path().join("hb.json").exists());
    }

    #[test]
    fn test_missing_chat_counts_as_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let hb = Heartbeat::new(dir.path().join("hb.json"), true, 0, "p").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 2, 21, 12, 5, 0).unwrap();
        let (_, decision, should_run) = hb.tick(now, false).unwrap();
        assert_eq!(decision, HeartbeatDecision::Disabled);
        assert!(!should_run);
    }

    #[test]
    fn test_executes_when_due_and_idle() {
        let dir = tempfile::tempdir().unwrap();
        let hb = new_heartbeat(&dir);
        let now = Utc.with_ymd_and_hms(2026, 2, 21, 12, 5, 0).unwrap();
        seed_state(
            &hb,
            &HeartbeatState {
                cycle_base: fmt_rfc3339(floor_half_hour(now)),
                due_at: fmt_rfc3339(now - Duration::minutes(1)),
                window_end: fmt_rfc3339(now + Duration::minutes(5)),
                offset_min: -1,
                status: Some(HeartbeatStatus::Scheduled),
            },
        );

        let (trigger, decision, should_run) = hb.tick(now, false).unwrap();
        assert!(should_run);
        assert_eq!(decision, HeartbeatDecision::Executed);
        let trigger = trigger.unwrap();
        assert_eq!(trigger.chat_id, 123);
        assert_eq!(trigger.kind, JobKind::Heartbeat);
        assert_eq!(trigger.job_id, HEARTBEAT_JOB_ID);
        assert_eq!(trigger.source, "heartbeat");

        // Same epoch, second tick: already handled.
        let (_, decision, should_run) = hb.tick(now + Duration::minutes(1), false).unwrap();
        assert_eq!(decision, HeartbeatDecision::AlreadyHandled);
        assert!(!should_run);
    }

    #[test]
    fn test_skips_after_window() {
        let dir = tempfile::tempdir().unwrap();
        let hb = new_heartbeat(&dir);
        let now = Utc.with_ymd_and_hms(2026, 2, 21, 12, 20, 0).unwrap();
        seed_state(
            &hb,
            &HeartbeatState {
                cycle_base: fmt_rfc3339(floor_half_hour(now)),
                due_at: fmt_rfc3339(now - Duration::minutes(20)),
                window_end: fmt_rfc3339(now - Duration::minutes(1)),
                offset_min: 0,
                status: Some(HeartbeatStatus::Scheduled),
            },
        );

        let (trigger, decision, should_run) = hb.tick(now, true).unwrap();
        assert!(trigger.is_none());
        assert!(!should_run);
        assert_eq!(decision, HeartbeatDecision::SkippedBusyOrMissed);

        let stored = hb.load().unwrap();
        assert_eq!(stored.status, Some(HeartbeatStatus::Skipped));
    }

    #[test]
    fn test_busy_delays_without_consuming_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let hb = new_heartbeat(&dir);
        let now = Utc.with_ymd_and_hms(2026, 2, 21, 12, 5, 0).unwrap();
        seed_state(
            &hb,
            &HeartbeatState {
                cycle_base: fmt_rfc3339(floor_half_hour(now)),
                due_at: fmt_rfc3339(now - Duration::minutes(2)),
                window_end: fmt_rfc3339(now + Duration::minutes(5)),
                offset_min: 2,
                status: Some(HeartbeatStatus::Scheduled),
            },
        );

        let (_, decision, should_run) = hb.tick(now, true).unwrap();
        assert_eq!(decision, HeartbeatDecision::DelayedBusy);
        assert!(!should_run);
        assert_eq!(hb.load().unwrap().status, Some(HeartbeatStatus::Scheduled));

        // Once no longer busy, the same epoch still fires.
        let (_, decision, should_run) = hb.tick(now + Duration::minutes(2), false).unwrap();
        assert_eq!(decision, HeartbeatDecision::Executed);
        assert!(should_run);
    }

    #[test]
    fn test_jitter_drawn_once_per_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let hb = new_heartbeat(&dir);
        let now = Utc.with_ymd_and_hms(2026, 2, 21, 12, 5, 0).unwrap();

        hb.tick(now, false).unwrap();
        let first = hb.load().unwrap();
        assert!(!first.cycle_base.is_empty());
        assert!((-10..=10).contains(&first.offset_min));

        hb.tick(now + Duration::minutes(3), false).unwrap();
        let second = hb.load().unwrap();
        assert_eq!(second.cycle_base, first.cycle_base);
        assert_eq!(second.due_at, first.due_at);
        assert_eq!(second.window_end, first.window_end);
        assert_eq!(second.offset_min, first.offset_min);
    }

    #[test]
    fn test_new_epoch_resets_state() {
        let dir = tempfile::tempdir().unwrap();
        let hb = new_heartbeat(&dir);
        let now = Utc.with_ymd_and_hms(2026, 2, 21, 12, 20, 0).unwrap();
        seed_state(
            &hb,
            &HeartbeatState {
                cycle_base: fmt_rfc3339(floor_half_hour(now)),
                due_at: fmt_rfc3339(now),
                window_end: fmt_rfc3339(now + Duration::minutes(1)),
                offset_min: 0,
                status: Some(HeartbeatStatus::Executed),
            },
        );

        // 12:35 falls into the next epoch: fresh jitter, scheduled again.
        let later = Utc.with_ymd_and_hms(2026, 2, 21, 12, 35, 0).unwrap();
        hb.tick(later, false).unwrap();
        let state = hb.load().unwrap();
        assert_eq!(
            parse_rfc3339(&state.cycle_base).unwrap(),
            Utc.with_ymd_and_hms(2026, 2, 21, 12, 30, 0).unwrap()
        );
        assert_ne!(state.status, Some(HeartbeatStatus::Skipped));
    }

    #[test]
    fn test_floor_half_hour() {
        let t = Utc.with_ymd_and_hms(2026, 2, 21, 12, 29, 59).unwrap();
        assert_eq!(
            floor_half_hour(t),
            Utc.with_ymd_and_hms(2026, 2, 21, 12, 0, 0).unwrap()
        );
        let t = Utc.with_ymd_and_hms(2026, 2, 21, 12, 30, 0).unwrap();
        assert_eq!(
            floor_half_hour(t),
            Utc.with_ymd_and_hms(2026, 2, 21, 12, 30, 0).unwrap()
        );
    }
}
