use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ──────────────────── Job Types ────────────────────

/// Schedule family of a job. Determines which schedule field is authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    /// Fires exactly once at `run_at`.
    Once,
    /// Recurs per a 5-field cron expression, evaluated in `timezone`.
    Cron,
    /// Recurs a fixed duration after each run.
    Interval,
}

/// Provenance of a trigger: a user-defined job or the synthetic heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    #[default]
    User,
    Heartbeat,
}

/// A persisted schedule definition.
///
/// Field names and enum spellings are the on-disk JSON contract; existing
/// job files must keep deserializing unchanged. Timestamp fields are kept
/// as RFC 3339 strings (empty = unset) so that one damaged timestamp
/// degrades to "not schedulable" instead of failing the whole file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Caller-assigned unique ID.
    pub id: String,
    #[serde(default)]
    pub kind: JobKind,
    /// Destination chat. Required, non-zero.
    pub chat_id: i64,
    /// Text delivered to the handler when the job fires.
    pub prompt: String,
    pub mode: JobMode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cron_expr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub run_at: String,
    /// Duration string, e.g. "30m" or "1h30m".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub interval: String,
    /// IANA zone name for cron evaluation; store default applies if empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timezone: String,
    pub enabled: bool,
    /// Derived: next occurrence, recomputed on every upsert and execution.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub next_run_at: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_run_at: String,
    /// "ok" or "error: ..." from the most recent execution.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_result: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job id is required")]
    MissingId,
    #[error("chat id is required")]
    MissingChatId,
    #[error("prompt is required")]
    MissingPrompt,
    #[error("runAt is required for once jobs")]
    MissingRunAt,
    #[error("cronExpr is required for cron jobs")]
    MissingCronExpr,
    #[error("interval is required for interval jobs")]
    MissingInterval,
    #[error("invalid interval: {0}")]
    InvalidInterval(#[from] DurationError),
}

impl Job {
    /// Check the invariants a job must satisfy before it is stored.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.id.is_empty() {
            return Err(JobError::MissingId);
        }
        if self.chat_id == 0 {
            return Err(JobError::MissingChatId);
        }
        if self.prompt.is_empty() {
            return Err(JobError::MissingPrompt);
        }
        match self.mode {
            JobMode::Once => {
                if self.run_at.is_empty() {
                    return Err(JobError::MissingRunAt);
                }
            }
            JobMode::Cron => {
                if self.cron_expr.is_empty() {
                    return Err(JobError::MissingCronExpr);
                }
            }
            JobMode::Interval => {
                if self.interval.is_empty() {
                    return Err(JobError::MissingInterval);
                }
                parse_duration(&self.interval)?;
            }
        }
        Ok(())
    }
}

// ──────────────────── Trigger ────────────────────

/// The ephemeral message handed to the handler describing why it is being
/// invoked: which job (or the heartbeat), the destination chat, and the
/// prompt to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Trigger {
    pub kind: JobKind,
    pub job_id: String,
    pub chat_id: i64,
    pub prompt: String,
    /// "schedule:<job id>" for store jobs, "heartbeat" for the heartbeat.
    pub source: String,
}

// ──────────────────── Duration Strings ────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DurationError {
    #[error("duration is empty")]
    Empty,
    #[error("invalid duration {0:?}")]
    Invalid(String),
}

/// Parse a duration string of `<integer><unit>` segments, e.g. "90s",
/// "30m", "1h30m", "2d". Units: s, m, h, d.
pub fn parse_duration(raw: &str) -> Result<Duration, DurationError> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(DurationError::Empty);
    }
    let mut total = Duration::zero();
    let mut digits = String::new();
    let mut segments = 0usize;
    for ch in s.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if digits.is_empty() {
            return Err(DurationError::Invalid(raw.to_string()));
        }
        let value: i64 = digits
            .parse()
            .map_err(|_| DurationError::Invalid(raw.to_string()))?;
        let unit_secs: i64 = match ch {
            's' => 1,
            'm' => 60,
            'h' => 3_600,
            'd' => 86_400,
            _ => return Err(DurationError::Invalid(raw.to_string())),
        };
        let segment = value
            .checked_mul(unit_secs)
            .and_then(Duration::try_seconds)
            .ok_or_else(|| DurationError::Invalid(raw.to_string()))?;
        total = total
            .checked_add(&segment)
            .ok_or_else(|| DurationError::Invalid(raw.to_string()))?;
        digits.clear();
        segments += 1;
    }
    // Trailing digits without a unit ("30") are rejected.
    if !digits.is_empty() || segments == 0 {
        return Err(DurationError::Invalid(raw.to_string()));
    }
    Ok(total)
}
