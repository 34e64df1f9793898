//! `minder schedule` subcommands: manage jobs and evaluate due work.

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand, ValueEnum};
use serde_json::json;

use minder_config::MinderConfig;
use minder_logstore::LogStore;
use minder_scheduler::{Job, JobKind, JobMode, JobStore};

#[derive(Subcommand)]
pub enum ScheduleCommands {
    /// Create a job (generates an id when --id is omitted)
    Add(JobArgs),
    /// Update an existing job by id
    Update(JobArgs),
    /// Remove a job by id
    Remove {
        #[arg(long)]
        id: String,
    },
    /// List all jobs
    List,
    /// Show which jobs are due as of a timestamp, without executing them
    RunDue {
        /// RFC3339 timestamp (defaults to now)
        #[arg(long)]
        at: Option<String>,
    },
}

#[derive(Args)]
pub struct JobArgs {
    /// Job id
    #[arg(long)]
    pub id: Option<String>,

    /// Destination chat id
    #[arg(long)]
    pub chat: i64,

    /// Prompt delivered when the job fires
    #[arg(long)]
    pub prompt: String,

    /// Schedule family
    #[arg(long, value_enum)]
    pub mode: ModeArg,

    /// Cron expression, e.g. "0 9 * * *" (mode=cron)
    #[arg(long)]
    pub cron: Option<String>,

    /// RFC3339 timestamp (mode=once)
    #[arg(long)]
    pub run_at: Option<String>,

    /// Duration such as "30m" or "1h30m" (mode=interval)
    #[arg(long)]
    pub interval: Option<String>,

    /// IANA timezone for cron evaluation (config default if omitted)
    #[arg(long)]
    pub tz: Option<String>,

    /// Store the job disabled
    #[arg(long)]
    pub disabled: bool,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum ModeArg {
    Once,
    Cron,
    Interval,
}

impl From<ModeArg> for JobMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Once => JobMode::Once,
            ModeArg::Cron => JobMode::Cron,
            ModeArg::Interval => JobMode::Interval,
        }
    }
}

pub fn run(command: ScheduleCommands) -> anyhow::Result<()> {
    let config = minder_config::load_config().unwrap_or_default();
    let logger = LogStore::new(config.logs_dir())?;
    let store = JobStore::new(config.jobs_path())?;
    let now = Utc::now();

    match command {
        ScheduleCommands::Add(args) => upsert(&store, &logger, &config, args, now, "add"),
        ScheduleCommands::Update(args) => upsert(&store, &logger, &config, args, now, "update"),
        ScheduleCommands::Remove { id } => {
            let removed = store.remove(&id)?;
            let _ = logger.write(
                "schedule_cli",
                "remove",
                json!({"job_id": id, "removed": removed}),
            );
            print_json(&json!({"ok": true, "removed": removed}))
        }
        ScheduleCommands::List => {
            let jobs = store.list()?;
            print_json(&json!({"jobs": jobs}))
        }
        ScheduleCommands::RunDue { at } => {
            let at = match at {
                Some(raw) => DateTime::parse_from_rfc3339(&raw)
                    .context("invalid --at")?
                    .with_timezone(&Utc),
                None => now,
            };
            let due = store.due(at)?;
            print_json(&json!({"at": at.to_rfc3339(), "due": due}))
        }
    }
}

fn upsert(
    store: &JobStore,
    logger: &LogStore,
    config: &MinderConfig,
    args: JobArgs,
    now: DateTime<Utc>,
    event: &str,
) -> anyhow::Result<()> {
    let id = match args.id {
        Some(id) => id,
        None if event == "add" => uuid::Uuid::new_v4().to_string(),
        None => anyhow::bail!("--id is required for update"),
    };
    let job = Job {
        id,
        kind: JobKind::User,
        chat_id: args.chat,
        prompt: args.prompt.trim().to_string(),
        mode: args.mode.into(),
        cron_expr: args.cron.unwrap_or_default().trim().to_string(),
        run_at: args.run_at.unwrap_or_default().trim().to_string(),
        interval: args.interval.unwrap_or_default().trim().to_string(),
        timezone: args.tz.unwrap_or_default().trim().to_string(),
        enabled: !args.disabled,
        next_run_at: String::new(),
        last_run_at: String::new(),
        last_result: String::new(),
        created_at: String::new(),
        updated_at: String::new(),
    };
    let saved = store.upsert(job, now, &config.timezone)?;
    let _ = logger.write(
        "schedule_cli",
        event,
        json!({"job_id": saved.id, "chat_id": saved.chat_id}),
    );
    print_json(&saved)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
