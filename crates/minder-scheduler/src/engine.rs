//! The minute-tick polling engine.
//!
//! One background task wakes at the top of every minute, runs due jobs
//! through the caller-supplied handler, then ticks the heartbeat. All work
//! within a tick is sequential; a slow handler delays the next tick but
//! never corrupts state.

use std::sync::Arc;

use chrono::{DateTime, Duration, Timelike, Utc};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use minder_logstore::LogStore;
use minder_types::Trigger;

use crate::heartbeat::Heartbeat;
use crate::store::{JobStore, StoreError};

/// Executes a trigger. Implemented by the agent runtime; failures are
/// surfaced as returned errors only and are never retried by the engine.
#[async_trait::async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn handle(&self, trigger: &Trigger) -> anyhow::Result<()>;
}

/// Reports whether an agent turn is currently running for a chat. Used
/// only to keep the heartbeat from interrupting an in-flight turn.
pub type BusyFn = Arc<dyn Fn(i64) -> bool + Send + Sync>;

pub struct Engine {
    store: Arc<JobStore>,
    heartbeat: Option<Arc<Heartbeat>>,
    handler: Arc<dyn TriggerHandler>,
    busy: Option<BusyFn>,
    logger: Arc<LogStore>,
}

impl Engine {
    /// Store and handler are required; constructing an engine without them
    /// is a compile error rather than a runtime preflight failure.
    pub fn new(
        store: Arc<JobStore>,
        heartbeat: Option<Arc<Heartbeat>>,
        handler: Arc<dyn TriggerHandler>,
        busy: Option<BusyFn>,
        logger: Arc<LogStore>,
    ) -> Self {
        Self {
            store,
            heartbeat,
            handler,
            busy,
            logger,
        }
    }

    /// Launch the background loop. Exits promptly when `cancel` fires,
    /// including while parked between ticks.
    pub fn start(self: Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(cancel).await })
    }

    async fn run(&self, cancel: CancellationToken) {
        info!("Scheduler engine started");
        loop {
            let wait = until_next_minute(Utc::now());
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            let now = Utc::now();
            if let Err(e) = self.run_due(now).await {
                warn!("Due-job scan failed: {e}");
                let _ = self
                    .logger
                    .write("scheduler", "run_due_error", json!({"error": e.to_string()}));
            }
            self.run_heartbeat(now).await;
        }
        info!("Scheduler engine stopped");
    }

    /// Run every due job once. Also used directly (without the loop) by
    /// tests and the CLI's evaluation path.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let due = self.store.due(now)?;
        for job in due {
            let trigger = Trigger {
                kind: job.kind,
                job_id: job.id.clone(),
                chat_id: job.chat_id,
                prompt: job.prompt.clone(),
                source: format!("schedule:{}", job.id),
            };
            let result = match self.handler.handle(&trigger).await {
                Ok(()) => "ok".to_string(),
                Err(e) => format!("error: {e}"),
            };
            // Always advance the job, even when the handler failed, so a
            // job can only be due once per occurrence.
            if let Err(mark_err) = self.store.mark_executed(&job.id, now, &result) {
                warn!(job_id = %job.id, "mark_executed failed: {mark_err}");
                let _ = self.logger.write(
                    "scheduler",
                    "mark_executed_error",
                    json!({"job_id": job.id, "error": mark_err.to_string()}),
                );
            }
            let _ = self.logger.write(
                "scheduler",
                "job_triggered",
                json!({"job_id": job.id, "chat_id": job.chat_id, "result": result}),
            );
        }
        Ok(())
    }

    /// Tick the heartbeat and fire its trigger if the window allows.
    pub async fn run_heartbeat(&self, now: DateTime<Utc>) {
        let Some(heartbeat) = &self.heartbeat else {
            return;
        };
        let busy = self
            .busy
            .as_ref()
            .map(|f| f(heartbeat.chat_id()))
            .unwrap_or(false);
        let (trigger, decision, should_run) = match heartbeat.tick(now, busy) {
            Ok(out) => out,
            Err(e) => {
                warn!("Heartbeat tick failed: {e}");
                let _ = self
                    .logger
                    .write("heartbeat", "tick_error", json!({"error": e.to_string()}));
                return;
            }
        };
        let _ = self.logger.write(
            "heartbeat",
            "decision",
            json!({
                "decision": decision.as_str(),
                "chat_id": heartbeat.chat_id(),
                "busy": busy,
            }),
        );
        if !should_run {
            return;
        }
        let Some(trigger) = trigger else {
            return;
        };
        if let Err(e) = self.handler.handle(&trigger).await {
            warn!("Heartbeat run failed: {e}");
            let _ = self
                .logger
                .write("heartbeat", "run_error", json!({"error": e.to_string()}));
            return;
        }
        let _ = self
            .logger
            .write("heartbeat", "run_ok", json!({"chat_id": trigger.chat_id}));
    }
}

/// Time to park until the top of the next minute. A zero or negative wait
/// falls back to one second.
fn until_next_minute(now: DateTime<Utc>) -> std::time::Duration {
    let next = (now + Duration::minutes(1))
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now + Duration::minutes(1));
    match (next - now).to_std() {
        Ok(d) if !d.is_zero() => d,
        _ => std::time::Duration::from_secs(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use minder_types::{Job, JobKind, JobMode};

    struct RecordingHandler {
        calls: Mutex<Vec<Trigger>>,
        fail: bool,
    }

    impl RecordingHandler {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail,
            })
        }

        fn calls(&self) -> Vec<Trigger> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl TriggerHandler for RecordingHandler {
        async fn handle(&self, trigger: &Trigger) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push(trigger.clone());
            if self.fail {
                anyhow::bail!("agent unavailable");
            }
            Ok(())
        }
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 21, 10, 0, 0).unwrap()
    }

    fn fixture(
        dir: &tempfile::TempDir,
        handler: Arc<RecordingHandler>,
        heartbeat: Option<Arc<Heartbeat>>,
        busy: Option<BusyFn>,
    ) -> Arc<Engine> {
        let store = Arc::new(JobStore::new(dir.path().join("jobs.json")).unwrap());
        let logger = Arc::new(LogStore::new(dir.path().join("logs")).unwrap());
        Arc::new(Engine::new(store.clone(), heartbeat, handler, busy, logger))
    }

    fn once_job(id: &str, run_at: DateTime<Utc>) -> Job {
        Job {
            id: id.into(),
            kind: JobKind::User,
            chat_id: 99,
            prompt: "ping".into(),
            mode: JobMode::Once,
            cron_expr: String::new(),
            run_at: run_at.to_rfc3339(),
            interval: String::new(),
            timezone: String::new(),
            enabled: true,
            next_run_at: String::new(),
            last_run_at: String::new(),
            last_result: String::new(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[tokio::test]
    async fn test_run_due_invokes_handler_and_advances_job() {
        let dir = tempfile::tempdir().unwrap();
        let handler = RecordingHandler::new(false);
        let engine = fixture(&dir, handler.clone(), None, None);
        let now = base_time();

        engine
            .store
            .upsert(once_job("j1", now - Duration::minutes(1)), now, "UTC")
            .unwrap();
        engine.run_due(now).await.unwrap();

        let calls = handler.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].job_id, "j1");
        assert_eq!(calls[0].chat_id, 99);
        assert_eq!(calls[0].source, "schedule:j1");

        let jobs = engine.store.list().unwrap();
        assert!(!jobs[0].enabled);
        assert_eq!(jobs[0].last_result, "ok");

        // Nothing is due anymore on the next tick.
        engine.run_due(now + Duration::minutes(1)).await.unwrap();
        assert_eq!(handler.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_handler_failure_recorded_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let handler = RecordingHandler::new(true);
        let engine = fixture(&dir, handler.clone(), None, None);
        let now = base_time();

        engine
            .store
            .upsert(once_job("j1", now - Duration::minutes(1)), now, "UTC")
            .unwrap();
        engine.run_due(now).await.unwrap();

        let jobs = engine.store.list().unwrap();
        assert!(!jobs[0].enabled);
        assert!(jobs[0].last_result.starts_with("error: "));
        assert!(jobs[0].last_result.contains("agent unavailable"));
    }

    #[tokio::test]
    async fn test_heartbeat_fires_through_engine() {
        let dir = tempfile::tempdir().unwrap();
        let handler = RecordingHandler::new(false);
        let heartbeat = Arc::new(
            Heartbeat::new(dir.path().join("heartbeat.json"), true, 123, "hb prompt").unwrap(),
        );
        let engine = fixture(&dir, handler.clone(), Some(heartbeat), None);

        // Tick at the epoch boundary: due_at is at most base+10min, so by
        // base+10min the heartbeat is always inside its window.
        let now = Utc.with_ymd_and_hms(2026, 2, 21, 12, 0, 0).unwrap();
        engine.run_heartbeat(now).await;
        engine.run_heartbeat(now + Duration::minutes(10)).await;

        let calls = handler.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, JobKind::Heartbeat);
        assert_eq!(calls[0].chat_id, 123);
        assert_eq!(calls[0].source, "heartbeat");

        // Further ticks in the same epoch never fire twice.
        engine.run_heartbeat(now + Duration::minutes(10)).await;
        assert_eq!(handler.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_respects_busy_predicate() {
        let dir = tempfile::tempdir().unwrap();
        let handler = RecordingHandler::new(false);
        let heartbeat = Arc::new(
            Heartbeat::new(dir.path().join("heartbeat.json"), true, 123, "hb prompt").unwrap(),
        );
        let busy_flag = Arc::new(AtomicBool::new(true));
        let busy_for_fn = busy_flag.clone();
        let busy: BusyFn = Arc::new(move |_chat| busy_for_fn.load(Ordering::SeqCst));
        let engine = fixture(&dir, handler.clone(), Some(heartbeat), Some(busy));

        let now = Utc.with_ymd_and_hms(2026, 2, 21, 12, 0, 0).unwrap();
        engine.run_heartbeat(now).await;
        engine.run_heartbeat(now + Duration::minutes(10)).await;
        assert!(handler.calls().is_empty());

        // Agent freed up within the same window: the heartbeat still fires.
        busy_flag.store(false, Ordering::SeqCst);
        engine.run_heartbeat(now + Duration::minutes(10)).await;
        assert_eq!(handler.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_loop_exits_promptly_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let handler = RecordingHandler::new(false);
        let engine = fixture(&dir, handler, None, None);

        let cancel = CancellationToken::new();
        let task = engine.clone().start(cancel.clone());
        cancel.cancel();

        tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .expect("engine loop should exit promptly on cancel")
            .unwrap();
    }

    #[test]
    fn test_until_next_minute() {
        let mid = Utc.with_ymd_and_hms(2026, 2, 21, 10, 0, 30).unwrap();
        assert_eq!(until_next_minute(mid), std::time::Duration::from_secs(30));

        let almost = Utc.with_ymd_and_hms(2026, 2, 21, 10, 0, 59).unwrap()
            + Duration::milliseconds(900);
        assert_eq!(
            until_next_minute(almost),
            std::time::Duration::from_millis(100)
        );
    }
}
