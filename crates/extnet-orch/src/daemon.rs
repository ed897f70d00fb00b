//! ExtnetDaemon implementation.
//!
//! The daemon owns the periodic work of the control plane. It manages:
//! - Task registration and priority ordering
//! - One tokio interval per enabled task
//! - Tick isolation: each tick runs on its own tokio task, so an error or
//!   panic is logged and the next tick still fires
//! - Cooperative shutdown through a watch channel

use crate::audit::{audit_log, AuditCategory, AuditOutcome, AuditRecord};
use extnet_common::{PeriodicTask, TickReport};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Stops a running [`ExtnetDaemon`] from another task.
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    stop: watch::Sender<bool>,
}

impl DaemonHandle {
    /// Requests shutdown. In-flight ticks finish first.
    pub fn stop(&self) {
        info!("Stopping ExtnetDaemon");
        let record = AuditRecord::new(AuditCategory::AdminAction, "ExtnetDaemon", "stop_requested")
            .with_outcome(AuditOutcome::Success);
        audit_log!(record);

        self.stop.send_replace(true);
    }
}

/// Periodic task scheduler.
pub struct ExtnetDaemon {
    /// Registered tasks sorted by priority
    tasks: BTreeMap<i32, Vec<Arc<dyn PeriodicTask>>>,
    stop_tx: watch::Sender<bool>,
}

impl Default for ExtnetDaemon {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtnetDaemon {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            tasks: BTreeMap::new(),
            stop_tx,
        }
    }

    /// Registers a task. Lower priority values start first.
    pub fn register_task(&mut self, task: Arc<dyn PeriodicTask>) {
        let priority = task.priority();
        info!(
            task = task.name(),
            priority,
            interval = ?task.interval(),
            "Registering periodic task"
        );

        let record = AuditRecord::new(
            AuditCategory::SystemLifecycle,
            "ExtnetDaemon",
            format!("register_task: {}", task.name()),
        )
        .with_outcome(AuditOutcome::Success)
        .with_object_id(task.name())
        .with_object_type("periodic_task")
        .with_details(serde_json::json!({
            "priority": priority,
            "interval_secs": task.interval().map(|d| d.as_secs_f64()),
        }));
        audit_log!(record);

        self.tasks.entry(priority).or_default().push(task);
    }

    /// Names of registered tasks in start order.
    pub fn task_names(&self) -> Vec<String> {
        self.tasks
            .values()
            .flatten()
            .map(|t| t.name().to_string())
            .collect()
    }

    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            stop: self.stop_tx.clone(),
        }
    }

    /// Runs every enabled task until [`DaemonHandle::stop`] is called.
    pub async fn run(&self) {
        let mut loops: Vec<JoinHandle<()>> = Vec::new();
        for task in self.tasks.values().flatten() {
            match task.interval() {
                Some(period) if !period.is_zero() => {
                    info!(task = task.name(), period = ?period, "Starting periodic task");
                    loops.push(tokio::spawn(task_loop(
                        Arc::clone(task),
                        period,
                        self.stop_tx.subscribe(),
                    )));
                }
                _ => info!(task = task.name(), "Periodic task disabled"),
            }
        }

        let record = AuditRecord::new(AuditCategory::SystemLifecycle, "ExtnetDaemon", "daemon_started")
            .with_outcome(AuditOutcome::Success)
            .with_details(serde_json::json!({
                "tasks": self.task_names(),
                "scheduled": loops.len(),
            }));
        audit_log!(record);

        for handle in loops {
            if let Err(e) = handle.await {
                error!(error = %e, "Task loop terminated abnormally");
            }
        }

        info!("ExtnetDaemon stopped");
        let record = AuditRecord::new(AuditCategory::SystemLifecycle, "ExtnetDaemon", "daemon_stopped")
            .with_outcome(AuditOutcome::Success);
        audit_log!(record);
    }
}

async fn task_loop(task: Arc<dyn PeriodicTask>, period: Duration, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            _ = ticker.tick() => {
                run_tick(Arc::clone(&task)).await;
            }
            changed = stop.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!(task = task.name(), "Task loop exited");
}

/// Runs one tick on its own tokio task and logs the outcome.
///
/// Returns `None` if the tick failed or panicked.
pub async fn run_tick(task: Arc<dyn PeriodicTask>) -> Option<TickReport> {
    let name = task.name().to_string();
    let joined = tokio::spawn(async move { task.run_once().await }).await;

    match joined {
        Ok(Ok(report)) => {
            debug!(
                task = %name,
                status = %report.status(),
                completed = report.completed,
                skipped = report.skipped,
                failed = report.failed,
                "Tick finished"
            );
            Some(report)
        }
        Ok(Err(e)) => {
            warn!(task = %name, error = %e, "Tick failed");
            None
        }
        Err(e) if e.is_panic() => {
            error!(task = %name, "Tick panicked");
            None
        }
        Err(e) => {
            error!(task = %name, error = %e, "Tick was cancelled");
            None
        }
    }
}
