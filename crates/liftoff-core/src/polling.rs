use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Mutex as TokioMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::callback::CallbackAggregator;
use crate::db::Db;
use crate::providers::{ProviderSet, QueueState, RunState};
use crate::types::{BuildUploadStatus, WorkflowStatus};

struct PollingJobs {
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    handles: Vec<JoinHandle<()>>,
}

/// Two native recurring pollers per release: pending → running (queue
/// probe) and running → done (run probe). Both only touch Build rows and
/// then funnel changed tasks through the callback aggregator.
pub struct PollingManager {
    db: Arc<Db>,
    providers: Arc<ProviderSet>,
    callback: Arc<CallbackAggregator>,
    pending_interval: Duration,
    running_interval: Duration,
    jobs: TokioMutex<HashMap<i64, PollingJobs>>,
}

impl PollingManager {
    pub fn new(
        db: Arc<Db>,
        providers: Arc<ProviderSet>,
        callback: Arc<CallbackAggregator>,
        pending_interval: Duration,
        running_interval: Duration,
    ) -> Self {
        Self {
            db,
            providers,
            callback,
            pending_interval,
            running_interval,
            jobs: TokioMutex::new(HashMap::new()),
        }
    }

    // ── Job lifecycle ────────────────────────────────────────────────────

    /// Starts the poller pair for a release. No-op if already running.
    pub async fn create_jobs(self: &Arc<Self>, release_id: i64) {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&release_id) {
            return;
        }
        let stop = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());

        let pending = {
            let mgr = Arc::clone(self);
            let stop = Arc::clone(&stop);
            let wake = Arc::clone(&wake);
            let interval = self.pending_interval;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = tokio::time::sleep(interval) => {}
                        () = wake.notified() => {}
                    }
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(e) = mgr.run_pending_pass(release_id).await {
                        warn!("pending poller for release #{release_id}: {e}");
                    }
                }
            })
        };

        let running = {
            let mgr = Arc::clone(self);
            let stop = Arc::clone(&stop);
            let wake = Arc::clone(&wake);
            let interval = self.running_interval;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = tokio::time::sleep(interval) => {}
                        () = wake.notified() => {}
                    }
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    if let Err(e) = mgr.run_running_pass(release_id).await {
                        warn!("running poller for release #{release_id}: {e}");
                    }
                }
            })
        };

        jobs.insert(
            release_id,
            PollingJobs {
                stop,
                wake,
                handles: vec![pending, running],
            },
        );
        info!("created workflow polling jobs for release #{release_id}");
    }

    /// Stops and removes the poller pair for a release. Idempotent.
    pub async fn delete_jobs(&self, release_id: i64) {
        let entry = self.jobs.lock().await.remove(&release_id);
        let Some(entry) = entry else { return };
        entry.stop.store(true, Ordering::Release);
        entry.wake.notify_waiters();
        for handle in entry.handles {
            let _ = handle.await;
        }
        info!("deleted workflow polling jobs for release #{release_id}");
    }

    pub async fn shutdown(&self) {
        let ids: Vec<i64> = self.jobs.lock().await.keys().copied().collect();
        for id in ids {
            self.delete_jobs(id).await;
        }
    }

    // ── Poll passes ──────────────────────────────────────────────────────

    /// Probes queued CI builds. Missing data on one build is non-fatal;
    /// the rest of the pass continues. Returns the tasks whose builds
    /// changed (each already funnelled through the aggregator).
    pub async fn run_pending_pass(&self, release_id: i64) -> Result<Vec<i64>> {
        let Some(release) = self.db.get_release(release_id)? else {
            return Ok(vec![]);
        };
        let builds = self
            .db
            .list_cicd_builds_by_workflow_status(release_id, WorkflowStatus::Pending)?;

        let mut changed: Vec<i64> = Vec::new();
        for build in builds {
            let Some(kind) = build.ci_run_type else {
                warn!("build #{}: CICD build without a run type", build.id);
                continue;
            };
            let ci = match self.providers.cicd(kind) {
                Ok(ci) => ci,
                Err(e) => {
                    warn!("build #{}: {e}", build.id);
                    continue;
                }
            };
            let Some(queue_location) = build.queue_location.as_deref() else {
                warn!("build #{}: pending without a queue location", build.id);
                continue;
            };

            match ci.get_queue_status(&release.tenant_id, queue_location).await {
                Ok(status) => match status.state {
                    QueueState::Pending => {}
                    QueueState::Running => {
                        self.db.update_build_workflow(
                            build.id,
                            WorkflowStatus::Running,
                            status.executable_url.as_deref(),
                        )?;
                        changed.push(build.task_id);
                    }
                    QueueState::Completed => {
                        self.db.update_build_workflow(
                            build.id,
                            WorkflowStatus::Completed,
                            status.executable_url.as_deref(),
                        )?;
                        self.db
                            .update_build_upload(build.id, BuildUploadStatus::Uploaded, None)?;
                        changed.push(build.task_id);
                    }
                    QueueState::Cancelled | QueueState::Failed => {
                        self.db.update_build_workflow(
                            build.id,
                            WorkflowStatus::Failed,
                            status.executable_url.as_deref(),
                        )?;
                        self.db
                            .update_build_upload(build.id, BuildUploadStatus::Failed, None)?;
                        changed.push(build.task_id);
                    }
                },
                Err(e) => warn!("queue status for build #{}: {e}", build.id),
            }
        }

        self.fire_callbacks(&mut changed)?;
        Ok(changed)
    }

    /// Probes started CI runs until they reach a terminal state.
    pub async fn run_running_pass(&self, release_id: i64) -> Result<Vec<i64>> {
        let Some(release) = self.db.get_release(release_id)? else {
            return Ok(vec![]);
        };
        let builds = self
            .db
            .list_cicd_builds_by_workflow_status(release_id, WorkflowStatus::Running)?;

        let mut changed: Vec<i64> = Vec::new();
        for build in builds {
            let Some(kind) = build.ci_run_type else {
                warn!("build #{}: CICD build without a run type", build.id);
                continue;
            };
            let ci = match self.providers.cicd(kind) {
                Ok(ci) => ci,
                Err(e) => {
                    warn!("build #{}: {e}", build.id);
                    continue;
                }
            };
            let Some(ci_run_id) = build.ci_run_id.as_deref() else {
                warn!("build #{}: running without a run id", build.id);
                continue;
            };

            match ci.get_build_status(&release.tenant_id, ci_run_id).await {
                Ok(RunState::Running) => {}
                Ok(RunState::Completed) => {
                    self.db
                        .update_build_workflow(build.id, WorkflowStatus::Completed, None)?;
                    self.db
                        .update_build_upload(build.id, BuildUploadStatus::Uploaded, None)?;
                    changed.push(build.task_id);
                }
                Ok(RunState::Failed) => {
                    self.db
                        .update_build_workflow(build.id, WorkflowStatus::Failed, None)?;
                    self.db
                        .update_build_upload(build.id, BuildUploadStatus::Failed, None)?;
                    changed.push(build.task_id);
                }
                Err(e) => warn!("build status for build #{}: {e}", build.id),
            }
        }

        self.fire_callbacks(&mut changed)?;
        Ok(changed)
    }

    fn fire_callbacks(&self, changed: &mut Vec<i64>) -> Result<()> {
        changed.sort_unstable();
        changed.dedup();
        for task_id in changed.iter() {
            self.callback.process_callback(*task_id)?;
        }
        Ok(())
    }
}
