use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex as TokioMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::db::Db;
use crate::engine::Engine;
use crate::types::{CronStatus, ReleaseStatus};

struct RunnerHandle {
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// One cooperative tick loop per active release. Ticks are single-flight
/// per release; overlapping ticks are dropped, never queued. Across
/// releases, runners are independent tokio tasks.
pub struct Scheduler {
    db: Arc<Db>,
    engine: Arc<Engine>,
    tick_interval: Duration,
    runners: TokioMutex<HashMap<i64, RunnerHandle>>,
    in_flight: Arc<TokioMutex<HashSet<i64>>>,
}

impl Scheduler {
    pub fn new(db: Arc<Db>, engine: Arc<Engine>, tick_interval: Duration) -> Self {
        Self {
            db,
            engine,
            tick_interval,
            runners: TokioMutex::new(HashMap::new()),
            in_flight: Arc::new(TokioMutex::new(HashSet::new())),
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    /// Starts the runner for a release. Returns false if one is already
    /// running.
    pub async fn start(self: &Arc<Self>, release_id: i64) -> bool {
        let mut runners = self.runners.lock().await;
        if let Some(existing) = runners.get(&release_id) {
            if !existing.handle.is_finished() {
                return false;
            }
        }

        let stop = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let handle = {
            let scheduler = Arc::clone(self);
            let stop = Arc::clone(&stop);
            let wake = Arc::clone(&wake);
            let interval = self.tick_interval;
            tokio::spawn(async move {
                info!("runner started for release #{release_id}");
                loop {
                    tokio::select! {
                        () = tokio::time::sleep(interval) => {}
                        () = wake.notified() => {}
                    }
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    scheduler.tick_once(release_id).await;
                    if scheduler.reached_terminal(release_id) {
                        info!("runner for release #{release_id}: terminal state, exiting");
                        break;
                    }
                }
                info!("runner stopped for release #{release_id}");
            })
        };

        runners.insert(release_id, RunnerHandle { stop, wake, handle });
        true
    }

    /// Stops the runner for a release, draining an in-progress tick.
    pub async fn stop(&self, release_id: i64) {
        let entry = self.runners.lock().await.remove(&release_id);
        let Some(entry) = entry else { return };
        entry.stop.store(true, Ordering::Release);
        entry.wake.notify_waiters();
        let _ = entry.handle.await;
    }

    pub async fn is_running(&self, release_id: i64) -> bool {
        self.runners
            .lock()
            .await
            .get(&release_id)
            .map(|h| !h.handle.is_finished())
            .unwrap_or(false)
    }

    /// Graceful shutdown: stop every runner and drain running ticks.
    pub async fn shutdown(&self) {
        let ids: Vec<i64> = self.runners.lock().await.keys().copied().collect();
        for id in ids {
            self.stop(id).await;
        }
    }

    // ── Tick ─────────────────────────────────────────────────────────────

    /// Runs one tick for a release unless one is already in flight, in
    /// which case the tick is dropped. The engine owns its own error
    /// semantics; anything escaping it is logged and swallowed so the
    /// runner never dies.
    pub async fn tick_once(&self, release_id: i64) -> bool {
        {
            let mut guard = self.in_flight.lock().await;
            if !guard.insert(release_id) {
                debug!("release #{release_id}: tick already in flight, dropped");
                return false;
            }
        }
        if let Err(e) = self.engine.execute(release_id).await {
            error!("engine tick for release #{release_id}: {e}");
        }
        self.in_flight.lock().await.remove(&release_id);
        true
    }

    fn reached_terminal(&self, release_id: i64) -> bool {
        let release_done = matches!(
            self.db.get_release(release_id),
            Ok(Some(r)) if r.status == ReleaseStatus::Archived
        );
        let cron_done = matches!(
            self.db.get_cron_job(release_id),
            Ok(Some(c)) if c.cron_status == CronStatus::Completed
        );
        release_done || cron_done
    }
}

