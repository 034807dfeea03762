mod logging;
mod routes;

use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    routing::{get, post},
    Router,
};
use liftoff_core::{
    callback::CallbackAggregator,
    clock::SystemClock,
    config::Config,
    db::Db,
    engine::Engine,
    polling::PollingManager,
    providers::ProviderSet,
    scheduler::Scheduler,
    service::{NoPendingCherryPicks, ReleaseService},
    types::{CiRunType, CronStatus},
};
use liftoff_providers::{
    checkmate::CheckmateTestMgmt, github::GithubScm, github_actions::GithubActionsCi,
    jenkins::JenkinsCi, jira::JiraProjectMgmt, slack::SlackNotifier, store::StoreGateway,
};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::info;

// ── AppState ──────────────────────────────────────────────────────────────

pub struct AppState {
    pub db: Arc<Db>,
    pub config: Arc<Config>,
    pub service: Arc<ReleaseService>,
    pub start_time: Instant,
    pub log_tx: broadcast::Sender<String>,
    pub log_ring: Arc<std::sync::Mutex<VecDeque<String>>>,
}

// ── main ──────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let (log_tx, _log_rx) = broadcast::channel::<String>(1024);
    let log_ring: Arc<std::sync::Mutex<VecDeque<String>>> =
        Arc::new(std::sync::Mutex::new(VecDeque::with_capacity(500)));

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "liftoff_server=info,liftoff_core=info,liftoff_providers=info,tower_http=warn".into()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(logging::LogStreamLayer::new(
            log_tx.clone(),
            Arc::clone(&log_ring),
        ))
        .init();

    let config = Arc::new(Config::from_env()?);

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = format!("{}/liftoff.db", config.data_dir);
    let mut db = Db::open(&db_path)?;
    db.migrate()?;
    let db = Arc::new(db);

    // Provider adapters, one per capability; both CI kinds are registered
    // and selected per release config.
    let providers = Arc::new(
        ProviderSet::new(
            Arc::new(GithubScm::new(&config.github_token, &config.github_owner)),
            Arc::new(JiraProjectMgmt::new(
                &config.jira_url,
                &config.jira_email,
                &config.jira_token,
            )),
            Arc::new(CheckmateTestMgmt::new(
                &config.checkmate_url,
                &config.checkmate_token,
            )),
            Arc::new(SlackNotifier::new(&config.slack_token)),
            Arc::new(StoreGateway::new(
                &config.app_store_api_url,
                &config.play_store_api_url,
                &config.store_api_key,
                Duration::from_millis(config.store_timeout_ms),
            )),
        )
        .with_cicd(
            CiRunType::Jenkins,
            Arc::new(JenkinsCi::new(
                &config.jenkins_url,
                &config.jenkins_user,
                &config.jenkins_token,
                Duration::from_millis(config.jenkins_probe_timeout_ms),
            )),
        )
        .with_cicd(
            CiRunType::GithubActions,
            Arc::new(GithubActionsCi::new(
                &config.github_token,
                &config.github_owner,
                Duration::from_millis(config.gha_verify_timeout_ms),
            )),
        ),
    );

    let clock = Arc::new(SystemClock);
    let callback = Arc::new(CallbackAggregator::new(Arc::clone(&db)));
    let polling = Arc::new(PollingManager::new(
        Arc::clone(&db),
        Arc::clone(&providers),
        Arc::clone(&callback),
        Duration::from_secs(config.pending_poll_secs),
        Duration::from_secs(config.running_poll_secs),
    ));
    let engine = Arc::new(Engine::new(
        Arc::clone(&db),
        Arc::clone(&providers),
        Arc::clone(&callback),
        Arc::clone(&polling),
        clock.clone(),
        Arc::clone(&config),
    ));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&db),
        engine,
        Duration::from_secs(config.tick_secs),
    ));
    let service = Arc::new(ReleaseService::new(
        Arc::clone(&db),
        Arc::clone(&scheduler),
        Arc::clone(&polling),
        Arc::clone(&callback),
        Arc::new(NoPendingCherryPicks),
        clock,
        Arc::clone(&config),
    ));

    // Abandon any dispatches left IN_PROGRESS by a previous crash.
    match db.reset_stranded_tasks() {
        Ok(n) if n > 0 => info!("restart recovery: re-armed {n} stranded tasks"),
        Ok(_) => {}
        Err(e) => tracing::error!("reset_stranded_tasks failed: {e}"),
    }

    // Restart recovery: releases whose cron was RUNNING resume ticking.
    let mut recovered = 0usize;
    for release in db.list_releases(None)? {
        if release.status.is_terminal() {
            continue;
        }
        let Some(cron) = db.get_cron_job(release.id)? else {
            continue;
        };
        if cron.cron_status == CronStatus::Running {
            scheduler.start(release.id).await;
            polling.create_jobs(release.id).await;
            recovered += 1;
        }
    }
    if recovered > 0 {
        info!("restart recovery: resumed {recovered} active release runners");
    }

    let state = Arc::new(AppState {
        db,
        config: Arc::clone(&config),
        service,
        start_time: Instant::now(),
        log_tx,
        log_ring,
    });

    let app = Router::new()
        // Health
        .route("/api/health", get(routes::health))
        // Releases
        .route("/api/releases", get(routes::list_releases))
        .route("/api/releases", post(routes::create_release))
        .route("/api/releases/:id", get(routes::get_release))
        .route("/api/releases/:id/tasks", get(routes::list_release_tasks))
        .route("/api/releases/:id/cycles", get(routes::list_release_cycles))
        // Cron lifecycle
        .route("/api/releases/:id/start", post(routes::start_release))
        .route("/api/releases/:id/stop", post(routes::stop_release))
        .route("/api/releases/:id/pause", post(routes::pause_release))
        .route("/api/releases/:id/resume", post(routes::resume_release))
        .route("/api/releases/:id/trigger-stage2", post(routes::trigger_stage2))
        .route("/api/releases/:id/trigger-stage3", post(routes::trigger_stage3))
        .route("/api/releases/:id/archive", post(routes::archive_release))
        // Manual upload intake
        .route("/api/releases/:id/uploads", post(routes::upload_artifact))
        // Tasks
        .route("/api/tasks/:id/retry", post(routes::retry_task))
        .route("/api/tasks/:id/approve", post(routes::approve_task))
        // SSE logs
        .route("/api/logs", get(routes::sse_logs))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", config.web_bind, config.web_port);
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Drain runners and pollers before exit.
    scheduler.shutdown().await;
    polling.shutdown().await;
    info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
