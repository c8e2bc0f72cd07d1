//! OVD Watchdog - replays a recorded session through the rule engine and
//! serves the operator API while it runs.
//!
//! # API Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /incidents?state=` - List incidents
//! - `GET /incidents/:id` - Incident with notification log
//! - `POST /incidents/:id/resolve` - Resolve an incident

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use ovd_watchdog::api::{self, AppState};
use ovd_watchdog::config::WatchdogConfig;
use ovd_watchdog::engine::{Classifier, EngineConfig, RuleEngine};
use ovd_watchdog::notify::{AlertContext, NotificationDispatcher, load_channels};
use ovd_watchdog::pipeline::{Pipeline, PipelineSettings, RunSummary};
use ovd_watchdog::record::IncidentRecorder;
use ovd_watchdog::replay::{ImageSequenceSource, NoopDetector, TrackLogReplay};
use ovd_watchdog::rule::load_rules;
use ovd_watchdog::storage::Storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("ovd_watchdog=info".parse()?))
        .init();

    let config = WatchdogConfig::from_env()?;
    info!(port = config.port, db_url = %config.database_url, camera = %config.camera_id, "Starting OVD Watchdog");

    let rules = match load_rules(&config.rules_path) {
        Ok(rules) => rules,
        Err(e) => {
            error!(path = %config.rules_path.display(), error = %e, "Could not load rules");
            return Err(e.into());
        }
    };
    info!(count = rules.len(), "Rules loaded");

    let storage = Storage::new(&config.database_url).await?;
    info!("Database initialized");

    let channels = load_channels(&config.channels_dir);
    let dispatcher = Arc::new(NotificationDispatcher::new(channels, config.send_timeout));
    info!(channels = ?dispatcher.channel_names(), "Notification channels ready");

    let source = ImageSequenceSource::open(&config.input_dir, config.fps)?;
    let tracker = TrackLogReplay::open(&config.track_log)?;
    let engine = RuleEngine::new(
        rules,
        EngineConfig {
            resolve_after_seconds: config.resolve_after_seconds,
        },
    );
    let alerts = AlertContext {
        recorder: IncidentRecorder::new(&config.incident_dir),
        dispatcher,
        storage: Some(storage.clone()),
        camera_id: config.camera_id.clone(),
    };

    let (pipeline, commands) = Pipeline::new(
        source,
        NoopDetector,
        tracker,
        engine,
        Classifier::default(),
        alerts,
        PipelineSettings::from(&config),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut monitor = tokio::spawn(pipeline.run(shutdown_rx));

    let app = api::router(AppState { storage, commands });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "OVD Watchdog is listening");

    let server = tokio::spawn(async move { axum::serve(listener, app).await });

    let finished = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Could not listen for shutdown signal");
            }
            info!("Shutdown signal received");
            None
        }
        joined = &mut monitor => Some(joined),
    };

    match finished {
        Some(joined) => {
            report(joined);
            // Journal stays browsable until the operator stops the process
            info!("Replay complete, API still serving until Ctrl-C");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Could not listen for shutdown signal");
            }
        }
        None => {
            let _ = shutdown_tx.send(true);
            report(monitor.await);
        }
    }

    server.abort();
    info!("OVD Watchdog stopped");
    Ok(())
}

fn report(joined: Result<RunSummary, tokio::task::JoinError>) {
    match joined {
        Ok(summary) => info!(
            frames = summary.frames,
            incidents = summary.incidents,
            confirmed = summary.confirmed,
            alerts = summary.alerts_submitted,
            dropped = summary.alerts_dropped,
            "Session finished"
        ),
        Err(e) => error!(error = %e, "Pipeline task failed"),
    }
}
