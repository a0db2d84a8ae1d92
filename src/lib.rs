//! HealthGuard: autonomous patient-monitoring decision & alert pipeline.
//!
//! Deterministic clinical rules evaluate every signal first; an external
//! anomaly score can escalate but never override them. Verdicts fan out to
//! delivery channels with exactly-once receipts, every decision lands in a
//! hash-chained audit log, and raw media never outlives its retention
//! deadline. An autonomous cycle re-evaluates every patient on a fixed
//! period so slow trends are caught without fresh input.

pub mod agent;
pub mod audit;
pub mod clients;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fusion;
pub mod ingest;
pub mod retention;
pub mod rules;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod util;

use std::sync::Arc;

use tokio::sync::watch;

use agent::Agent;
use audit::AuditLog;
use clients::{
    ClinicalReasoner, DeliveryChannel, InferenceGateway, MediaAnalyzer, SpokenAlertChannel,
    TelegramChannel,
};
use config::AppConfig;
use dispatch::{ChannelSet, Dispatcher};
use error::PipelineError;
use retention::RetentionEnforcer;
use scheduler::Scheduler;
use store::StateDb;
use util::system_clock;

/// Wire up the pipeline from config and run until Ctrl-C.
pub async fn run(config: AppConfig) -> Result<(), PipelineError> {
    std::fs::create_dir_all(&config.data_dir)
        .map_err(|e| PipelineError::ExternalFailure(format!("data dir: {e}")))?;

    // Raw media from a previous process must not survive a restart
    ingest::clear_stale_ephemeral(&config.ephemeral_dir());

    let clock = system_clock();
    let store = Arc::new(StateDb::open_at(&config.state_db_path())?);
    let audit = Arc::new(AuditLog::open_at(&config.audit_db_path())?);
    let retention = Arc::new(RetentionEnforcer::new(
        clock.clone(),
        config.raw_media_ttl_secs,
    ));

    let gateway: Option<Arc<InferenceGateway>> = if config.gateway.enabled() {
        Some(Arc::new(
            InferenceGateway::new(config.gateway.clone())
                .map_err(|e| PipelineError::ExternalFailure(e.to_string()))?,
        ))
    } else {
        log::warn!("inference gateway not configured; running rules-only");
        None
    };

    let telegram = TelegramChannel::patient(&config.telegram).map(Arc::new);
    let doctor = TelegramChannel::doctor(&config.telegram).map(Arc::new);
    if telegram.is_none() {
        log::warn!("telegram not configured; alert delivery will record failures");
    }

    let tts: Option<Arc<dyn DeliveryChannel>> = match (&gateway, TelegramChannel::patient(&config.telegram)) {
        (Some(gw), Some(tg)) => Some(Arc::new(SpokenAlertChannel::new(gw.clone(), tg))),
        _ => None,
    };

    let channels = ChannelSet {
        telegram: telegram.map(|c| c as Arc<dyn DeliveryChannel>),
        tts,
        doctor: doctor.map(|c| c as Arc<dyn DeliveryChannel>),
    };

    let dispatcher = Dispatcher::new(
        store.clone(),
        audit.clone(),
        clock.clone(),
        channels,
        config.dedup_cooldown_secs,
    );

    let analyzer = gateway.clone().map(|g| g as Arc<dyn MediaAnalyzer>);
    let reasoner = gateway.map(|g| g as Arc<dyn ClinicalReasoner>);

    let cycle_interval = config.cycle_interval_secs;
    let agent = Arc::new(Agent::new(
        config, store, audit, retention, dispatcher, analyzer, reasoner, clock,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(agent.clone(), cycle_interval, shutdown_rx);
    let scheduler_handle = tokio::spawn(scheduler.run());

    log::info!(
        "healthguard running: {} patient(s) monitored, cycle every {}s",
        agent.get_status()?.patients_monitored,
        cycle_interval
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| PipelineError::ExternalFailure(format!("signal handler: {e}")))?;
    log::info!("shutdown requested, finishing in-flight evaluation");

    let _ = shutdown_tx.send(true);
    let _ = scheduler_handle.await;

    Ok(())
}
