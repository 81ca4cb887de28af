use anyhow::{bail, Context, Result};
use facegate_source::{DescriptorSource, JudgeConfig, JudgeSource, LocalConfig, LocalSource};
use facegate_store::{Seal, Store};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod admission;
mod auth;
mod config;
mod dbus_interface;
mod gate;
mod registration;

use admission::AdmissionController;
use auth::SessionBook;
use config::{Backend, Config};
use dbus_interface::GateService;
use gate::GateVerifier;
use registration::Registrar;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facegated starting");

    let cfg = Config::load()?;
    let policy = cfg.policy.match_policy()?;

    let seal = match (&cfg.store.key_hex, &cfg.store.key_passphrase) {
        (Some(hex), _) => Seal::from_hex(hex).context("store.key_hex")?,
        (None, Some(passphrase)) => Seal::from_passphrase(passphrase),
        (None, None) => bail!("no sealing key configured"),
    };

    if let Some(parent) = cfg.store.db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create data directory {}", parent.display()))?;
    }
    let store = Store::open(&cfg.store.db_path, seal).await?;
    tracing::info!(db = %cfg.store.db_path.display(), "repository opened");

    // Attendance watcher: each notification is a full snapshot, so the
    // log line always reflects current totals, not a delta.
    let mut events_rx = store.subscribe_events();
    tokio::spawn(async move {
        while events_rx.changed().await.is_ok() {
            let snapshot = events_rx.borrow_and_update().clone();
            for event in &snapshot {
                tracing::debug!(
                    event_id = %event.id,
                    attendees = event.current_attendees,
                    capacity = event.max_capacity,
                    "event snapshot"
                );
            }
        }
    });

    let timeout = Duration::from_secs(cfg.source.timeout_secs);
    let source: Arc<dyn DescriptorSource> = match cfg.source.backend {
        Backend::Local => {
            let local = LocalSource::spawn(LocalConfig {
                detect_model: cfg.source.detect_model_path(),
                embed_model: cfg.source.embed_model_path(),
                policy,
                min_enroll_confidence: cfg.policy.min_enroll_confidence,
            })?;
            tracing::info!("local embedding backend ready");
            Arc::new(local)
        }
        Backend::Judge => {
            if cfg.source.judge_api_key.is_empty() {
                bail!("judge backend selected but source.judge_api_key is empty");
            }
            let judge = JudgeSource::new(JudgeConfig {
                endpoint: cfg.source.judge_endpoint.clone(),
                api_key: cfg.source.judge_api_key.clone(),
                model: cfg.source.judge_model.clone(),
                timeout,
            })?;
            tracing::info!(endpoint = %cfg.source.judge_endpoint, "remote judge backend ready");
            Arc::new(judge)
        }
    };

    if cfg.operators.is_empty() {
        tracing::warn!("no operator accounts configured; privileged calls will be rejected");
    }
    let sessions = Arc::new(SessionBook::new(
        cfg.operators.clone(),
        chrono::Duration::hours(cfg.session.ttl_hours),
    ));

    let admission = AdmissionController::new(store.clone(), cfg.policy.enforce_capacity);
    tracing::info!(
        strict_capacity = cfg.policy.enforce_capacity,
        "admission controller ready"
    );

    let service = GateService {
        sessions,
        registrar: Registrar::new(store.clone(), source.clone(), admission.clone()),
        verifier: GateVerifier::new(store.clone(), source.clone(), timeout),
        admission,
        store,
        backend_method: source.method().to_string(),
    };

    let _conn = zbus::connection::Builder::session()?
        .name("org.facegate.Gate1")?
        .serve_at("/org/facegate/Gate1", service)?
        .build()
        .await
        .context("register D-Bus service")?;

    tracing::info!("facegated ready on org.facegate.Gate1");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facegated shutting down");

    Ok(())
}
