mod actuator;
mod codec;
mod config;
mod error;
mod fsm;
mod rules;
mod scheduler;
mod sim;
mod state;
mod transport;
mod web;

use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use actuator::Actuator;
use fsm::FsmRegistry;
use rules::{compile_plan, Rule, RuleEngine, SensorProvider};
use scheduler::{FsmDispatch, PlanScheduler};
use state::SystemState;
use transport::RegisterBus;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config + rules ──────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    let rules = rules::load_rules(Path::new(&cfg.engine.rules_path))
        .with_context(|| format!("loading rules from {}", cfg.engine.rules_path))?;
    info!(
        devices = cfg.devices.len(),
        rules = rules.len(),
        tick_sec = cfg.engine.tick_sec,
        "config loaded"
    );
    if cfg.devices.is_empty() {
        warn!("no devices configured, nothing will be dispatched");
    }

    // ── Register bus ────────────────────────────────────────────────
    #[cfg(feature = "modbus")]
    let bus: Arc<dyn RegisterBus> = {
        let addr = env::var("MODBUS_ADDR").unwrap_or_else(|_| "127.0.0.1:502".to_string());
        let addr = addr.parse().with_context(|| format!("bad MODBUS_ADDR: {addr}"))?;
        info!(%addr, "connecting modbus tcp");
        Arc::new(transport::ModbusBus::connect(addr).await?)
    };
    #[cfg(not(feature = "modbus"))]
    let bus: Arc<dyn RegisterBus> = {
        info!("running against the simulated register bus");
        let sim = Arc::new(sim::SimBus::new());
        for d in &cfg.devices {
            sim.add_device(d.kind, &d.register_map());
        }
        sim
    };

    // ── Devices, scheduler, web ─────────────────────────────────────
    let actuators: Vec<Actuator> = cfg
        .devices
        .iter()
        .map(|d| Actuator::new(d.name.clone(), d.kind, d.register_map(), Arc::clone(&bus)))
        .collect();
    let registry = Arc::new(FsmRegistry::new(actuators, cfg.fsm_config()));
    let shared = Arc::new(SystemState::new());
    let sink = Arc::new(FsmDispatch::new(Arc::clone(&registry), Arc::clone(&shared)));
    let scheduler = Arc::new(PlanScheduler::new(cfg.scheduler_config(), sink));

    let app = web::AppState {
        state: Arc::clone(&shared),
        registry: Arc::clone(&registry),
        scheduler: Arc::clone(&scheduler),
    };
    tokio::spawn(async move {
        web::serve(app).await;
    });

    let sensors: Arc<dyn SensorProvider> = Arc::new(sim::SimSensors::new());
    let mut engine = RuleEngine::new(cfg.engine_config());
    shared.record_system("hub started".to_string()).await;

    // ── Control loop ────────────────────────────────────────────────
    // One serialized tick at a time; an overrunning cycle delays the next
    // tick instead of overlapping it.
    let mut ticker = tokio::time::interval(Duration::from_secs(cfg.engine.tick_sec));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if let Err(e) = run_cycle(&sensors, &mut engine, &rules, &scheduler, &shared).await {
            warn!(error = %format!("{e:#}"), "control cycle failed");
            shared.record_error(format!("cycle: {e:#}")).await;
        }
    }
}

/// One control cycle: snapshot, decide, compile, submit.
async fn run_cycle(
    sensors: &Arc<dyn SensorProvider>,
    engine: &mut RuleEngine,
    rules: &[Rule],
    scheduler: &Arc<PlanScheduler>,
    shared: &Arc<SystemState>,
) -> Result<()> {
    let snapshot = sensors.snapshot().await.context("sensor snapshot")?;
    let decisions = engine.decide(&snapshot, rules);
    if decisions.is_empty() {
        return Ok(());
    }

    let summary = decisions
        .iter()
        .map(|(actuator, d)| {
            if d.blocked_by_cooldown {
                format!("{actuator}={} (cooldown)", d.param.state)
            } else {
                format!("{actuator}={}", d.param.state)
            }
        })
        .collect::<Vec<_>>()
        .join(", ");
    info!(%summary, "decisions");
    shared.record_decisions(summary).await;

    let plan = compile_plan(&decisions);
    if !plan.is_empty() {
        let registered = scheduler.submit_plan(&plan, None).await;
        info!(registered, "plan submitted");
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
