//! Thin operational API: liveness probe, pending jobs, and a status
//! snapshot combining FSM state with recent events.

use std::collections::BTreeMap;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

use crate::fsm::{FsmRegistry, FsmSnapshot};
use crate::scheduler::PlanScheduler;
use crate::state::{DispatchRecord, SystemEvent, SystemState};

#[derive(Clone)]
pub struct AppState {
    pub state: Arc<SystemState>,
    pub registry: Arc<FsmRegistry>,
    pub scheduler: Arc<PlanScheduler>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/jobs", get(api_jobs))
        .route("/api/status", get(api_status))
        .with_state(app)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn api_jobs(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.scheduler.jobs().await)
}

#[derive(Serialize)]
struct DeviceStatus {
    #[serde(flatten)]
    fsm: FsmSnapshot,
    last_dispatch: Option<DispatchRecord>,
}

#[derive(Serialize)]
struct StatusResponse {
    uptime_secs: u64,
    devices: BTreeMap<String, DeviceStatus>,
    events: Vec<SystemEvent>,
}

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let mut dispatches = app.state.dispatches().await;
    let devices = app
        .registry
        .snapshots()
        .await
        .into_iter()
        .map(|(name, fsm)| {
            let last_dispatch = dispatches.remove(&name);
            (name, DeviceStatus { fsm, last_dispatch })
        })
        .collect();

    Json(StatusResponse {
        uptime_secs: app.state.uptime_secs(),
        devices,
        events: app.state.recent_events().await,
    })
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(app: AppState) {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await.expect("failed to bind web port");

    info!(%addr, "operational api listening");

    axum::serve(listener, router(app))
        .await
        .expect("web server error");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{Actuator, CmdCode, Command, DeviceKind, RegisterMap};
    use crate::fsm::{FsmConfig, JobOutcome};
    use crate::scheduler::{FsmDispatch, SchedulerConfig};
    use crate::sim::SimBus;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::util::ServiceExt;

    fn test_app() -> AppState {
        let bus = Arc::new(SimBus::new());
        let reg_map = RegisterMap { device_id: 1, cmd_addr: 500, state_addr: 200, state_count: 4 };
        bus.add_device(DeviceKind::Switch, &reg_map);
        let act = Actuator::new(
            "CO2".into(),
            DeviceKind::Switch,
            reg_map,
            bus as Arc<dyn crate::transport::RegisterBus>,
        );
        let registry = Arc::new(FsmRegistry::new(
            vec![act],
            FsmConfig {
                poll_interval: Duration::from_millis(10),
                timeout: Duration::from_secs(5),
            },
        ));
        let state = Arc::new(SystemState::new());
        let sink = Arc::new(FsmDispatch::new(registry.clone(), state.clone()));
        let scheduler = Arc::new(PlanScheduler::new(SchedulerConfig::default(), sink));
        AppState { state, registry, scheduler }
    }

    async fn get_json(app: AppState, uri: &str) -> serde_json::Value {
        let response = router(app)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let body = get_json(test_app(), "/health").await;
        assert_eq!(body, json!({ "ok": true }));
    }

    #[tokio::test]
    async fn jobs_list_starts_empty() {
        let body = get_json(test_app(), "/api/jobs").await;
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn status_exposes_devices_and_events() {
        let app = test_app();
        app.state.record_system("hub started".into()).await;
        app.state
            .record_dispatch("CO2", &Command::new(CmdCode::On), &JobOutcome::Started(1))
            .await;

        let body = get_json(app, "/api/status").await;
        assert_eq!(body["devices"]["CO2"]["state"], "READY");
        assert_eq!(body["devices"]["CO2"]["last_dispatch"]["command"], "ON");
        let events = body["events"].as_array().unwrap();
        assert!(events.iter().any(|e| e["detail"] == "hub started"));
    }
}
