//! Plan scheduler: takes the decision engine's plan, suppresses repeats and
//! bursts, and drives the dispatch sink through a job table.
//!
//! Dedup works on a stable signature of the requested action. A repeated
//! identical command for an actuator inside its `pause + duration` window is
//! dropped; an optional global debounce drops whole submissions when the
//! decision engine flaps. Jobs are keyed `"{actuator}:apply"` and replaced
//! on conflict, so at most one job is pending per actuator at a time.

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::actuator::{CmdCode, Command};
use crate::error::{ControlError, Result};

// ---------------------------------------------------------------------------
// Plan model
// ---------------------------------------------------------------------------

/// Parameters of one desired action, typed at the engine/scheduler boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionParam {
    /// Desired device state, one of the wire command names (`ON`, `OPEN`, …).
    pub state: String,
    #[serde(default)]
    pub duration_sec: u32,
    #[serde(default)]
    pub pause_sec: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_diff: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ec: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ph: Option<f32>,
}

impl ActionParam {
    /// Validate and convert to a device command.
    pub fn to_command(&self) -> Result<Command> {
        let code: CmdCode = self.state.parse()?;
        Ok(Command {
            code,
            duration_sec: self.duration_sec,
            ec: self.ec,
            ph: self.ph,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanItem {
    pub action_name: String,
    pub param: ActionParam,
}

impl PlanItem {
    /// Debounce window: repeats of the same action inside it are dropped.
    pub fn window(&self) -> Duration {
        Duration::from_secs(u64::from(self.param.pause_sec) + u64::from(self.param.duration_sec))
    }
}

/// One cycle's output: desired action per actuator.
pub type Plan = BTreeMap<String, PlanItem>;

fn signature(item: &PlanItem) -> u64 {
    let mut h = std::collections::hash_map::DefaultHasher::new();
    item.action_name.hash(&mut h);
    item.param.state.hash(&mut h);
    item.param.duration_sec.hash(&mut h);
    item.param.pause_sec.hash(&mut h);
    item.param.temp_diff.map(f64::to_bits).hash(&mut h);
    item.param.ec.map(f32::to_bits).hash(&mut h);
    item.param.ph.map(f32::to_bits).hash(&mut h);
    h.finish()
}

// ---------------------------------------------------------------------------
// Dispatch sink
// ---------------------------------------------------------------------------

/// Where accepted jobs land when they fire. The production sink routes to
/// the device FSMs; tests install a recorder.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, actuator: &str, item: &PlanItem);
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct SchedulerConfig {
    /// Minimum spacing between accepted submissions. None disables.
    pub global_debounce: Option<Duration>,
    /// When set, an accepted `FCU_PUMP` OFF also turns `FCU_FAN` off after
    /// this delay (the fan keeps circulating while the coil drains).
    pub fan_off_delay: Option<Duration>,
}

/// Visible job-table entry for the operational API.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub job_id: String,
    pub next_run_time: DateTime<Utc>,
}

struct JobEntry {
    next_run: DateTime<Utc>,
    /// Set by whoever wins the job: the task when it wakes to dispatch, or
    /// a replacement when it cancels a still-sleeping task.
    fired: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

struct SchedInner {
    last_signature: HashMap<String, u64>,
    debounce_until: HashMap<String, Instant>,
    global_until: Option<Instant>,
    jobs: HashMap<String, JobEntry>,
}

pub struct PlanScheduler {
    cfg: SchedulerConfig,
    sink: Arc<dyn Dispatch>,
    inner: Mutex<SchedInner>,
}

impl PlanScheduler {
    pub fn new(cfg: SchedulerConfig, sink: Arc<dyn Dispatch>) -> Self {
        Self {
            cfg,
            sink,
            inner: Mutex::new(SchedInner {
                last_signature: HashMap::new(),
                debounce_until: HashMap::new(),
                global_until: None,
                jobs: HashMap::new(),
            }),
        }
    }

    /// Accept a plan for dispatch at `run_at` (None = now). Returns the
    /// number of jobs registered.
    ///
    /// Immediate resubmissions of an unchanged action inside the actuator's
    /// debounce window are dropped; submissions with an explicit `run_at`
    /// skip that check but still update the window. The whole call is
    /// dropped while the global debounce holds.
    pub async fn submit_plan(self: &Arc<Self>, plan: &Plan, run_at: Option<DateTime<Utc>>) -> usize {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        if inner.global_until.is_some_and(|until| now < until) {
            debug!(actuators = plan.len(), "submission dropped by global debounce");
            return 0;
        }

        let delay = run_at
            .map(|ts| (ts - Utc::now()).to_std().unwrap_or_default())
            .unwrap_or_default();
        let fire_at = now + delay;
        let mut registered = 0;

        for (actuator, item) in plan {
            let sig = signature(item);
            let debounced = inner.debounce_until.get(actuator).is_some_and(|&u| now < u);
            if run_at.is_none() && debounced && inner.last_signature.get(actuator) == Some(&sig) {
                debug!(
                    actuator = %actuator,
                    state = %item.param.state,
                    "duplicate action inside debounce window, skipped"
                );
                continue;
            }

            let job_id = match run_at {
                None => format!("{actuator}:apply"),
                Some(ts) => format!("{actuator}:apply:{}", ts.timestamp()),
            };
            self.register_job(&mut inner, job_id, actuator.clone(), item.clone(), delay);
            registered += 1;

            inner.last_signature.insert(actuator.clone(), sig);
            let window = item.window();
            if !window.is_zero() {
                inner.debounce_until.insert(actuator.clone(), fire_at + window);
            }

            if actuator == "FCU_PUMP" && item.param.state.eq_ignore_ascii_case("OFF") {
                if let Some(fan_delay) = self.cfg.fan_off_delay {
                    let fan_item = PlanItem {
                        action_name: "switch_action".to_string(),
                        param: ActionParam {
                            state: "OFF".to_string(),
                            duration_sec: 0,
                            pause_sec: 0,
                            temp_diff: None,
                            ec: None,
                            ph: None,
                        },
                    };
                    info!(
                        delay_sec = fan_delay.as_secs(),
                        "FCU_PUMP off, scheduling coupled FCU_FAN off"
                    );
                    self.register_job(
                        &mut inner,
                        "FCU_FAN:apply".to_string(),
                        "FCU_FAN".to_string(),
                        fan_item,
                        delay + fan_delay,
                    );
                    registered += 1;
                }
            }
        }

        if registered > 0 {
            if let Some(gd) = self.cfg.global_debounce {
                inner.global_until = Some(now + gd);
            }
        }
        registered
    }

    /// Insert (or replace) a job. Replacement cancels a task that is still
    /// sleeping, so exactly the most recently accepted item fires under each
    /// id. A task that has already woken to dispatch is never cancelled: the
    /// command may be mid-flight on the bus, and a cancelled dispatch would
    /// leave the device running with no verification.
    fn register_job(
        self: &Arc<Self>,
        inner: &mut SchedInner,
        job_id: String,
        actuator: String,
        item: PlanItem,
        delay: Duration,
    ) {
        let scheduler = Arc::clone(self);
        let id = job_id.clone();
        let fired = Arc::new(AtomicBool::new(false));
        let claim = Arc::clone(&fired);
        let token = Arc::clone(&fired);
        let task = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            // Claim the job; losing means a replacement cancelled it while
            // it slept, so nothing must be dispatched.
            if claim
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            scheduler.sink.dispatch(&actuator, &item).await;
            let mut inner = scheduler.inner.lock().await;
            // Remove the table entry only if it is still ours; a replacement
            // registered during the dispatch stays pending.
            if let Some(entry) = inner.jobs.get(&id) {
                if Arc::ptr_eq(&entry.fired, &token) {
                    inner.jobs.remove(&id);
                }
            }
        });

        let entry = JobEntry {
            next_run: Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
            fired,
            task,
        };
        if let Some(old) = inner.jobs.insert(job_id.clone(), entry) {
            if old
                .fired
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                warn!(job_id = %job_id, "replacing pending job");
                old.task.abort();
            }
        }
    }

    /// Pending jobs, for the operational API.
    pub async fn jobs(&self) -> Vec<JobInfo> {
        let mut inner = self.inner.lock().await;
        inner.jobs.retain(|_, entry| !entry.task.is_finished());
        let mut out: Vec<JobInfo> = inner
            .jobs
            .iter()
            .map(|(id, entry)| JobInfo {
                job_id: id.clone(),
                next_run_time: entry.next_run,
            })
            .collect();
        out.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        out
    }
}

// ---------------------------------------------------------------------------
// FSM dispatch sink
// ---------------------------------------------------------------------------

/// Production sink: route each fired job to its device FSM and record the
/// outcome for the status API.
pub struct FsmDispatch {
    registry: Arc<crate::fsm::FsmRegistry>,
    state: Arc<crate::state::SystemState>,
}

impl FsmDispatch {
    pub fn new(
        registry: Arc<crate::fsm::FsmRegistry>,
        state: Arc<crate::state::SystemState>,
    ) -> Self {
        Self { registry, state }
    }
}

#[async_trait]
impl Dispatch for FsmDispatch {
    async fn dispatch(&self, actuator: &str, item: &PlanItem) {
        let fsm = match self.registry.get(actuator) {
            Some(fsm) => fsm,
            None => {
                warn!(actuator = %actuator, "dispatch for unknown actuator dropped");
                self.state
                    .record_error(format!("dispatch for unknown actuator {actuator}"))
                    .await;
                return;
            }
        };
        let cmd = match item.param.to_command() {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(actuator = %actuator, error = %e, "invalid plan item dropped");
                self.state.record_error(format!("{actuator}: {e}")).await;
                return;
            }
        };
        match fsm.start_job(&cmd).await {
            Ok(outcome) => {
                info!(actuator = %actuator, cmd = %cmd.code, ?outcome, "dispatched");
                self.state.record_dispatch(actuator, &cmd, &outcome).await;
            }
            Err(e @ ControlError::Transport(_)) => {
                warn!(actuator = %actuator, error = %e, "dispatch failed");
                self.state.record_error(format!("{actuator}: {e}")).await;
            }
            Err(e) => {
                warn!(actuator = %actuator, error = %e, "command rejected");
                self.state.record_error(format!("{actuator}: {e}")).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
