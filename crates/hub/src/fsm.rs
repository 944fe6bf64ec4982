//! Per-device finite state machine: READY → WORKING → READY, with ERROR as
//! a terminal state that only an explicit reset clears.
//!
//! `start_job` holds the device lock for the preflight + dispatch step only.
//! Verification runs as a detached task that polls the device until the
//! sent opid is reflected and the device leaves its working code, the
//! deadline passes, or the device reports a fault.
//!
//! ```text
//! READY ──start_job──▶ WORKING ──opid reflected, not working──▶ READY
//!   ▲                     │
//!   └──────reset()────── ERROR ◀── deadline exceeded / device fault
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::actuator::{Actuator, Command, StatCode, SKIP_OPID};
use crate::error::Result;

// ---------------------------------------------------------------------------
// Lifecycle types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FsmState {
    Ready,
    Working,
    Error,
}

/// What happened to a `start_job` call. Busy and Skipped are ordinary
/// outcomes; real failures (validation, transport) arrive as `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Command transmitted; verification is running for this opid.
    Started(i32),
    /// Command recognised as a no-op; nothing transmitted. See [`SKIP_OPID`].
    Skipped,
    /// Device not READY; nothing transmitted.
    Busy { state: FsmState, last_opid: Option<i32> },
}

impl JobOutcome {
    /// The opid a caller should report: the dispatched one, the skip
    /// sentinel, or the last known opid while busy.
    pub fn opid(&self) -> i32 {
        match self {
            Self::Started(opid) => *opid,
            Self::Skipped => SKIP_OPID,
            Self::Busy { last_opid, .. } => last_opid.unwrap_or(SKIP_OPID),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FsmConfig {
    /// Delay between verification polls.
    pub poll_interval: Duration,
    /// Budget for a dispatched command to be reflected as complete.
    pub timeout: Duration,
}

/// Point-in-time view of one FSM, for the operational API.
#[derive(Debug, Clone, Serialize)]
pub struct FsmSnapshot {
    pub state: FsmState,
    pub want_opid: Option<i32>,
    pub last_opid: Option<i32>,
    pub last_state_code: Option<StatCode>,
    pub last_open_pct: Option<u16>,
}

// ---------------------------------------------------------------------------
// FSM
// ---------------------------------------------------------------------------

struct FsmInner {
    state: FsmState,
    want_opid: Option<i32>,
    deadline: Option<Instant>,
    last_opid: Option<i32>,
    last_code: Option<StatCode>,
    last_open_pct: Option<u16>,
    verify_task: Option<JoinHandle<()>>,
}

impl FsmInner {
    fn finish(&mut self) {
        self.state = FsmState::Ready;
        self.want_opid = None;
        self.deadline = None;
    }

    fn fail(&mut self) {
        self.state = FsmState::Error;
        self.want_opid = None;
        self.deadline = None;
    }
}

pub struct DeviceFsm {
    actuator: Arc<Actuator>,
    cfg: FsmConfig,
    inner: Mutex<FsmInner>,
}

impl DeviceFsm {
    pub fn new(actuator: Actuator, cfg: FsmConfig) -> Self {
        Self {
            actuator: Arc::new(actuator),
            cfg,
            inner: Mutex::new(FsmInner {
                state: FsmState::Ready,
                want_opid: None,
                deadline: None,
                last_opid: None,
                last_code: None,
                last_open_pct: None,
                verify_task: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.actuator.name()
    }

    /// Dispatch a command if the device is READY.
    ///
    /// The lock covers the state check, the optional preflight read and the
    /// register write; the verification loop runs outside it.
    pub async fn start_job(self: &Arc<Self>, cmd: &Command) -> Result<JobOutcome> {
        let mut inner = self.inner.lock().await;

        if inner.state != FsmState::Ready {
            info!(
                actuator = %self.actuator.name(),
                state = ?inner.state,
                cmd = %cmd.code,
                "start_job rejected: not ready"
            );
            return Ok(JobOutcome::Busy {
                state: inner.state,
                last_opid: inner.last_opid,
            });
        }

        if self.actuator.wants_preflight() {
            let st = self.actuator.read_state().await?;
            inner.last_opid = Some(st.base().opid);
            inner.last_code = Some(st.base().code);
            inner.last_open_pct = st.open_pct();
            if self.actuator.is_noop(cmd, &st) {
                info!(
                    actuator = %self.actuator.name(),
                    cmd = %cmd.code,
                    open_pct = ?st.open_pct(),
                    "command is a no-op, skipping dispatch"
                );
                return Ok(JobOutcome::Skipped);
            }
        }

        let opid = self.actuator.send(cmd).await?;
        inner.state = FsmState::Working;
        inner.want_opid = Some(opid);
        inner.deadline = Some(Instant::now() + self.cfg.timeout);
        info!(
            actuator = %self.actuator.name(),
            cmd = %cmd.code,
            opid,
            timeout_sec = self.cfg.timeout.as_secs(),
            "job started"
        );

        self.ensure_verify_task(&mut inner);
        Ok(JobOutcome::Started(opid))
    }

    /// Clear a fault. Only valid in ERROR; callers are responsible for any
    /// out-of-band physical OFF the device may need first.
    pub async fn reset(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state != FsmState::Error {
            return false;
        }
        inner.finish();
        info!(actuator = %self.actuator.name(), "fsm reset to READY");
        true
    }

    pub async fn state(&self) -> FsmState {
        self.inner.lock().await.state
    }

    pub async fn snapshot(&self) -> FsmSnapshot {
        let inner = self.inner.lock().await;
        FsmSnapshot {
            state: inner.state,
            want_opid: inner.want_opid,
            last_opid: inner.last_opid,
            last_state_code: inner.last_code,
            last_open_pct: inner.last_open_pct,
        }
    }

    /// Exactly one verification task per device: respawn only when the
    /// previous one has exited. The loop clears its own handle under the
    /// device lock on every exit path, so a `start_job` racing a finishing
    /// verifier still sees the slot free and respawns.
    fn ensure_verify_task(self: &Arc<Self>, inner: &mut FsmInner) {
        let live = inner.verify_task.as_ref().is_some_and(|t| !t.is_finished());
        if !live {
            let fsm = Arc::clone(self);
            inner.verify_task = Some(tokio::spawn(async move { fsm.verify_loop().await }));
        }
    }

    async fn verify_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.cfg.poll_interval).await;

            {
                let mut inner = self.inner.lock().await;
                if inner.state != FsmState::Working {
                    inner.verify_task = None;
                    break;
                }
                if inner.deadline.is_some_and(|d| Instant::now() > d) {
                    warn!(
                        actuator = %self.actuator.name(),
                        want_opid = ?inner.want_opid,
                        "verification deadline exceeded"
                    );
                    inner.fail();
                    inner.verify_task = None;
                    break;
                }
            }

            // Poll outside the lock so start_job callers get their fast
            // busy answer even during a slow read.
            let st = match self.actuator.read_state().await {
                Ok(st) => st,
                Err(e) => {
                    // Transient read failures consume deadline budget but do
                    // not fail the job on their own.
                    warn!(actuator = %self.actuator.name(), error = %e, "poll failed, retrying");
                    continue;
                }
            };

            let mut inner = self.inner.lock().await;
            if inner.state != FsmState::Working {
                inner.verify_task = None;
                break;
            }
            inner.last_opid = Some(st.base().opid);
            inner.last_code = Some(st.base().code);
            if let Some(pct) = st.open_pct() {
                inner.last_open_pct = Some(pct);
            }

            if st.base().code == StatCode::Error {
                warn!(
                    actuator = %self.actuator.name(),
                    opid = st.base().opid,
                    "device reported ERROR"
                );
                inner.fail();
                inner.verify_task = None;
                break;
            }

            let reflected = inner.want_opid == Some(st.base().opid);
            if reflected && !st.base().code.is_working() {
                info!(
                    actuator = %self.actuator.name(),
                    opid = st.base().opid,
                    "job complete"
                );
                inner.finish();
                inner.verify_task = None;
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The fixed set of device FSMs, one per configured actuator.
pub struct FsmRegistry {
    devices: HashMap<String, Arc<DeviceFsm>>,
}

impl FsmRegistry {
    pub fn new(actuators: Vec<Actuator>, cfg: FsmConfig) -> Self {
        let devices = actuators
            .into_iter()
            .map(|a| {
                let fsm = Arc::new(DeviceFsm::new(a, cfg));
                (fsm.name().to_string(), fsm)
            })
            .collect();
        Self { devices }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<DeviceFsm>> {
        self.devices.get(name)
    }

    pub async fn snapshots(&self) -> BTreeMap<String, FsmSnapshot> {
        let mut out = BTreeMap::new();
        for (name, fsm) in &self.devices {
            out.insert(name.clone(), fsm.snapshot().await);
        }
        out
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{CmdCode, DeviceKind, RegisterMap};
    use crate::sim::SimBus;

    const POLL: Duration = Duration::from_millis(10);

    fn fast_cfg() -> FsmConfig {
        FsmConfig {
            poll_interval: POLL,
            timeout: Duration::from_secs(5),
        }
    }

    fn switch_reg() -> RegisterMap {
        RegisterMap { device_id: 1, cmd_addr: 500, state_addr: 200, state_count: 4 }
    }

    fn vent_reg() -> RegisterMap {
        RegisterMap { device_id: 4, cmd_addr: 567, state_addr: 267, state_count: 5 }
    }

    fn switch_fsm(bus: &Arc<SimBus>, cfg: FsmConfig) -> Arc<DeviceFsm> {
        bus.add_device(DeviceKind::Switch, &switch_reg());
        let act = Actuator::new(
            "CO2".into(),
            DeviceKind::Switch,
            switch_reg(),
            bus.clone() as Arc<dyn crate::transport::RegisterBus>,
        );
        Arc::new(DeviceFsm::new(act, cfg))
    }

    fn vent_fsm(bus: &Arc<SimBus>, cfg: FsmConfig) -> Arc<DeviceFsm> {
        bus.add_device(DeviceKind::Retractable, &vent_reg());
        let act = Actuator::new(
            "SKY_WINDOW_LEFT".into(),
            DeviceKind::Retractable,
            vent_reg(),
            bus.clone() as Arc<dyn crate::transport::RegisterBus>,
        );
        Arc::new(DeviceFsm::new(act, cfg))
    }

    async fn wait_for_state(fsm: &Arc<DeviceFsm>, want: FsmState, budget: Duration) {
        let deadline = Instant::now() + budget;
        loop {
            if fsm.state().await == want {
                return;
            }
            assert!(
                Instant::now() < deadline,
                "fsm never reached {want:?}, stuck at {:?}",
                fsm.state().await
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    // -- start / finish ------------------------------------------------------

    #[tokio::test]
    async fn start_job_transitions_to_working_then_ready() {
        let bus = Arc::new(SimBus::new());
        let fsm = switch_fsm(&bus, fast_cfg());

        let outcome = fsm.start_job(&Command::new(CmdCode::On)).await.unwrap();
        assert_eq!(outcome, JobOutcome::Started(1));
        assert_eq!(fsm.state().await, FsmState::Working);

        wait_for_state(&fsm, FsmState::Ready, Duration::from_secs(2)).await;

        let snap = fsm.snapshot().await;
        assert_eq!(snap.want_opid, None, "want_opid must clear on finish");
        assert_eq!(snap.last_opid, Some(1));
        assert_eq!(snap.last_state_code, Some(StatCode::Ready));
    }

    #[tokio::test]
    async fn second_start_while_working_is_busy_and_does_not_transmit() {
        let bus = Arc::new(SimBus::new());
        let fsm = switch_fsm(&bus, fast_cfg());
        bus.set_reads_per_op(1, 10_000); // keep it working

        let first = fsm.start_job(&Command::new(CmdCode::On)).await.unwrap();
        assert_eq!(first, JobOutcome::Started(1));

        let second = fsm.start_job(&Command::new(CmdCode::On)).await.unwrap();
        match second {
            JobOutcome::Busy { state, .. } => assert_eq!(state, FsmState::Working),
            other => panic!("expected busy, got {other:?}"),
        }

        // Had the second call transmitted, the device opid would be 2.
        let snap = fsm.snapshot().await;
        assert_eq!(snap.want_opid, Some(1));
    }

    #[tokio::test]
    async fn back_to_back_jobs_each_get_verified() {
        let bus = Arc::new(SimBus::new());
        let fsm = switch_fsm(&bus, fast_cfg());

        // Restart immediately after each completion so a new job regularly
        // lands while the previous verifier is winding down; every one must
        // still be supervised back to READY.
        for i in 0..10 {
            let outcome = fsm.start_job(&Command::new(CmdCode::On)).await.unwrap();
            assert!(matches!(outcome, JobOutcome::Started(_)), "job {i} not started");
            wait_for_state(&fsm, FsmState::Ready, Duration::from_secs(2)).await;
        }

        let snap = fsm.snapshot().await;
        assert_eq!(snap.last_opid, Some(10));
    }

    // -- failure paths -------------------------------------------------------

    #[tokio::test]
    async fn deadline_exceeded_lands_in_error() {
        let bus = Arc::new(SimBus::new());
        let fsm = switch_fsm(
            &bus,
            FsmConfig { poll_interval: POLL, timeout: Duration::from_millis(40) },
        );
        bus.set_reads_per_op(1, 10_000); // never completes

        fsm.start_job(&Command::new(CmdCode::On)).await.unwrap();
        wait_for_state(&fsm, FsmState::Error, Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn device_error_code_lands_in_error() {
        let bus = Arc::new(SimBus::new());
        let fsm = switch_fsm(&bus, fast_cfg());
        bus.set_reads_per_op(1, 10_000);

        fsm.start_job(&Command::new(CmdCode::On)).await.unwrap();
        bus.force_error(1);
        wait_for_state(&fsm, FsmState::Error, Duration::from_secs(2)).await;

        // ERROR is terminal: new jobs are rejected...
        let outcome = fsm.start_job(&Command::new(CmdCode::On)).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Busy { state: FsmState::Error, .. }));
    }

    #[tokio::test]
    async fn reset_clears_error_and_allows_new_jobs() {
        let bus = Arc::new(SimBus::new());
        let fsm = switch_fsm(
            &bus,
            FsmConfig { poll_interval: POLL, timeout: Duration::from_millis(40) },
        );
        bus.set_reads_per_op(1, 10_000);

        fsm.start_job(&Command::new(CmdCode::On)).await.unwrap();
        wait_for_state(&fsm, FsmState::Error, Duration::from_secs(2)).await;

        assert!(fsm.reset().await);
        assert_eq!(fsm.state().await, FsmState::Ready);

        bus.set_reads_per_op(1, 2);
        let outcome = fsm.start_job(&Command::new(CmdCode::On)).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Started(_)));
    }

    #[tokio::test]
    async fn reset_outside_error_is_rejected() {
        let bus = Arc::new(SimBus::new());
        let fsm = switch_fsm(&bus, fast_cfg());
        assert!(!fsm.reset().await, "reset must only apply in ERROR");
    }

    #[tokio::test]
    async fn transient_read_failures_keep_polling() {
        let bus = Arc::new(SimBus::new());
        let fsm = switch_fsm(&bus, fast_cfg());

        fsm.start_job(&Command::new(CmdCode::On)).await.unwrap();
        bus.set_offline(true);
        tokio::time::sleep(POLL * 4).await;
        assert_eq!(fsm.state().await, FsmState::Working, "outage must not fail the job");

        bus.set_offline(false);
        wait_for_state(&fsm, FsmState::Ready, Duration::from_secs(2)).await;
    }

    // -- validation / preflight ----------------------------------------------

    #[tokio::test]
    async fn invalid_command_propagates_and_leaves_fsm_ready() {
        let bus = Arc::new(SimBus::new());
        let fsm = switch_fsm(&bus, fast_cfg());

        let err = fsm.start_job(&Command::new(CmdCode::TimedOn)).await;
        assert!(err.is_err());
        assert_eq!(fsm.state().await, FsmState::Ready);
    }

    #[tokio::test]
    async fn fully_open_vent_skips_open_command() {
        let bus = Arc::new(SimBus::new());
        let fsm = vent_fsm(&bus, fast_cfg());
        bus.set_open_pct(4, 100);

        let outcome = fsm.start_job(&Command::new(CmdCode::Open)).await.unwrap();
        assert_eq!(outcome, JobOutcome::Skipped);
        assert_eq!(outcome.opid(), SKIP_OPID);
        assert_eq!(fsm.state().await, FsmState::Ready, "skip must not change state");
    }

    #[tokio::test]
    async fn partially_open_vent_dispatches_open() {
        let bus = Arc::new(SimBus::new());
        let fsm = vent_fsm(&bus, fast_cfg());
        bus.set_open_pct(4, 40);

        let outcome = fsm.start_job(&Command::new(CmdCode::Open)).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Started(_)));
        wait_for_state(&fsm, FsmState::Ready, Duration::from_secs(2)).await;

        let snap = fsm.snapshot().await;
        assert_eq!(snap.last_open_pct, Some(100));
    }

    // -- registry --------------------------------------------------------------

    #[tokio::test]
    async fn registry_lookup_and_snapshots() {
        let bus = Arc::new(SimBus::new());
        bus.add_device(DeviceKind::Switch, &switch_reg());
        let act = Actuator::new(
            "CO2".into(),
            DeviceKind::Switch,
            switch_reg(),
            bus.clone() as Arc<dyn crate::transport::RegisterBus>,
        );
        let registry = FsmRegistry::new(vec![act], fast_cfg());

        assert!(registry.get("CO2").is_some());
        assert!(registry.get("FOG").is_none());

        let snaps = registry.snapshots().await;
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps["CO2"].state, FsmState::Ready);
    }
}
