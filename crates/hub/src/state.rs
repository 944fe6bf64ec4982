//! Shared in-memory system state backing the operational API: a capped
//! event ring plus the last dispatch outcome per actuator.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::actuator::Command;
use crate::fsm::JobOutcome;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Decision,
    Dispatch,
    Error,
    System,
}

/// Last dispatch outcome seen for an actuator.
#[derive(Clone, Serialize)]
pub struct DispatchRecord {
    pub ts: DateTime<Utc>,
    pub command: String,
    pub outcome: String,
}

struct Inner {
    dispatches: HashMap<String, DispatchRecord>,
    events: VecDeque<SystemEvent>,
}

pub struct SystemState {
    started_at: Instant,
    inner: RwLock<Inner>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            inner: RwLock::new(Inner {
                dispatches: HashMap::new(),
                events: VecDeque::with_capacity(MAX_EVENTS),
            }),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Record a decision cycle summary.
    pub async fn record_decisions(&self, detail: String) {
        self.push_event(EventKind::Decision, detail).await;
    }

    /// Record a dispatch outcome for an actuator.
    pub async fn record_dispatch(&self, actuator: &str, cmd: &Command, outcome: &JobOutcome) {
        let outcome_str = match outcome {
            JobOutcome::Started(opid) => format!("started opid={opid}"),
            JobOutcome::Skipped => "skipped (no-op)".to_string(),
            JobOutcome::Busy { state, .. } => format!("busy ({state:?})"),
        };
        let mut inner = self.inner.write().await;
        inner.dispatches.insert(
            actuator.to_string(),
            DispatchRecord {
                ts: Utc::now(),
                command: cmd.code.to_string(),
                outcome: outcome_str.clone(),
            },
        );
        push(&mut inner.events, EventKind::Dispatch, format!("{actuator} {} -> {outcome_str}", cmd.code));
    }

    /// Record an error event.
    pub async fn record_error(&self, detail: String) {
        self.push_event(EventKind::Error, detail).await;
    }

    /// Record a generic system event.
    pub async fn record_system(&self, detail: String) {
        self.push_event(EventKind::System, detail).await;
    }

    /// Newest-first copy of the event ring.
    pub async fn recent_events(&self) -> Vec<SystemEvent> {
        self.inner.read().await.events.iter().rev().cloned().collect()
    }

    pub async fn dispatches(&self) -> HashMap<String, DispatchRecord> {
        self.inner.read().await.dispatches.clone()
    }

    async fn push_event(&self, kind: EventKind, detail: String) {
        let mut inner = self.inner.write().await;
        push(&mut inner.events, kind, detail);
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

fn push(events: &mut VecDeque<SystemEvent>, kind: EventKind, detail: String) {
    if events.len() >= MAX_EVENTS {
        events.pop_front();
    }
    events.push_back(SystemEvent {
        ts: Utc::now(),
        kind,
        detail,
    });
}

// ===========================================================================
// Tests
// ===========================================================================
