//! Rule decision engine: evaluates a prioritized rule set against a sensor
//! snapshot and produces at most one decision per actuator.
//!
//! Two greenhouse refinements sit on top of plain rule matching: wind
//! direction is stabilized through deadband hysteresis before evaluation,
//! and paired roof windows get cooldown gating plus windward/leeward
//! arbitration (the leeward side opens first, the windward side waits for
//! the next cycle).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::actuator::CmdCode;
use crate::scheduler::{ActionParam, Plan, PlanItem};

/// Flat map of named numeric sensor variables, one per cycle.
pub type Snapshot = HashMap<String, f64>;

/// Source of sensor snapshots. Production wires a gateway client here;
/// development and tests use `crate::sim::SimSensors`.
#[async_trait]
pub trait SensorProvider: Send + Sync {
    async fn snapshot(&self) -> anyhow::Result<Snapshot>;
}

// ---------------------------------------------------------------------------
// Rule model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    EqualTo,
    NotEqualTo,
    LessThan,
    LessThanOrEqualTo,
    GreaterThan,
    GreaterThanOrEqualTo,
}

impl Operator {
    fn eval(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Self::EqualTo => lhs == rhs,
            Self::NotEqualTo => lhs != rhs,
            Self::LessThan => lhs < rhs,
            Self::LessThanOrEqualTo => lhs <= rhs,
            Self::GreaterThan => lhs > rhs,
            Self::GreaterThanOrEqualTo => lhs >= rhs,
        }
    }
}

/// AND/OR tree of comparisons over named snapshot variables.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Condition {
    All { all: Vec<Condition> },
    Any { any: Vec<Condition> },
    Cmp { name: String, operator: Operator, value: f64 },
}

impl Condition {
    /// Missing variables read as 0.0, so a rule over an absent sensor
    /// evaluates rather than aborting the cycle.
    pub fn eval(&self, snap: &Snapshot) -> bool {
        match self {
            Self::All { all } => all.iter().all(|c| c.eval(snap)),
            Self::Any { any } => any.iter().any(|c| c.eval(snap)),
            Self::Cmp { name, operator, value } => {
                let lhs = snap.get(name).copied().unwrap_or(0.0);
                operator.eval(lhs, *value)
            }
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ActionParams {
    pub actuator: Option<String>,
    pub state: Option<String>,
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

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleAction {
    /// `switch_action`, `vent_action` or `nutsupply`.
    pub name: String,
    #[serde(default)]
    pub params: ActionParams,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Rule {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    pub conditions: Condition,
    pub actions: Vec<RuleAction>,
}

/// Load rules from a JSON file (array of rules) or a directory of `*.json`
/// files, concatenated in name order. Unreadable files in a directory are
/// skipped with a warning.
pub fn load_rules(path: &Path) -> anyhow::Result<Vec<Rule>> {
    fn load_file(path: &Path) -> anyhow::Result<Vec<Rule>> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading rule file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing rule file {}", path.display()))
    }

    if path.is_dir() {
        let mut entries: Vec<_> = std::fs::read_dir(path)
            .with_context(|| format!("reading rule directory {}", path.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect();
        entries.sort();

        let mut rules = Vec::new();
        for file in entries {
            match load_file(&file) {
                Ok(mut batch) => rules.append(&mut batch),
                Err(e) => warn!(file = %file.display(), error = %e, "skipping rule file"),
            }
        }
        Ok(rules)
    } else {
        load_file(path)
    }
}

// ---------------------------------------------------------------------------
// Wind stabilization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sector {
    Low,
    High,
}

impl Sector {
    fn of(deg: f64) -> Self {
        if (0.0..180.0).contains(&deg) {
            Self::Low
        } else {
            Self::High
        }
    }

    fn midpoint(self) -> f64 {
        match self {
            Self::Low => 90.0,
            Self::High => 270.0,
        }
    }
}

/// Deadband hysteresis for the wind direction. Readings inside a deadband
/// that stay in the remembered sector clamp to that sector's midpoint; a
/// reading in the opposite sector is a real crossing and passes through.
struct WindStabilizer {
    deadbands: Vec<(f64, f64)>,
    last_sector: Option<Sector>,
}

impl WindStabilizer {
    fn new(deadbands: Vec<(f64, f64)>) -> Self {
        Self { deadbands, last_sector: None }
    }

    fn in_deadband(&self, deg: f64) -> bool {
        self.deadbands.iter().any(|&(lo, hi)| (lo..=hi).contains(&deg))
    }

    fn stabilize(&mut self, raw: f64) -> f64 {
        let sector = Sector::of(raw);
        let last = match self.last_sector {
            None => {
                self.last_sector = Some(sector);
                return raw;
            }
            Some(last) => last,
        };
        if self.in_deadband(raw) && sector == last {
            return last.midpoint();
        }
        self.last_sector = Some(sector);
        raw
    }
}

// ---------------------------------------------------------------------------
// Decision engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Paired roof window actuator names.
    pub window_left: String,
    pub window_right: String,
    /// Actuator name the `nutsupply` action targets.
    pub doser: String,
    /// Angular deadband ranges, inclusive.
    pub deadbands: Vec<(f64, f64)>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_left: "SKY_WINDOW_LEFT".to_string(),
            window_right: "SKY_WINDOW_RIGHT".to_string(),
            doser: "NUTRIENT_PUMP".to_string(),
            deadbands: vec![(315.0, 360.0), (0.0, 45.0), (135.0, 225.0)],
        }
    }
}

/// One actuator's winning intent for the cycle.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub rule_name: String,
    pub priority: i32,
    pub action_name: String,
    pub param: ActionParam,
    /// Surfaced for visibility but not executable this cycle.
    pub blocked_by_cooldown: bool,
}

struct Candidate {
    priority: i32,
    order: usize,
    rule_name: String,
    action_name: String,
    param: ActionParam,
}

pub struct RuleEngine {
    cfg: EngineConfig,
    wind: WindStabilizer,
    /// Cooldown bookkeeping for the window pair only.
    last_fired: HashMap<String, Instant>,
}

impl RuleEngine {
    pub fn new(cfg: EngineConfig) -> Self {
        let wind = WindStabilizer::new(cfg.deadbands.clone());
        Self { cfg, wind, last_fired: HashMap::new() }
    }

    fn is_window(&self, actuator: &str) -> bool {
        actuator == self.cfg.window_left || actuator == self.cfg.window_right
    }

    /// Windward side for the window pair: the right window faces the wind
    /// for directions in `[0, 180)`, the left window for `[180, 360)`.
    fn is_windward(&self, actuator: &str, wdir: f64) -> bool {
        if actuator == self.cfg.window_right {
            (0.0..180.0).contains(&wdir)
        } else if actuator == self.cfg.window_left {
            !(0.0..180.0).contains(&wdir)
        } else {
            false
        }
    }

    fn cooldown_ok(&self, actuator: &str, pause_sec: u32) -> bool {
        match self.last_fired.get(actuator) {
            Some(fired) => fired.elapsed() >= Duration::from_secs(u64::from(pause_sec)),
            None => true,
        }
    }

    fn intent(&self, action: &RuleAction) -> Option<(String, ActionParam)> {
        let p = &action.params;
        let state = match &p.state {
            Some(s) => s.trim().to_ascii_uppercase(),
            None => {
                warn!(action = %action.name, "action without a state, ignored");
                return None;
            }
        };
        let actuator = if action.name == "nutsupply" {
            self.cfg.doser.clone()
        } else {
            match &p.actuator {
                Some(a) => a.trim().to_ascii_uppercase(),
                None => {
                    warn!(action = %action.name, "action without an actuator, ignored");
                    return None;
                }
            }
        };
        Some((
            actuator,
            ActionParam {
                state,
                duration_sec: p.duration_sec,
                pause_sec: p.pause_sec,
                temp_diff: p.temp_diff,
                ec: p.ec,
                ph: p.ph,
            },
        ))
    }

    /// Evaluate the rule set against a snapshot. At most one decision per
    /// actuator; window decisions may come back flagged as cooldown-blocked.
    pub fn decide(&mut self, snapshot: &Snapshot, rules: &[Rule]) -> BTreeMap<String, Decision> {
        // Stabilization applies to an evaluation copy only.
        let mut sv = snapshot.clone();
        if let Some(raw) = sv.get("wind_direction").copied() {
            sv.insert("wind_direction".to_string(), self.wind.stabilize(raw));
        }

        let mut grouped: HashMap<String, Vec<Candidate>> = HashMap::new();
        for (order, rule) in rules.iter().enumerate() {
            if !rule.conditions.eval(&sv) {
                continue;
            }
            // Multi-action rules fan out one intent per action.
            for action in &rule.actions {
                if let Some((actuator, param)) = self.intent(action) {
                    grouped.entry(actuator).or_default().push(Candidate {
                        priority: rule.priority,
                        order,
                        rule_name: rule.name.clone(),
                        action_name: action.name.clone(),
                        param,
                    });
                }
            }
        }

        let mut decisions = BTreeMap::new();
        let mut window_picks: HashMap<String, Decision> = HashMap::new();

        for (actuator, mut cands) in grouped {
            cands.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.order.cmp(&b.order)));

            if !self.is_window(&actuator) {
                let top = &cands[0];
                decisions.insert(
                    actuator,
                    Decision {
                        rule_name: top.rule_name.clone(),
                        priority: top.priority,
                        action_name: top.action_name.clone(),
                        param: top.param.clone(),
                        blocked_by_cooldown: false,
                    },
                );
                continue;
            }

            match cands.iter().find(|c| self.cooldown_ok(&actuator, c.param.pause_sec)) {
                Some(pick) => {
                    window_picks.insert(
                        actuator,
                        Decision {
                            rule_name: pick.rule_name.clone(),
                            priority: pick.priority,
                            action_name: pick.action_name.clone(),
                            param: pick.param.clone(),
                            blocked_by_cooldown: false,
                        },
                    );
                }
                None => {
                    // Cooldown holds: surface the head for visibility only.
                    let top = &cands[0];
                    debug!(actuator = %actuator, rule = %top.rule_name, "window decision blocked by cooldown");
                    decisions.insert(
                        actuator,
                        Decision {
                            rule_name: top.rule_name.clone(),
                            priority: top.priority,
                            action_name: top.action_name.clone(),
                            param: top.param.clone(),
                            blocked_by_cooldown: true,
                        },
                    );
                }
            }
        }

        if !window_picks.is_empty() {
            let wdir = sv.get("wind_direction").copied().unwrap_or(0.0);
            let both_open = {
                let open = |name: &str| {
                    window_picks
                        .get(name)
                        .is_some_and(|d| is_open_state(&d.param.state))
                };
                open(&self.cfg.window_left) && open(&self.cfg.window_right)
            };
            if both_open {
                // Leeward first: suppress the windward side this cycle.
                let drop = if self.is_windward(&self.cfg.window_left, wdir) {
                    self.cfg.window_left.clone()
                } else {
                    self.cfg.window_right.clone()
                };
                debug!(window = %drop, wind_direction = wdir, "windward window suppressed");
                window_picks.remove(&drop);
            }
            for (actuator, decision) in window_picks {
                // Only surviving executable window decisions re-arm cooldowns.
                self.last_fired.insert(actuator.clone(), Instant::now());
                decisions.insert(actuator, decision);
            }
        }

        decisions
    }
}

fn is_open_state(state: &str) -> bool {
    state
        .parse::<CmdCode>()
        .map(CmdCode::is_open_class)
        .unwrap_or(false)
}

/// Wrap executable decisions into a scheduler plan, validating each action
/// at the boundary. Unexecutable or invalid decisions are dropped.
pub fn compile_plan(decisions: &BTreeMap<String, Decision>) -> Plan {
    let mut plan = Plan::new();
    for (actuator, decision) in decisions {
        if decision.blocked_by_cooldown {
            continue;
        }
        let item = PlanItem {
            action_name: decision.action_name.clone(),
            param: decision.param.clone(),
        };
        if let Err(e) = item.param.to_command() {
            warn!(actuator = %actuator, error = %e, "decision dropped at plan boundary");
            continue;
        }
        plan.insert(actuator.clone(), item);
    }
    plan
}

// ===========================================================================
// Tests
// ===========================================================================
