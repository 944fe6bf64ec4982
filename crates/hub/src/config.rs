//! TOML config file loading and validation: engine timing, FSM budgets,
//! the window pair, and the device register map table.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::actuator::{DeviceKind, RegisterMap};
use crate::fsm::FsmConfig;
use crate::rules::EngineConfig;
use crate::scheduler::SchedulerConfig;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    pub engine: EngineSection,
    #[serde(default)]
    pub fsm: FsmSection,
    #[serde(default)]
    pub windows: Option<WindowsSection>,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Deserialize)]
pub struct EngineSection {
    /// Control cycle period.
    #[serde(default = "default_tick_sec")]
    pub tick_sec: u64,
    /// Rule file or directory of rule files.
    pub rules_path: String,
    /// Minimum spacing between accepted plan submissions. Absent disables.
    pub global_debounce_sec: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct FsmSection {
    #[serde(default = "default_poll_sec")]
    pub poll_interval_sec: u64,
    #[serde(default = "default_timeout_sec")]
    pub timeout_sec: u64,
}

#[derive(Debug, Deserialize)]
pub struct WindowsSection {
    pub left: String,
    pub right: String,
    /// Inclusive angular ranges where the wind direction is held stable.
    #[serde(default = "default_deadband")]
    pub deadband: Vec<[f64; 2]>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SchedulerSection {
    /// Delay before the coupled FCU_FAN off after an FCU_PUMP off.
    /// Absent disables the coupling.
    pub fan_off_delay_sec: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceEntry {
    pub name: String,
    pub kind: DeviceKind,
    pub device_id: u8,
    pub cmd_addr: u16,
    pub state_addr: u16,
    pub state_count: u16,
}

fn default_tick_sec() -> u64 {
    60
}

fn default_poll_sec() -> u64 {
    2
}

fn default_timeout_sec() -> u64 {
    120
}

fn default_deadband() -> Vec<[f64; 2]> {
    vec![[315.0, 360.0], [0.0, 45.0], [135.0, 225.0]]
}

impl Default for FsmSection {
    fn default() -> Self {
        Self {
            poll_interval_sec: default_poll_sec(),
            timeout_sec: default_timeout_sec(),
        }
    }
}

impl DeviceEntry {
    pub fn register_map(&self) -> RegisterMap {
        RegisterMap {
            device_id: self.device_id,
            cmd_addr: self.cmd_addr,
            state_addr: self.state_addr,
            state_count: self.state_count,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_engine(&mut errors);
        self.validate_devices(&mut errors);
        self.validate_windows(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_engine(&self, errors: &mut Vec<String>) {
        if self.engine.tick_sec == 0 {
            errors.push("engine: tick_sec must be positive".to_string());
        }
        if self.engine.rules_path.trim().is_empty() {
            errors.push("engine: rules_path is empty".to_string());
        }
        if self.fsm.poll_interval_sec == 0 {
            errors.push("fsm: poll_interval_sec must be positive".to_string());
        }
        if self.fsm.timeout_sec == 0 {
            errors.push("fsm: timeout_sec must be positive".to_string());
        }
        if self.fsm.timeout_sec > 0 && self.fsm.timeout_sec < self.fsm.poll_interval_sec {
            errors.push(format!(
                "fsm: timeout_sec ({}) is shorter than poll_interval_sec ({})",
                self.fsm.timeout_sec, self.fsm.poll_interval_sec
            ));
        }
    }

    fn validate_devices(&self, errors: &mut Vec<String>) {
        let mut seen_names: HashSet<&str> = HashSet::new();
        let mut seen_ids: HashSet<u8> = HashSet::new();

        for (i, d) in self.devices.iter().enumerate() {
            let ctx = || {
                if d.name.is_empty() {
                    format!("devices[{i}]")
                } else {
                    format!("device '{}'", d.name)
                }
            };

            if d.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen_names.insert(&d.name) {
                errors.push(format!("{}: duplicate name", ctx()));
            }

            if !seen_ids.insert(d.device_id) {
                errors.push(format!(
                    "{}: device_id {} is already used by another device",
                    ctx(),
                    d.device_id
                ));
            }

            let min = d.kind.min_state_count();
            if d.state_count < min {
                errors.push(format!(
                    "{}: state_count {} below the {} layout minimum of {min}",
                    ctx(),
                    d.state_count,
                    d.kind
                ));
            }
        }
    }

    fn validate_windows(&self, errors: &mut Vec<String>) {
        let Some(w) = &self.windows else { return };

        if w.left == w.right {
            errors.push(format!("windows: left and right are both '{}'", w.left));
        }
        for name in [&w.left, &w.right] {
            match self.devices.iter().find(|d| &d.name == name) {
                None => errors.push(format!("windows: '{name}' is not a configured device")),
                Some(d) if d.kind != DeviceKind::Retractable => errors.push(format!(
                    "windows: '{name}' is a {}, expected a retractable",
                    d.kind
                )),
                Some(_) => {}
            }
        }
        for (i, range) in w.deadband.iter().enumerate() {
            let [lo, hi] = *range;
            if lo > hi {
                errors.push(format!("windows: deadband[{i}] [{lo}, {hi}] is inverted"));
            }
            if !(0.0..=360.0).contains(&lo) || !(0.0..=360.0).contains(&hi) {
                errors.push(format!(
                    "windows: deadband[{i}] [{lo}, {hi}] outside 0..360"
                ));
            }
        }
    }

    // -- derived runtime configs ---------------------------------------------

    pub fn fsm_config(&self) -> FsmConfig {
        FsmConfig {
            poll_interval: Duration::from_secs(self.fsm.poll_interval_sec),
            timeout: Duration::from_secs(self.fsm.timeout_sec),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            global_debounce: self.engine.global_debounce_sec.map(Duration::from_secs),
            fan_off_delay: self.scheduler.fan_off_delay_sec.map(Duration::from_secs),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut cfg = EngineConfig::default();
        if let Some(w) = &self.windows {
            cfg.window_left = w.left.clone();
            cfg.window_right = w.right.clone();
            cfg.deadbands = w.deadband.iter().map(|&[lo, hi]| (lo, hi)).collect();
        }
        if let Some(doser) = self
            .devices
            .iter()
            .find(|d| d.kind == DeviceKind::NutrientDoser)
        {
            cfg.doser = doser.name.clone();
        }
        cfg
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
