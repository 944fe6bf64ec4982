//! Development-mode simulation: an in-memory register bus that behaves like
//! the real device park, and a sensor source producing plausible greenhouse
//! readings. Lets the whole control loop run (and be tested end-to-end)
//! with no hardware attached.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::actuator::{CmdCode, DeviceKind, RegisterMap, StatCode};
use crate::codec::{pack_i32, unpack_i32};
use crate::error::{ControlError, Result};
use crate::rules::{SensorProvider, Snapshot};
use crate::transport::RegisterBus;

/// How many state reads a simulated operation stays in a working code
/// before completing.
const DEFAULT_WORK_READS: u32 = 3;

// ---------------------------------------------------------------------------
// Simulated device
// ---------------------------------------------------------------------------

struct SimDevice {
    kind: DeviceKind,
    cmd_addr: u16,
    state_addr: u16,
    code: StatCode,
    opid: u16,
    remain_sec: i32,
    open_pct: u16,
    target_pct: u16,
    area: u16,
    alarm: u16,
    /// State reads left before the in-flight operation completes.
    reads_left: u32,
    reads_per_op: u32,
}

impl SimDevice {
    fn new(kind: DeviceKind, reg: &RegisterMap) -> Self {
        Self {
            kind,
            cmd_addr: reg.cmd_addr,
            state_addr: reg.state_addr,
            code: StatCode::Ready,
            opid: 0,
            remain_sec: 0,
            open_pct: 0,
            target_pct: 0,
            area: 1,
            alarm: 0,
            reads_left: 0,
            reads_per_op: DEFAULT_WORK_READS,
        }
    }

    fn accept_command(&mut self, payload: &[u16]) -> Result<()> {
        if payload.len() < 2 {
            return Err(ControlError::Transport(
                "sim: command block shorter than [code, opid]".to_string(),
            ));
        }
        let code = payload[0];
        self.opid = payload[1];
        self.remain_sec = if payload.len() >= 4 && self.kind != DeviceKind::NutrientDoser {
            unpack_i32(payload[2], payload[3])
        } else if payload.len() >= 6 {
            unpack_i32(payload[4], payload[5])
        } else {
            0
        };

        const OFF: u16 = 0;
        match code {
            OFF => {
                // Stop is quick: one read and the device reports READY.
                self.reads_left = 1;
                self.remain_sec = 0;
                self.target_pct = self.open_pct;
                self.code = match self.kind {
                    DeviceKind::Switch => StatCode::Working,
                    DeviceKind::Retractable => self.code,
                    DeviceKind::NutrientDoser => StatCode::Finishing,
                };
            }
            c if c == CmdCode::On.as_register() || c == CmdCode::TimedOn.as_register() => {
                self.code = StatCode::Working;
                self.reads_left = self.reads_per_op;
            }
            c if c == CmdCode::Open.as_register() || c == CmdCode::TimedOpen.as_register() => {
                self.code = StatCode::Opening;
                self.target_pct = 100;
                self.reads_left = self.reads_per_op;
            }
            c if c == CmdCode::Close.as_register() || c == CmdCode::TimedClose.as_register() => {
                self.code = StatCode::Closing;
                self.target_pct = 0;
                self.reads_left = self.reads_per_op;
            }
            c if c == CmdCode::JustWater.as_register() || c == CmdCode::NutWater.as_register() => {
                self.code = StatCode::Preparing;
                self.reads_left = self.reads_per_op;
            }
            other => {
                return Err(ControlError::Transport(format!(
                    "sim: device rejected opcode {other}"
                )))
            }
        }
        Ok(())
    }

    /// Advance the device by one observation, then render the state block.
    fn step_and_render(&mut self, count: u16) -> Vec<u16> {
        if self.code == StatCode::Error {
            // Faulted devices stay faulted until a fresh command.
        } else if self.reads_left > 0 {
            self.reads_left -= 1;
            self.remain_sec = (self.remain_sec - 1).max(0);

            if self.kind == DeviceKind::Retractable {
                // Move linearly toward the target over the op's lifetime.
                let step = 100 / self.reads_per_op as i32;
                let pct = self.open_pct as i32;
                let target = self.target_pct as i32;
                let moved = if target > pct {
                    (pct + step).min(target)
                } else {
                    (pct - step).max(target)
                };
                self.open_pct = moved as u16;
            }
            if self.kind == DeviceKind::NutrientDoser && self.code.is_working() {
                // Rough prepare/supply/finish progression.
                let total = self.reads_per_op;
                self.code = if self.reads_left > 2 * total / 3 {
                    StatCode::Preparing
                } else if self.reads_left > total / 3 {
                    StatCode::Supplying
                } else {
                    StatCode::Finishing
                };
            }

            if self.reads_left == 0 {
                self.code = StatCode::Ready;
                self.remain_sec = 0;
                if self.kind == DeviceKind::Retractable {
                    self.open_pct = self.target_pct;
                }
            }
        }

        let mut regs = match self.kind {
            DeviceKind::Switch | DeviceKind::Retractable => {
                let [lo, hi] = pack_i32(self.remain_sec);
                let mut r = vec![self.opid, self.code.as_register(), lo, hi];
                if self.kind == DeviceKind::Retractable {
                    r.push(self.open_pct);
                }
                r
            }
            DeviceKind::NutrientDoser => {
                let [lo, hi] = pack_i32(self.remain_sec);
                vec![self.code.as_register(), self.area, self.alarm, self.opid, lo, hi]
            }
        };
        regs.resize(count as usize, 0);
        regs
    }
}

// ---------------------------------------------------------------------------
// Simulated bus
// ---------------------------------------------------------------------------

/// In-memory register bus. One entry per configured device id.
pub struct SimBus {
    devices: Mutex<HashMap<u8, SimDevice>>,
    offline: Mutex<bool>,
}

impl SimBus {
    pub fn new() -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            offline: Mutex::new(false),
        }
    }

    pub fn add_device(&self, kind: DeviceKind, reg: &RegisterMap) {
        self.devices
            .lock()
            .expect("sim device table poisoned")
            .insert(reg.device_id, SimDevice::new(kind, reg));
    }

    /// Reads a working device completes in (test hook).
    pub fn set_reads_per_op(&self, device_id: u8, reads: u32) {
        if let Some(d) = self.devices.lock().expect("sim device table poisoned").get_mut(&device_id) {
            d.reads_per_op = reads;
        }
    }

    /// Force the device into a fault (test hook).
    pub fn force_error(&self, device_id: u8) {
        if let Some(d) = self.devices.lock().expect("sim device table poisoned").get_mut(&device_id) {
            d.code = StatCode::Error;
            d.reads_left = 0;
        }
    }

    /// Preset the opening percentage of a retractable (test hook).
    pub fn set_open_pct(&self, device_id: u8, pct: u16) {
        if let Some(d) = self.devices.lock().expect("sim device table poisoned").get_mut(&device_id) {
            d.open_pct = pct;
            d.target_pct = pct;
        }
    }

    /// Simulate a network outage: every read/write fails until cleared.
    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock().expect("sim offline flag poisoned") = offline;
    }

    fn check_online(&self) -> Result<()> {
        if *self.offline.lock().expect("sim offline flag poisoned") {
            return Err(ControlError::Transport("sim: bus offline".to_string()));
        }
        Ok(())
    }
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegisterBus for SimBus {
    async fn write_registers(&self, device_id: u8, addr: u16, payload: &[u16]) -> Result<()> {
        self.check_online()?;
        let mut devices = self.devices.lock().expect("sim device table poisoned");
        let dev = devices.get_mut(&device_id).ok_or_else(|| {
            ControlError::Transport(format!("sim: no device {device_id}"))
        })?;
        if addr != dev.cmd_addr {
            return Err(ControlError::Transport(format!(
                "sim: write at {addr} outside command block of device {device_id}"
            )));
        }
        debug!(device_id, addr, ?payload, "sim command write");
        dev.accept_command(payload)
    }

    async fn read_registers(&self, device_id: u8, addr: u16, count: u16) -> Result<Vec<u16>> {
        self.check_online()?;
        let mut devices = self.devices.lock().expect("sim device table poisoned");
        let dev = devices.get_mut(&device_id).ok_or_else(|| {
            ControlError::Transport(format!("sim: no device {device_id}"))
        })?;
        if addr != dev.state_addr {
            return Err(ControlError::Transport(format!(
                "sim: read at {addr} outside state block of device {device_id}"
            )));
        }
        Ok(dev.step_and_render(count))
    }
}

// ---------------------------------------------------------------------------
// Simulated sensors
// ---------------------------------------------------------------------------

/// Random-walk greenhouse sensor source for development runs. Values stay
/// in physically sensible ranges and evolve smoothly between ticks.
pub struct SimSensors {
    inner: Mutex<SensorWalk>,
}

struct SensorWalk {
    indoor_temp: f64,
    outdoor_temp: f64,
    indoor_humidity: f64,
    indoor_co2: f64,
    wind_speed: f64,
    wind_direction: f64,
    solar_radiation: f64,
    soil_water_content: f64,
}

impl SimSensors {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SensorWalk {
                indoor_temp: 24.0,
                outdoor_temp: 18.0,
                indoor_humidity: 65.0,
                indoor_co2: 420.0,
                wind_speed: 2.0,
                wind_direction: 90.0,
                solar_radiation: 300.0,
                soil_water_content: 32.0,
            }),
        }
    }
}

impl Default for SimSensors {
    fn default() -> Self {
        Self::new()
    }
}

fn walk(v: f64, sigma: f64, lo: f64, hi: f64) -> f64 {
    (v + (fastrand::f64() - 0.5) * 2.0 * sigma).clamp(lo, hi)
}

#[async_trait]
impl SensorProvider for SimSensors {
    async fn snapshot(&self) -> anyhow::Result<Snapshot> {
        let mut w = self.inner.lock().expect("sensor walk poisoned");
        w.indoor_temp = walk(w.indoor_temp, 0.4, 5.0, 45.0);
        w.outdoor_temp = walk(w.outdoor_temp, 0.3, -15.0, 40.0);
        w.indoor_humidity = walk(w.indoor_humidity, 1.5, 20.0, 100.0);
        w.indoor_co2 = walk(w.indoor_co2, 25.0, 150.0, 1500.0);
        w.wind_speed = walk(w.wind_speed, 0.5, 0.0, 25.0);
        w.wind_direction = (w.wind_direction + (fastrand::f64() - 0.5) * 30.0 + 360.0) % 360.0;
        w.solar_radiation = walk(w.solar_radiation, 40.0, 0.0, 1100.0);
        w.soil_water_content = walk(w.soil_water_content, 0.5, 5.0, 60.0);

        let mut snap = Snapshot::new();
        snap.insert("indoor_temp".to_string(), w.indoor_temp);
        snap.insert("outdoor_temp".to_string(), w.outdoor_temp);
        snap.insert("temp_diff".to_string(), w.indoor_temp - w.outdoor_temp);
        snap.insert("indoor_humidity".to_string(), w.indoor_humidity);
        snap.insert("indoor_co2".to_string(), w.indoor_co2);
        snap.insert("wind_speed".to_string(), w.wind_speed);
        snap.insert("wind_direction".to_string(), w.wind_direction);
        snap.insert("solar_radiation".to_string(), w.solar_radiation);
        snap.insert("soil_water_content".to_string(), w.soil_water_content);
        snap.insert("rain".to_string(), if fastrand::f64() < 0.05 { 1.0 } else { 0.0 });
        snap.insert("time_band".to_string(), 2.0);
        snap.insert("DAT".to_string(), 40.0);
        Ok(snap)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
