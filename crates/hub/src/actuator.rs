//! Actuator command/state model and the per-kind register drivers.
//!
//! Three device shapes share one wire idiom: a command block written at
//! `cmd_addr` and a state block read back from `state_addr`. The drivers
//! only differ in block layout, so each kind implements [`DeviceCodec`]
//! and everything else (opid allocation, bus I/O) lives in [`Actuator`].

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::{pack_f32, pack_i32, unpack_i32};
use crate::error::{ControlError, Result};
use crate::transport::RegisterBus;

/// Sentinel opid reported when a command is recognised as a no-op and never
/// transmitted.
pub const SKIP_OPID: i32 = -1;

/// Opids wrap back to 1 after this value. Stays well inside a u16 register
/// and far from any opid still plausibly in flight.
const OPID_MAX: i32 = 20000;

// ---------------------------------------------------------------------------
// Wire enums
// ---------------------------------------------------------------------------

/// Command opcodes as written to the device's command register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CmdCode {
    Off,
    On,
    TimedOn,
    Open,
    Close,
    TimedOpen,
    TimedClose,
    /// Doser: plain water run. Rule files may also spell this `WATER`.
    #[serde(alias = "WATER")]
    JustWater,
    /// Doser: nutrient solution run. Rule files may also spell this `NUTRIENT`.
    #[serde(alias = "NUTRIENT")]
    NutWater,
}

impl CmdCode {
    pub fn as_register(self) -> u16 {
        match self {
            Self::Off => 0,
            Self::On => 201,
            Self::TimedOn => 202,
            Self::Open => 301,
            Self::Close => 302,
            Self::TimedOpen => 303,
            Self::TimedClose => 304,
            Self::JustWater => 402,
            Self::NutWater => 403,
        }
    }

    /// Commands that drive a retractable toward fully open.
    pub fn is_open_class(self) -> bool {
        matches!(self, Self::Open | Self::TimedOpen)
    }

    /// Commands that drive a retractable toward fully closed.
    pub fn is_close_class(self) -> bool {
        matches!(self, Self::Close | Self::TimedClose)
    }

    /// Commands that are meaningless without a positive duration.
    pub fn requires_duration(self) -> bool {
        matches!(
            self,
            Self::TimedOn | Self::TimedOpen | Self::TimedClose | Self::JustWater | Self::NutWater
        )
    }
}

impl FromStr for CmdCode {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OFF" => Ok(Self::Off),
            "ON" => Ok(Self::On),
            "TIMED_ON" => Ok(Self::TimedOn),
            "OPEN" => Ok(Self::Open),
            "CLOSE" => Ok(Self::Close),
            "TIMED_OPEN" => Ok(Self::TimedOpen),
            "TIMED_CLOSE" => Ok(Self::TimedClose),
            "JUST_WATER" | "WATER" => Ok(Self::JustWater),
            "NUT_WATER" | "NUTRIENT" => Ok(Self::NutWater),
            other => Err(ControlError::InvalidCommand(format!(
                "unknown command '{other}'"
            ))),
        }
    }
}

impl fmt::Display for CmdCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Off => "OFF",
            Self::On => "ON",
            Self::TimedOn => "TIMED_ON",
            Self::Open => "OPEN",
            Self::Close => "CLOSE",
            Self::TimedOpen => "TIMED_OPEN",
            Self::TimedClose => "TIMED_CLOSE",
            Self::JustWater => "JUST_WATER",
            Self::NutWater => "NUT_WATER",
        };
        write!(f, "{s}")
    }
}

/// Device-reported status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatCode {
    Ready,
    Error,
    Working,
    Opening,
    Closing,
    Preparing,
    Supplying,
    Finishing,
}

impl StatCode {
    pub fn from_register(v: u16) -> Option<Self> {
        match v {
            0 => Some(Self::Ready),
            1 => Some(Self::Error),
            201 => Some(Self::Working),
            301 => Some(Self::Opening),
            302 => Some(Self::Closing),
            401 => Some(Self::Preparing),
            402 => Some(Self::Supplying),
            403 => Some(Self::Finishing),
            _ => None,
        }
    }

    pub fn as_register(self) -> u16 {
        match self {
            Self::Ready => 0,
            Self::Error => 1,
            Self::Working => 201,
            Self::Opening => 301,
            Self::Closing => 302,
            Self::Preparing => 401,
            Self::Supplying => 402,
            Self::Finishing => 403,
        }
    }

    /// True while the device is still executing a command.
    pub fn is_working(self) -> bool {
        matches!(
            self,
            Self::Working
                | Self::Opening
                | Self::Closing
                | Self::Preparing
                | Self::Supplying
                | Self::Finishing
        )
    }
}

// ---------------------------------------------------------------------------
// Command & state values
// ---------------------------------------------------------------------------

/// One command, constructed per dispatch. `duration_sec == 0` means no
/// duration field on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub code: CmdCode,
    pub duration_sec: u32,
    pub ec: Option<f32>,
    pub ph: Option<f32>,
}

impl Command {
    pub fn new(code: CmdCode) -> Self {
        Self { code, duration_sec: 0, ec: None, ph: None }
    }

    pub fn timed(code: CmdCode, duration_sec: u32) -> Self {
        Self { code, duration_sec, ec: None, ph: None }
    }
}

/// Fields every device reports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BaseState {
    pub code: StatCode,
    pub opid: i32,
    pub remain_sec: i32,
}

/// Decoded state block, keyed by device kind.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceState {
    Switch(BaseState),
    Retractable { base: BaseState, open_pct: u16 },
    Nutrient { base: BaseState, area: u16, alarm: u16 },
}

impl DeviceState {
    pub fn base(&self) -> &BaseState {
        match self {
            Self::Switch(b) => b,
            Self::Retractable { base, .. } => base,
            Self::Nutrient { base, .. } => base,
        }
    }

    pub fn open_pct(&self) -> Option<u16> {
        match self {
            Self::Retractable { open_pct, .. } => Some(*open_pct),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Static per-device wiring
// ---------------------------------------------------------------------------

/// Register addressing for one physical device. Loaded from config at
/// startup, immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct RegisterMap {
    pub device_id: u8,
    pub cmd_addr: u16,
    pub state_addr: u16,
    pub state_count: u16,
}

/// Closed set of device shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Switch,
    Retractable,
    NutrientDoser,
}

impl DeviceKind {
    /// Smallest state block each layout can decode.
    pub fn min_state_count(self) -> u16 {
        match self {
            Self::Switch => 4,
            Self::Retractable => 5,
            Self::NutrientDoser => 6,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Switch => write!(f, "switch"),
            Self::Retractable => write!(f, "retractable"),
            Self::NutrientDoser => write!(f, "nutrient_doser"),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-kind codecs
// ---------------------------------------------------------------------------

/// Layout-specific encode/decode. Implementations are stateless; selection
/// happens once at construction via [`codec_for`].
pub trait DeviceCodec: Send + Sync {
    /// Reject commands the device kind cannot execute. Runs before any opid
    /// is allocated or register written.
    fn validate(&self, cmd: &Command) -> Result<()>;

    /// Build the command block. Only called with a validated command.
    fn encode(&self, cmd: &Command, opid: i32) -> Vec<u16>;

    /// Decode a state block.
    fn decode(&self, regs: &[u16]) -> Result<DeviceState>;

    /// True when `cmd` would not change the device. Default: never.
    fn is_noop(&self, _cmd: &Command, _current: &DeviceState) -> bool {
        false
    }
}

fn decode_base(regs: &[u16], state_off: usize, opid_off: usize, remain_off: usize) -> Result<BaseState> {
    let code = StatCode::from_register(regs[state_off]).ok_or_else(|| {
        ControlError::Decode(format!("unknown state code {}", regs[state_off]))
    })?;
    Ok(BaseState {
        code,
        opid: regs[opid_off] as i32,
        remain_sec: unpack_i32(regs[remain_off], regs[remain_off + 1]),
    })
}

fn check_len(regs: &[u16], need: usize) -> Result<()> {
    if regs.len() < need {
        return Err(ControlError::Decode(format!(
            "state block too short: got {}, need {need}",
            regs.len()
        )));
    }
    Ok(())
}

/// FCU fan/pump, CO2, fan, fog. Command `[code, opid]`, plus a duration
/// pair for TIMED_ON. State `[opid, code, remain_lo, remain_hi]`.
pub struct SwitchCodec;

impl DeviceCodec for SwitchCodec {
    fn validate(&self, cmd: &Command) -> Result<()> {
        match cmd.code {
            CmdCode::Off | CmdCode::On | CmdCode::TimedOn => {}
            other => {
                return Err(ControlError::InvalidCommand(format!(
                    "{other} is not a switch command"
                )))
            }
        }
        if cmd.code.requires_duration() && cmd.duration_sec == 0 {
            return Err(ControlError::InvalidCommand(format!(
                "{} requires a positive duration",
                cmd.code
            )));
        }
        Ok(())
    }

    fn encode(&self, cmd: &Command, opid: i32) -> Vec<u16> {
        let mut regs = vec![cmd.code.as_register(), opid as u16];
        if cmd.duration_sec > 0 {
            regs.extend_from_slice(&pack_i32(cmd.duration_sec as i32));
        }
        regs
    }

    fn decode(&self, regs: &[u16]) -> Result<DeviceState> {
        check_len(regs, 4)?;
        Ok(DeviceState::Switch(decode_base(regs, 1, 0, 2)?))
    }
}

/// Vents, curtains, screens. Same command layout as a switch (open/close
/// opcodes), state adds the current opening percentage.
pub struct RetractableCodec;

impl DeviceCodec for RetractableCodec {
    fn validate(&self, cmd: &Command) -> Result<()> {
        match cmd.code {
            CmdCode::Off
            | CmdCode::Open
            | CmdCode::Close
            | CmdCode::TimedOpen
            | CmdCode::TimedClose => {}
            other => {
                return Err(ControlError::InvalidCommand(format!(
                    "{other} is not a retractable command"
                )))
            }
        }
        if cmd.code.requires_duration() && cmd.duration_sec == 0 {
            return Err(ControlError::InvalidCommand(format!(
                "{} requires a positive duration",
                cmd.code
            )));
        }
        Ok(())
    }

    fn encode(&self, cmd: &Command, opid: i32) -> Vec<u16> {
        let mut regs = vec![cmd.code.as_register(), opid as u16];
        if cmd.duration_sec > 0 {
            regs.extend_from_slice(&pack_i32(cmd.duration_sec as i32));
        }
        regs
    }

    fn decode(&self, regs: &[u16]) -> Result<DeviceState> {
        check_len(regs, 5)?;
        Ok(DeviceState::Retractable {
            base: decode_base(regs, 1, 0, 2)?,
            open_pct: regs[4],
        })
    }

    fn is_noop(&self, cmd: &Command, current: &DeviceState) -> bool {
        let open_pct = match current.open_pct() {
            Some(p) => p,
            None => return false,
        };
        // Already at the commanded endpoint, or already moving that way.
        if cmd.code.is_open_class() {
            return open_pct >= 100 || current.base().code == StatCode::Opening;
        }
        if cmd.code.is_close_class() {
            return open_pct == 0 || current.base().code == StatCode::Closing;
        }
        false
    }
}

/// Nutrient doser. Command carries fixed area bounds and a duration pair;
/// EC/pH setpoints are appended only when both are present. State leads
/// with the code and adds area/alarm words.
pub struct NutrientCodec;

impl DeviceCodec for NutrientCodec {
    fn validate(&self, cmd: &Command) -> Result<()> {
        match cmd.code {
            CmdCode::Off | CmdCode::JustWater | CmdCode::NutWater => {}
            other => {
                return Err(ControlError::InvalidCommand(format!(
                    "{other} is not a doser command"
                )))
            }
        }
        if cmd.code.requires_duration() && cmd.duration_sec == 0 {
            return Err(ControlError::InvalidCommand(format!(
                "{} requires a positive duration",
                cmd.code
            )));
        }
        if cmd.ec.is_some() != cmd.ph.is_some() {
            return Err(ControlError::InvalidCommand(
                "ec and ph must be supplied together".to_string(),
            ));
        }
        Ok(())
    }

    fn encode(&self, cmd: &Command, opid: i32) -> Vec<u16> {
        // start_area / end_area fixed to 1: single-bed installation.
        let mut regs = vec![cmd.code.as_register(), opid as u16, 1, 1];
        regs.extend_from_slice(&pack_i32(cmd.duration_sec as i32));
        if let (Some(ec), Some(ph)) = (cmd.ec, cmd.ph) {
            regs.extend_from_slice(&pack_f32(ec));
            regs.extend_from_slice(&pack_f32(ph));
        }
        regs
    }

    fn decode(&self, regs: &[u16]) -> Result<DeviceState> {
        check_len(regs, 6)?;
        Ok(DeviceState::Nutrient {
            base: decode_base(regs, 0, 3, 4)?,
            area: regs[1],
            alarm: regs[2],
        })
    }
}

/// Select the codec for a device kind.
pub fn codec_for(kind: DeviceKind) -> &'static dyn DeviceCodec {
    match kind {
        DeviceKind::Switch => &SwitchCodec,
        DeviceKind::Retractable => &RetractableCodec,
        DeviceKind::NutrientDoser => &NutrientCodec,
    }
}

// ---------------------------------------------------------------------------
// Opid allocation
// ---------------------------------------------------------------------------

/// Monotonic per-actuator operation-id source: 1, 2, … 20000, 1, …
pub struct OpidCounter(AtomicI32);

impl OpidCounter {
    pub fn new() -> Self {
        Self(AtomicI32::new(0))
    }

    pub fn next(&self) -> i32 {
        let prev = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(if n >= OPID_MAX { 1 } else { n + 1 })
            })
            .unwrap_or(0);
        if prev >= OPID_MAX {
            1
        } else {
            prev + 1
        }
    }
}

// ---------------------------------------------------------------------------
// Actuator handle
// ---------------------------------------------------------------------------

/// One physical device: kind-specific codec plus register addressing plus
/// a shared bus. Cheap to share (`Arc`) between the dispatch path and the
/// verification task.
pub struct Actuator {
    name: String,
    kind: DeviceKind,
    reg: RegisterMap,
    codec: &'static dyn DeviceCodec,
    opid: OpidCounter,
    bus: Arc<dyn RegisterBus>,
}

impl Actuator {
    pub fn new(name: String, kind: DeviceKind, reg: RegisterMap, bus: Arc<dyn RegisterBus>) -> Self {
        Self {
            name,
            kind,
            reg,
            codec: codec_for(kind),
            opid: OpidCounter::new(),
            bus,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Whether the FSM should read device state before dispatching, to
    /// short-circuit commands that would not change anything.
    pub fn wants_preflight(&self) -> bool {
        matches!(self.kind, DeviceKind::Retractable)
    }

    /// True when `cmd` is a no-op against `current` (see [`SKIP_OPID`]).
    pub fn is_noop(&self, cmd: &Command, current: &DeviceState) -> bool {
        self.codec.is_noop(cmd, current)
    }

    /// Validate without transmitting.
    pub fn validate(&self, cmd: &Command) -> Result<()> {
        self.codec.validate(cmd)
    }

    /// Validate, allocate an opid, encode and transmit. Returns the opid.
    pub async fn send(&self, cmd: &Command) -> Result<i32> {
        self.codec.validate(cmd)?;
        let opid = self.opid.next();
        let payload = self.codec.encode(cmd, opid);
        debug!(
            actuator = %self.name,
            cmd = %cmd.code,
            opid,
            ?payload,
            "writing command block"
        );
        self.bus
            .write_registers(self.reg.device_id, self.reg.cmd_addr, &payload)
            .await?;
        Ok(opid)
    }

    /// Read and decode the device's state block.
    pub async fn read_state(&self) -> Result<DeviceState> {
        let regs = self
            .bus
            .read_registers(self.reg.device_id, self.reg.state_addr, self.reg.state_count)
            .await?;
        self.codec.decode(&regs)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn base(code: StatCode, opid: i32) -> BaseState {
        BaseState { code, opid, remain_sec: 0 }
    }

    // -- CmdCode ------------------------------------------------------------

    #[test]
    fn cmd_code_parses_wire_names() {
        assert_eq!("ON".parse::<CmdCode>().unwrap(), CmdCode::On);
        assert_eq!("timed_open".parse::<CmdCode>().unwrap(), CmdCode::TimedOpen);
        assert_eq!(" OFF ".parse::<CmdCode>().unwrap(), CmdCode::Off);
    }

    #[test]
    fn cmd_code_parses_doser_aliases() {
        assert_eq!("WATER".parse::<CmdCode>().unwrap(), CmdCode::JustWater);
        assert_eq!("NUTRIENT".parse::<CmdCode>().unwrap(), CmdCode::NutWater);
    }

    #[test]
    fn cmd_code_rejects_garbage() {
        assert!("TOGGLE".parse::<CmdCode>().is_err());
        assert!("".parse::<CmdCode>().is_err());
    }

    #[test]
    fn stat_code_register_round_trip() {
        for code in [
            StatCode::Ready,
            StatCode::Error,
            StatCode::Working,
            StatCode::Opening,
            StatCode::Closing,
            StatCode::Preparing,
            StatCode::Supplying,
            StatCode::Finishing,
        ] {
            assert_eq!(StatCode::from_register(code.as_register()), Some(code));
        }
        assert_eq!(StatCode::from_register(999), None);
    }

    #[test]
    fn working_codes_cover_all_in_progress_states() {
        assert!(StatCode::Working.is_working());
        assert!(StatCode::Opening.is_working());
        assert!(StatCode::Closing.is_working());
        assert!(StatCode::Preparing.is_working());
        assert!(StatCode::Supplying.is_working());
        assert!(StatCode::Finishing.is_working());
        assert!(!StatCode::Ready.is_working());
        assert!(!StatCode::Error.is_working());
    }

    // -- Switch codec -------------------------------------------------------

    #[test]
    fn switch_encodes_bare_on() {
        let regs = SwitchCodec.encode(&Command::new(CmdCode::On), 7);
        assert_eq!(regs, vec![201, 7]);
    }

    #[test]
    fn switch_encodes_timed_on_with_duration_pair() {
        let regs = SwitchCodec.encode(&Command::timed(CmdCode::TimedOn, 600), 8);
        assert_eq!(regs, vec![202, 8, 600, 0]);
    }

    #[test]
    fn switch_rejects_timed_on_without_duration() {
        let err = SwitchCodec.validate(&Command::new(CmdCode::TimedOn));
        assert!(matches!(err, Err(ControlError::InvalidCommand(_))));
    }

    #[test]
    fn switch_rejects_open() {
        assert!(SwitchCodec.validate(&Command::new(CmdCode::Open)).is_err());
    }

    #[test]
    fn switch_decodes_state_block() {
        // [opid, code, remain_lo, remain_hi]
        let st = SwitchCodec.decode(&[42, 201, 30, 0]).unwrap();
        assert_eq!(
            st,
            DeviceState::Switch(BaseState {
                code: StatCode::Working,
                opid: 42,
                remain_sec: 30
            })
        );
    }

    #[test]
    fn switch_decode_rejects_short_block() {
        assert!(SwitchCodec.decode(&[42, 201]).is_err());
    }

    #[test]
    fn switch_decode_rejects_unknown_code() {
        assert!(matches!(
            SwitchCodec.decode(&[42, 777, 0, 0]),
            Err(ControlError::Decode(_))
        ));
    }

    // -- Retractable codec ---------------------------------------------------

    #[test]
    fn retractable_encodes_timed_open() {
        let regs = RetractableCodec.encode(&Command::timed(CmdCode::TimedOpen, 120), 3);
        assert_eq!(regs, vec![303, 3, 120, 0]);
    }

    #[test]
    fn retractable_rejects_timed_zero_duration() {
        assert!(RetractableCodec.validate(&Command::new(CmdCode::TimedOpen)).is_err());
        assert!(RetractableCodec.validate(&Command::new(CmdCode::TimedClose)).is_err());
    }

    #[test]
    fn retractable_plain_open_needs_no_duration() {
        assert!(RetractableCodec.validate(&Command::new(CmdCode::Open)).is_ok());
    }

    #[test]
    fn retractable_decodes_open_pct() {
        let st = RetractableCodec.decode(&[5, 301, 0, 0, 40]).unwrap();
        assert_eq!(st.open_pct(), Some(40));
        assert_eq!(st.base().code, StatCode::Opening);
    }

    #[test]
    fn retractable_noop_when_fully_open() {
        let st = DeviceState::Retractable { base: base(StatCode::Ready, 1), open_pct: 100 };
        assert!(RetractableCodec.is_noop(&Command::new(CmdCode::Open), &st));
        assert!(!RetractableCodec.is_noop(&Command::new(CmdCode::Close), &st));
    }

    #[test]
    fn retractable_noop_when_fully_closed() {
        let st = DeviceState::Retractable { base: base(StatCode::Ready, 1), open_pct: 0 };
        assert!(RetractableCodec.is_noop(&Command::new(CmdCode::Close), &st));
        assert!(!RetractableCodec.is_noop(&Command::new(CmdCode::Open), &st));
    }

    #[test]
    fn retractable_noop_when_already_moving_same_direction() {
        let opening = DeviceState::Retractable { base: base(StatCode::Opening, 1), open_pct: 50 };
        assert!(RetractableCodec.is_noop(&Command::new(CmdCode::Open), &opening));
        assert!(!RetractableCodec.is_noop(&Command::new(CmdCode::Close), &opening));

        let closing = DeviceState::Retractable { base: base(StatCode::Closing, 1), open_pct: 50 };
        assert!(RetractableCodec.is_noop(&Command::new(CmdCode::Close), &closing));
    }

    #[test]
    fn retractable_midway_is_not_noop() {
        let st = DeviceState::Retractable { base: base(StatCode::Ready, 1), open_pct: 55 };
        assert!(!RetractableCodec.is_noop(&Command::new(CmdCode::Open), &st));
        assert!(!RetractableCodec.is_noop(&Command::new(CmdCode::Close), &st));
    }

    // -- Nutrient codec -------------------------------------------------------

    #[test]
    fn nutrient_encodes_fixed_area_and_duration() {
        let regs = NutrientCodec.encode(&Command::timed(CmdCode::JustWater, 300), 9);
        assert_eq!(regs, vec![402, 9, 1, 1, 300, 0]);
    }

    #[test]
    fn nutrient_appends_ec_ph_only_when_both_given() {
        let mut cmd = Command::timed(CmdCode::NutWater, 300);
        cmd.ec = Some(1.8);
        cmd.ph = Some(6.2);
        let regs = NutrientCodec.encode(&cmd, 9);
        assert_eq!(regs.len(), 10);
        assert_eq!(&regs[..6], &[403, 9, 1, 1, 300, 0]);
        assert_eq!(crate::codec::unpack_f32(regs[6], regs[7]), 1.8);
        assert_eq!(crate::codec::unpack_f32(regs[8], regs[9]), 6.2);
    }

    #[test]
    fn nutrient_rejects_lone_ec() {
        let mut cmd = Command::timed(CmdCode::NutWater, 300);
        cmd.ec = Some(1.8);
        assert!(NutrientCodec.validate(&cmd).is_err());
    }

    #[test]
    fn nutrient_rejects_zero_duration_run() {
        assert!(NutrientCodec.validate(&Command::new(CmdCode::NutWater)).is_err());
        assert!(NutrientCodec.validate(&Command::new(CmdCode::JustWater)).is_err());
    }

    #[test]
    fn nutrient_off_is_valid_without_duration() {
        assert!(NutrientCodec.validate(&Command::new(CmdCode::Off)).is_ok());
    }

    #[test]
    fn nutrient_decodes_state_block() {
        // [code, area, alarm, opid, remain_lo, remain_hi]
        let st = NutrientCodec.decode(&[402, 1, 0, 12, 120, 0]).unwrap();
        match st {
            DeviceState::Nutrient { base, area, alarm } => {
                assert_eq!(base.code, StatCode::Supplying);
                assert_eq!(base.opid, 12);
                assert_eq!(base.remain_sec, 120);
                assert_eq!(area, 1);
                assert_eq!(alarm, 0);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    // -- Opid allocation -------------------------------------------------------

    #[test]
    fn opids_start_at_one_and_increase() {
        let c = OpidCounter::new();
        assert_eq!(c.next(), 1);
        assert_eq!(c.next(), 2);
        assert_eq!(c.next(), 3);
    }

    #[test]
    fn opids_wrap_to_one_after_max() {
        let c = OpidCounter::new();
        let mut last = 0;
        for _ in 0..20000 {
            last = c.next();
        }
        assert_eq!(last, 20000);
        assert_eq!(c.next(), 1);
        assert_eq!(c.next(), 2);
    }

    #[test]
    fn opids_strictly_increase_until_wrap() {
        let c = OpidCounter::new();
        let mut prev = c.next();
        for _ in 0..5000 {
            let n = c.next();
            assert_eq!(n, prev + 1);
            prev = n;
        }
    }
}
