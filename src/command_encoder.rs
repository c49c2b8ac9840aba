//! Wire commands for the actuator firmware
//!
//! Move: `c<dir><res><steps>e`, stop: `s`, raw text: sent verbatim.
//! There is no checksum or length prefix.

use crate::error::{SessionError, SessionResult};

/// 200 motor steps per full turn at full-step resolution
pub const STEPS_PER_REVOLUTION: u32 = 200;
/// Lead screw advance per turn
pub const MM_PER_REVOLUTION: f64 = 1.0;

pub const STOP_COMMAND: &[u8] = b"s";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Extend,
    Retract,
}

impl Direction {
    fn digit(self) -> char {
        match self {
            Direction::Extend => '0',
            Direction::Retract => '1',
        }
    }
}

/// Microstepping selector. Index 0 is 1/16 step, index 4 is full step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepResolution(u8);

impl StepResolution {
    pub const SIXTEENTH: StepResolution = StepResolution(0);
    pub const EIGHTH: StepResolution = StepResolution(1);
    pub const QUARTER: StepResolution = StepResolution(2);
    pub const HALF: StepResolution = StepResolution(3);
    pub const FULL: StepResolution = StepResolution(4);

    pub const MAX_INDEX: u8 = 4;

    pub fn new(index: u8) -> Option<Self> {
        (index <= Self::MAX_INDEX).then_some(Self(index))
    }

    pub fn index(self) -> u8 {
        self.0
    }

    pub fn microstep_divisor(self) -> u32 {
        1 << (Self::MAX_INDEX - self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveCommand {
    pub direction: Direction,
    pub resolution: StepResolution,
    pub distance_mm: f64,
}

impl MoveCommand {
    pub fn new(direction: Direction, resolution: StepResolution, distance_mm: f64) -> Self {
        Self { direction, resolution, distance_mm }
    }

    /// Travel per motor step at this command's resolution.
    pub fn mm_per_step(&self) -> f64 {
        MM_PER_REVOLUTION
            / (f64::from(self.resolution.microstep_divisor()) * f64::from(STEPS_PER_REVOLUTION))
    }

    /// Distance converted to motor steps, rounded half away from zero.
    ///
    /// Fails for NaN, infinite, or distances whose step count does not fit an `i64`.
    pub fn motor_steps(&self) -> SessionResult<i64> {
        let steps = (self.distance_mm / self.mm_per_step()).round();
        if !steps.is_finite() || steps.abs() >= i64::MAX as f64 {
            return Err(SessionError::InvalidDistance { distance: self.distance_mm.to_string() });
        }
        Ok(steps as i64)
    }
}

/// Bytes ready to be written to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFrame(Vec<u8>);

impl WireFrame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Payload text as recorded in the Sent log record.
    pub fn as_text(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl std::fmt::Display for WireFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

pub fn encode_move(cmd: &MoveCommand) -> SessionResult<WireFrame> {
    let text = format!(
        "c{}{}{}e",
        cmd.direction.digit(),
        cmd.resolution.index(),
        cmd.motor_steps()?
    );
    Ok(WireFrame(text.into_bytes()))
}

pub fn encode_stop() -> WireFrame {
    WireFrame(STOP_COMMAND.to_vec())
}

pub fn encode_raw(text: &str) -> SessionResult<WireFrame> {
    if text.is_empty() {
        return Err(SessionError::EmptyPayload);
    }
    Ok(WireFrame(text.as_bytes().to_vec()))
}
