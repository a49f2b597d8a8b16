#![cfg_attr(not(test), no_std)]

use core::fmt;

use common::NvmError;

pub mod axis;
pub mod calibration;
pub mod compensation;
pub mod config;
pub mod driver;
pub mod persistence;
pub mod plan;
pub mod planner;
pub mod scheduler;

#[cfg(test)]
mod sim;

pub use axis::{AxisState, MotionState};
pub use config::{MotionConfig, SteppingMode};
pub use persistence::{PersistenceSaver, SaveOutcome};
pub use planner::{MoveCommand, MoveReport, MoveTasks, Motors, Positioning};
pub use scheduler::StepScheduler;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum Axis {
    X,
    Y,
    Z,
    E,
}

impl Axis {
    pub const ALL: [Axis; 4] = [Axis::X, Axis::Y, Axis::Z, Axis::E];

    pub fn index(&self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
            Axis::E => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum Direction {
    Positive,
    Negative,
}

impl Direction {
    pub fn from_delta(delta: f32) -> Self {
        if delta < 0.0 {
            Direction::Negative
        } else {
            Direction::Positive
        }
    }

    pub fn get_sign(&self) -> f32 {
        match self {
            Direction::Positive => 1.0,
            Direction::Negative => -1.0,
        }
    }
}

impl From<Direction> for u8 {
    fn from(value: Direction) -> Self {
        match value {
            Direction::Positive => 0,
            Direction::Negative => 1,
        }
    }
}

impl TryFrom<u8> for Direction {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Direction::Positive),
            1 => Ok(Direction::Negative),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum MotionError {
    // the move needs more steps than the scheduler counter can hold
    StepOverflow(Axis),
    EmergencyStop,
    AccelerometerFault,
    Z0NotFound,
    Storage(NvmError),
}

impl fmt::Display for MotionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotionError::StepOverflow(axis) => write!(f, "step count overflow on axis {:?}", axis),
            MotionError::EmergencyStop => write!(f, "emergency stop"),
            MotionError::AccelerometerFault => write!(f, "accelerometer not working"),
            MotionError::Z0NotFound => write!(f, "bed not found while looking for Z0"),
            MotionError::Storage(e) => write!(f, "storage error: {:?}", e),
        }
    }
}

impl From<NvmError> for MotionError {
    fn from(value: NvmError) -> Self {
        MotionError::Storage(value)
    }
}
