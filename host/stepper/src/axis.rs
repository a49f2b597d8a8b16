use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use common::NvmBase;
use nvm::{NvmExt, NvmField};

use crate::{Axis, Direction};

/// Last known position of an axis, shared with the persistence tick.
///
/// Only the planner and the calibration routines write it; the tick only
/// reads, so plain atomic loads and stores are enough.
pub struct AxisState {
    value: AtomicU32,
    direction: AtomicU8,
    valid: AtomicBool,
}

impl AxisState {
    pub const fn new() -> Self {
        Self {
            value: AtomicU32::new(0),
            direction: AtomicU8::new(0),
            valid: AtomicBool::new(false),
        }
    }

    pub fn get_value(&self) -> f32 {
        f32::from_bits(self.value.load(Ordering::Relaxed))
    }

    pub fn set_value(&self, value: f32) {
        self.value.store(value.to_bits(), Ordering::Relaxed);
    }

    pub fn get_direction(&self) -> Direction {
        Direction::try_from(self.direction.load(Ordering::Relaxed)).unwrap_or(Direction::Positive)
    }

    pub fn set_direction(&self, direction: Direction) {
        self.direction.store(u8::from(direction), Ordering::Relaxed);
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }

    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Relaxed);
    }
}

impl Default for AxisState {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-axis state of X, Y and Z. The extruder position is never persisted.
pub struct MotionState {
    axes: [AxisState; 3],
}

impl MotionState {
    pub const fn new() -> Self {
        Self {
            axes: [AxisState::new(), AxisState::new(), AxisState::new()],
        }
    }

    pub fn get(&self, axis: Axis) -> Option<&AxisState> {
        match axis {
            Axis::X => Some(&self.axes[0]),
            Axis::Y => Some(&self.axes[1]),
            Axis::Z => Some(&self.axes[2]),
            Axis::E => None,
        }
    }

    /// Loads the last recorded state of every axis, run once at boot.
    ///
    /// A value that was never written (or is not a number) restores as 0 and
    /// invalid.
    pub fn restore<S: NvmBase>(&self, nvm: &mut S) {
        for axis in [Axis::X, Axis::Y, Axis::Z] {
            let (Some(state), Some(fields)) = (self.get(axis), AxisFields::of(axis)) else {
                continue;
            };
            let value = nvm.read_f32(fields.value).ok().filter(|v| v.is_finite());
            let direction = nvm
                .read_u8(fields.direction)
                .ok()
                .and_then(|d| Direction::try_from(d).ok())
                .unwrap_or(Direction::Positive);
            let valid = nvm.read_u8(fields.validity).map(|v| v == 1).unwrap_or(false);

            state.set_value(value.unwrap_or(0.0));
            state.set_direction(direction);
            state.set_valid(valid && value.is_some());
        }
    }
}

impl Default for MotionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Storage fields holding the state of one axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AxisFields {
    pub value: NvmField,
    pub direction: NvmField,
    pub validity: NvmField,
}

impl AxisFields {
    pub fn of(axis: Axis) -> Option<Self> {
        match axis {
            Axis::X => Some(Self {
                value: NvmField::LastRecordedXValue,
                direction: NvmField::LastRecordedXDirection,
                validity: NvmField::SavedXState,
            }),
            Axis::Y => Some(Self {
                value: NvmField::LastRecordedYValue,
                direction: NvmField::LastRecordedYDirection,
                validity: NvmField::SavedYState,
            }),
            Axis::Z => Some(Self {
                value: NvmField::LastRecordedZValue,
                direction: NvmField::LastRecordedZDirection,
                validity: NvmField::SavedZState,
            }),
            Axis::E => None,
        }
    }
}
