use common::{NvmBase, NvmError};
use nvm::{NvmExt, SharedNvm};

use crate::axis::{AxisFields, MotionState};
use crate::Axis;

#[cfg(feature = "defmt-log")]
use defmt::{debug, warn};

const AXES: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];
// value, direction and validity of every axis
const SLOTS: usize = AXES.len() * 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum SaveOutcome {
    Unchanged,
    Written,
    // the storage was busy, the field comes back on the next round
    Deferred,
    Failed(NvmError),
}

/// Copies the axis state into the nvm one field per tick.
///
/// Meant to run from a slow periodic task; it never waits for the storage.
pub struct PersistenceSaver<'a, S: NvmBase> {
    state: &'a MotionState,
    nvm: &'a SharedNvm<S>,
    slot: usize,
}

impl<'a, S: NvmBase> PersistenceSaver<'a, S> {
    pub fn new(state: &'a MotionState, nvm: &'a SharedNvm<S>) -> Self {
        Self { state, nvm, slot: 0 }
    }

    pub fn tick(&mut self) -> SaveOutcome {
        let slot = self.slot;
        self.slot = (self.slot + 1) % SLOTS;

        let axis = AXES[slot / 3];
        let (Some(state), Some(fields)) = (self.state.get(axis), AxisFields::of(axis)) else {
            return SaveOutcome::Unchanged;
        };
        let Ok(mut nvm) = self.nvm.try_lock() else {
            return SaveOutcome::Deferred;
        };

        let res = match slot % 3 {
            0 => {
                let value = state.get_value();
                match nvm.read_f32(fields.value) {
                    Ok(stored) if stored.to_bits() == value.to_bits() => return SaveOutcome::Unchanged,
                    _ => nvm.write_f32(fields.value, value),
                }
            }
            1 => {
                let direction = u8::from(state.get_direction());
                match nvm.read_u8(fields.direction) {
                    Ok(stored) if stored == direction => return SaveOutcome::Unchanged,
                    _ => nvm.write_u8(fields.direction, direction),
                }
            }
            _ => {
                let valid = u8::from(state.is_valid());
                match nvm.read_u8(fields.validity) {
                    Ok(stored) if stored == valid => return SaveOutcome::Unchanged,
                    _ => nvm.write_u8(fields.validity, valid),
                }
            }
        };

        match res {
            Ok(()) => {
                #[cfg(feature = "defmt-log")]
                debug!("saved state field {} of axis {}", slot % 3, axis);
                SaveOutcome::Written
            }
            Err(e) => {
                #[cfg(feature = "defmt-log")]
                warn!("could not save the state of axis {}: {}", axis, e);
                SaveOutcome::Failed(e)
            }
        }
    }
}
