#![cfg_attr(not(test), no_std)]

use byteorder::{ByteOrder, LittleEndian};
use common::{NvmBase, NvmError};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;

pub mod layout;

pub use layout::{NvmField, BED_ORIENTATION_VERSION, NVM_SIZE};

/// Storage shared between the motion task and the persistence tick.
///
/// The foreground awaits the lock, the tick only ever tries it and skips its
/// turn when the storage is busy, so the two never interleave a transfer.
pub type SharedNvm<S> = Mutex<CriticalSectionRawMutex, S>;

// value of a cell that was erased and never written
const ERASED: u8 = 0xFF;

/// Typed access to the fields of [`NvmField`], stored little endian.
pub trait NvmExt: NvmBase {
    fn read_f32(&mut self, field: NvmField) -> Result<f32, NvmError> {
        debug_assert_eq!(field.get_len(), 4);
        let mut bytes = [0u8; 4];
        self.read(field.get_offset(), &mut bytes)?;
        Ok(LittleEndian::read_f32(&bytes))
    }

    /// Erased cells read as NaN, they and read failures fall back to `default`.
    fn read_f32_or(&mut self, field: NvmField, default: f32) -> f32 {
        match self.read_f32(field) {
            Ok(value) if value.is_finite() => value,
            _ => default,
        }
    }

    fn write_f32(&mut self, field: NvmField, value: f32) -> Result<(), NvmError> {
        debug_assert_eq!(field.get_len(), 4);
        let mut bytes = [0u8; 4];
        LittleEndian::write_f32(&mut bytes, value);
        self.erase_and_write(field.get_offset(), &bytes)
    }

    fn read_u8(&mut self, field: NvmField) -> Result<u8, NvmError> {
        debug_assert_eq!(field.get_len(), 1);
        let mut bytes = [0u8; 1];
        self.read(field.get_offset(), &mut bytes)?;
        Ok(bytes[0])
    }

    fn read_u8_or(&mut self, field: NvmField, default: u8) -> u8 {
        match self.read_u8(field) {
            Ok(value) if value != ERASED => value,
            _ => default,
        }
    }

    fn write_u8(&mut self, field: NvmField, value: u8) -> Result<(), NvmError> {
        debug_assert_eq!(field.get_len(), 1);
        self.erase_and_write(field.get_offset(), &[value])
    }
}

impl<T: NvmBase> NvmExt for T {}
