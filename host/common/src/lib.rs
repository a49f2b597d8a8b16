#![cfg_attr(not(test), no_std)]

use core::time::Duration;

/*
capability traits implemented by the board crate on top of the embassy HAL
and by mocks in the host tests. The motion core never talks to a peripheral
directly.
*/

pub trait OutputPinBase {
    fn set_high(&mut self);
    fn set_low(&mut self);
    fn is_high(&self) -> bool;
}

pub trait TimerBase {
    async fn after(duration: Duration);
}

// drive current reference of the stepper drivers
pub trait PwmBase {
    type Channel: Copy;

    fn enable(&mut self, channel: Self::Channel);
    fn disable(&mut self, channel: Self::Channel);
    fn get_max_duty(&self) -> u64;
    fn set_duty(&mut self, channel: Self::Channel, duty_cycle: u64);
}

/// The single hardware timer shared by every step channel.
///
/// Each period raises an overflow event followed by one compare event per
/// channel; the board crate forwards both to the step scheduler from its
/// interrupt handlers.
pub trait StepTimerBase {
    /// Timer periods per second, the unit every pulse delay is expressed in.
    fn get_ticks_per_second(&self) -> u32;

    fn start(&mut self);
    fn stop(&mut self);

    /// Resolves after the next overflow event.
    async fn next_tick(&mut self);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct AccelerationValues {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

impl AccelerationValues {
    pub fn get(&self, axis: AccelerometerAxis) -> i16 {
        match axis {
            AccelerometerAxis::X => self.x,
            AccelerometerAxis::Y => self.y,
            AccelerometerAxis::Z => self.z,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum AccelerometerAxis {
    X,
    Y,
    Z,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub struct AccelerometerFault;

pub trait AccelerometerBase {
    fn read_values(&mut self) -> Result<AccelerationValues, AccelerometerFault>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum NvmError {
    OutOfBounds,
    Device,
}

/// Byte addressable persistent storage (the printer's EEPROM).
pub trait NvmBase {
    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), NvmError>;
    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), NvmError>;
    fn erase_and_write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), NvmError>;
}
