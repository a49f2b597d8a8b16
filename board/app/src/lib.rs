#![no_std]
#![no_main]

use common::{
    AccelerationValues, AccelerometerBase, AccelerometerFault, NvmBase, NvmError, OutputPinBase, PwmBase,
    StepTimerBase, TimerBase,
};
use embassy_stm32::{
    gpio::Output,
    pac,
    time::Hertz,
    timer::{low_level::Timer as LowLevelTimer, simple_pwm::SimplePwm, Channel, GeneralInstance4Channel},
};
use embassy_sync::{blocking_mutex::raw::CriticalSectionRawMutex, signal::Signal};
use embassy_time::Timer;
use embedded_hal_1::{i2c::I2c, spi::SpiDevice};
use stepper::{Axis, StepScheduler};

#[cfg(feature = "defmt-log")]
use defmt::warn;

pub mod config;

pub struct OutputPinWrapper<'a> {
    pin: Output<'a>,
}

impl<'a> OutputPinWrapper<'a> {
    pub fn new(pin: Output<'a>) -> Self {
        Self { pin }
    }
}

impl OutputPinBase for OutputPinWrapper<'_> {
    fn set_high(&mut self) {
        self.pin.set_high();
    }

    fn set_low(&mut self) {
        self.pin.set_low();
    }

    fn is_high(&self) -> bool {
        self.pin.is_set_high()
    }
}

pub struct EmbassyTimer {}

impl TimerBase for EmbassyTimer {
    async fn after(duration: core::time::Duration) {
        let duration = embassy_time::Duration::from_micros(duration.as_micros() as u64);
        Timer::after(duration).await
    }
}

pub struct SimplePwmWrapper<'a, T: GeneralInstance4Channel> {
    inner: SimplePwm<'a, T>,
}

impl<'a, T: GeneralInstance4Channel> SimplePwmWrapper<'a, T> {
    pub fn new(p: SimplePwm<'a, T>) -> Self {
        Self { inner: p }
    }
}

impl<T: GeneralInstance4Channel> PwmBase for SimplePwmWrapper<'_, T> {
    type Channel = Channel;

    fn enable(&mut self, channel: Self::Channel) {
        self.inner.enable(channel);
    }

    fn disable(&mut self, channel: Self::Channel) {
        self.inner.disable(channel);
    }

    fn get_max_duty(&self) -> u64 {
        u64::from(self.inner.get_max_duty())
    }

    fn set_duty(&mut self, channel: Self::Channel, duty_cycle: u64) {
        self.inner.set_duty(channel, duty_cycle as u32);
    }
}

// raised by the step interrupt on every overflow
pub static STEP_TICK: Signal<CriticalSectionRawMutex, ()> = Signal::new();

/*
TIM2 runs the step scheduler: the update event is the overflow, and each axis
has its own compare channel (CC1 X, CC2 Y, CC3 Z, CC4 E) firing once per period.
The compare points are staggered inside the period, so a step pin stays high
from its compare until the next overflow.
*/
const STEP_CHANNELS: [Channel; 4] = [Channel::Ch1, Channel::Ch2, Channel::Ch3, Channel::Ch4];

pub struct StepTimer<'d, T: GeneralInstance4Channel> {
    inner: LowLevelTimer<'d, T>,
    ticks_per_second: u32,
}

impl<'d, T: GeneralInstance4Channel> StepTimer<'d, T> {
    pub fn new(inner: LowLevelTimer<'d, T>, ticks_per_second: u32) -> Self {
        inner.set_frequency(Hertz(ticks_per_second));
        let period = inner.get_max_compare_value();
        let slots = STEP_CHANNELS.len() as u32 + 1;
        for (n, channel) in STEP_CHANNELS.into_iter().enumerate() {
            inner.set_compare_value(channel, period / slots * (n as u32 + 1));
        }
        inner.regs_gp16().dier().modify(|w| {
            w.set_uie(true);
            for n in 0..STEP_CHANNELS.len() {
                w.set_ccie(n, true);
            }
        });
        Self { inner, ticks_per_second }
    }
}

impl<T: GeneralInstance4Channel> StepTimerBase for StepTimer<'_, T> {
    fn get_ticks_per_second(&self) -> u32 {
        self.ticks_per_second
    }

    fn start(&mut self) {
        STEP_TICK.reset();
        self.inner.reset();
        self.inner.start();
    }

    fn stop(&mut self) {
        self.inner.stop();
    }

    async fn next_tick(&mut self) {
        STEP_TICK.wait().await
    }
}

/// Body of the TIM2 interrupt handler.
pub fn on_step_interrupt<P: OutputPinBase>(scheduler: &StepScheduler<P>) {
    let regs = pac::TIM2;
    let sr = regs.sr().read();
    if sr.uif() {
        regs.sr().modify(|w| w.set_uif(false));
        scheduler.on_overflow();
        STEP_TICK.signal(());
    }
    for (n, axis) in Axis::ALL.into_iter().enumerate() {
        if sr.ccif(n) {
            regs.sr().modify(|w| w.set_ccif(n, false));
            scheduler.on_compare(axis);
        }
    }
}

const ACC_WHO_AM_I: u8 = 0x0F;
const ACC_CTRL_REG1: u8 = 0x20;
const ACC_OUT_X_L: u8 = 0x28;
const ACC_ID: u8 = 0x33;
// 400Hz, all axes enabled
const ACC_ODR_400HZ_XYZ: u8 = 0x77;
const SPI_READ: u8 = 0x80;
const SPI_AUTO_INCREMENT: u8 = 0x40;

/// LIS3DH compatible accelerometer on a SPI bus.
///
/// Only the high byte of every axis is reported, which is the resolution the
/// jerk sensitivities are expressed in.
pub struct SpiAccelerometer<D: SpiDevice> {
    device: D,
}

impl<D: SpiDevice> SpiAccelerometer<D> {
    pub fn new(device: D) -> Self {
        Self { device }
    }

    pub fn init(&mut self) -> Result<(), AccelerometerFault> {
        let mut buf = [ACC_WHO_AM_I | SPI_READ, 0];
        self.device.transfer_in_place(&mut buf).map_err(|_| AccelerometerFault)?;
        if buf[1] != ACC_ID {
            #[cfg(feature = "defmt-log")]
            warn!("unexpected accelerometer id {}", buf[1]);
            return Err(AccelerometerFault);
        }
        self.device
            .write(&[ACC_CTRL_REG1, ACC_ODR_400HZ_XYZ])
            .map_err(|_| AccelerometerFault)
    }
}

impl<D: SpiDevice> AccelerometerBase for SpiAccelerometer<D> {
    fn read_values(&mut self) -> Result<AccelerationValues, AccelerometerFault> {
        let mut buf = [0u8; 7];
        buf[0] = ACC_OUT_X_L | SPI_READ | SPI_AUTO_INCREMENT;
        self.device.transfer_in_place(&mut buf).map_err(|_| AccelerometerFault)?;
        Ok(AccelerationValues {
            x: i16::from(buf[2] as i8),
            y: i16::from(buf[4] as i8),
            z: i16::from(buf[6] as i8),
        })
    }
}

const EEPROM_PAGE_SIZE: usize = 32;
// a 24xx eeprom does not acknowledge while it commits a page
const EEPROM_WRITE_POLLS: u32 = 10_000;

/// 24xx series I2C eeprom with 16 bit addressing.
pub struct I2cEeprom<I: I2c> {
    i2c: I,
    address: u8,
    capacity: u32,
}

impl<I: I2c> I2cEeprom<I> {
    pub fn new(i2c: I, address: u8, capacity: u32) -> Self {
        Self { i2c, address, capacity }
    }

    fn check_bounds(&self, offset: u32, len: usize) -> Result<(), NvmError> {
        match offset.checked_add(len as u32) {
            Some(end) if end <= self.capacity => Ok(()),
            _ => Err(NvmError::OutOfBounds),
        }
    }

    fn wait_until_ready(&mut self) -> Result<(), NvmError> {
        for _ in 0..EEPROM_WRITE_POLLS {
            if self.i2c.write(self.address, &[]).is_ok() {
                return Ok(());
            }
        }
        Err(NvmError::Device)
    }
}

impl<I: I2c> NvmBase for I2cEeprom<I> {
    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), NvmError> {
        self.check_bounds(offset, bytes.len())?;
        let address = (offset as u16).to_be_bytes();
        self.i2c
            .write_read(self.address, &address, bytes)
            .map_err(|_| NvmError::Device)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), NvmError> {
        self.check_bounds(offset, bytes.len())?;
        let mut offset = offset;
        let mut remaining = bytes;
        while !remaining.is_empty() {
            // a page write wraps around at the page boundary
            let room = EEPROM_PAGE_SIZE - (offset as usize % EEPROM_PAGE_SIZE);
            let (chunk, rest) = remaining.split_at(room.min(remaining.len()));
            let mut buf = [0u8; EEPROM_PAGE_SIZE + 2];
            buf[..2].copy_from_slice(&(offset as u16).to_be_bytes());
            buf[2..2 + chunk.len()].copy_from_slice(chunk);
            self.i2c
                .write(self.address, &buf[..2 + chunk.len()])
                .map_err(|_| NvmError::Device)?;
            self.wait_until_ready()?;
            offset += chunk.len() as u32;
            remaining = rest;
        }
        Ok(())
    }

    // eeprom cells are rewritten in place
    fn erase_and_write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), NvmError> {
        self.write(offset, bytes)
    }
}

#[macro_export]
macro_rules! init_output_pin {
    ($pin: expr, $level: expr) => {
        app::OutputPinWrapper::new(Output::new($pin, $level, PinSpeed::VeryHigh))
    };
}
