use common::{OutputPinBase, PwmBase};
use math::common::round;

use crate::config::MotionConfig;
use crate::{Axis, Direction};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriveCurrent {
    Idle,
    Active,
}

// the drivers read their current limit from an RC filtered pwm output
pub fn compute_vref_duty(voltage: f32, mcu_voltage: f32, max_duty: u64) -> u64 {
    let ratio = (voltage / mcu_voltage).clamp(0.0, 1.0);
    round(ratio * max_duty as f32) as u64
}

/// Direction pins and drive current of the four stepper drivers.
pub struct MotorDriver<P: OutputPinBase, W: PwmBase> {
    direction_pins: [P; 4],
    vref: W,
    vref_channels: [W::Channel; 4],
    positive_is_high: [bool; 4],
    vref_duties: [(u64, u64); 4],
}

impl<P: OutputPinBase, W: PwmBase> MotorDriver<P, W> {
    pub fn new(direction_pins: [P; 4], mut vref: W, vref_channels: [W::Channel; 4], config: &MotionConfig) -> Self {
        let max_duty = vref.get_max_duty();
        let mut positive_is_high = [false; 4];
        let mut vref_duties = [(0, 0); 4];
        for axis in Axis::ALL {
            let axis_config = config.get_axis(axis);
            positive_is_high[axis.index()] = axis_config.positive_is_high;
            vref_duties[axis.index()] = (
                compute_vref_duty(axis_config.vref_idle, config.mcu_voltage, max_duty),
                compute_vref_duty(axis_config.vref_active, config.mcu_voltage, max_duty),
            );
        }
        for channel in vref_channels {
            vref.enable(channel);
        }

        let mut driver = Self {
            direction_pins,
            vref,
            vref_channels,
            positive_is_high,
            vref_duties,
        };
        for axis in Axis::ALL {
            driver.set_current(axis, DriveCurrent::Idle);
        }
        driver
    }

    pub fn set_direction(&mut self, axis: Axis, direction: Direction) {
        let high = match direction {
            Direction::Positive => self.positive_is_high[axis.index()],
            Direction::Negative => !self.positive_is_high[axis.index()],
        };
        let pin = &mut self.direction_pins[axis.index()];
        if high {
            pin.set_high();
        } else {
            pin.set_low();
        }
    }

    pub fn get_direction(&self, axis: Axis) -> Direction {
        if self.direction_pins[axis.index()].is_high() == self.positive_is_high[axis.index()] {
            Direction::Positive
        } else {
            Direction::Negative
        }
    }

    pub fn set_current(&mut self, axis: Axis, current: DriveCurrent) {
        let (idle, active) = self.vref_duties[axis.index()];
        let duty = match current {
            DriveCurrent::Idle => idle,
            DriveCurrent::Active => active,
        };
        self.vref.set_duty(self.vref_channels[axis.index()], duty);
    }
}
