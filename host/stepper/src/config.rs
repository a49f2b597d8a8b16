use core::time::Duration;

use common::AccelerometerAxis;
use leveling::BedLayout;
use math::common::{millimeters, millimeters_per_minute, speed_from_millimeters_per_minute};
use math::measurements::{Length, Speed};
use math::vector::Vector2D;

use crate::{Axis, Direction};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SteppingMode {
    FullStep,
    HalfStep,
    QuarterStep,
    EighthStep,
    SixteenthStep,
    ThirtySecondStep,
}

impl From<SteppingMode> for u8 {
    fn from(value: SteppingMode) -> Self {
        match value {
            SteppingMode::FullStep => 1,
            SteppingMode::HalfStep => 1 << 1,
            SteppingMode::QuarterStep => 1 << 2,
            SteppingMode::EighthStep => 1 << 3,
            SteppingMode::SixteenthStep => 1 << 4,
            SteppingMode::ThirtySecondStep => 1 << 5,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AxisConfig {
    // used until a value is stored in the nvm
    pub steps_per_mm: f32,
    pub min_feed_rate: Speed,
    pub max_feed_rate: Speed,
    // only differs from the positive one on the extruder (retraction)
    pub max_feed_rate_negative: Speed,
    pub speed_limit: Speed,
    pub speed_limit_negative: Speed,
    // level of the direction pin that moves the axis towards positive values
    pub positive_is_high: bool,
    // driver reference voltage, in volts
    pub vref_idle: f32,
    pub vref_active: f32,
    pub jerk_sensitivity: u8,
    pub accelerometer_axis: AccelerometerAxis,
}

impl AxisConfig {
    pub fn get_max_feed_rate(&self, direction: Direction) -> f32 {
        match direction {
            Direction::Positive => millimeters_per_minute(self.max_feed_rate),
            Direction::Negative => millimeters_per_minute(self.max_feed_rate_negative),
        }
    }

    pub fn get_min_feed_rate(&self) -> f32 {
        millimeters_per_minute(self.min_feed_rate)
    }
}

/// Allowed XY area while Z stays below `max_z`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BedZone {
    pub max_z: f32,
    pub min: Vector2D,
    pub max: Vector2D,
}

#[derive(Clone, Copy, Debug)]
pub struct BedConfig {
    pub layout: BedLayout,
    // from the lowest to the highest
    pub zones: [BedZone; 3],
    pub segment_length: Length,
}

impl BedConfig {
    pub fn get_zone(&self, z: f32) -> &BedZone {
        self.zones
            .iter()
            .find(|zone| z < zone.max_z)
            .unwrap_or(&self.zones[self.zones.len() - 1])
    }
}

#[derive(Clone, Copy, Debug)]
pub struct HomingConfig {
    pub feed_rate: Speed,
    // longer than the axis, the carriage stops against the frame
    pub x_travel: Length,
    pub y_travel: Length,
    // relative move from the homed corner to the bed center
    pub center_offset: Vector2D,
}

impl HomingConfig {
    pub fn get_travel(&self, axis: Axis) -> f32 {
        match axis {
            Axis::X => millimeters(self.x_travel),
            Axis::Y => millimeters(self.y_travel),
            Axis::Z | Axis::E => 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Z0Config {
    pub probe_depth: Length,
    pub probe_feed_rate: Speed,
    pub bounce_height: Length,
    pub tolerance: Length,
    // extra push after the bed has been found, compensates the frame compliance
    pub compliance_correction: Length,
    pub max_travel: Length,
    pub max_probes: u8,
    pub settle: Duration,
}

#[derive(Clone, Copy, Debug)]
pub struct CalibrationConfig {
    pub travel_height: Length,
    pub travel_feed_rate: Speed,
    pub corner_feed_rate: Speed,
}

#[derive(Clone, Copy, Debug)]
pub struct BacklashConfig {
    pub x: Length,
    pub y: Length,
    pub speed: Speed,
}

#[derive(Clone, Copy, Debug)]
pub struct MotionConfig {
    pub axes: [AxisConfig; 4],
    pub stepping_mode: SteppingMode,
    pub mcu_voltage: f32,
    pub feed_rate: Speed,
    pub backlash: BacklashConfig,
    pub bed: BedConfig,
    pub homing: HomingConfig,
    pub z0: Z0Config,
    pub calibration: CalibrationConfig,
}

impl MotionConfig {
    pub fn get_axis(&self, axis: Axis) -> &AxisConfig {
        &self.axes[axis.index()]
    }

    pub fn get_microsteps(&self) -> f32 {
        f32::from(u8::from(self.stepping_mode))
    }
}

fn mm_per_minute(value: f32) -> Speed {
    speed_from_millimeters_per_minute(value)
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            axes: [
                AxisConfig {
                    steps_per_mm: 19.3067875,
                    min_feed_rate: mm_per_minute(120.0),
                    max_feed_rate: mm_per_minute(4800.0),
                    max_feed_rate_negative: mm_per_minute(4800.0),
                    speed_limit: mm_per_minute(1500.0),
                    speed_limit_negative: mm_per_minute(1500.0),
                    positive_is_high: false,
                    vref_idle: 0.34600939,
                    vref_active: 0.361502347,
                    jerk_sensitivity: 20,
                    accelerometer_axis: AccelerometerAxis::X,
                },
                AxisConfig {
                    steps_per_mm: 18.00885,
                    min_feed_rate: mm_per_minute(120.0),
                    max_feed_rate: mm_per_minute(4800.0),
                    max_feed_rate_negative: mm_per_minute(4800.0),
                    speed_limit: mm_per_minute(1500.0),
                    speed_limit_negative: mm_per_minute(1500.0),
                    positive_is_high: true,
                    vref_idle: 0.34600939,
                    vref_active: 0.41314554,
                    jerk_sensitivity: 20,
                    accelerometer_axis: AccelerometerAxis::Y,
                },
                AxisConfig {
                    steps_per_mm: 646.3295,
                    min_feed_rate: mm_per_minute(30.0),
                    max_feed_rate: mm_per_minute(60.0),
                    max_feed_rate_negative: mm_per_minute(60.0),
                    speed_limit: mm_per_minute(60.0),
                    speed_limit_negative: mm_per_minute(60.0),
                    positive_is_high: true,
                    vref_idle: 0.098122066,
                    vref_active: 0.325352113,
                    jerk_sensitivity: 3,
                    accelerometer_axis: AccelerometerAxis::Z,
                },
                AxisConfig {
                    steps_per_mm: 128.451375,
                    min_feed_rate: mm_per_minute(60.0),
                    max_feed_rate: mm_per_minute(600.0),
                    max_feed_rate_negative: mm_per_minute(720.0),
                    speed_limit: mm_per_minute(102.0),
                    speed_limit_negative: mm_per_minute(360.0),
                    positive_is_high: false,
                    vref_idle: 0.149765258,
                    vref_active: 0.247887324,
                    jerk_sensitivity: 20,
                    accelerometer_axis: AccelerometerAxis::X,
                },
            ],
            stepping_mode: SteppingMode::ThirtySecondStep,
            mcu_voltage: 3.3,
            feed_rate: mm_per_minute(1000.0),
            backlash: BacklashConfig {
                x: Length::from_millimeters(0.3),
                y: Length::from_millimeters(0.6),
                speed: mm_per_minute(1500.0),
            },
            bed: BedConfig {
                layout: BedLayout::default(),
                zones: [
                    BedZone {
                        max_z: 5.0,
                        min: Vector2D::new(-2.0, -2.0),
                        max: Vector2D::new(106.0, 105.0),
                    },
                    BedZone {
                        max_z: 73.5,
                        min: Vector2D::new(-2.0, -9.5),
                        max: Vector2D::new(106.0, 105.0),
                    },
                    BedZone {
                        max_z: f32::INFINITY,
                        min: Vector2D::new(7.0, 9.5),
                        max: Vector2D::new(97.0, 85.0),
                    },
                ],
                segment_length: Length::from_millimeters(2.0),
            },
            homing: HomingConfig {
                feed_rate: mm_per_minute(3000.0),
                x_travel: Length::from_millimeters(112.0),
                y_travel: Length::from_millimeters(111.0),
                center_offset: Vector2D::new(-54.0, -50.0),
            },
            z0: Z0Config {
                probe_depth: Length::from_millimeters(5.0),
                probe_feed_rate: mm_per_minute(30.0),
                bounce_height: Length::from_millimeters(2.0),
                tolerance: Length::from_millimeters(1.0),
                compliance_correction: Length::from_millimeters(0.1),
                max_travel: Length::from_millimeters(100.0),
                max_probes: 32,
                settle: Duration::from_millis(100),
            },
            calibration: CalibrationConfig {
                travel_height: Length::from_millimeters(3.0),
                travel_feed_rate: mm_per_minute(90.0),
                corner_feed_rate: mm_per_minute(3000.0),
            },
        }
    }
}
