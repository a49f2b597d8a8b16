use core::marker::PhantomData;
use core::ops::BitOr;

use common::{AccelerometerBase, NvmBase, OutputPinBase, PwmBase, StepTimerBase, TimerBase};
use leveling::BedGeometry;
use math::common::millimeters_per_minute;
use nvm::{NvmExt, NvmField, SharedNvm};

use crate::axis::MotionState;
use crate::calibration::JerkDetector;
use crate::compensation::load_bed_geometry;
use crate::config::MotionConfig;
use crate::driver::{DriveCurrent, MotorDriver};
use crate::plan::{get_effective_feed_rate, plan_move, AxisRequest, MovePlan};
use crate::scheduler::StepScheduler;
use crate::{Axis, Direction, MotionError};

#[cfg(feature = "defmt-log")]
use defmt::{debug, error};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
pub enum Positioning {
    Relative,
    Absolute,
}

/// Optional processing applied around a host move.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MoveTasks(u8);

impl MoveTasks {
    pub const NONE: MoveTasks = MoveTasks(0);
    pub const BACKLASH: MoveTasks = MoveTasks(1);
    pub const BED_LEVELING: MoveTasks = MoveTasks(1 << 1);
    pub const ALL: MoveTasks = MoveTasks(Self::BACKLASH.0 | Self::BED_LEVELING.0);

    pub fn contains(&self, other: MoveTasks) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for MoveTasks {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        MoveTasks(self.0 | rhs.0)
    }
}

/// A linear move as received from the host, absent axes do not move.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MoveCommand {
    pub x: Option<f32>,
    pub y: Option<f32>,
    pub z: Option<f32>,
    pub e: Option<f32>,
    // mm/min
    pub feed_rate: Option<f32>,
    pub positioning: Option<Positioning>,
}

impl MoveCommand {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn x(mut self, value: f32) -> Self {
        self.x = Some(value);
        self
    }

    pub fn y(mut self, value: f32) -> Self {
        self.y = Some(value);
        self
    }

    pub fn z(mut self, value: f32) -> Self {
        self.z = Some(value);
        self
    }

    pub fn e(mut self, value: f32) -> Self {
        self.e = Some(value);
        self
    }

    pub fn feed_rate(mut self, value: f32) -> Self {
        self.feed_rate = Some(value);
        self
    }

    pub fn positioning(mut self, value: Positioning) -> Self {
        self.positioning = Some(value);
        self
    }

    pub fn get(&self, axis: Axis) -> Option<f32> {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
            Axis::E => self.e,
        }
    }
}

/// Outcome of a move that ran without errors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MoveReport {
    stopped_early: [bool; 4],
}

impl MoveReport {
    // true when a jerk detector stopped the axis before its last step
    pub fn was_stopped_early(&self, axis: Axis) -> bool {
        self.stopped_early[axis.index()]
    }

    pub fn is_complete(&self) -> bool {
        !self.stopped_early.iter().any(|s| *s)
    }
}

/// Settings stored in the nvm, loaded once and after every change.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Settings {
    pub steps_per_mm: [f32; 4],
    pub speed_limits: [f32; 4],
    pub e_negative_speed_limit: f32,
    pub backlash: [f32; 2],
    pub backlash_speed: f32,
    pub jerk_sensitivity: [u8; 3],
    pub bed_height_offset: f32,
    pub bed_orientation_version: u8,
}

fn positive_or(value: f32, default: f32) -> f32 {
    if value > 0.0 {
        value
    } else {
        default
    }
}

impl Settings {
    pub fn from_config(config: &MotionConfig) -> Self {
        let axis = |a: Axis| config.get_axis(a);
        Self {
            steps_per_mm: Axis::ALL.map(|a| axis(a).steps_per_mm),
            speed_limits: Axis::ALL.map(|a| millimeters_per_minute(axis(a).speed_limit)),
            e_negative_speed_limit: millimeters_per_minute(axis(Axis::E).speed_limit_negative),
            backlash: [
                math::common::millimeters(config.backlash.x),
                math::common::millimeters(config.backlash.y),
            ],
            backlash_speed: millimeters_per_minute(config.backlash.speed),
            jerk_sensitivity: [Axis::X, Axis::Y, Axis::Z].map(|a| axis(a).jerk_sensitivity),
            bed_height_offset: 0.0,
            bed_orientation_version: 0,
        }
    }

    pub fn load<S: NvmBase>(nvm: &mut S, config: &MotionConfig) -> Self {
        let d = Self::from_config(config);
        let steps_per_mm = [
            NvmField::XStepsPerMm,
            NvmField::YStepsPerMm,
            NvmField::ZStepsPerMm,
            NvmField::EStepsPerMm,
        ];
        let speed_limits = [
            NvmField::XSpeedLimit,
            NvmField::YSpeedLimit,
            NvmField::ZSpeedLimit,
            NvmField::EPositiveSpeedLimit,
        ];
        let jerk = [
            NvmField::XJerkSensitivity,
            NvmField::YJerkSensitivity,
            NvmField::ZJerkSensitivity,
        ];

        let mut settings = d;
        for i in 0..4 {
            settings.steps_per_mm[i] = positive_or(nvm.read_f32_or(steps_per_mm[i], d.steps_per_mm[i]), d.steps_per_mm[i]);
            settings.speed_limits[i] = positive_or(nvm.read_f32_or(speed_limits[i], d.speed_limits[i]), d.speed_limits[i]);
        }
        for i in 0..3 {
            settings.jerk_sensitivity[i] = nvm.read_u8_or(jerk[i], d.jerk_sensitivity[i]);
        }
        settings.e_negative_speed_limit = positive_or(
            nvm.read_f32_or(NvmField::ENegativeSpeedLimit, d.e_negative_speed_limit),
            d.e_negative_speed_limit,
        );
        settings.backlash = [
            nvm.read_f32_or(NvmField::BacklashX, d.backlash[0]),
            nvm.read_f32_or(NvmField::BacklashY, d.backlash[1]),
        ];
        settings.backlash_speed = positive_or(nvm.read_f32_or(NvmField::BacklashSpeed, d.backlash_speed), d.backlash_speed);
        settings.bed_height_offset = nvm.read_f32_or(NvmField::BedHeightOffset, 0.0);
        settings.bed_orientation_version = nvm.read_u8(NvmField::BedOrientationVersion).unwrap_or(0);
        settings
    }

    pub fn get_speed_limit(&self, axis: Axis, direction: Direction) -> f32 {
        match (axis, direction) {
            (Axis::E, Direction::Negative) => self.e_negative_speed_limit,
            _ => self.speed_limits[axis.index()],
        }
    }
}

/// Foreground side of the motion core: owns the logical coordinates, plans
/// every move and waits for the scheduler to run it.
pub struct Motors<'a, P, W, K, A, S, T>
where
    P: OutputPinBase,
    W: PwmBase,
    K: StepTimerBase,
    A: AccelerometerBase,
    S: NvmBase,
    T: TimerBase,
{
    pub(crate) scheduler: &'a StepScheduler<P>,
    pub(crate) driver: MotorDriver<P, W>,
    step_timer: K,
    pub(crate) accelerometer: A,
    pub(crate) nvm: &'a SharedNvm<S>,
    state: &'a MotionState,
    pub(crate) config: MotionConfig,
    pub(crate) settings: Settings,
    pub(crate) bed: BedGeometry,
    values: [f32; 4],
    remainders: [f32; 4],
    e_direction: Direction,
    // physical Z minus logical Z, the leveling correction the carriage currently sits at
    pub(crate) z_offset: f32,
    feed_rate: f32,
    positioning: Positioning,
    _timer: PhantomData<T>,
}

impl<'a, P, W, K, A, S, T> Motors<'a, P, W, K, A, S, T>
where
    P: OutputPinBase,
    W: PwmBase,
    K: StepTimerBase,
    A: AccelerometerBase,
    S: NvmBase,
    T: TimerBase,
{
    /// `state` must have been restored from the nvm already.
    pub fn new(
        scheduler: &'a StepScheduler<P>,
        driver: MotorDriver<P, W>,
        step_timer: K,
        accelerometer: A,
        nvm: &'a SharedNvm<S>,
        state: &'a MotionState,
        config: MotionConfig,
    ) -> Self {
        let mut values = [0.0; 4];
        for axis in [Axis::X, Axis::Y, Axis::Z] {
            if let Some(s) = state.get(axis) {
                values[axis.index()] = s.get_value();
            }
        }
        Motors {
            scheduler,
            driver,
            step_timer,
            accelerometer,
            nvm,
            state,
            settings: Settings::from_config(&config),
            bed: BedGeometry::flat(config.bed.layout),
            feed_rate: millimeters_per_minute(config.feed_rate),
            config,
            values,
            remainders: [0.0; 4],
            e_direction: Direction::Positive,
            z_offset: 0.0,
            positioning: Positioning::Absolute,
            _timer: PhantomData,
        }
    }

    /// Reads the stored settings and bed orientation.
    ///
    /// The carriage is assumed to sit where the leveling would have put it.
    pub async fn load_settings(&mut self) {
        {
            let mut nvm = self.nvm.lock().await;
            self.settings = Settings::load(&mut *nvm, &self.config);
            self.bed = load_bed_geometry(&mut *nvm, self.config.bed.layout);
        }
        self.z_offset = self.get_leveling_offset(self.values[Axis::X.index()], self.values[Axis::Y.index()]);
    }

    pub fn get_position(&self, axis: Axis) -> f32 {
        self.values[axis.index()]
    }

    pub fn is_valid(&self, axis: Axis) -> bool {
        self.state.get(axis).map(|s| s.is_valid()).unwrap_or(true)
    }

    pub fn get_direction(&self, axis: Axis) -> Direction {
        match self.state.get(axis) {
            Some(s) => s.get_direction(),
            None => self.e_direction,
        }
    }

    pub fn get_feed_rate(&self) -> f32 {
        self.feed_rate
    }

    pub fn get_positioning(&self) -> Positioning {
        self.positioning
    }

    pub fn set_positioning(&mut self, positioning: Positioning) {
        self.positioning = positioning;
    }

    pub fn get_bed_geometry(&self) -> &BedGeometry {
        &self.bed
    }

    pub fn get_z_offset(&self) -> f32 {
        self.z_offset
    }

    pub fn get_config(&self) -> &MotionConfig {
        &self.config
    }

    pub fn emergency_stop(&self) {
        self.scheduler.emergency_stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.scheduler.is_stopped()
    }

    pub(crate) fn set_value(&mut self, axis: Axis, value: f32) {
        self.values[axis.index()] = value;
        if let Some(s) = self.state.get(axis) {
            s.set_value(value);
        }
    }

    pub(crate) fn set_valid(&mut self, axis: Axis, valid: bool) {
        if let Some(s) = self.state.get(axis) {
            s.set_valid(valid);
        }
    }

    fn set_direction(&mut self, axis: Axis, direction: Direction) {
        match self.state.get(axis) {
            Some(s) => s.set_direction(direction),
            None => self.e_direction = direction,
        }
    }

    pub(crate) fn get_values(&self) -> [f32; 4] {
        self.values
    }

    fn get_steps_per_unit(&self, axis: Axis) -> f32 {
        self.settings.steps_per_mm[axis.index()] * self.config.get_microsteps()
    }

    fn get_axis_feed_rate(&self, axis: Axis, direction: Direction, requested: f32) -> f32 {
        let axis_config = self.config.get_axis(axis);
        get_effective_feed_rate(
            requested,
            self.settings.get_speed_limit(axis, direction),
            axis_config.get_min_feed_rate(),
            axis_config.get_max_feed_rate(direction),
        )
    }

    /// Moves the axes to `targets` in a straight line, see [`MoveTasks`] for
    /// the optional backlash and leveling processing.
    ///
    /// Clears a pending emergency stop once the move is known to be plannable.
    pub async fn plan_and_execute(&mut self, command: &MoveCommand, tasks: MoveTasks) -> Result<(), MotionError> {
        let positioning = command.positioning.unwrap_or(self.positioning);
        let feed_rate = command.feed_rate.unwrap_or(self.feed_rate);

        let start = self.values;
        let mut targets = start;
        for axis in Axis::ALL {
            if let Some(value) = command.get(axis) {
                let i = axis.index();
                targets[i] = match positioning {
                    Positioning::Relative => start[i] + value,
                    Positioning::Absolute => value,
                };
            }
        }

        let leveling = tasks.contains(MoveTasks::BED_LEVELING);
        if leveling {
            self.clamp_to_bed(&mut targets);
        }
        let leveling = leveling && self.is_bed_leveling_active();
        let end_offset = if leveling {
            self.get_leveling_offset(targets[Axis::X.index()], targets[Axis::Y.index()])
        } else {
            self.z_offset
        };

        // nothing is committed when the move cannot be planned
        if let Err(e) = self.plan(&targets, end_offset, feed_rate) {
            #[cfg(feature = "defmt-log")]
            error!("move rejected: {}", e);
            return Err(e);
        }
        self.positioning = positioning;
        self.feed_rate = feed_rate;
        self.scheduler.clear_stop();

        if tasks.contains(MoveTasks::BACKLASH) {
            self.compensate_for_backlash(&targets).await?;
        }
        if leveling {
            self.compensate_for_bed_leveling(start, targets, feed_rate).await
        } else {
            self.move_axes(targets, feed_rate, None).await.map(|_| ())
        }
    }

    pub(crate) fn plan(&self, targets: &[f32; 4], z_offset: f32, feed_rate: f32) -> Result<MovePlan, MotionError> {
        let mut requests = [None; 4];
        for axis in Axis::ALL {
            let i = axis.index();
            let mut distance = targets[i] - self.values[i];
            if axis == Axis::Z {
                distance += z_offset - self.z_offset;
            }
            requests[i] = Some(AxisRequest {
                distance,
                steps_per_unit: self.get_steps_per_unit(axis),
                remainder: self.remainders[i],
                previous_direction: self.get_direction(axis),
                feed_rate: self.get_axis_feed_rate(axis, Direction::from_delta(distance), feed_rate),
            });
        }
        plan_move(requests, self.step_timer.get_ticks_per_second() as f32)
    }

    /// Moves to `targets` keeping the current leveling correction.
    pub(crate) async fn move_axes(
        &mut self,
        targets: [f32; 4],
        feed_rate: f32,
        detector: Option<JerkDetector>,
    ) -> Result<MoveReport, MotionError> {
        let z_offset = self.z_offset;
        self.move_physical(targets, z_offset, feed_rate, detector).await
    }

    /// Moves to `targets` with the carriage ending at `targets[Z] + z_offset`.
    ///
    /// Validity of the moving axes is cleared while the move runs and given
    /// back only when every axis reached its target. An axis stopped by
    /// `detector` keeps the position its executed steps lead to.
    pub(crate) async fn move_physical(
        &mut self,
        targets: [f32; 4],
        z_offset: f32,
        feed_rate: f32,
        detector: Option<JerkDetector>,
    ) -> Result<MoveReport, MotionError> {
        if self.scheduler.is_stopped() {
            return Err(MotionError::EmergencyStop);
        }
        let plan = self.plan(&targets, z_offset, feed_rate)?;

        let start = self.values;
        let start_z_offset = self.z_offset;
        let mut validity = [true; 4];
        for axis in Axis::ALL {
            let Some(axis_plan) = plan.get(axis) else {
                continue;
            };
            let i = axis.index();
            validity[i] = self.is_valid(axis);
            self.set_valid(axis, false);
            self.set_value(axis, targets[i]);
            self.remainders[i] = axis_plan.remainder;
            self.set_direction(axis, axis_plan.direction);
            self.driver.set_direction(axis, axis_plan.direction);
            if axis_plan.get_steps() > 0 {
                self.driver.set_current(axis, DriveCurrent::Active);
                self.scheduler.arm(axis, axis_plan.timing);
            }
        }
        // a z target matching the offset change leaves the carriage in place
        self.set_value(Axis::Z, targets[Axis::Z.index()]);
        self.z_offset = z_offset;

        let waited = if self.scheduler.any_armed() {
            self.scheduler.enable_drivers();
            self.step_timer.start();
            let waited = self.wait_for_completion(detector).await;
            self.step_timer.stop();
            waited
        } else {
            Ok(())
        };
        self.scheduler.disarm_all();

        let mut report = MoveReport::default();
        for axis in Axis::ALL {
            let Some(axis_plan) = plan.get(axis) else {
                continue;
            };
            let i = axis.index();
            self.driver.set_current(axis, DriveCurrent::Idle);
            let remaining = self.scheduler.get_remaining_steps(axis);
            if axis_plan.get_steps() == 0 || remaining == 0 {
                continue;
            }
            let executed = (axis_plan.get_steps() - remaining) as f32;
            let travelled = executed / self.get_steps_per_unit(axis) * axis_plan.direction.get_sign();
            let value = match axis {
                Axis::Z => start[i] + start_z_offset + travelled - self.z_offset,
                _ => start[i] + travelled,
            };
            self.set_value(axis, value);
            self.remainders[i] = 0.0;
            report.stopped_early[i] = true;
        }

        waited?;
        if self.scheduler.is_stopped() {
            return Err(MotionError::EmergencyStop);
        }
        if report.is_complete() {
            for axis in Axis::ALL {
                if plan.get(axis).is_some() {
                    self.set_valid(axis, validity[axis.index()]);
                }
            }
        }
        Ok(report)
    }

    // the only place where the foreground waits for the steppers
    async fn wait_for_completion(&mut self, mut detector: Option<JerkDetector>) -> Result<(), MotionError> {
        while self.scheduler.any_armed() && !self.scheduler.is_stopped() {
            self.step_timer.next_tick().await;

            let Some(detector) = detector.as_mut() else {
                continue;
            };
            let axis = detector.get_axis();
            if !self.scheduler.is_armed(axis) {
                continue;
            }
            let values = match self.accelerometer.read_values() {
                Ok(values) => values,
                Err(_) => {
                    self.scheduler.disarm_all();
                    return Err(MotionError::AccelerometerFault);
                }
            };
            if detector.sample(values) {
                #[cfg(feature = "defmt-log")]
                debug!("jerk detected on axis {}", axis);
                self.scheduler.disarm(axis);
            }
        }
        Ok(())
    }
}
