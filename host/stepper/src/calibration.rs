use common::{
    AccelerationValues, AccelerometerAxis, AccelerometerBase, NvmBase, OutputPinBase, PwmBase, StepTimerBase,
    TimerBase,
};
use leveling::BedCorner;
use math::common::{abs, millimeters, millimeters_per_minute};
use nvm::{NvmExt, NvmField, BED_ORIENTATION_VERSION};

use crate::planner::Motors;
use crate::{Axis, MotionError};

#[cfg(feature = "defmt-log")]
use defmt::{debug, info, warn};

// consecutive samples over the threshold that count as a hit
const JERK_HITS: u8 = 2;
// consecutive probes reaching the same height that end the Z0 search
const Z0_MATCHES: u8 = 2;

const CORNER_ORDER: [BedCorner; 4] = [
    BedCorner::FrontLeft,
    BedCorner::FrontRight,
    BedCorner::BackRight,
    BedCorner::BackLeft,
];

/// Watches one accelerometer axis while a motor runs into something.
///
/// The jerk is the change between two consecutive samples; it has to exceed
/// the threshold twice in a row before the axis is reported as stopped.
#[derive(Clone, Copy, Debug)]
pub struct JerkDetector {
    axis: Axis,
    accelerometer_axis: AccelerometerAxis,
    threshold: i32,
    previous: i16,
    hits: u8,
}

impl JerkDetector {
    pub fn new(axis: Axis, accelerometer_axis: AccelerometerAxis, threshold: u8, baseline: AccelerationValues) -> Self {
        Self {
            axis,
            accelerometer_axis,
            threshold: i32::from(threshold.max(1)),
            previous: baseline.get(accelerometer_axis),
            hits: 0,
        }
    }

    pub fn get_axis(&self) -> Axis {
        self.axis
    }

    pub fn sample(&mut self, values: AccelerationValues) -> bool {
        let value = values.get(self.accelerometer_axis);
        let jerk = (i32::from(value) - i32::from(self.previous)).abs();
        self.previous = value;
        if jerk >= self.threshold {
            self.hits = self.hits.saturating_add(1);
        } else {
            self.hits = 0;
        }
        self.hits >= JERK_HITS
    }
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
    // the baseline sample is taken before the motor starts
    fn jerk_detector(&mut self, axis: Axis) -> Result<JerkDetector, MotionError> {
        let baseline = self
            .accelerometer
            .read_values()
            .map_err(|_| MotionError::AccelerometerFault)?;
        let threshold = self
            .settings
            .jerk_sensitivity
            .get(axis.index())
            .copied()
            .unwrap_or(u8::MAX);
        Ok(JerkDetector::new(
            axis,
            self.config.get_axis(axis).accelerometer_axis,
            threshold,
            baseline,
        ))
    }

    /// Runs Y and then X against the frame and moves to the bed center.
    ///
    /// With `adjust_height` logical Z is re-based on the leveling correction
    /// at the center, the carriage height does not change.
    pub async fn home_xy(&mut self, adjust_height: bool) -> Result<(), MotionError> {
        self.scheduler.clear_stop();
        self.home(adjust_height).await
    }

    async fn home(&mut self, adjust_height: bool) -> Result<(), MotionError> {
        #[cfg(feature = "defmt-log")]
        info!("homing started");
        let feed_rate = millimeters_per_minute(self.config.homing.feed_rate);

        for axis in [Axis::Y, Axis::X] {
            let mut targets = self.get_values();
            targets[axis.index()] += self.config.homing.get_travel(axis);
            let detector = self.jerk_detector(axis)?;
            let _report = self.move_axes(targets, feed_rate, Some(detector)).await?;
            #[cfg(feature = "defmt-log")]
            {
                if !_report.was_stopped_early(axis) {
                    warn!("axis {} did not hit the frame", axis);
                }
            }
        }

        let offset = self.config.homing.center_offset;
        let mut targets = self.get_values();
        targets[Axis::X.index()] += offset.get_x();
        targets[Axis::Y.index()] += offset.get_y();
        self.move_axes(targets, feed_rate, None).await?;

        let center = self.config.bed.layout.center;
        self.set_value(Axis::X, center.get_x());
        self.set_value(Axis::Y, center.get_y());
        self.set_valid(Axis::X, true);
        self.set_valid(Axis::Y, true);
        if adjust_height {
            self.rebase_z();
        }
        #[cfg(feature = "defmt-log")]
        info!("homing completed");
        Ok(())
    }

    /// Probes down until the bed is reached at the same height twice in a row
    /// and returns the final Z, after the compliance correction.
    pub async fn move_to_z0(&mut self) -> Result<f32, MotionError> {
        self.scheduler.clear_stop();
        self.find_z0().await
    }

    async fn find_z0(&mut self) -> Result<f32, MotionError> {
        let z0 = self.config.z0;
        let probe_depth = millimeters(z0.probe_depth);
        let feed_rate = millimeters_per_minute(z0.probe_feed_rate);
        let bounce = millimeters(z0.bounce_height);
        let tolerance = millimeters(z0.tolerance);

        let start = self.get_position(Axis::Z);
        let valid = self.is_valid(Axis::Z);
        let floor = start - millimeters(z0.max_travel);
        let mut previous: Option<f32> = None;
        let mut matches = 0;
        let mut probes: u32 = 0;

        loop {
            probes += 1;
            if probes > u32::from(z0.max_probes) {
                #[cfg(feature = "defmt-log")]
                warn!("Z0 not found after {} probes", z0.max_probes);
                return Err(MotionError::Z0NotFound);
            }
            T::after(z0.settle).await;

            let mut targets = self.get_values();
            targets[Axis::Z.index()] -= probe_depth;
            let detector = self.jerk_detector(Axis::Z)?;
            self.move_axes(targets, feed_rate, Some(detector)).await?;

            let z = self.get_position(Axis::Z);
            #[cfg(feature = "defmt-log")]
            debug!("Z0 probe {} reached {}", probes, z);
            if z < floor {
                #[cfg(feature = "defmt-log")]
                warn!("Z0 search left the travel range");
                return Err(MotionError::Z0NotFound);
            }
            matches = match previous {
                Some(p) if abs(p - z) <= tolerance => matches + 1,
                _ => 0,
            };
            previous = Some(z);
            if matches >= Z0_MATCHES {
                break;
            }

            let mut targets = self.get_values();
            targets[Axis::Z.index()] = (z + bounce).min(start);
            self.move_axes(targets, feed_rate, None).await?;
        }

        let mut targets = self.get_values();
        targets[Axis::Z.index()] -= millimeters(z0.compliance_correction);
        self.move_axes(targets, feed_rate, None).await?;
        self.set_valid(Axis::Z, valid);
        Ok(self.get_position(Axis::Z))
    }

    /// Absolute Z move at the calibration travel feed.
    pub async fn move_to_height(&mut self, height: f32) -> Result<(), MotionError> {
        self.scheduler.clear_stop();
        self.raise_to(height).await
    }

    async fn raise_to(&mut self, height: f32) -> Result<(), MotionError> {
        let mut targets = self.get_values();
        targets[Axis::Z.index()] = height;
        let feed_rate = millimeters_per_minute(self.config.calibration.travel_feed_rate);
        self.move_axes(targets, feed_rate, None).await.map(|_| ())
    }

    /// Declares the carriage to be on the bed surface.
    pub fn save_z_as_bed_center_z0(&mut self) {
        let values = self.get_values();
        self.z_offset = self.get_leveling_offset(values[Axis::X.index()], values[Axis::Y.index()]);
        self.set_value(Axis::Z, -self.z_offset);
        self.set_valid(Axis::Z, true);
    }

    pub async fn calibrate_bed_center_z0(&mut self) -> Result<(), MotionError> {
        self.scheduler.clear_stop();
        self.calibrate_center().await
    }

    async fn calibrate_center(&mut self) -> Result<(), MotionError> {
        #[cfg(feature = "defmt-log")]
        info!("bed center calibration started");
        let height = millimeters(self.config.calibration.travel_height);
        self.raise_to(height).await?;
        self.home(false).await?;
        self.find_z0().await?;
        self.save_z_as_bed_center_z0();
        self.raise_to(height).await?;
        #[cfg(feature = "defmt-log")]
        info!("bed center calibration completed");
        Ok(())
    }

    /// Measures the four corners against the bed center.
    ///
    /// Every corner is stored as soon as it is measured; the version marker
    /// that enables leveling is written only after the last one. A run that
    /// fails keeps the stored marker, so the previous model stays in force
    /// with the corners measured so far.
    pub async fn calibrate_bed_orientation(&mut self) -> Result<(), MotionError> {
        self.scheduler.clear_stop();
        #[cfg(feature = "defmt-log")]
        info!("bed orientation calibration started");
        // corners are measured on the raw bed, the stored marker is left alone
        self.settings.bed_orientation_version = 0;
        self.rebase_z();

        if let Err(e) = self.measure_bed_orientation().await {
            #[cfg(feature = "defmt-log")]
            warn!("bed orientation calibration failed: {}", e);
            self.update_bed_geometry(true).await;
            return Err(e);
        }

        self.nvm
            .lock()
            .await
            .write_u8(NvmField::BedOrientationVersion, BED_ORIENTATION_VERSION)?;
        self.update_bed_geometry(true).await;
        #[cfg(feature = "defmt-log")]
        info!("bed orientation calibration completed");
        Ok(())
    }

    async fn measure_bed_orientation(&mut self) -> Result<(), MotionError> {
        self.calibrate_center().await?;

        let height = millimeters(self.config.calibration.travel_height);
        let feed_rate = millimeters_per_minute(self.config.calibration.corner_feed_rate);
        for corner in CORNER_ORDER {
            let position = self.config.bed.layout.get_corner(corner);
            let mut targets = self.get_values();
            targets[Axis::X.index()] = position.get_x();
            targets[Axis::Y.index()] = position.get_y();
            self.compensate_for_backlash(&targets).await?;
            self.move_axes(targets, feed_rate, None).await?;

            let z = self.find_z0().await?;
            self.nvm.lock().await.write_f32(NvmField::BedOrientation(corner), z)?;
            #[cfg(feature = "defmt-log")]
            info!("corner {} measured at {}", corner, z);
            self.raise_to(height).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use approx::assert_abs_diff_eq;
    use math::measurements::Length;

    use super::*;
    use crate::sim::{mm_to_steps, test_config, SimPrinter};

    fn values(x: i16, y: i16, z: i16) -> AccelerationValues {
        AccelerationValues { x, y, z }
    }

    // bed 3.5 mm under the starting height, rising by 0.01 mm per mm towards +x
    fn tilted_printer() -> SimPrinter {
        let printer = SimPrinter::new();
        let center = mm_to_steps(54.0);
        printer
            .machine
            .set_surface(move |x, _| -560 + ((x - center) as f32 * 0.01).round() as i64);
        printer
    }

    #[test]
    fn test_jerk_needs_two_hits() {
        let mut detector = JerkDetector::new(Axis::Y, AccelerometerAxis::Y, 20, values(0, 5, 0));
        assert!(!detector.sample(values(0, 10, 0)));
        assert!(!detector.sample(values(0, 40, 0)));
        // a calm sample resets the count
        assert!(!detector.sample(values(0, 41, 0)));
        assert!(!detector.sample(values(0, 100, 0)));
        assert!(detector.sample(values(0, -100, 0)));
    }

    #[test]
    fn test_jerk_ignores_other_axes() {
        let mut detector = JerkDetector::new(Axis::Z, AccelerometerAxis::Z, 3, values(0, 0, 0));
        for i in 0..10 {
            let spike = if i % 2 == 0 { 100 } else { -100 };
            assert!(!detector.sample(values(spike, spike, 1)));
        }
    }

    #[tokio::test]
    async fn test_home_xy() {
        let printer = SimPrinter::new();
        let mut motors = printer.motors().await;
        motors.home_xy(false).await.unwrap();

        assert!(motors.is_valid(Axis::X));
        assert!(motors.is_valid(Axis::Y));
        assert_abs_diff_eq!(motors.get_position(Axis::X), 54.0);
        assert_abs_diff_eq!(motors.get_position(Axis::Y), 50.0);
        assert_eq!(printer.machine.get_steps(Axis::X), mm_to_steps(54.0));
        assert_eq!(printer.machine.get_steps(Axis::Y), mm_to_steps(50.0));

        // y is homed alone, then x alone, each one stops on its own spikes
        let log = printer.machine.get_read_log();
        let x = Axis::X.index();
        let y = Axis::Y.index();
        assert!(log.iter().all(|armed| !(armed[x] && armed[y])));
        let moving: Vec<Axis> = log
            .iter()
            .filter_map(|armed| match (armed[x], armed[y]) {
                (true, _) => Some(Axis::X),
                (_, true) => Some(Axis::Y),
                _ => None,
            })
            .collect();
        let first_x = moving.iter().position(|axis| *axis == Axis::X).unwrap();
        assert!(first_x >= 2);
        assert!(moving[..first_x].iter().all(|axis| *axis == Axis::Y));
        assert!(moving[first_x..].iter().all(|axis| *axis == Axis::X));
        assert!(!printer.scheduler.any_armed());
    }

    #[tokio::test]
    async fn test_homing_disarms_on_second_spike() {
        let printer = SimPrinter::new();
        let mut motors = printer.motors().await;
        motors.home_xy(false).await.unwrap();

        let x = Axis::X.index();
        let y = Axis::Y.index();
        let samples = printer.machine.get_samples();
        let homing_y: Vec<_> = samples.iter().filter(|sample| sample.armed[y]).collect();
        let spikes: Vec<usize> = homing_y
            .iter()
            .enumerate()
            .filter(|(_, sample)| sample.values.y != 0)
            .map(|(i, _)| i)
            .collect();
        // the first spike only counts, the second one disarms y
        assert_eq!(spikes, vec![homing_y.len() - 2, homing_y.len() - 1]);
        let first = homing_y[homing_y.len() - 2];
        let second = homing_y[homing_y.len() - 1];
        assert!(second.pulses[y] - first.pulses[y] <= 1);
        // x stays still while y is homed
        assert!(homing_y.iter().all(|sample| sample.pulses[x] == homing_y[0].pulses[x]));

        // no y step is issued after the disarm
        let homing_x = samples.iter().find(|sample| sample.armed[x]).unwrap();
        assert_eq!(homing_x.pulses[y], second.pulses[y]);
    }

    #[tokio::test]
    async fn test_home_xy_accelerometer_fault() {
        let printer = SimPrinter::new();
        printer.set_stored_position(Axis::X, 10.0, true);
        printer.machine.set_accelerometer_fault(true);
        let mut motors = printer.motors().await;
        assert_eq!(motors.home_xy(true).await, Err(MotionError::AccelerometerFault));
        assert_eq!(printer.machine.get_pulses(Axis::Y), 0);
        assert!(motors.is_valid(Axis::X));
    }

    #[tokio::test]
    async fn test_move_to_z0() {
        let printer = tilted_printer();
        printer.set_stored_position(Axis::X, 54.0, true);
        printer.machine.set_steps(Axis::X, mm_to_steps(54.0));
        printer.set_stored_position(Axis::Z, 3.0, true);
        printer.machine.set_steps(Axis::Z, mm_to_steps(3.0));
        let mut motors = printer.motors().await;

        let z = motors.move_to_z0().await.unwrap();
        // bed found 3.5 mm below the start, then pushed 0.1 mm further
        assert_abs_diff_eq!(z, -3.6, epsilon = 0.02);
        assert_abs_diff_eq!(motors.get_position(Axis::Z), z);
        assert!(motors.is_valid(Axis::Z));
    }

    #[tokio::test]
    async fn test_move_to_z0_without_bed() {
        let mut config = test_config();
        config.z0.max_travel = Length::from_millimeters(10.0);
        let printer = SimPrinter::with_config(config);
        let mut motors = printer.motors().await;
        assert_eq!(motors.move_to_z0().await, Err(MotionError::Z0NotFound));
        // every probe goes 5 mm down and bounces 2 mm back up
        assert_abs_diff_eq!(motors.get_position(Axis::Z), -11.0, epsilon = 0.01);
        assert!(!motors.is_valid(Axis::Z));
    }

    #[tokio::test]
    async fn test_calibrate_bed_center_z0() {
        let printer = tilted_printer();
        let mut motors = printer.motors().await;
        motors.calibrate_bed_center_z0().await.unwrap();

        assert!(motors.is_valid(Axis::Z));
        assert_abs_diff_eq!(motors.get_position(Axis::Z), 3.0);
        assert_abs_diff_eq!(motors.get_position(Axis::X), 54.0);
        // 3 mm over the bed plus the compliance correction
        assert!((printer.machine.get_steps(Axis::Z) - (-560 - 16 + 480)).abs() <= 1);
    }

    #[tokio::test]
    async fn test_calibrate_bed_orientation() {
        let printer = tilted_printer();
        let mut motors = printer.motors().await;
        motors.calibrate_bed_orientation().await.unwrap();

        let expected = [
            (BedCorner::FrontLeft, -0.45),
            (BedCorner::FrontRight, 0.45),
            (BedCorner::BackRight, 0.45),
            (BedCorner::BackLeft, -0.45),
        ];
        printer.with_nvm(|nvm| {
            for (corner, height) in expected {
                assert_abs_diff_eq!(nvm.read_f32_or(NvmField::BedOrientation(corner), 0.0), height, epsilon = 0.02);
            }
            assert_eq!(nvm.read_u8(NvmField::BedOrientationVersion), Ok(BED_ORIENTATION_VERSION));
        });
        assert!(motors.is_bed_leveling_active());
        assert_abs_diff_eq!(
            motors.get_bed_geometry().get_corner_height(BedCorner::FrontRight),
            0.45,
            epsilon = 0.02
        );
        // the last corner is back left, the carriage stays 3 mm over it
        assert_abs_diff_eq!(motors.get_z_offset(), -0.45, epsilon = 0.02);
        assert_abs_diff_eq!(motors.get_position(Axis::Z), 3.45, epsilon = 0.02);
    }

    #[tokio::test]
    async fn test_calibration_stopped_keeps_measured_corners() {
        let printer = tilted_printer();
        let scheduler = Rc::clone(&printer.scheduler);
        let stop_after = NvmField::BedOrientation(BedCorner::FrontRight).get_offset();
        printer.with_nvm(|nvm| {
            nvm.set_write_hook(move |offset| {
                if offset == stop_after {
                    scheduler.emergency_stop();
                }
            })
        });
        let mut motors = printer.motors().await;
        assert_eq!(motors.calibrate_bed_orientation().await, Err(MotionError::EmergencyStop));

        printer.with_nvm(|nvm| {
            assert_abs_diff_eq!(
                nvm.read_f32_or(NvmField::BedOrientation(BedCorner::FrontLeft), 0.0),
                -0.45,
                epsilon = 0.02
            );
            assert_abs_diff_eq!(
                nvm.read_f32_or(NvmField::BedOrientation(BedCorner::FrontRight), 0.0),
                0.45,
                epsilon = 0.02
            );
            assert!(nvm.read_f32(NvmField::BedOrientation(BedCorner::BackRight)).unwrap().is_nan());
            assert!(nvm.read_f32(NvmField::BedOrientation(BedCorner::BackLeft)).unwrap().is_nan());
            // still erased, the marker is never written before the last corner
            assert_eq!(nvm.read_u8(NvmField::BedOrientationVersion), Ok(0xFF));
        });
        assert!(!motors.is_bed_leveling_active());
        assert!(!printer.scheduler.are_drivers_enabled());
    }

    #[tokio::test]
    async fn test_interrupted_calibration_keeps_previous_model() {
        let printer = tilted_printer();
        printer.with_nvm(|nvm| {
            for corner in BedCorner::ALL {
                nvm.write_f32(NvmField::BedOrientation(corner), 0.2).unwrap();
            }
            nvm.write_u8(NvmField::BedOrientationVersion, BED_ORIENTATION_VERSION).unwrap();
        });
        let scheduler = Rc::clone(&printer.scheduler);
        let stop_after = NvmField::BedOrientation(BedCorner::FrontRight).get_offset();
        printer.with_nvm(|nvm| {
            nvm.set_write_hook(move |offset| {
                if offset == stop_after {
                    scheduler.emergency_stop();
                }
            })
        });
        let mut motors = printer.motors().await;
        assert_eq!(motors.calibrate_bed_orientation().await, Err(MotionError::EmergencyStop));

        printer.with_nvm(|nvm| {
            assert_eq!(nvm.read_u8(NvmField::BedOrientationVersion), Ok(BED_ORIENTATION_VERSION));
            let expected = [
                (BedCorner::FrontLeft, -0.45),
                (BedCorner::FrontRight, 0.45),
                (BedCorner::BackRight, 0.2),
                (BedCorner::BackLeft, 0.2),
            ];
            for (corner, height) in expected {
                assert_abs_diff_eq!(
                    nvm.read_f32_or(NvmField::BedOrientation(corner), 0.0),
                    height,
                    epsilon = 0.02
                );
            }
        });
        // homing left x and y valid, so the reloaded model applies right away
        assert!(motors.is_bed_leveling_active());
        assert!(!printer.scheduler.are_drivers_enabled());
    }
}
