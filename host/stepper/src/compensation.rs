use common::{AccelerometerBase, NvmBase, OutputPinBase, PwmBase, StepTimerBase, TimerBase};
use leveling::{BedCorner, BedGeometry, BedLayout};
use math::common::{ceil, millimeters, sqrt};
use nvm::{NvmExt, NvmField, BED_ORIENTATION_VERSION};

use crate::planner::Motors;
use crate::{Axis, Direction, MotionError};

#[cfg(feature = "defmt-log")]
use defmt::info;

/// Corner heights are the calibrated orientation plus the user offset.
pub(crate) fn load_bed_geometry<S: NvmBase>(nvm: &mut S, layout: BedLayout) -> BedGeometry {
    let mut heights = [0.0; 4];
    for corner in BedCorner::ALL {
        heights[corner.index()] = nvm.read_f32_or(NvmField::BedOrientation(corner), 0.0)
            + nvm.read_f32_or(NvmField::BedOffset(corner), 0.0);
    }
    BedGeometry::new(layout, heights)
}

/// Splits a move in equal parts no longer than `segment_length` on the XY
/// plane. The last segment ends exactly on the target.
pub struct Segments {
    start: [f32; 4],
    end: [f32; 4],
    count: u32,
    index: u32,
}

impl Segments {
    pub fn new(start: [f32; 4], end: [f32; 4], segment_length: f32) -> Self {
        let dx = end[Axis::X.index()] - start[Axis::X.index()];
        let dy = end[Axis::Y.index()] - start[Axis::Y.index()];
        let length = sqrt(dx * dx + dy * dy);
        let count = if segment_length > 0.0 {
            ceil(length / segment_length).max(1.0)
        } else {
            1.0
        };
        Self {
            start,
            end,
            count: count as u32,
            index: 0,
        }
    }

    pub fn get_count(&self) -> u32 {
        self.count
    }
}

impl Iterator for Segments {
    type Item = [f32; 4];

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.count {
            return None;
        }
        self.index += 1;
        if self.index == self.count {
            return Some(self.end);
        }
        let t = self.index as f32 / self.count as f32;
        let mut point = self.start;
        for (p, e) in point.iter_mut().zip(self.end) {
            *p += (e - *p) * t;
        }
        Some(point)
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
    /// Leveling needs a calibrated bed and a carriage that knows where it is.
    pub fn is_bed_leveling_active(&self) -> bool {
        self.settings.bed_orientation_version == BED_ORIENTATION_VERSION
            && self.is_valid(Axis::X)
            && self.is_valid(Axis::Y)
    }

    // total z correction at (x, y), zero while leveling is off
    pub(crate) fn get_leveling_offset(&self, x: f32, y: f32) -> f32 {
        if self.is_bed_leveling_active() {
            self.settings.bed_height_offset + self.bed.get_height_adjustment(x, y)
        } else {
            0.0
        }
    }

    // the zone is the one of the height the move starts from
    pub(crate) fn clamp_to_bed(&self, targets: &mut [f32; 4]) {
        let zone = self.config.bed.get_zone(self.get_values()[Axis::Z.index()]);
        let x = &mut targets[Axis::X.index()];
        *x = x.clamp(zone.min.get_x(), zone.max.get_x());
        let y = &mut targets[Axis::Y.index()];
        *y = y.clamp(zone.min.get_y(), zone.max.get_y());
    }

    /// Takes up the slack of X and Y before a move that reverses them. The
    /// logical position does not change.
    pub(crate) async fn compensate_for_backlash(&mut self, targets: &[f32; 4]) -> Result<(), MotionError> {
        let values = self.get_values();
        let mut pre_move = values;
        let mut needed = false;
        for (axis, backlash) in [Axis::X, Axis::Y].into_iter().zip(self.settings.backlash) {
            let i = axis.index();
            let delta = targets[i] - values[i];
            if delta == 0.0 || backlash <= 0.0 {
                continue;
            }
            let direction = Direction::from_delta(delta);
            if direction != self.get_direction(axis) {
                pre_move[i] += direction.get_sign() * backlash;
                needed = true;
            }
        }
        if !needed {
            return Ok(());
        }

        let speed = self.settings.backlash_speed;
        self.move_axes(pre_move, speed, None).await?;
        for axis in [Axis::X, Axis::Y] {
            self.set_value(axis, values[axis.index()]);
        }
        Ok(())
    }

    /// Follows the bed surface by splitting the move in short segments, each
    /// one ending at the correction of its own end point.
    pub(crate) async fn compensate_for_bed_leveling(
        &mut self,
        start: [f32; 4],
        targets: [f32; 4],
        feed_rate: f32,
    ) -> Result<(), MotionError> {
        let segment_length = millimeters(self.config.bed.segment_length);
        for target in Segments::new(start, targets, segment_length) {
            let z_offset = self.get_leveling_offset(target[Axis::X.index()], target[Axis::Y.index()]);
            self.move_physical(target, z_offset, feed_rate, None).await?;
        }
        Ok(())
    }

    /// Keeps the carriage where it is and moves logical Z under the current
    /// leveling correction.
    pub(crate) fn rebase_z(&mut self) {
        let values = self.get_values();
        let total = self.get_leveling_offset(values[Axis::X.index()], values[Axis::Y.index()]);
        self.set_value(Axis::Z, values[Axis::Z.index()] - (total - self.z_offset));
        self.z_offset = total;
    }

    pub(crate) async fn update_bed_geometry(&mut self, rebase: bool) {
        {
            let mut nvm = self.nvm.lock().await;
            self.settings = crate::planner::Settings::load(&mut *nvm, &self.config);
            self.bed = load_bed_geometry(&mut *nvm, self.config.bed.layout);
        }
        if rebase {
            self.rebase_z();
        }
    }

    pub async fn set_bed_height_offset(&mut self, offset: f32) -> Result<(), MotionError> {
        self.nvm.lock().await.write_f32(NvmField::BedHeightOffset, offset)?;
        #[cfg(feature = "defmt-log")]
        info!("bed height offset set to {}", offset);
        self.update_bed_geometry(true).await;
        Ok(())
    }

    pub async fn set_bed_corner_offset(&mut self, corner: BedCorner, offset: f32) -> Result<(), MotionError> {
        self.nvm.lock().await.write_f32(NvmField::BedOffset(corner), offset)?;
        #[cfg(feature = "defmt-log")]
        info!("bed offset of {} set to {}", corner, offset);
        self.update_bed_geometry(true).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use proptest::prelude::*;

    use super::*;
    use crate::planner::{MoveCommand, MoveTasks};
    use crate::sim::{mm_to_steps, SimPrinter};

    fn calibrated_printer(heights: [f32; 4]) -> SimPrinter {
        let printer = SimPrinter::new();
        printer.with_nvm(|nvm| {
            for corner in BedCorner::ALL {
                nvm.write_f32(NvmField::BedOrientation(corner), heights[corner.index()]).unwrap();
            }
            nvm.write_u8(NvmField::BedOrientationVersion, BED_ORIENTATION_VERSION).unwrap();
        });
        printer.set_stored_position(Axis::X, 54.0, true);
        printer.set_stored_position(Axis::Y, 50.0, true);
        printer
    }

    #[test]
    fn test_segment_count() {
        let start = [0.0; 4];
        let segments = Segments::new(start, [45.0, 0.0, 0.0, 0.0], 2.0);
        assert_eq!(segments.get_count(), 23);
        assert_eq!(Segments::new(start, [0.0, 0.0, 5.0, 0.0], 2.0).get_count(), 1);
        assert_eq!(Segments::new(start, [3.0, 4.0, 0.0, 0.0], 2.5).get_count(), 2);
    }

    #[test]
    fn test_segments_interpolate() {
        let points: Vec<[f32; 4]> = Segments::new([0.0, 0.0, 1.0, 0.0], [4.0, 0.0, 3.0, 2.0], 2.0).collect();
        assert_eq!(points.len(), 2);
        assert_abs_diff_eq!(points[0][0], 2.0);
        assert_abs_diff_eq!(points[0][2], 2.0);
        assert_abs_diff_eq!(points[0][3], 1.0);
        assert_eq!(points[1], [4.0, 0.0, 3.0, 2.0]);
    }

    proptest! {
        #[test]
        fn last_segment_is_the_target(
            start in prop::array::uniform4(-100.0f32..100.0),
            end in prop::array::uniform4(-100.0f32..100.0),
            length in 0.5f32..10.0,
        ) {
            let segments = Segments::new(start, end, length);
            let count = segments.get_count();
            let points: Vec<[f32; 4]> = segments.collect();
            prop_assert_eq!(points.len() as u32, count);
            prop_assert!(count >= 1);
            prop_assert_eq!(points[points.len() - 1], end);
        }
    }

    #[tokio::test]
    async fn test_backlash_pre_move_on_reversal() {
        let printer = SimPrinter::new();
        printer.with_nvm(|nvm| nvm.write_f32(NvmField::BacklashX, 0.5).unwrap());
        let mut motors = printer.motors().await;

        motors.plan_and_execute(&MoveCommand::new().x(10.0), MoveTasks::BACKLASH).await.unwrap();
        assert_eq!(printer.machine.get_pulses(Axis::X), 1600);

        printer.machine.reset_pulses();
        motors.plan_and_execute(&MoveCommand::new().x(0.0), MoveTasks::BACKLASH).await.unwrap();
        assert_eq!(printer.machine.get_pulses(Axis::X), 1680);
        assert_eq!(printer.machine.get_steps(Axis::X), -80);
        assert_abs_diff_eq!(motors.get_position(Axis::X), 0.0);

        // same direction again, no slack to take up
        printer.machine.reset_pulses();
        motors.plan_and_execute(&MoveCommand::new().x(-1.0), MoveTasks::BACKLASH).await.unwrap();
        assert_eq!(printer.machine.get_pulses(Axis::X), 160);
    }

    #[tokio::test]
    async fn test_backlash_task_not_requested() {
        let printer = SimPrinter::new();
        printer.with_nvm(|nvm| nvm.write_f32(NvmField::BacklashY, 0.5).unwrap());
        let mut motors = printer.motors().await;
        motors.plan_and_execute(&MoveCommand::new().y(-1.0), MoveTasks::NONE).await.unwrap();
        assert_eq!(printer.machine.get_pulses(Axis::Y), 160);
    }

    #[tokio::test]
    async fn test_targets_clamped_to_zone() {
        let printer = SimPrinter::new();
        let mut motors = printer.motors().await;
        let command = MoveCommand::new().x(200.0).y(-20.0);
        motors.plan_and_execute(&command, MoveTasks::BED_LEVELING).await.unwrap();
        assert_abs_diff_eq!(motors.get_position(Axis::X), 106.0);
        assert_abs_diff_eq!(motors.get_position(Axis::Y), -2.0);
        assert_eq!(printer.machine.get_steps(Axis::X), mm_to_steps(106.0));

        // climbing out of the corner is limited by the zone it starts in
        let command = MoveCommand::new().z(75.0);
        motors.plan_and_execute(&command, MoveTasks::BED_LEVELING).await.unwrap();
        assert_abs_diff_eq!(motors.get_position(Axis::X), 106.0);
        assert_abs_diff_eq!(motors.get_position(Axis::Y), -2.0);
        assert_abs_diff_eq!(motors.get_position(Axis::Z), 75.0);

        // higher up the bed area shrinks, even for a move that goes back down
        let command = MoveCommand::new().x(0.0).z(0.0);
        motors.plan_and_execute(&command, MoveTasks::BED_LEVELING).await.unwrap();
        assert_abs_diff_eq!(motors.get_position(Axis::X), 7.0);
        assert_abs_diff_eq!(motors.get_position(Axis::Y), 9.5);
        assert_abs_diff_eq!(motors.get_position(Axis::Z), 0.0);
        assert_eq!(printer.machine.get_steps(Axis::X), mm_to_steps(7.0));
    }

    #[tokio::test]
    async fn test_leveling_follows_bed() {
        let printer = calibrated_printer([0.5, 0.0, 0.5, 0.0]);
        let mut motors = printer.motors().await;
        assert!(motors.is_bed_leveling_active());
        assert_abs_diff_eq!(motors.get_z_offset(), 0.0, epsilon = 0.0001);

        motors.plan_and_execute(&MoveCommand::new().x(9.0), MoveTasks::ALL).await.unwrap();
        assert_eq!(printer.machine.get_steps(Axis::X), -mm_to_steps(45.0));
        // the left edge is half a millimeter higher than the center
        assert!((printer.machine.get_steps(Axis::Z) - 80).abs() <= 1);
        assert_abs_diff_eq!(motors.get_position(Axis::Z), 0.0);
        assert_abs_diff_eq!(motors.get_z_offset(), 0.5, epsilon = 0.0001);
    }

    #[tokio::test]
    async fn test_leveling_needs_valid_position() {
        let printer = calibrated_printer([0.5, 0.0, 0.5, 0.0]);
        printer.set_stored_position(Axis::Y, 50.0, false);
        let mut motors = printer.motors().await;
        assert!(!motors.is_bed_leveling_active());
        motors.plan_and_execute(&MoveCommand::new().x(9.0), MoveTasks::ALL).await.unwrap();
        assert_eq!(printer.machine.get_steps(Axis::Z), 0);
    }

    #[tokio::test]
    async fn test_height_offset_rebases_z() {
        let printer = calibrated_printer([0.0; 4]);
        printer.set_stored_position(Axis::Z, 2.0, true);
        let mut motors = printer.motors().await;
        motors.set_bed_height_offset(0.2).await.unwrap();
        // the carriage has not moved, its logical height has
        assert_abs_diff_eq!(motors.get_position(Axis::Z), 1.8, epsilon = 0.0001);
        assert_abs_diff_eq!(motors.get_z_offset(), 0.2, epsilon = 0.0001);
        assert_eq!(printer.machine.get_steps(Axis::Z), 0);

        motors.set_bed_corner_offset(BedCorner::FrontLeft, -0.1).await.unwrap();
        assert_abs_diff_eq!(motors.get_bed_geometry().get_corner_height(BedCorner::FrontLeft), -0.1);
        printer.with_nvm(|nvm| {
            assert_abs_diff_eq!(nvm.read_f32_or(NvmField::BedOffset(BedCorner::FrontLeft), 0.0), -0.1);
        });
    }
}
