use math::common::{abs, ceil, round};

use crate::{Axis, Direction, MotionError};

/// What the scheduler needs to run one channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StepTiming {
    pub steps: u32,
    // timer periods between two pulses
    pub delay: u32,
    // every `skips`-th period is skipped, 0 disables skipping
    pub skips: u32,
}

/// Request for one moving axis, all values in the axis own units.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AxisRequest {
    pub distance: f32,
    pub steps_per_unit: f32,
    // leftover fraction of a step from the previous move, in the previous direction
    pub remainder: f32,
    pub previous_direction: Direction,
    pub feed_rate: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AxisPlan {
    pub direction: Direction,
    pub remainder: f32,
    pub timing: StepTiming,
}

impl AxisPlan {
    pub fn get_steps(&self) -> u32 {
        self.timing.steps
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct MovePlan {
    axes: [Option<AxisPlan>; 4],
}

impl MovePlan {
    pub fn get(&self, axis: Axis) -> Option<&AxisPlan> {
        self.axes[axis.index()].as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.axes.iter().all(|a| a.is_none())
    }
}

pub fn get_effective_feed_rate(requested: f32, speed_limit: f32, min: f32, max: f32) -> f32 {
    requested.min(speed_limit).min(max).max(min)
}

/// Rounds `distance` to whole steps, carrying the leftover fraction.
///
/// Fails when the count does not fit the scheduler counter.
pub fn compute_steps(distance: f32, steps_per_unit: f32, remainder: f32) -> Result<(u32, f32), ()> {
    let exact = abs(distance) * steps_per_unit + remainder;
    if !exact.is_finite() || exact >= u32::MAX as f32 {
        return Err(());
    }
    let steps = round(exact).max(0.0);
    Ok((steps as u32, exact - steps))
}

/// Pulse delay and skip ratio of every moving axis, so that they all finish
/// together with the slowest one.
pub fn compute_timings(steps: [u32; 4], durations: [f32; 4]) -> [StepTiming; 4] {
    let slowest = durations.iter().fold(0.0f32, |acc, d| acc.max(*d));

    let mut timings = [StepTiming::default(); 4];
    for (timing, steps) in timings.iter_mut().zip(steps) {
        if steps == 0 {
            continue;
        }
        let delay = ceil(slowest / steps as f32).max(1.0);
        timing.steps = steps;
        timing.delay = if delay >= u32::MAX as f32 { u32::MAX } else { delay as u32 };
    }

    let total = |t: &StepTiming| t.steps as f32 * t.delay as f32;
    let slowest_total = timings.iter().fold(0.0f32, |acc, t| acc.max(total(t)));
    for timing in timings.iter_mut().filter(|t| t.steps > 0) {
        let difference = slowest_total - total(timing);
        if difference > 0.0 {
            let skips = round(total(timing) / difference);
            timing.skips = if skips >= u32::MAX as f32 { u32::MAX } else { skips as u32 };
        }
    }
    timings
}

/// Plans a move without touching any hardware; the caller commits the result.
pub fn plan_move(requests: [Option<AxisRequest>; 4], ticks_per_second: f32) -> Result<MovePlan, MotionError> {
    let mut plan = MovePlan::default();
    let mut steps = [0u32; 4];
    let mut durations = [0.0f32; 4];

    for axis in Axis::ALL {
        let i = axis.index();
        let Some(request) = requests[i] else {
            continue;
        };
        if request.distance == 0.0 {
            continue;
        }
        let direction = Direction::from_delta(request.distance);
        // a fraction owed in one direction is a fraction in excess in the other
        let remainder = if direction == request.previous_direction {
            request.remainder
        } else {
            -request.remainder
        };
        let (axis_steps, remainder) = compute_steps(request.distance, request.steps_per_unit, remainder)
            .map_err(|_| MotionError::StepOverflow(axis))?;

        steps[i] = axis_steps;
        // feed rates are in units per minute
        durations[i] = abs(request.distance) / request.feed_rate * 60.0 * ticks_per_second;
        plan.axes[i] = Some(AxisPlan {
            direction,
            remainder,
            timing: StepTiming::default(),
        });
    }

    let timings = compute_timings(steps, durations);
    for (axis_plan, timing) in plan.axes.iter_mut().zip(timings) {
        if let Some(axis_plan) = axis_plan {
            axis_plan.timing = timing;
        }
    }
    Ok(plan)
}
