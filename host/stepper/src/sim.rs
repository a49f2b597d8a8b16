use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use common::{
    AccelerationValues, AccelerometerBase, AccelerometerFault, NvmBase, NvmError, OutputPinBase, PwmBase,
    StepTimerBase, TimerBase,
};
use math::measurements::Length;
use nvm::{SharedNvm, NVM_SIZE};

use crate::axis::MotionState;
use crate::config::{MotionConfig, SteppingMode};
use crate::driver::MotorDriver;
use crate::planner::Motors;
use crate::scheduler::StepScheduler;
use crate::Axis;

/*
simulated printer for the host tests: step pulses move a virtual carriage,
x and y stall against the frame, z may touch a bed surface and the
accelerometer vibrates while an axis is pushing against something.
*/

pub const TICKS_PER_SECOND: u32 = 1000;
// steps per mm of every axis in the test configuration
pub const STEPS_PER_MM: f32 = 160.0;

pub fn test_config() -> MotionConfig {
    let mut config = MotionConfig::default();
    config.stepping_mode = SteppingMode::EighthStep;
    for axis in config.axes.iter_mut() {
        axis.steps_per_mm = 20.0;
    }
    config.backlash.x = Length::from_millimeters(0.0);
    config.backlash.y = Length::from_millimeters(0.0);
    config
}

pub fn mm_to_steps(value: f32) -> i64 {
    (value * STEPS_PER_MM).round() as i64
}

pub struct StatefulOutputPinMock {
    state: bool,
}

impl StatefulOutputPinMock {
    pub fn new() -> Self {
        Self { state: false }
    }
}

impl OutputPinBase for StatefulOutputPinMock {
    fn set_high(&mut self) {
        self.state = true;
    }

    fn set_low(&mut self) {
        self.state = false;
    }

    fn is_high(&self) -> bool {
        self.state
    }
}

pub struct SimPwm {
    max_duty: u64,
    enabled: [bool; 4],
    duties: Rc<RefCell<[u64; 4]>>,
}

impl SimPwm {
    pub fn new(max_duty: u64) -> Self {
        Self {
            max_duty,
            enabled: [false; 4],
            duties: Rc::new(RefCell::new([0; 4])),
        }
    }

    pub fn get_duties(&self) -> Rc<RefCell<[u64; 4]>> {
        self.duties.clone()
    }
}

impl PwmBase for SimPwm {
    type Channel = usize;

    fn enable(&mut self, channel: usize) {
        self.enabled[channel] = true;
    }

    fn disable(&mut self, channel: usize) {
        self.enabled[channel] = false;
    }

    fn get_max_duty(&self) -> u64 {
        self.max_duty
    }

    fn set_duty(&mut self, channel: usize, duty_cycle: u64) {
        assert!(self.enabled[channel]);
        self.duties.borrow_mut()[channel] = duty_cycle;
    }
}

pub struct SimNvm {
    bytes: [u8; NVM_SIZE as usize],
    writes: Vec<u32>,
    failing: bool,
    // called after every successful write with its offset
    hook: Option<Box<dyn FnMut(u32)>>,
}

impl SimNvm {
    pub fn new() -> Self {
        Self {
            bytes: [0xFF; NVM_SIZE as usize],
            writes: Vec::new(),
            failing: false,
            hook: None,
        }
    }

    pub fn get_writes(&self) -> &[u32] {
        &self.writes
    }

    pub fn set_failing(&mut self, failing: bool) {
        self.failing = failing;
    }

    pub fn set_write_hook(&mut self, hook: impl FnMut(u32) + 'static) {
        self.hook = Some(Box::new(hook));
    }

    fn store(&mut self, offset: u32, bytes: &[u8], erase: bool) -> Result<(), NvmError> {
        if self.failing {
            return Err(NvmError::Device);
        }
        let start = offset as usize;
        let dst = self
            .bytes
            .get_mut(start..start + bytes.len())
            .ok_or(NvmError::OutOfBounds)?;
        for (d, s) in dst.iter_mut().zip(bytes) {
            *d = if erase { *s } else { *d & *s };
        }
        self.writes.push(offset);
        if let Some(hook) = self.hook.as_mut() {
            hook(offset);
        }
        Ok(())
    }
}

impl NvmBase for SimNvm {
    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), NvmError> {
        if self.failing {
            return Err(NvmError::Device);
        }
        let start = offset as usize;
        let src = self.bytes.get(start..start + bytes.len()).ok_or(NvmError::OutOfBounds)?;
        bytes.copy_from_slice(src);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), NvmError> {
        self.store(offset, bytes, false)
    }

    fn erase_and_write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), NvmError> {
        self.store(offset, bytes, true)
    }
}

/// One accelerometer read with what the scheduler and pins looked like at that moment.
#[derive(Clone, Copy, Debug)]
pub struct Sample {
    pub armed: [bool; 4],
    pub values: AccelerationValues,
    pub pulses: [u32; 4],
}

/// The virtual carriage, positions are in steps.
pub struct Machine {
    positive_is_high: [bool; 4],
    steps: [Cell<i64>; 4],
    pulses: [Cell<u32>; 4],
    direction_high: [Cell<bool>; 4],
    enabled: Cell<bool>,
    // x and y stall once they reach these positions
    limits: [i64; 2],
    surface: RefCell<Option<Box<dyn Fn(i64, i64) -> i64>>>,
    reads: Cell<u32>,
    samples: RefCell<Vec<Sample>>,
    accelerometer_fault: Cell<bool>,
}

impl Machine {
    pub fn new(config: &MotionConfig) -> Self {
        Self {
            positive_is_high: Axis::ALL.map(|axis| config.get_axis(axis).positive_is_high),
            steps: Default::default(),
            pulses: Default::default(),
            direction_high: Default::default(),
            enabled: Cell::new(false),
            limits: [mm_to_steps(108.0), mm_to_steps(100.0)],
            surface: RefCell::new(None),
            reads: Cell::new(0),
            samples: RefCell::new(Vec::new()),
            accelerometer_fault: Cell::new(false),
        }
    }

    pub fn get_steps(&self, axis: Axis) -> i64 {
        self.steps[axis.index()].get()
    }

    pub fn set_steps(&self, axis: Axis, steps: i64) {
        self.steps[axis.index()].set(steps);
    }

    pub fn get_pulses(&self, axis: Axis) -> u32 {
        self.pulses[axis.index()].get()
    }

    pub fn reset_pulses(&self) {
        for pulses in self.pulses.iter() {
            pulses.set(0);
        }
    }

    pub fn get_limit(&self, axis: Axis) -> i64 {
        match axis {
            Axis::X => self.limits[0],
            Axis::Y => self.limits[1],
            Axis::Z | Axis::E => i64::MAX,
        }
    }

    /// Height of the bed under the carriage, in z steps.
    pub fn set_surface(&self, surface: impl Fn(i64, i64) -> i64 + 'static) {
        *self.surface.borrow_mut() = Some(Box::new(surface));
    }

    pub fn set_accelerometer_fault(&self, fault: bool) {
        self.accelerometer_fault.set(fault);
    }

    pub fn get_read_log(&self) -> Vec<[bool; 4]> {
        self.samples.borrow().iter().map(|sample| sample.armed).collect()
    }

    pub fn get_samples(&self) -> Vec<Sample> {
        self.samples.borrow().clone()
    }

    fn is_touching_bed(&self) -> bool {
        match self.surface.borrow().as_ref() {
            Some(surface) => self.get_steps(Axis::Z) <= surface(self.get_steps(Axis::X), self.get_steps(Axis::Y)),
            None => false,
        }
    }

    fn step(&self, axis: Axis) {
        let i = axis.index();
        self.pulses[i].set(self.pulses[i].get() + 1);
        if !self.enabled.get() {
            return;
        }
        let positive = self.direction_high[i].get() == self.positive_is_high[i];
        let next = self.steps[i].get() + if positive { 1 } else { -1 };
        if next <= self.get_limit(axis) {
            self.steps[i].set(next);
        }
    }

    fn read(&self, armed: [bool; 4]) -> Result<AccelerationValues, AccelerometerFault> {
        if self.accelerometer_fault.get() {
            return Err(AccelerometerFault);
        }
        let reads = self.reads.get() + 1;
        self.reads.set(reads);
        let spike = |pushing: bool| match (pushing, reads % 2 == 0) {
            (false, _) => 0,
            (true, true) => 100,
            (true, false) => -100,
        };
        let values = AccelerationValues {
            x: spike(self.get_steps(Axis::X) >= self.get_limit(Axis::X)),
            y: spike(self.get_steps(Axis::Y) >= self.get_limit(Axis::Y)),
            z: spike(self.is_touching_bed()),
        };
        self.samples.borrow_mut().push(Sample {
            armed,
            values,
            pulses: Axis::ALL.map(|axis| self.get_pulses(axis)),
        });
        Ok(values)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PinRole {
    Step(Axis),
    Direction(Axis),
    Enable,
}

pub struct SimPin {
    machine: Rc<Machine>,
    role: PinRole,
    high: bool,
}

impl SimPin {
    pub fn new(machine: Rc<Machine>, role: PinRole) -> Self {
        // the drivers start disabled
        let high = role == PinRole::Enable;
        Self { machine, role, high }
    }

    fn update(&mut self, high: bool) {
        let rising = high && !self.high;
        self.high = high;
        match self.role {
            PinRole::Step(axis) if rising => self.machine.step(axis),
            PinRole::Step(_) => {}
            PinRole::Direction(axis) => self.machine.direction_high[axis.index()].set(high),
            PinRole::Enable => self.machine.enabled.set(!high),
        }
    }
}

impl OutputPinBase for SimPin {
    fn set_high(&mut self) {
        self.update(true);
    }

    fn set_low(&mut self) {
        self.update(false);
    }

    fn is_high(&self) -> bool {
        self.high
    }
}

/// Runs one full timer period per tick, like the board interrupts would.
pub struct SimTimer {
    scheduler: Rc<StepScheduler<SimPin>>,
    ticks: u64,
    // raises an emergency stop right after the given tick
    stop_at: Option<u64>,
    running: bool,
}

impl StepTimerBase for SimTimer {
    fn get_ticks_per_second(&self) -> u32 {
        TICKS_PER_SECOND
    }

    fn start(&mut self) {
        self.running = true;
    }

    fn stop(&mut self) {
        self.running = false;
    }

    async fn next_tick(&mut self) {
        assert!(self.running);
        self.ticks += 1;
        self.scheduler.on_overflow();
        for axis in Axis::ALL {
            self.scheduler.on_compare(axis);
        }
        if Some(self.ticks) == self.stop_at {
            self.scheduler.emergency_stop();
        }
    }
}

pub struct SimAccelerometer {
    machine: Rc<Machine>,
    scheduler: Rc<StepScheduler<SimPin>>,
}

impl AccelerometerBase for SimAccelerometer {
    fn read_values(&mut self) -> Result<AccelerationValues, AccelerometerFault> {
        let armed = Axis::ALL.map(|axis| self.scheduler.is_armed(axis));
        self.machine.read(armed)
    }
}

pub struct SimDelay;

impl TimerBase for SimDelay {
    async fn after(_duration: Duration) {
        tokio::task::yield_now().await;
    }
}

pub type SimMotors<'a> = Motors<'a, SimPin, SimPwm, SimTimer, SimAccelerometer, SimNvm, SimDelay>;

pub struct SimPrinter {
    pub config: MotionConfig,
    pub machine: Rc<Machine>,
    pub scheduler: Rc<StepScheduler<SimPin>>,
    pub nvm: SharedNvm<SimNvm>,
    pub state: MotionState,
    stop_at: Cell<Option<u64>>,
}

impl SimPrinter {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: MotionConfig) -> Self {
        let machine = Rc::new(Machine::new(&config));
        let step_pins = Axis::ALL.map(|axis| SimPin::new(machine.clone(), PinRole::Step(axis)));
        let enable_pin = SimPin::new(machine.clone(), PinRole::Enable);
        Self {
            config,
            scheduler: Rc::new(StepScheduler::new(step_pins, enable_pin)),
            machine,
            nvm: SharedNvm::new(SimNvm::new()),
            state: MotionState::new(),
            stop_at: Cell::new(None),
        }
    }

    pub fn set_stored_position(&self, axis: Axis, value: f32, valid: bool) {
        if let Some(state) = self.state.get(axis) {
            state.set_value(value);
            state.set_valid(valid);
        }
    }

    pub fn stop_at_tick(&self, tick: u64) {
        self.stop_at.set(Some(tick));
    }

    pub fn with_nvm<R>(&self, f: impl FnOnce(&mut SimNvm) -> R) -> R {
        let mut nvm = self.nvm.try_lock().unwrap();
        f(&mut nvm)
    }

    pub async fn motors(&self) -> SimMotors<'_> {
        let direction_pins = Axis::ALL.map(|axis| SimPin::new(self.machine.clone(), PinRole::Direction(axis)));
        let driver = MotorDriver::new(direction_pins, SimPwm::new(1000), [0, 1, 2, 3], &self.config);
        let timer = SimTimer {
            scheduler: self.scheduler.clone(),
            ticks: 0,
            stop_at: self.stop_at.get(),
            running: false,
        };
        let accelerometer = SimAccelerometer {
            machine: self.machine.clone(),
            scheduler: self.scheduler.clone(),
        };
        let mut motors = Motors::new(
            &*self.scheduler,
            driver,
            timer,
            accelerometer,
            &self.nvm,
            &self.state,
            self.config,
        );
        motors.load_settings().await;
        motors
    }
}
