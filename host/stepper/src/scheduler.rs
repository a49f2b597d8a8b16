use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use common::OutputPinBase;
use embassy_sync::blocking_mutex::CriticalSectionMutex;

use crate::plan::StepTiming;
use crate::Axis;

#[cfg(feature = "defmt-log")]
use defmt::warn;

// priority of a compare channel, Off means disarmed
const LEVEL_OFF: u8 = 0;
const LEVEL_LOW: u8 = 1;
const LEVEL_HIGH: u8 = 2;

struct AxisRuntime {
    level: AtomicU8,
    steps: AtomicU32,
    delay: AtomicU32,
    delay_counter: AtomicU32,
    skips: AtomicU32,
    skip_counter: AtomicU32,
}

impl AxisRuntime {
    const fn new() -> Self {
        Self {
            level: AtomicU8::new(LEVEL_OFF),
            steps: AtomicU32::new(0),
            delay: AtomicU32::new(0),
            delay_counter: AtomicU32::new(0),
            skips: AtomicU32::new(0),
            skip_counter: AtomicU32::new(0),
        }
    }
}

/// Interrupt side of the motion core: one compare channel per axis on a
/// single shared timer.
///
/// Every period the board calls [`StepScheduler::on_overflow`] first and then
/// [`StepScheduler::on_compare`] for each channel. The foreground only arms
/// channels and polls until they have all disarmed.
pub struct StepScheduler<P: OutputPinBase> {
    channels: [AxisRuntime; 4],
    step_pins: CriticalSectionMutex<RefCell<[P; 4]>>,
    // drivers are enabled with a low level
    enable_pin: CriticalSectionMutex<RefCell<P>>,
    stopped: AtomicBool,
}

impl<P: OutputPinBase> StepScheduler<P> {
    pub const fn new(step_pins: [P; 4], enable_pin: P) -> Self {
        Self {
            channels: [AxisRuntime::new(), AxisRuntime::new(), AxisRuntime::new(), AxisRuntime::new()],
            step_pins: CriticalSectionMutex::new(RefCell::new(step_pins)),
            enable_pin: CriticalSectionMutex::new(RefCell::new(enable_pin)),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn arm(&self, axis: Axis, timing: StepTiming) {
        let channel = &self.channels[axis.index()];
        channel.steps.store(timing.steps, Ordering::Relaxed);
        channel.delay.store(timing.delay, Ordering::Relaxed);
        channel.skips.store(timing.skips, Ordering::Relaxed);
        channel.delay_counter.store(0, Ordering::Relaxed);
        channel.skip_counter.store(0, Ordering::Relaxed);
        // the channel becomes visible to the interrupt only once fully set up
        channel.level.store(LEVEL_HIGH, Ordering::SeqCst);
    }

    // remaining steps are kept, so an interrupted move can be measured
    pub fn disarm(&self, axis: Axis) {
        self.channels[axis.index()].level.store(LEVEL_OFF, Ordering::SeqCst);
    }

    pub fn disarm_all(&self) {
        for axis in Axis::ALL {
            self.disarm(axis);
        }
    }

    pub fn is_armed(&self, axis: Axis) -> bool {
        self.channels[axis.index()].level.load(Ordering::SeqCst) != LEVEL_OFF
    }

    pub fn any_armed(&self) -> bool {
        Axis::ALL.iter().any(|axis| self.is_armed(*axis))
    }

    pub fn get_remaining_steps(&self, axis: Axis) -> u32 {
        self.channels[axis.index()].steps.load(Ordering::Relaxed)
    }

    /// Timer overflow: closes the pulses of the previous period and gives the
    /// armed channels precedence for the next one.
    pub fn on_overflow(&self) {
        self.step_pins.lock(|pins| {
            for pin in pins.borrow_mut().iter_mut() {
                pin.set_low();
            }
        });
        for channel in self.channels.iter() {
            // compare_exchange keeps disarmed channels off
            let _ = channel
                .level
                .compare_exchange(LEVEL_LOW, LEVEL_HIGH, Ordering::SeqCst, Ordering::SeqCst);
        }
    }

    /// Compare event of the channel of `axis`.
    pub fn on_compare(&self, axis: Axis) {
        let channel = &self.channels[axis.index()];
        if channel
            .level
            .compare_exchange(LEVEL_HIGH, LEVEL_LOW, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let skips = channel.skips.load(Ordering::Relaxed);
        if skips > 1 {
            let skip_counter = channel.skip_counter.load(Ordering::Relaxed) + 1;
            if skip_counter >= skips {
                channel.skip_counter.store(0, Ordering::Relaxed);
                return;
            }
            channel.skip_counter.store(skip_counter, Ordering::Relaxed);
        }

        let delay_counter = channel.delay_counter.load(Ordering::Relaxed) + 1;
        if delay_counter < channel.delay.load(Ordering::Relaxed) {
            channel.delay_counter.store(delay_counter, Ordering::Relaxed);
            return;
        }
        channel.delay_counter.store(0, Ordering::Relaxed);

        let steps = channel.steps.load(Ordering::Relaxed);
        if steps == 0 {
            self.disarm(axis);
            return;
        }
        // the pin goes back low on the next overflow
        self.step_pins.lock(|pins| pins.borrow_mut()[axis.index()].set_high());
        channel.steps.store(steps - 1, Ordering::Relaxed);
        if steps == 1 {
            self.disarm(axis);
        }
    }

    pub fn enable_drivers(&self) {
        self.enable_pin.lock(|pin| pin.borrow_mut().set_low());
    }

    pub fn disable_drivers(&self) {
        self.enable_pin.lock(|pin| pin.borrow_mut().set_high());
    }

    pub fn are_drivers_enabled(&self) -> bool {
        self.enable_pin.lock(|pin| !pin.borrow().is_high())
    }

    /// Stops every motor right away, callable from any context.
    ///
    /// The blocking waits of the foreground notice the flag and unwind; it is
    /// cleared by the next host move or calibration routine.
    pub fn emergency_stop(&self) {
        #[cfg(feature = "defmt-log")]
        warn!("emergency stop");
        self.disable_drivers();
        self.disarm_all();
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn clear_stop(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }
}
