#![no_std]
#![no_main]

use core::cell::RefCell;

use app::config::{
    peripherals_init, StepTimerPeripheral, VrefTimer, EEPROM_ADDRESS, EEPROM_CAPACITY, PERSISTENCE_PERIOD_MS,
    STEP_TICKS_PER_SECOND,
};
use app::{
    init_output_pin, on_step_interrupt, EmbassyTimer, I2cEeprom, OutputPinWrapper, SimplePwmWrapper,
    SpiAccelerometer, StepTimer,
};
use defmt::{error, info, warn};
use embassy_embedded_hal::shared_bus::blocking::spi::SpiDevice;
use embassy_executor::Spawner;
use embassy_stm32::exti::ExtiInput;
use embassy_stm32::gpio::{Level, Output, OutputType, Pull, Speed as PinSpeed};
use embassy_stm32::i2c::I2c;
use embassy_stm32::interrupt::{self, InterruptExt};
use embassy_stm32::mode::Blocking;
use embassy_stm32::spi::{self, Spi};
use embassy_stm32::time::{khz, Hertz};
use embassy_stm32::timer::low_level::{CountingMode, Timer as LowLevelTimer};
use embassy_stm32::timer::simple_pwm::{PwmPin, SimplePwm};
use embassy_stm32::timer::Channel as PwmChannel;
use embassy_stm32::Config;
use embassy_sync::blocking_mutex::raw::{NoopRawMutex, ThreadModeRawMutex};
use embassy_sync::blocking_mutex::NoopMutex;
use embassy_sync::channel::Channel;
use embassy_sync::once_lock::OnceLock;
use embassy_time::{Duration, Ticker};
use leveling::BedCorner;
use nvm::SharedNvm;
use static_cell::StaticCell;
use stepper::driver::MotorDriver;
use stepper::{MotionError, MotionState, MoveCommand, MoveTasks, Motors, PersistenceSaver, SaveOutcome, StepScheduler};
use {defmt_rtt as _, panic_probe as _};

type Pin = OutputPinWrapper<'static>;
type Vref = SimplePwmWrapper<'static, VrefTimer>;
type Steps = StepTimer<'static, StepTimerPeripheral>;
type AccelerometerDevice = SpiDevice<'static, NoopRawMutex, Spi<'static, Blocking>, Output<'static>>;
type Accelerometer = SpiAccelerometer<AccelerometerDevice>;
type Eeprom = I2cEeprom<I2c<'static, Blocking>>;
type PrinterMotors = Motors<'static, Pin, Vref, Steps, Accelerometer, Eeprom, EmbassyTimer>;

/// Work items for the motion task.
#[derive(Clone, Copy)]
pub enum MotionRequest {
    Move(MoveCommand, MoveTasks),
    HomeXY,
    MoveToZ0,
    MoveToHeight(f32),
    CalibrateBedCenterZ0,
    CalibrateBedOrientation,
    SetBedHeightOffset(f32),
    SetBedCornerOffset(BedCorner, f32),
}

const MOTION_CHANNEL_LEN: usize = 8;

// filled by the host link task, which is not part of this firmware yet; until
// then the motion task only restores and holds the stored state
static MOTION_CHANNEL: Channel<ThreadModeRawMutex, MotionRequest, MOTION_CHANNEL_LEN> = Channel::new();
static SCHEDULER: OnceLock<StepScheduler<Pin>> = OnceLock::new();
static MOTION_STATE: MotionState = MotionState::new();
static NVM: StaticCell<SharedNvm<Eeprom>> = StaticCell::new();

#[interrupt]
fn TIM2() {
    if let Some(scheduler) = SCHEDULER.try_get() {
        on_step_interrupt(scheduler);
    }
}

async fn execute(motors: &mut PrinterMotors, request: MotionRequest) -> Result<(), MotionError> {
    match request {
        MotionRequest::Move(command, tasks) => motors.plan_and_execute(&command, tasks).await,
        MotionRequest::HomeXY => motors.home_xy(true).await,
        MotionRequest::MoveToZ0 => motors.move_to_z0().await.map(|z| info!("[MOTION] Z0 found at {}", z)),
        MotionRequest::MoveToHeight(height) => motors.move_to_height(height).await,
        MotionRequest::CalibrateBedCenterZ0 => motors.calibrate_bed_center_z0().await,
        MotionRequest::CalibrateBedOrientation => motors.calibrate_bed_orientation().await,
        MotionRequest::SetBedHeightOffset(offset) => motors.set_bed_height_offset(offset).await,
        MotionRequest::SetBedCornerOffset(corner, offset) => motors.set_bed_corner_offset(corner, offset).await,
    }
}

#[embassy_executor::task]
async fn motion_handler(mut motors: PrinterMotors) {
    motors.load_settings().await;
    info!("[MOTION] ready");

    loop {
        let request = MOTION_CHANNEL.receive().await;
        if let Err(e) = execute(&mut motors, request).await {
            error!("[MOTION] request failed: {}", e);
        }
    }
}

#[embassy_executor::task]
async fn persistence_handler(nvm: &'static SharedNvm<Eeprom>) {
    let mut saver = PersistenceSaver::new(&MOTION_STATE, nvm);
    let mut ticker = Ticker::every(Duration::from_millis(PERSISTENCE_PERIOD_MS));
    loop {
        if let SaveOutcome::Failed(e) = saver.tick() {
            warn!("[PERSISTENCE] {}", e);
        }
        ticker.next().await;
    }
}

#[embassy_executor::task]
async fn emergency_stop_handler(mut button: ExtiInput<'static>) {
    let scheduler = SCHEDULER.get().await;
    loop {
        button.wait_for_rising_edge().await;
        warn!("[MOTION] emergency stop");
        scheduler.emergency_stop();
    }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    let mut config = Config::default();
    {
        use embassy_stm32::rcc::*;
        config.rcc.hsi = Some(HSIPrescaler::DIV1);
        config.rcc.csi = true;
        config.rcc.pll1 = Some(Pll {
            source: PllSource::HSI,
            prediv: PllPreDiv::DIV4,
            mul: PllMul::MUL50,
            divp: Some(PllDiv::DIV2),
            divq: Some(PllDiv::DIV8), // SPI1 cksel defaults to pll1_q
            divr: None,
        });
        config.rcc.sys = Sysclk::PLL1_P; // 400 Mhz
        config.rcc.ahb_pre = AHBPrescaler::DIV2; // 200 Mhz
        config.rcc.apb1_pre = APBPrescaler::DIV2; // 100 Mhz
        config.rcc.apb2_pre = APBPrescaler::DIV2; // 100 Mhz
        config.rcc.apb3_pre = APBPrescaler::DIV2; // 100 Mhz
        config.rcc.apb4_pre = APBPrescaler::DIV2; // 100 Mhz
        config.rcc.voltage_scale = VoltageScale::Scale1;
    }
    let p = embassy_stm32::init(config);

    let printer_config = peripherals_init(p);
    let motion_config = printer_config.motion;

    let i2c = I2c::new_blocking(
        printer_config.eeprom.peripheral,
        printer_config.eeprom.scl,
        printer_config.eeprom.sda,
        Hertz(400_000),
        Default::default(),
    );
    let nvm = NVM.init(SharedNvm::new(I2cEeprom::new(i2c, EEPROM_ADDRESS, EEPROM_CAPACITY)));
    {
        let mut eeprom = nvm.lock().await;
        MOTION_STATE.restore(&mut *eeprom);
    }

    // step pins idle low, drivers start disabled
    let motors = printer_config.motors;
    let scheduler = StepScheduler::new(
        [
            init_output_pin!(motors.x.step_pin, Level::Low),
            init_output_pin!(motors.y.step_pin, Level::Low),
            init_output_pin!(motors.z.step_pin, Level::Low),
            init_output_pin!(motors.e.step_pin, Level::Low),
        ],
        init_output_pin!(motors.enable_pin, Level::High),
    );
    if SCHEDULER.init(scheduler).is_err() {
        defmt::panic!("step scheduler initialized twice");
    }
    let scheduler = SCHEDULER.get().await;

    let vref = SimplePwm::new(
        printer_config.vref.timer,
        Some(PwmPin::new_ch1(printer_config.vref.ch1, OutputType::PushPull)),
        Some(PwmPin::new_ch2(printer_config.vref.ch2, OutputType::PushPull)),
        Some(PwmPin::new_ch3(printer_config.vref.ch3, OutputType::PushPull)),
        Some(PwmPin::new_ch4(printer_config.vref.ch4, OutputType::PushPull)),
        khz(20),
        CountingMode::EdgeAlignedUp,
    );
    let driver = MotorDriver::new(
        [
            init_output_pin!(motors.x.dir_pin, Level::Low),
            init_output_pin!(motors.y.dir_pin, Level::Low),
            init_output_pin!(motors.z.dir_pin, Level::Low),
            init_output_pin!(motors.e.dir_pin, Level::Low),
        ],
        SimplePwmWrapper::new(vref),
        [PwmChannel::Ch1, PwmChannel::Ch2, PwmChannel::Ch3, PwmChannel::Ch4],
        &motion_config,
    );

    let step_timer = StepTimer::new(LowLevelTimer::new(printer_config.step_timer), STEP_TICKS_PER_SECOND);
    unsafe { interrupt::TIM2.enable() };

    static SPI_BUS: StaticCell<NoopMutex<RefCell<Spi<'static, Blocking>>>> = StaticCell::new();
    let mut spi_config = spi::Config::default();
    spi_config.mode = spi::MODE_3;
    spi_config.frequency = Hertz(1_000_000);
    let spi = Spi::new_blocking(
        printer_config.accelerometer.peripheral,
        printer_config.accelerometer.clk,
        printer_config.accelerometer.mosi,
        printer_config.accelerometer.miso,
        spi_config,
    );
    let spi_bus = SPI_BUS.init(NoopMutex::new(RefCell::new(spi)));
    let cs_pin = Output::new(printer_config.accelerometer.cs, Level::High, PinSpeed::Low);
    let mut accelerometer = SpiAccelerometer::new(SpiDevice::new(spi_bus, cs_pin));
    // motion still works without it, homing and Z0 will report the fault
    if let Err(e) = accelerometer.init() {
        error!("[MOTION] accelerometer init failed: {}", e);
    }

    let motors = Motors::new(
        scheduler,
        driver,
        step_timer,
        accelerometer,
        nvm,
        &MOTION_STATE,
        motion_config,
    );

    let button = ExtiInput::new(printer_config.emergency_stop.pin, printer_config.emergency_stop.exti, Pull::Down);

    spawner.spawn(emergency_stop_handler(button)).unwrap();
    spawner.spawn(persistence_handler(nvm)).unwrap();
    spawner.spawn(motion_handler(motors)).unwrap();
}
