use embassy_stm32::{peripherals, Peripherals};
use math::common::speed_from_millimeters_per_minute;
pub use stepper::MotionConfig;

pub type StepTimerPeripheral = peripherals::TIM2;
pub type VrefTimer = peripherals::TIM3;
pub type AccelerometerSpi = peripherals::SPI1;
pub type EepromI2c = peripherals::I2C1;

// step interrupts per second
pub const STEP_TICKS_PER_SECOND: u32 = 40_000;
pub const EEPROM_ADDRESS: u8 = 0x50;
// 24LC32
pub const EEPROM_CAPACITY: u32 = 4096;
pub const PERSISTENCE_PERIOD_MS: u64 = 50;

pub struct MotorPinsConfig<S, D> {
    pub step_pin: S,
    pub dir_pin: D,
}

pub struct MotorsConfig {
    pub x: MotorPinsConfig<peripherals::PF13, peripherals::PF12>,
    pub y: MotorPinsConfig<peripherals::PF15, peripherals::PF14>,
    pub z: MotorPinsConfig<peripherals::PE11, peripherals::PE9>,
    pub e: MotorPinsConfig<peripherals::PE14, peripherals::PE12>,
    pub enable_pin: peripherals::PG0,
}

pub struct VrefConfig {
    pub timer: VrefTimer,
    pub ch1: peripherals::PB4,
    pub ch2: peripherals::PB5,
    pub ch3: peripherals::PC8,
    pub ch4: peripherals::PC9,
}

pub struct AccelerometerConfig {
    pub peripheral: AccelerometerSpi,
    pub clk: peripherals::PA5,
    pub miso: peripherals::PA6,
    pub mosi: peripherals::PA7,
    pub cs: peripherals::PD14,
}

pub struct EepromConfig {
    pub peripheral: EepromI2c,
    pub scl: peripherals::PB8,
    pub sda: peripherals::PB9,
}

pub struct EmergencyStopConfig {
    pub pin: peripherals::PC13,
    pub exti: peripherals::EXTI13,
}

pub struct PrinterConfig {
    pub motors: MotorsConfig,
    pub step_timer: StepTimerPeripheral,
    pub vref: VrefConfig,
    pub accelerometer: AccelerometerConfig,
    pub eeprom: EepromConfig,
    pub emergency_stop: EmergencyStopConfig,
    pub motion: MotionConfig,
}

pub fn peripherals_init(p: Peripherals) -> PrinterConfig {
    let mut motion = MotionConfig::default();
    motion.feed_rate = speed_from_millimeters_per_minute(1200.0);

    PrinterConfig {
        motors: MotorsConfig {
            x: MotorPinsConfig { step_pin: p.PF13, dir_pin: p.PF12 },
            y: MotorPinsConfig { step_pin: p.PF15, dir_pin: p.PF14 },
            z: MotorPinsConfig { step_pin: p.PE11, dir_pin: p.PE9 },
            e: MotorPinsConfig { step_pin: p.PE14, dir_pin: p.PE12 },
            enable_pin: p.PG0,
        },
        step_timer: p.TIM2,
        vref: VrefConfig {
            timer: p.TIM3,
            ch1: p.PB4,
            ch2: p.PB5,
            ch3: p.PC8,
            ch4: p.PC9,
        },
        accelerometer: AccelerometerConfig {
            peripheral: p.SPI1,
            clk: p.PA5,
            miso: p.PA6,
            mosi: p.PA7,
            cs: p.PD14,
        },
        eeprom: EepromConfig {
            peripheral: p.I2C1,
            scl: p.PB8,
            sda: p.PB9,
        },
        emergency_stop: EmergencyStopConfig {
            pin: p.PC13,
            exti: p.EXTI13,
        },
        motion,
    }
}
