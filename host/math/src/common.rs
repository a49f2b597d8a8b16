use measurements::{Length, Speed};

/*
thin wrappers around libm so that the rest of the firmware never depends on
std float methods. The results are the IEEE ones, so they can be used to
compute step counters up to the whole u32 range.
*/
pub fn abs(value: f32) -> f32 {
    libm::fabsf(value)
}

pub fn round(value: f32) -> f32 {
    libm::roundf(value)
}

pub fn ceil(value: f32) -> f32 {
    libm::ceilf(value)
}

pub fn sqrt(value: f32) -> f32 {
    libm::sqrtf(value)
}

// g-code feed rates are expressed in mm/min
pub fn millimeters_per_minute(speed: Speed) -> f32 {
    (speed.as_meters_per_second() * 60_000.0) as f32
}

pub fn speed_from_millimeters_per_minute(value: f32) -> Speed {
    Speed::from_meters_per_second(f64::from(value) / 60_000.0)
}

pub fn millimeters(length: Length) -> f32 {
    length.as_millimeters() as f32
}
