#![cfg_attr(not(test), no_std)]

pub mod bed;
pub mod plane;

pub use bed::{BedCorner, BedGeometry, BedLayout, BedPlane, BedRegion};
pub use plane::{Plane, Triangle};
