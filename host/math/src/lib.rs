#![cfg_attr(not(test), no_std)]

pub use measurements;

pub mod common;
pub mod vector;
