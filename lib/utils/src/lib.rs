//! Small helpers shared by the device-tree and driver-model crates.
#![no_std]

pub mod endian;
pub mod num;
