//! Audio endpoints as reported by the capture worker

pub mod device;

pub use device::{DataFlow, Device, DeviceState, Role};
