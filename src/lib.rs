//! FOTA update of an external Wi-Fi co-processor, driven from the host MCU.
//!
//! Everything except `platform` is hardware independent and tested on the
//! development machine.

pub mod config;
pub mod fota;
pub mod logging;
pub mod platform;
pub mod shell;

#[cfg(test)]
mod tests;
