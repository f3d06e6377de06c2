//! The physical driver and flash-command layers (spec.md §4.1, §6.1).

pub mod bus;
pub mod commands;

pub use bus::FlashBus;
pub use commands::{CommandLayer, Identification};
