//! An embedded file system for SPI-attached NOR flash.
//!
//! Persists named files on a raw flash chip, coping with the
//! program/erase asymmetry of NOR (bits flip 1→0 on program, a whole
//! sector resets to 1 on erase) and with sudden power loss mid-write.
//! See [`mount`] for the entry point.

#![cfg_attr(not(feature = "std"), no_std)]

macro_rules! using_std { ($($i:item)*) => ($(#[cfg(feature = "std")]$i)*) }
pub(crate) use using_std;

pub mod crc;
pub mod date;
pub mod descriptor;
pub mod dir;
pub mod error;
pub mod file;
pub mod flash;
pub mod fsck;
pub mod layout;
pub mod mount;
pub mod sector;
pub mod util;

pub use descriptor::FileDescriptor;
pub use error::Error;
pub use mount::{Config, Mount, MountStats};
