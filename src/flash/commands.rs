//! Vendor command-opcode layer (spec.md §4.1): wraps the raw
//! [`FlashBus`] primitives into read/program/erase/identify operations,
//! enforcing per-operation wait-for-busy and write-enable latching.
//!
//! Opcodes and identification allow-list are grounded on the original
//! firmware's low/mid-level flash driver.

use crate::error::Error;
use crate::flash::bus::FlashBus;

const CMD_WRITEENABLE: u8 = 0x06;
const CMD_READDATA: u8 = 0x03;
const CMD_PAGEWRITE: u8 = 0x02;
const CMD_SECTOR4K_ERASE: u8 = 0x20;
const CMD_BULKERASE: u8 = 0xC7;
const CMD_STATUSREG: u8 = 0x05;
const CMD_RDID: u8 = 0x9F;
const CMD_DEEPPOWERDOWN: u8 = 0xB9;
const CMD_RELEASEDPD: u8 = 0xAB;

const STATUS_WIP: u8 = 0x01; // write-in-progress
const STATUS_WEL: u8 = 0x02; // write-enable-latch

const MIN_DENSITY: u8 = 0x0D;
const MAX_DENSITY: u8 = 0x18;

const MACRONIX_MANU_TYP: u16 = 0xC228;
const GIGADEV_MANU_TYP: u16 = 0xC840;

/// Decomposition of the 24-bit identification word (manufacturer : type :
/// density) read back by [`CommandLayer::identify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identification {
    pub manufacturer: u8,
    pub device_type: u8,
    pub density: u8,
}

impl Identification {
    /// Total flash size in bytes implied by the density byte (`1 <<
    /// density`).
    pub fn total_size(&self) -> u32 {
        1u32 << self.density
    }

    fn from_word(id: u32) -> Self {
        Identification {
            manufacturer: ((id >> 16) & 0xFF) as u8,
            device_type: ((id >> 8) & 0xFF) as u8,
            density: (id & 0xFF) as u8,
        }
    }

    pub fn as_word(&self) -> u32 {
        ((self.manufacturer as u32) << 16) | ((self.device_type as u32) << 8) | (self.density as u32)
    }
}

/// The opcode layer over a [`FlashBus`].
pub struct CommandLayer<B> {
    bus: B,
}

impl<B: FlashBus> CommandLayer<B> {
    pub fn new(bus: B) -> Self {
        CommandLayer { bus }
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn into_bus(self) -> B {
        self.bus
    }

    fn command(&mut self, opcode: u8) {
        self.bus.select();
        self.bus.spi_write(&[opcode]);
    }

    /// Reads the 8-bit status register.
    pub fn read_status(&mut self) -> u8 {
        self.command(CMD_STATUSREG);
        let mut status = [0u8; 1];
        self.bus.spi_read(&mut status);
        self.bus.deselect();
        status[0]
    }

    /// Polls the status register at roughly 1ms intervals until the
    /// write-in-progress bit clears, or `timeout_ms` elapses.
    pub fn busy_wait(&mut self, timeout_ms: u32) -> Result<(), Error> {
        for _ in 0..=timeout_ms {
            if self.read_status() & STATUS_WIP == 0 {
                return Ok(());
            }
            self.bus.wait_usec(1_000);
        }
        Err(Error::Timeout)
    }

    /// Latches write-enable; fails `WriteLocked` if the status register
    /// doesn't reflect the latch afterwards.
    pub fn write_enable(&mut self) -> Result<(), Error> {
        self.command(CMD_WRITEENABLE);
        self.bus.deselect();
        if self.read_status() & STATUS_WEL != 0 {
            Ok(())
        } else {
            Err(Error::WriteLocked)
        }
    }

    /// Reads the 24-bit manufacturer/type/density word and validates it
    /// against the supported device allow-list.
    pub fn identify(&mut self) -> Result<Identification, Error> {
        self.command(CMD_RDID);
        let mut raw = [0u8; 3];
        self.bus.spi_read(&mut raw);
        self.bus.deselect();

        let id = Identification::from_word(
            (raw[0] as u32) << 16 | (raw[1] as u32) << 8 | raw[2] as u32,
        );

        let manu_typ = ((id.manufacturer as u16) << 8) | id.device_type as u16;
        if manu_typ != MACRONIX_MANU_TYP && manu_typ != GIGADEV_MANU_TYP {
            return Err(Error::UnknownType);
        }
        if id.density < MIN_DENSITY || id.density > MAX_DENSITY {
            return Err(Error::BadDensity);
        }
        Ok(id)
    }

    /// Enters deep-power-down mode.
    pub fn deep_power_down(&mut self) {
        self.command(CMD_DEEPPOWERDOWN);
        self.bus.deselect();
    }

    /// Issues release-from-deep-power-down. Does not itself wait the
    /// mandatory settle time; callers use [`CommandLayer::wake`] for the
    /// full retrying sequence.
    pub fn release_from_deep_power_down(&mut self) {
        self.command(CMD_RELEASEDPD);
        self.bus.deselect();
    }

    /// Release-from-sleep sequence: release, wait 45µs, then try to read
    /// identification; retried up to three times total, since some chips
    /// only answer correctly on the second attempt after deep sleep.
    pub fn wake(&mut self) -> Result<Identification, Error> {
        let mut last_err = Error::Timeout;
        for _ in 0..3 {
            self.release_from_deep_power_down();
            self.bus.wait_usec(45);
            match self.identify() {
                Ok(id) => return Ok(id),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Reads `buf.len()` bytes starting at `address`.
    pub fn read(&mut self, address: u32, buf: &mut [u8]) {
        self.bus.select();
        self.bus.spi_write(&[
            CMD_READDATA,
            (address >> 16) as u8,
            (address >> 8) as u8,
            address as u8,
        ]);
        self.bus.spi_read(buf);
        self.bus.deselect();
    }

    /// Programs `data` at `address`. `data` must not cross a 256-byte
    /// page boundary; chunking to respect that boundary is the caller's
    /// responsibility (spec.md §4.1).
    pub fn page_program(&mut self, address: u32, data: &[u8], timeout_ms: u32) -> Result<(), Error> {
        if data.is_empty() {
            return Ok(());
        }
        let page_offset = (address & 0xFF) as usize;
        if page_offset + data.len() > 256 {
            return Err(Error::SectorBoundary);
        }

        self.write_enable()?;
        self.bus.select();
        self.bus.spi_write(&[
            CMD_PAGEWRITE,
            (address >> 16) as u8,
            (address >> 8) as u8,
            address as u8,
        ]);
        self.bus.spi_write(data);
        self.bus.deselect();
        self.busy_wait(timeout_ms).map_err(|_| Error::WriteFailed)
    }

    /// Erases the 4kB sector containing `address`.
    pub fn sector_erase_4k(&mut self, address: u32, timeout_ms: u32) -> Result<(), Error> {
        self.write_enable()?;
        self.command(CMD_SECTOR4K_ERASE);
        self.bus.spi_write(&[
            (address >> 16) as u8,
            (address >> 8) as u8,
            address as u8,
        ]);
        self.bus.deselect();
        self.busy_wait(timeout_ms).map_err(|_| Error::EraseFailed)
    }

    /// Erases the entire chip.
    pub fn bulk_erase(&mut self, timeout_ms: u32) -> Result<(), Error> {
        self.write_enable()?;
        self.command(CMD_BULKERASE);
        self.bus.deselect();
        self.busy_wait(timeout_ms).map_err(|_| Error::EraseFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identification_round_trips_through_word() {
        let id = Identification { manufacturer: 0xC2, device_type: 0x28, density: 0x17 };
        assert_eq!(Identification::from_word(id.as_word()), id);
        assert_eq!(id.total_size(), 1 << 0x17);
    }
}
