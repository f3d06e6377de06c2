//! Mount lifecycle (spec.md §4.4, §4.5): `start`, `format`, and the
//! process-wide mount state they populate.

use generic_array::GenericArray;
use log::{debug, trace, warn};
use typenum::U128;

use crate::error::Error;
use crate::flash::{CommandLayer, FlashBus, Identification};
use crate::layout::{self, Magic, Superblock, ALL_ONES, PSEC, SECTOR_HEADER_LEN};

/// The shared scratch buffer's size, as an `ArrayLength` rather than a
/// bare `usize` so the buffer's type carries its own capacity
/// (`SF_BUFFER_SIZE_B`).
pub(crate) type ScratchBuf = GenericArray<u8, U128>;

/// A wall-clock source returning UNIX seconds (spec.md §6.1).
pub trait Clock {
    fn now_unix(&mut self) -> u32;
}

/// A supply-voltage checker (spec.md §4.1); consulted by `start`.
pub trait SupplyMonitor {
    /// Returns `true` when the supply is within the operating range.
    fn is_ok(&mut self) -> bool;
}

/// Runtime-configurable knobs that the original expressed as build-time
/// `#define`s (spec.md §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Max bytes read from flash in a single driver call.
    pub rd_transfer_limit: usize,
    /// Max bytes programmed in a single driver call (still bounded by the
    /// chip's 256-byte page).
    pub tx_transfer_limit: usize,
    pub page_program_timeout_ms: u32,
    pub sector_erase_timeout_ms: u32,
    pub bulk_erase_timeout_ms: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rd_transfer_limit: 4096,
            tx_transfer_limit: 256,
            page_program_timeout_ms: 100,
            sector_erase_timeout_ms: 400,
            bulk_erase_timeout_ms: 30_000,
        }
    }
}

/// Mode argument to [`Mount::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// Full per-sector structural validation.
    Normal,
    /// Tally-only per-sector scan; trusts the structural invariants.
    Fast,
    /// Just a wake, if the previously observed chip matches; falls back
    /// to `Normal` otherwise.
    Restart,
}

/// Mode argument to [`Mount::format`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatMode {
    /// Single chip-erase command.
    Full,
    /// Per-sector erase, skipping sectors that are already fully erased.
    Soft,
}

/// Bits tracked in the mount's state flag (spec.md §3.5).
mod state_flags {
    pub const DEEP_SLEEP: u8 = 0b01;
    pub const POWER_FAIL: u8 = 0b10;
}

/// A point-in-time snapshot of the counters `start` derives (spec.md
/// §3.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MountStats {
    pub files_used: u32,
    pub files_active: u32,
    pub available_disk_size: u32,
    pub clear_sectors: u32,
    pub todelete_sectors: u32,
    pub unknown_sectors: u32,
}

/// The mount: flash command layer, capability handles, configuration,
/// and the process-wide counters `start` derives. Owned by a single
/// caller; no internal locking (spec.md §5).
pub struct Mount<B, C, S> {
    pub(crate) commands: CommandLayer<B>,
    pub(crate) clock: C,
    pub(crate) supply: S,
    pub(crate) config: Config,

    pub(crate) identification: Identification,
    pub(crate) total_size: u32,
    pub(crate) disk_ctime: u32,
    /// `lusect_adr`: the last-used PSEC address, the allocator's cursor.
    pub(crate) cursor: u32,

    pub(crate) stats: MountStats,

    pub(crate) state: u8,

    /// The shared 128-byte scratch buffer (`SF_BUFFER_SIZE_B`).
    pub(crate) scratch: ScratchBuf,
}

impl<B: FlashBus, C: Clock, S: SupplyMonitor> Mount<B, C, S> {
    /// Builds a mount around a not-yet-started driver; call [`Mount::start`]
    /// or [`Mount::format`] before doing anything else.
    pub fn new(bus: B, clock: C, supply: S, config: Config) -> Self {
        Mount {
            commands: CommandLayer::new(bus),
            clock,
            supply,
            config,
            identification: Identification { manufacturer: 0, device_type: 0, density: 0 },
            total_size: 0,
            disk_ctime: ALL_ONES,
            cursor: 0,
            stats: MountStats {
                files_used: 0,
                files_active: 0,
                available_disk_size: 0,
                clear_sectors: 0,
                todelete_sectors: 0,
                unknown_sectors: 0,
            },
            state: 0,
            scratch: GenericArray::default(),
        }
    }

    pub fn stats(&self) -> MountStats {
        self.stats
    }

    pub fn identification(&self) -> Identification {
        self.identification
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    pub fn disk_ctime(&self) -> u32 {
        self.disk_ctime
    }

    /// Direct access to the underlying driver, e.g. to snapshot a
    /// RAM-backed simulator for a power-loss test.
    pub fn bus_mut(&mut self) -> &mut B {
        self.commands.bus_mut()
    }

    fn total_sectors(&self) -> u32 {
        self.total_size / PSEC as u32
    }

    pub(crate) fn is_deep_sleep(&self) -> bool {
        self.state & state_flags::DEEP_SLEEP != 0
    }

    pub(crate) fn is_power_fail(&self) -> bool {
        self.state & state_flags::POWER_FAIL != 0
    }

    /// Guard shared by every mutating file operation (spec.md §4.1: a
    /// failed supply check refuses all mutating operations until the next
    /// successful `start`).
    pub(crate) fn ensure_not_sleeping_or_power_fail(&self) -> Result<(), Error> {
        if self.is_deep_sleep() {
            return Err(Error::SleepingBusy);
        }
        if self.is_power_fail() {
            return Err(Error::SupplyLow);
        }
        Ok(())
    }

    /// Reads `buf` starting at `address`, chunked by the configured read
    /// transfer limit. No call to the driver crosses a sector boundary.
    pub(crate) fn read_flash(&mut self, mut address: u32, mut buf: &mut [u8]) {
        while !buf.is_empty() {
            let room_in_sector = PSEC - (address as usize % PSEC);
            let chunk = buf.len().min(self.config.rd_transfer_limit).min(room_in_sector);
            let (head, tail) = buf.split_at_mut(chunk);
            self.commands.read(address, head);
            address += chunk as u32;
            buf = tail;
        }
    }

    /// Programs `data` at `address`, chunked to respect both the 256-byte
    /// page boundary and the configured write transfer limit.
    pub(crate) fn program_flash(&mut self, mut address: u32, mut data: &[u8]) -> Result<(), Error> {
        while !data.is_empty() {
            let room_in_page = 256 - (address as usize % 256);
            let chunk = data.len().min(self.config.tx_transfer_limit).min(room_in_page);
            let (head, tail) = data.split_at(chunk);
            self.commands.page_program(address, head, self.config.page_program_timeout_ms)?;
            address += chunk as u32;
            data = tail;
        }
        Ok(())
    }

    pub(crate) fn erase_sector(&mut self, sector_addr: u32) -> Result<(), Error> {
        self.commands.sector_erase_4k(sector_addr, self.config.sector_erase_timeout_ms)
    }

    pub(crate) fn read_sector_header(&mut self, sector_addr: u32) -> layout::SectorHeader {
        let mut buf = [0u8; SECTOR_HEADER_LEN];
        self.read_flash(sector_addr, &mut buf);
        layout::SectorHeader::read(&buf)
    }

    /// Sends the chip to deep power down. Fails `AlreadySleeping` if
    /// already asleep.
    pub fn deep_sleep(&mut self) -> Result<(), Error> {
        if self.is_deep_sleep() {
            return Err(Error::AlreadySleeping);
        }
        self.commands.deep_power_down();
        self.state |= state_flags::DEEP_SLEEP;
        Ok(())
    }

    /// Mounts the disk. See spec.md §4.4 for the mode semantics.
    pub fn start(&mut self, mode: StartMode) -> Result<(), Error> {
        self.commands.bus_mut().spi_init().map_err(|_| Error::SpiInit)?;

        if !self.supply.is_ok() {
            self.state |= state_flags::POWER_FAIL;
            return Err(Error::SupplyLow);
        }
        self.state &= !state_flags::POWER_FAIL;

        let id = self.commands.wake()?;
        self.state &= !state_flags::DEEP_SLEEP;
        trace!("identification {:02x}:{:02x}:{:02x}", id.manufacturer, id.device_type, id.density);

        if mode == StartMode::Restart
            && id == self.identification
            && id.total_size() == self.total_size
        {
            return Ok(());
        }

        self.identification = id;
        self.total_size = id.total_size();

        let mut sb_buf = [0u8; SECTOR_HEADER_LEN];
        self.read_flash(0, &mut sb_buf);
        let sb = Superblock::read(&sb_buf);

        if !sb.is_formatted() {
            return Err(Error::Unformatted);
        }
        if sb.disk_magic != layout::DISK_MAGIC {
            return Err(Error::BadHeader);
        }
        if sb.identification != id.as_word() {
            return Err(Error::IdMismatch);
        }
        self.disk_ctime = sb.disk_ctime;

        let normal = mode != StartMode::Fast;
        let mut error_count: u32 = 0;

        let mut clear = 0u32;
        let mut todelete = 0u32;
        let mut unknown = 0u32;
        let mut head_count = 0u32;
        let mut occupied = 0u32; // HeadActive + HeadDeleted + Data

        let total_sectors = self.total_sectors();
        for sector_idx in 1..total_sectors {
            let addr = sector_idx * PSEC as u32;
            let hdr = self.read_sector_header(addr);

            match hdr.magic_state() {
                None => {
                    unknown += 1;
                    error_count += 1;
                }
                Some(Magic::Free) => clear += 1,
                Some(Magic::ToDelete) => {
                    // Reclaimable in place by the allocator (it erases a
                    // ToDelete sector before handing it out), so it counts
                    // as available space, not occupied — matching the
                    // incremental accounting `delete`/`open` already do the
                    // moment a sector becomes ToDelete.
                    todelete += 1;
                    if normal && (hdr.owner % PSEC as u32 != 0 || hdr.owner >= self.total_size) {
                        error_count += 1;
                    }
                }
                Some(Magic::Data) => {
                    occupied += 1;
                    if normal && (hdr.owner % PSEC as u32 != 0 || hdr.owner >= self.total_size) {
                        error_count += 1;
                    }
                }
                Some(Magic::HeadActive) | Some(Magic::HeadDeleted) => {
                    head_count += 1;
                    occupied += 1;
                    if normal && hdr.owner != ALL_ONES {
                        error_count += 1;
                    }
                }
            }
        }

        debug!(
            "sector scan: {} head, {} occupied, {} clear, {} todelete, {} unknown",
            head_count, occupied, clear, todelete, unknown
        );

        let (files_used, files_active) = self.walk_index_counts(normal, &mut error_count)?;

        if normal && files_used != head_count {
            warn!("index claims {} files but sector scan found {} heads", files_used, head_count);
            return Err(Error::Corrupt);
        }
        if error_count > 0 && normal {
            return Err(Error::Corrupt);
        }

        self.stats = MountStats {
            files_used,
            files_active,
            available_disk_size: self.total_size - PSEC as u32 - occupied * PSEC as u32,
            clear_sectors: clear,
            todelete_sectors: todelete,
            unknown_sectors: unknown,
        };

        self.cursor = 0;

        Ok(())
    }

    /// Formats the disk (spec.md §4.5), then mounts it in `Normal` mode.
    pub fn format(&mut self, mode: FormatMode) -> Result<(), Error> {
        self.commands.bus_mut().spi_init().map_err(|_| Error::SpiInit)?;
        let id = self.commands.wake()?;
        self.identification = id;
        self.total_size = id.total_size();

        match mode {
            FormatMode::Full => {
                self.commands.bulk_erase(self.config.bulk_erase_timeout_ms)?;
            }
            FormatMode::Soft => {
                let total_sectors = self.total_sectors();
                for sector_idx in 0..total_sectors {
                    let addr = sector_idx * PSEC as u32;
                    let hdr = self.read_sector_header(addr);
                    let needs_erase = match hdr.magic_state() {
                        Some(Magic::Free) => self.find_last_used_offset(addr, 0).is_some(),
                        _ => true,
                    };
                    if needs_erase {
                        self.erase_sector(addr)?;
                    }
                }
            }
        }

        let ctime = self.clock.now_unix();
        let sb = Superblock {
            disk_magic: layout::DISK_MAGIC,
            identification: id.as_word(),
            disk_ctime: ctime,
        };
        let mut buf = [0u8; SECTOR_HEADER_LEN];
        sb.write(&mut buf);
        self.program_flash(0, &buf)?;

        self.start(StartMode::Normal)
    }
}
