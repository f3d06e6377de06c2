//! Index management (spec.md §3.2, §4.2 layer 4): the flat array of
//! head-sector addresses stored in sector 0, and name resolution over it.

use crate::error::Error;
use crate::flash::FlashBus;
use crate::layout::{self, Magic, ALL_ONES, FINFO_SIZE_B, INDEX_OFFSET, INDEX_SLOT_COUNT, PSEC, SECTOR_HEADER_LEN};
use crate::mount::{Clock, Mount, SupplyMonitor};

fn slot_addr(slot: usize) -> u32 {
    (INDEX_OFFSET + slot * 4) as u32
}

impl<B: FlashBus, C: Clock, S: SupplyMonitor> Mount<B, C, S> {
    pub(crate) fn read_index_slot(&mut self, slot: usize) -> u32 {
        let mut buf = [0u8; 4];
        self.read_flash(slot_addr(slot), &mut buf);
        u32::from_le_bytes(buf)
    }

    /// Programs a previously-all-ones index slot with `head_addr`.
    pub(crate) fn write_index_slot(&mut self, slot: usize, head_addr: u32) -> Result<(), Error> {
        self.program_flash(slot_addr(slot), &head_addr.to_le_bytes())
    }

    /// Reads a head sector's persisted name into a fixed 22-byte field.
    pub(crate) fn read_head_name(&mut self, head_addr: u32) -> [u8; 22] {
        let mut buf = [0u8; 22];
        self.read_flash(head_addr + SECTOR_HEADER_LEN as u32 + 8, &mut buf);
        buf
    }

    pub(crate) fn read_head_magic(&mut self, head_addr: u32) -> Option<Magic> {
        self.read_sector_header(head_addr).magic_state()
    }

    /// Walks the index up to the first all-ones slot, counting
    /// `files_used` (populated slots) and `files_active` (those whose
    /// head is `HeadActive`). When `validate_chains`, also walks each
    /// active file's chain, folding any structural problem into
    /// `error_count` rather than failing outright (the overall `Corrupt`
    /// decision is made by the caller).
    pub(crate) fn walk_index_counts(
        &mut self,
        validate_chains: bool,
        error_count: &mut u32,
    ) -> Result<(u32, u32), Error> {
        let mut files_used = 0u32;
        let mut files_active = 0u32;

        for slot in 0..INDEX_SLOT_COUNT {
            let addr = self.read_index_slot(slot);
            if addr == ALL_ONES {
                break;
            }
            files_used += 1;

            if addr % PSEC as u32 != 0 || addr >= self.total_size() {
                *error_count += 1;
                continue;
            }

            match self.read_head_magic(addr) {
                Some(Magic::HeadActive) => {
                    files_active += 1;
                    if validate_chains {
                        self.validate_chain(addr, error_count);
                    }
                }
                Some(Magic::HeadDeleted) => {}
                _ => *error_count += 1,
            }
        }

        Ok((files_used, files_active))
    }

    /// Bounded chain walk from a head sector, tallying any invariant
    /// violation (bad owner, non-`Data` link, cycle) into `error_count`.
    fn validate_chain(&mut self, head_addr: u32, error_count: &mut u32) {
        let mut current = head_addr;
        let mut seen = 0u32;
        let total_sectors = self.total_size() / PSEC as u32;

        loop {
            let hdr = self.read_sector_header(current);
            let next = hdr.next;
            if next == ALL_ONES {
                return;
            }

            seen += 1;
            if seen > total_sectors {
                *error_count += 1;
                return;
            }

            let next_hdr = self.read_sector_header(next);
            if next_hdr.magic_state() != Some(Magic::Data) {
                *error_count += 1;
                return;
            }
            if next_hdr.owner != head_addr {
                *error_count += 1;
                return;
            }

            current = next;
        }
    }

    /// Scans the index for a name match (returning the matching active
    /// head's slot and address) and, independently, the first reclaimable
    /// (`HeadDeleted`) slot encountered — used by `open` to decide
    /// between reusing a slot and appending a new one.
    pub(crate) fn scan_index_for_name(
        &mut self,
        name: &[u8; 22],
    ) -> Result<(Option<(usize, u32)>, Option<usize>), Error> {
        let mut active_match = None;
        let mut reclaimable = None;

        for slot in 0..INDEX_SLOT_COUNT {
            let addr = self.read_index_slot(slot);
            if addr == ALL_ONES {
                break;
            }

            match self.read_head_magic(addr) {
                Some(Magic::HeadActive) => {
                    if self.read_head_name(addr) == *name {
                        active_match = Some((slot, addr));
                    }
                }
                Some(Magic::HeadDeleted) => {
                    if reclaimable.is_none() {
                        reclaimable = Some(slot);
                    }
                }
                _ => return Err(Error::Corrupt),
            }
        }

        Ok((active_match, reclaimable))
    }

    /// Appends `head_addr` to the first all-ones index slot. Fails
    /// `IndexFull` if every slot is already populated.
    pub(crate) fn append_index_slot(&mut self, head_addr: u32) -> Result<usize, Error> {
        for slot in 0..INDEX_SLOT_COUNT {
            if self.read_index_slot(slot) == ALL_ONES {
                self.write_index_slot(slot, head_addr)?;
                return Ok(slot);
            }
        }
        Err(Error::IndexFull)
    }

    /// Reads the head sector's full file-info header. `FileInfoHeader::read`
    /// indexes at the file-info block's actual sector offsets (12.., per
    /// spec.md §3.1), so the buffer must start at the sector itself, not at
    /// the file-info block.
    pub(crate) fn read_file_info(&mut self, head_addr: u32) -> layout::FileInfoHeader {
        let mut buf = [0u8; SECTOR_HEADER_LEN + FINFO_SIZE_B];
        self.read_flash(head_addr, &mut buf);
        layout::FileInfoHeader::read(&buf)
    }
}
