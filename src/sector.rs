//! Sector manager (spec.md §4.2): free-sector allocation, unclosed-file
//! length recovery, and page-safe intra-flash copies.
//!
//! Grounded on the original firmware's `sflash_get_free_sector`,
//! `sflash_find_mlen`, and `flash_intrasec_copy`.

use generic_array::GenericArray;

use crate::error::Error;
use crate::flash::FlashBus;
use crate::layout::{Magic, ALL_ONES, PSEC};
use crate::mount::{Clock, Mount, SupplyMonitor};

impl<B: FlashBus, C: Clock, S: SupplyMonitor> Mount<B, C, S> {
    /// Rotates the allocator cursor forward one PSEC at a time, wrapping
    /// past sector 0, and returns the first `Free` or `ToDelete` sector
    /// found within one full rotation. A `ToDelete` sector is erased in
    /// place before being handed back. Fails `OutOfSpace` if none is
    /// found.
    pub(crate) fn allocate_free_sector(&mut self) -> Result<u32, Error> {
        let total_sectors = self.total_size() / PSEC as u32;

        let mut idx = self.cursor / PSEC as u32;
        for _ in 0..total_sectors {
            idx = if idx + 1 >= total_sectors { 1 } else { idx + 1 };
            let addr = idx * PSEC as u32;

            match self.read_sector_header(addr).magic_state() {
                Some(Magic::Free) => {
                    self.cursor = addr;
                    return Ok(addr);
                }
                Some(Magic::ToDelete) => {
                    self.erase_sector(addr)?;
                    self.cursor = addr;
                    return Ok(addr);
                }
                _ => continue,
            }
        }

        Err(Error::OutOfSpace)
    }

    /// Scans a sector backwards from its end, through the shared scratch
    /// buffer, looking for the last non-`0xFF` byte at or after
    /// `start_offset`. Returns `None` if the whole range is erased
    /// (all-ones), meaning nothing has been written there yet.
    pub(crate) fn find_last_used_offset(&mut self, sector_addr: u32, start_offset: usize) -> Option<usize> {
        let mut scratch = core::mem::replace(&mut self.scratch, GenericArray::default());
        let mut pos = PSEC;
        let result = loop {
            if pos <= start_offset {
                break None;
            }
            let take = (pos - start_offset).min(scratch.len());
            let chunk_start = pos - take;
            self.read_flash(sector_addr + chunk_start as u32, &mut scratch[..take]);

            if let Some(i) = (0..take).rev().find(|&i| scratch[i] != 0xFF) {
                break Some(chunk_start + i);
            }
            pos = chunk_start;
        };
        self.scratch = scratch;
        result
    }

    /// Copies `len` bytes from `src_addr` to `dst_addr`, through the
    /// scratch buffer, in chunks small enough that each resulting
    /// program call respects the 256-byte page boundary (handled by
    /// [`Mount::program_flash`]).
    pub(crate) fn intrasec_copy(&mut self, src_addr: u32, dst_addr: u32, len: usize) -> Result<(), Error> {
        let mut scratch = core::mem::replace(&mut self.scratch, GenericArray::default());
        let mut remaining = len;
        let mut s = src_addr;
        let mut d = dst_addr;

        let result = (|| {
            while remaining > 0 {
                let chunk = remaining.min(scratch.len());
                self.read_flash(s, &mut scratch[..chunk]);
                self.program_flash(d, &scratch[..chunk])?;
                s += chunk as u32;
                d += chunk as u32;
                remaining -= chunk;
            }
            Ok(())
        })();

        self.scratch = scratch;
        result
    }

    /// Marks every sector of the chain rooted at `head_addr` for removal:
    /// the head becomes `HeadDeleted`, every `Data` link becomes
    /// `ToDelete`. Bounded by the total sector count; fails `ChainLoop`
    /// if the chain doesn't terminate within that bound.
    pub(crate) fn mark_chain_deleted(&mut self, head_addr: u32) -> Result<u32, Error> {
        let total_sectors = self.total_size() / PSEC as u32;

        let head_magic = Magic::HeadDeleted.as_word();
        self.program_flash(head_addr, &head_magic.to_le_bytes())?;

        let mut chain_len = 1u32;
        let mut current = self.read_sector_header(head_addr).next;
        while current != ALL_ONES {
            if chain_len > total_sectors {
                return Err(Error::ChainLoop);
            }
            let next = self.read_sector_header(current).next;
            let todelete = Magic::ToDelete.as_word();
            self.program_flash(current, &todelete.to_le_bytes())?;
            chain_len += 1;
            current = next;
        }

        Ok(chain_len)
    }
}
