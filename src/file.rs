//! File lifecycle operations (spec.md §4.3): open, read, write, close,
//! delete, rename, rewind, info.

use log::trace;

use crate::crc::Crc32;
use crate::descriptor::{DescriptorState, FileDescriptor};
use crate::error::Error;
use crate::flash::FlashBus;
use crate::layout::{
    self, has_flag, open_flags, pack_name, stat_flags, Magic, SectorHeader, ALL_ONES,
    DATA_PAYLOAD_OFFSET, FINFO_SIZE_B, HEAD_PAYLOAD_CAPACITY, HEAD_PAYLOAD_OFFSET, PSEC,
    SECTOR_HEADER_LEN,
};
use crate::mount::{Clock, Mount, SupplyMonitor};

/// A directory-entry snapshot returned by [`Mount::info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: [u8; 22],
    pub ctime: u32,
    /// `None` while the file is unclosed.
    pub len: Option<u32>,
    pub crc32: u32,
    pub open_flags: u8,
    pub stat_flags: u8,
}

impl<B: FlashBus, C: Clock, S: SupplyMonitor> Mount<B, C, S> {
    fn payload_offset(&self, desc: &FileDescriptor) -> usize {
        if desc.work_addr == desc.head_addr { HEAD_PAYLOAD_OFFSET } else { DATA_PAYLOAD_OFFSET }
    }

    /// Opens (or creates) a file by name (spec.md §4.3 `open`).
    pub fn open(&mut self, desc: &mut FileDescriptor, name: &[u8], flags: u8) -> Result<(), Error> {
        self.ensure_not_sleeping_or_power_fail()?;
        let name_field = pack_name(name)?;
        let (active_match, reclaimable) = self.scan_index_for_name(&name_field)?;

        let creating = has_flag(flags, open_flags::CREATE);
        let read_or_raw = has_flag(flags, open_flags::READ) || has_flag(flags, open_flags::RAW);

        if let Some((_slot, head_addr)) = active_match {
            if !read_or_raw {
                // Neither READ nor RAW: the existing chain is tombstoned and
                // the slot's head sector reused fresh, matching the original
                // firmware's open() (it truncates whenever the caller isn't
                // explicitly preserving the chain, not merely when WRITE is
                // set).
                let chain_len = self.mark_chain_deleted(head_addr)?;
                self.stats.files_active -= 1;
                self.stats.available_disk_size += (chain_len - 1) * PSEC as u32;
                self.erase_sector(head_addr)?;
                return self.write_fresh_head(desc, head_addr, &name_field, flags, false);
            }

            let info = self.read_file_info(head_addr);
            desc.state = DescriptorState::Open;
            desc.head_addr = head_addr;
            desc.work_addr = head_addr;
            desc.file_pos = 0;
            desc.file_len = info.len;
            desc.crc = Crc32::INIT;
            desc.ctime = info.ctime;
            desc.sector_rel_offset = HEAD_PAYLOAD_OFFSET as u32;
            desc.open_flags = flags;
            if info.is_unclosed() {
                // Informative only: reflects the on-flash state back onto
                // the in-memory descriptor, not persisted anywhere.
                desc.open_flags |= open_flags::XOPEN_UNCLOSED;
            }
            return Ok(());
        }

        if !creating {
            return Err(Error::NotFound);
        }

        if let Some(slot) = reclaimable {
            let head_addr = self.read_index_slot(slot);
            self.erase_sector(head_addr)?;
            self.write_fresh_head(desc, head_addr, &name_field, flags, false)
        } else {
            let head_addr = self.allocate_free_sector()?;
            self.append_index_slot(head_addr)?;
            self.stats.files_used += 1;
            self.write_fresh_head(desc, head_addr, &name_field, flags, true)
        }
    }

    /// Writes a brand-new head sector's `MAGIC` + file-info block (the
    /// payload area stays erased) and initialises `desc` to point at it.
    fn write_fresh_head(
        &mut self,
        desc: &mut FileDescriptor,
        head_addr: u32,
        name: &[u8; 22],
        flags: u8,
        newly_allocated: bool,
    ) -> Result<(), Error> {
        let ctime = self.clock.now_unix();

        let sector_hdr = SectorHeader { magic: Magic::HeadActive.as_word(), owner: ALL_ONES, next: ALL_ONES };
        let finfo = layout::FileInfoHeader { len: ALL_ONES, crc32: ALL_ONES, name: *name, ctime, open_flags: flags };

        let mut buf = [0u8; SECTOR_HEADER_LEN + FINFO_SIZE_B];
        sector_hdr.write(&mut buf[..SECTOR_HEADER_LEN]);
        finfo.write(&mut buf[..]);
        self.program_flash(head_addr, &buf)?;

        if newly_allocated {
            self.stats.available_disk_size -= PSEC as u32;
        }
        self.stats.files_active += 1;

        desc.state = DescriptorState::Open;
        desc.head_addr = head_addr;
        desc.work_addr = head_addr;
        desc.file_pos = 0;
        desc.file_len = ALL_ONES;
        desc.crc = Crc32::INIT;
        desc.ctime = ctime;
        desc.sector_rel_offset = HEAD_PAYLOAD_OFFSET as u32;
        desc.open_flags = flags;

        trace!("opened new head at {:#x}", head_addr);
        Ok(())
    }

    /// Writes `data` (spec.md §4.3 `write`). Returns the number of bytes
    /// written (always `data.len()` on success).
    pub fn write(&mut self, desc: &mut FileDescriptor, data: &[u8]) -> Result<usize, Error> {
        self.ensure_not_sleeping_or_power_fail()?;
        if !desc.is_open() {
            return Err(Error::BadDescriptor);
        }
        let write_flag = has_flag(desc.open_flags, open_flags::WRITE);
        let raw_flag = has_flag(desc.open_flags, open_flags::RAW);
        if raw_flag {
            // RAW is append-only regardless of WRITE: the caller must have
            // advanced to the current end of file first (e.g. via a
            // skip-read), matching the original firmware's fs_write.
            match desc.file_len() {
                Some(len) if len == desc.file_pos => {}
                _ => return Err(Error::NotWritable),
            }
        } else if !write_flag {
            return Err(Error::NotWritable);
        }

        let crc_flag = has_flag(desc.open_flags, open_flags::CRC);
        let mut written = 0usize;

        while written < data.len() {
            let payload_offset = self.payload_offset(desc);
            let capacity = PSEC - payload_offset;
            let used = desc.sector_rel_offset as usize - payload_offset;
            let room = capacity - used;

            if room == 0 {
                let new_addr = self.allocate_free_sector()?;
                let new_hdr = SectorHeader { magic: Magic::Data.as_word(), owner: desc.head_addr, next: ALL_ONES };
                let mut hdr_buf = [0u8; SECTOR_HEADER_LEN];
                new_hdr.write(&mut hdr_buf);
                // New sector's MAGIC+OWNER first, then the previous sector's
                // NEXT — the crash-consistency ordering (spec.md §4.3).
                self.program_flash(new_addr, &hdr_buf)?;
                self.program_flash(desc.work_addr + 8, &new_addr.to_le_bytes())?;
                self.stats.available_disk_size -= PSEC as u32;
                desc.work_addr = new_addr;
                desc.sector_rel_offset = DATA_PAYLOAD_OFFSET as u32;
                continue;
            }

            let chunk = room.min(data.len() - written);
            let chunk_data = &data[written..written + chunk];
            self.program_flash(desc.work_addr + desc.sector_rel_offset, chunk_data)?;

            if crc_flag {
                let mut crc = Crc32::resume(desc.crc);
                crc.update(chunk_data);
                desc.crc = crc.raw();
            }

            desc.sector_rel_offset += chunk as u32;
            desc.file_pos += chunk as u32;
            written += chunk;
        }

        Ok(written)
    }

    /// Reads up to `len` bytes (spec.md §4.3 `read`). `dest = None` means
    /// "advance only": position moves but nothing is copied out and the
    /// running CRC is not touched.
    pub fn read(&mut self, desc: &mut FileDescriptor, mut dest: Option<&mut [u8]>, len: u32) -> Result<u32, Error> {
        if !desc.is_open() {
            return Err(Error::BadDescriptor);
        }
        let readable = has_flag(desc.open_flags, open_flags::READ) || has_flag(desc.open_flags, open_flags::RAW);
        if !readable {
            return Err(Error::BadDescriptor);
        }
        let crc_flag = has_flag(desc.open_flags, open_flags::CRC);

        let mut remaining_request = len;
        let mut total_read = 0u32;

        loop {
            if remaining_request == 0 {
                break;
            }
            if let Some(known_len) = desc.file_len() {
                if desc.file_pos >= known_len {
                    break;
                }
            }

            let sector_end = PSEC as u32;
            let mut in_sector_room = sector_end - desc.sector_rel_offset;

            let next = self.read_sector_header(desc.work_addr).next;
            let at_last_sector = next == ALL_ONES;

            if in_sector_room == 0 {
                if at_last_sector {
                    if let Some(known_len) = desc.file_len() {
                        if desc.file_pos < known_len {
                            // A closed file's chain ended before its
                            // persisted LEN: corruption, not end-of-file.
                            return Err(Error::Truncated);
                        }
                    }
                    break;
                }
                desc.work_addr = next;
                desc.sector_rel_offset = DATA_PAYLOAD_OFFSET as u32;
                continue;
            }

            if desc.file_len().is_none() && at_last_sector {
                match self.find_last_used_offset(desc.work_addr, desc.sector_rel_offset as usize) {
                    Some(last) => {
                        in_sector_room = (last + 1) as u32 - desc.sector_rel_offset;
                        // Memoize the discovered absolute end now, before `want`
                        // is clipped to the caller's request size below — a
                        // request smaller than what's left on flash must not
                        // poison file_len to less than the real end (spec.md
                        // §4.3 `read`).
                        desc.file_len = desc.file_pos + in_sector_room;
                    }
                    None => {
                        desc.file_len = desc.file_pos;
                        break;
                    }
                }
            }

            let mut want = if remaining_request == ALL_ONES {
                in_sector_room
            } else {
                in_sector_room.min(remaining_request)
            };
            if let Some(known_len) = desc.file_len() {
                want = want.min(known_len - desc.file_pos);
            }

            match dest.as_deref_mut() {
                Some(buf) => {
                    let out = &mut buf[total_read as usize..(total_read + want) as usize];
                    self.read_flash(desc.work_addr + desc.sector_rel_offset, out);
                    if crc_flag {
                        let mut crc = Crc32::resume(desc.crc);
                        crc.update(out);
                        desc.crc = crc.raw();
                    }
                }
                None => {}
            }

            desc.sector_rel_offset += want;
            desc.file_pos += want;
            total_read += want;
            if remaining_request != ALL_ONES {
                remaining_request -= want;
            }
        }

        Ok(total_read)
    }

    /// Resets a descriptor to the start of the file. Forbidden while
    /// opened for `WRITE`.
    pub fn rewind(&mut self, desc: &mut FileDescriptor) -> Result<(), Error> {
        if !desc.is_open() {
            return Err(Error::BadDescriptor);
        }
        if has_flag(desc.open_flags, open_flags::WRITE) {
            return Err(Error::NotWritable);
        }
        desc.file_pos = 0;
        desc.work_addr = desc.head_addr;
        desc.sector_rel_offset = HEAD_PAYLOAD_OFFSET as u32;
        desc.crc = Crc32::INIT;
        Ok(())
    }

    /// Finalises a file opened for `WRITE`; a no-op (besides invalidating
    /// the descriptor) for `READ`/`RAW`.
    pub fn close(&mut self, desc: &mut FileDescriptor) -> Result<(), Error> {
        if !desc.is_open() {
            return Err(Error::BadDescriptor);
        }
        if has_flag(desc.open_flags, open_flags::WRITE) {
            self.ensure_not_sleeping_or_power_fail()?;
            let mut buf = [0u8; 8];
            buf[0..4].copy_from_slice(&desc.file_pos.to_le_bytes());
            buf[4..8].copy_from_slice(&Crc32::resume(desc.crc).finalize().to_le_bytes());
            self.program_flash(desc.head_addr + SECTOR_HEADER_LEN as u32, &buf)?;
        }
        desc.invalidate();
        Ok(())
    }

    /// Tombstones the file. Refuses while opened for `WRITE`.
    pub fn delete(&mut self, desc: &mut FileDescriptor) -> Result<(), Error> {
        self.ensure_not_sleeping_or_power_fail()?;
        if !desc.is_open() {
            return Err(Error::BadDescriptor);
        }
        if has_flag(desc.open_flags, open_flags::WRITE) {
            return Err(Error::NotWritable);
        }
        let chain_len = self.mark_chain_deleted(desc.head_addr)?;
        self.stats.files_active -= 1;
        self.stats.available_disk_size += (chain_len - 1) * PSEC as u32;
        desc.invalidate();
        Ok(())
    }

    /// Renames `src` to the name already held by the freshly-created,
    /// empty `dst`. See spec.md §4.3 `rename` and §9's note on the
    /// transient state between erasing and reinstating `src`'s head.
    pub fn rename(&mut self, src: &mut FileDescriptor, dst: &mut FileDescriptor) -> Result<(), Error> {
        self.ensure_not_sleeping_or_power_fail()?;
        if !src.is_open() || !dst.is_open() {
            return Err(Error::BadDescriptor);
        }
        if src.head_addr == dst.head_addr {
            return Err(Error::RenameBothOpen);
        }
        let src_writable = has_flag(src.open_flags, open_flags::WRITE) || has_flag(src.open_flags, open_flags::RAW);
        if !src_writable {
            return Err(Error::RenameBadFlags);
        }

        let dst_info = self.read_file_info(dst.head_addr);
        let dst_empty = match dst_info.len {
            0 => true,
            ALL_ONES => self.find_last_used_offset(dst.head_addr, HEAD_PAYLOAD_OFFSET).is_none(),
            _ => false,
        };
        if !dst_empty {
            return Err(Error::RenameNeedsEmptyTarget);
        }

        let src_hdr = self.read_sector_header(src.head_addr);
        let src_info = self.read_file_info(src.head_addr);

        // The part of the file's payload that lives inline in the head
        // sector itself would otherwise be lost when that sector is
        // erased below; stash it in the (guaranteed-empty) destination
        // head sector's payload area and copy it back once src's header
        // has been rewritten (spec.md §4.3 `rename`).
        let payload_len = match src_info.len {
            ALL_ONES => self
                .find_last_used_offset(src.head_addr, HEAD_PAYLOAD_OFFSET)
                .map(|last| last + 1 - HEAD_PAYLOAD_OFFSET)
                .unwrap_or(0),
            len => (len as usize).min(HEAD_PAYLOAD_CAPACITY),
        };
        if payload_len > 0 {
            self.intrasec_copy(
                src.head_addr + HEAD_PAYLOAD_OFFSET as u32,
                dst.head_addr + HEAD_PAYLOAD_OFFSET as u32,
                payload_len,
            )?;
        }

        self.erase_sector(src.head_addr)?;

        let new_hdr = SectorHeader { magic: Magic::HeadActive.as_word(), owner: ALL_ONES, next: src_hdr.next };
        let new_info = layout::FileInfoHeader {
            len: src_info.len,
            crc32: src_info.crc32,
            name: dst_info.name,
            ctime: src_info.ctime,
            open_flags: dst_info.open_flags,
        };
        let mut buf = [0u8; SECTOR_HEADER_LEN + FINFO_SIZE_B];
        new_hdr.write(&mut buf[..SECTOR_HEADER_LEN]);
        new_info.write(&mut buf[..]);
        self.program_flash(src.head_addr, &buf)?;

        if payload_len > 0 {
            self.intrasec_copy(
                dst.head_addr + HEAD_PAYLOAD_OFFSET as u32,
                src.head_addr + HEAD_PAYLOAD_OFFSET as u32,
                payload_len,
            )?;
        }

        let chain_len = self.mark_chain_deleted(dst.head_addr)?;
        self.stats.files_active -= 1;
        self.stats.available_disk_size += (chain_len - 1) * PSEC as u32;

        src.invalidate();
        dst.invalidate();
        Ok(())
    }

    /// A directory-entry snapshot for the head sector at index slot `fno`.
    /// Returns `Ok(None)` for "end of index" (an all-ones slot).
    pub fn info(&mut self, fno: usize) -> Result<Option<FileInfo>, Error> {
        let addr = self.read_index_slot(fno);
        if addr == ALL_ONES {
            return Ok(None);
        }

        let magic = self.read_sector_header(addr).magic_state();
        if !matches!(magic, Some(Magic::HeadActive) | Some(Magic::HeadDeleted)) {
            return Err(Error::BadSectorType);
        }

        let finfo = self.read_file_info(addr);
        let mut stat = if magic == Some(Magic::HeadActive) { stat_flags::ACTIVE } else { stat_flags::INACTIVE };
        if finfo.is_unclosed() {
            stat |= stat_flags::UNCLOSED;
        }

        Ok(Some(FileInfo {
            name: finfo.name,
            ctime: finfo.ctime,
            len: if finfo.is_unclosed() { None } else { Some(finfo.len) },
            crc32: finfo.crc32,
            open_flags: finfo.open_flags,
            stat_flags: stat,
        }))
    }

    /// Reads a persisted CRC32 directly from a head sector, without
    /// opening or streaming the file (spec.md §9 supplement,
    /// `fs_get_crc32`).
    pub fn stored_crc32(&mut self, head_addr: u32) -> u32 {
        self.read_file_info(head_addr).crc32
    }
}
