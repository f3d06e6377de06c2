//! The in-memory file descriptor (spec.md §3.4).
//!
//! Opaque to callers; a cursor over on-flash state, not an owner of any
//! of it. Passed by `&mut` reference into [`crate::Mount`]'s file
//! operations.

use crate::layout::ALL_ONES;

/// A descriptor's lifecycle state. The original represents "never
/// opened" / "closed" / "deleted" all as a null head address; spec.md
/// §9 calls that conflation out explicitly, so this is a proper enum
/// instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorState {
    /// Never opened, or invalidated by `close`/`delete`/`rename`.
    Invalid,
    /// Open and usable; `head_addr` names the file's head sector.
    Open,
}

/// An open (or formerly open) file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileDescriptor {
    pub(crate) state: DescriptorState,
    pub(crate) head_addr: u32,
    pub(crate) work_addr: u32,
    pub(crate) file_pos: u32,
    pub(crate) file_len: u32,
    pub(crate) crc: u32,
    pub(crate) ctime: u32,
    /// Offset within `work_addr`'s sector where the next I/O byte lives.
    pub(crate) sector_rel_offset: u32,
    pub(crate) open_flags: u8,
}

impl FileDescriptor {
    /// A descriptor in its never-opened state.
    pub fn new() -> Self {
        FileDescriptor {
            state: DescriptorState::Invalid,
            head_addr: ALL_ONES,
            work_addr: ALL_ONES,
            file_pos: 0,
            file_len: ALL_ONES,
            crc: crate::crc::Crc32::INIT,
            ctime: 0,
            sector_rel_offset: 0,
            open_flags: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == DescriptorState::Open
    }

    pub fn file_pos(&self) -> u32 {
        self.file_pos
    }

    /// The persisted length, or `None` while the file is still unclosed
    /// and growing.
    pub fn file_len(&self) -> Option<u32> {
        if self.file_len == ALL_ONES { None } else { Some(self.file_len) }
    }

    pub fn ctime(&self) -> u32 {
        self.ctime
    }

    pub fn open_flags(&self) -> u8 {
        self.open_flags
    }

    pub(crate) fn invalidate(&mut self) {
        self.state = DescriptorState::Invalid;
        self.head_addr = ALL_ONES;
    }
}

impl Default for FileDescriptor {
    fn default() -> Self {
        Self::new()
    }
}
