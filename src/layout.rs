//! On-flash layout (spec.md §3): sector header, file-info header, the
//! sector-0 superblock, and the sector `MAGIC` state machine.
//!
//! Field offsets and magic values are bit-exact with the original
//! firmware; see `HEADER_MAGIC` and the `SECTOR_MAGIC_*` constants below.

use core::convert::TryInto;

use crate::util::bits::Bits;

/// Physical sector size, the erase granularity. Part of the wire format,
/// not a tunable.
pub const PSEC: usize = 4096;

/// Size in bytes of the three-word sector header (`MAGIC`, `OWNER`, `NEXT`).
pub const SECTOR_HEADER_LEN: usize = 12;

/// Size in bytes of the file-info header that follows the sector header
/// in a head sector.
pub const FINFO_SIZE_B: usize = 36;

/// Offset within a head sector where file payload begins.
pub const HEAD_PAYLOAD_OFFSET: usize = SECTOR_HEADER_LEN + FINFO_SIZE_B;

/// Offset within a non-head (data) sector where file payload begins.
pub const DATA_PAYLOAD_OFFSET: usize = SECTOR_HEADER_LEN;

/// Usable payload bytes in a head sector.
pub const HEAD_PAYLOAD_CAPACITY: usize = PSEC - HEAD_PAYLOAD_OFFSET;

/// Usable payload bytes in a non-head sector.
pub const DATA_PAYLOAD_CAPACITY: usize = PSEC - DATA_PAYLOAD_OFFSET;

/// Max filename length, not counting the terminating NUL.
pub const MAX_NAME_LEN: usize = 21;

/// `NAME` field width in the file-info header (21 chars + NUL).
const NAME_FIELD_LEN: usize = 22;

/// ASCII `"JesF"` reinterpreted as a 32-bit word; marks a formatted disk.
pub const DISK_MAGIC: u32 = 0x4673_654A;

/// All-ones sentinel used throughout the layout for "free" / "unused" /
/// "end of chain" / "unclosed".
pub const ALL_ONES: u32 = 0xFFFF_FFFF;

/// Byte offset of the index within sector 0.
pub const INDEX_OFFSET: usize = 12;

/// Number of 32-bit index slots that fit between `INDEX_OFFSET` and the
/// end of sector 0.
pub const INDEX_SLOT_COUNT: usize = (PSEC - INDEX_OFFSET - 4) / 4;

const SECTOR_MAGIC_HEAD_ACTIVE: u32 = 0xFFFF_293A;
const SECTOR_MAGIC_HEAD_DELETED: u32 = 0xFFFF_2130;
const SECTOR_MAGIC_DATA: u32 = 0xFFFF_5D5B;
const SECTOR_MAGIC_TODELETE: u32 = 0xFFFF_4040;

/// Sector state tag (spec.md §3.3). Each transition flips 1-bits to
/// 0-bits only, so no transition requires an erase except `ToDelete →
/// Free`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Free,
    HeadActive,
    HeadDeleted,
    Data,
    ToDelete,
}

impl Magic {
    pub fn as_word(self) -> u32 {
        match self {
            Magic::Free => ALL_ONES,
            Magic::HeadActive => SECTOR_MAGIC_HEAD_ACTIVE,
            Magic::HeadDeleted => SECTOR_MAGIC_HEAD_DELETED,
            Magic::Data => SECTOR_MAGIC_DATA,
            Magic::ToDelete => SECTOR_MAGIC_TODELETE,
        }
    }

    /// Classifies a raw word, returning `None` for a value that's none
    /// of the five known states (a corrupt sector).
    pub fn from_word(word: u32) -> Option<Magic> {
        Some(match word {
            ALL_ONES => Magic::Free,
            SECTOR_MAGIC_HEAD_ACTIVE => Magic::HeadActive,
            SECTOR_MAGIC_HEAD_DELETED => Magic::HeadDeleted,
            SECTOR_MAGIC_DATA => Magic::Data,
            SECTOR_MAGIC_TODELETE => Magic::ToDelete,
            _ => return None,
        })
    }

    pub fn is_head(self) -> bool {
        matches!(self, Magic::HeadActive | Magic::HeadDeleted)
    }
}

macro_rules! e {
    ($ty:tt, $buf:expr, $offset:literal) => {
        $ty::from_le_bytes($buf[$offset..($offset + core::mem::size_of::<$ty>())].try_into().unwrap())
    };
}

macro_rules! w {
    ($buf:expr, $offset:literal, $val:expr) => {
        $buf[$offset..($offset + core::mem::size_of_val(&$val))].copy_from_slice(&$val.to_le_bytes())
    };
}

/// The three-word header present at the start of every sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorHeader {
    pub magic: u32,
    pub owner: u32,
    pub next: u32,
}

impl SectorHeader {
    pub fn read(buf: &[u8]) -> Self {
        SectorHeader {
            magic: e!(u32, buf, 0),
            owner: e!(u32, buf, 4),
            next: e!(u32, buf, 8),
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        w!(buf, 0, self.magic);
        w!(buf, 4, self.owner);
        w!(buf, 8, self.next);
    }

    pub fn magic_state(&self) -> Option<Magic> {
        Magic::from_word(self.magic)
    }
}

/// The 36-byte file-info header that follows the sector header in a head
/// sector. `read`/`write` index at this block's actual offsets within the
/// sector (12..48) — callers must pass a buffer that starts at the sector
/// itself, not one that starts at the file-info block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfoHeader {
    pub len: u32,
    pub crc32: u32,
    pub name: [u8; NAME_FIELD_LEN],
    pub ctime: u32,
    pub open_flags: u8,
}

impl FileInfoHeader {
    pub fn read(buf: &[u8]) -> Self {
        FileInfoHeader {
            len: e!(u32, buf, 12),
            crc32: e!(u32, buf, 16),
            name: buf[20..(20 + NAME_FIELD_LEN)].try_into().unwrap(),
            ctime: e!(u32, buf, 42),
            open_flags: buf[46],
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        w!(buf, 12, self.len);
        w!(buf, 16, self.crc32);
        buf[20..(20 + NAME_FIELD_LEN)].copy_from_slice(&self.name);
        w!(buf, 42, self.ctime);
        buf[46] = self.open_flags;
        buf[47] = 0xFF;
    }

    /// `true` when `len` is the all-ones sentinel, i.e. the file was
    /// never `close`d.
    pub fn is_unclosed(&self) -> bool {
        self.len == ALL_ONES
    }

    /// The name as a `&str`, stopping at the terminating NUL.
    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }
}

/// Packs a name (1..=21 bytes) into a NUL-terminated, NUL-padded 22-byte
/// field. Fails `BadName` if empty, too long, or containing a NUL.
pub fn pack_name(name: &[u8]) -> Result<[u8; NAME_FIELD_LEN], crate::Error> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || name.contains(&0) {
        return Err(crate::Error::BadName);
    }
    let mut field = [0u8; NAME_FIELD_LEN];
    field[..name.len()].copy_from_slice(name);
    Ok(field)
}

/// The 12-byte superblock stored at the start of sector 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub disk_magic: u32,
    pub identification: u32,
    pub disk_ctime: u32,
}

impl Superblock {
    pub fn read(buf: &[u8]) -> Self {
        Superblock {
            disk_magic: e!(u32, buf, 0),
            identification: e!(u32, buf, 4),
            disk_ctime: e!(u32, buf, 8),
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        w!(buf, 0, self.disk_magic);
        w!(buf, 4, self.identification);
        w!(buf, 8, self.disk_ctime);
    }

    pub fn is_formatted(&self) -> bool {
        self.disk_magic != ALL_ONES
    }
}

/// Flags passed to `open` (spec.md §4.3) and persisted into a head
/// sector's `OPEN_FLAGS` byte.
pub mod open_flags {
    pub const READ: u8 = 1;
    pub const CREATE: u8 = 2;
    pub const WRITE: u8 = 4;
    pub const RAW: u8 = 8;
    pub const CRC: u8 = 16;
    pub const XOPEN_UNCLOSED: u8 = 32;
    pub const EXT_SYNC: u8 = 64;
}

/// Bits reported by `info` (spec.md §4.3).
pub mod stat_flags {
    pub const ACTIVE: u8 = 1;
    pub const INACTIVE: u8 = 2;
    pub const UNCLOSED: u8 = 4;
    pub const INDEX: u8 = 128;
}

/// Tests whether `flags` has `bit` set, matching the teacher's `Bits`
/// convention used elsewhere for flag bytes.
pub fn has_flag(flags: u8, bit: u8) -> bool {
    debug_assert!(bit.count_ones() == 1);
    let shift = bit.trailing_zeros();
    flags.b(shift)
}
