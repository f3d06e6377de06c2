//! `fsck` / "check disk" (spec.md §4.3): the user-callable consistency
//! check, generalizing the original demo shell's `'v'` directory listing
//! into a library routine (the interactive shell itself stays out of
//! scope).

use core::fmt::Write as _;

use crate::crc::Crc32;
use crate::descriptor::FileDescriptor;
use crate::error::Error;
use crate::flash::FlashBus;
use crate::layout::{has_flag, open_flags};
use crate::mount::{Clock, Mount, StartMode, SupplyMonitor};

impl<B: FlashBus, C: Clock, S: SupplyMonitor> Mount<B, C, S> {
    /// Starts in `Normal` mode, then streams every indexed file: `CRC`
    /// files are re-checksummed against their persisted CRC, `UNCLOSED`
    /// files get a length-discovery read. Returns the number of problems
    /// found; writes a human-readable line per entry to `printer` if one
    /// is given.
    pub fn check_disk(&mut self, mut printer: Option<&mut dyn core::fmt::Write>) -> Result<u32, Error> {
        self.start(StartMode::Normal)?;

        let mut errors = 0u32;
        let mut slot = 0usize;

        loop {
            let info = match self.info(slot)? {
                Some(info) => info,
                None => break,
            };
            slot += 1;

            let name_end = info.name.iter().position(|&b| b == 0).unwrap_or(info.name.len());
            let name = core::str::from_utf8(&info.name[..name_end]).unwrap_or("?");

            let unclosed = info.len.is_none();
            let crc_expected = has_flag(info.open_flags, open_flags::CRC);
            if unclosed && crc_expected {
                // Contradictory: CRC is only finalised by `close`.
                errors += 1;
            }

            let mut verified_crc = None;
            let mut recovered_len = info.len;

            if info.stat_flags & crate::layout::stat_flags::ACTIVE != 0 {
                let head_addr = self.read_index_slot(slot - 1);
                let mut desc = FileDescriptor::new();

                if unclosed {
                    let flags = open_flags::READ | open_flags::RAW;
                    self.open_existing_for_check(&mut desc, head_addr, flags)?;
                    let mut sink = [0u8; 64];
                    loop {
                        let n = self.read(&mut desc, Some(&mut sink), sink.len() as u32)?;
                        if n == 0 {
                            break;
                        }
                    }
                    recovered_len = desc.file_len();
                    self.close(&mut desc)?;
                } else if crc_expected {
                    let flags = open_flags::READ | open_flags::CRC;
                    self.open_existing_for_check(&mut desc, head_addr, flags)?;
                    let mut sink = [0u8; 64];
                    loop {
                        let n = self.read(&mut desc, Some(&mut sink), sink.len() as u32)?;
                        if n == 0 {
                            break;
                        }
                    }
                    let computed = Crc32::resume(desc.crc).finalize();
                    self.close(&mut desc)?;
                    verified_crc = Some(computed);
                    if computed != info.crc32 {
                        errors += 1;
                    }
                }
            }

            if let Some(p) = printer.as_deref_mut() {
                let date = crate::date::to_date(info.ctime);
                let _ = match recovered_len {
                    Some(len) => write!(
                        p,
                        "{name:<21} {len:>10} bytes  crc={crc:#010x}  {y:04}-{m:02}-{d:02}\n",
                        name = name,
                        len = len,
                        crc = verified_crc.unwrap_or(info.crc32),
                        y = date.year,
                        m = date.month,
                        d = date.day,
                    ),
                    None => write!(
                        p,
                        "{name:<21} (unclosed)  {y:04}-{m:02}-{d:02}\n",
                        name = name,
                        y = date.year,
                        m = date.month,
                        d = date.day,
                    ),
                };
            }
        }

        Ok(errors)
    }

    /// Populates a descriptor for an already-known-active head without
    /// going through name resolution; used internally by `check_disk`.
    fn open_existing_for_check(&mut self, desc: &mut FileDescriptor, head_addr: u32, flags: u8) -> Result<(), Error> {
        let info = self.read_file_info(head_addr);
        desc.state = crate::descriptor::DescriptorState::Open;
        desc.head_addr = head_addr;
        desc.work_addr = head_addr;
        desc.file_pos = 0;
        desc.file_len = info.len;
        desc.crc = Crc32::INIT;
        desc.ctime = info.ctime;
        desc.sector_rel_offset = crate::layout::HEAD_PAYLOAD_OFFSET as u32;
        desc.open_flags = flags;
        Ok(())
    }
}
