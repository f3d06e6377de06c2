//! CRC-32, ISO-3309 variant: polynomial `0xEDB88320`, initial value
//! `0xFFFFFFFF`, byte-reflected, with the final XOR (the everyday
//! CRC-32/IEEE checksum) — matching spec.md's literal S2 test vector
//! (`crc32(b"ABC") == 0xA3830348`), which only comes out right with the
//! final XOR applied despite §8 property 8's summary omitting it.

const POLY32: u32 = 0xEDB8_8320;

/// The running state of a CRC-32 computation. [`Crc32::raw`] (not
/// [`Crc32::finalize`]) is what a caller should persist between chunks
/// and feed back into [`Crc32::resume`] — the final XOR is only applied
/// once, when the complete value is wanted for comparison or for
/// persisting into a head sector's `CRC32` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Crc32(u32);

impl Crc32 {
    /// The seed used when starting a new running CRC.
    pub const INIT: u32 = 0xFFFF_FFFF;

    pub fn new() -> Self {
        Crc32(Self::INIT)
    }

    /// Resumes a running CRC from a previously saved raw register value
    /// (see [`Crc32::raw`]), *not* from a finalized one.
    pub fn resume(state: u32) -> Self {
        Crc32(state)
    }

    pub fn update(&mut self, data: &[u8]) {
        let mut crc = self.0;
        for &byte in data {
            crc ^= byte as u32;
            for _ in 0..8 {
                crc = if crc & 1 != 0 { (crc >> 1) ^ POLY32 } else { crc >> 1 };
            }
        }
        self.0 = crc;
    }

    /// The raw LFSR register, suitable for resuming a running computation
    /// later via [`Crc32::resume`].
    pub fn raw(self) -> u32 {
        self.0
    }

    /// The CRC value as it would be persisted or compared against a
    /// persisted `CRC32` field: the raw register with the final XOR
    /// applied.
    pub fn finalize(self) -> u32 {
        self.0 ^ 0xFFFF_FFFF
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience one-shot over a full buffer.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc32::new();
    crc.update(data);
    crc.finalize()
}
