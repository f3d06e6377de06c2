//! The four-primitive physical driver interface (spec.md §6.1), an
//! external collaborator the FS is generic over.

use core::fmt::Debug;

/// A SPI bus plus chip-select, as seen by the flash command layer.
///
/// Implementors provide nothing more than raw byte shuffling; all command
/// framing, busy-waiting, and retry policy lives in [`crate::flash::commands`].
pub trait FlashBus {
    type Error: Debug;

    /// One-time bus setup (clock, pin modes, ...).
    fn spi_init(&mut self) -> Result<(), Self::Error>;

    /// Releases whatever `spi_init` acquired. Infallible: there is nothing
    /// a caller can do about a failure to tear down.
    fn spi_close(&mut self);

    /// Lowers chip-select.
    fn select(&mut self);

    /// Raises chip-select.
    fn deselect(&mut self);

    /// Reads `buf.len()` bytes from MISO with chip-select held.
    fn spi_read(&mut self, buf: &mut [u8]);

    /// Writes `buf` to MOSI with chip-select held.
    fn spi_write(&mut self, buf: &[u8]);

    /// Blocks for approximately `usec` microseconds.
    fn wait_usec(&mut self, usec: u32);
}
