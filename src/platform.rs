//! Collaborators the dispatcher drives.

use crate::buffer::FrameReceiver;
use crate::protocol::{ErrorCode, SpiParams};

/// Flash erase, programming session and raw reads
pub trait Flash {
    fn erase_chip(&mut self) -> ErrorCode;

    fn erase_region(&mut self, address: u32, length: u32) -> ErrorCode;

    /// Read `buf.len()` bytes starting at `address`
    fn read(&mut self, address: u32, buf: &mut [u8]) -> ErrorCode;

    /// Open a session programming `total_size` bytes at `offset`
    fn begin(&mut self, total_size: u32, offset: u32) -> ErrorCode;

    /// Open a session fed with zlib compressed chunks
    fn deflated_begin(&mut self, uncompressed_size: u32, compressed_size: u32, offset: u32) -> ErrorCode;

    /// Append a chunk to the open session
    fn write(&mut self, chunk: &[u8]) -> ErrorCode;

    /// Append a compressed chunk to the open session
    fn deflated_write(&mut self, chunk: &[u8]) -> ErrorCode;

    /// Close the session
    fn end(&mut self) -> ErrorCode;

    /// Whether a session is open
    fn in_flash_mode(&self) -> bool;

    /// Error latched by a previous write, reported with the next data command
    fn last_error(&self) -> ErrorCode;
}

/// Chip specific services: registers, SPI setup, UART control and hand-over
pub trait Platform {
    fn read_register(&mut self, address: u32) -> u32;

    fn write_register(&mut self, address: u32, value: u32);

    fn spi_attach(&mut self, config: u32, legacy: bool) -> ErrorCode;

    /// Configure SPI flash geometry, a non-zero status is reported as a failed SPI op
    fn spi_set_params(&mut self, params: &SpiParams) -> u32;

    /// Reprogram the UART for a new baud rate
    fn set_baud_rate(&mut self, baud: u32);

    /// Install the receive interrupt, which owns `receiver` from now on
    fn attach_receiver<const N: usize>(&mut self, receiver: FrameReceiver<'static, N>);

    /// Called while the dispatcher waits for a frame
    fn idle(&mut self) {
        core::hint::spin_loop();
    }

    /// Leave the stub and resume the resident application
    fn boot_application(&mut self) -> !;
}
