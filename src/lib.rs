//! ESP Flasher Stub.
//!
//! Device side of the esptool serial flashing protocol: a RAM resident stub
//! that receives SLIP framed commands over UART0 and erases, programs,
//! verifies and reads SPI flash on behalf of the host.
//!
//! Bytes arrive through the receive interrupt ([`intake`]) into a pair of
//! frame buffers ([`buffer`]); the [`stub::Stub`] dispatcher answers one
//! command at a time and drives the [`platform`] collaborators. On target
//! those are built over the memory mapped UART in [`chip`], the `linux`
//! module provides a host emulation.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

pub mod boot;
pub mod buffer;
pub mod chip;
pub mod intake;
pub mod platform;
pub mod protocol;
pub mod session;
pub mod slip;
pub mod stub;

#[cfg(feature = "linux")]
pub mod linux;


pub use buffer::{FrameBuffers, FrameQueue, FrameReceiver};
pub use platform::{Flash, Platform};
pub use protocol::{Command, ErrorCode};
pub use session::FlashSession;
pub use stub::Stub;

/// Receive buffers sized for the largest write block
pub type RxBuffers = FrameBuffers<{ protocol::RX_BUFFER_SIZE }>;

#[derive(Debug, thiserror::Error)]
pub enum Error<SerialError> {
    #[error("serial port error: {0:?}")]
    Serial(SerialError),

    #[error("frame buffers are already in use")]
    BuffersInUse,
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

/// Why the dispatcher stopped
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Exit {
    /// Host asked to leave the stub and run the application
    Reboot,
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Program flash data blocks even when their length or checksum check failed
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub write_unverified_data: bool,

    /// Delay before switching baud rate, lets the response drain at the old rate
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10000"))]
    pub baud_settle_us: u32,

    /// Delay after switching baud rate
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub baud_resume_us: u32,

    /// Delay between the final response and leaving the stub
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10000"))]
    pub reboot_delay_us: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            write_unverified_data: false,
            baud_settle_us: 10_000,
            baud_resume_us: 1_000,
            reboot_delay_us: 10_000,
        }
    }
}
