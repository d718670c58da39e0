//! Stub entry sequence.

use core::convert::Infallible;

use digest::Digest;
use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::serial::Write;

use crate::buffer::FrameBuffers;
use crate::platform::{Flash, Platform};
use crate::protocol::{SpiParams, GREETING};
use crate::slip::Encoder;
use crate::stub::Stub;
use crate::{Error, Exit, Options};

/// Greet the host, bring up reception and the flash, then serve commands.
///
/// Only returns on a serial error or if `buffers` were already handed out,
/// a reboot request hands control to [`Platform::boot_application`].
pub fn start<W, D, F, P, H, const N: usize>(
    mut port: W,
    delay: D,
    flash: F,
    mut platform: P,
    buffers: &'static FrameBuffers<N>,
    options: Options,
) -> Result<Infallible, Error<W::Error>>
where
    W: Write<u8>,
    D: DelayUs<u32>,
    F: Flash,
    P: Platform,
    H: Digest,
{
    let (receiver, queue) = match buffers.split() {
        Some(halves) => halves,
        None => return Err(Error::BuffersInUse),
    };

    Encoder::new(&mut port).frame(&GREETING)?;
    debug!("Greeting sent");

    platform.attach_receiver(receiver);

    let error = platform.spi_attach(0, false);
    if !error.is_ok() {
        warn!("SPI attach failed: {:?}", error);
    }

    let status = platform.spi_set_params(&SpiParams::default());
    if status != 0 {
        warn!("Default SPI parameters rejected, status 0x{:x}", status);
    }

    info!("Stub running");

    let mut stub = Stub::<_, _, _, _, H, N>::new(port, delay, flash, platform, queue, options);

    match stub.run()? {
        Exit::Reboot => stub.platform_mut().boot_application(),
    }
}
