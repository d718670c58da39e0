//! Command dispatcher.
//!
//! Each received frame is handled in two phases: [`Stub::prepare`] validates
//! it and runs the handler, the response is sent, then the deferred part of
//! the command (baud change, flash write, read streaming, reboot) runs. The
//! host therefore always sees the acknowledgement before the side effect.

use core::marker::PhantomData;

use digest::Digest;
use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::serial::Write;

use crate::buffer::{Frame, FrameQueue};
use crate::platform::{Flash, Platform};
use crate::protocol::*;
use crate::slip::Encoder;
use crate::{Error, Exit, Options};

/// Response assembled by a handler
struct Response {
    header: ResponseHeader,
    data: heapless::Vec<u8, MAX_RESPONSE_DATA>,
    error: ErrorCode,
    status: u8,
}

impl Response {
    fn new(op: u8) -> Self {
        Self {
            header: ResponseHeader::new(op),
            data: heapless::Vec::new(),
            error: ErrorCode::Ok,
            status: 0,
        }
    }
}

/// Work carried out once the response is on the wire
#[derive(Debug)]
enum Deferred<'f> {
    Nothing,
    ChangeBaud(u32),
    ReadFlash(ReadParams),
    Write(&'f [u8]),
    WriteDeflated(&'f [u8]),
    Reboot,
}

pub struct Stub<'a, W, D, F, P, H, const N: usize> {
    port: W,
    delay: D,
    flash: F,
    platform: P,
    queue: FrameQueue<'a, N>,
    options: Options,
    _digest: PhantomData<fn() -> H>,
}

impl<'a, W, D, F, P, H, const N: usize> Stub<'a, W, D, F, P, H, N>
where
    W: Write<u8>,
    D: DelayUs<u32>,
    F: Flash,
    P: Platform,
    H: Digest,
{
    /// Create a new dispatcher reading frames from `queue`
    pub fn new(port: W, delay: D, flash: F, platform: P, queue: FrameQueue<'a, N>, options: Options) -> Self {
        Self {
            port,
            delay,
            flash,
            platform,
            queue,
            options,
            _digest: PhantomData,
        }
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn port(&self) -> &W {
        &self.port
    }

    /// Serve commands until the host asks to leave the stub
    pub fn run(&mut self) -> Result<Exit, Error<W::Error>> {
        loop {
            if let Some(exit) = self.poll()? {
                return Ok(exit);
            }
            self.platform.idle();
        }
    }

    /// Handle the pending frame, if any
    pub fn poll(&mut self) -> Result<Option<Exit>, Error<W::Error>> {
        let frame = match self.queue.take() {
            Some(f) => f,
            None => return Ok(None),
        };

        let command = match CommandFrame::parse(frame.bytes()) {
            Some(c) => c,
            None => {
                debug!("Ignoring {} byte frame without a header", frame.len());
                return Ok(None);
            }
        };

        trace!("Received op 0x{:02x} with {} data bytes", command.op(), command.data_len());

        let (response, deferred) = self.prepare(&command);
        self.respond(&response)?;

        self.complete(deferred)
    }

    /// Validate and execute a command, returning its response and deferred work
    fn prepare<'f>(&mut self, command: &CommandFrame<'f>) -> (Response, Deferred<'f>) {
        let mut response = Response::new(command.op());

        if command.command() == Some(Command::ReadReg) && command.has_len(4) {
            response.header.value = self.platform.read_register(command.word_or_zero(0));
        }

        if command.data_len() > MAX_DATA_LEN {
            warn!("Rejecting op 0x{:02x} declaring {} data bytes", command.op(), command.data_len());
            response.error = ErrorCode::BadDataLen;
            response.status = OVERSIZE_STATUS;
            return (response, Deferred::Nothing);
        }

        let c = match command.command() {
            Some(c) => c,
            None => {
                debug!("Unsupported op 0x{:02x}", command.op());
                response.error = ErrorCode::CmdNotImplemented;
                return (response, Deferred::Nothing);
            }
        };

        let (error, deferred) = self.execute(c, command, &mut response);
        if !error.is_ok() {
            debug!("{:?} failed: {:?}", c, error);
        }
        response.error = error;

        // Flash data is the only command whose side effect may outlive a failed check
        let keep = error.is_ok() || matches!(deferred, Deferred::Write(_) | Deferred::WriteDeflated(_));

        (response, if keep { deferred } else { Deferred::Nothing })
    }

    fn execute<'f>(
        &mut self,
        c: Command,
        command: &CommandFrame<'f>,
        response: &mut Response,
    ) -> (ErrorCode, Deferred<'f>) {
        use Command::*;

        let len = match c.expected_len() {
            Some(n) if !command.has_len(n) => ErrorCode::BadDataLen,
            _ => ErrorCode::Ok,
        };
        let w = |i| command.word_or_zero(i);

        match c {
            EraseFlash => (len.and_then(|| self.flash.erase_chip()), Deferred::Nothing),

            EraseRegion => (len.and_then(|| self.flash.erase_region(w(0), w(1))), Deferred::Nothing),

            ChangeBaudrate => {
                let baud = w(0);
                let error = len.and_then(|| match baud {
                    0 => ErrorCode::InvalidCommand,
                    _ => ErrorCode::Ok,
                });
                (error, Deferred::ChangeBaud(baud))
            }

            ReadFlash => {
                let params = ReadParams {
                    offset: w(0),
                    length: w(1),
                    block_size: w(2),
                    max_in_flight: w(3),
                };
                let error = len.and_then(|| {
                    if params.block_size == 0 || params.block_size > FLASH_SECTOR_SIZE {
                        ErrorCode::BadBlocksize
                    } else if params.max_in_flight == 0 {
                        ErrorCode::InvalidCommand
                    } else {
                        ErrorCode::Ok
                    }
                });
                (error, Deferred::ReadFlash(params))
            }

            SpiFlashMd5 => (len.and_then(|| self.md5(w(0), w(1), response)), Deferred::Nothing),

            FlashBegin => {
                let error = len.and_then(|| match w(1).checked_mul(w(2)) {
                    Some(total) => self.flash.begin(total, w(3)),
                    None => ErrorCode::TooMuchData,
                });
                (error, Deferred::Nothing)
            }

            FlashDeflBegin => {
                let error = len.and_then(|| match w(1).checked_mul(w(2)) {
                    Some(compressed) => self.flash.deflated_begin(w(0), compressed, w(3)),
                    None => ErrorCode::TooMuchData,
                });
                (error, Deferred::Nothing)
            }

            FlashData | FlashDeflData => {
                let (error, payload) = self.verify_data(command);
                let write = error.is_ok()
                    || (self.options.write_unverified_data && error != ErrorCode::NotInFlashMode && !payload.is_empty());

                let deferred = match (write, c) {
                    (false, _) => Deferred::Nothing,
                    (true, FlashData) => Deferred::Write(payload),
                    (true, _) => Deferred::WriteDeflated(payload),
                };
                (error, deferred)
            }

            FlashEnd | FlashDeflEnd => {
                let error = self.flash.end();
                let reboot = c == FlashEnd && command.word(0) == Some(0);
                (error, if reboot { Deferred::Reboot } else { Deferred::Nothing })
            }

            SpiSetParams => {
                let error = len.and_then(|| {
                    let status = self.platform.spi_set_params(&SpiParams::from_frame(command));
                    response.status = status as u8;
                    match status {
                        0 => ErrorCode::Ok,
                        _ => ErrorCode::FailedSpiOp,
                    }
                });
                (error, Deferred::Nothing)
            }

            SpiAttach => {
                let error = len.and_then(|| self.platform.spi_attach(w(0), w(1) & 0xFF != 0));
                (error, Deferred::Nothing)
            }

            WriteReg => {
                let error = len.and_then(|| {
                    self.platform.write_register(w(0), w(1));
                    ErrorCode::Ok
                });
                (error, Deferred::Nothing)
            }

            // Value was read into the header before dispatch
            ReadReg => (len, Deferred::Nothing),
        }
    }

    /// Check a flash data frame, returning the error to report and the block to write
    fn verify_data<'f>(&self, command: &CommandFrame<'f>) -> (ErrorCode, &'f [u8]) {
        if !self.flash.in_flash_mode() {
            return (ErrorCode::NotInFlashMode, &[]);
        }

        if !command.is_complete() || command.data_len() < DATA_HEADER_LEN {
            return (ErrorCode::BadDataLen, &[]);
        }

        let payload = &command.data()[DATA_HEADER_LEN..];
        let mut error = self.flash.last_error();

        if command.word(0) != Some(payload.len() as u32) {
            error = ErrorCode::BadDataLen;
        }
        if u32::from(checksum(payload)) != command.checksum() {
            error = ErrorCode::BadDataChecksum;
        }

        (error, payload)
    }

    /// Hash a flash region into the response data
    fn md5(&mut self, address: u32, length: u32, response: &mut Response) -> ErrorCode {
        let mut block = [0u8; FLASH_SECTOR_SIZE as usize];
        let mut hasher = H::new();
        let (mut address, mut remaining) = (address, length);

        while remaining > 0 {
            let n = remaining.min(FLASH_SECTOR_SIZE);
            let chunk = &mut block[..n as usize];

            let error = self.flash.read(address, chunk);
            if !error.is_ok() {
                return error;
            }
            hasher.update(&*chunk);

            address = address.wrapping_add(n);
            remaining -= n;
        }

        match response.data.extend_from_slice(&hasher.finalize()) {
            Ok(()) => ErrorCode::Ok,
            Err(()) => ErrorCode::TooMuchData,
        }
    }

    fn respond(&mut self, response: &Response) -> Result<(), Error<W::Error>> {
        let mut slip = Encoder::new(&mut self.port);

        slip.delimiter()?;
        slip.data(&response.header.to_bytes())?;
        slip.data(&response.data)?;
        slip.data(&[response.error.code(), response.status])?;
        slip.delimiter()?;

        Ok(())
    }

    fn complete(&mut self, deferred: Deferred) -> Result<Option<Exit>, Error<W::Error>> {
        match deferred {
            Deferred::Nothing => (),
            Deferred::ChangeBaud(baud) => {
                self.delay.delay_us(self.options.baud_settle_us);
                self.platform.set_baud_rate(baud);
                self.delay.delay_us(self.options.baud_resume_us);
                info!("Baud rate changed to {}", baud);
            }
            Deferred::ReadFlash(params) => self.stream_flash(params)?,
            Deferred::Write(chunk) => {
                let error = self.flash.write(chunk);
                if !error.is_ok() {
                    warn!("Flash write of {} bytes failed: {:?}", chunk.len(), error);
                }
            }
            Deferred::WriteDeflated(chunk) => {
                let error = self.flash.deflated_write(chunk);
                if !error.is_ok() {
                    warn!("Compressed flash write of {} bytes failed: {:?}", chunk.len(), error);
                }
            }
            Deferred::Reboot => {
                info!("Leaving stub");
                block!(self.port.flush())?;
                self.delay.delay_us(self.options.reboot_delay_us);
                return Ok(Some(Exit::Reboot));
            }
        }

        Ok(None)
    }

    /// Stream a flash region as raw frames, throttled by host acknowledgements,
    /// finishing with the digest of everything sent.
    ///
    /// A failed read ends the stream early, the block is neither sent nor
    /// hashed, so the host sees a short read followed by the digest.
    fn stream_flash(&mut self, params: ReadParams) -> Result<(), Error<W::Error>> {
        debug!(
            "Streaming {} bytes from 0x{:08x} in {} byte blocks",
            params.length, params.offset, params.block_size
        );

        let mut block = [0u8; FLASH_SECTOR_SIZE as usize];
        let mut hasher = H::new();
        let mut address = params.offset;
        let (mut sent, mut acked) = (0u32, 0u32);

        'stream: while acked < params.length {
            while sent < params.length && sent.saturating_sub(acked) < params.max_in_flight {
                let n = (params.length - sent).min(params.block_size);
                let chunk = &mut block[..n as usize];

                let error = self.flash.read(address, chunk);
                if !error.is_ok() {
                    warn!("Flash read at 0x{:08x} failed, ending read after {} bytes: {:?}", address, sent, error);
                    break 'stream;
                }

                Encoder::new(&mut self.port).frame(chunk)?;
                hasher.update(&*chunk);

                address = address.wrapping_add(n);
                sent += n;
            }

            let ack = self.wait_frame();
            match ack.bytes() {
                [a, b, c, d] => acked = u32::from_le_bytes([*a, *b, *c, *d]),
                other => {
                    warn!("Aborting read, got {} byte frame instead of an ack", other.len());
                    break;
                }
            }
        }

        Encoder::new(&mut self.port).frame(&hasher.finalize())?;

        Ok(())
    }

    fn wait_frame(&mut self) -> Frame<'a> {
        loop {
            if let Some(frame) = self.queue.take() {
                return frame;
            }
            self.platform.idle();
        }
    }
}
