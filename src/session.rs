//! Flash programming session on top of an `embedded-storage` NOR flash.
//!
//! Sectors are erased lazily just ahead of the write pointer, so a session
//! only ever erases what it is about to program. Compressed sessions inflate
//! zlib data through a 32 KiB wrap-around window before programming.

use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind};
use miniz_oxide::inflate::core::inflate_flags::{
    TINFL_FLAG_HAS_MORE_INPUT, TINFL_FLAG_PARSE_ZLIB_HEADER,
};
use miniz_oxide::inflate::core::{decompress, DecompressorOxide};
use miniz_oxide::inflate::TINFLStatus;

use crate::platform::Flash;
use crate::protocol::ErrorCode;

const WINDOW_SIZE: usize = 32 * 1024;

fn map_flash_error<E: NorFlashError>(error: E) -> ErrorCode {
    match error.kind() {
        NorFlashErrorKind::NotAligned => ErrorCode::BadBlocksize,
        NorFlashErrorKind::OutOfBounds => ErrorCode::TooMuchData,
        _ => ErrorCode::FailedSpiOp,
    }
}

struct Writer<F> {
    flash: F,
    next_write: u32,
    remaining: u32,
    erased_to: u32,
    last_error: ErrorCode,
}

impl<F: NorFlash> Writer<F> {
    fn sector_size() -> u32 {
        F::ERASE_SIZE as u32
    }

    fn start(&mut self, total_size: u32, offset: u32) -> ErrorCode {
        let fits = offset
            .checked_add(total_size)
            .map(|end| end as usize <= self.flash.capacity())
            .unwrap_or(false);
        if !fits {
            return ErrorCode::TooMuchData;
        }

        self.next_write = offset;
        self.remaining = total_size;
        self.erased_to = offset - offset % Self::sector_size();
        self.last_error = ErrorCode::Ok;

        ErrorCode::Ok
    }

    fn erase_until(&mut self, end: u32) -> ErrorCode {
        while self.erased_to < end {
            let to = self.erased_to.saturating_add(Self::sector_size());
            if let Err(e) = self.flash.erase(self.erased_to, to) {
                warn!("Erasing sector at 0x{:x} failed: {:?}", self.erased_to, e);
                return map_flash_error(e);
            }
            self.erased_to = to;
        }
        ErrorCode::Ok
    }

    /// Program `data`, trimming anything past the session size
    fn program(&mut self, data: &[u8]) -> ErrorCode {
        if self.remaining == 0 {
            return if data.is_empty() { ErrorCode::Ok } else { ErrorCode::TooMuchData };
        }

        let n = data.len().min(self.remaining as usize);
        let data = &data[..n];
        // n <= remaining, and start() checked offset + total fits in u32
        let end = self.next_write + n as u32;

        let mut error = self.erase_until(end);
        if error.is_ok() {
            if let Err(e) = self.flash.write(self.next_write, data) {
                warn!("Writing {} bytes at 0x{:x} failed: {:?}", n, self.next_write, e);
                error = ErrorCode::FailedSpiOp;
            }
        }
        if !error.is_ok() {
            self.last_error = error;
        }

        self.next_write = end;
        self.remaining -= n as u32;

        error
    }
}

struct Inflater {
    decompressor: DecompressorOxide,
    window: [u8; WINDOW_SIZE],
    position: usize,
    remaining_input: u32,
}

/// Implements [`Flash`] for any NOR flash
pub struct FlashSession<F> {
    writer: Writer<F>,
    inflater: Inflater,
    in_flash_mode: bool,
    compressed: bool,
}

impl<F: NorFlash> FlashSession<F> {
    pub fn new(flash: F) -> Self {
        Self {
            writer: Writer {
                flash,
                next_write: 0,
                remaining: 0,
                erased_to: 0,
                last_error: ErrorCode::Ok,
            },
            inflater: Inflater {
                decompressor: DecompressorOxide::new(),
                window: [0u8; WINDOW_SIZE],
                position: 0,
                remaining_input: 0,
            },
            in_flash_mode: false,
            compressed: false,
        }
    }

    pub fn flash(&self) -> &F {
        &self.writer.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.writer.flash
    }

    /// Bytes still expected by the open session
    pub fn remaining(&self) -> u32 {
        self.writer.remaining
    }

    pub fn into_inner(self) -> F {
        self.writer.flash
    }
}

impl<F: NorFlash> Flash for FlashSession<F> {
    fn erase_chip(&mut self) -> ErrorCode {
        let capacity = self.writer.flash.capacity() as u32;
        debug!("Erasing {} bytes of flash", capacity);

        match self.writer.flash.erase(0, capacity) {
            Ok(_) => ErrorCode::Ok,
            Err(e) => map_flash_error(e),
        }
    }

    fn erase_region(&mut self, address: u32, length: u32) -> ErrorCode {
        let sector = F::ERASE_SIZE as u32;
        if address % sector != 0 || length % sector != 0 {
            return ErrorCode::BadBlocksize;
        }

        let end = match address.checked_add(length) {
            Some(end) => end,
            None => return ErrorCode::TooMuchData,
        };

        match self.writer.flash.erase(address, end) {
            Ok(_) => ErrorCode::Ok,
            Err(e) => map_flash_error(e),
        }
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> ErrorCode {
        match self.writer.flash.read(address, buf) {
            Ok(_) => ErrorCode::Ok,
            Err(e) => {
                warn!("Reading {} bytes at 0x{:x} failed: {:?}", buf.len(), address, e);
                ErrorCode::FailedSpiOp
            }
        }
    }

    fn begin(&mut self, total_size: u32, offset: u32) -> ErrorCode {
        debug!("Flash session: {} bytes at 0x{:x}", total_size, offset);

        let error = self.writer.start(total_size, offset);
        self.in_flash_mode = error.is_ok();
        self.compressed = false;
        error
    }

    fn deflated_begin(&mut self, uncompressed_size: u32, compressed_size: u32, offset: u32) -> ErrorCode {
        debug!(
            "Compressed flash session: {} bytes ({} compressed) at 0x{:x}",
            uncompressed_size, compressed_size, offset
        );

        let error = self.begin(uncompressed_size, offset);
        self.compressed = true;
        self.inflater.decompressor = DecompressorOxide::new();
        self.inflater.position = 0;
        self.inflater.remaining_input = compressed_size;
        error
    }

    fn write(&mut self, chunk: &[u8]) -> ErrorCode {
        if !self.in_flash_mode {
            return ErrorCode::NotInFlashMode;
        }
        if self.compressed {
            return ErrorCode::InvalidCommand;
        }

        self.writer.program(chunk)
    }

    fn deflated_write(&mut self, chunk: &[u8]) -> ErrorCode {
        if !self.in_flash_mode {
            return ErrorCode::NotInFlashMode;
        }
        if !self.compressed {
            return ErrorCode::InvalidCommand;
        }

        let inflater = &mut self.inflater;
        let mut input = chunk;

        loop {
            let mut flags = TINFL_FLAG_PARSE_ZLIB_HEADER;
            if inflater.remaining_input as usize > input.len() {
                flags |= TINFL_FLAG_HAS_MORE_INPUT;
            }

            let (status, consumed, produced) = decompress(
                &mut inflater.decompressor,
                input,
                &mut inflater.window,
                inflater.position,
                flags,
            );

            input = &input[consumed..];
            inflater.remaining_input = inflater.remaining_input.saturating_sub(consumed as u32);

            if produced > 0 {
                let start = inflater.position;
                let error = self.writer.program(&inflater.window[start..start + produced]);
                inflater.position = (start + produced) & (WINDOW_SIZE - 1);
                if !error.is_ok() {
                    return error;
                }
            }

            match status {
                TINFLStatus::HasMoreOutput => continue,
                TINFLStatus::NeedsMoreInput if !input.is_empty() => continue,
                TINFLStatus::NeedsMoreInput | TINFLStatus::Done => return ErrorCode::Ok,
                s => {
                    warn!("Inflate failed: {:?}", s);
                    self.writer.last_error = ErrorCode::InflateError;
                    return ErrorCode::InflateError;
                }
            }
        }
    }

    fn end(&mut self) -> ErrorCode {
        if !self.in_flash_mode {
            return ErrorCode::NotInFlashMode;
        }
        if self.writer.remaining > 0 {
            debug!("Flash session ended with {} bytes outstanding", self.writer.remaining);
            return ErrorCode::NotEnoughData;
        }

        self.in_flash_mode = false;
        self.writer.last_error
    }

    fn in_flash_mode(&self) -> bool {
        self.in_flash_mode
    }

    fn last_error(&self) -> ErrorCode {
        self.writer.last_error
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use embedded_storage::nor_flash::{check_erase, check_read, check_write, ErrorType, ReadNorFlash};

    extern crate std;
    use std::boxed::Box;
    use std::vec;
    use std::vec::Vec;

    pub(crate) struct MockFlash {
        pub(crate) data: Vec<u8>,
        pub(crate) erases: Vec<(u32, u32)>,
    }

    impl MockFlash {
        pub(crate) fn new(size: usize) -> Self {
            Self {
                data: vec![0x00; size],
                erases: Vec::new(),
            }
        }
    }

    impl ErrorType for MockFlash {
        type Error = NorFlashErrorKind;
    }

    impl ReadNorFlash for MockFlash {
        const READ_SIZE: usize = 1;

        fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            check_read(self, offset, bytes.len())?;
            let start = offset as usize;
            bytes.copy_from_slice(&self.data[start..start + bytes.len()]);
            Ok(())
        }

        fn capacity(&self) -> usize {
            self.data.len()
        }
    }

    impl NorFlash for MockFlash {
        const WRITE_SIZE: usize = 1;
        const ERASE_SIZE: usize = 4096;

        fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
            check_erase(self, from, to)?;
            self.erases.push((from, to));
            for b in &mut self.data[from as usize..to as usize] {
                *b = 0xFF;
            }
            Ok(())
        }

        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            check_write(self, offset, bytes.len())?;
            let start = offset as usize;
            for (slot, &value) in self.data[start..].iter_mut().zip(bytes) {
                if *slot != 0xFF {
                    return Err(NorFlashErrorKind::Other);
                }
                *slot = value;
            }
            Ok(())
        }
    }

    fn session() -> Box<FlashSession<MockFlash>> {
        Box::new(FlashSession::new(MockFlash::new(64 * 1024)))
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
    }

    #[test]
    fn write_without_begin_is_rejected() {
        let mut s = session();
        assert_eq!(s.write(&[1, 2, 3]), ErrorCode::NotInFlashMode);
        assert_eq!(s.end(), ErrorCode::NotInFlashMode);
    }

    #[test]
    fn begin_write_end_in_uneven_chunks() {
        let data = pattern(10_000);

        for split in [1usize, 333, 4096, 10_000].iter() {
            let mut s = session();
            assert_eq!(s.begin(data.len() as u32, 0x2000), ErrorCode::Ok);
            for chunk in data.chunks(*split) {
                assert_eq!(s.write(chunk), ErrorCode::Ok);
            }
            assert_eq!(s.end(), ErrorCode::Ok);
            assert!(!s.in_flash_mode());
            assert_eq!(&s.flash().data[0x2000..0x2000 + data.len()], &data[..]);
        }
    }

    #[test]
    fn erases_only_sectors_being_written() {
        let mut s = session();
        assert_eq!(s.begin(5000, 0x1000), ErrorCode::Ok);
        assert!(s.flash().erases.is_empty());

        assert_eq!(s.write(&[0xAA; 100]), ErrorCode::Ok);
        assert_eq!(s.flash().erases, [(0x1000, 0x2000)]);

        assert_eq!(s.write(&[0xBB; 4900]), ErrorCode::Ok);
        assert_eq!(s.flash().erases, [(0x1000, 0x2000), (0x2000, 0x3000)]);
        // Untouched neighbours keep their contents
        assert_eq!(s.flash().data[0x0FFF], 0x00);
        assert_eq!(s.flash().data[0x3000], 0x00);
    }

    #[test]
    fn padded_final_block_is_trimmed() {
        let mut s = session();
        assert_eq!(s.begin(300, 0), ErrorCode::Ok);
        assert_eq!(s.write(&[0x11; 256]), ErrorCode::Ok);

        let mut last = [0xFF; 256];
        last[..44].copy_from_slice(&[0x22; 44]);
        assert_eq!(s.write(&last), ErrorCode::Ok);
        assert_eq!(s.remaining(), 0);
        assert_eq!(s.end(), ErrorCode::Ok);

        assert_eq!(s.flash().data[299], 0x22);
        assert_eq!(s.flash().data[300], 0xFF);
    }

    #[test]
    fn writes_past_total_are_refused_without_side_effects() {
        let mut s = session();
        assert_eq!(s.begin(4, 0), ErrorCode::Ok);
        assert_eq!(s.write(&[1, 2, 3, 4]), ErrorCode::Ok);

        assert_eq!(s.write(&[5, 6]), ErrorCode::TooMuchData);
        assert_eq!(s.write(&[5, 6]), ErrorCode::TooMuchData);
        assert_eq!(s.last_error(), ErrorCode::Ok);
        assert_eq!(&s.flash().data[..6], &[1, 2, 3, 4, 0xFF, 0xFF]);
        assert_eq!(s.end(), ErrorCode::Ok);
    }

    #[test]
    fn end_before_all_data_keeps_session_open() {
        let mut s = session();
        assert_eq!(s.begin(512, 0), ErrorCode::Ok);
        assert_eq!(s.write(&[0; 256]), ErrorCode::Ok);
        assert_eq!(s.end(), ErrorCode::NotEnoughData);
        assert!(s.in_flash_mode());

        assert_eq!(s.write(&[0; 256]), ErrorCode::Ok);
        assert_eq!(s.end(), ErrorCode::Ok);
    }

    #[test]
    fn write_failure_is_latched_until_end() {
        let mut s = session();
        assert_eq!(s.begin(8, 0), ErrorCode::Ok);
        assert_eq!(s.write(&[1, 2, 3, 4]), ErrorCode::Ok);

        // Dirty the next bytes behind the session's back
        s.flash_mut().data[4] = 0x00;
        assert_eq!(s.write(&[5, 6, 7, 8]), ErrorCode::FailedSpiOp);
        assert_eq!(s.last_error(), ErrorCode::FailedSpiOp);
        assert_eq!(s.end(), ErrorCode::FailedSpiOp);

        // A new session starts clean
        assert_eq!(s.begin(4, 0x1000), ErrorCode::Ok);
        assert_eq!(s.last_error(), ErrorCode::Ok);
    }

    #[test]
    fn begin_beyond_capacity_fails() {
        let mut s = session();
        assert_eq!(s.begin(0x1000, 0xF001), ErrorCode::TooMuchData);
        assert!(!s.in_flash_mode());
        assert_eq!(s.begin(0x1000, u32::MAX), ErrorCode::TooMuchData);
    }

    #[test]
    fn erase_region_requires_sector_alignment() {
        let mut s = session();
        assert_eq!(s.erase_region(0x1000, 0x2000), ErrorCode::Ok);
        assert_eq!(s.flash().erases, [(0x1000, 0x3000)]);

        assert_eq!(s.erase_region(0x1001, 0x1000), ErrorCode::BadBlocksize);
        assert_eq!(s.erase_region(0x1000, 0x10), ErrorCode::BadBlocksize);
        assert_eq!(s.erase_region(0xF000, 0x2000), ErrorCode::TooMuchData);
    }

    #[test]
    fn erase_chip_wipes_everything() {
        let mut s = session();
        assert_eq!(s.erase_chip(), ErrorCode::Ok);
        assert!(s.flash().data.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn deflated_session_inflates_across_chunks() {
        let data = pattern(40_000);
        let compressed = miniz_oxide::deflate::compress_to_vec_zlib(&data, 6);

        let mut s = session();
        assert_eq!(
            s.deflated_begin(data.len() as u32, compressed.len() as u32, 0x4000),
            ErrorCode::Ok
        );
        for chunk in compressed.chunks(1024) {
            assert_eq!(s.deflated_write(chunk), ErrorCode::Ok);
        }
        assert_eq!(s.remaining(), 0);
        assert_eq!(s.end(), ErrorCode::Ok);
        assert_eq!(&s.flash().data[0x4000..0x4000 + data.len()], &data[..]);
    }

    #[test]
    fn corrupt_deflate_stream_latches_inflate_error() {
        let mut s = session();
        assert_eq!(s.deflated_begin(1000, 16, 0), ErrorCode::Ok);
        assert_eq!(s.deflated_write(&[0xFF; 16]), ErrorCode::InflateError);
        assert_eq!(s.last_error(), ErrorCode::InflateError);
    }

    #[test]
    fn plain_and_compressed_writes_do_not_mix() {
        let mut s = session();
        assert_eq!(s.begin(16, 0), ErrorCode::Ok);
        assert_eq!(s.deflated_write(&[0x78, 0x9C]), ErrorCode::InvalidCommand);

        assert_eq!(s.deflated_begin(16, 16, 0), ErrorCode::Ok);
        assert_eq!(s.write(&[0; 16]), ErrorCode::InvalidCommand);
    }
}
