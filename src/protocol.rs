//! Wire format shared with the host flashing tool.

/// Largest flash write block the host may send in one data command
pub const MAX_WRITE_BLOCK: usize = 0x4000;

/// Size of each receive buffer
pub const RX_BUFFER_SIZE: usize = MAX_WRITE_BLOCK + 64;

/// Declared lengths above this are rejected before dispatch
pub const MAX_DATA_LEN: usize = MAX_WRITE_BLOCK + 16;

/// Status byte sent alongside `ErrorCode::BadDataLen` for oversized frames
pub const OVERSIZE_STATUS: u8 = 0xEE;

/// Greeting sent once the stub is running
pub const GREETING: [u8; 4] = *b"OHAI";

/// Request header: direction, opcode, data length (u16), checksum (u32)
pub const REQUEST_HEADER_LEN: usize = 8;

/// Flash data payloads start with length, sequence and two reserved words
pub const DATA_HEADER_LEN: usize = 16;

pub const CHECKSUM_SEED: u8 = 0xEF;

pub const FLASH_SECTOR_SIZE: u32 = 4096;
pub const FLASH_BLOCK_SIZE: u32 = 65536;
pub const FLASH_PAGE_SIZE: u32 = 256;
pub const FLASH_STATUS_MASK: u32 = 0xFFFF;
pub const DEFAULT_FLASH_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum in-band data a handler may append to a response
pub const MAX_RESPONSE_DATA: usize = 64;

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Command {
    /// Open a flash session: erase size (ignored), block count, block size, offset
    FlashBegin = 0x02,

    /// One block of flash data, acknowledged before it is written
    FlashData = 0x03,

    /// Close the flash session, word 0 == 0 requests a reboot into the application
    FlashEnd = 0x04,

    /// Write a 32-bit register: address, value, mask (ignored), delay (ignored)
    WriteReg = 0x09,

    /// Read a 32-bit register, the value is returned in the response header
    ReadReg = 0x0A,

    /// Configure SPI flash geometry: id, total size, block, sector, page, status mask
    SpiSetParams = 0x0B,

    /// Attach the SPI flash: interface selection, legacy flag
    SpiAttach = 0x0D,

    /// Switch baud rate once the response has been sent: new rate, old rate (ignored)
    ChangeBaudrate = 0x0F,

    /// Open a compressed flash session: uncompressed size, block count, block size, offset
    FlashDeflBegin = 0x10,

    /// One block of zlib compressed flash data
    FlashDeflData = 0x11,

    /// Close the compressed flash session
    FlashDeflEnd = 0x12,

    /// MD5 of a flash region: address, length, two unused words
    SpiFlashMd5 = 0x13,

    /// Erase the whole flash chip
    EraseFlash = 0xD0,

    /// Erase a sector aligned flash region: address, length
    EraseRegion = 0xD1,

    /// Stream a flash region back: offset, length, block size, max in flight
    ReadFlash = 0xD2,
}

impl Command {
    pub fn from_op(op: u8) -> Option<Self> {
        use Command::*;

        let c = match op {
            0x02 => FlashBegin,
            0x03 => FlashData,
            0x04 => FlashEnd,
            0x09 => WriteReg,
            0x0A => ReadReg,
            0x0B => SpiSetParams,
            0x0D => SpiAttach,
            0x0F => ChangeBaudrate,
            0x10 => FlashDeflBegin,
            0x11 => FlashDeflData,
            0x12 => FlashDeflEnd,
            0x13 => SpiFlashMd5,
            0xD0 => EraseFlash,
            0xD1 => EraseRegion,
            0xD2 => ReadFlash,
            _ => return None,
        };

        Some(c)
    }

    /// Data length the command must declare, `None` for variable length commands
    pub fn expected_len(&self) -> Option<usize> {
        use Command::*;

        match self {
            EraseFlash => Some(0),
            EraseRegion | ChangeBaudrate | SpiAttach => Some(8),
            ReadFlash | SpiFlashMd5 | FlashBegin | FlashDeflBegin | WriteReg => Some(16),
            SpiSetParams => Some(24),
            ReadReg => Some(4),
            FlashData | FlashDeflData | FlashEnd | FlashDeflEnd => None,
        }
    }
}

/// Result code carried in every response trailer
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorCode {
    Ok,
    BadDataLen,
    BadDataChecksum,
    BadBlocksize,
    InvalidCommand,
    FailedSpiOp,
    FailedSpiUnlock,
    NotInFlashMode,
    InflateError,
    NotEnoughData,
    TooMuchData,
    CmdNotImplemented,
    /// Code reported by a collaborator, passed through untouched
    Other(u8),
}

impl ErrorCode {
    pub fn code(&self) -> u8 {
        use ErrorCode::*;

        match self {
            Ok => 0x00,
            BadDataLen => 0xC0,
            BadDataChecksum => 0xC1,
            BadBlocksize => 0xC2,
            InvalidCommand => 0xC3,
            FailedSpiOp => 0xC4,
            FailedSpiUnlock => 0xC5,
            NotInFlashMode => 0xC6,
            InflateError => 0xC7,
            NotEnoughData => 0xC8,
            TooMuchData => 0xC9,
            CmdNotImplemented => 0xFF,
            Other(c) => *c,
        }
    }

    pub fn is_ok(&self) -> bool {
        *self == ErrorCode::Ok
    }

    /// Run `f` only if this step succeeded
    pub fn and_then<F: FnOnce() -> ErrorCode>(self, f: F) -> ErrorCode {
        if self.is_ok() {
            f()
        } else {
            self
        }
    }
}

impl From<u8> for ErrorCode {
    fn from(code: u8) -> Self {
        use ErrorCode::*;

        match code {
            0x00 => Ok,
            0xC0 => BadDataLen,
            0xC1 => BadDataChecksum,
            0xC2 => BadBlocksize,
            0xC3 => InvalidCommand,
            0xC4 => FailedSpiOp,
            0xC5 => FailedSpiUnlock,
            0xC6 => NotInFlashMode,
            0xC7 => InflateError,
            0xC8 => NotEnoughData,
            0xC9 => TooMuchData,
            0xFF => CmdNotImplemented,
            c => Other(c),
        }
    }
}

/// XOR of the seed and every payload byte
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(CHECKSUM_SEED, |acc, b| acc ^ b)
}

/// Borrowed view over a received request frame
#[derive(Debug, Clone, Copy)]
pub struct CommandFrame<'a> {
    op: u8,
    data_len: u16,
    checksum: u32,
    data: &'a [u8],
}

impl<'a> CommandFrame<'a> {
    /// Split a decoded frame into header and data, `None` if the header is incomplete
    pub fn parse(frame: &'a [u8]) -> Option<Self> {
        if frame.len() < REQUEST_HEADER_LEN {
            return None;
        }
        let (header, data) = frame.split_at(REQUEST_HEADER_LEN);

        Some(Self {
            op: header[1],
            data_len: u16::from_le_bytes([header[2], header[3]]),
            checksum: u32::from_le_bytes([header[4], header[5], header[6], header[7]]),
            data,
        })
    }

    pub fn op(&self) -> u8 {
        self.op
    }

    pub fn command(&self) -> Option<Command> {
        Command::from_op(self.op)
    }

    /// Length declared in the header
    pub fn data_len(&self) -> usize {
        self.data_len as usize
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Received data, truncated to the declared length
    pub fn data(&self) -> &'a [u8] {
        let n = self.data.len().min(self.data_len());
        &self.data[..n]
    }

    /// Whether at least the declared number of data bytes arrived
    pub fn is_complete(&self) -> bool {
        self.data.len() >= self.data_len()
    }

    /// Declared length matches `expected` and all of it was received
    pub fn has_len(&self, expected: usize) -> bool {
        self.data_len() == expected && self.is_complete()
    }

    /// Little-endian parameter word `index` of the data
    pub fn word(&self, index: usize) -> Option<u32> {
        let start = index.checked_mul(4)?;
        let bytes = self.data().get(start..start + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Word `index`, zero when absent
    pub fn word_or_zero(&self, index: usize) -> u32 {
        self.word(index).unwrap_or(0)
    }
}

/// Fixed response header, followed on the wire by handler data and the status trailer
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct ResponseHeader {
    pub op: u8,
    pub value: u32,
}

impl ResponseHeader {
    pub const LEN: usize = 8;

    pub fn new(op: u8) -> Self {
        Self { op, value: 0 }
    }

    /// Direction marker, opcode echo, reserved length, value
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let v = self.value.to_le_bytes();
        [1, self.op, 0, 0, v[0], v[1], v[2], v[3]]
    }
}

/// SPI flash geometry passed to `SpiSetParams`
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct SpiParams {
    pub id: u32,
    pub total_size: u32,
    pub block_size: u32,
    pub sector_size: u32,
    pub page_size: u32,
    pub status_mask: u32,
}

impl SpiParams {
    pub fn from_frame(frame: &CommandFrame) -> Self {
        Self {
            id: frame.word_or_zero(0),
            total_size: frame.word_or_zero(1),
            block_size: frame.word_or_zero(2),
            sector_size: frame.word_or_zero(3),
            page_size: frame.word_or_zero(4),
            status_mask: frame.word_or_zero(5),
        }
    }
}

impl Default for SpiParams {
    fn default() -> Self {
        Self {
            id: 0,
            total_size: DEFAULT_FLASH_SIZE,
            block_size: FLASH_BLOCK_SIZE,
            sector_size: FLASH_SECTOR_SIZE,
            page_size: FLASH_PAGE_SIZE,
            status_mask: FLASH_STATUS_MASK,
        }
    }
}

/// Parameters of a read-flash request
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct ReadParams {
    pub offset: u32,
    pub length: u32,
    pub block_size: u32,
    pub max_in_flight: u32,
}
