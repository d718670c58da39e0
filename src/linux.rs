//! Linux emulation of the stub: serves the protocol on a serial port and
//! programs a file backed flash image.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek, SeekFrom, Write as _};
use std::path::Path;
use std::thread;
use std::time::Duration;

use embedded_storage::nor_flash::{
    check_erase, check_read, check_write, ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash,
};
use linux_embedded_hal::{Delay, Serial};
use md5::Md5;
use serial_core::{
    BaudRate, CharSize, Error as SerialError, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};

use crate::buffer::{FrameBuffers, FrameReceiver};
use crate::intake;
use crate::platform::Platform;
use crate::protocol::{ErrorCode, SpiParams, RX_BUFFER_SIZE};
use crate::session::FlashSession;
use crate::{boot, Options, RxBuffers};

/// Open a serial port and apply 8N1 settings at `baud`
pub fn open_port<P: AsRef<Path>>(port: P, baud: usize) -> Result<Serial, SerialError> {
    let mut port = Serial::open(port.as_ref())?;
    configure(&mut port, baud)?;
    Ok(port)
}

fn configure(port: &mut Serial, baud: usize) -> Result<(), SerialError> {
    let mut settings = port.0.read_settings()?;

    settings.set_char_size(CharSize::Bits8);
    settings.set_stop_bits(StopBits::Stop1);
    settings.set_baud_rate(BaudRate::from_speed(baud))?;
    settings.set_flow_control(FlowControl::FlowNone);
    settings.set_parity(Parity::ParityNone);

    port.0.write_settings(&settings)
}

/// Flash image kept in a file, with NOR semantics
pub struct FileFlash {
    file: File,
    size: u32,
}

impl FileFlash {
    pub const ERASED: u8 = 0xFF;

    /// Open or create an image of `size` bytes, padding new space as erased
    pub fn open<P: AsRef<Path>>(path: P, size: u32) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(path)?;

        let len = file.metadata()?.len();
        if len < size as u64 {
            debug!("Extending flash image from {} to {} bytes", len, size);
            file.seek(SeekFrom::Start(len))?;
            let fill = vec![Self::ERASED; (size as u64 - len) as usize];
            file.write_all(&fill)?;
        }

        Ok(Self { file, size })
    }

    fn read_at(&mut self, offset: u32, bytes: &mut [u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.read_exact(bytes)
    }

    fn write_at(&mut self, offset: u32, bytes: &[u8]) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset as u64))?;
        self.file.write_all(bytes)
    }
}

fn io_error(e: std::io::Error) -> NorFlashErrorKind {
    error!("Flash image access failed: {}", e);
    NorFlashErrorKind::Other
}

impl ErrorType for FileFlash {
    type Error = NorFlashErrorKind;
}

impl ReadNorFlash for FileFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        check_read(self, offset, bytes.len())?;
        self.read_at(offset, bytes).map_err(io_error)
    }

    fn capacity(&self) -> usize {
        self.size as usize
    }
}

impl NorFlash for FileFlash {
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = 4096;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        check_erase(self, from, to)?;
        trace!("Erase 0x{:08x}..0x{:08x}", from, to);

        let erased = vec![Self::ERASED; (to - from) as usize];
        self.write_at(from, &erased).map_err(io_error)
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        check_write(self, offset, bytes.len())?;
        trace!("Write 0x{:08x}: {}", offset, hex::encode(&bytes[..bytes.len().min(32)]));

        // Programming only clears bits
        let mut current = vec![0u8; bytes.len()];
        self.read_at(offset, &mut current).map_err(io_error)?;
        for (c, b) in current.iter_mut().zip(bytes) {
            *c &= *b;
        }
        self.write_at(offset, &current).map_err(io_error)
    }
}

/// Registers, SPI setup and UART control emulated on the host
pub struct LinuxPlatform {
    control: Serial,
    rx: Option<Serial>,
    registers: HashMap<u32, u32>,
    spi_params: Option<SpiParams>,
}

impl LinuxPlatform {
    /// `control` is used for baud changes, `rx` is handed to the receive thread
    pub fn new(control: Serial, rx: Serial) -> Self {
        Self {
            control,
            rx: Some(rx),
            registers: HashMap::new(),
            spi_params: None,
        }
    }

    pub fn spi_params(&self) -> Option<&SpiParams> {
        self.spi_params.as_ref()
    }
}

impl Platform for LinuxPlatform {
    fn read_register(&mut self, address: u32) -> u32 {
        let value = self.registers.get(&address).copied().unwrap_or(0);
        debug!("Read register 0x{:08x}: 0x{:08x}", address, value);
        value
    }

    fn write_register(&mut self, address: u32, value: u32) {
        debug!("Write register 0x{:08x}: 0x{:08x}", address, value);
        self.registers.insert(address, value);
    }

    fn spi_attach(&mut self, config: u32, legacy: bool) -> ErrorCode {
        debug!("SPI attach config 0x{:x} legacy {}", config, legacy);
        ErrorCode::Ok
    }

    fn spi_set_params(&mut self, params: &SpiParams) -> u32 {
        debug!("SPI params {:?}", params);
        self.spi_params = Some(*params);
        0
    }

    fn set_baud_rate(&mut self, baud: u32) {
        if let Err(e) = configure(&mut self.control, baud as usize) {
            error!("Failed to set baud rate {}: {:?}", baud, e);
        }
    }

    fn attach_receiver<const N: usize>(&mut self, mut receiver: FrameReceiver<'static, N>) {
        let mut rx = match self.rx.take() {
            Some(rx) => rx,
            None => {
                error!("Receiver already attached");
                return;
            }
        };

        // Stands in for the UART interrupt
        thread::spawn(move || loop {
            match intake::drain(&mut rx, &mut receiver) {
                Ok(0) => thread::sleep(Duration::from_micros(100)),
                Ok(_) => (),
                Err(e) => {
                    error!("Serial receive failed, stopping receiver: {:?}", e);
                    break;
                }
            }
        });
    }

    fn idle(&mut self) {
        thread::sleep(Duration::from_micros(100));
    }

    fn boot_application(&mut self) -> ! {
        info!("Booting application");
        std::process::exit(0)
    }
}

/// Serve the stub on `port` until the host reboots it, programming into `image`
pub fn serve<P, I>(port: P, baud: usize, image: I, flash_size: u32, options: Options) -> anyhow::Result<()>
where
    P: AsRef<Path>,
    I: AsRef<Path>,
{
    let port = port.as_ref();

    let tx = open_port(port, baud)?;
    let rx = Serial::open(port)?;
    let control = Serial::open(port)?;

    let flash = FileFlash::open(image, flash_size)?;
    let platform = LinuxPlatform::new(control, rx);

    let buffers: &'static RxBuffers = Box::leak(Box::new(FrameBuffers::new()));

    let never = boot::start::<_, _, _, _, Md5, RX_BUFFER_SIZE>(
        tx,
        Delay {},
        FlashSession::new(flash),
        platform,
        buffers,
        options,
    )?;

    match never {}
}
