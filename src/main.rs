#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::convert::TryFrom;

use esp_flasher_stub::{linux, Options};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to serve the stub on
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Initial serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    /// File backing the emulated SPI flash
    #[structopt(long, default_value = "flash.bin")]
    flash_image: String,

    /// Size of the emulated SPI flash
    #[structopt(long, default_value = "4MiB", parse(try_from_str = parse_size))]
    flash_size: u32,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

fn parse_size(s: &str) -> Result<u32, String> {
    let n = bytefmt::parse(s)?;
    u32::try_from(n).map_err(|_| format!("flash size {} exceeds 4GiB", s))
}

fn main() {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    info!(
        "Serving stub on {} at {} baud, flash image {} ({} bytes)",
        o.port, o.baud, o.flash_image, o.flash_size
    );

    if let Err(e) = linux::serve(&o.port, o.baud, &o.flash_image, o.flash_size, o.options) {
        error!("Stub stopped: {:?}", e);
        std::process::exit(1);
    }
}
