//! ESP8266 / ESP32 UART differences.
//!
//! [`Uart`] is the building block for on-target [`Platform`](crate::Platform)
//! implementations: it is the serial port handed to the dispatcher, the
//! [`RxInterrupt`] source for [`intake::service`](crate::intake::service),
//! and [`Uart::set_baud`] backs `Platform::set_baud_rate`.

use core::convert::{Infallible, TryFrom};
use core::ptr::{read_volatile, write_volatile};

use embedded_hal::serial::{Read, Write};

use crate::intake::RxInterrupt;

const UART_FIFO: usize = 0x00;
const UART_INT_ST: usize = 0x08;
const UART_INT_ENA: usize = 0x0C;
const UART_INT_CLR: usize = 0x10;
const UART_CLKDIV: usize = 0x14;
const UART_STATUS: usize = 0x1C;

pub const UART_RXFIFO_FULL_INT: u32 = 1 << 0;
pub const UART_RXFIFO_TOUT_INT: u32 = 1 << 8;
pub const UART_RX_INTS: u32 = UART_RXFIFO_FULL_INT | UART_RXFIFO_TOUT_INT;

const UART_FIFO_DEPTH: u32 = 128;

pub trait Chip {
    const NAME: &'static str;

    /// Address of the UART0 register block
    const UART0_BASE: usize;

    /// Fractional bits in the UART clock divisor
    const DIVISOR_FRAC_BITS: u32;

    /// Clock feeding the UART baud generator
    fn uart_clock_hz(&self) -> u32;

    /// Encode a divisor for the CLKDIV register
    fn clkdiv(divisor: u32) -> u32;
}

pub struct Esp8266;

impl Chip for Esp8266 {
    const NAME: &'static str = "ESP8266";
    const UART0_BASE: usize = 0x6000_0000;
    const DIVISOR_FRAC_BITS: u32 = 0;

    fn uart_clock_hz(&self) -> u32 {
        52_000_000
    }

    fn clkdiv(divisor: u32) -> u32 {
        divisor & 0xF_FFFF
    }
}

/// ESP32 running from its crystal, as it does under the ROM loader
pub struct Esp32 {
    pub xtal_hz: u32,
}

impl Chip for Esp32 {
    const NAME: &'static str = "ESP32";
    const UART0_BASE: usize = 0x3FF4_0000;
    const DIVISOR_FRAC_BITS: u32 = 4;

    fn uart_clock_hz(&self) -> u32 {
        self.xtal_hz
    }

    fn clkdiv(divisor: u32) -> u32 {
        ((divisor >> 4) & 0xF_FFFF) | ((divisor & 0xF) << 20)
    }
}

/// Round-to-nearest baud divisor with `frac_bits` fractional bits
pub fn baud_divisor(clock_hz: u32, frac_bits: u32, baud: u32) -> Option<u32> {
    if baud == 0 {
        return None;
    }
    let clock = (clock_hz as u64) << frac_bits;
    let divisor = (clock + baud as u64 / 2) / baud as u64;
    u32::try_from(divisor).ok()
}

/// Memory mapped UART register block
pub struct Uart<C> {
    base: *mut u32,
    chip: C,
}

impl<C: Chip> Uart<C> {
    /// UART0 at its fixed address
    ///
    /// # Safety
    /// Only one `Uart` may exist per register block.
    pub unsafe fn uart0(chip: C) -> Self {
        Self::from_ptr(C::UART0_BASE as *mut u32, chip)
    }

    /// # Safety
    /// `base` must point to a UART register block valid for the lifetime of `Self`.
    pub unsafe fn from_ptr(base: *mut u32, chip: C) -> Self {
        Self { base, chip }
    }

    fn reg(&self, offset: usize) -> u32 {
        unsafe { read_volatile(self.base.add(offset / 4)) }
    }

    fn set_reg(&mut self, offset: usize, value: u32) {
        unsafe { write_volatile(self.base.add(offset / 4), value) }
    }

    fn rx_count(&self) -> u32 {
        self.reg(UART_STATUS) & 0xFF
    }

    fn tx_count(&self) -> u32 {
        (self.reg(UART_STATUS) >> 16) & 0xFF
    }

    pub fn enable_rx_interrupts(&mut self) {
        let ena = self.reg(UART_INT_ENA);
        self.set_reg(UART_INT_ENA, ena | UART_RX_INTS);
    }

    /// Program the divisor for `baud`, returns false if it is out of range
    pub fn set_baud(&mut self, baud: u32) -> bool {
        match baud_divisor(self.chip.uart_clock_hz(), C::DIVISOR_FRAC_BITS, baud) {
            Some(divisor) if divisor > 0 => {
                trace!("{}: baud {} divisor 0x{:x}", C::NAME, baud, divisor);
                self.set_reg(UART_CLKDIV, C::clkdiv(divisor));
                true
            }
            _ => false,
        }
    }
}

impl<C: Chip> Read<u8> for Uart<C> {
    type Error = Infallible;

    fn read(&mut self) -> nb::Result<u8, Infallible> {
        if self.rx_count() == 0 {
            return Err(nb::Error::WouldBlock);
        }
        Ok((self.reg(UART_FIFO) & 0xFF) as u8)
    }
}

impl<C: Chip> Write<u8> for Uart<C> {
    type Error = Infallible;

    fn write(&mut self, word: u8) -> nb::Result<(), Infallible> {
        if self.tx_count() >= UART_FIFO_DEPTH - 2 {
            return Err(nb::Error::WouldBlock);
        }
        self.set_reg(UART_FIFO, word as u32);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Infallible> {
        if self.tx_count() > 0 {
            return Err(nb::Error::WouldBlock);
        }
        Ok(())
    }
}

impl<C: Chip> RxInterrupt for Uart<C> {
    fn status(&mut self) -> u32 {
        self.reg(UART_INT_ST)
    }

    fn clear(&mut self, status: u32) {
        self.set_reg(UART_INT_CLR, status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn esp8266_divisor_is_integer() {
        let d = baud_divisor(Esp8266.uart_clock_hz(), Esp8266::DIVISOR_FRAC_BITS, 115_200).unwrap();
        assert_eq!(d, 451);
        assert_eq!(Esp8266::clkdiv(d), 451);
    }

    #[test]
    fn esp32_divisor_has_fractional_part() {
        let chip = Esp32 { xtal_hz: 40_000_000 };
        let d = baud_divisor(chip.uart_clock_hz(), Esp32::DIVISOR_FRAC_BITS, 921_600).unwrap();
        // 40 MHz / 921600 = 43.40, times 16 rounds to 694
        assert_eq!(d, 694);
        assert_eq!(Esp32::clkdiv(d), 43 | (6 << 20));
    }

    #[test]
    fn zero_baud_has_no_divisor() {
        assert_eq!(baud_divisor(52_000_000, 0, 0), None);
        assert_eq!(baud_divisor(u32::MAX, 4, 1), None);
    }

    #[test]
    fn register_block_access() {
        let mut regs = [0u32; 8];
        let mut uart = unsafe { Uart::from_ptr(regs.as_mut_ptr(), Esp8266) };

        assert!(matches!(uart.read(), Err(nb::Error::WouldBlock)));
        assert!(uart.set_baud(115_200));
        assert!(!uart.set_baud(0));
        uart.enable_rx_interrupts();
        uart.clear(UART_RXFIFO_TOUT_INT);
        uart.write(0x5A).unwrap();
        drop(uart);

        assert_eq!(regs[UART_CLKDIV / 4], 451);
        assert_eq!(regs[UART_INT_ENA / 4], UART_RX_INTS);
        assert_eq!(regs[UART_INT_CLR / 4], UART_RXFIFO_TOUT_INT);
        assert_eq!(regs[UART_FIFO / 4], 0x5A);

        regs[UART_STATUS / 4] = 2;
        regs[UART_FIFO / 4] = 0x1C0;
        let mut uart = unsafe { Uart::from_ptr(regs.as_mut_ptr(), Esp8266) };
        assert!(matches!(uart.read(), Ok(0xC0)));
    }
}
