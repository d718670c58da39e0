//! UART receive interrupt service.

use embedded_hal::serial::Read;

use crate::buffer::FrameReceiver;

/// Receive interrupt status of a UART
pub trait RxInterrupt {
    /// Pending interrupt bits
    fn status(&mut self) -> u32;

    /// Acknowledge the given interrupt bits
    fn clear(&mut self, status: u32);
}

/// Move every byte currently in the receive FIFO into `receiver`.
///
/// Returns the byte count once the FIFO reads empty, bytes arriving later
/// are left for the next call. A read error ends the drain early and is
/// returned, the byte it concerned is lost and SLIP resynchronises.
pub fn drain<R, const N: usize>(rx: &mut R, receiver: &mut FrameReceiver<'_, N>) -> Result<usize, R::Error>
where
    R: Read<u8>,
{
    let mut n = 0;
    loop {
        match rx.read() {
            Ok(b) => {
                receiver.accept(b);
                n += 1;
            }
            Err(nb::Error::WouldBlock) => return Ok(n),
            Err(nb::Error::Other(e)) => return Err(e),
        }
    }
}

/// Interrupt handler body: drain the FIFO, then acknowledge what was pending
pub fn service<U, const N: usize>(uart: &mut U, receiver: &mut FrameReceiver<'_, N>) -> Result<usize, U::Error>
where
    U: Read<u8> + RxInterrupt,
{
    let status = uart.status();
    let n = drain(uart, receiver);
    uart.clear(status);
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::FrameBuffers;
    use crate::slip::END;

    extern crate std;
    use std::collections::VecDeque;
    use std::vec::Vec;

    #[derive(Default)]
    struct FakeUart {
        fifo: VecDeque<Result<u8, ()>>,
        broken: bool,
        status: u32,
        cleared: Vec<u32>,
    }

    impl Read<u8> for FakeUart {
        type Error = ();

        fn read(&mut self) -> nb::Result<u8, ()> {
            if self.broken {
                return Err(nb::Error::Other(()));
            }
            match self.fifo.pop_front() {
                Some(Ok(b)) => Ok(b),
                Some(Err(())) => Err(nb::Error::Other(())),
                None => Err(nb::Error::WouldBlock),
            }
        }
    }

    impl RxInterrupt for FakeUart {
        fn status(&mut self) -> u32 {
            self.status
        }

        fn clear(&mut self, status: u32) {
            self.status &= !status;
            self.cleared.push(status);
        }
    }

    #[test]
    fn drains_fifo_and_clears_status() {
        let buffers = FrameBuffers::<32>::new();
        let (mut rx, mut queue) = buffers.split().unwrap();

        let mut uart = FakeUart::default();
        uart.status = 0x101;
        uart.fifo.extend([END, 0x01, 0x02, END].iter().map(|&b| Ok(b)));

        assert_eq!(service(&mut uart, &mut rx), Ok(4));
        assert_eq!(uart.cleared, [0x101]);
        assert_eq!(queue.take().unwrap().bytes(), &[0x01, 0x02]);
    }

    #[test]
    fn partial_frame_completes_on_next_interrupt() {
        let buffers = FrameBuffers::<32>::new();
        let (mut rx, mut queue) = buffers.split().unwrap();

        let mut uart = FakeUart::default();
        uart.fifo.extend([END, 0x0A, 0x0B].iter().map(|&b| Ok(b)));
        service(&mut uart, &mut rx).unwrap();
        assert!(queue.take().is_none());

        uart.fifo.extend([0x0C, END].iter().map(|&b| Ok(b)));
        service(&mut uart, &mut rx).unwrap();
        assert_eq!(queue.take().unwrap().bytes(), &[0x0A, 0x0B, 0x0C]);
    }

    #[test]
    fn read_error_ends_the_drain_and_loses_the_byte() {
        let buffers = FrameBuffers::<32>::new();
        let (mut rx, mut queue) = buffers.split().unwrap();

        let mut uart = FakeUart::default();
        uart.fifo.extend([Ok(END), Ok(0x01), Err(()), Ok(0x03), Ok(END)]);
        assert_eq!(drain(&mut uart, &mut rx), Err(()));
        assert!(queue.take().is_none());

        assert_eq!(drain(&mut uart, &mut rx), Ok(2));
        assert_eq!(queue.take().unwrap().bytes(), &[0x01, 0x03]);
    }

    #[test]
    fn failing_port_does_not_hold_the_handler() {
        let buffers = FrameBuffers::<32>::new();
        let (mut rx, _queue) = buffers.split().unwrap();

        let mut uart = FakeUart::default();
        uart.broken = true;
        uart.status = 0x100;

        assert_eq!(service(&mut uart, &mut rx), Err(()));
        assert_eq!(uart.cleared, [0x100]);
    }
}
