//! SLIP byte stuffing used to delimit frames on the serial link.

use embedded_hal::serial::Write;

pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

#[derive(Copy, Clone, PartialEq, Debug)]
enum State {
    /// Before the first delimiter
    Idle,
    /// Delimiter seen, no payload yet
    Start,
    Frame,
    Escaping,
}

/// Outcome of feeding one byte to the decoder
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Decoded {
    /// Byte consumed, nothing to store
    Nothing,
    /// Decoded payload byte
    Byte(u8),
    /// Closing delimiter seen
    EndOfFrame,
}

/// Incremental SLIP decoder
#[derive(Clone, Debug)]
pub struct Decoder {
    state: State,
}

impl Decoder {
    pub const fn new() -> Self {
        Self { state: State::Idle }
    }

    /// Feed one byte.
    ///
    /// Every delimiter both closes the current frame and opens the next, an
    /// empty frame is never reported. A lost delimiter therefore costs at
    /// most the frame it belonged to.
    pub fn decode(&mut self, byte: u8) -> Decoded {
        if byte == END {
            let state = core::mem::replace(&mut self.state, State::Start);
            return match state {
                State::Frame | State::Escaping => Decoded::EndOfFrame,
                State::Idle | State::Start => Decoded::Nothing,
            };
        }

        match self.state {
            State::Idle => Decoded::Nothing,
            State::Start | State::Frame if byte == ESC => {
                self.state = State::Escaping;
                Decoded::Nothing
            }
            State::Start | State::Frame => {
                self.state = State::Frame;
                Decoded::Byte(byte)
            }
            State::Escaping => {
                self.state = State::Frame;
                match byte {
                    ESC_END => Decoded::Byte(END),
                    ESC_ESC => Decoded::Byte(ESC),
                    // Invalid escape, drop it
                    _ => Decoded::Nothing,
                }
            }
        }
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes SLIP framed data to a serial port
pub struct Encoder<'a, W> {
    port: &'a mut W,
}

impl<'a, W, E> Encoder<'a, W>
where
    W: Write<u8, Error = E>,
{
    pub fn new(port: &'a mut W) -> Self {
        Self { port }
    }

    pub fn delimiter(&mut self) -> Result<(), E> {
        block!(self.port.write(END))
    }

    /// Write frame data, escaping reserved bytes
    pub fn data(&mut self, data: &[u8]) -> Result<(), E> {
        for &b in data {
            match b {
                END => {
                    block!(self.port.write(ESC))?;
                    block!(self.port.write(ESC_END))?;
                }
                ESC => {
                    block!(self.port.write(ESC))?;
                    block!(self.port.write(ESC_ESC))?;
                }
                _ => block!(self.port.write(b))?,
            }
        }
        Ok(())
    }

    /// Write a complete frame
    pub fn frame(&mut self, data: &[u8]) -> Result<(), E> {
        self.delimiter()?;
        self.data(data)?;
        self.delimiter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern crate std;
    use std::vec::Vec;

    struct Sink(Vec<u8>);

    impl Write<u8> for Sink {
        type Error = ();

        fn write(&mut self, b: u8) -> nb::Result<(), ()> {
            self.0.push(b);
            Ok(())
        }

        fn flush(&mut self) -> nb::Result<(), ()> {
            Ok(())
        }
    }

    fn decode_all(input: &[u8]) -> Vec<Vec<u8>> {
        let mut d = Decoder::new();
        let mut frames = Vec::new();
        let mut current = Vec::new();
        for &b in input {
            match d.decode(b) {
                Decoded::Nothing => (),
                Decoded::Byte(v) => current.push(v),
                Decoded::EndOfFrame => frames.push(core::mem::take(&mut current)),
            }
        }
        frames
    }

    #[test]
    fn escapes_reserved_bytes() {
        let mut sink = Sink(Vec::new());
        Encoder::new(&mut sink).frame(&[0x01, END, 0x02, ESC, 0x03]).unwrap();

        assert_eq!(
            sink.0,
            [END, 0x01, ESC, ESC_END, 0x02, ESC, ESC_ESC, 0x03, END]
        );
    }

    #[test]
    fn decodes_escaped_frame() {
        let frames = decode_all(&[END, 0x01, ESC, ESC_END, ESC, ESC_ESC, END]);
        assert_eq!(frames, [[0x01, END, ESC]]);
    }

    #[test]
    fn ignores_noise_before_first_delimiter() {
        let frames = decode_all(&[0x55, 0xAA, END, 0x10, END, END, 0x20, END]);
        assert_eq!(frames, [[0x10], [0x20]]);
    }

    #[test]
    fn drops_invalid_escape() {
        let frames = decode_all(&[END, 0x01, ESC, 0x42, 0x02, END]);
        assert_eq!(frames, [[0x01, 0x02]]);
    }

    #[test]
    fn repeated_delimiters_yield_no_empty_frames() {
        let frames = decode_all(&[END, END, END, 0x05, END, END]);
        assert_eq!(frames, [[0x05]]);
    }

    #[test]
    fn resyncs_after_lost_delimiter() {
        // Closing delimiter of the first frame went missing
        let mut input = std::vec![END, 0x01, 0x02];
        for n in 0..3u8 {
            input.extend_from_slice(&[END, 0x30 + n, END]);
        }

        let frames = decode_all(&input);
        assert_eq!(frames, [std::vec![0x01, 0x02], std::vec![0x30], std::vec![0x31], std::vec![0x32]]);
    }
}
