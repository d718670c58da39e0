//! Double buffered frame reception.
//!
//! [`FrameBuffers`] owns two receive arenas. It is split once into a
//! [`FrameReceiver`], driven from the UART interrupt, and a [`FrameQueue`],
//! polled by the dispatcher. A completed frame is handed over through a
//! single atomic slot; the receiver then carries on filling the other arena
//! while the dispatcher works on the published one.
//!
//! A slot stays busy from publication until the dispatcher drops its
//! [`Frame`]. The receiver never writes into a busy slot: a frame that would
//! need one is discarded whole.

use core::cell::UnsafeCell;

use portable_atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crate::slip::{Decoded, Decoder};

const NONE: u8 = 0xFF;

struct Slot<const N: usize> {
    bytes: UnsafeCell<[u8; N]>,
    len: AtomicUsize,
    busy: AtomicBool,
}

impl<const N: usize> Slot<N> {
    const fn new() -> Self {
        Self {
            bytes: UnsafeCell::new([0u8; N]),
            len: AtomicUsize::new(0),
            busy: AtomicBool::new(false),
        }
    }
}

pub struct FrameBuffers<const N: usize> {
    slots: [Slot<N>; 2],
    pending: AtomicU8,
    split: AtomicBool,
}

// Slot contents are only touched by the side that currently owns the slot,
// ownership moves through `busy` and `pending` with acquire/release ordering.
unsafe impl<const N: usize> Sync for FrameBuffers<N> {}

impl<const N: usize> FrameBuffers<N> {
    pub const fn new() -> Self {
        Self {
            slots: [Slot::new(), Slot::new()],
            pending: AtomicU8::new(NONE),
            split: AtomicBool::new(false),
        }
    }

    /// Hand out the receive and dispatch halves, `None` if already split
    pub fn split(&self) -> Option<(FrameReceiver<'_, N>, FrameQueue<'_, N>)> {
        if self.split.swap(true, Ordering::AcqRel) {
            return None;
        }

        let receiver = FrameReceiver {
            buffers: self,
            active: 0,
            cursor: 0,
            decoder: Decoder::new(),
            discarding: false,
            dropped: 0,
        };

        Some((receiver, FrameQueue { buffers: self }))
    }
}

impl<const N: usize> Default for FrameBuffers<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Interrupt side: decodes bytes into the active buffer
pub struct FrameReceiver<'a, const N: usize> {
    buffers: &'a FrameBuffers<N>,
    active: usize,
    cursor: usize,
    decoder: Decoder,
    discarding: bool,
    dropped: u32,
}

impl<'a, const N: usize> FrameReceiver<'a, N> {
    /// Feed one byte from the UART. Never blocks.
    pub fn accept(&mut self, byte: u8) {
        match self.decoder.decode(byte) {
            Decoded::Nothing => (),
            Decoded::Byte(b) => {
                self.store(b);
                if self.cursor >= N {
                    // Only malformed streams get here
                    self.finish();
                }
            }
            Decoded::EndOfFrame => self.finish(),
        }
    }

    /// Frames discarded because no buffer was free
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    fn store(&mut self, b: u8) {
        if self.discarding {
            return;
        }

        if self.cursor == 0 && self.buffers.slots[self.active].busy.load(Ordering::Acquire) {
            // Dispatcher still holds the active buffer, start in the other one if free
            let other = self.active ^ 1;
            if !self.buffers.slots[other].busy.load(Ordering::Acquire) {
                self.active = other;
            }
        }

        let slot = &self.buffers.slots[self.active];
        if slot.busy.load(Ordering::Acquire) {
            self.discarding = true;
            return;
        }

        // Not busy, so the dispatcher holds no reference into this slot
        let bytes = unsafe { &mut *slot.bytes.get() };
        if let Some(v) = bytes.get_mut(self.cursor) {
            *v = b;
            self.cursor += 1;
        }
    }

    fn finish(&mut self) {
        let len = core::mem::replace(&mut self.cursor, 0);
        if len == 0 && !self.discarding {
            return;
        }
        let slot = &self.buffers.slots[self.active];

        if core::mem::replace(&mut self.discarding, false) || slot.busy.load(Ordering::Acquire) {
            self.dropped = self.dropped.wrapping_add(1);
            return;
        }

        slot.len.store(len, Ordering::Relaxed);
        slot.busy.store(true, Ordering::Relaxed);

        let published = self.buffers.pending.compare_exchange(
            NONE,
            self.active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        match published {
            Ok(_) => self.active ^= 1,
            Err(_) => {
                // Previous command still unclaimed, keep the older one
                slot.busy.store(false, Ordering::Release);
                self.dropped = self.dropped.wrapping_add(1);
            }
        }
    }
}

/// Dispatcher side: claims published frames
pub struct FrameQueue<'a, const N: usize> {
    buffers: &'a FrameBuffers<N>,
}

impl<'a, const N: usize> FrameQueue<'a, N> {
    /// Claim the pending frame, if any, re-arming the hand-off slot
    pub fn take(&mut self) -> Option<Frame<'a>> {
        let index = self.buffers.pending.swap(NONE, Ordering::AcqRel);
        let slot = self.buffers.slots.get(index as usize)?;

        let len = slot.len.load(Ordering::Relaxed);
        // Published slots are not written again until `busy` is cleared
        let bytes = unsafe { &*slot.bytes.get() };

        Some(Frame {
            bytes: &bytes[..len.min(N)],
            busy: &slot.busy,
        })
    }
}

/// A received frame, its buffer is returned to the receiver on drop
pub struct Frame<'a> {
    bytes: &'a [u8],
    busy: &'a AtomicBool,
}

impl<'a> Frame<'a> {
    pub fn bytes(&self) -> &[u8] {
        self.bytes
    }
}

impl<'a> core::ops::Deref for Frame<'a> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

impl<'a> Drop for Frame<'a> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}
