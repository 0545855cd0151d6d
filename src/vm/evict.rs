//! Victim selection and the swap contract.
//!
//! The frame table asks a [`VictimSelector`] for a candidate whenever the
//! physical pool is exhausted. Selectors only look at frames through
//! [`Frame::probe`] and [`Frame::clear_accessed`], which never block, so
//! they can run under the frame-table lock.

use alloc::sync::Arc;

use super::frame_table::Frame;

/// A page-sized slot on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(u64);

impl SwapSlot {
    pub const fn new(index: u64) -> Self {
        SwapSlot(index)
    }

    pub const fn index(self) -> u64 {
        self.0
    }
}

/// Backing store for evicted private and anonymous pages.
pub trait SwapDevice: Send + Sync {
    /// Reserve a free slot, or `None` if the device is full.
    fn reserve(&self) -> Option<SwapSlot>;
    /// Write one page into a reserved slot.
    fn write(&self, slot: SwapSlot, page: &[u8]);
    /// Read one page back from a slot.
    fn read(&self, slot: SwapSlot, page: &mut [u8]);
    /// Return a slot to the free pool.
    fn release(&self, slot: SwapSlot);
}

/// What a selector sees when it looks at a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Busy, pinned, unmapped or otherwise not a candidate right now.
    Unevictable,
    /// A mapping touched the page since its accessed bits were cleared.
    Referenced,
    /// Candidate.
    Idle,
}

/// Replacement policy.
pub trait VictimSelector: Send {
    /// Index into `frames` of the frame to evict, or `None` if nothing
    /// qualifies. `can_swap` is false when private pages cannot be saved.
    fn select(&mut self, frames: &[Arc<Frame>], can_swap: bool) -> Option<usize>;

    /// The frame at `index` left the table.
    fn removed(&mut self, _index: usize) {}

    fn name(&self) -> &'static str;
}

/// Second-chance clock over the accessed bits of every mapping of a frame.
#[derive(Debug, Default)]
pub struct Clock {
    hand: usize,
}

impl Clock {
    pub fn new() -> Self {
        Clock { hand: 0 }
    }
}

impl VictimSelector for Clock {
    fn select(&mut self, frames: &[Arc<Frame>], can_swap: bool) -> Option<usize> {
        if frames.is_empty() {
            return None;
        }

        // Two sweeps: the first may only clear accessed bits.
        for _ in 0..frames.len() * 2 {
            let index = self.hand % frames.len();
            self.hand = index + 1;
            match frames[index].probe(can_swap) {
                Probe::Idle => return Some(index),
                Probe::Referenced => frames[index].clear_accessed(),
                Probe::Unevictable => {}
            }
        }
        None
    }

    fn removed(&mut self, index: usize) {
        if index < self.hand {
            self.hand -= 1;
        }
    }

    fn name(&self) -> &'static str {
        "clock"
    }
}

/// Oldest evictable frame first, ignoring accessed bits.
#[derive(Debug, Default)]
pub struct Fifo;

impl VictimSelector for Fifo {
    fn select(&mut self, frames: &[Arc<Frame>], can_swap: bool) -> Option<usize> {
        frames
            .iter()
            .position(|frame| frame.probe(can_swap) != Probe::Unevictable)
    }

    fn name(&self) -> &'static str {
        "fifo"
    }
}
