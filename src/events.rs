//! Event-flag store and wake-up masks.
//!
//! Flags live in one program-wide bit set guarded by the program lock.
//! Each state declares a mask of flag ids and channel event numbers; a
//! wake-up on a bit reaches every state set whose current state has that
//! bit in its mask.

use core::fmt;

use bittle::{Bits, BitsMut};
use tracing::debug;

use crate::table::EvId;
use crate::state_set::StateSet;

/// A bit set over event numbers and flag ids.
#[derive(Clone, Default)]
pub struct Mask {
    words: Vec<u32>,
}

impl Mask {
    /// A mask able to hold bit numbers `0..=max_bit`.
    pub fn new(max_bit: u32) -> Self {
        Self {
            words: vec![0; 1 + max_bit as usize / 32],
        }
    }

    /// A mask over `0..=max_bit` with the given bits set.
    pub fn with_bits(max_bit: u32, bits: impl IntoIterator<Item = u32>) -> Self {
        let mut mask = Self::new(max_bit);

        for bit in bits {
            mask.set(bit);
        }

        mask
    }

    /// Highest bit number the mask can hold.
    pub fn max_bit(&self) -> u32 {
        (self.words.len() * 32) as u32 - 1
    }

    /// Set a bit.
    pub fn set(&mut self, bit: u32) {
        self.words.as_mut_slice().set_bit(bit);
    }

    /// Clear a bit.
    pub fn clear(&mut self, bit: u32) {
        self.words.as_mut_slice().clear_bit(bit);
    }

    /// Whether a bit is set. Out-of-range bits read as clear.
    pub fn test(&self, bit: u32) -> bool {
        bit <= self.max_bit() && self.words.as_slice().test_bit(bit)
    }
}

impl fmt::Debug for Mask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.words.as_slice().iter_ones())
            .finish()
    }
}

impl StateSet {
    /// Set an event flag, waking every state set whose current state
    /// waits on it.
    pub fn ef_set(&self, ev: EvId) {
        let prog = self.program().clone();
        prog.assert_ev_flag(ev);

        debug!(ss = self.index(), ev = %ev, "efSet");

        {
            let mut lk = prog.locked();
            lk.ev_flags.set(ev.get());
        }

        prog.wakeup(ev.get());
    }

    /// Return whether an event flag is set.
    ///
    /// In safe mode this is an observation point: variables synced to the
    /// flag whose shared buffer is newer than this state set's shadow are
    /// copied in before returning.
    pub fn ef_test(&mut self, ev: EvId) -> bool {
        let prog = self.program().clone();
        prog.assert_ev_flag(ev);

        let mut lk = prog.locked();
        let is_set = lk.ev_flags.test(ev.get());

        debug!(ss = self.index(), ev = %ev, is_set, "efTest");

        if prog.is_safe() {
            self.read_selective(&mut lk, ev);
        }

        is_set
    }

    /// Clear an event flag, returning its previous value and waking every
    /// state set whose current state waits on it.
    pub fn ef_clear(&self, ev: EvId) -> bool {
        let prog = self.program().clone();
        prog.assert_ev_flag(ev);

        let was_set = {
            let mut lk = prog.locked();
            let was_set = lk.ev_flags.test(ev.get());
            lk.ev_flags.clear(ev.get());
            was_set
        };

        prog.wakeup(ev.get());
        was_set
    }

    /// Atomically test and clear an event flag, returning whether it was
    /// set. Preserves the safe-mode selective read of [`ef_test`].
    ///
    /// [`ef_test`]: StateSet::ef_test
    pub fn ef_test_and_clear(&mut self, ev: EvId) -> bool {
        let prog = self.program().clone();
        prog.assert_ev_flag(ev);

        let mut lk = prog.locked();
        let was_set = lk.ev_flags.test(ev.get());
        lk.ev_flags.clear(ev.get());

        debug!(ss = self.index(), ev = %ev, was_set, "efTestAndClear");

        if prog.is_safe() {
            self.read_selective(&mut lk, ev);
        }

        was_set
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear_roundtrip() {
        let mut mask = Mask::new(70);

        assert!(!mask.test(1));
        mask.set(1);
        mask.set(70);
        assert!(mask.test(1));
        assert!(mask.test(70));

        mask.clear(1);
        assert!(!mask.test(1));
        assert!(mask.test(70));
    }

    #[test]
    fn test_out_of_range_reads_clear() {
        let mask = Mask::new(1);
        assert!(!mask.test(1000));
    }

    #[test]
    fn test_with_bits() {
        let mask = Mask::with_bits(10, [2, 5]);
        assert!(mask.test(2));
        assert!(mask.test(5));
        assert!(!mask.test(3));
    }
}
