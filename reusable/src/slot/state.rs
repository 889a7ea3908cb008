//! The packed state word of a [`CompletionSlot`](super::CompletionSlot).
//!
//! ```ascii
//!  63                                   8   7   6   5   4   3   2..0
//! +--------------------------------------+---+---+---+---+---+-------+
//! |              generation              | C | F | T | V | L | phase |
//! +--------------------------------------+---+---+---+---+---+-------+
//! ```
//!
//! * `phase`: progress of the continuation registration, see [`Phase`].
//! * `L` (`CLAIMED`): a producer owns the payload cell.
//! * `V` (`HAS_VALUE`): the payload is published.
//! * `T` (`TAKEN`): the consumer took the payload; the slot is about to be reset.
//! * `F` (`FORCE_ASYNC`) and `C` (`CACHEABLE`) survive resets.

pub(super) const CLAIMED: u64 = 1 << 3;
pub(super) const HAS_VALUE: u64 = 1 << 4;
pub(super) const TAKEN: u64 = 1 << 5;
pub(super) const FORCE_ASYNC: u64 = 1 << 6;
pub(super) const CACHEABLE: u64 = 1 << 7;

const PHASE_MASK: u64 = 0b111;
const RETAINED: u64 = FORCE_ASYNC | CACHEABLE;
const GENERATION_SHIFT: u32 = 8;
const GENERATION_MASK: u64 = u64::MAX >> GENERATION_SHIFT;

/// Where the continuation of the current generation is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Phase {
    /// Nothing registered.
    Empty,
    /// A registrant owns the continuation cell and is writing to it.
    Registering,
    /// A continuation is stored and waits for the payload.
    Registered,
    /// The producer owns the continuation cell and is taking the continuation out.
    Firing,
    /// The continuation has been handed to the dispatcher.
    Fired,
}

impl Phase {
    fn bits(self) -> u64 {
        match self {
            Phase::Empty => 0,
            Phase::Registering => 1,
            Phase::Registered => 2,
            Phase::Firing => 3,
            Phase::Fired => 4,
        }
    }

    fn from_bits(bits: u64) -> Phase {
        match bits & PHASE_MASK {
            0 => Phase::Empty,
            1 => Phase::Registering,
            2 => Phase::Registered,
            3 => Phase::Firing,
            4 => Phase::Fired,
            other => unreachable!("corrupt continuation phase {}", other),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(super) struct Word(pub(super) u64);

impl Word {
    pub(super) fn new(cacheable: bool, force_async: bool) -> Word {
        let mut bits = 0;
        if cacheable {
            bits |= CACHEABLE;
        }
        if force_async {
            bits |= FORCE_ASYNC;
        }
        Word(bits)
    }

    #[inline]
    pub(super) fn generation(self) -> u64 {
        self.0 >> GENERATION_SHIFT
    }

    #[inline]
    pub(super) fn phase(self) -> Phase {
        Phase::from_bits(self.0)
    }

    #[inline]
    pub(super) fn with_phase(self, phase: Phase) -> Word {
        Word((self.0 & !PHASE_MASK) | phase.bits())
    }

    #[inline]
    pub(super) fn has(self, flag: u64) -> bool {
        self.0 & flag == flag
    }

    #[inline]
    pub(super) fn with(self, flag: u64) -> Word {
        Word(self.0 | flag)
    }

    /// The word of the next reuse cycle: generation bumped, retained flags kept, everything
    /// else cleared.
    pub(super) fn next_generation(self) -> Word {
        let generation = self.generation().wrapping_add(1) & GENERATION_MASK;
        Word((generation << GENERATION_SHIFT) | (self.0 & RETAINED))
    }
}

impl std::fmt::Debug for Word {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Word")
            .field("generation", &self.generation())
            .field("phase", &self.phase())
            .field("claimed", &self.has(CLAIMED))
            .field("has_value", &self.has(HAS_VALUE))
            .field("taken", &self.has(TAKEN))
            .field("force_async", &self.has(FORCE_ASYNC))
            .field("cacheable", &self.has(CACHEABLE))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_generation_retains_flags() {
        let word = Word::new(true, true)
            .with(CLAIMED)
            .with(HAS_VALUE)
            .with(TAKEN)
            .with_phase(Phase::Fired);
        let next = word.next_generation();
        assert_eq!(next.generation(), 1);
        assert_eq!(next.phase(), Phase::Empty);
        assert!(next.has(CACHEABLE));
        assert!(next.has(FORCE_ASYNC));
        assert!(!next.has(CLAIMED));
        assert!(!next.has(HAS_VALUE));
        assert!(!next.has(TAKEN));
    }

    #[test]
    fn test_generation_wraps_inside_its_bits() {
        let word = Word((GENERATION_MASK << GENERATION_SHIFT) | CACHEABLE);
        let next = word.next_generation();
        assert_eq!(next.generation(), 0);
        assert!(next.has(CACHEABLE));
    }

    #[test]
    fn test_phase_does_not_touch_flags() {
        let word = Word::new(false, true).with(CLAIMED);
        for phase in &[
            Phase::Empty,
            Phase::Registering,
            Phase::Registered,
            Phase::Firing,
            Phase::Fired,
        ] {
            let updated = word.with_phase(*phase);
            assert_eq!(updated.phase(), *phase);
            assert!(updated.has(CLAIMED));
            assert!(updated.has(FORCE_ASYNC));
            assert_eq!(updated.generation(), 0);
        }
    }
}
