//! Provides `PrioBitmap`, a fixed-size bit set supporting constant-time
//! highest-set-bit queries.
use core::fmt;

use super::Init;

/// The number of bits a [`PrioBitmap`] can hold. This bounds the number of
/// task priority levels the kernel supports.
pub const PRIO_LEVEL_CAP: usize = 32;

/// A fixed-size bit set with a constant-time search for the *highest* set
/// bit. One bit per priority level; a single word suffices on Armv6-M.
///
/// Unlike a generic bit set, the search direction is fixed: larger bit
/// positions represent more urgent priorities and are found first.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PrioBitmap {
    bits: u32,
}

impl Init for PrioBitmap {
    const INIT: Self = Self { bits: 0 };
}

impl fmt::Debug for PrioBitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..PRIO_LEVEL_CAP).filter(|&i| self.get(i)))
            .finish()
    }
}

impl PrioBitmap {
    /// Get the bit at the specified position.
    #[inline]
    pub fn get(&self, i: usize) -> bool {
        assert!(i < PRIO_LEVEL_CAP);
        (self.bits >> i) & 1 != 0
    }

    /// Set the bit at the specified position.
    #[inline]
    pub fn set(&mut self, i: usize) {
        assert!(i < PRIO_LEVEL_CAP);
        self.bits |= 1 << i;
    }

    /// Clear the bit at the specified position.
    #[inline]
    pub fn clear(&mut self, i: usize) {
        assert!(i < PRIO_LEVEL_CAP);
        self.bits &= !(1 << i);
    }

    /// Get the position of the highest set bit.
    #[inline]
    pub fn find_highest_set(&self) -> Option<usize> {
        if self.bits == 0 {
            None
        } else {
            Some(31 - self.bits.leading_zeros() as usize)
        }
    }

    /// Return `true` iff no bit is set.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeSet;

    /// A trivially-correct reference model of `PrioBitmap`.
    struct BTreeBitmap(BTreeSet<usize>);

    impl BTreeBitmap {
        fn new() -> Self {
            Self(BTreeSet::new())
        }

        fn enum_set_bits(&self) -> Vec<usize> {
            self.0.iter().cloned().collect()
        }

        fn set(&mut self, i: usize) {
            self.0.insert(i);
        }

        fn clear(&mut self, i: usize) {
            self.0.remove(&i);
        }

        fn find_highest_set(&self) -> Option<usize> {
            self.0.iter().next_back().cloned()
        }
    }

    /// A modifying operation on `PrioBitmap`.
    #[derive(Debug)]
    enum Cmd {
        Insert(usize),
        Remove(usize),
    }

    /// Map random bytes to operations on `PrioBitmap`.
    fn interpret(bytecode: &[u8]) -> impl Iterator<Item = Cmd> + '_ {
        let mut i = 0;
        let mut known_set_bits = Vec::new();
        std::iter::from_fn(move || {
            if let Some(instr) = bytecode.get(i..i + 2) {
                i += 2;

                let value = instr[1] as usize;

                if instr[0] % 2 == 0 || known_set_bits.is_empty() {
                    let bit = value % PRIO_LEVEL_CAP;
                    known_set_bits.push(bit);
                    Some(Cmd::Insert(bit))
                } else {
                    let j = value % known_set_bits.len();
                    let bit = known_set_bits.swap_remove(j);
                    Some(Cmd::Remove(bit))
                }
            } else {
                None
            }
        })
    }

    fn enum_set_bits(bitmap: &PrioBitmap) -> Vec<usize> {
        (0..PRIO_LEVEL_CAP).filter(|&i| bitmap.get(i)).collect()
    }

    #[quickcheck]
    fn matches_reference_model(bytecode: Vec<u8>) {
        let mut subject = PrioBitmap::INIT;
        let mut reference = BTreeBitmap::new();

        for cmd in interpret(&bytecode) {
            log::trace!("    {cmd:?}");
            match cmd {
                Cmd::Insert(bit) => {
                    subject.set(bit);
                    reference.set(bit);
                }
                Cmd::Remove(bit) => {
                    subject.clear(bit);
                    reference.clear(bit);
                }
            }

            assert_eq!(subject.find_highest_set(), reference.find_highest_set());
            assert_eq!(subject.is_empty(), reference.enum_set_bits().is_empty());
        }

        assert_eq!(enum_set_bits(&subject), reference.enum_set_bits());
    }

    #[test]
    fn empty() {
        assert_eq!(PrioBitmap::INIT.find_highest_set(), None);
        assert!(PrioBitmap::INIT.is_empty());
    }

    #[test]
    fn single_extremes() {
        let mut b = PrioBitmap::INIT;
        b.set(0);
        assert_eq!(b.find_highest_set(), Some(0));
        b.set(31);
        assert_eq!(b.find_highest_set(), Some(31));
        b.clear(31);
        assert_eq!(b.find_highest_set(), Some(0));
    }
}
