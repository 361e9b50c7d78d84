//! In-memory mirror of an expander's per-pin configuration registers.
//!
//! Mutations touch only the shadow; the owning engine decides when to push a
//! byte through the bus (one flush per register, not per bit). After a flush
//! the shadow equals the hardware value, and nothing here ever reads the
//! hardware back.

/// Register groups tracked per bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShadowReg {
    Direction,
    PullUp,
    IntEnable,
    DefaultValue,
    IntCompare,
    OutputLatch,
}

#[derive(Debug, Default, Clone, Copy)]
struct ShadowBank {
    direction: u8,
    pull_up: u8,
    int_enable: u8,
    default_value: u8,
    int_compare: u8,
    output_latch: u8,
}

/// Shadow state for a two-bank expander. The all-clear default matches the
/// register values the engine writes during initialization.
#[derive(Debug, Default)]
pub(crate) struct ShadowStore {
    banks: [ShadowBank; 2],
}

impl ShadowStore {
    pub fn set_bit(&mut self, reg: ShadowReg, bank: usize, bit: u8) {
        *self.byte_mut(reg, bank) |= 1 << bit;
    }

    pub fn clear_bit(&mut self, reg: ShadowReg, bank: usize, bit: u8) {
        *self.byte_mut(reg, bank) &= !(1 << bit);
    }

    pub fn is_bit_set(&self, reg: ShadowReg, bank: usize, bit: u8) -> bool {
        self.value(reg, bank) & (1 << bit) != 0
    }

    /// Current shadow byte for one (register, bank) pair.
    pub fn value(&self, reg: ShadowReg, bank: usize) -> u8 {
        let b = &self.banks[bank];
        match reg {
            ShadowReg::Direction => b.direction,
            ShadowReg::PullUp => b.pull_up,
            ShadowReg::IntEnable => b.int_enable,
            ShadowReg::DefaultValue => b.default_value,
            ShadowReg::IntCompare => b.int_compare,
            ShadowReg::OutputLatch => b.output_latch,
        }
    }

    /// Replace a whole shadow byte, for registers written byte-at-a-time.
    pub fn set_value(&mut self, reg: ShadowReg, bank: usize, value: u8) {
        *self.byte_mut(reg, bank) = value;
    }

    fn byte_mut(&mut self, reg: ShadowReg, bank: usize) -> &mut u8 {
        let b = &mut self.banks[bank];
        match reg {
            ShadowReg::Direction => &mut b.direction,
            ShadowReg::PullUp => &mut b.pull_up,
            ShadowReg::IntEnable => &mut b.int_enable,
            ShadowReg::DefaultValue => &mut b.default_value,
            ShadowReg::IntCompare => &mut b.int_compare,
            ShadowReg::OutputLatch => &mut b.output_latch,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_all_clear() {
        let shadow = ShadowStore::default();
        for reg in [
            ShadowReg::Direction,
            ShadowReg::PullUp,
            ShadowReg::IntEnable,
            ShadowReg::DefaultValue,
            ShadowReg::IntCompare,
            ShadowReg::OutputLatch,
        ] {
            assert_eq!(shadow.value(reg, 0), 0x00);
            assert_eq!(shadow.value(reg, 1), 0x00);
        }
    }

    #[test]
    fn bit_sequences_match_direct_byte_manipulation() {
        // The shadow byte after a sequence of set/clear operations must equal
        // the byte produced by applying the same sequence to a plain value.
        let ops: &[(ShadowReg, u8, bool)] = &[
            (ShadowReg::Direction, 3, true),
            (ShadowReg::PullUp, 3, true),
            (ShadowReg::IntEnable, 3, true),
            (ShadowReg::Direction, 5, true),
            (ShadowReg::Direction, 3, false),
            (ShadowReg::IntEnable, 3, false),
            (ShadowReg::Direction, 3, true),
            (ShadowReg::PullUp, 3, false),
        ];

        let mut shadow = ShadowStore::default();
        let mut direction = 0u8;
        let mut pull_up = 0u8;
        let mut int_enable = 0u8;
        for &(reg, bit, set) in ops {
            if set {
                shadow.set_bit(reg, 0, bit);
            } else {
                shadow.clear_bit(reg, 0, bit);
            }
            let byte = match reg {
                ShadowReg::Direction => &mut direction,
                ShadowReg::PullUp => &mut pull_up,
                ShadowReg::IntEnable => &mut int_enable,
                _ => unreachable!(),
            };
            if set {
                *byte |= 1 << bit;
            } else {
                *byte &= !(1 << bit);
            }
        }

        assert_eq!(shadow.value(ShadowReg::Direction, 0), direction);
        assert_eq!(shadow.value(ShadowReg::PullUp, 0), pull_up);
        assert_eq!(shadow.value(ShadowReg::IntEnable, 0), int_enable);
        // Bank 1 stays untouched throughout.
        assert_eq!(shadow.value(ShadowReg::Direction, 1), 0x00);
    }

    #[test]
    fn banks_are_independent() {
        let mut shadow = ShadowStore::default();
        shadow.set_bit(ShadowReg::Direction, 0, 7);
        shadow.set_value(ShadowReg::OutputLatch, 1, 0xa5);

        assert_eq!(shadow.value(ShadowReg::Direction, 0), 0x80);
        assert_eq!(shadow.value(ShadowReg::Direction, 1), 0x00);
        assert_eq!(shadow.value(ShadowReg::OutputLatch, 1), 0xa5);
        assert!(shadow.is_bit_set(ShadowReg::OutputLatch, 1, 0));
        assert!(!shadow.is_bit_set(ShadowReg::OutputLatch, 0, 0));
    }
}
