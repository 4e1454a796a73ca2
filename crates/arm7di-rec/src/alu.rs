//! ALU and barrel-shifter primitives shared by the interpreter and the
//! recompiled-op helpers, so both strategies compute results and flags
//! from exactly the same code.

use crate::ArmPsr;

pub const SHIFT_LSL: u32 = 0;
pub const SHIFT_LSR: u32 = 1;
pub const SHIFT_ASR: u32 = 2;
pub const SHIFT_ROR: u32 = 3;

/// Condition code numbering as encoded in bits 31..28.
pub const CC_EQ: u32 = 0x0;
pub const CC_NE: u32 = 0x1;
pub const CC_CS: u32 = 0x2;
pub const CC_CC: u32 = 0x3;
pub const CC_MI: u32 = 0x4;
pub const CC_PL: u32 = 0x5;
pub const CC_VS: u32 = 0x6;
pub const CC_VC: u32 = 0x7;
pub const CC_HI: u32 = 0x8;
pub const CC_LS: u32 = 0x9;
pub const CC_GE: u32 = 0xA;
pub const CC_LT: u32 = 0xB;
pub const CC_GT: u32 = 0xC;
pub const CC_LE: u32 = 0xD;
pub const CC_AL: u32 = 0xE;
pub const CC_NV: u32 = 0xF;

#[inline]
pub fn add_with_carry(a: u32, b: u32, carry_in: bool) -> (u32, bool, bool) {
    let sum = a as u64 + b as u64 + carry_in as u64;
    let result = sum as u32;
    let carry = (sum >> 32) != 0;
    let overflow = ((a ^ result) & (b ^ result)) >> 31 != 0;
    (result, carry, overflow)
}

#[inline]
pub fn sub_with_carry(a: u32, b: u32, carry_in: bool) -> (u32, bool, bool) {
    add_with_carry(a, !b, carry_in)
}

/// Shift by an immediate amount, using the instruction-field encoding:
/// a zero amount means LSL #0 (pass-through), LSR #32, ASR #32 or RRX
/// depending on the shift type.
#[inline]
pub fn shift_imm(value: u32, ty: u32, amount: u32, carry_in: bool) -> (u32, bool) {
    match ty {
        SHIFT_LSL => {
            if amount == 0 {
                (value, carry_in)
            } else {
                (value << amount, (value >> (32 - amount)) & 1 != 0)
            }
        }
        SHIFT_LSR => {
            if amount == 0 {
                (0, value >> 31 != 0)
            } else {
                (value >> amount, (value >> (amount - 1)) & 1 != 0)
            }
        }
        SHIFT_ASR => {
            if amount == 0 {
                let sign = value >> 31 != 0;
                (if sign { 0xFFFF_FFFF } else { 0 }, sign)
            } else {
                (
                    ((value as i32) >> amount) as u32,
                    (value >> (amount - 1)) & 1 != 0,
                )
            }
        }
        SHIFT_ROR => {
            if amount == 0 {
                // RRX: carry shifts into bit 31, bit 0 shifts out into carry.
                (
                    ((carry_in as u32) << 31) | (value >> 1),
                    value & 1 != 0,
                )
            } else {
                let result = value.rotate_right(amount);
                (result, result >> 31 != 0)
            }
        }
        _ => (value, carry_in),
    }
}

/// Shift by a register-specified amount (low byte of the shift register).
/// Amounts of 32 and above have their own architectural results.
#[inline]
pub fn shift_reg(value: u32, ty: u32, amount: u32, carry_in: bool) -> (u32, bool) {
    if amount == 0 {
        return (value, carry_in);
    }
    match ty {
        SHIFT_LSL => {
            if amount < 32 {
                (value << amount, (value >> (32 - amount)) & 1 != 0)
            } else if amount == 32 {
                (0, value & 1 != 0)
            } else {
                (0, false)
            }
        }
        SHIFT_LSR => {
            if amount < 32 {
                (value >> amount, (value >> (amount - 1)) & 1 != 0)
            } else if amount == 32 {
                (0, value >> 31 != 0)
            } else {
                (0, false)
            }
        }
        SHIFT_ASR => {
            if amount < 32 {
                (
                    ((value as i32) >> amount) as u32,
                    (value >> (amount - 1)) & 1 != 0,
                )
            } else {
                let sign = value >> 31 != 0;
                (if sign { 0xFFFF_FFFF } else { 0 }, sign)
            }
        }
        SHIFT_ROR => {
            let rot = amount & 31;
            let result = if rot == 0 { value } else { value.rotate_right(rot) };
            (result, result >> 31 != 0)
        }
        _ => (value, carry_in),
    }
}

/// Evaluate a condition code against the status flags. NV is treated as
/// always, matching the cores this emulates.
#[inline]
pub fn condition_passed(cc: u32, psr: ArmPsr) -> bool {
    match cc {
        CC_EQ => psr.z(),
        CC_NE => !psr.z(),
        CC_CS => psr.c(),
        CC_CC => !psr.c(),
        CC_MI => psr.n(),
        CC_PL => !psr.n(),
        CC_VS => psr.v(),
        CC_VC => !psr.v(),
        CC_HI => psr.c() && !psr.z(),
        CC_LS => !psr.c() || psr.z(),
        CC_GE => psr.n() == psr.v(),
        CC_LT => psr.n() != psr.v(),
        CC_GT => !psr.z() && psr.n() == psr.v(),
        CC_LE => psr.z() || psr.n() != psr.v(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_carry_overflow() {
        assert_eq!(add_with_carry(1, 2, false), (3, false, false));
        assert_eq!(add_with_carry(0xFFFF_FFFF, 1, false), (0, true, false));
        assert_eq!(
            add_with_carry(0x7FFF_FFFF, 1, false),
            (0x8000_0000, false, true)
        );
        // SUB is ADD with inverted operand and carry-in set.
        assert_eq!(sub_with_carry(5, 5, true), (0, true, false));
        assert_eq!(sub_with_carry(0, 1, true), (0xFFFF_FFFF, false, false));
    }

    #[test]
    fn shift_imm_degenerate_encodings() {
        // LSR #0 encodes LSR #32.
        assert_eq!(shift_imm(0x8000_0001, SHIFT_LSR, 0, false), (0, true));
        // ASR #0 encodes ASR #32.
        assert_eq!(
            shift_imm(0x8000_0000, SHIFT_ASR, 0, false),
            (0xFFFF_FFFF, true)
        );
        assert_eq!(shift_imm(0x4000_0000, SHIFT_ASR, 0, true), (0, false));
        // ROR #0 encodes RRX.
        assert_eq!(shift_imm(3, SHIFT_ROR, 0, true), (0x8000_0001, true));
        assert_eq!(shift_imm(2, SHIFT_ROR, 0, false), (1, false));
    }

    #[test]
    fn shift_reg_large_amounts() {
        assert_eq!(shift_reg(0x8000_0001, SHIFT_LSL, 32, false), (0, true));
        assert_eq!(shift_reg(0x8000_0001, SHIFT_LSL, 33, true), (0, false));
        assert_eq!(shift_reg(0x8000_0001, SHIFT_LSR, 32, false), (0, true));
        assert_eq!(shift_reg(1, SHIFT_LSR, 40, true), (0, false));
        assert_eq!(
            shift_reg(0x8000_0000, SHIFT_ASR, 100, false),
            (0xFFFF_FFFF, true)
        );
        // ROR by a multiple of 32 leaves the value, carry is bit 31.
        assert_eq!(
            shift_reg(0x8000_0000, SHIFT_ROR, 32, false),
            (0x8000_0000, true)
        );
        // Amount 0 leaves value and carry alone.
        assert_eq!(shift_reg(7, SHIFT_ROR, 0, true), (7, true));
    }

    #[test]
    fn conditions() {
        let mut psr = ArmPsr(0);
        psr.set_z(true);
        assert!(condition_passed(CC_EQ, psr));
        assert!(!condition_passed(CC_NE, psr));
        psr.set_z(false);
        psr.set_c(true);
        assert!(condition_passed(CC_HI, psr));
        psr.set_z(true);
        assert!(!condition_passed(CC_HI, psr));
        assert!(condition_passed(CC_LS, psr));
        let mut psr = ArmPsr(0);
        psr.set_n(true);
        psr.set_v(true);
        assert!(condition_passed(CC_GE, psr));
        assert!(condition_passed(CC_GT, psr));
        psr.set_v(false);
        assert!(condition_passed(CC_LT, psr));
        assert!(condition_passed(CC_LE, psr));
        assert!(condition_passed(CC_AL, psr));
        assert!(condition_passed(CC_NV, psr));
    }
}
