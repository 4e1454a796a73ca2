//! Semantic helpers behind the compiled-block records. Every function
//! here is the body of exactly one record handler: raw pointers into the
//! CPU context come in, the architectural effect happens, nothing is
//! returned. Flag math is shared with the interpreter through [`alu`].
//!
//! Pointer arguments are captured at compile time and point at fields of
//! the (heap-pinned) `Arm7Context`.

use crate::alu::{self, add_with_carry, sub_with_carry};
use crate::{Arm7Context, ArmPsr, interp};

#[inline(always)]
fn flags_at(flags: *mut u32) -> ArmPsr {
    unsafe { ArmPsr(*flags) }
}

#[inline(always)]
fn set_nz(psr: &mut ArmPsr, result: u32) {
    psr.set_n(result >> 31 != 0);
    psr.set_z(result == 0);
}

#[inline(always)]
fn write_logic_flags(flags: *mut u32, result: u32, carry: *const u32) {
    unsafe {
        let mut psr = ArmPsr(*flags);
        set_nz(&mut psr, result);
        psr.set_c(*carry != 0);
        *flags = psr.raw();
    }
}

#[inline(always)]
fn write_arith_flags(flags: *mut u32, result: u32, c: bool, v: bool) {
    unsafe {
        let mut psr = ArmPsr(*flags);
        set_nz(&mut psr, result);
        psr.set_c(c);
        psr.set_v(v);
        *flags = psr.raw();
    }
}

/* ------------------------- moves and shifts ------------------------- */

#[inline(always)]
pub fn arm_mov32(dst: *mut u32, src: *const u32) {
    unsafe { *dst = *src }
}

#[inline(always)]
pub fn arm_mov32i(dst: *mut u32, imm: u32) {
    unsafe { *dst = imm }
}

/// Branch-to-register target store: force word alignment.
#[inline(always)]
pub fn arm_store_pc(dst: *mut u32, src: *const u32) {
    unsafe { *dst = *src & !3 }
}

/// Seed the shifter-carry latch with the current C flag, for flag-setting
/// logical ops whose operand produced no carry of its own.
#[inline(always)]
pub fn arm_carry_in(cout: *mut u32, flags: *const u32) {
    unsafe { *cout = ArmPsr(*flags).c() as u32 }
}

#[inline(always)]
pub fn arm_addi(dst: *mut u32, src: *const u32, imm: u32) {
    unsafe { *dst = (*src).wrapping_add(imm) }
}

#[inline(always)]
pub fn arm_subi(dst: *mut u32, src: *const u32, imm: u32) {
    unsafe { *dst = (*src).wrapping_sub(imm) }
}

/// Barrel shift by the immediate-field encoding; `ty_amt` packs the shift
/// type in bits 8.. and the raw amount below.
#[inline(always)]
pub fn arm_shift_imm(dst: *mut u32, src: *const u32, ty_amt: u32, flags: *const u32) {
    unsafe {
        let carry_in = ArmPsr(*flags).c();
        let (result, _) = alu::shift_imm(*src, ty_amt >> 8, ty_amt & 0xFF, carry_in);
        *dst = result;
    }
}

#[inline(always)]
pub fn arm_shift_imm_c(dst: *mut u32, src: *const u32, ty_amt: u32, flags: *const u32, cout: *mut u32) {
    unsafe {
        let carry_in = ArmPsr(*flags).c();
        let (result, carry) = alu::shift_imm(*src, ty_amt >> 8, ty_amt & 0xFF, carry_in);
        *dst = result;
        *cout = carry as u32;
    }
}

#[inline(always)]
pub fn arm_shift_reg(dst: *mut u32, src: *const u32, amt: *const u32, ty: u32, flags: *const u32) {
    unsafe {
        let carry_in = ArmPsr(*flags).c();
        let (result, _) = alu::shift_reg(*src, ty, *amt & 0xFF, carry_in);
        *dst = result;
    }
}

#[inline(always)]
pub fn arm_shift_reg_c(
    dst: *mut u32,
    src: *const u32,
    amt: *const u32,
    ty: u32,
    flags: *const u32,
    cout: *mut u32,
) {
    unsafe {
        let carry_in = ArmPsr(*flags).c();
        let (result, carry) = alu::shift_reg(*src, ty, *amt & 0xFF, carry_in);
        *dst = result;
        *cout = carry as u32;
    }
}

/* ------------------------- data processing ------------------------- */

#[inline(always)]
pub fn arm_and(dst: *mut u32, a: *const u32, b: *const u32) {
    unsafe { *dst = *a & *b }
}

#[inline(always)]
pub fn arm_eor(dst: *mut u32, a: *const u32, b: *const u32) {
    unsafe { *dst = *a ^ *b }
}

#[inline(always)]
pub fn arm_orr(dst: *mut u32, a: *const u32, b: *const u32) {
    unsafe { *dst = *a | *b }
}

#[inline(always)]
pub fn arm_bic(dst: *mut u32, a: *const u32, b: *const u32) {
    unsafe { *dst = *a & !*b }
}

#[inline(always)]
pub fn arm_add(dst: *mut u32, a: *const u32, b: *const u32) {
    unsafe { *dst = (*a).wrapping_add(*b) }
}

#[inline(always)]
pub fn arm_sub(dst: *mut u32, a: *const u32, b: *const u32) {
    unsafe { *dst = (*a).wrapping_sub(*b) }
}

#[inline(always)]
pub fn arm_adc(dst: *mut u32, a: *const u32, b: *const u32, flags: *const u32) {
    unsafe {
        let carry = ArmPsr(*flags).c();
        *dst = add_with_carry(*a, *b, carry).0;
    }
}

#[inline(always)]
pub fn arm_sbc(dst: *mut u32, a: *const u32, b: *const u32, flags: *const u32) {
    unsafe {
        let carry = ArmPsr(*flags).c();
        *dst = sub_with_carry(*a, *b, carry).0;
    }
}

#[inline(always)]
pub fn arm_mvn(dst: *mut u32, src: *const u32) {
    unsafe { *dst = !*src }
}

#[inline(always)]
pub fn arm_ands(dst: *mut u32, a: *const u32, b: *const u32, flags: *mut u32, cout: *const u32) {
    unsafe {
        let result = *a & *b;
        *dst = result;
        write_logic_flags(flags, result, cout);
    }
}

#[inline(always)]
pub fn arm_eors(dst: *mut u32, a: *const u32, b: *const u32, flags: *mut u32, cout: *const u32) {
    unsafe {
        let result = *a ^ *b;
        *dst = result;
        write_logic_flags(flags, result, cout);
    }
}

#[inline(always)]
pub fn arm_orrs(dst: *mut u32, a: *const u32, b: *const u32, flags: *mut u32, cout: *const u32) {
    unsafe {
        let result = *a | *b;
        *dst = result;
        write_logic_flags(flags, result, cout);
    }
}

#[inline(always)]
pub fn arm_bics(dst: *mut u32, a: *const u32, b: *const u32, flags: *mut u32, cout: *const u32) {
    unsafe {
        let result = *a & !*b;
        *dst = result;
        write_logic_flags(flags, result, cout);
    }
}

#[inline(always)]
pub fn arm_movs(dst: *mut u32, src: *const u32, flags: *mut u32, cout: *const u32) {
    unsafe {
        let result = *src;
        *dst = result;
        write_logic_flags(flags, result, cout);
    }
}

#[inline(always)]
pub fn arm_mvns(dst: *mut u32, src: *const u32, flags: *mut u32, cout: *const u32) {
    unsafe {
        let result = !*src;
        *dst = result;
        write_logic_flags(flags, result, cout);
    }
}

#[inline(always)]
pub fn arm_tsts(a: *const u32, b: *const u32, flags: *mut u32, cout: *const u32) {
    unsafe { write_logic_flags(flags, *a & *b, cout) }
}

#[inline(always)]
pub fn arm_teqs(a: *const u32, b: *const u32, flags: *mut u32, cout: *const u32) {
    unsafe { write_logic_flags(flags, *a ^ *b, cout) }
}

#[inline(always)]
pub fn arm_adds(dst: *mut u32, a: *const u32, b: *const u32, flags: *mut u32) {
    unsafe {
        let (result, c, v) = add_with_carry(*a, *b, false);
        *dst = result;
        write_arith_flags(flags, result, c, v);
    }
}

#[inline(always)]
pub fn arm_subs(dst: *mut u32, a: *const u32, b: *const u32, flags: *mut u32) {
    unsafe {
        let (result, c, v) = sub_with_carry(*a, *b, true);
        *dst = result;
        write_arith_flags(flags, result, c, v);
    }
}

#[inline(always)]
pub fn arm_adcs(dst: *mut u32, a: *const u32, b: *const u32, flags: *mut u32) {
    unsafe {
        let carry = flags_at(flags).c();
        let (result, c, v) = add_with_carry(*a, *b, carry);
        *dst = result;
        write_arith_flags(flags, result, c, v);
    }
}

#[inline(always)]
pub fn arm_sbcs(dst: *mut u32, a: *const u32, b: *const u32, flags: *mut u32) {
    unsafe {
        let carry = flags_at(flags).c();
        let (result, c, v) = sub_with_carry(*a, *b, carry);
        *dst = result;
        write_arith_flags(flags, result, c, v);
    }
}

#[inline(always)]
pub fn arm_cmps(a: *const u32, b: *const u32, flags: *mut u32) {
    unsafe {
        let (result, c, v) = sub_with_carry(*a, *b, true);
        write_arith_flags(flags, result, c, v);
    }
}

#[inline(always)]
pub fn arm_cmns(a: *const u32, b: *const u32, flags: *mut u32) {
    unsafe {
        let (result, c, v) = add_with_carry(*a, *b, false);
        write_arith_flags(flags, result, c, v);
    }
}

/* ----------------------------- memory ------------------------------ */

#[inline(always)]
pub fn arm_read8(ctx: *mut Arm7Context, addr: *const u32, dst: *mut u32) {
    unsafe {
        let address = *addr;
        let value = (*ctx).read8(address) as u32;
        *dst = value;
    }
}

#[inline(always)]
pub fn arm_read32(ctx: *mut Arm7Context, addr: *const u32, dst: *mut u32) {
    unsafe {
        let address = *addr;
        let value = (*ctx).read32(address & !3);
        *dst = value.rotate_right((address & 3) * 8);
    }
}

#[inline(always)]
pub fn arm_write8(ctx: *mut Arm7Context, addr: *const u32, data: *const u32) {
    unsafe {
        let (address, value) = (*addr, *data);
        (*ctx).write8(address, value as u8);
    }
}

#[inline(always)]
pub fn arm_write32(ctx: *mut Arm7Context, addr: *const u32, data: *const u32) {
    unsafe {
        let (address, value) = (*addr, *data);
        (*ctx).write32(address & !3, value);
    }
}

/* ------------------------- status and misc ------------------------- */

#[inline(always)]
pub fn arm_mrs(ctx: *mut Arm7Context, dst: *mut u32, spsr: u32) {
    unsafe {
        let value = interp::mrs_read(&mut *ctx, spsr != 0);
        *dst = value;
    }
}

#[inline(always)]
pub fn arm_msr(ctx: *mut Arm7Context, src: *const u32, spsr: u32) {
    unsafe {
        let value = *src;
        // The compiled MSR form writes the flag and control fields.
        interp::msr_write(&mut *ctx, spsr != 0, 0b1001, value);
    }
}

/// Interpreter fallback: runs one opcode and charges its true cost
/// directly against the running budget.
#[inline(always)]
pub fn arm_fallback(ctx: *mut Arm7Context, opcode: u32) {
    unsafe {
        let cycles = interp::single_op(&mut *ctx, opcode);
        (*ctx).cycle_count = (*ctx).cycle_count.wrapping_sub(cycles as i32);
    }
}
