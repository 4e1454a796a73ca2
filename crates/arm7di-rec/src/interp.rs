//! Direct interpreter. This is the semantic ground truth: it covers the
//! whole instruction set and backs the recompiler's fallback path, so an
//! opcode the classifier refuses to virtualize still executes correctly
//! here, one at a time.

use log::error;

use crate::alu::{self, add_with_carry, sub_with_carry};
use crate::{Arm7Context, Mode};

/// Interpret opcodes until the cycle budget runs out or the core is
/// disabled, servicing the FIQ latch between opcodes.
pub fn run(ctx: &mut Arm7Context, budget: u32) {
    let mut ticks = 0;
    while ticks < budget {
        if !ctx.enabled {
            break;
        }
        if ctx.intr_pend != 0 {
            ctx.enter_fiq();
        }
        ticks += step_one(ctx);
    }
}

/// Fetch, advance the pipeline and execute a single opcode.
pub fn step_one(ctx: &mut Arm7Context) -> u32 {
    let pc = ctx.next_pc;
    let op = ctx.fetch32(pc);
    ctx.next_pc = pc.wrapping_add(4);
    ctx.r[15] = pc.wrapping_add(8);
    single_op(ctx, op)
}

/// Execute one already-fetched opcode. `r[15]` must hold the pipeline
/// view (`pc + 8`) and `next_pc` must already point past the opcode; this
/// is also the calling convention of the recompiler's fallback records.
pub fn single_op(ctx: &mut Arm7Context, op: u32) -> u32 {
    if !alu::condition_passed(op >> 28, ctx.flags) {
        return ctx.costs.interp_op;
    }

    // PSR transfers overlap the S=0 comparison encodings; match them first.
    if exec_mrs_msr(ctx, op) {
        return ctx.costs.interp_op;
    }
    if is_swap(op) {
        return exec_swap(ctx, op);
    }
    // Multiply / multiply-accumulate: bits 27..22 zero, bits 7..4 = 1001.
    if op & 0x0FC0_00F0 == 0x0000_0090 {
        return exec_multiply(ctx, op);
    }
    // Halfword and signed transfers: bits 27..25 = 000, bits 7 and 4 set,
    // SH nonzero (zero is the multiply/swap space).
    if op & 0x0E00_0090 == 0x0000_0090 && (op >> 5) & 3 != 0 {
        return exec_halfword_transfer(ctx, op);
    }

    let class = (op >> 25) & 7;
    // Register-offset transfer with bit 4 set is architecturally undefined.
    if class == 0b011 && op & (1 << 4) != 0 {
        ctx.enter_undefined();
        return ctx.costs.exception;
    }

    match class {
        0b000 | 0b001 => exec_data_processing(ctx, op),
        0b010 | 0b011 => exec_single_transfer(ctx, op),
        0b100 => exec_block_transfer(ctx, op),
        0b101 => exec_branch(ctx, op),
        0b111 if op & (1 << 24) != 0 => {
            ctx.enter_swi();
            ctx.costs.exception
        }
        _ => {
            // Coprocessor space: the ARM7DI has none, so these trap.
            ctx.enter_undefined();
            ctx.costs.exception
        }
    }
}

/// Read the composite CPSR (or the active SPSR). Shared with the
/// recompiled MRS records.
pub(crate) fn mrs_read(ctx: &mut Arm7Context, spsr: bool) -> u32 {
    if spsr {
        ctx.spsr.raw()
    } else {
        ctx.update_cpsr();
        ctx.cpsr.raw()
    }
}

/// Write the CPSR or SPSR under a field mask, switching register banks if
/// the mode changes. Shared with the recompiled MSR records.
pub(crate) fn msr_write(ctx: &mut Arm7Context, spsr: bool, fields: u32, value: u32) {
    if spsr {
        if !ctx.mode.has_spsr() {
            return;
        }
        let mut raw = ctx.spsr.raw();
        if fields & 8 != 0 {
            raw = (raw & 0x0FFF_FFFF) | (value & 0xF000_0000);
        }
        if fields & 1 != 0 {
            raw = (raw & 0xFFFF_FF00) | (value & 0xFF);
        }
        ctx.spsr.set_raw(raw);
        return;
    }

    ctx.update_cpsr();
    let mut raw = ctx.cpsr.raw();
    if fields & 8 != 0 {
        raw = (raw & 0x0FFF_FFFF) | (value & 0xF000_0000);
    }
    if fields & 1 != 0 && ctx.mode != Mode::Usr {
        raw = (raw & 0xFFFF_FF00) | (value & 0xFF) | 0x10;
    }

    let new_bits = raw & 0x1F;
    if new_bits != ctx.mode as u32 {
        let Some(new_mode) = Mode::from_bits(new_bits) else {
            error!("arm7: unsupported mode {new_bits:02X} in status write");
            panic!("arm7: unsupported CPU mode {new_bits:02X}");
        };
        ctx.switch_mode(new_mode, false);
    }
    ctx.cpsr.set_raw(raw);
    ctx.update_flags();
}

/// Restore CPSR from SPSR: data-processing write to r15 with S set, or an
/// LDM with r15 in the list and the S bit. Switches back to the saved
/// mode, swapping register banks.
pub(crate) fn restore_cpsr_from_spsr(ctx: &mut Arm7Context) {
    if !ctx.mode.has_spsr() {
        return;
    }
    let spsr = ctx.spsr;
    let bits = spsr.mode_bits();
    let Some(new_mode) = Mode::from_bits(bits) else {
        error!("arm7: unsupported mode {bits:02X} in SPSR restore");
        panic!("arm7: unsupported CPU mode {bits:02X}");
    };
    if new_mode != ctx.mode {
        ctx.switch_mode(new_mode, false);
    }
    ctx.cpsr = spsr;
    ctx.update_flags();
}

#[inline]
fn shift_by_reg(op: u32) -> bool {
    op & (1 << 25) == 0 && op & (1 << 4) != 0
}

/// Register read with pipeline semantics: r15 reads as pc+8, or pc+12
/// when the opcode uses a register-specified shift amount.
#[inline]
fn reg_val(ctx: &Arm7Context, reg: usize, reg_shift: bool) -> u32 {
    let value = ctx.r[reg];
    if reg == 15 && reg_shift {
        value.wrapping_add(4)
    } else {
        value
    }
}

/// Decode the second operand of a data-processing op: rotated immediate,
/// or a register run through the barrel shifter. Also yields the shifter
/// carry-out.
fn operand2(ctx: &Arm7Context, op: u32) -> (u32, bool) {
    let carry_in = ctx.flags.c();
    if op & (1 << 25) != 0 {
        let rot = ((op >> 8) & 0xF) * 2;
        let value = (op & 0xFF).rotate_right(rot);
        let carry = if rot == 0 { carry_in } else { value >> 31 != 0 };
        (value, carry)
    } else {
        let by_reg = op & (1 << 4) != 0;
        let rm = (op & 0xF) as usize;
        let value = reg_val(ctx, rm, by_reg);
        let ty = (op >> 5) & 3;
        if by_reg {
            let rs = ((op >> 8) & 0xF) as usize;
            let amount = ctx.r[rs] & 0xFF;
            alu::shift_reg(value, ty, amount, carry_in)
        } else {
            let amount = (op >> 7) & 0x1F;
            alu::shift_imm(value, ty, amount, carry_in)
        }
    }
}

enum FlagUpdate {
    Logic,
    Arith(bool, bool),
}

fn exec_data_processing(ctx: &mut Arm7Context, op: u32) -> u32 {
    let code = (op >> 21) & 0xF;
    let s = op & (1 << 20) != 0;
    let rd = ((op >> 12) & 0xF) as usize;
    let rn = ((op >> 16) & 0xF) as usize;

    let (op2, shifter_c) = operand2(ctx, op);
    let rn_val = if code == 0xD || code == 0xF {
        0
    } else {
        reg_val(ctx, rn, shift_by_reg(op))
    };
    let c_in = ctx.flags.c();

    use FlagUpdate::{Arith, Logic};
    let (result, update) = match code {
        0x0 | 0x8 => (rn_val & op2, Logic),
        0x1 | 0x9 => (rn_val ^ op2, Logic),
        0x2 | 0xA => {
            let (r, c, v) = sub_with_carry(rn_val, op2, true);
            (r, Arith(c, v))
        }
        0x3 => {
            let (r, c, v) = sub_with_carry(op2, rn_val, true);
            (r, Arith(c, v))
        }
        0x4 | 0xB => {
            let (r, c, v) = add_with_carry(rn_val, op2, false);
            (r, Arith(c, v))
        }
        0x5 => {
            let (r, c, v) = add_with_carry(rn_val, op2, c_in);
            (r, Arith(c, v))
        }
        0x6 => {
            let (r, c, v) = sub_with_carry(rn_val, op2, c_in);
            (r, Arith(c, v))
        }
        0x7 => {
            let (r, c, v) = sub_with_carry(op2, rn_val, c_in);
            (r, Arith(c, v))
        }
        0xC => (rn_val | op2, Logic),
        0xD => (op2, Logic),
        0xE => (rn_val & !op2, Logic),
        _ => (!op2, Logic),
    };

    let writes_rd = !(0x8..=0xB).contains(&code);
    if writes_rd {
        if rd == 15 {
            ctx.write_pc(result);
            if s {
                restore_cpsr_from_spsr(ctx);
            }
            return ctx.costs.interp_op;
        }
        ctx.r[rd] = result;
    }
    if s {
        let mut flags = ctx.flags;
        flags.set_n(result >> 31 != 0);
        flags.set_z(result == 0);
        match update {
            Logic => flags.set_c(shifter_c),
            Arith(c, v) => {
                flags.set_c(c);
                flags.set_v(v);
            }
        }
        ctx.flags = flags;
    }
    ctx.costs.interp_op
}

fn exec_mrs_msr(ctx: &mut Arm7Context, op: u32) -> bool {
    // MRS rd, CPSR/SPSR.
    if op & 0x0FBF_0FFF == 0x010F_0000 {
        let rd = ((op >> 12) & 0xF) as usize;
        let value = mrs_read(ctx, op & (1 << 22) != 0);
        if rd == 15 {
            ctx.write_pc(value);
        } else {
            ctx.r[rd] = value;
        }
        return true;
    }

    // MSR CPSR/SPSR, rm or rotated immediate.
    let value = if op & 0x0FB0_FFF0 == 0x0120_F000 {
        ctx.r[(op & 0xF) as usize]
    } else if op & 0x0FB0_F000 == 0x0320_F000 {
        (op & 0xFF).rotate_right(((op >> 8) & 0xF) * 2)
    } else {
        return false;
    };
    msr_write(ctx, op & (1 << 22) != 0, (op >> 16) & 0xF, value);
    true
}

fn is_swap(op: u32) -> bool {
    // Cond 00010 B 00 Rn Rd 0000 1001 Rm.
    (op >> 23) & 0x1F == 0b00010
        && (op >> 20) & 3 == 0
        && (op >> 8) & 0xF == 0
        && (op >> 4) & 0xF == 0b1001
}

fn exec_swap(ctx: &mut Arm7Context, op: u32) -> u32 {
    let rn = ((op >> 16) & 0xF) as usize;
    let rd = ((op >> 12) & 0xF) as usize;
    let rm = (op & 0xF) as usize;
    let address = ctx.r[rn];

    if op & (1 << 22) != 0 {
        let old = ctx.read8(address) as u32;
        let value = ctx.r[rm] as u8;
        ctx.write8(address, value);
        ctx.r[rd] = old;
    } else {
        let old = ctx.read32(address & !3).rotate_right((address & 3) * 8);
        let value = ctx.r[rm];
        ctx.write32(address & !3, value);
        ctx.r[rd] = old;
    }
    ctx.costs.interp_op
}

fn exec_multiply(ctx: &mut Arm7Context, op: u32) -> u32 {
    let accumulate = op & (1 << 21) != 0;
    let s = op & (1 << 20) != 0;
    let rd = ((op >> 16) & 0xF) as usize;
    let rn = ((op >> 12) & 0xF) as usize;
    let rs = ((op >> 8) & 0xF) as usize;
    let rm = (op & 0xF) as usize;

    let mut result = ctx.r[rm].wrapping_mul(ctx.r[rs]);
    if accumulate {
        result = result.wrapping_add(ctx.r[rn]);
    }
    ctx.r[rd] = result;
    if s {
        // C and V are unpredictable after a multiply; leave them alone.
        let mut flags = ctx.flags;
        flags.set_n(result >> 31 != 0);
        flags.set_z(result == 0);
        ctx.flags = flags;
    }
    ctx.costs.interp_op
}

fn exec_single_transfer(ctx: &mut Arm7Context, op: u32) -> u32 {
    let reg_offset = op & (1 << 25) != 0;
    let pre = op & (1 << 24) != 0;
    let up = op & (1 << 23) != 0;
    let byte = op & (1 << 22) != 0;
    let wb = op & (1 << 21) != 0;
    let load = op & (1 << 20) != 0;
    let rn = ((op >> 16) & 0xF) as usize;
    let rd = ((op >> 12) & 0xF) as usize;

    let base = ctx.r[rn];
    let offset = if reg_offset {
        // Shift-by-immediate register offset; reuse the operand decoder
        // with the immediate bit forced off.
        operand2(ctx, op & !(1 << 25)).0
    } else {
        op & 0xFFF
    };
    let offset_addr = if up {
        base.wrapping_add(offset)
    } else {
        base.wrapping_sub(offset)
    };
    let address = if pre { offset_addr } else { base };

    if load {
        let data = if byte {
            ctx.read8(address) as u32
        } else {
            // Unaligned word loads rotate the data into place.
            ctx.read32(address & !3).rotate_right((address & 3) * 8)
        };
        if rd == 15 {
            ctx.write_pc(data);
        } else {
            ctx.r[rd] = data;
        }
    } else {
        let value = if rd == 15 {
            // Stored PC reads as pc+12.
            ctx.r[15].wrapping_add(4)
        } else {
            ctx.r[rd]
        };
        if byte {
            ctx.write8(address, value as u8);
        } else {
            ctx.write32(address & !3, value);
        }
    }

    // Writeback, unless the loaded value already claimed the register.
    if (wb || !pre) && !(load && rd == rn) {
        ctx.r[rn] = offset_addr;
    }
    ctx.costs.interp_op
}

fn exec_halfword_transfer(ctx: &mut Arm7Context, op: u32) -> u32 {
    let pre = op & (1 << 24) != 0;
    let up = op & (1 << 23) != 0;
    let imm_form = op & (1 << 22) != 0;
    let wb = op & (1 << 21) != 0;
    let load = op & (1 << 20) != 0;
    let rn = ((op >> 16) & 0xF) as usize;
    let rd = ((op >> 12) & 0xF) as usize;
    let sh = (op >> 5) & 3;

    let base = ctx.r[rn];
    let offset = if imm_form {
        ((op >> 4) & 0xF0) | (op & 0xF)
    } else {
        ctx.r[(op & 0xF) as usize]
    };
    let offset_addr = if up {
        base.wrapping_add(offset)
    } else {
        base.wrapping_sub(offset)
    };
    let address = if pre { offset_addr } else { base };

    if load {
        let data = match sh {
            1 => ctx.read16(address & !1) as u32,
            2 => ctx.read8(address) as i8 as u32,
            _ => ctx.read16(address & !1) as i16 as u32,
        };
        if rd == 15 {
            ctx.write_pc(data);
        } else {
            ctx.r[rd] = data;
        }
    } else {
        if sh != 1 {
            ctx.enter_undefined();
            return ctx.costs.exception;
        }
        let value = if rd == 15 {
            ctx.r[15].wrapping_add(4)
        } else {
            ctx.r[rd]
        };
        ctx.write16(address & !1, value as u16);
    }

    if (wb || !pre) && !(load && rd == rn) {
        ctx.r[rn] = offset_addr;
    }
    ctx.costs.interp_op
}

fn exec_block_transfer(ctx: &mut Arm7Context, op: u32) -> u32 {
    let pre = op & (1 << 24) != 0;
    let up = op & (1 << 23) != 0;
    let s_bit = op & (1 << 22) != 0;
    let wb = op & (1 << 21) != 0;
    let load = op & (1 << 20) != 0;
    let rn = ((op >> 16) & 0xF) as usize;
    let list = op & 0xFFFF;

    let base = ctx.r[rn];
    let count = list.count_ones();
    if count == 0 {
        return ctx.costs.interp_op;
    }

    let base_in_list = list & (1 << rn) != 0;
    // S without r15 in the list transfers the User bank registers.
    let user_bank = s_bit && list & (1 << 15) == 0;

    let final_base = if up {
        base.wrapping_add(count * 4)
    } else {
        base.wrapping_sub(count * 4)
    };
    // Registers always transfer in increasing address order; decrement
    // modes start from the lowest address and flip pre/post.
    let mut address = if up { base } else { final_base };
    let use_pre = if up { pre } else { !pre };

    // LDM writes the base back before loading so a loaded base wins.
    if load && wb && !base_in_list {
        ctx.r[rn] = final_base;
    }

    for reg in 0..16usize {
        if list & (1 << reg) == 0 {
            continue;
        }
        if use_pre {
            address = address.wrapping_add(4);
        }

        if load {
            let value = ctx.read32(address & !3);
            if reg == 15 {
                ctx.write_pc(value);
            } else if user_bank {
                ctx.set_user_reg(reg, value);
            } else {
                ctx.r[reg] = value;
            }
        } else {
            let value = if reg == 15 {
                ctx.r[15].wrapping_add(4)
            } else if reg == rn {
                // Storing the base stores its pre-writeback value.
                base
            } else if user_bank {
                ctx.user_reg(reg)
            } else {
                ctx.r[reg]
            };
            ctx.write32(address & !3, value);
        }

        if !use_pre {
            address = address.wrapping_add(4);
        }
    }

    if !load && wb {
        ctx.r[rn] = final_base;
    }

    if s_bit && load && list & (1 << 15) != 0 {
        restore_cpsr_from_spsr(ctx);
    }
    ctx.costs.interp_op
}

fn exec_branch(ctx: &mut Arm7Context, op: u32) -> u32 {
    let link = op & (1 << 24) != 0;
    // 24-bit offset, sign-extended and scaled to words.
    let offset = ((op << 8) as i32) >> 6;
    if link {
        ctx.r[14] = ctx.r[15].wrapping_sub(4);
    }
    let target = ctx.r[15].wrapping_add_signed(offset);
    ctx.write_pc(target);
    ctx.costs.interp_op
}
