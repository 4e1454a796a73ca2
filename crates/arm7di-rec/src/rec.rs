//! Recompiler front-end: groups guest instructions into a translation
//! block, classifies each one, virtualizes data-processing ops with a
//! per-instruction register rename, and hands the micro-op stream to the
//! backend together with a cycle estimate.

use log::debug;

use crate::armop::{ArmOp, Cond, DP_KINDS, OpKind, Operand, RegRef, ShiftBy, ShiftSpec};
use crate::backend::{BlockEntry, CacheExhausted};
use crate::decode::{
    self, OP_HAS_RD_12, OP_HAS_RD_READ, OP_HAS_RS_0, OP_HAS_RS_8, OP_HAS_RS_16, OP_IS_COND,
    OP_SETS_PC, OpCategory,
};
use crate::{ARAM_SIZE_MAX, Arm7Context, alu};

/// Block length cap. Long blocks hurt interrupt latency and the cycle
/// estimate, so control falls through to a fresh block after this many
/// instructions.
pub const BLOCK_MAX_OPS: usize = 32;

/// Per-instruction guest-to-scratch register rename state.
struct Renamer {
    map: [Option<u8>; 16],
    next: u8,
}

impl Renamer {
    fn new() -> Self {
        Self {
            map: [None; 16],
            next: 0,
        }
    }

    /// Returns the scratch slot for a guest register, allocating on first
    /// sight so duplicate loads collapse.
    fn rename(&mut self, reg: usize) -> (u8, bool) {
        if let Some(slot) = self.map[reg] {
            (slot, false)
        } else {
            let slot = self.next;
            self.next += 1;
            self.map[reg] = Some(slot);
            (slot, true)
        }
    }
}

/// Rename one guest register field and, on first sight, emit the load
/// that fills its scratch slot. The program counter materializes as a
/// pipeline-adjusted constant instead of a register read.
fn load_renamed(
    block_ops: &mut Vec<ArmOp>,
    renamer: &mut Renamer,
    reg: usize,
    pc_value: u32,
    do_load: bool,
) -> u8 {
    let (slot, fresh) = renamer.rename(reg);
    if do_load && fresh {
        let src = if reg == 15 {
            Operand::Imm(pc_value)
        } else {
            Operand::reg(RegRef::Guest(reg as u8))
        };
        block_ops.push(ArmOp::mov(RegRef::Scratch(slot), src));
    }
    slot
}

/// Virtualize one data-processing instruction: guard marker, rename
/// loads, the op itself on scratch operands, rename stores.
fn virtualize_data_op(block_ops: &mut Vec<ArmOp>, word: u32, flags: u32, pc: u32) {
    let cond = Cond::from_bits(word >> 28);
    let guarded = flags & OP_IS_COND != 0;
    if guarded {
        block_ops.push(ArmOp::cond_start(cond));
    }

    let mut renamer = Renamer::new();
    // A register-specified shift stalls the pipeline; PC reads see pc+12.
    let by_reg = word & (1 << 25) == 0 && word & (1 << 4) != 0;
    let pc_rs = pc.wrapping_add(if by_reg { 12 } else { 8 });

    let mut rm_slot = None;
    let mut rs_slot = None;
    let mut rn_slot = None;
    let mut rd_slot = None;

    if flags & OP_HAS_RS_0 != 0 {
        rm_slot = Some(load_renamed(
            block_ops,
            &mut renamer,
            (word & 0xF) as usize,
            pc_rs,
            true,
        ));
    }
    if flags & OP_HAS_RS_8 != 0 {
        rs_slot = Some(load_renamed(
            block_ops,
            &mut renamer,
            ((word >> 8) & 0xF) as usize,
            pc.wrapping_add(8),
            true,
        ));
    }
    if flags & OP_HAS_RS_16 != 0 {
        rn_slot = Some(load_renamed(
            block_ops,
            &mut renamer,
            ((word >> 16) & 0xF) as usize,
            pc_rs,
            true,
        ));
    }
    if flags & OP_HAS_RD_12 != 0 {
        rd_slot = Some(load_renamed(
            block_ops,
            &mut renamer,
            ((word >> 12) & 0xF) as usize,
            pc.wrapping_add(4),
            flags & OP_HAS_RD_READ != 0,
        ));
    }

    let mut imm_carry = None;
    let op2 = if word & (1 << 25) != 0 {
        let rot = ((word >> 8) & 0xF) * 2;
        let value = (word & 0xFF).rotate_right(rot);
        if rot != 0 {
            imm_carry = Some(value >> 31);
        }
        Operand::Imm(value)
    } else {
        let ty = (word >> 5) & 3;
        let shift = if word & (1 << 4) != 0 {
            Some(ShiftSpec {
                ty,
                by: ShiftBy::Reg(RegRef::Scratch(rs_slot.expect("shift register renamed"))),
            })
        } else {
            let amount = (word >> 7) & 0x1F;
            if ty == alu::SHIFT_LSL && amount == 0 {
                None
            } else {
                Some(ShiftSpec {
                    ty,
                    by: ShiftBy::Imm(amount),
                })
            }
        };
        Operand::Reg {
            r: RegRef::Scratch(rm_slot.expect("op2 register renamed")),
            shift,
        }
    };

    let kind = DP_KINDS[((word >> 21) & 0xF) as usize];
    let mut op = ArmOp::new(kind);
    op.cond = cond;
    op.set_flags = word & (1 << 20) != 0;
    op.imm_carry = imm_carry;
    match kind {
        OpKind::Mov | OpKind::Mvn => {
            op.arg[0] = op2;
        }
        _ => {
            op.arg[0] = Operand::reg(RegRef::Scratch(rn_slot.expect("rn renamed")));
            op.arg[1] = op2;
        }
    }
    if let Some(rd) = rd_slot {
        op.rd = Operand::reg(RegRef::Scratch(rd));
    }
    block_ops.push(op);

    if let Some(rd) = rd_slot {
        let rd_guest = ((word >> 12) & 0xF) as u8;
        block_ops.push(ArmOp::mov(
            RegRef::Guest(rd_guest),
            Operand::reg(RegRef::Scratch(rd)),
        ));
    }

    if guarded {
        block_ops.push(ArmOp::cond_end());
    }
}

/// Virtualize a single-register load/store. Returns false for the rare
/// shapes the emitter does not handle (PC-based writeback), which then
/// run through the fallback path.
fn virtualize_mem_op(block_ops: &mut Vec<ArmOp>, word: u32, pc: u32) -> bool {
    let reg_offset = word & (1 << 25) != 0;
    let pre = word & (1 << 24) != 0;
    let up = word & (1 << 23) != 0;
    let byte = word & (1 << 22) != 0;
    let wb_bit = word & (1 << 21) != 0;
    let load = word & (1 << 20) != 0;
    let rn = ((word >> 16) & 0xF) as usize;
    let rd = ((word >> 12) & 0xF) as usize;
    let imm_off = word & 0xFFF;

    // Write back on pre- or post-indexing, unless the loaded value owns
    // the register.
    let mut write_back = (wb_bit || !pre) && !(load && rn == rd);

    let mut offset_op = if reg_offset {
        // Classifier only admits plain LSL-by-immediate offsets.
        let amount = (word >> 7) & 0x1F;
        let shift = if amount == 0 {
            None
        } else {
            Some(ShiftSpec {
                ty: alu::SHIFT_LSL,
                by: ShiftBy::Imm(amount),
            })
        };
        Operand::Reg {
            r: RegRef::Guest((word & 0xF) as u8),
            shift,
        }
    } else if imm_off != 0 {
        Operand::Imm(imm_off)
    } else {
        // Zero immediate offset: the base never changes.
        write_back = false;
        Operand::None
    };

    let base_op = if rn != 15 {
        Operand::reg(RegRef::Guest(rn as u8))
    } else {
        if write_back {
            return false;
        }
        let mut addr = pc.wrapping_add(8);
        if pre && !reg_offset {
            addr = if up {
                addr.wrapping_add(imm_off)
            } else {
                addr.wrapping_sub(imm_off)
            };
            offset_op = Operand::None;
        } else if !pre {
            offset_op = Operand::None;
        }
        Operand::Imm(addr)
    };

    let mut op = ArmOp::new(if load { OpKind::Ldr } else { OpKind::Str });
    op.pre_index = pre;
    op.add_offset = up;
    op.byte_xfer = byte;
    op.write_back = write_back;
    op.arg[0] = base_op;
    op.arg[1] = offset_op;
    if load {
        op.rd = Operand::reg(if rd == 15 {
            RegRef::NextPc
        } else {
            RegRef::Guest(rd as u8)
        });
    } else {
        op.arg[2] = if rd == 15 {
            Operand::Imm(pc.wrapping_add(12))
        } else {
            Operand::reg(RegRef::Guest(rd as u8))
        };
    }
    block_ops.push(op);
    true
}

/// Defer one opcode to the interpreter: set up the pipeline registers the
/// interpreter expects (`r15 = pc+8`, `next_pc = pc+4`), then emit the
/// fallback record. The interpreter evaluates the condition itself, so no
/// guard is emitted.
fn emit_fallback(block_ops: &mut Vec<ArmOp>, word: u32, pc: u32) {
    block_ops.push(ArmOp::mov(
        RegRef::Guest(15),
        Operand::Imm(pc.wrapping_add(8)),
    ));
    block_ops.push(ArmOp::branch(Operand::Imm(pc.wrapping_add(4))));
    let mut op = ArmOp::new(OpKind::Fallback);
    op.arg[0] = Operand::Imm(word);
    block_ops.push(op);
}

/// Compile the translation block starting at `next_pc`, register it in
/// the entry-point table and return its entry.
///
/// # Safety
/// `ctx` must be a valid, initialized, heap-pinned context.
pub unsafe fn compile_block(ctx: *mut Arm7Context) -> Result<BlockEntry, CacheExhausted> {
    unsafe {
        let start = (*ctx).next_pc;
        let costs = (*ctx).costs;
        let mut block_ops: Vec<ArmOp> = Vec::with_capacity(BLOCK_MAX_OPS * 4);
        let mut cycles = 0u32;
        let mut pc = start;

        for i in 0..BLOCK_MAX_OPS {
            cycles += costs.op;

            let raw = (*ctx).fetch32(pc);
            let word = decode::normalize(raw);
            let (cat, flags) = decode::classify(word);
            let cond = Cond::from_bits(word >> 28);
            let guarded = flags & OP_IS_COND != 0;

            match cat {
                OpCategory::DataOp => virtualize_data_op(&mut block_ops, word, flags, pc),

                OpCategory::B | OpCategory::Bl => {
                    let offset = ((word << 8) as i32) >> 6;
                    let target = pc.wrapping_add(8).wrapping_add_signed(offset);
                    let link = cat == OpCategory::Bl;
                    if guarded {
                        // Not-taken path: fall through to the next opcode.
                        block_ops.push(ArmOp::branch(Operand::Imm(pc.wrapping_add(4))));
                        block_ops.push(ArmOp::cond_start(cond));
                        if link {
                            block_ops.push(ArmOp::mov(
                                RegRef::Guest(14),
                                Operand::Imm(pc.wrapping_add(4)),
                            ));
                        }
                        block_ops.push(ArmOp::branch(Operand::Imm(target)));
                        block_ops.push(ArmOp::cond_end());
                    } else {
                        if link {
                            block_ops.push(ArmOp::mov(
                                RegRef::Guest(14),
                                Operand::Imm(pc.wrapping_add(4)),
                            ));
                        }
                        block_ops.push(ArmOp::branch(Operand::Imm(target)));
                    }
                    cycles += costs.branch;
                }

                OpCategory::Br => {
                    let rm = RegRef::Guest((word & 0xF) as u8);
                    if guarded {
                        block_ops.push(ArmOp::branch(Operand::Imm(pc.wrapping_add(4))));
                        block_ops.push(ArmOp::cond_start(cond));
                        block_ops.push(ArmOp::branch(Operand::reg(rm)));
                        block_ops.push(ArmOp::cond_end());
                    } else {
                        block_ops.push(ArmOp::branch(Operand::reg(rm)));
                    }
                    cycles += costs.branch;
                }

                OpCategory::MemOp => {
                    if virtualize_mem_op(&mut block_ops, word, pc) {
                        cycles += if word & (1 << 20) != 0 {
                            costs.load
                        } else {
                            costs.store
                        };
                    } else {
                        emit_fallback(&mut block_ops, word, pc);
                        cycles -= costs.op;
                    }
                }

                OpCategory::Mrs => {
                    let rd = (word >> 12) & 0xF;
                    let mut op = ArmOp::new(OpKind::Mrs);
                    op.rd = Operand::reg(if rd == 15 {
                        RegRef::NextPc
                    } else {
                        RegRef::Guest(rd as u8)
                    });
                    op.spsr = word & (1 << 22) != 0;
                    block_ops.push(op);
                }

                OpCategory::Msr => {
                    let mut op = ArmOp::new(OpKind::Msr);
                    op.arg[0] = Operand::reg(RegRef::Guest((word & 0xF) as u8));
                    op.spsr = word & (1 << 22) != 0;
                    block_ops.push(op);
                    // MSR encodes rd=15 and so terminates the block, but
                    // control continues at the next opcode.
                    block_ops.push(ArmOp::branch(Operand::Imm(pc.wrapping_add(4))));
                    cycles += costs.msr;
                }

                OpCategory::Fallback => {
                    emit_fallback(&mut block_ops, word, pc);
                    // The fallback record charges real interpreter cycles.
                    cycles -= costs.op;
                }
            }

            if flags & OP_SETS_PC != 0 {
                debug!("arm7: {pc:06X}: block end after {} ops", i + 1);
                break;
            }
            if i == BLOCK_MAX_OPS - 1 {
                debug!("arm7: {pc:06X}: block split");
                block_ops.push(ArmOp::branch(Operand::Imm(pc.wrapping_add(4))));
            }
            pc = pc.wrapping_add(4);
        }

        let backend = &mut (*ctx).backend;
        let entry = backend.compile(ctx, &block_ops, cycles)?;
        (&mut (*ctx).entry_points)[((start & (ARAM_SIZE_MAX - 1)) >> 2) as usize] = entry;
        (*ctx).compile_count += 1;
        Ok(entry)
    }
}
