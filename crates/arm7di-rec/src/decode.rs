//! Instruction classification for the recompiler front-end.
//!
//! `normalize` rewrites the common single-register LDM/STM forms into the
//! equivalent LDR/STR encoding, then `classify` buckets the word into an
//! operation category and a flag set describing its operand shape and side
//! effects. Both are pure functions of the word; anything uncommon lands in
//! `Fallback` and runs through the interpreter.

use log::debug;
use once_cell::sync::Lazy;

/// Opcode writes the program counter; ends the translation block.
pub const OP_SETS_PC: u32 = 1;
pub const OP_HAS_RD_12: u32 = 2;
pub const OP_HAS_RD_16: u32 = 4;
pub const OP_HAS_RS_0: u32 = 8;
pub const OP_HAS_RS_8: u32 = 16;
pub const OP_HAS_RS_16: u32 = 32;
pub const OP_HAS_FLAGS_READ: u32 = 4096;
pub const OP_HAS_FLAGS_WRITE: u32 = 8192;
/// Destination must be loaded before a conditional op so a skipped store
/// writes back the unchanged value.
pub const OP_HAS_RD_READ: u32 = 16384;
pub const OP_READS_PC: u32 = 32768;
pub const OP_IS_COND: u32 = 65536;
/// Multi-register block transfer sent to the fallback path.
pub const OP_MFB: u32 = 0x8000_0000;

// Pattern-table flags describing what a data-processing op reads/writes.
const DP_WRITE_FLAGS: u32 = 64;
const DP_WRITE_FLAGS_S: u32 = 128;
const DP_READ_FLAGS: u32 = 256;
const DP_READ_FLAGS_S: u32 = 512;
const DP_WRITE_REG: u32 = 1024;
const DP_READ_REG_1: u32 = 2048;

// Reads reg1, op2, flags if S.
const DP_R_ROFC: u32 = DP_READ_FLAGS_S | DP_READ_REG_1;
// Reads reg1, op2, flags always (ADC and friends).
const DP_R_ROF: u32 = DP_READ_FLAGS | DP_READ_REG_1;
// Reads op2 only, flags if S (MOV/MVN).
const DP_R_OFC: u32 = DP_READ_FLAGS_S;
// Writes reg, and flags if S.
const DP_W_RFC: u32 = DP_WRITE_FLAGS_S | DP_WRITE_REG;
// Writes flags only (comparisons, S is always set).
const DP_W_F: u32 = DP_WRITE_FLAGS;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpCategory {
    /// Defer to the interpreter, one opcode at a time.
    Fallback,
    /// Virtualizable data-processing op.
    DataOp,
    /// Branch to an immediate target.
    B,
    /// Branch-and-link to an immediate target.
    Bl,
    /// Branch to a register (`MOV pc, rm`).
    Br,
    /// Single-register load/store.
    MemOp,
    /// Status register read.
    Mrs,
    /// Status register write.
    Msr,
}

struct DpPattern {
    key: u32,
    mask: u32,
    flags: u32,
}

fn push_dp(table: &mut Vec<DpPattern>, subcode: u32, rflags: u32, wflags: u32) {
    let mut key = subcode << 21;
    let mut mask = (15 << 21) | (7 << 25);
    let flags = rflags | wflags;

    if wflags == DP_W_F {
        // Comparison ops only exist with the S bit set; S=0 encodings are
        // the PSR-transfer group.
        mask |= 1 << 20;
        key |= 1 << 20;
    }

    // Immediate-shifted register form (bit 25 = 0, bit 4 = 0).
    table.push(DpPattern {
        key,
        mask: mask | (1 << 4),
        flags,
    });
    // Register-shifted register form (bit 25 = 0, bit 4 = 1, bit 7 = 0).
    table.push(DpPattern {
        key: key | (1 << 4),
        mask: mask | (1 << 4) | (1 << 7),
        flags,
    });
    // Rotated-immediate form (bit 25 = 1).
    table.push(DpPattern {
        key: key | (1 << 25),
        mask,
        flags,
    });
}

static DP_PATTERNS: Lazy<Vec<DpPattern>> = Lazy::new(|| {
    let mut table = Vec::with_capacity(16 * 3);

    // AND EOR SUB RSB ADD ORR BIC: read rn/op2 (+flags if S), write rd.
    for subcode in [0u32, 1, 2, 3, 4, 12, 14] {
        push_dp(&mut table, subcode, DP_R_ROFC, DP_W_RFC);
    }
    // ADC SBC RSC: always consume the carry flag.
    for subcode in [5u32, 6, 7] {
        push_dp(&mut table, subcode, DP_R_ROF, DP_W_RFC);
    }
    // TST TEQ CMP CMN: write flags only.
    for subcode in [8u32, 9, 10, 11] {
        push_dp(&mut table, subcode, DP_R_ROF, DP_W_F);
    }
    // MOV MVN: no first operand.
    for subcode in [13u32, 15] {
        push_dp(&mut table, subcode, DP_R_OFC, DP_W_RFC);
    }

    table
});

#[inline]
fn bits(word: u32, shift: u32, mask: u32) -> u32 {
    (word >> shift) & mask
}

/// Rewrite unconditional single-register LDM/STM into the equivalent
/// LDR/STR encoding; every other word passes through untouched. The
/// rewritten form is exactly equivalent (address, transferred register and
/// base writeback all match), so it may be fed to either execution
/// strategy.
pub fn normalize(word: u32) -> u32 {
    // Unconditional block transfer, S clear, exactly one register listed.
    if word >> 25 != 0xE8 / 2 || word & (1 << 22) != 0 {
        return word;
    }
    let reg_list = word & 0xFFFF;
    if reg_list.count_ones() != 1 {
        return word;
    }

    let pre = word & (1 << 24) != 0;
    let up = word & (1 << 23) != 0;
    let wb = word & (1 << 21) != 0;
    let load = word & (1 << 20) != 0;
    let rn = bits(word, 16, 15);
    let rd = reg_list.trailing_zeros();

    // LDR/STR skeleton: unconditional, immediate offset, word transfer.
    let mut out = 0xE400_0000 | (rn << 16) | (rd << 12);
    if load {
        out |= 1 << 20;
    }
    if up {
        out |= 1 << 23;
    }
    if wb {
        // Writeback forms step the base by 4: IA/DA become post-indexed,
        // IB/DB pre-indexed with writeback.
        out |= 4;
        if pre {
            out |= (1 << 24) | (1 << 21);
        }
    } else {
        // No writeback: fold the IB/DB adjustment into a plain pre-indexed
        // offset (0 for IA/DA).
        out |= 1 << 24;
        if pre {
            out |= 4;
        }
    }

    debug!("arm7: block transfer {word:08X} rewritten to {out:08X}");
    out
}

/// Classify an instruction word. Deterministic and side-effect free;
/// returns the operation category plus the operand/side-effect flag set.
pub fn classify(word: u32) -> (OpCategory, u32) {
    let mut flags = OP_READS_PC;

    let cc = word >> 28;
    if cc != 0xE {
        flags |= OP_IS_COND;
    }

    let is_load = word & (1 << 20) != 0;

    // Does the opcode write the program counter?
    let sets_pc = (bits(word, 26, 3) == 0 && bits(word, 12, 15) == 15)
        || (bits(word, 26, 3) == 1 && bits(word, 12, 15) == 15 && is_load)
        || (bits(word, 25, 7) == 4 && word & (1 << 15) != 0 && is_load)
        || bits(word, 25, 7) == 5
        || bits(word, 24, 15) == 15;

    // NV condition encodes extension-space opcodes on later cores; let the
    // interpreter deal with it.
    if cc == 0xF {
        return (OpCategory::Fallback, flags);
    }

    if sets_pc {
        flags |= OP_SETS_PC;
    }

    // B / BL.
    if bits(word, 25, 7) == 5 {
        if flags & OP_IS_COND == 0 {
            flags &= !OP_READS_PC;
        }
        let cat = if word & (1 << 24) != 0 {
            OpCategory::Bl
        } else {
            OpCategory::B
        };
        return (cat, flags);
    }

    // MOV pc, rm — the common computed-branch form.
    if word & 0x0FFF_FFF0 == 0x01A0_F000 {
        if cc == 0xE {
            flags &= !OP_READS_PC;
        }
        return (OpCategory::Br, flags);
    }

    // Other conditionally-executed PC writers need real branching on
    // non-always conditions; leave them to the interpreter.
    if cc != 0xE && sets_pc {
        return (OpCategory::Fallback, flags);
    }

    // Data-processing ops, via the key/mask table.
    if !sets_pc {
        for pattern in DP_PATTERNS.iter() {
            if word & pattern.mask != pattern.key {
                continue;
            }

            flags &= !OP_READS_PC;

            // Conditional ops evaluate the flags first and must preserve a
            // skipped destination.
            if cc != 0xE {
                flags |= OP_HAS_FLAGS_READ | OP_HAS_RD_READ;
            }

            let s_bit = word & (1 << 20) != 0;
            if pattern.flags & DP_READ_FLAGS != 0
                || (pattern.flags & DP_READ_FLAGS_S != 0 && s_bit)
            {
                flags |= OP_HAS_FLAGS_READ;
            }
            if pattern.flags & DP_WRITE_FLAGS != 0
                || (pattern.flags & DP_WRITE_FLAGS_S != 0 && s_bit)
            {
                flags |= OP_HAS_FLAGS_WRITE;
            }

            if pattern.flags & DP_WRITE_REG != 0 {
                flags |= OP_HAS_RD_12;
            }
            if pattern.flags & DP_READ_REG_1 != 0 {
                flags |= OP_HAS_RS_16;
                if bits(word, 16, 15) == 15 {
                    flags |= OP_READS_PC;
                }
            }

            // Second operand: register (possibly shifted) or immediate.
            if word & (1 << 25) == 0 {
                flags |= OP_HAS_RS_0;
                if bits(word, 0, 15) == 15 {
                    flags |= OP_READS_PC;
                }
                if word & (1 << 4) != 0 {
                    // Register-specified shift amount.
                    flags |= OP_HAS_RS_8;
                } else if bits(word, 4, 7) == 6 {
                    // RRX consumes the carry even when the op itself
                    // would not read flags.
                    flags |= OP_HAS_FLAGS_READ;
                }
            }

            return (OpCategory::DataOp, flags);
        }
    }

    // Single data transfers. Only the unconditional forms are compiled;
    // the register-offset form is limited to plain LSL-by-immediate.
    if word >> 25 == 0xE4 / 2 {
        return (OpCategory::MemOp, flags);
    }
    if word >> 25 == 0xE6 / 2 && bits(word, 4, 7) == 0 {
        return (OpCategory::MemOp, flags);
    }

    if word & 0xE10F_0FFF == 0xE10F_0000 {
        return (OpCategory::Mrs, flags);
    }
    if word & 0xEFBF_FFF0 == 0xE129_F000 {
        return (OpCategory::Msr, flags);
    }

    if word >> 25 == 0xE8 / 2 && word & (1 << 15) == 0 {
        debug!("arm7: block transfer fallback {word:08X}");
        flags |= OP_MFB;
    } else {
        debug!("arm7: fallback {word:08X}");
    }

    (OpCategory::Fallback, flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_processing_shapes() {
        // MOV r0, #5
        let (cat, flags) = classify(0xE3A0_0005);
        assert_eq!(cat, OpCategory::DataOp);
        assert_eq!(flags & OP_HAS_RD_12, OP_HAS_RD_12);
        assert_eq!(flags & OP_HAS_RS_16, 0);
        assert_eq!(flags & OP_HAS_FLAGS_WRITE, 0);
        assert_eq!(flags & OP_READS_PC, 0);

        // ADDS r1, r2, r3
        let (cat, flags) = classify(0xE092_1003);
        assert_eq!(cat, OpCategory::DataOp);
        assert!(flags & OP_HAS_RD_12 != 0);
        assert!(flags & OP_HAS_RS_16 != 0);
        assert!(flags & OP_HAS_RS_0 != 0);
        assert!(flags & OP_HAS_FLAGS_WRITE != 0);

        // ADD r1, r2, r3, LSL r4 — register-specified shift.
        let (cat, flags) = classify(0xE082_1413);
        assert_eq!(cat, OpCategory::DataOp);
        assert!(flags & OP_HAS_RS_8 != 0);

        // MOVS r0, r1, RRX reads the carry flag.
        let (cat, flags) = classify(0xE1B0_0061);
        assert_eq!(cat, OpCategory::DataOp);
        assert!(flags & OP_HAS_FLAGS_READ != 0);

        // CMP r0, #1 — flags only, no destination.
        let (cat, flags) = classify(0xE350_0001);
        assert_eq!(cat, OpCategory::DataOp);
        assert_eq!(flags & OP_HAS_RD_12, 0);
        assert!(flags & OP_HAS_FLAGS_WRITE != 0);

        // ADD r0, pc, #4 reads the program counter.
        let (cat, flags) = classify(0xE28F_0004);
        assert_eq!(cat, OpCategory::DataOp);
        assert!(flags & OP_READS_PC != 0);

        // MOVEQ r0, #1 is conditional: flags read, destination preserved.
        let (cat, flags) = classify(0x03A0_0001);
        assert_eq!(cat, OpCategory::DataOp);
        assert!(flags & OP_IS_COND != 0);
        assert!(flags & OP_HAS_FLAGS_READ != 0);
        assert!(flags & OP_HAS_RD_READ != 0);
    }

    #[test]
    fn branches() {
        let (cat, flags) = classify(0xEA00_0002);
        assert_eq!(cat, OpCategory::B);
        assert!(flags & OP_SETS_PC != 0);
        assert_eq!(flags & OP_READS_PC, 0);

        let (cat, _) = classify(0xEB00_0002);
        assert_eq!(cat, OpCategory::Bl);

        // BNE keeps the PC read (the not-taken path re-stores pc+4).
        let (cat, flags) = classify(0x1A00_0002);
        assert_eq!(cat, OpCategory::B);
        assert!(flags & OP_IS_COND != 0);
        assert!(flags & OP_READS_PC != 0);

        // MOV pc, lr and its conditional form.
        let (cat, flags) = classify(0xE1A0_F00E);
        assert_eq!(cat, OpCategory::Br);
        assert!(flags & OP_SETS_PC != 0);
        let (cat, _) = classify(0x11A0_F00E);
        assert_eq!(cat, OpCategory::Br);

        // MOVS pc, lr changes mode; interpreter's business.
        let (cat, _) = classify(0xE1B0_F00E);
        assert_eq!(cat, OpCategory::Fallback);

        // Conditional LDR pc is a conditional PC writer: fallback.
        let (cat, _) = classify(0x0591_F000);
        assert_eq!(cat, OpCategory::Fallback);
    }

    #[test]
    fn memory_forms() {
        // LDR r0, [r1, #4]
        let (cat, _) = classify(0xE591_0004);
        assert_eq!(cat, OpCategory::MemOp);
        // STRB r0, [r1], #-1
        let (cat, _) = classify(0xE441_0001);
        assert_eq!(cat, OpCategory::MemOp);
        // LDR r0, [r1, r2, LSL #2]
        let (cat, _) = classify(0xE791_0102);
        assert_eq!(cat, OpCategory::MemOp);
        // LDR r0, [r1, r2, LSR #2] — only LSL offsets are compiled.
        let (cat, _) = classify(0xE791_0122);
        assert_eq!(cat, OpCategory::Fallback);
        // Conditional LDR goes to the interpreter.
        let (cat, _) = classify(0x1591_0004);
        assert_eq!(cat, OpCategory::Fallback);
        // Halfword transfer: interpreter only.
        let (cat, _) = classify(0xE1D1_00B4);
        assert_eq!(cat, OpCategory::Fallback);
    }

    #[test]
    fn block_transfer_normalization() {
        // LDMIA r1!, {r4} becomes LDR r4, [r1], #4.
        let word = normalize(0xE8B1_0010);
        assert_eq!(word, 0xE491_4004);
        assert_eq!(classify(word).0, OpCategory::MemOp);

        // STMDB r1!, {r4} becomes STR r4, [r1, #-4]!.
        let word = normalize(0xE921_0010);
        assert_eq!(word, 0xE521_4004);

        // LDMIA r1, {r4} without writeback: plain LDR r4, [r1].
        let word = normalize(0xE891_0010);
        assert_eq!(word, 0xE591_4000);

        // LDMIB r1, {r4}: LDR r4, [r1, #4].
        let word = normalize(0xE991_0010);
        assert_eq!(word, 0xE591_4004);

        // Multi-register lists pass through and fall back.
        let word = normalize(0xE8B1_0030);
        assert_eq!(word, 0xE8B1_0030);
        let (cat, flags) = classify(word);
        assert_eq!(cat, OpCategory::Fallback);
        assert!(flags & OP_MFB != 0);

        // S-bit transfers are never rewritten.
        assert_eq!(normalize(0xE8F1_0010), 0xE8F1_0010);
        // Conditional transfers are never rewritten.
        assert_eq!(normalize(0x18B1_0010), 0x18B1_0010);
    }

    #[test]
    fn status_and_system_forms() {
        let (cat, _) = classify(0xE10F_0000); // MRS r0, CPSR
        assert_eq!(cat, OpCategory::Mrs);
        let (cat, _) = classify(0xE14F_0000); // MRS r0, SPSR
        assert_eq!(cat, OpCategory::Mrs);
        let (cat, flags) = classify(0xE129_F000); // MSR CPSR_fc, r0
        assert_eq!(cat, OpCategory::Msr);
        // The MSR encoding has rd=15, so it terminates the block.
        assert!(flags & OP_SETS_PC != 0);
        let (cat, _) = classify(0xE169_F000); // MSR SPSR_fc, r0
        assert_eq!(cat, OpCategory::Msr);
        // Conditional MSR falls back.
        let (cat, _) = classify(0x1129_F000);
        assert_eq!(cat, OpCategory::Fallback);

        // SWI and MUL execute in the interpreter.
        let (cat, flags) = classify(0xEF00_0000);
        assert_eq!(cat, OpCategory::Fallback);
        assert!(flags & OP_SETS_PC != 0);
        let (cat, _) = classify(0xE000_0291); // MUL r0, r1, r2
        assert_eq!(cat, OpCategory::Fallback);
    }

    #[test]
    fn classify_is_pure() {
        for word in [0xE3A0_0005u32, 0xE8B1_0030, 0x03A0_0001, 0xE591_0004] {
            assert_eq!(classify(word), classify(word));
        }
    }
}
