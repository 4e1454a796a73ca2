//! Virtualized operations: the intermediate form the front-end produces
//! and the back-end consumes. One guest instruction becomes a short run of
//! these (rename loads, the op itself, rename stores), bracketed by guard
//! markers when it is conditionally executed. The stream only lives for a
//! single block compilation.

use core::fmt;

use crate::alu;

/// Architectural condition codes, numbered as encoded in bits 31..28.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum Cond {
    Eq = 0x0,
    Ne = 0x1,
    Cs = 0x2,
    Cc = 0x3,
    Mi = 0x4,
    Pl = 0x5,
    Vs = 0x6,
    Vc = 0x7,
    Hi = 0x8,
    Ls = 0x9,
    Ge = 0xA,
    Lt = 0xB,
    Gt = 0xC,
    Le = 0xD,
    Al = 0xE,
    Nv = 0xF,
}

impl Cond {
    pub fn from_bits(bits: u32) -> Cond {
        match bits & 0xF {
            0x0 => Cond::Eq,
            0x1 => Cond::Ne,
            0x2 => Cond::Cs,
            0x3 => Cond::Cc,
            0x4 => Cond::Mi,
            0x5 => Cond::Pl,
            0x6 => Cond::Vs,
            0x7 => Cond::Vc,
            0x8 => Cond::Hi,
            0x9 => Cond::Ls,
            0xA => Cond::Ge,
            0xB => Cond::Lt,
            0xC => Cond::Gt,
            0xD => Cond::Le,
            0xE => Cond::Al,
            _ => Cond::Nv,
        }
    }

    pub fn always(self) -> bool {
        matches!(self, Cond::Al | Cond::Nv)
    }
}

/// A register slot an operand can name: a guest register, the
/// next-instruction pointer, or one of the rename-pool scratch slots.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegRef {
    Guest(u8),
    NextPc,
    Scratch(u8),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ShiftBy {
    Imm(u32),
    Reg(RegRef),
}

/// Barrel shift attached to a register operand. The immediate amount keeps
/// the instruction-field encoding, so 0 means shift-by-32 or RRX depending
/// on the type.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ShiftSpec {
    pub ty: u32,
    pub by: ShiftBy,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Operand {
    #[default]
    None,
    Imm(u32),
    Reg {
        r: RegRef,
        shift: Option<ShiftSpec>,
    },
}

impl Operand {
    pub fn reg(r: RegRef) -> Operand {
        Operand::Reg { r, shift: None }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Operand::None)
    }

    pub fn imm(&self) -> Option<u32> {
        match self {
            Operand::Imm(v) => Some(*v),
            _ => None,
        }
    }
}

/// Operation kinds. The first sixteen mirror the data-processing subcode
/// numbering so the front-end can map bits 24..21 straight across.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpKind {
    And,
    Eor,
    Sub,
    Rsb,
    Add,
    Adc,
    Sbc,
    Rsc,
    Tst,
    Teq,
    Cmp,
    Cmn,
    Orr,
    Mov,
    Bic,
    Mvn,
    Ldr,
    Str,
    /// Store a new next-instruction pointer (branch of any flavour).
    B,
    Mrs,
    Msr,
    /// Run one opcode through the interpreter.
    Fallback,
    /// Begin a conditionally-skipped region.
    CondStart,
    /// End a conditionally-skipped region.
    CondEnd,
}

pub const DP_KINDS: [OpKind; 16] = [
    OpKind::And,
    OpKind::Eor,
    OpKind::Sub,
    OpKind::Rsb,
    OpKind::Add,
    OpKind::Adc,
    OpKind::Sbc,
    OpKind::Rsc,
    OpKind::Tst,
    OpKind::Teq,
    OpKind::Cmp,
    OpKind::Cmn,
    OpKind::Orr,
    OpKind::Mov,
    OpKind::Bic,
    OpKind::Mvn,
];

/// One virtualized operation.
#[derive(Clone, Copy, Debug)]
pub struct ArmOp {
    pub kind: OpKind,
    pub cond: Cond,
    pub set_flags: bool,
    pub rd: Operand,
    pub arg: [Operand; 3],
    /// Memory attributes (Ldr/Str only).
    pub pre_index: bool,
    pub add_offset: bool,
    pub byte_xfer: bool,
    pub write_back: bool,
    /// Mrs/Msr: operate on SPSR instead of CPSR.
    pub spsr: bool,
    /// Carry-out of a rotated-immediate second operand (`Some(bit 31)`
    /// when the encoding rotates), consumed by flag-setting logical ops.
    pub imm_carry: Option<u32>,
}

impl ArmOp {
    pub fn new(kind: OpKind) -> ArmOp {
        ArmOp {
            kind,
            cond: Cond::Al,
            set_flags: false,
            rd: Operand::None,
            arg: [Operand::None; 3],
            pre_index: false,
            add_offset: true,
            byte_xfer: false,
            write_back: false,
            spsr: false,
            imm_carry: None,
        }
    }

    /// Plain unconditional register/immediate move, used for rename loads
    /// and stores and for materialized constants.
    pub fn mov(rd: RegRef, src: Operand) -> ArmOp {
        let mut op = ArmOp::new(OpKind::Mov);
        op.rd = Operand::reg(rd);
        op.arg[0] = src;
        op
    }

    pub fn branch(target: Operand) -> ArmOp {
        let mut op = ArmOp::new(OpKind::B);
        op.arg[0] = target;
        op
    }

    pub fn cond_start(cond: Cond) -> ArmOp {
        let mut op = ArmOp::new(OpKind::CondStart);
        op.cond = cond;
        op
    }

    pub fn cond_end() -> ArmOp {
        ArmOp::new(OpKind::CondEnd)
    }

    /// Logical ops write C from the shifter, never V.
    pub fn is_logical(&self) -> bool {
        matches!(
            self.kind,
            OpKind::And
                | OpKind::Eor
                | OpKind::Tst
                | OpKind::Teq
                | OpKind::Orr
                | OpKind::Mov
                | OpKind::Bic
                | OpKind::Mvn
        )
    }

    pub fn is_data_processing(&self) -> bool {
        (self.kind as usize) <= (OpKind::Mvn as usize)
    }
}

impl fmt::Display for RegRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegRef::Guest(r) => write!(f, "r{r}"),
            RegRef::NextPc => write!(f, "pc'"),
            RegRef::Scratch(s) => write!(f, "s{s}"),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => write!(f, "_"),
            Operand::Imm(v) => write!(f, "#{v:#x}"),
            Operand::Reg { r, shift: None } => write!(f, "{r}"),
            Operand::Reg {
                r,
                shift: Some(shift),
            } => {
                let name = match shift.ty {
                    alu::SHIFT_LSL => "lsl",
                    alu::SHIFT_LSR => "lsr",
                    alu::SHIFT_ASR => "asr",
                    _ => "ror",
                };
                match shift.by {
                    ShiftBy::Imm(amount) => write!(f, "{r} {name} #{amount}"),
                    ShiftBy::Reg(rs) => write!(f, "{r} {name} {rs}"),
                }
            }
        }
    }
}

impl fmt::Display for ArmOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if self.set_flags {
            write!(f, "s")?;
        }
        if !self.cond.always() {
            write!(f, ".{:?}", self.cond)?;
        }
        if !self.rd.is_none() {
            write!(f, " {} <-", self.rd)?;
        }
        for arg in self.arg.iter().filter(|a| !a.is_none()) {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
