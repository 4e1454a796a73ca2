//! ARM7DI (ARMv3, no Thumb) CPU core with an interpreter and a dynamic
//! recompiler.
//!
//! The core targets the flavour of ARM7 found as a sound CPU in larger
//! systems: it executes ARM state only, has no coprocessors (coprocessor
//! encodings take the undefined-instruction trap) and is driven
//! cooperatively for a cycle budget per call.
//!
//! Two execution strategies share one register file and one semantic ground
//! truth: [`interp`] decodes and executes a single opcode at a time, while
//! [`rec`] groups opcodes into translation blocks, virtualizes them into a
//! micro-op stream and hands that to a pluggable [`backend::Arm7Backend`]
//! for emission. Anything the recompiler does not virtualize falls back to
//! the interpreter, one opcode at a time.

#![allow(clippy::too_many_arguments)]

use core::ptr::NonNull;

use bitfield::bitfield;
use log::warn;

pub mod alu;
pub mod armop;
pub mod backend;
pub mod decode;
pub mod interp;
pub(crate) mod ops;
pub mod rec;

use backend::{Arm7Backend, BlockEntry, FnsBackend};

/// Guest address space wrap. The sound RAM always wraps to 8 MB no matter
/// how much is actually populated, so the block lookup table is sized to
/// the full wrap region and the dispatcher never has to care about the
/// real RAM size.
pub const ARAM_SIZE_MAX: u32 = 8 << 20;

/// Capacity of the compiled-code arena.
pub const ICACHE_SIZE: usize = 1 << 20;

bitfield! {
    /// Program status word: condition flags, interrupt masks, mode field.
    #[repr(C)]
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct ArmPsr(u32);
    impl Debug;

    pub u32, raw, set_raw: 31, 0;
    pub n, set_n: 31;
    pub z, set_z: 30;
    pub c, set_c: 29;
    pub v, set_v: 28;
    pub irq_masked, set_irq_masked: 7;
    pub fiq_masked, set_fiq_masked: 6;
    pub u32, mode_bits, set_mode_bits: 4, 0;
}

impl Default for ArmPsr {
    fn default() -> Self {
        ArmPsr(0)
    }
}

/// CPU privilege modes. System shares the User register bank.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum Mode {
    Usr = 0x10,
    Fiq = 0x11,
    Irq = 0x12,
    Svc = 0x13,
    Abt = 0x17,
    Und = 0x1B,
    Sys = 0x1F,
}

impl Mode {
    pub fn from_bits(bits: u32) -> Option<Mode> {
        match bits & 0x1F {
            0x10 => Some(Mode::Usr),
            0x11 => Some(Mode::Fiq),
            0x12 => Some(Mode::Irq),
            0x13 => Some(Mode::Svc),
            0x17 => Some(Mode::Abt),
            0x1B => Some(Mode::Und),
            0x1F => Some(Mode::Sys),
            _ => None,
        }
    }

    /// Index into the banked-register snapshot table.
    pub fn bank(self) -> usize {
        match self {
            Mode::Usr | Mode::Sys => BANK_USR,
            Mode::Fiq => BANK_FIQ,
            Mode::Irq => BANK_IRQ,
            Mode::Svc => BANK_SVC,
            Mode::Abt => BANK_ABT,
            Mode::Und => BANK_UND,
        }
    }

    pub fn has_spsr(self) -> bool {
        !matches!(self, Mode::Usr | Mode::Sys)
    }
}

pub const BANK_USR: usize = 0;
pub const BANK_FIQ: usize = 1;
pub const BANK_IRQ: usize = 2;
pub const BANK_SVC: usize = 3;
pub const BANK_ABT: usize = 4;
pub const BANK_UND: usize = 5;
pub const BANK_COUNT: usize = 6;

/// Saved snapshot of one mode's private registers.
///
/// `r8` (r8..r12) is only split between the User and FIQ banks; the other
/// privileged modes share the User copies and only bank r13/r14/SPSR.
#[derive(Clone, Copy, Default)]
#[repr(C)]
pub struct Banked {
    pub r8: [u32; 5],
    pub r13: u32,
    pub r14: u32,
    pub spsr: u32,
}

/// Callback types for guest memory / device access. The context pointer is
/// the CPU context itself so a handler can reach whatever it stashed there.
pub type Read8Fn = fn(addr: u32, ctx: &mut Arm7Context) -> u8;
pub type Read16Fn = fn(addr: u32, ctx: &mut Arm7Context) -> u16;
pub type Read32Fn = fn(addr: u32, ctx: &mut Arm7Context) -> u32;
pub type Write8Fn = fn(addr: u32, value: u8, ctx: &mut Arm7Context);
pub type Write16Fn = fn(addr: u32, value: u16, ctx: &mut Arm7Context);
pub type Write32Fn = fn(addr: u32, value: u32, ctx: &mut Arm7Context);

/// Heuristic cycle costs used by the recompiler's per-block estimate and
/// the interpreter's budget accounting. These are predictors, not timing.
#[derive(Clone, Copy, Debug)]
pub struct CycleCosts {
    /// Base cost charged per recompiled instruction.
    pub op: u32,
    /// Extra cost for branches.
    pub branch: u32,
    /// Extra cost for loads.
    pub load: u32,
    /// Extra cost for stores.
    pub store: u32,
    /// Extra cost for status-register writes.
    pub msr: u32,
    /// Cost of one interpreted opcode.
    pub interp_op: u32,
    /// Cost of an exception entry in the interpreter.
    pub exception: u32,
}

impl Default for CycleCosts {
    fn default() -> Self {
        Self {
            op: 6,
            branch: 3,
            load: 4,
            store: 3,
            msr: 1,
            interp_op: 1,
            exception: 4,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExecMode {
    Interpret,
    Recompile,
}

/// The whole CPU: register file, mode state machine, memory hooks and the
/// recompiler state. Owned by the caller and passed to every entry point;
/// there are no process-wide singletons.
///
/// Compiled blocks embed addresses of fields of this struct, so once
/// [`arm7_init`] has run the context must not move. Keep it in a `Box`.
#[repr(C)]
pub struct Arm7Context {
    /// Active register bank. `r[15]` holds the pipeline view of the program
    /// counter (`next_pc + 8`) while an opcode executes.
    pub r: [u32; 16],
    /// Address of the next opcode to fetch.
    pub next_pc: u32,
    /// Composite status word, synced from `flags` on demand.
    pub cpsr: ArmPsr,
    /// Active saved status word for the current mode.
    pub spsr: ArmPsr,
    /// Live status word the flag-setting ops read and write.
    pub flags: ArmPsr,
    /// FIQ pending latch: external line AND fiq enable.
    pub intr_pend: u32,
    /// Remaining cycle budget. May go negative; the deficit carries over
    /// into the next `run` call so accounting stays exact.
    pub cycle_count: i32,
    /// Rename pool backing store for virtualized data-processing ops.
    pub scratch: [u32; 8],
    /// Emitter-internal temporaries (address, offset, writeback, data).
    pub temp: [u32; 4],
    /// Barrel-shifter carry-out latch feeding logical flag writes.
    pub shifter_carry: u32,

    pub mode: Mode,
    pub irq_enable: bool,
    pub fiq_enable: bool,
    /// External FIQ input line, driven by the host interrupt controller.
    pub fiq_line: bool,
    pub enabled: bool,
    pub running: bool,
    banks: [Banked; BANK_COUNT],

    /// Direct guest RAM for quick instruction fetch, with its wrap mask.
    pub ram: Option<NonNull<u8>>,
    pub ram_mask: u32,
    pub read8: Option<Read8Fn>,
    pub read16: Option<Read16Fn>,
    pub read32: Option<Read32Fn>,
    pub write8: Option<Write8Fn>,
    pub write16: Option<Write16Fn>,
    pub write32: Option<Write32Fn>,

    pub costs: CycleCosts,
    pub exec_mode: ExecMode,

    /// Compiled-block lookup, one entry per word of the wrap region.
    /// Null means "not yet compiled".
    pub entry_points: Vec<BlockEntry>,
    pub backend: Box<dyn Arm7Backend>,
    /// Number of block compilations since the last flush was observable.
    pub compile_count: u64,
}

impl Default for Arm7Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Arm7Context {
    pub fn new() -> Self {
        Self {
            r: [0; 16],
            next_pc: 0,
            cpsr: ArmPsr(0),
            spsr: ArmPsr(0),
            flags: ArmPsr(0),
            intr_pend: 0,
            cycle_count: 0,
            scratch: [0; 8],
            temp: [0; 4],
            shifter_carry: 0,
            mode: Mode::Svc,
            irq_enable: false,
            fiq_enable: false,
            fiq_line: false,
            enabled: false,
            running: false,
            banks: [Banked::default(); BANK_COUNT],
            ram: None,
            ram_mask: 0,
            read8: None,
            read16: None,
            read32: None,
            write8: None,
            write16: None,
            write32: None,
            costs: CycleCosts::default(),
            exec_mode: ExecMode::Recompile,
            entry_points: Vec::new(),
            backend: Box::new(FnsBackend::new(ICACHE_SIZE)),
            compile_count: 0,
        }
    }

    /// Point the core at a flat guest RAM. Used for instruction fetch and
    /// as the default data path when no handlers are installed.
    pub fn attach_ram(&mut self, ram: NonNull<u8>, mask: u32) {
        self.ram = Some(ram);
        self.ram_mask = mask;
    }

    #[inline]
    pub fn fetch32(&mut self, addr: u32) -> u32 {
        if let Some(ptr) = self.ram {
            let mask = self.ram_mask;
            unsafe {
                let base = ptr.as_ptr().add((addr & mask & !3) as usize);
                u32::from_le_bytes([
                    base.read(),
                    base.add(1).read(),
                    base.add(2).read(),
                    base.add(3).read(),
                ])
            }
        } else {
            self.read32(addr)
        }
    }

    #[inline]
    pub fn read8(&mut self, addr: u32) -> u8 {
        if let Some(cb) = self.read8 {
            cb(addr, self)
        } else if let Some(ptr) = self.ram {
            let mask = self.ram_mask;
            unsafe { ptr.as_ptr().add((addr & mask) as usize).read() }
        } else {
            0
        }
    }

    #[inline]
    pub fn read16(&mut self, addr: u32) -> u16 {
        if let Some(cb) = self.read16 {
            cb(addr, self)
        } else if let Some(ptr) = self.ram {
            let mask = self.ram_mask;
            unsafe {
                let base = ptr.as_ptr().add((addr & mask & !1) as usize);
                u16::from_le_bytes([base.read(), base.add(1).read()])
            }
        } else {
            0
        }
    }

    #[inline]
    pub fn read32(&mut self, addr: u32) -> u32 {
        if let Some(cb) = self.read32 {
            cb(addr, self)
        } else if let Some(ptr) = self.ram {
            let mask = self.ram_mask;
            unsafe {
                let base = ptr.as_ptr().add((addr & mask & !3) as usize);
                u32::from_le_bytes([
                    base.read(),
                    base.add(1).read(),
                    base.add(2).read(),
                    base.add(3).read(),
                ])
            }
        } else {
            0
        }
    }

    #[inline]
    pub fn write8(&mut self, addr: u32, value: u8) {
        if let Some(cb) = self.write8 {
            cb(addr, value, self);
        } else if let Some(ptr) = self.ram {
            let mask = self.ram_mask;
            unsafe { ptr.as_ptr().add((addr & mask) as usize).write(value) }
        }
    }

    #[inline]
    pub fn write16(&mut self, addr: u32, value: u16) {
        if let Some(cb) = self.write16 {
            cb(addr, value, self);
        } else if let Some(ptr) = self.ram {
            let mask = self.ram_mask;
            unsafe {
                let base = ptr.as_ptr().add((addr & mask & !1) as usize);
                let bytes = value.to_le_bytes();
                base.write(bytes[0]);
                base.add(1).write(bytes[1]);
            }
        }
    }

    #[inline]
    pub fn write32(&mut self, addr: u32, value: u32) {
        if let Some(cb) = self.write32 {
            cb(addr, value, self);
        } else if let Some(ptr) = self.ram {
            let mask = self.ram_mask;
            unsafe {
                let base = ptr.as_ptr().add((addr & mask & !3) as usize);
                let bytes = value.to_le_bytes();
                base.write(bytes[0]);
                base.add(1).write(bytes[1]);
                base.add(2).write(bytes[2]);
                base.add(3).write(bytes[3]);
            }
        }
    }

    /// Redirect execution: aligns the target and refreshes the pipeline
    /// view in `r[15]`.
    #[inline]
    pub fn write_pc(&mut self, value: u32) {
        let aligned = value & !3;
        self.next_pc = aligned;
        self.r[15] = aligned.wrapping_add(8);
    }

    /// Rebuild the composite CPSR from the live flags, enables and mode.
    pub fn update_cpsr(&mut self) {
        let mut cpsr = ArmPsr(self.flags.raw() & 0xF000_0000);
        cpsr.set_irq_masked(!self.irq_enable);
        cpsr.set_fiq_masked(!self.fiq_enable);
        cpsr.set_mode_bits(self.mode as u32);
        self.cpsr = cpsr;
    }

    /// Derive the live flags, enables and interrupt latch from the CPSR.
    pub fn update_flags(&mut self) {
        self.flags = self.cpsr;
        self.irq_enable = !self.cpsr.irq_masked();
        self.fiq_enable = !self.cpsr.fiq_masked();
        self.update_intc();
    }

    /// Recompute the FIQ pending latch from the external line.
    pub fn update_intc(&mut self) {
        self.intr_pend = (self.fiq_line && self.fiq_enable) as u32;
    }

    /// Read a register as User mode sees it, regardless of current mode.
    /// Used by the S-bit block transfers.
    pub(crate) fn user_reg(&self, reg: usize) -> u32 {
        match reg {
            8..=12 if self.mode == Mode::Fiq => self.banks[BANK_USR].r8[reg - 8],
            13 if self.mode.has_spsr() => self.banks[BANK_USR].r13,
            14 if self.mode.has_spsr() => self.banks[BANK_USR].r14,
            _ => self.r[reg],
        }
    }

    pub(crate) fn set_user_reg(&mut self, reg: usize, value: u32) {
        match reg {
            8..=12 if self.mode == Mode::Fiq => self.banks[BANK_USR].r8[reg - 8] = value,
            13 if self.mode.has_spsr() => self.banks[BANK_USR].r13 = value,
            14 if self.mode.has_spsr() => self.banks[BANK_USR].r14 = value,
            _ => self.r[reg] = value,
        }
    }

    fn save_banked(&mut self, mode: Mode) {
        let bank = mode.bank();
        match mode {
            Mode::Fiq => {
                self.banks[bank].r8.copy_from_slice(&self.r[8..13]);
            }
            _ => {
                // r8..r12 are shared by every non-FIQ mode and live in the
                // User snapshot while FIQ is active.
                self.banks[BANK_USR].r8.copy_from_slice(&self.r[8..13]);
            }
        }
        self.banks[bank].r13 = self.r[13];
        self.banks[bank].r14 = self.r[14];
    }

    fn load_banked(&mut self, mode: Mode) {
        let bank = mode.bank();
        match mode {
            Mode::Fiq => {
                self.r[8..13].copy_from_slice(&self.banks[bank].r8);
            }
            _ => {
                self.r[8..13].copy_from_slice(&self.banks[BANK_USR].r8);
            }
        }
        self.r[13] = self.banks[bank].r13;
        self.r[14] = self.banks[bank].r14;
    }

    /// Switch privilege mode, transactionally swapping the banked
    /// registers and the saved status word.
    ///
    /// `save_state` distinguishes a fresh exception entry (the target
    /// SPSR is seeded from the outgoing CPSR) from an administrative
    /// switch or return (the target mode's saved SPSR is reloaded).
    pub fn switch_mode(&mut self, mode: Mode, save_state: bool) {
        self.update_cpsr();
        let old_cpsr = self.cpsr;
        let old_mode = self.mode;

        self.save_banked(old_mode);
        self.banks[old_mode.bank()].spsr = self.spsr.raw();

        let mut cpsr = self.cpsr;
        cpsr.set_mode_bits(mode as u32);
        self.cpsr = cpsr;
        self.mode = mode;

        self.load_banked(mode);

        self.spsr = if !mode.has_spsr() || save_state {
            old_cpsr
        } else {
            ArmPsr(self.banks[mode.bank()].spsr)
        };

        self.update_flags();
    }

    /// FIQ entry. Serviced between opcodes / blocks, when `next_pc` is the
    /// address of the next instruction to execute.
    pub fn enter_fiq(&mut self) {
        if !self.fiq_enable {
            return;
        }
        let ret = self.next_pc.wrapping_add(4);
        self.switch_mode(Mode::Fiq, true);
        self.r[14] = ret;
        self.cpsr.set_irq_masked(true);
        self.cpsr.set_fiq_masked(true);
        self.update_flags();
        self.write_pc(0x1C);
    }

    /// Software-interrupt entry, taken while the faulting opcode executes
    /// (`next_pc` already advanced past it).
    pub fn enter_swi(&mut self) {
        let ret = self.next_pc;
        self.switch_mode(Mode::Svc, true);
        self.r[14] = ret;
        self.cpsr.set_irq_masked(true);
        self.update_flags();
        self.write_pc(0x08);
    }

    /// Undefined-instruction trap. A guest-visible exception, not a host
    /// error; coprocessor encodings land here too.
    pub fn enter_undefined(&mut self) {
        warn!(
            "arm7: undefined instruction trap at {:08X}",
            self.next_pc.wrapping_sub(4)
        );
        let ret = self.next_pc;
        self.switch_mode(Mode::Und, true);
        self.r[14] = ret;
        self.cpsr.set_irq_masked(true);
        self.update_flags();
        self.write_pc(0x04);
    }
}

/// One-time setup: allocates the block lookup table and puts the CPU in
/// reset state. Must run before `arm7_run`/`arm7_step`.
pub fn arm7_init(ctx: &mut Arm7Context) {
    ctx.entry_points = vec![core::ptr::null(); (ARAM_SIZE_MAX / 4) as usize];
    arm7_reset(ctx, true);
}

/// Reset the CPU core. Always flushes the compiled-code cache; a hard
/// reset additionally drops the external interrupt line latch.
pub fn arm7_reset(ctx: &mut Arm7Context, hard: bool) {
    arm7_flush_cache(ctx);

    if hard {
        ctx.fiq_line = false;
    }

    ctx.enabled = false;
    ctx.r = [0; 16];
    ctx.banks = [Banked::default(); BANK_COUNT];
    ctx.scratch = [0; 8];
    ctx.temp = [0; 4];
    ctx.shifter_carry = 0;
    ctx.cycle_count = 0;
    ctx.spsr = ArmPsr(0);
    ctx.flags = ArmPsr(0);

    ctx.mode = Mode::Svc;
    ctx.r[13] = 0x0300_7F00;
    ctx.banks[BANK_IRQ].r13 = 0x0300_7FA0;
    ctx.banks[BANK_SVC].r13 = 0x0300_7FE0;
    ctx.irq_enable = true;
    ctx.fiq_enable = false;
    ctx.update_cpsr();
    ctx.flags = ctx.cpsr;
    ctx.update_intc();

    ctx.next_pc = 0;
    ctx.r[15] = 4;
}

/// Enable or disable the core. Enabling a disabled core resets it first;
/// disabling takes effect at the next budget check, it does not preempt an
/// in-flight block.
pub fn arm7_set_enabled(ctx: &mut Arm7Context, enabled: bool) {
    if !ctx.enabled && enabled {
        arm7_reset(ctx, false);
    }
    ctx.enabled = enabled;
}

/// Drive the external FIQ input line.
pub fn arm7_set_fiq_line(ctx: &mut Arm7Context, level: bool) {
    ctx.fiq_line = level;
    ctx.update_intc();
}

/// Throw away all compiled code. Every guest address needs recompilation
/// before it executes again.
pub fn arm7_flush_cache(ctx: &mut Arm7Context) {
    ctx.backend.flush();
    for entry in ctx.entry_points.iter_mut() {
        *entry = core::ptr::null();
    }
}

/// Execute for (at least) `cycles` guest cycles, then return. Strategy is
/// picked by `ctx.exec_mode`.
pub fn arm7_run(ctx: &mut Arm7Context, cycles: u32) {
    if !ctx.enabled {
        return;
    }
    ctx.running = true;
    match ctx.exec_mode {
        ExecMode::Interpret => interp::run(ctx, cycles),
        ExecMode::Recompile => {
            ctx.cycle_count = ctx.cycle_count.wrapping_add(cycles as i32);
            let ptr: *mut Arm7Context = ctx;
            unsafe { rec_dispatcher(ptr) };
        }
    }
    ctx.running = false;
}

/// Execute exactly one opcode through the interpreter. Diagnostic path;
/// logs and does nothing when the core is inside `arm7_run`.
pub fn arm7_step(ctx: &mut Arm7Context) {
    if ctx.running {
        warn!("arm7: step() ignored, core is running");
        return;
    }
    if !ctx.enabled {
        return;
    }
    if ctx.intr_pend != 0 {
        ctx.enter_fiq();
    }
    interp::step_one(ctx);
}

/// Central dispatch loop: look up (compiling on miss) and invoke the block
/// at `next_pc`, charge the cycles it reports, service FIQs in between.
/// Compiled blocks always return here; there is no block chaining.
unsafe fn rec_dispatcher(ctx: *mut Arm7Context) {
    unsafe {
        while (*ctx).cycle_count > 0 {
            if !(*ctx).enabled {
                break;
            }
            if (*ctx).intr_pend != 0 {
                (*ctx).enter_fiq();
                continue;
            }

            let idx = (((*ctx).next_pc & (ARAM_SIZE_MAX - 1)) >> 2) as usize;
            let mut entry = (&(*ctx).entry_points)[idx];
            if entry.is_null() {
                entry = match rec::compile_block(ctx) {
                    Ok(entry) => entry,
                    Err(err) => panic!("arm7: {err}"),
                };
            }

            let used = (*ctx).backend.execute(entry);
            (*ctx).cycle_count -= used as i32;
        }
    }
}
