// Shared test harness: a CPU wired to a flat RAM buffer. Each test
// binary uses a different subset of it.
#![allow(dead_code)]

use core::ptr::NonNull;

use arm7di_rec::{Arm7Context, ExecMode, arm7_init, arm7_run, arm7_set_enabled};

pub const RAM_SIZE: usize = 64 * 1024;

pub struct TestCpu {
    pub ctx: Box<Arm7Context>,
    ram: Box<[u8]>,
}

impl TestCpu {
    pub fn new(mode: ExecMode) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut ram = vec![0u8; RAM_SIZE].into_boxed_slice();
        let mut ctx = Box::new(Arm7Context::new());
        ctx.attach_ram(
            NonNull::new(ram.as_mut_ptr()).unwrap(),
            (RAM_SIZE - 1) as u32,
        );
        arm7_init(&mut ctx);
        arm7_set_enabled(&mut ctx, true);
        ctx.exec_mode = mode;
        TestCpu { ctx, ram }
    }

    pub fn load(&mut self, addr: u32, words: &[u32]) {
        for (i, word) in words.iter().enumerate() {
            self.poke32(addr + (i as u32) * 4, *word);
        }
    }

    pub fn poke32(&mut self, addr: u32, value: u32) {
        let at = (addr as usize) & (RAM_SIZE - 1);
        self.ram[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn peek32(&self, addr: u32) -> u32 {
        let at = (addr as usize) & (RAM_SIZE - 1);
        u32::from_le_bytes(self.ram[at..at + 4].try_into().unwrap())
    }

    pub fn peek8(&self, addr: u32) -> u8 {
        self.ram[(addr as usize) & (RAM_SIZE - 1)]
    }

    pub fn run(&mut self, cycles: u32) {
        arm7_run(&mut self.ctx, cycles);
    }

    pub fn nzcv(&self) -> (bool, bool, bool, bool) {
        let flags = self.ctx.flags;
        (flags.n(), flags.z(), flags.c(), flags.v())
    }
}

/// Register/flag snapshot used for interpreter-vs-recompiler comparisons.
/// r15 is excluded (it is a pipeline artifact); `next_pc` is compared.
#[derive(Debug, PartialEq, Eq)]
pub struct CpuState {
    pub r: [u32; 15],
    pub next_pc: u32,
    pub nzcv: (bool, bool, bool, bool),
}

pub fn snapshot(cpu: &TestCpu) -> CpuState {
    CpuState {
        r: cpu.ctx.r[..15].try_into().unwrap(),
        next_pc: cpu.ctx.next_pc,
        nzcv: {
            let flags = cpu.ctx.flags;
            (flags.n(), flags.z(), flags.c(), flags.v())
        },
    }
}

/// Branch-to-self, used to terminate recompiled blocks.
pub const B_SELF: u32 = 0xEAFF_FFFE;

/// Run `program` (which must not alter control flow) through both
/// strategies from identical seeded states and require identical end
/// states. A branch-to-self is appended to terminate the block.
pub fn assert_equivalent(program: &[u32], seed: impl Fn(&mut Arm7Context)) {
    let mut interp = TestCpu::new(ExecMode::Interpret);
    let mut rec = TestCpu::new(ExecMode::Recompile);

    for cpu in [&mut interp, &mut rec] {
        let mut code = program.to_vec();
        code.push(B_SELF);
        cpu.load(0, &code);
        seed(&mut cpu.ctx);
    }

    // One interpreted opcode per budget tick; the recompiler executes the
    // whole block on any positive budget.
    interp.run(program.len() as u32);
    rec.run(1);

    assert_eq!(
        snapshot(&interp),
        snapshot(&rec),
        "interpreter and recompiler disagree for {program:08X?}"
    );
}
