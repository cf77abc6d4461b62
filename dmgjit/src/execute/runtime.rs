use anyhow::Result;

use super::bus::DmgBus;
use super::jit::JitCompiler;
use super::sm83::{CpuState, GuestAddr};

/// Execution statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct JitStats {
    pub blocks_compiled: usize,
    pub blocks_executed: u64,
    pub cache_hits: u64,
}

impl JitStats {
    /// Fraction of block dispatches served from the cache.
    pub fn reuse_ratio(&self) -> f64 {
        if self.blocks_executed == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.blocks_executed as f64
        }
    }
}

/// Drives translated code: looks up (or compiles) the block at the guest
/// program counter, invokes it natively, and resumes at whatever pc the
/// block left behind.
///
/// Owns the register file and the bus behind boxes so their addresses stay
/// fixed; compiled blocks bake those addresses in as absolute operands.
/// Single thread of control: a block is fully compiled before any attempt
/// to invoke it.
pub struct JitRuntime {
    state: Box<CpuState>,
    bus: Box<DmgBus>,
    compiler: JitCompiler,
    blocks_executed: u64,
    cache_hits: u64,
}

impl JitRuntime {
    pub fn new(bus: DmgBus) -> Result<Self> {
        let mut state = Box::new(CpuState::default());
        let compiler = JitCompiler::new(&mut *state)?;
        Ok(Self {
            state,
            bus: Box::new(bus),
            compiler,
            blocks_executed: 0,
            cache_hits: 0,
        })
    }

    /// Dispatch one block at the current pc. Returns the block's status
    /// sentinel.
    pub fn step(&mut self) -> Result<i32> {
        let pc = GuestAddr(self.state.pc);
        if self.compiler.lookup(pc).is_some() {
            self.cache_hits += 1;
        }
        let block = *self.compiler.get_or_compile(&mut *self.bus, pc)?;
        let status = unsafe { (block.entry())() };
        self.blocks_executed += 1;
        Ok(status)
    }

    /// Dispatch blocks until the optional limit is reached. A compilation
    /// fault ends the run with the error.
    pub fn run(&mut self, max_blocks: Option<u64>) -> Result<()> {
        loop {
            if let Some(limit) = max_blocks {
                if self.blocks_executed >= limit {
                    return Ok(());
                }
            }
            self.step()?;
        }
    }

    pub fn state(&self) -> &CpuState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut CpuState {
        &mut self.state
    }

    pub fn bus(&self) -> &DmgBus {
        &self.bus
    }

    pub fn compiler(&self) -> &JitCompiler {
        &self.compiler
    }

    pub fn compiler_mut(&mut self) -> &mut JitCompiler {
        &mut self.compiler
    }

    pub fn stats(&self) -> JitStats {
        JitStats {
            blocks_compiled: self.compiler.blocks_compiled(),
            blocks_executed: self.blocks_executed,
            cache_hits: self.cache_hits,
        }
    }
}
