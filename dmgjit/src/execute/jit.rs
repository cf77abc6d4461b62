use std::collections::HashMap;
use std::mem::offset_of;
use std::path::PathBuf;

use anyhow::{bail, Result};

use super::bus::MemoryBus;
use super::sm83::{
    apply_flags, decode, decode_cb, CpuState, Fault, FlagClass, GuestAddr, OpKind, FLAG_C, FLAG_Z,
    OP_PREFIX_CB,
};

/// Host general-purpose registers, numbered as they encode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HostReg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
}

impl HostReg {
    fn idx(self) -> u8 {
        self as u8
    }
}

/// Legacy 8-bit registers reachable without a REX prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum HostReg8 {
    Al = 0,
    Dl = 2,
    Bl = 3,
    Bh = 7,
}

impl HostReg8 {
    fn idx(self) -> u8 {
        self as u8
    }
}

/// Register saved across a block: every legacy GPR except the stack pointer.
/// Deliberately conservative; the epilogue pops in reverse.
const SAVED_REGS: [HostReg; 7] = [
    HostReg::Rax,
    HostReg::Rcx,
    HostReg::Rdx,
    HostReg::Rbx,
    HostReg::Rbp,
    HostReg::Rsi,
    HostReg::Rdi,
];

// State-field displacements baked into emitted addressing bytes.
const OFF_SP: u8 = offset_of!(CpuState, sp) as u8;
const OFF_A: u8 = offset_of!(CpuState, a) as u8;
const OFF_H: u8 = offset_of!(CpuState, h) as u8;
const OFF_L: u8 = offset_of!(CpuState, l) as u8;
const OFF_F: u8 = offset_of!(CpuState, f) as u8;
const OFF_PC: u8 = offset_of!(CpuState, pc) as u8;

/// Status sentinel a compiled block leaves in eax.
pub const BLOCK_EXIT_OK: i32 = 0;

/// Native signature of a compiled block.
pub type HostFn = unsafe extern "C" fn() -> i32;

/// x86-64 code generator.
///
/// Each primitive appends one canonical host instruction to an internal
/// buffer; nothing touches executable memory until the buffer is sealed
/// into the arena. Operand ranges are checked before encoding so a bad
/// operand fails loudly here instead of corrupting the byte stream.
pub struct X86Emitter {
    code: Vec<u8>,
}

impl X86Emitter {
    pub fn new() -> Self {
        Self { code: Vec::new() }
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    fn put8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    fn put16(&mut self, value: u16) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn put32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn put64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Indirect operand through a register: mod=00, no SIB, no displacement.
    /// rsp and rbp cannot encode this form (their slots mean SIB / disp32).
    fn mem_operand(ptr: HostReg) -> u8 {
        assert!(
            !matches!(ptr, HostReg::Rsp | HostReg::Rbp),
            "{ptr:?} cannot address memory without a displacement"
        );
        ptr.idx()
    }

    /// lea reg, [rbp + disp8]: address of a state field off the pinned base.
    pub fn lea_state_field(&mut self, reg: HostReg, disp: u8) {
        self.put8(0x48);
        self.put8(0x8D);
        self.put8(0x40 | (reg.idx() << 3) | 0x05);
        self.put8(disp);
    }

    /// mov byte ptr [ptr], imm8
    pub fn mov_mem8_imm(&mut self, ptr: HostReg, imm: u8) {
        self.put8(0xC6);
        self.put8(Self::mem_operand(ptr));
        self.put8(imm);
    }

    /// mov word ptr [ptr], imm16
    pub fn mov_mem16_imm(&mut self, ptr: HostReg, imm: u16) {
        self.put8(0x66);
        self.put8(0xC7);
        self.put8(Self::mem_operand(ptr));
        self.put16(imm);
    }

    /// mov dst, src (64-bit)
    pub fn mov_reg_reg(&mut self, dst: HostReg, src: HostReg) {
        self.put8(0x48);
        self.put8(0x89);
        self.put8(0xC0 | (src.idx() << 3) | dst.idx());
    }

    /// mov r8, byte ptr [ptr]
    pub fn mov_r8_mem(&mut self, dst: HostReg8, ptr: HostReg) {
        self.put8(0x8A);
        self.put8((dst.idx() << 3) | Self::mem_operand(ptr));
    }

    /// mov byte ptr [ptr], r8
    pub fn mov_mem_r8(&mut self, ptr: HostReg, src: HostReg8) {
        self.put8(0x88);
        self.put8((src.idx() << 3) | Self::mem_operand(ptr));
    }

    /// movabs reg, imm64. The only way an absolute address enters a block.
    pub fn mov_reg_imm64(&mut self, reg: HostReg, imm: u64) {
        self.put8(0x48);
        self.put8(0xB8 + reg.idx());
        self.put64(imm);
    }

    /// mov reg, imm32 (sign-extended to 64 bits)
    pub fn mov_reg_imm32(&mut self, reg: HostReg, imm: u32) {
        self.put8(0x48);
        self.put8(0xC7);
        self.put8(0xC0 | reg.idx());
        self.put32(imm);
    }

    /// call reg
    pub fn call_reg(&mut self, reg: HostReg) {
        self.put8(0xFF);
        self.put8(0xD0 | reg.idx());
    }

    /// jnz rel8
    pub fn jnz_short(&mut self, offset: i8) {
        self.put8(0x75);
        self.put8(offset as u8);
    }

    /// jz rel8
    pub fn jz_short(&mut self, offset: i8) {
        self.put8(0x74);
        self.put8(offset as u8);
    }

    /// inc word ptr [ptr]
    pub fn inc_mem16(&mut self, ptr: HostReg) {
        self.put8(0x66);
        self.put8(0xFF);
        self.put8(Self::mem_operand(ptr));
    }

    /// add word ptr [ptr], imm8 (sign-extended to 16 bits)
    pub fn add_mem16_imm8(&mut self, ptr: HostReg, imm: i8) {
        self.put8(0x66);
        self.put8(0x83);
        self.put8(Self::mem_operand(ptr));
        self.put8(imm as u8);
    }

    /// dec reg (64-bit)
    pub fn dec_reg(&mut self, reg: HostReg) {
        self.put8(0x48);
        self.put8(0xFF);
        self.put8(0xC8 | reg.idx());
    }

    /// push reg
    pub fn push_reg(&mut self, reg: HostReg) {
        self.put8(0x50 + reg.idx());
    }

    /// pop reg
    pub fn pop_reg(&mut self, reg: HostReg) {
        self.put8(0x58 + reg.idx());
    }

    /// and al, imm8
    pub fn and_al_imm(&mut self, imm: u8) {
        self.put8(0x24);
        self.put8(imm);
    }

    /// ret
    pub fn ret(&mut self) {
        self.put8(0xC3);
    }
}

impl Default for X86Emitter {
    fn default() -> Self {
        Self::new()
    }
}

/// Flag condition of a conditional relative jump.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JrCond {
    Nz,
    Z,
    Nc,
    C,
}

impl JrCond {
    fn mask(self) -> u8 {
        match self {
            JrCond::Nz | JrCond::Z => FLAG_Z,
            JrCond::Nc | JrCond::C => FLAG_C,
        }
    }

    /// Whether the jump is skipped when the tested flag is set.
    fn skip_when_set(self) -> bool {
        matches!(self, JrCond::Nz | JrCond::Nc)
    }
}

// Guest-to-host opcode templates. Every template assumes rbp holds the
// state base (established by the prologue) and that the pc increments for
// all consumed bytes were already emitted.
impl X86Emitter {
    /// Save the conservative register set and pin the state base in rbp.
    pub fn emit_block_prologue(&mut self, state: *const CpuState) {
        for reg in SAVED_REGS {
            self.push_reg(reg);
        }
        self.mov_reg_imm64(HostReg::Rax, state as u64);
        self.mov_reg_reg(HostReg::Rbp, HostReg::Rax);
    }

    /// Restore saved registers in reverse, set the status sentinel, return.
    pub fn emit_block_epilogue(&mut self) {
        for reg in SAVED_REGS.iter().rev() {
            self.pop_reg(*reg);
        }
        self.mov_reg_imm32(HostReg::Rax, BLOCK_EXIT_OK as u32);
        self.ret();
    }

    /// pc += 1, one per consumed guest byte.
    pub fn emit_pc_bump(&mut self) {
        self.lea_state_field(HostReg::Rax, OFF_PC);
        self.inc_mem16(HostReg::Rax);
    }

    /// ld hl, u16 as two independent byte stores.
    pub fn emit_ld_hl_imm16(&mut self, value: u16) {
        self.lea_state_field(HostReg::Rax, OFF_H);
        self.mov_mem8_imm(HostReg::Rax, (value >> 8) as u8);
        self.lea_state_field(HostReg::Rax, OFF_L);
        self.mov_mem8_imm(HostReg::Rax, value as u8);
    }

    /// ld sp, u16
    pub fn emit_ld_sp_imm16(&mut self, value: u16) {
        self.lea_state_field(HostReg::Rax, OFF_SP);
        self.mov_mem16_imm(HostReg::Rax, value);
    }

    /// xor a: the accumulator clears and the flag byte becomes exactly "zero set".
    pub fn emit_xor_a(&mut self) {
        self.lea_state_field(HostReg::Rax, OFF_A);
        self.mov_mem8_imm(HostReg::Rax, 0);
        self.lea_state_field(HostReg::Rax, OFF_F);
        self.mov_mem8_imm(HostReg::Rax, FLAG_Z);
    }

    /// jr [cc,] i8. The pc already points past the instruction, so the add
    /// lands on end-of-instruction + offset. The conditional form tests one
    /// flag bit and skips the add over a fixed-size run.
    pub fn emit_jr(&mut self, cond: Option<JrCond>, offset: i8) {
        // lea (4 bytes) + 16-bit add (4 bytes).
        const SKIP: i8 = 8;
        if let Some(cond) = cond {
            self.lea_state_field(HostReg::Rax, OFF_F);
            self.mov_reg_imm32(HostReg::Rbx, 0);
            self.mov_r8_mem(HostReg8::Bl, HostReg::Rax);
            self.mov_reg_reg(HostReg::Rax, HostReg::Rbx);
            self.and_al_imm(cond.mask());
            if cond.skip_when_set() {
                self.jnz_short(SKIP);
            } else {
                self.jz_short(SKIP);
            }
        }
        self.lea_state_field(HostReg::Rax, OFF_PC);
        self.add_mem16_imm8(HostReg::Rax, offset);
    }

    /// ld (hl-), a. The store goes through the bus call so every
    /// memory-mapped write funnels through one policy point, then the pair
    /// decrements. HL lives in rbx across the call: callee-saved, and
    /// zero-extended so the pair wraps correctly on decrement.
    pub fn emit_ld_hl_dec_a(&mut self, bus: u64, bus_write8: u64) {
        self.mov_reg_imm32(HostReg::Rbx, 0);
        self.lea_state_field(HostReg::Rax, OFF_H);
        self.mov_r8_mem(HostReg8::Bh, HostReg::Rax);
        self.lea_state_field(HostReg::Rax, OFF_L);
        self.mov_r8_mem(HostReg8::Bl, HostReg::Rax);
        self.mov_reg_imm32(HostReg::Rdx, 0);
        self.lea_state_field(HostReg::Rax, OFF_A);
        self.mov_r8_mem(HostReg8::Dl, HostReg::Rax);
        self.mov_reg_reg(HostReg::Rsi, HostReg::Rbx);
        self.mov_reg_imm64(HostReg::Rdi, bus);
        self.mov_reg_imm64(HostReg::Rax, bus_write8);
        self.call_reg(HostReg::Rax);
        self.dec_reg(HostReg::Rbx);
        self.lea_state_field(HostReg::Rax, OFF_H);
        self.mov_mem_r8(HostReg::Rax, HostReg8::Bh);
        self.lea_state_field(HostReg::Rax, OFF_L);
        self.mov_mem_r8(HostReg::Rax, HostReg8::Bl);
    }

    /// bit 7, h: mask the bit, then hand the result to the shared flag
    /// routine through a host call. Flag recomputation is never inlined.
    pub fn emit_bit7_h(&mut self, state: u64, calc_flags: u64) {
        self.mov_reg_imm32(HostReg::Rbx, 0);
        self.lea_state_field(HostReg::Rax, OFF_H);
        self.mov_r8_mem(HostReg8::Bl, HostReg::Rax);
        self.mov_reg_reg(HostReg::Rax, HostReg::Rbx);
        self.and_al_imm(1 << 7);
        self.mov_reg_reg(HostReg::Rsi, HostReg::Rax);
        self.mov_reg_imm64(HostReg::Rdi, state);
        self.mov_reg_imm32(HostReg::Rdx, FlagClass::Bit as u32);
        self.mov_reg_imm64(HostReg::Rax, calc_flags);
        self.call_reg(HostReg::Rax);
    }
}

/// Default reservation for the code arena.
pub const CODE_ARENA_SIZE: usize = 64 << 20;

/// Guest instructions per block before compilation stops. A reuse/latency
/// heuristic, not a correctness bound.
pub const BLOCK_INSN_LIMIT: usize = 50;

/// One up-front writable+executable reservation plus a bump cursor.
///
/// Blocks are appended and never freed individually; absolute addresses
/// inside earlier blocks stay valid because the region never grows or
/// relocates. The whole range is unmapped on drop. Keeping it RWX for the
/// entire run is a known hardening gap.
pub struct CodeArena {
    base: *mut u8,
    size: usize,
    used: usize,
}

impl CodeArena {
    pub fn new(size: usize) -> Result<Self> {
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            bail!(
                "failed to reserve {size} bytes of executable memory: {}",
                std::io::Error::last_os_error()
            );
        }
        Ok(Self {
            base: base as *mut u8,
            size,
            used: 0,
        })
    }

    /// Bump-allocate space for one block.
    pub fn alloc(&mut self, len: usize) -> Result<*mut u8> {
        if self.size - self.used < len {
            bail!(
                "code arena exhausted: {len} bytes requested, {} of {} in use",
                self.used,
                self.size
            );
        }
        let ptr = unsafe { self.base.add(self.used) };
        self.used += len;
        Ok(ptr)
    }

    pub fn used(&self) -> usize {
        self.used
    }
}

impl Drop for CodeArena {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

/// A sealed translation of one guest basic block.
#[derive(Clone, Copy, Debug)]
pub struct CompiledBlock {
    pub guest_addr: GuestAddr,
    host: *const u8,
    len: usize,
}

impl CompiledBlock {
    /// Entry point, callable while the arena that holds it is alive.
    pub fn entry(&self) -> HostFn {
        unsafe { std::mem::transmute::<*const u8, HostFn>(self.host) }
    }

    pub fn host_ptr(&self) -> *const u8 {
        self.host
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Bus write helper invoked from compiled code.
///
/// # Safety
/// Only reachable from emitted blocks; `bus` must be the pointer baked in at
/// compile time and must still be live.
pub unsafe extern "C" fn jit_bus_write8<B: MemoryBus>(bus: *mut B, addr: u32, data: u32) {
    let bus = unsafe { &mut *bus };
    bus.write8(GuestAddr(addr as u16), data as u8);
}

/// Flag recomputation helper invoked from compiled code.
///
/// # Safety
/// Only reachable from emitted blocks; `state` must be the pointer baked in
/// at compile time and must still be live.
pub unsafe extern "C" fn jit_calc_flags(state: *mut CpuState, result: u32, class: u32) {
    let state = unsafe { &mut *state };
    let class = match class {
        c if c == FlagClass::Bit as u32 => FlagClass::Bit,
        other => {
            tracing::error!("unknown flag class {other}");
            std::process::exit(1);
        }
    };
    apply_flags(state, result as u8, class);
}

/// Compiles guest basic blocks to native code and caches them by entry
/// address. At most one block ever exists per guest address; nothing is
/// recompiled or invalidated.
pub struct JitCompiler {
    state: *mut CpuState,
    arena: CodeArena,
    blocks: HashMap<u16, CompiledBlock>,
    blocks_compiled: usize,
    dump_dir: Option<PathBuf>,
}

impl JitCompiler {
    /// `state` must stay at a fixed address for the compiler's lifetime:
    /// every block bakes it in as an absolute operand.
    pub fn new(state: *mut CpuState) -> Result<Self> {
        Self::with_arena_size(state, CODE_ARENA_SIZE)
    }

    pub fn with_arena_size(state: *mut CpuState, arena_size: usize) -> Result<Self> {
        Ok(Self {
            state,
            arena: CodeArena::new(arena_size)?,
            blocks: HashMap::new(),
            blocks_compiled: 0,
            dump_dir: None,
        })
    }

    /// Dump each sealed block's raw bytes under `dir` for offline
    /// disassembly. Not part of the functional contract.
    pub fn set_dump_dir(&mut self, dir: impl Into<PathBuf>) {
        self.dump_dir = Some(dir.into());
    }

    pub fn lookup(&self, addr: GuestAddr) -> Option<&CompiledBlock> {
        self.blocks.get(&addr.0)
    }

    pub fn blocks_compiled(&self) -> usize {
        self.blocks_compiled
    }

    pub fn code_used(&self) -> usize {
        self.arena.used()
    }

    /// Return the block starting at `addr`, compiling it on first request.
    /// A hit re-emits nothing and leaves the arena cursor untouched.
    pub fn get_or_compile<B: MemoryBus>(
        &mut self,
        bus: &mut B,
        addr: GuestAddr,
    ) -> Result<&CompiledBlock> {
        if self.blocks.contains_key(&addr.0) {
            return Ok(&self.blocks[&addr.0]);
        }
        let block = self.compile_block(bus, addr)?;
        Ok(self.blocks.entry(addr.0).or_insert(block))
    }

    /// Translate one basic block: a maximal straight-line run of guest
    /// instructions ending at the first pc-redirecting opcode or at the
    /// per-block instruction limit.
    fn compile_block<B: MemoryBus>(&mut self, bus: &mut B, addr: GuestAddr) -> Result<CompiledBlock> {
        let mut gen = X86Emitter::new();
        gen.emit_block_prologue(self.state);

        let state_ptr = self.state as u64;
        let bus_ptr = bus as *mut B as u64;
        let write8_fn: unsafe extern "C" fn(*mut B, u32, u32) = jit_bus_write8::<B>;
        let write8_ptr = write8_fn as usize as u64;
        let calc_flags_fn: unsafe extern "C" fn(*mut CpuState, u32, u32) = jit_calc_flags;
        let calc_flags_ptr = calc_flags_fn as usize as u64;

        let mut cur = addr;
        let mut compiled = 0usize;

        loop {
            let op_addr = cur;
            let op = bus.try_read8(cur)?;
            cur = cur.wrapping_add(1);
            gen.emit_pc_bump();

            let decoded = if op == OP_PREFIX_CB {
                let sub_addr = cur;
                let sub = bus.try_read8(cur)?;
                cur = cur.wrapping_add(1);
                gen.emit_pc_bump();
                let decoded = decode_cb(sub).ok_or(Fault::UnknownCbOpcode(sub, sub_addr))?;
                match decoded.kind {
                    OpKind::Bit7H => gen.emit_bit7_h(state_ptr, calc_flags_ptr),
                    kind => unreachable!("{kind:?} is not an extended-table opcode"),
                }
                decoded
            } else {
                let decoded = decode(op).ok_or(Fault::UnknownOpcode(op, op_addr))?;
                match decoded.kind {
                    OpKind::Jr | OpKind::JrNz | OpKind::JrZ | OpKind::JrNc | OpKind::JrC => {
                        let offset = bus.try_read8(cur)? as i8;
                        cur = cur.wrapping_add(1);
                        gen.emit_pc_bump();
                        let cond = match decoded.kind {
                            OpKind::Jr => None,
                            OpKind::JrNz => Some(JrCond::Nz),
                            OpKind::JrZ => Some(JrCond::Z),
                            OpKind::JrNc => Some(JrCond::Nc),
                            _ => Some(JrCond::C),
                        };
                        gen.emit_jr(cond, offset);
                    }
                    OpKind::LdHlImm16 => {
                        let value = bus.try_read16(cur)?;
                        cur = cur.wrapping_add(2);
                        gen.emit_pc_bump();
                        gen.emit_pc_bump();
                        gen.emit_ld_hl_imm16(value);
                    }
                    OpKind::LdSpImm16 => {
                        let value = bus.try_read16(cur)?;
                        cur = cur.wrapping_add(2);
                        gen.emit_pc_bump();
                        gen.emit_pc_bump();
                        gen.emit_ld_sp_imm16(value);
                    }
                    OpKind::LdHlDecA => gen.emit_ld_hl_dec_a(bus_ptr, write8_ptr),
                    OpKind::XorA => gen.emit_xor_a(),
                    OpKind::Bit7H => unreachable!("extended-table opcode in the primary table"),
                }
                decoded
            };

            compiled += 1;
            if decoded.redirects_pc || compiled >= BLOCK_INSN_LIMIT {
                break;
            }
        }

        gen.emit_block_epilogue();

        let code = gen.code();
        let host = self.arena.alloc(code.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), host, code.len());
        }
        self.blocks_compiled += 1;
        tracing::debug!(
            "compiled block at {addr}: {compiled} guest instructions, {} host bytes",
            code.len()
        );

        let block = CompiledBlock {
            guest_addr: addr,
            host,
            len: code.len(),
        };
        self.dump_block(&block, code);
        Ok(block)
    }

    fn dump_block(&self, block: &CompiledBlock, code: &[u8]) {
        let Some(dir) = &self.dump_dir else {
            return;
        };
        let path = dir.join(format!("block_{:04x}.bin", block.guest_addr.0));
        let result = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, code));
        if let Err(err) = result {
            tracing::warn!("failed to dump block {} to {}: {err}", block.guest_addr, path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execute::bus::{DmgBus, BOOT_ROM_SIZE};
    use crate::execute::sm83::{FLAG_H, FLAG_N};

    fn boot_bus(program: &[u8]) -> DmgBus {
        let mut image = [0u8; BOOT_ROM_SIZE];
        image[..program.len()].copy_from_slice(program);
        let mut bus = DmgBus::new();
        bus.attach_boot_rom(&image).unwrap();
        bus
    }

    #[test]
    fn lea_encoding() {
        let mut gen = X86Emitter::new();
        gen.lea_state_field(HostReg::Rax, 0x07);
        assert_eq!(gen.code(), [0x48, 0x8D, 0x45, 0x07]);
    }

    #[test]
    fn store_immediate_encodings() {
        let mut gen = X86Emitter::new();
        gen.mov_mem8_imm(HostReg::Rax, 0xAB);
        assert_eq!(gen.code(), [0xC6, 0x00, 0xAB]);

        let mut gen = X86Emitter::new();
        gen.mov_mem16_imm(HostReg::Rax, 0x1234);
        assert_eq!(gen.code(), [0x66, 0xC7, 0x00, 0x34, 0x12]);
    }

    #[test]
    fn register_move_encodings() {
        let mut gen = X86Emitter::new();
        gen.mov_reg_reg(HostReg::Rbp, HostReg::Rax);
        assert_eq!(gen.code(), [0x48, 0x89, 0xC5]);

        let mut gen = X86Emitter::new();
        gen.mov_reg_reg(HostReg::Rsi, HostReg::Rbx);
        assert_eq!(gen.code(), [0x48, 0x89, 0xDE]);
    }

    #[test]
    fn byte_move_encodings() {
        let mut gen = X86Emitter::new();
        gen.mov_r8_mem(HostReg8::Bh, HostReg::Rax);
        assert_eq!(gen.code(), [0x8A, 0x38]);

        let mut gen = X86Emitter::new();
        gen.mov_r8_mem(HostReg8::Bl, HostReg::Rax);
        assert_eq!(gen.code(), [0x8A, 0x18]);

        let mut gen = X86Emitter::new();
        gen.mov_mem_r8(HostReg::Rax, HostReg8::Bh);
        assert_eq!(gen.code(), [0x88, 0x38]);
    }

    #[test]
    fn immediate_load_encodings() {
        let mut gen = X86Emitter::new();
        gen.mov_reg_imm64(HostReg::Rax, 0x1122334455667788);
        assert_eq!(
            gen.code(),
            [0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );

        let mut gen = X86Emitter::new();
        gen.mov_reg_imm64(HostReg::Rdi, 0);
        assert_eq!(gen.code()[..2], [0x48, 0xBF]);

        let mut gen = X86Emitter::new();
        gen.mov_reg_imm32(HostReg::Rbx, 0);
        assert_eq!(gen.code(), [0x48, 0xC7, 0xC3, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn call_branch_and_stack_encodings() {
        let mut gen = X86Emitter::new();
        gen.call_reg(HostReg::Rax);
        assert_eq!(gen.code(), [0xFF, 0xD0]);

        let mut gen = X86Emitter::new();
        gen.jnz_short(8);
        gen.jz_short(-2);
        assert_eq!(gen.code(), [0x75, 0x08, 0x74, 0xFE]);

        let mut gen = X86Emitter::new();
        gen.push_reg(HostReg::Rdi);
        gen.pop_reg(HostReg::Rax);
        assert_eq!(gen.code(), [0x57, 0x58]);
    }

    #[test]
    fn memory_arithmetic_encodings() {
        let mut gen = X86Emitter::new();
        gen.inc_mem16(HostReg::Rax);
        assert_eq!(gen.code(), [0x66, 0xFF, 0x00]);

        let mut gen = X86Emitter::new();
        gen.add_mem16_imm8(HostReg::Rax, -5);
        assert_eq!(gen.code(), [0x66, 0x83, 0x00, 0xFB]);

        let mut gen = X86Emitter::new();
        gen.dec_reg(HostReg::Rbx);
        assert_eq!(gen.code(), [0x48, 0xFF, 0xCB]);

        let mut gen = X86Emitter::new();
        gen.and_al_imm(0x80);
        gen.ret();
        assert_eq!(gen.code(), [0x24, 0x80, 0xC3]);
    }

    #[test]
    fn prologue_and_epilogue_encoding() {
        let mut gen = X86Emitter::new();
        gen.emit_block_prologue(0x1000 as *const CpuState);
        assert_eq!(
            gen.code(),
            [
                0x50, 0x51, 0x52, 0x53, 0x55, 0x56, 0x57, // pushes, rsp skipped
                0x48, 0xB8, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // movabs rax
                0x48, 0x89, 0xC5, // mov rbp, rax
            ]
        );

        let mut gen = X86Emitter::new();
        gen.emit_block_epilogue();
        assert_eq!(
            gen.code(),
            [
                0x5F, 0x5E, 0x5D, 0x5B, 0x5A, 0x59, 0x58, // pops in reverse
                0x48, 0xC7, 0xC0, 0x00, 0x00, 0x00, 0x00, // mov rax, 0
                0xC3,
            ]
        );
    }

    #[test]
    fn jr_skip_distance_matches_skipped_run() {
        // The conditional skip must jump over exactly the lea + add pair.
        let mut gen = X86Emitter::new();
        gen.emit_jr(None, 0);
        let tail_len = gen.len();
        assert_eq!(tail_len, 8);

        let mut gen = X86Emitter::new();
        gen.emit_jr(Some(JrCond::Nz), -5);
        let code = gen.code();
        let jcc_at = code.len() - tail_len - 2;
        assert_eq!(code[jcc_at], 0x75);
        assert_eq!(code[jcc_at + 1], tail_len as u8);
    }

    #[cfg(unix)]
    #[test]
    fn arena_bumps_sequentially_and_exhausts() {
        let mut arena = CodeArena::new(64).unwrap();
        let first = arena.alloc(40).unwrap();
        assert_eq!(arena.used(), 40);
        let second = arena.alloc(24).unwrap();
        assert_eq!(second as usize - first as usize, 40);
        assert_eq!(arena.used(), 64);
        assert!(arena.alloc(1).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn unknown_opcode_faults_and_leaves_arena_untouched() {
        let mut bus = boot_bus(&[0xFE]);
        let mut state = CpuState::default();
        let mut compiler = JitCompiler::new(&mut state).unwrap();
        for _ in 0..2 {
            let err = compiler.get_or_compile(&mut bus, GuestAddr(0)).unwrap_err();
            let fault = err.downcast_ref::<Fault>().unwrap();
            assert_eq!(*fault, Fault::UnknownOpcode(0xFE, GuestAddr(0)));
        }
        assert_eq!(compiler.code_used(), 0);
        assert_eq!(compiler.blocks_compiled(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn unknown_extended_opcode_faults() {
        let mut bus = boot_bus(&[0xCB, 0x20]);
        let mut state = CpuState::default();
        let mut compiler = JitCompiler::new(&mut state).unwrap();
        let err = compiler.get_or_compile(&mut bus, GuestAddr(0)).unwrap_err();
        let fault = err.downcast_ref::<Fault>().unwrap();
        assert_eq!(*fault, Fault::UnknownCbOpcode(0x20, GuestAddr(1)));
    }

    #[cfg(unix)]
    #[test]
    fn get_or_compile_is_idempotent() {
        let mut bus = boot_bus(&[0xAF, 0x18, 0x00]);
        let mut state = CpuState::default();
        let mut compiler = JitCompiler::new(&mut state).unwrap();
        let first = *compiler.get_or_compile(&mut bus, GuestAddr(0)).unwrap();
        let used = compiler.code_used();
        let second = *compiler.get_or_compile(&mut bus, GuestAddr(0)).unwrap();
        assert_eq!(first.host_ptr(), second.host_ptr());
        assert_eq!(compiler.code_used(), used);
        assert_eq!(compiler.blocks_compiled(), 1);
    }

    #[cfg(all(unix, target_arch = "x86_64"))]
    mod native {
        use super::*;

        // Compile the block at address 0 and run it once.
        fn run_block(state: &mut CpuState, bus: &mut DmgBus) -> i32 {
            let mut compiler = JitCompiler::new(state as *mut CpuState).unwrap();
            let block = *compiler.get_or_compile(bus, GuestAddr(0)).unwrap();
            unsafe { (block.entry())() }
        }

        #[test]
        fn ld_hl_imm16_splits_the_immediate() {
            let mut bus = boot_bus(&[0x21, 0x34, 0x12, 0x18, 0x00]);
            let mut state = CpuState::default();
            let status = run_block(&mut state, &mut bus);
            assert_eq!(status, BLOCK_EXIT_OK);
            assert_eq!(state.h, 0x12);
            assert_eq!(state.l, 0x34);
            assert_eq!(state.pc, 5);
            // No other field changes.
            assert_eq!(state.sp, 0);
            assert_eq!(state.a, 0);
            assert_eq!(state.f, 0);
            assert_eq!((state.b, state.c, state.d, state.e), (0, 0, 0, 0));
        }

        #[test]
        fn ld_sp_imm16_stores_one_halfword() {
            let mut bus = boot_bus(&[0x31, 0x00, 0xC0, 0x18, 0x00]);
            let mut state = CpuState::default();
            run_block(&mut state, &mut bus);
            assert_eq!(state.sp, 0xC000);
            assert_eq!(state.pc, 5);
            assert_eq!(state.hl(), 0);
        }

        #[test]
        fn xor_a_clears_accumulator_and_sets_zero() {
            let mut bus = boot_bus(&[0xAF, 0x18, 0x00]);
            let mut state = CpuState {
                a: 0x3C,
                f: FLAG_C | FLAG_N | FLAG_H,
                ..CpuState::default()
            };
            run_block(&mut state, &mut bus);
            assert_eq!(state.a, 0);
            assert_eq!(state.f, 0x40);
            assert_eq!(state.pc, 3);
        }

        #[test]
        fn bit7_h_flag_matrix() {
            // Bit set: zero clear, half-carry set, subtract clear, carry kept.
            let mut bus = boot_bus(&[0xCB, 0x7C, 0x18, 0x00]);
            let mut state = CpuState {
                h: 0x80,
                f: FLAG_C | FLAG_N,
                ..CpuState::default()
            };
            run_block(&mut state, &mut bus);
            assert_eq!(state.f, FLAG_C | FLAG_H);
            assert_eq!(state.pc, 4);

            // Bit clear: zero set, carry still kept.
            let mut bus = boot_bus(&[0xCB, 0x7C, 0x18, 0x00]);
            let mut state = CpuState {
                h: 0x7F,
                f: FLAG_C,
                ..CpuState::default()
            };
            run_block(&mut state, &mut bus);
            assert_eq!(state.f, FLAG_C | FLAG_Z | FLAG_H);
        }

        #[test]
        fn ld_hl_dec_a_writes_through_the_bus_and_decrements() {
            let mut bus = boot_bus(&[0x32, 0x18, 0x00]);
            let mut state = CpuState {
                a: 0x5A,
                ..CpuState::default()
            };
            state.set_hl(0x8000);
            run_block(&mut state, &mut bus);
            assert_eq!(bus.vram()[0], 0x5A);
            assert_eq!(state.hl(), 0x7FFF);
            assert_eq!(state.a, 0x5A);
            assert_eq!(state.pc, 3);
        }

        #[test]
        fn jr_unconditional_adds_to_the_advanced_pc() {
            let mut bus = boot_bus(&[0x18, 0x10]);
            let mut state = CpuState::default();
            run_block(&mut state, &mut bus);
            assert_eq!(state.pc, 0x12);
        }

        #[test]
        fn jr_nz_taken_and_not_taken() {
            let mut bus = boot_bus(&[0x20, 0x05]);
            let mut state = CpuState::default();
            run_block(&mut state, &mut bus);
            assert_eq!(state.pc, 7);

            let mut bus = boot_bus(&[0x20, 0x05]);
            let mut state = CpuState {
                f: FLAG_Z,
                ..CpuState::default()
            };
            run_block(&mut state, &mut bus);
            assert_eq!(state.pc, 2);
        }

        #[test]
        fn jr_z_backward_offset_wraps_sixteen_bit() {
            let mut bus = boot_bus(&[0x28, 0xFB]); // jr z, -5
            let mut state = CpuState {
                f: FLAG_Z,
                ..CpuState::default()
            };
            run_block(&mut state, &mut bus);
            assert_eq!(state.pc, 0xFFFD);
        }

        #[test]
        fn jr_carry_conditions() {
            let mut bus = boot_bus(&[0x38, 0x04]); // jr c
            let mut state = CpuState {
                f: FLAG_C,
                ..CpuState::default()
            };
            run_block(&mut state, &mut bus);
            assert_eq!(state.pc, 6);

            let mut bus = boot_bus(&[0x30, 0x04]); // jr nc
            let mut state = CpuState {
                f: FLAG_C,
                ..CpuState::default()
            };
            run_block(&mut state, &mut bus);
            assert_eq!(state.pc, 2);
        }

        #[test]
        fn pc_advances_by_the_sum_of_encoded_lengths() {
            let program = [0xAF, 0x21, 0x00, 0x00, 0xAF, 0x31, 0x00, 0x00, 0x18, 0x00];
            let mut bus = boot_bus(&program);
            let mut state = CpuState::default();
            run_block(&mut state, &mut bus);
            assert_eq!(state.pc, program.len() as u16);
        }
    }
}
