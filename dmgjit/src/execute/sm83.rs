// Copyright 2025 RISC Zero, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use derive_more::Debug;

/// A 16-bit guest address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[debug("{_0:#06x}")]
pub struct GuestAddr(pub u16);

impl GuestAddr {
    pub fn wrapping_add(self, rhs: u16) -> Self {
        Self(self.0.wrapping_add(rhs))
    }
}

impl std::fmt::Display for GuestAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

// Flag register bit assignments. The zero bit sits at 0x40: a self-XOR of
// the accumulator leaves f == 0x40.
pub const FLAG_C: u8 = 1 << 4;
pub const FLAG_H: u8 = 1 << 5;
pub const FLAG_Z: u8 = 1 << 6;
pub const FLAG_N: u8 = 1 << 7;

/// Guest register file.
///
/// The layout is frozen: compiled code addresses each field by its byte
/// offset from the struct base, so fields may not be reordered or resized.
/// The six general registers pair up as BC, DE and HL with the high byte
/// named first.
#[repr(C)]
#[derive(Clone, Debug, Default)]
pub struct CpuState {
    pub sp: u16,
    pub a: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
    pub e: u8,
    pub h: u8,
    pub l: u8,
    pub f: u8,
    pub pc: u16,
}

impl CpuState {
    pub fn hl(&self) -> u16 {
        (self.h as u16) << 8 | self.l as u16
    }

    pub fn set_hl(&mut self, value: u16) {
        self.h = (value >> 8) as u8;
        self.l = value as u8;
    }
}

/// Which flags an operation recomputes.
///
/// Passed from compiled code into [`apply_flags`] so every opcode shares one
/// flag routine instead of open-coding its own bit fiddling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum FlagClass {
    /// Bit tests: zero from the masked result, half-carry set, subtract
    /// cleared, carry untouched.
    Bit = 0,
}

fn set_flag(state: &mut CpuState, flag: u8, value: bool) {
    if value {
        state.f |= flag;
    } else {
        state.f &= !flag;
    }
}

/// Recompute the flag register from an 8-bit result.
pub fn apply_flags(state: &mut CpuState, result: u8, class: FlagClass) {
    match class {
        FlagClass::Bit => {
            set_flag(state, FLAG_Z, result == 0);
            set_flag(state, FLAG_N, false);
            set_flag(state, FLAG_H, true);
        }
    }
}

/// Guest-visible faults. Both kinds abort the current compilation or memory
/// access; the default top level terminates the process on them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Fault {
    #[debug("UnknownOpcode({_0:#04x}, {_1:?})")]
    UnknownOpcode(u8, GuestAddr),
    #[debug("UnknownCbOpcode({_0:#04x}, {_1:?})")]
    UnknownCbOpcode(u8, GuestAddr),
    #[debug("UnmappedRead({_0:?})")]
    UnmappedRead(GuestAddr),
    #[debug("UnmappedWrite({_0:?}, {_1:#04x})")]
    UnmappedWrite(GuestAddr, u8),
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fault::UnknownOpcode(op, addr) => write!(f, "unknown opcode {op:#04x} ({addr})"),
            Fault::UnknownCbOpcode(op, addr) => {
                write!(f, "unknown opcode 0xcb {op:#04x} ({addr})")
            }
            Fault::UnmappedRead(addr) => write!(f, "read from unmapped address {addr}"),
            Fault::UnmappedWrite(addr, data) => {
                write!(f, "write of {data:#04x} to unmapped address {addr}")
            }
        }
    }
}

impl std::error::Error for Fault {}

/// Prefix byte selecting the extended opcode table.
pub const OP_PREFIX_CB: u8 = 0xCB;

/// Semantic identity of a decoded opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    /// 0x18: unconditional relative jump.
    Jr,
    /// 0x20 / 0x28 / 0x30 / 0x38: relative jump on a flag condition.
    JrNz,
    JrZ,
    JrNc,
    JrC,
    /// 0x21: load 16-bit immediate into HL.
    LdHlImm16,
    /// 0x31: load 16-bit immediate into SP.
    LdSpImm16,
    /// 0x32: store A through HL, then decrement the pair.
    LdHlDecA,
    /// 0xAF: XOR A with itself.
    XorA,
    /// 0xCB 0x7C: test bit 7 of H.
    Bit7H,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecodedOp {
    pub kind: OpKind,
    /// Whether this opcode can redirect the program counter. A redirecting
    /// opcode ends the basic block being compiled.
    pub redirects_pc: bool,
}

/// Decode a primary-table opcode.
pub fn decode(op: u8) -> Option<DecodedOp> {
    let kind = match op {
        0x18 => OpKind::Jr,
        0x20 => OpKind::JrNz,
        0x28 => OpKind::JrZ,
        0x30 => OpKind::JrNc,
        0x38 => OpKind::JrC,
        0x21 => OpKind::LdHlImm16,
        0x31 => OpKind::LdSpImm16,
        0x32 => OpKind::LdHlDecA,
        0xAF => OpKind::XorA,
        _ => return None,
    };
    Some(DecodedOp {
        kind,
        redirects_pc: redirects_pc(op),
    })
}

/// Decode an extended-table opcode (the byte following the 0xCB prefix).
pub fn decode_cb(op: u8) -> Option<DecodedOp> {
    let kind = match op {
        0x7C => OpKind::Bit7H,
        _ => return None,
    };
    Some(DecodedOp {
        kind,
        redirects_pc: redirects_pc(op),
    })
}

/// Whether an opcode byte belongs to the control-flow group (relative and
/// absolute jumps, calls, returns, resets). The classification covers the
/// whole group, not just the opcodes the compiler has templates for.
pub fn redirects_pc(op: u8) -> bool {
    matches!(
        op,
        // jr / jr cc
        0x18 | 0x20 | 0x28 | 0x30 | 0x38
        // ret cc / ret / reti
        | 0xC0 | 0xC8 | 0xC9 | 0xD0 | 0xD8 | 0xD9
        // jp cc / jp / jp hl
        | 0xC2 | 0xCA | 0xD2 | 0xDA | 0xC3 | 0xE9
        // call cc / call
        | 0xC4 | 0xCC | 0xD4 | 0xDC | 0xCD
        // rst 00..38
        | 0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF
    )
}
