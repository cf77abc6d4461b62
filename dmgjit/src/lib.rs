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

//! Just-in-time binary translation for the SM83 (Game Boy) CPU.
//!
//! Guest basic blocks are decoded once, translated to x86-64 machine code
//! inside a single executable arena, cached by guest entry address, and
//! thereafter invoked as direct native calls. Emitted code reads and writes
//! the guest register file through byte offsets from a pinned state pointer,
//! and routes every memory-mapped store through the bus.

pub mod execute;

pub use execute::bus::{DmgBus, MemoryBus};
pub use execute::runtime::JitRuntime;
pub use execute::sm83::{CpuState, Fault, GuestAddr};
