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

use anyhow::{bail, Result};

use super::sm83::{Fault, GuestAddr};

pub const BOOT_ROM_SIZE: usize = 0x100;
pub const VRAM_BASE: u16 = 0x8000;
pub const VRAM_SIZE: usize = 0x2000;

/// Terminate on a fault raised from inside compiled code. A native frame
/// cannot unwind, so there is no recovery path here.
pub(crate) fn fatal_fault(fault: Fault) -> ! {
    tracing::error!("{fault}");
    std::process::exit(1);
}

/// The guest address space.
///
/// Mapped ranges are enumerated per implementation; everything else is a
/// fault address. The `try_` methods report faults as values for callers
/// that can recover (compilation, tests); the plain methods are the
/// terminate-on-fault form compiled code calls into.
pub trait MemoryBus {
    fn try_read8(&mut self, addr: GuestAddr) -> std::result::Result<u8, Fault>;

    fn try_write8(&mut self, addr: GuestAddr, data: u8) -> std::result::Result<(), Fault>;

    /// Little-endian composition of two byte reads.
    fn try_read16(&mut self, addr: GuestAddr) -> std::result::Result<u16, Fault> {
        let lo = self.try_read8(addr)?;
        let hi = self.try_read8(addr.wrapping_add(1))?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn read8(&mut self, addr: GuestAddr) -> u8 {
        self.try_read8(addr).unwrap_or_else(|fault| fatal_fault(fault))
    }

    fn read16(&mut self, addr: GuestAddr) -> u16 {
        self.try_read16(addr).unwrap_or_else(|fault| fatal_fault(fault))
    }

    fn write8(&mut self, addr: GuestAddr, data: u8) {
        self.try_write8(addr, data)
            .unwrap_or_else(|fault| fatal_fault(fault));
    }
}

/// Boot-ROM window at 0x0000..=0x00ff, video RAM at 0x8000..=0x9fff.
pub struct DmgBus {
    boot_rom: [u8; BOOT_ROM_SIZE],
    vram: Box<[u8]>,
}

impl DmgBus {
    pub fn new() -> Self {
        Self {
            boot_rom: [0; BOOT_ROM_SIZE],
            vram: vec![0; VRAM_SIZE].into_boxed_slice(),
        }
    }

    /// Copy a boot image into the boot-ROM window. The image must fill the
    /// window exactly.
    pub fn attach_boot_rom(&mut self, image: &[u8]) -> Result<()> {
        if image.len() != BOOT_ROM_SIZE {
            bail!(
                "boot image is {} bytes, the boot-ROM window holds exactly {BOOT_ROM_SIZE}",
                image.len()
            );
        }
        self.boot_rom.copy_from_slice(image);
        Ok(())
    }

    pub fn vram(&self) -> &[u8] {
        &self.vram
    }
}

impl Default for DmgBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus for DmgBus {
    fn try_read8(&mut self, addr: GuestAddr) -> std::result::Result<u8, Fault> {
        if (addr.0 as usize) < BOOT_ROM_SIZE {
            return Ok(self.boot_rom[addr.0 as usize]);
        }
        Err(Fault::UnmappedRead(addr))
    }

    fn try_write8(&mut self, addr: GuestAddr, data: u8) -> std::result::Result<(), Fault> {
        let offset = addr.0.wrapping_sub(VRAM_BASE) as usize;
        if addr.0 >= VRAM_BASE && offset < VRAM_SIZE {
            self.vram[offset] = data;
            return Ok(());
        }
        Err(Fault::UnmappedWrite(addr, data))
    }
}
