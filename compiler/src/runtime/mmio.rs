// mmio.rs — Control-register and DMA-engine layout
//
// Byte offsets of every register the host touches, plus the `HardwarePort`
// trait that isolates raw accesses. Offsets are fixed by the fabric and the
// DMA engine (simple mode) and must not change.

use crate::arch::{GridDepth, GRID_WIDTH, UNIT_WIDTH};
use crate::emit::AddrRegs;

// ── Control registers (per replica) ────────────────────────────────────────

/// Address stride between chained replicas.
pub const REPLICA_STRIDE: u64 = 0x1_0000;

pub const REG_STAT: u64 = 0x0000;
pub const REG_MCID: u64 = 0x0008;
pub const REG_CMD: u64 = 0x0010;
pub const REG_ADTR: u64 = 0x0020;
pub const REG_CSEL: u64 = 0x0030;
pub const REG_DMRP: u64 = 0x0038;
pub const REG_CONF: u64 = 0x2000;
pub const REG_BREG: u64 = 0x4000;
pub const REG_ADDR: u64 = 0x6000;
pub const REG_LDDM: u64 = 0x8000;

pub const CMD_NOP: u64 = 0;
pub const CMD_RESET: u64 = 1;
pub const CMD_SCON: u64 = 2;
pub const CMD_EXEC: u64 = 3;

/// EXRING busy nibble of `stat`.
pub const STAT_EXRING_MASK: u64 = 0x0000_000f;
/// Everything that must be idle before the fabric is read by DMA.
pub const STAT_LMRING_BUSY: u64 = 0xffff_00f0;

/// Bytes of one cell's configuration block.
const CONF_STRIDE: u64 = 32;
const BREG_STRIDE: u64 = 8 * UNIT_WIDTH as u64;
const ADDR_STRIDE: u64 = 32;

fn cell_index(row: u8, col: u8) -> u64 {
    row as u64 * GRID_WIDTH as u64 + col as u64
}

pub fn conf_offset(row: u8, col: u8) -> u64 {
    REG_CONF + cell_index(row, col) * CONF_STRIDE
}

pub fn breg_offset(row: u8, col: u8, lane: u8) -> u64 {
    REG_BREG + cell_index(row, col) * BREG_STRIDE + lane as u64 * 8
}

pub fn addr_offset(row: u8, col: u8) -> u64 {
    REG_ADDR + cell_index(row, col) * ADDR_STRIDE
}

pub fn lddm_offset(row: u8, col: u8, lane: u8) -> u64 {
    REG_LDDM + cell_index(row, col) * BREG_STRIDE + lane as u64 * 8
}

/// Depth code in `stat` bits 11..8 (0: 8 rows, 1: 16, 2: 32, 3: 64).
pub fn stat_depth(stat: u64) -> u32 {
    match (stat >> 8) & 0xf {
        3 => 64,
        2 => 32,
        1 => 16,
        _ => 8,
    }
}

pub fn depth_code(depth: GridDepth) -> u64 {
    (depth.log2() - 3) as u64
}

/// The address-register block as the four 64-bit stores the bus accepts:
/// (ea0b | ea0o<<32, ea1b | ea1o<<32, top | bot<<32, 0).
pub fn addr_words(a: &AddrRegs) -> [u64; 4] {
    [
        a.ea0b as u64 | (a.ea0o as u64) << 32,
        a.ea1b as u64 | (a.ea1o as u64) << 32,
        a.top as u64 | (a.bot as u64) << 32,
        0,
    ]
}

/// DMA-read prefetch request: valid bit, byte length and LMM address.
pub fn dmrp(bytes: u64, lmm_addr: u64) -> u64 {
    1 << 63 | bytes << 40 | lmm_addr
}

// ── DMA engine (per lane, simple mode) ─────────────────────────────────────

pub const MM2S_DMACR: u64 = 0x00;
pub const MM2S_DMASR: u64 = 0x04;
pub const MM2S_SA: u64 = 0x18;
pub const MM2S_SA_MSB: u64 = 0x1c;
pub const MM2S_LENGTH: u64 = 0x28;
pub const S2MM_DMACR: u64 = 0x30;
pub const S2MM_DMASR: u64 = 0x34;
pub const S2MM_DA: u64 = 0x48;
pub const S2MM_DA_MSB: u64 = 0x4c;
pub const S2MM_LENGTH: u64 = 0x58;

/// Run/stop with an interrupt threshold of one.
pub const DMACR_RUN: u32 = 0x0001_0001;
pub const DMACR_RESET: u32 = 0x0001_0004;
pub const DMASR_IDLE: u32 = 0x2;
/// Internal, slave and decode error bits.
pub const DMASR_ERR: u32 = 0x71;
/// Write-one-to-clear for the completion interrupt.
pub const DMASR_IOC_CLEAR: u32 = 0x1000;
pub const DMASR_CLEAR_ALL: u32 = 0x0001_7000;

// ── Address translation ────────────────────────────────────────────────────

/// How descriptor addresses map to bus addresses.
///
/// Descriptor addresses live in the host mapping starting at `host_base`.
/// The DMA engine sees the same bytes at `ddr_phys` and the local memories
/// at `lmm_phys`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressMap {
    pub host_base: u64,
    pub ddr_phys: u64,
    pub lmm_phys: u64,
}

impl Default for AddressMap {
    fn default() -> Self {
        AddressMap {
            host_base: 0,
            ddr_phys: 0x0000_0500_0000_0000,
            lmm_phys: 0x0000_0209_0000_0000,
        }
    }
}

impl AddressMap {
    pub fn ddr(&self, addr: u64) -> u64 {
        addr.wrapping_sub(self.host_base).wrapping_add(self.ddr_phys)
    }

    pub fn lmm(&self, addr: u64) -> u64 {
        addr.wrapping_sub(self.host_base).wrapping_add(self.lmm_phys)
    }

    /// Value of the address-translation register.
    pub fn adtr(&self) -> u64 {
        self.host_base.wrapping_sub(self.lmm_phys)
    }
}

// ── Port ───────────────────────────────────────────────────────────────────

/// Raw register access for one lane.
///
/// `replica` selects the chained instance (stride `REPLICA_STRIDE`); DMA
/// registers exist once per lane. Implementations perform the access and
/// nothing else: ordering and locking belong to the caller.
pub trait HardwarePort: Send {
    fn read_reg(&mut self, replica: usize, offset: u64) -> u64;
    fn write_reg(&mut self, replica: usize, offset: u64, value: u64);
    fn read_dma(&mut self, offset: u64) -> u32;
    fn write_dma(&mut self, offset: u64, value: u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_offsets() {
        assert_eq!(conf_offset(0, 0), 0x2000);
        assert_eq!(conf_offset(1, 2), 0x2000 + 6 * 32);
        assert_eq!(breg_offset(0, 1, 3), 0x4000 + 32 + 24);
        assert_eq!(addr_offset(2, 3), 0x6000 + 11 * 32);
        assert_eq!(lddm_offset(0, 0, 1), 0x8008);
        // 64 rows fit below the next block.
        assert!(conf_offset(63, 3) + 32 <= REG_BREG);
        assert!(addr_offset(63, 3) + 32 <= REG_LDDM);
    }

    #[test]
    fn depth_code_round_trips() {
        for d in [GridDepth::D8, GridDepth::D16, GridDepth::D32, GridDepth::D64] {
            assert_eq!(stat_depth(depth_code(d) << 8) as usize, d.rows());
        }
        assert_eq!(stat_depth(0x52ff), 32);
    }

    #[test]
    fn dmrp_layout() {
        assert_eq!(dmrp(0x100, 0x20_0000), 0x8001_0000_0020_0000);
    }

    #[test]
    fn address_map_translates_both_windows() {
        let m = AddressMap {
            host_base: 0x1000_0000,
            ddr_phys: 0x5_0000_0000,
            lmm_phys: 0x9_0000_0000,
        };
        assert_eq!(m.ddr(0x1000_0040), 0x5_0000_0040);
        assert_eq!(m.lmm(0x1000_0040), 0x9_0000_0040);
        assert_eq!(m.adtr().wrapping_add(m.lmm_phys), m.host_base);
    }

    #[test]
    fn addr_block_packs_halves() {
        let a = AddrRegs {
            ea0b: 1,
            ea0o: 2,
            ea1b: 3,
            ea1o: 4,
            top: 0x4000,
            bot: 0x403f,
        };
        let w = addr_words(&a);
        assert_eq!(w[0], 0x2_0000_0001);
        assert_eq!(w[2], 0x403f_0000_4000);
    }
}
