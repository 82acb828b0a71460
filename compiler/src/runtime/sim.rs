// sim.rs — In-memory hardware port
//
// Answers register reads from a simple model of the fabric and records every
// register write and every completed DMA, so the lane can be exercised
// without hardware. Fault injection covers DMA errors and a fabric that never
// finishes executing.

use std::collections::HashMap;

use crate::arch::GridDepth;

use super::mmio::*;

/// One register store as seen on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegWrite {
    pub replica: usize,
    pub offset: u64,
    pub value: u64,
}

/// A DMA both of whose channels were programmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRecord {
    pub src: u64,
    pub dst: u64,
    pub bytes: u32,
    /// Issued while the fabric reported EXEC busy.
    pub during_exec: bool,
}

#[derive(Debug, Clone)]
pub struct SimPort {
    stat: u64,
    regs: HashMap<(usize, u64), u64>,
    dma_regs: HashMap<u64, u32>,
    pub writes: Vec<RegWrite>,
    pub dma: Vec<DmaRecord>,
    /// `stat` reads that report EXRING busy after each EXEC command.
    exec_polls: u64,
    busy: u64,
    hang: bool,
    fault: Option<u32>,
}

impl SimPort {
    pub fn new(depth: GridDepth) -> Self {
        SimPort {
            // 512 KiB local memories (size code 5).
            stat: 0x5 << 12 | depth_code(depth) << 8,
            regs: HashMap::new(),
            dma_regs: HashMap::new(),
            writes: Vec::new(),
            dma: Vec::new(),
            exec_polls: 2,
            busy: 0,
            hang: false,
            fault: None,
        }
    }

    /// Never leave EXEC.
    pub fn hang(mut self) -> Self {
        self.hang = true;
        self
    }

    /// Report `status` bits on both DMA channels from now on.
    pub fn inject_dma_fault(&mut self, status: u32) {
        self.fault = Some(status);
    }

    pub fn clear_dma_fault(&mut self) {
        self.fault = None;
    }

    pub fn reg(&self, replica: usize, offset: u64) -> Option<u64> {
        self.regs.get(&(replica, offset)).copied()
    }

    /// Number of stores into `[lo, hi)` of any replica.
    pub fn writes_in(&self, lo: u64, hi: u64) -> usize {
        self.writes
            .iter()
            .filter(|w| (lo..hi).contains(&w.offset))
            .count()
    }

    pub fn commands(&self) -> Vec<u64> {
        self.writes
            .iter()
            .filter(|w| w.offset == REG_CMD)
            .map(|w| w.value)
            .collect()
    }

    fn dma_reg(&self, offset: u64) -> u64 {
        self.dma_regs.get(&offset).copied().unwrap_or(0) as u64
    }
}

impl HardwarePort for SimPort {
    fn read_reg(&mut self, replica: usize, offset: u64) -> u64 {
        if offset == REG_STAT {
            if self.hang || self.busy > 0 {
                self.busy = self.busy.saturating_sub(1);
                return self.stat | 0x1;
            }
            return self.stat;
        }
        self.reg(replica, offset).unwrap_or(0)
    }

    fn write_reg(&mut self, replica: usize, offset: u64, value: u64) {
        if offset == REG_CMD {
            match value {
                CMD_EXEC => self.busy = self.exec_polls,
                CMD_RESET => self.busy = 0,
                _ => {}
            }
        }
        self.regs.insert((replica, offset), value);
        self.writes.push(RegWrite {
            replica,
            offset,
            value,
        });
    }

    fn read_dma(&mut self, offset: u64) -> u32 {
        if offset == MM2S_DMASR || offset == S2MM_DMASR {
            return self.fault.unwrap_or(DMASR_IDLE);
        }
        self.dma_regs.get(&offset).copied().unwrap_or(0)
    }

    fn write_dma(&mut self, offset: u64, value: u32) {
        self.dma_regs.insert(offset, value);
        if offset == S2MM_LENGTH {
            let src = self.dma_reg(MM2S_SA) | self.dma_reg(MM2S_SA_MSB) << 32;
            let dst = self.dma_reg(S2MM_DA) | self.dma_reg(S2MM_DA_MSB) << 32;
            self.dma.push(DmaRecord {
                src,
                dst,
                bytes: value,
                during_exec: self.hang || self.busy > 0,
            });
        }
    }
}
