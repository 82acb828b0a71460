// lane.rs — One lane: a bus of chained replicas and its dispatch sequence
//
// A dispatch runs DRAIN, writes configuration, boundary-register preloads
// and address registers, runs LOAD, kicks EXEC, issues the EXEC-phase
// prefetches and drains while the fabric runs, waits for EXEC, then runs the
// optional write-back phases.
//
// Preconditions: the port belongs to a fabric reset by `Lane::open`.
// Postconditions: on success the coherency state is back at `Phase::None`.
// Failure modes: `DepthMismatch` before any transfer; `DmaFault`, `Timeout`
//                and `DoubleWrite` abort the dispatch. The lane refuses
//                further dispatches until `Lane::reset`.
// Side effects: register and DMA accesses, serialized by the bus lock.

use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::arch::{GridDepth, GRID_WIDTH};
use crate::conf::LmmiWord;
use crate::emit::{AddrRegs, Emitted};

use super::coherency::{CoherencyState, Direction, Phase, Plan, Table, Transfer, Writeback};
use super::mmio::{self, *};
use super::{RuntimeConfig, RuntimeError, RuntimeResult};

// ── Dispatch request and report ────────────────────────────────────────────

/// One invocation of a compiled kernel.
#[derive(Debug, Clone)]
pub struct Dispatch<'k> {
    pub kernel: &'k Emitted,
    /// Per-replica descriptor tables; the compiled table serves every
    /// replica when absent.
    pub tables: Option<Vec<Table>>,
    pub writeback: Writeback,
}

impl<'k> Dispatch<'k> {
    pub fn new(kernel: &'k Emitted) -> Self {
        Dispatch {
            kernel,
            tables: None,
            writeback: Writeback::Keep,
        }
    }

    pub fn with_tables(mut self, tables: Vec<Table>) -> Self {
        self.tables = Some(tables);
        self
    }

    pub fn with_writeback(mut self, writeback: Writeback) -> Self {
        self.writeback = writeback;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseReport {
    pub phase: Phase,
    pub transfers: Vec<Transfer>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub phases: Vec<PhaseReport>,
    /// Configuration words were rewritten (the fingerprint changed).
    pub conf_written: bool,
    pub exec_polls: u64,
}

impl DispatchReport {
    pub fn transfers(&self, phase: Phase) -> &[Transfer] {
        self.phases
            .iter()
            .find(|p| p.phase == phase)
            .map(|p| p.transfers.as_slice())
            .unwrap_or(&[])
    }

    pub fn total_transfers(&self) -> usize {
        self.phases.iter().map(|p| p.transfers.len()).sum()
    }
}

// ── Lane ───────────────────────────────────────────────────────────────────

struct LaneState {
    coherency: CoherencyState,
    last_conf: Option<[u8; 32]>,
    csel: Vec<Option<u8>>,
}

impl LaneState {
    fn new(depth: GridDepth, config: &RuntimeConfig) -> Self {
        LaneState {
            coherency: CoherencyState::new(depth.rows(), config.replicas, config.coalesce_words),
            last_conf: None,
            csel: vec![None; config.replicas],
        }
    }
}

/// Reset the fabric and DMA engine, program translation, report the depth.
fn init_port<P: HardwarePort>(port: &mut P, config: &RuntimeConfig) -> RuntimeResult<GridDepth> {
    port.write_reg(0, REG_CMD, CMD_RESET);
    let live = stat_depth(port.read_reg(0, REG_STAT));
    let depth = GridDepth::from_rows(live)
        .ok_or_else(|| RuntimeError::Unsupported(format!("fabric reports depth {}", live)))?;
    port.write_reg(0, REG_MCID, config.replicas as u64 - 1);
    port.write_reg(0, REG_ADTR, config.addr_map.adtr());
    port.write_reg(0, REG_DMRP, 0);
    port.write_dma(MM2S_DMACR, DMACR_RESET);
    port.write_dma(MM2S_DMASR, DMASR_CLEAR_ALL);
    port.write_dma(S2MM_DMACR, DMACR_RESET);
    port.write_dma(S2MM_DMASR, DMASR_CLEAR_ALL);
    Ok(depth)
}

pub struct Lane<P: HardwarePort> {
    config: RuntimeConfig,
    depth: GridDepth,
    bus: Mutex<P>,
    state: Mutex<LaneState>,
}

impl<P: HardwarePort> Lane<P> {
    /// Reset the fabric, read its depth and set up translation and DMA.
    pub fn open(mut port: P, config: RuntimeConfig) -> RuntimeResult<Self> {
        config.validate()?;
        let depth = init_port(&mut port, &config)?;
        info!(depth = depth.rows(), replicas = config.replicas, "lane open");

        Ok(Lane {
            config,
            depth,
            bus: Mutex::new(port),
            state: Mutex::new(LaneState::new(depth, &config)),
        })
    }

    /// Bring the lane back after an aborted dispatch.
    ///
    /// Resets the fabric and both DMA channels and forgets every resident
    /// window, so the next dispatch reloads from main memory. Dirty windows
    /// that were never written back are lost; their count is returned.
    pub fn reset(&self) -> RuntimeResult<usize> {
        let mut state = self.state.lock();
        let mut bus = self.bus.lock();
        let depth = init_port(&mut *bus, &self.config)?;
        if depth != self.depth {
            return Err(RuntimeError::DepthMismatch {
                compiled: self.depth,
                live: depth.rows() as u32,
            });
        }
        let interrupted = state.coherency.phase();
        let lost = state.coherency.dirty().count();
        if lost > 0 {
            warn!(lost, "lane reset discards unwritten windows");
        }
        *state = LaneState::new(depth, &self.config);
        info!(%interrupted, "lane reset");
        Ok(lost)
    }

    pub fn depth(&self) -> GridDepth {
        self.depth
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Exclusive access to the port, e.g. to inspect a simulator.
    pub fn port(&self) -> MutexGuard<'_, P> {
        self.bus.lock()
    }

    /// Dirty windows currently held in local memories.
    pub fn dirty_windows(&self) -> usize {
        self.state.lock().coherency.dirty().count()
    }

    pub fn dispatch(&self, d: &Dispatch<'_>) -> RuntimeResult<DispatchReport> {
        if d.kernel.depth != self.depth {
            return Err(RuntimeError::DepthMismatch {
                compiled: d.kernel.depth,
                live: self.depth.rows() as u32,
            });
        }
        let tables = match &d.tables {
            Some(t) => t.clone(),
            None => vec![d.kernel.lmmi.clone(); self.config.replicas],
        };

        let mut state = self.state.lock();
        let mut report = DispatchReport::default();
        let fingerprint = d.kernel.fingerprint();

        state.coherency.begin(tables, d.kernel.mapdist)?;
        self.run_phase(&mut state, &mut report)?;
        state.coherency.advance(Phase::Load)?;

        {
            let t = Instant::now();
            let mut bus = self.bus.lock();
            if state.last_conf != Some(fingerprint) {
                for c in 0..self.config.replicas {
                    write_conf(&mut *bus, c, d.kernel);
                }
                state.last_conf = Some(fingerprint);
                report.conf_written = true;
            }
            for (c, table) in state.coherency.current().iter().enumerate() {
                for p in &d.kernel.breg {
                    bus.write_reg(c, breg_offset(p.loc.row, p.loc.col, p.lane), p.value);
                }
                write_addr(&mut *bus, c, d.kernel, table);
            }
            debug!(
                conf = report.conf_written,
                elapsed_us = t.elapsed().as_micros() as u64,
                "registers written"
            );
        }

        self.run_phase(&mut state, &mut report)?;
        state.coherency.advance(Phase::Exec)?;

        // EXEC-phase prefetches and drains overlap the run.
        self.start_exec();
        self.run_phase(&mut state, &mut report)?;
        report.exec_polls = self.wait_exec()?;

        let post: &[Phase] = match d.writeback {
            Writeback::Keep => &[],
            Writeback::Drain => &[Phase::PostDrain],
            Writeback::Refresh => &[Phase::PostDrain, Phase::PostLoad],
        };
        for &phase in post {
            state.coherency.advance(phase)?;
            self.run_phase(&mut state, &mut report)?;
        }
        state.coherency.advance(Phase::None)?;
        Ok(report)
    }

    /// Write back every dirty window. Only between dispatches.
    pub fn flush(&self) -> RuntimeResult<Vec<Transfer>> {
        let mut state = self.state.lock();
        let plan = state.coherency.plan_flush()?;
        let transfers = plan.transfers.clone();
        self.issue(&mut state, &plan)?;
        state.coherency.apply(plan)?;
        debug!(transfers = transfers.len(), "flush complete");
        Ok(transfers)
    }

    fn run_phase(&self, state: &mut LaneState, report: &mut DispatchReport) -> RuntimeResult<()> {
        let t = Instant::now();
        let plan = state.coherency.plan()?;
        self.issue(state, &plan)?;
        let phase = plan.phase;
        let transfers = plan.transfers.clone();
        state.coherency.apply(plan)?;
        let elapsed = t.elapsed();
        debug!(
            %phase,
            transfers = transfers.len(),
            words = transfers.iter().map(|t| t.words as u64).sum::<u64>(),
            elapsed_us = elapsed.as_micros() as u64,
            "phase complete"
        );
        report.phases.push(PhaseReport {
            phase,
            transfers,
            elapsed,
        });
        Ok(())
    }

    fn issue(&self, state: &mut LaneState, plan: &Plan) -> RuntimeResult<()> {
        if plan.is_empty() {
            return Ok(());
        }
        let mut bus = self.bus.lock();
        for t in &plan.transfers {
            if state.csel[t.replica] != Some(t.col) {
                bus.write_reg(t.replica, REG_CSEL, t.col as u64);
                state.csel[t.replica] = Some(t.col);
            }
            self.kick(&mut *bus, t)?;
        }
        Ok(())
    }

    /// Program both DMA channels in simple mode and wait for them.
    fn kick(&self, bus: &mut P, t: &Transfer) -> RuntimeResult<()> {
        let map = self.config.addr_map;
        let bytes = t.bytes() as u32;
        let (src, dst) = match t.dir {
            Direction::ToLmm => (map.ddr(t.addr), map.lmm(t.addr)),
            Direction::ToMem => {
                poll(self.config.poll_limit, "local-memory ring", || {
                    bus.read_reg(t.replica, REG_STAT) & STAT_LMRING_BUSY == 0
                })?;
                bus.write_reg(t.replica, REG_DMRP, mmio::dmrp(t.bytes(), map.lmm(t.addr)));
                (map.lmm(t.addr), map.ddr(t.addr))
            }
        };
        bus.write_dma(MM2S_DMACR, DMACR_RUN);
        bus.write_dma(MM2S_SA, src as u32);
        bus.write_dma(MM2S_SA_MSB, (src >> 32) as u32);
        bus.write_dma(MM2S_LENGTH, bytes);
        bus.write_dma(S2MM_DMACR, DMACR_RUN);
        bus.write_dma(S2MM_DA, dst as u32);
        bus.write_dma(S2MM_DA_MSB, (dst >> 32) as u32);
        bus.write_dma(S2MM_LENGTH, bytes);

        let mut fault = None;
        poll(self.config.poll_limit, "dma", || {
            let mm2s = bus.read_dma(MM2S_DMASR);
            let s2mm = bus.read_dma(S2MM_DMASR);
            if (mm2s | s2mm) & DMASR_ERR != 0 {
                fault = Some((mm2s, s2mm));
                return true;
            }
            mm2s & s2mm & DMASR_IDLE != 0
        })?;
        if let Some((mm2s, s2mm)) = fault {
            bus.write_dma(MM2S_DMACR, DMACR_RESET);
            warn!(mm2s, s2mm, addr = t.addr, "dma fault");
            return Err(RuntimeError::DmaFault { mm2s, s2mm });
        }
        bus.write_dma(MM2S_DMASR, DMASR_IOC_CLEAR);
        if t.dir == Direction::ToMem {
            bus.write_reg(t.replica, REG_DMRP, 0);
        }
        Ok(())
    }

    /// Start the chain; the head replica forwards the command.
    fn start_exec(&self) {
        self.bus.lock().write_reg(0, REG_CMD, CMD_EXEC);
    }

    /// Wait until every replica's EXRING is idle.
    fn wait_exec(&self) -> RuntimeResult<u64> {
        let mut bus = self.bus.lock();
        let mut polls = 0;
        for c in 0..self.config.replicas {
            polls += poll(self.config.poll_limit, "exec", || {
                bus.read_reg(c, REG_STAT) & STAT_EXRING_MASK == 0
            })?;
        }
        Ok(polls)
    }
}

/// Busy-wait until `done`, returning the number of polls taken.
fn poll(limit: Option<u64>, what: &'static str, mut done: impl FnMut() -> bool) -> RuntimeResult<u64> {
    let mut polls = 0u64;
    while !done() {
        polls += 1;
        if limit.is_some_and(|l| polls >= l) {
            return Err(RuntimeError::Timeout { what, polls });
        }
        std::hint::spin_loop();
    }
    Ok(polls)
}

fn write_conf<P: HardwarePort>(bus: &mut P, replica: usize, kernel: &Emitted) {
    for (cell, words) in kernel.words.chunks(4).enumerate() {
        let base = conf_offset((cell / GRID_WIDTH) as u8, (cell % GRID_WIDTH) as u8);
        for (k, v) in words.iter().enumerate() {
            bus.write_reg(replica, base + 8 * k as u64, *v);
        }
    }
}

/// Address registers take the effective-address fields from the kernel and
/// the window bounds from the replica's descriptors.
fn write_addr<P: HardwarePort>(bus: &mut P, replica: usize, kernel: &Emitted, table: &Table) {
    for (r, row) in kernel.addr.iter().enumerate() {
        for c in 0..GRID_WIDTH {
            let regs = window_regs(row[c], &table[r][c]);
            let base = addr_offset(r as u8, c as u8);
            for (k, v) in addr_words(&regs).into_iter().enumerate() {
                bus.write_reg(replica, base + 8 * k as u64, v);
            }
        }
    }
}

fn window_regs(mut regs: AddrRegs, d: &LmmiWord) -> AddrRegs {
    if d.v && d.len > 0 {
        regs.top = d.top as u32;
        regs.bot = d.end().wrapping_sub(1) as u32;
    }
    regs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::sim::SimPort;

    fn kernel(depth: GridDepth) -> Emitted {
        let rows = depth.rows();
        let mut lmmi = vec![[LmmiWord::default(); GRID_WIDTH]; rows];
        lmmi[0][0] = LmmiWord {
            v: true,
            bcas: 1,
            len: 16,
            top: 0x1000,
            ..LmmiWord::default()
        };
        lmmi[1][0] = LmmiWord {
            v: true,
            rw: true,
            bcas: 1,
            len: 8,
            top: 0x8000,
            ..LmmiWord::default()
        };
        Emitted {
            depth,
            mapdist: 0,
            conf: vec![Default::default(); rows],
            lmmi,
            breg: vec![crate::emit::RegPreload {
                loc: crate::arch::Loc::new(0, 1),
                lane: 2,
                value: 42,
            }],
            addr: vec![Default::default(); rows],
            words: vec![0; rows * GRID_WIDTH * 4],
        }
    }

    fn lane(depth: GridDepth) -> Lane<SimPort> {
        Lane::open(SimPort::new(depth), RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn open_reads_depth_and_programs_translation() {
        let l = lane(GridDepth::D16);
        assert_eq!(l.depth(), GridDepth::D16);
        let port = l.port();
        assert_eq!(port.commands(), vec![CMD_RESET]);
        assert_eq!(port.reg(0, REG_ADTR), Some(RuntimeConfig::default().addr_map.adtr()));
    }

    #[test]
    fn depth_mismatch_fails_before_any_transfer() {
        let l = lane(GridDepth::D16);
        let k = kernel(GridDepth::D8);
        let err = l.dispatch(&Dispatch::new(&k)).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::DepthMismatch {
                compiled: GridDepth::D8,
                live: 16
            }
        );
        assert!(l.port().dma.is_empty());
        assert_eq!(l.port().writes_in(REG_CONF, REG_LDDM), 0);
    }

    #[test]
    fn dispatch_loads_executes_and_marks_dirty() {
        let l = lane(GridDepth::D8);
        let k = kernel(GridDepth::D8);
        let r = l.dispatch(&Dispatch::new(&k)).unwrap();
        assert!(r.conf_written);
        assert_eq!(r.transfers(Phase::Load).len(), 1);
        assert!(r.exec_polls > 0);
        assert_eq!(l.dirty_windows(), 1);

        let port = l.port();
        let map = RuntimeConfig::default().addr_map;
        assert_eq!(port.dma.len(), 1);
        assert_eq!(port.dma[0].src, map.ddr(0x1000));
        assert_eq!(port.dma[0].dst, map.lmm(0x1000));
        assert_eq!(port.dma[0].bytes, 64);
        assert_eq!(port.reg(0, breg_offset(0, 1, 2)), Some(42));
        assert_eq!(port.reg(0, addr_offset(1, 0) + 16), Some(0x801f_0000_8000));
        assert!(port.commands().contains(&CMD_EXEC));
    }

    #[test]
    fn redispatch_skips_conf_and_resident_loads() {
        let l = lane(GridDepth::D8);
        let k = kernel(GridDepth::D8);
        l.dispatch(&Dispatch::new(&k)).unwrap();
        let conf_writes = l.port().writes_in(REG_CONF, REG_BREG);
        let r = l.dispatch(&Dispatch::new(&k)).unwrap();
        assert!(!r.conf_written);
        assert_eq!(r.total_transfers(), 0);
        assert_eq!(l.port().writes_in(REG_CONF, REG_BREG), conf_writes);
        assert_eq!(l.port().dma.len(), 1);
    }

    #[test]
    fn drain_writeback_empties_local_memories() {
        let l = lane(GridDepth::D8);
        let k = kernel(GridDepth::D8);
        let r = l
            .dispatch(&Dispatch::new(&k).with_writeback(Writeback::Drain))
            .unwrap();
        let drained = r.transfers(Phase::PostDrain);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].dir, Direction::ToMem);
        assert_eq!(l.dirty_windows(), 0);
        let port = l.port();
        let last = port.dma.last().unwrap();
        assert_eq!(last.dst, RuntimeConfig::default().addr_map.ddr(0x8000));
        assert_eq!(port.reg(0, REG_DMRP), Some(0));
        assert_eq!(port.reg(0, REG_CSEL), Some(0));
    }

    #[test]
    fn flush_drains_once() {
        let l = lane(GridDepth::D8);
        let k = kernel(GridDepth::D8);
        l.dispatch(&Dispatch::new(&k)).unwrap();
        assert_eq!(l.flush().unwrap().len(), 1);
        assert!(l.flush().unwrap().is_empty());
    }

    #[test]
    fn hung_fabric_times_out() {
        let config = RuntimeConfig {
            poll_limit: Some(100),
            ..RuntimeConfig::default()
        };
        let l = Lane::open(SimPort::new(GridDepth::D8).hang(), config).unwrap();
        let k = kernel(GridDepth::D8);
        let err = l.dispatch(&Dispatch::new(&k)).unwrap_err();
        assert_eq!(err, RuntimeError::Timeout { what: "exec", polls: 100 });
    }

    #[test]
    fn dma_error_bits_fault() {
        let l = lane(GridDepth::D8);
        l.port().inject_dma_fault(0x10);
        let k = kernel(GridDepth::D8);
        let err = l.dispatch(&Dispatch::new(&k)).unwrap_err();
        assert!(matches!(err, RuntimeError::DmaFault { mm2s: 0x10, .. }));
    }

    #[test]
    fn exec_phase_prefetch_runs_while_fabric_executes() {
        let l = lane(GridDepth::D8);
        let k = kernel(GridDepth::D8);
        let mut table = vec![[LmmiWord::default(); GRID_WIDTH]; 8];
        table[2][0] = LmmiWord {
            v: true,
            p: true,
            bcas: 1,
            len: 16,
            top: 0x4000,
            ofs: 0x40,
            ..LmmiWord::default()
        };
        let r = l.dispatch(&Dispatch::new(&k).with_tables(vec![table])).unwrap();
        let prefetched = r.transfers(Phase::Exec);
        assert_eq!(prefetched.len(), 1);
        assert_eq!(prefetched[0].addr, 0x4040);

        let port = l.port();
        let during: Vec<bool> = port.dma.iter().map(|d| d.during_exec).collect();
        assert_eq!(during, vec![false, true]);
    }

    #[test]
    fn aborted_dispatch_blocks_lane_until_reset() {
        let l = lane(GridDepth::D8);
        let k = kernel(GridDepth::D8);
        l.port().inject_dma_fault(0x10);
        assert!(matches!(
            l.dispatch(&Dispatch::new(&k)),
            Err(RuntimeError::DmaFault { .. })
        ));
        l.port().clear_dma_fault();
        assert!(matches!(
            l.dispatch(&Dispatch::new(&k)),
            Err(RuntimeError::PhaseOrder { .. })
        ));

        assert_eq!(l.reset().unwrap(), 0);
        assert_eq!(l.port().commands().iter().filter(|&&c| c == CMD_RESET).count(), 2);
        let r = l.dispatch(&Dispatch::new(&k)).unwrap();
        assert!(r.conf_written);
        assert_eq!(r.transfers(Phase::Load).len(), 1);
        assert_eq!(l.dirty_windows(), 1);
    }

    #[test]
    fn reset_reports_lost_dirty_windows() {
        let l = lane(GridDepth::D8);
        let k = kernel(GridDepth::D8);
        l.dispatch(&Dispatch::new(&k)).unwrap();
        assert_eq!(l.reset().unwrap(), 1);
        assert_eq!(l.dirty_windows(), 0);
        assert!(l.flush().unwrap().is_empty());
    }

    #[test]
    fn replicas_get_their_own_windows() {
        let config = RuntimeConfig {
            replicas: 2,
            ..RuntimeConfig::default()
        };
        let l = Lane::open(SimPort::new(GridDepth::D8), config).unwrap();
        let k = kernel(GridDepth::D8);
        let mut second = k.lmmi.clone();
        second[0][0].top = 0x2000;
        second[1][0].top = 0x9000;
        let r = l
            .dispatch(&Dispatch::new(&k).with_tables(vec![k.lmmi.clone(), second]))
            .unwrap();
        let loads = r.transfers(Phase::Load);
        assert_eq!(loads.len(), 2);
        assert_eq!((loads[1].replica, loads[1].addr), (1, 0x2000));
        assert_eq!(l.port().reg(1, addr_offset(0, 0) + 16), Some(0x203f_0000_2000));
        assert_eq!(l.port().reg(0, REG_MCID), Some(1));
    }

    #[test]
    fn lanes_can_be_shared_between_threads() {
        let l = lane(GridDepth::D8);
        let k = kernel(GridDepth::D8);
        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| l.dispatch(&Dispatch::new(&k)).unwrap());
            }
        });
        assert_eq!(l.port().dma.len(), 1);
    }
}
