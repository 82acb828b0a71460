// coherency.rs — Local-memory coherency decisions per dispatch phase
//
// Keeps two descriptor tables per replica (the dispatch in flight and the one
// before it) plus a dirty bitmap, and decides for every (row, column,
// replica) which windows must move between main memory and the local
// memories in each phase. `plan` is pure; `apply` commits its dirty state.
//
// Preconditions: tables hold `depth` rows per replica.
// Postconditions: the buffers swap exactly once per dispatch, on the
//                 DRAIN → LOAD transition, after the drain plan was applied.
// Failure modes: `PhaseOrder` on an illegal transition, `DoubleWrite` when two
//                drains of one phase overlap in memory, `WindowOverflow` when
//                a staged window runs past the end of the address space.
// Side effects: none (transfers are issued by the lane).

use std::fmt;

use crate::arch::GRID_WIDTH;
use crate::conf::LmmiWord;

use super::{RuntimeError, RuntimeResult};

/// One replica's descriptors, indexed by row.
pub type Table = Vec<[LmmiWord; GRID_WIDTH]>;

// Status codes (v|rw|f|p) of the decision table.
const LMR: u8 = 0b1000;
const LMP: u8 = 0b1001;
const LMF: u8 = 0b1010;
const LMW: u8 = 0b1100;
const LMD: u8 = 0b1101;
const LMX: u8 = 0b1110;

// ── Phases ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    None,
    Drain,
    Load,
    Exec,
    PostDrain,
    PostLoad,
}

impl Phase {
    /// Legal transitions. DRAIN is entered only through `begin`.
    fn may_follow(self, current: Phase) -> bool {
        use Phase::*;
        matches!(
            (current, self),
            (Drain, Load)
                | (Load, Exec)
                | (Exec, None)
                | (Exec, PostDrain)
                | (PostDrain, None)
                | (PostDrain, PostLoad)
                | (PostLoad, None)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::None => "none",
            Phase::Drain => "drain",
            Phase::Load => "load",
            Phase::Exec => "exec",
            Phase::PostDrain => "post-drain",
            Phase::PostLoad => "post-load",
        };
        f.write_str(s)
    }
}

/// What happens to dirty windows once a dispatch has executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Writeback {
    /// Leave them resident; a later dispatch or `flush` drains them.
    #[default]
    Keep,
    /// Drain every dirty window of this dispatch.
    Drain,
    /// Drain, then reload read windows whose memory was just written.
    Refresh,
}

// ── Transfers ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Main memory into a local memory.
    ToLmm,
    /// Local memory back to main memory.
    ToMem,
}

/// One DMA transaction, possibly covering several consecutive rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub dir: Direction,
    pub replica: usize,
    pub col: u8,
    /// First row covered.
    pub row: u8,
    pub rows: u8,
    pub addr: u64,
    /// Length in 32-bit words.
    pub words: u32,
}

impl Transfer {
    fn new(dir: Direction, replica: usize, row: usize, col: usize, addr: u64, words: u32) -> Self {
        Transfer {
            dir,
            replica,
            col: col as u8,
            row: row as u8,
            rows: 1,
            addr,
            words,
        }
    }

    pub fn bytes(&self) -> u64 {
        self.words as u64 * 4
    }

    pub fn end(&self) -> u64 {
        self.addr + self.bytes()
    }

    fn absorbs(&self, next: &Transfer, limit: u32) -> bool {
        self.dir == next.dir
            && self.replica == next.replica
            && self.col == next.col
            && self.row as usize + self.rows as usize == next.row as usize
            && self.end() == next.addr
            && self.words + next.words <= limit
    }
}

// ── Dirty bitmap ───────────────────────────────────────────────────────────

/// One bit per replica for every (row, column).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyMap {
    rows: Vec<[u8; GRID_WIDTH]>,
}

impl DirtyMap {
    pub fn new(depth: usize) -> Self {
        DirtyMap {
            rows: vec![[0; GRID_WIDTH]; depth],
        }
    }

    pub fn is_dirty(&self, row: usize, col: usize, replica: usize) -> bool {
        self.rows[row][col] & (1 << replica) != 0
    }

    fn set(&mut self, row: usize, col: usize, replica: usize) {
        self.rows[row][col] |= 1 << replica;
    }

    fn clear(&mut self, row: usize, col: usize, replica: usize) {
        self.rows[row][col] &= !(1 << replica);
    }

    pub fn count(&self) -> usize {
        self.rows
            .iter()
            .flatten()
            .map(|b| b.count_ones() as usize)
            .sum()
    }
}

/// The outcome of one phase decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub phase: Phase,
    pub transfers: Vec<Transfer>,
    /// Dirty bitmap once the transfers complete.
    pub dirty: DirtyMap,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub fn words(&self) -> u64 {
        self.transfers.iter().map(|t| t.words as u64).sum()
    }
}

// ── Per-cell comparison ────────────────────────────────────────────────────

/// Status code of an incoming descriptor: copies and windows without an
/// address are not valid unless they stream through a forced prefetch.
fn incoming_status(d: &LmmiWord) -> u8 {
    let v = d.v && !d.hcopy && !d.vcopy && ((d.f && d.p) || d.top != 0);
    (v as u8) << 3 | d.status() & 0b0111
}

/// The resident window holds exactly the incoming one.
fn ready(prev: &LmmiWord, cur: &LmmiWord) -> bool {
    prev.v && prev.blk == cur.blk && prev.len == cur.len && prev.top == cur.top
}

/// The resident window was prefetched for the incoming one.
fn ready_prefetched(prev: &LmmiWord, cur: &LmmiWord) -> bool {
    prev.v
        && prev.blk == cur.blk
        && prev.len == cur.len
        && prev.top.wrapping_add(prev.ofs as i64 as u64) == cur.top
}

fn partner_addr(d: &LmmiWord) -> u64 {
    d.top.wrapping_add(d.ofs as i64 as u64)
}

/// Every window, and the partner of a prefetching one, must end inside the
/// address space; transfer ends are computed without wrapping.
fn check_windows(table: &Table, replica: usize) -> RuntimeResult<()> {
    for (row, cells) in table.iter().enumerate() {
        for (col, d) in cells.iter().enumerate() {
            if !d.v {
                continue;
            }
            let bytes = d.len as u64 * 4;
            let partner = d.p.then(|| (d.top as i128 + d.ofs as i128, bytes));
            let own_fits = d.top.checked_add(bytes).is_some();
            let partner_fits = partner.map_or(true, |(top, bytes)| {
                top >= 0 && u64::try_from(top).ok().and_then(|t| t.checked_add(bytes)).is_some()
            });
            if !own_fits || !partner_fits {
                return Err(RuntimeError::WindowOverflow {
                    replica,
                    row,
                    col,
                    top: d.top,
                    bytes,
                });
            }
        }
    }
    Ok(())
}

// ── State ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CoherencyState {
    depth: usize,
    replicas: usize,
    coalesce_words: u32,
    tables: [Vec<Table>; 2],
    /// Buffer holding the dispatch that owns the fabric.
    cur: usize,
    /// A new dispatch sits in the other buffer, not yet swapped in.
    staged: bool,
    lastdist: u8,
    dirty: DirtyMap,
    phase: Phase,
    applied: bool,
    /// Memory ranges written back during the dispatch in flight.
    written: Vec<(u64, u64)>,
}

impl CoherencyState {
    pub fn new(depth: usize, replicas: usize, coalesce_words: u32) -> Self {
        let empty: Vec<Table> = vec![vec![[LmmiWord::default(); GRID_WIDTH]; depth]; replicas];
        CoherencyState {
            depth,
            replicas,
            coalesce_words,
            tables: [empty.clone(), empty],
            cur: 0,
            staged: false,
            lastdist: 0,
            dirty: DirtyMap::new(depth),
            phase: Phase::None,
            applied: false,
            written: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn dirty(&self) -> &DirtyMap {
        &self.dirty
    }

    /// Descriptors of the dispatch that owns the fabric.
    pub fn current(&self) -> &[Table] {
        &self.tables[self.cur]
    }

    fn views(&self) -> (&[Table], &[Table]) {
        let (cur, prev) = if self.staged {
            (self.cur ^ 1, self.cur)
        } else {
            (self.cur, self.cur ^ 1)
        };
        (&self.tables[cur], &self.tables[prev])
    }

    /// Stage the descriptors of a new dispatch and enter DRAIN.
    ///
    /// `lastdist` is the row distance between a descriptor and the entry of
    /// the previous dispatch it is compared against.
    pub fn begin(&mut self, tables: Vec<Table>, lastdist: u8) -> RuntimeResult<()> {
        if self.phase != Phase::None {
            return Err(RuntimeError::PhaseOrder {
                current: self.phase,
                requested: Phase::Drain,
            });
        }
        if tables.len() != self.replicas {
            return Err(RuntimeError::ReplicaOutOfRange {
                replica: tables.len(),
                replicas: self.replicas,
            });
        }
        if let Some(t) = tables.iter().find(|t| t.len() != self.depth) {
            return Err(RuntimeError::Unsupported(format!(
                "descriptor table has {} rows, fabric has {}",
                t.len(),
                self.depth
            )));
        }
        for (c, table) in tables.iter().enumerate() {
            check_windows(table, c)?;
        }
        self.tables[self.cur ^ 1] = tables;
        self.staged = true;
        self.lastdist = lastdist % self.depth as u8;
        self.written.clear();
        self.phase = Phase::Drain;
        self.applied = false;
        Ok(())
    }

    /// Move to the next phase. Entering LOAD swaps the buffers.
    pub fn advance(&mut self, next: Phase) -> RuntimeResult<()> {
        if !next.may_follow(self.phase) || !self.applied {
            return Err(RuntimeError::PhaseOrder {
                current: self.phase,
                requested: next,
            });
        }
        if next == Phase::Load {
            self.cur ^= 1;
            self.staged = false;
        }
        if next == Phase::None {
            self.written.clear();
        }
        self.phase = next;
        self.applied = false;
        Ok(())
    }

    /// Decide the transfers of the current phase.
    pub fn plan(&self) -> RuntimeResult<Plan> {
        let mut dirty = self.dirty.clone();
        let mut transfers = Vec::new();
        let (cur_tables, prev_tables) = self.views();
        let lastdist = self.lastdist as usize;

        for c in 0..self.replicas {
            let (cur_t, prev_t) = (&cur_tables[c], &prev_tables[c]);
            for j in 0..GRID_WIDTH {
                for i in 0..self.depth {
                    let m = (i + lastdist) % self.depth;
                    let cur = &cur_t[i][j];
                    let prev = &prev_t[m][j];
                    let t = match self.phase {
                        Phase::Drain => drain_rule(prev, cur, &mut dirty, (m, j, c)),
                        Phase::Load => load_rule(prev, cur),
                        Phase::Exec => exec_rule(cur, lastdist, &mut dirty, (i, m, j, c)),
                        Phase::PostDrain => flush_rule(cur, &mut dirty, (i, j, c)),
                        Phase::PostLoad => self.refresh_rule(cur),
                        Phase::None => None,
                    };
                    if let Some((dir, addr, words)) = t {
                        transfers.push(Transfer::new(dir, c, i, j, addr, words));
                    }
                }
            }
        }

        if self.phase != Phase::Exec {
            transfers = coalesce(transfers, self.coalesce_words);
        }
        check_overlap(&transfers)?;
        Ok(Plan {
            phase: self.phase,
            transfers,
            dirty,
        })
    }

    /// Drain every dirty window of the resident dispatch. Only legal
    /// between dispatches.
    pub fn plan_flush(&self) -> RuntimeResult<Plan> {
        if self.phase != Phase::None {
            return Err(RuntimeError::PhaseOrder {
                current: self.phase,
                requested: Phase::PostDrain,
            });
        }
        let mut dirty = self.dirty.clone();
        let mut transfers = Vec::new();
        for (c, table) in self.current().iter().enumerate() {
            for j in 0..GRID_WIDTH {
                for (i, row) in table.iter().enumerate() {
                    if let Some((dir, addr, words)) = flush_rule(&row[j], &mut dirty, (i, j, c)) {
                        transfers.push(Transfer::new(dir, c, i, j, addr, words));
                    }
                }
            }
        }
        let transfers = coalesce(transfers, self.coalesce_words);
        check_overlap(&transfers)?;
        Ok(Plan {
            phase: Phase::None,
            transfers,
            dirty,
        })
    }

    /// Commit a plan once its transfers completed.
    pub fn apply(&mut self, plan: Plan) -> RuntimeResult<()> {
        if plan.phase != self.phase {
            return Err(RuntimeError::PhaseOrder {
                current: self.phase,
                requested: plan.phase,
            });
        }
        self.written.extend(
            plan.transfers
                .iter()
                .filter(|t| t.dir == Direction::ToMem)
                .map(|t| (t.addr, t.end())),
        );
        self.dirty = plan.dirty;
        self.applied = true;
        Ok(())
    }

    fn refresh_rule(&self, cur: &LmmiWord) -> Option<(Direction, u64, u32)> {
        let st = incoming_status(cur);
        if st & 0b1100 != LMR {
            return None;
        }
        let (lo, hi) = (cur.top, cur.end());
        self.written
            .iter()
            .any(|&(a, b)| a < hi && lo < b)
            .then_some((Direction::ToLmm, cur.top, cur.len))
    }
}

type Decision = Option<(Direction, u64, u32)>;

fn drain_rule(prev: &LmmiWord, cur: &LmmiWord, dirty: &mut DirtyMap, (m, j, c): (usize, usize, usize)) -> Decision {
    let prev_st = prev.status();
    let cur_st = incoming_status(cur);
    let reused = ready(prev, cur);
    let drain = dirty.is_dirty(m, j, c)
        && ((prev_st == LMW && !reused && cur_st != LMD) || prev_st == LMX);
    if !drain {
        return None;
    }
    dirty.clear(m, j, c);
    Some((Direction::ToMem, prev.top, prev.len))
}

fn load_rule(prev: &LmmiWord, cur: &LmmiWord) -> Decision {
    let load = match incoming_status(cur) {
        LMR => !ready(prev, cur),
        LMP => !ready_prefetched(prev, cur),
        LMF | LMX => true,
        _ => false,
    };
    load.then_some((Direction::ToLmm, cur.top, cur.len))
}

fn exec_rule(
    cur: &LmmiWord,
    lastdist: usize,
    dirty: &mut DirtyMap,
    (i, m, j, c): (usize, usize, usize, usize),
) -> Decision {
    match incoming_status(cur) {
        LMP if lastdist != 0 || cur.ofs != 0 => {
            Some((Direction::ToLmm, partner_addr(cur), cur.len))
        }
        LMW | LMX => {
            dirty.set(i, j, c);
            None
        }
        LMD => {
            let was_dirty = dirty.is_dirty(m, j, c);
            if lastdist == 0 {
                dirty.set(m, j, c);
            }
            was_dirty.then_some((Direction::ToMem, partner_addr(cur), cur.len))
        }
        _ => None,
    }
}

fn flush_rule(cur: &LmmiWord, dirty: &mut DirtyMap, (i, j, c): (usize, usize, usize)) -> Decision {
    if !dirty.is_dirty(i, j, c) {
        return None;
    }
    dirty.clear(i, j, c);
    Some((Direction::ToMem, cur.top, cur.len))
}

/// Merge transfers that continue each other in the same column.
fn coalesce(transfers: Vec<Transfer>, limit: u32) -> Vec<Transfer> {
    let mut out: Vec<Transfer> = Vec::with_capacity(transfers.len());
    for t in transfers {
        match out.last_mut() {
            Some(last) if last.absorbs(&t, limit) => {
                last.rows += 1;
                last.words += t.words;
            }
            _ => out.push(t),
        }
    }
    out
}

fn check_overlap(transfers: &[Transfer]) -> RuntimeResult<()> {
    let mut drains: Vec<&Transfer> = transfers
        .iter()
        .filter(|t| t.dir == Direction::ToMem)
        .collect();
    drains.sort_by_key(|t| t.addr);
    for w in drains.windows(2) {
        if w[1].addr < w[0].end() {
            return Err(RuntimeError::DoubleWrite {
                first: w[0].addr,
                first_end: w[0].end(),
                second: w[1].addr,
                second_end: w[1].end(),
            });
        }
    }
    Ok(())
}
