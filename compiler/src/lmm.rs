// lmm.rs — Local-memory descriptor synthesis, merge and broadcast
//
// One descriptor per cell describes the main-memory window the cell's local
// memory mirrors. Three passes refine the table:
//
//   synthesize  one descriptor per memory record needing main-memory traffic
//   merge       adjacent identical columns share capacity (4-way, 2-way)
//   broadcast   identical read windows in non-adjacent rows share a refresh
//
// Preconditions: placement has committed every memory record.
// Postconditions: merged descriptors compare equal on every field that
//                 defines their window; mirrored rows agree on merge modes.
// Failure modes: Conflict (two windows in one cell, write-write broadcast),
//                Capacity (window larger than the region), MergeConsistency
//                (mirror disagreement), Malformed (bad window operands).
// Side effects: none.

use serde::Serialize;
use tracing::debug;

use crate::arch::{GridDepth, Loc, GRID_WIDTH};
use crate::diag::{codes, CompileError, CompileResult};
use crate::grid::CompilationContext;
use crate::microop::{MemInsn, Operand};
use crate::opcode::{MemOp, MemUnit};

/// Longest window the 19-bit length field can describe, in words.
pub const MAX_WINDOW_WORDS: u64 = 1 << 19;

/// How a cell's local memory is grouped with its neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    #[default]
    Unused,
    Private,
    Pair,
    Quad,
}

impl MergeMode {
    pub fn code(self) -> u8 {
        match self {
            MergeMode::Unused => 0,
            MergeMode::Private => 1,
            MergeMode::Pair => 2,
            MergeMode::Quad => 3,
        }
    }

    /// Number of cells sharing one capacity region.
    pub fn group(self) -> u32 {
        match self {
            MergeMode::Unused | MergeMode::Private => 1,
            MergeMode::Pair => 2,
            MergeMode::Quad => 4,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LmmDescriptor {
    pub valid: bool,
    /// Write-class (drained back to main memory).
    pub write: bool,
    /// Refresh on every dispatch.
    pub force: bool,
    /// Prefetch or drain against the partner row.
    pub prefetch: bool,
    /// Columns served by this region (set on masters).
    pub bcas: u8,
    pub hcopy: bool,
    pub vcopy: bool,
    pub blk: u8,
    pub cidx: bool,
    /// Window length in 32-bit words.
    pub len: u32,
    /// Byte offset of the prefetch/drain partner window from `top`.
    pub ofs: i32,
    pub top: u64,
    pub mode: MergeMode,
    /// Region owner for copies.
    pub master: Option<Loc>,
    /// Transaction traffic (`LDDMQ`, `TR`).
    pub direct: bool,
    pub symbol: Option<String>,
}

impl LmmDescriptor {
    /// Status nibble as the runtime classifies it: v, rw, f, p (MSB first).
    pub fn status(&self) -> u8 {
        (self.valid as u8) << 3 | (self.write as u8) << 2 | (self.force as u8) << 1 | self.prefetch as u8
    }

    pub fn class(&self) -> &'static str {
        match self.status() {
            8 => "lmr",
            9 => "lmp",
            10 => "lmf",
            11 => "lddmq",
            12 => "lmw",
            13 => "lmd",
            14 => "lmx",
            15 => "tr",
            _ => "-",
        }
    }

    /// Region accepts bus writes: lmr, lmp, lmf and lmx. Transaction
    /// descriptors never touch the region.
    pub fn bus_fills(&self) -> bool {
        matches!(self.status(), 8 | 9 | 10 | 14)
    }

    /// Region answers bus reads: lmw, lmd and lmx.
    pub fn bus_drains(&self) -> bool {
        matches!(self.status(), 12 | 13 | 14)
    }

    pub fn window(&self) -> (u64, u32, u8) {
        (self.top, self.len, self.blk)
    }

    pub fn is_copy(&self) -> bool {
        self.hcopy || self.vcopy
    }

    /// Two descriptors may share one capacity region.
    pub fn mergeable(&self, other: &LmmDescriptor) -> bool {
        self.valid
            && other.valid
            && !self.direct
            && !other.direct
            && self.write == other.write
            && self.force == other.force
            && self.prefetch == other.prefetch
            && self.blk == other.blk
            && self.len == other.len
            && self.top == other.top
            && self.ofs == other.ofs
            && self.cidx == other.cidx
    }

    fn plain_read(&self) -> bool {
        self.valid && !self.write && !self.force && !self.prefetch && !self.direct
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LmmTable {
    depth: GridDepth,
    rows: Vec<[LmmDescriptor; GRID_WIDTH]>,
}

impl LmmTable {
    pub fn new(depth: GridDepth) -> Self {
        LmmTable {
            depth,
            rows: (0..depth.rows()).map(|_| Default::default()).collect(),
        }
    }

    pub fn depth(&self) -> GridDepth {
        self.depth
    }

    pub fn get(&self, loc: Loc) -> &LmmDescriptor {
        &self.rows[loc.row as usize][loc.col as usize]
    }

    pub fn get_mut(&mut self, loc: Loc) -> &mut LmmDescriptor {
        &mut self.rows[loc.row as usize][loc.col as usize]
    }

    pub fn row(&self, row: u8) -> &[LmmDescriptor; GRID_WIDTH] {
        &self.rows[row as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Loc, &LmmDescriptor)> {
        self.rows.iter().enumerate().flat_map(|(r, row)| {
            row.iter()
                .enumerate()
                .map(move |(c, d)| (Loc::new(r as u8, c as u8), d))
        })
    }

    pub fn valid_count(&self) -> usize {
        self.iter().filter(|(_, d)| d.valid).count()
    }
}

// ── Synthesis ───────────────────────────────────────────────────────────────

fn window_operand(ctx: &CompilationContext<'_>, operand: &Operand, what: &str) -> CompileResult<u64> {
    match operand {
        Operand::Imm(v) => Ok(*v),
        Operand::Sym(r) => {
            let id = ctx.symtab.require(&r.name)?;
            ctx.symtab.get(id).host.map(|h| h.raw()).ok_or_else(|| {
                CompileError::malformed(format!("window {} must be a host symbol", what))
                    .with_symbol(r.name.clone())
            })
        }
    }
}

fn describe(ctx: &CompilationContext<'_>, m: &MemInsn, label: String, loc: Loc) -> CompileResult<LmmDescriptor> {
    let top = window_operand(ctx, &m.top, "top")?;
    let len = window_operand(ctx, &m.len, "length")?;
    if len == 0 {
        return Err(CompileError::malformed("window length must be at least one word")
            .with_symbol(label)
            .at(loc));
    }
    if len > MAX_WINDOW_WORDS {
        return Err(CompileError::capacity(
            codes::E0103,
            format!("window of {} words exceeds the {}-word length field", len, MAX_WINDOW_WORDS),
        )
        .with_symbol(label)
        .at(loc));
    }
    let ofs = match &m.ptop {
        Some(p) => {
            let ptop = window_operand(ctx, p, "partner")?;
            i32::try_from(ptop as i64 - top as i64).map_err(|_| {
                CompileError::capacity(codes::E0103, "partner window offset exceeds 32 bits")
                    .with_symbol(label.clone())
                    .at(loc)
            })?
        }
        None => 0,
    };
    let direct = m.op.is_direct();
    Ok(LmmDescriptor {
        valid: true,
        write: m.op.writes_memory(),
        force: m.force || direct,
        prefetch: direct || matches!(m.op, MemOp::ImPref | MemOp::ImDrain) || m.ptop.is_some(),
        bcas: 1 << loc.col,
        hcopy: false,
        vcopy: false,
        blk: m.blk,
        cidx: m.cidx,
        len: len as u32,
        ofs,
        top,
        mode: MergeMode::Private,
        master: None,
        direct,
        symbol: Some(label),
    })
}

/// Build one descriptor per cell from the placed memory records.
pub fn synthesize(ctx: &mut CompilationContext<'_>) -> CompileResult<()> {
    let mut table = LmmTable::new(ctx.depth());
    for (loc, cell) in ctx.grid.iter() {
        for unit in [MemUnit::Store, MemUnit::Load] {
            let Some(idx) = cell.mem[unit.index()] else { continue };
            let op = &ctx.program.ops[idx];
            let Some(m) = op.mem() else {
                return Err(CompileError::internal("memory slot holds a non-memory record").at(loc));
            };
            if !m.op.needs_window() {
                continue;
            }
            let d = describe(ctx, m, op.label(), loc)?;
            let slot = table.get_mut(loc);
            if !slot.valid {
                *slot = d;
            } else if slot.window() == d.window() && slot.ofs == d.ofs {
                // read-modify-write of one window
                slot.write |= d.write;
                slot.force = true;
                slot.prefetch |= d.prefetch;
                slot.direct |= d.direct;
            } else {
                return Err(CompileError::conflict(
                    codes::E0204,
                    "load and store units of one cell address different windows",
                )
                .with_symbol(op.label())
                .at(loc));
            }
        }
    }
    debug!(descriptors = table.valid_count(), "local-memory descriptors synthesized");
    ctx.lmm = Some(table);
    Ok(())
}

// ── Merge ───────────────────────────────────────────────────────────────────

fn table_mut<'a>(ctx: &'a mut CompilationContext<'_>) -> CompileResult<&'a mut LmmTable> {
    ctx.lmm
        .as_mut()
        .ok_or_else(|| CompileError::internal("descriptor table used before synthesis"))
}

fn join(table: &mut LmmTable, row: u8, cols: std::ops::Range<u8>, mode: MergeMode) {
    let master = Loc::new(row, cols.start);
    let mut bcas = 0u8;
    for c in cols.clone() {
        bcas |= 1 << c;
        let d = table.get_mut(Loc::new(row, c));
        d.mode = mode;
        if c != cols.start {
            d.hcopy = true;
            d.master = Some(master);
            d.bcas = 0;
        }
    }
    table.get_mut(master).bcas = bcas;
}

/// Merge identical adjacent columns, then check mirroring and capacity.
pub fn merge(ctx: &mut CompilationContext<'_>) -> CompileResult<()> {
    let options = ctx.options;
    let depth = ctx.depth();
    let table = table_mut(ctx)?;

    let mut pairs = 0;
    let mut quads = 0;
    for r in 0..depth.rows() as u8 {
        let row = table.row(r);
        let p01 = row[0].mergeable(&row[1]);
        let p23 = row[2].mergeable(&row[3]);
        if p01 && p23 && row[0].mergeable(&row[2]) {
            join(table, r, 0..4, MergeMode::Quad);
            quads += 1;
            continue;
        }
        if p01 {
            join(table, r, 0..2, MergeMode::Pair);
            pairs += 1;
        }
        if p23 {
            join(table, r, 2..4, MergeMode::Pair);
            pairs += 1;
        }
    }

    if options.mapdist > 0 {
        for r in 0..depth.rows() as u8 {
            let row = table.row(r);
            if !row.iter().any(|d| d.valid && d.prefetch) {
                continue;
            }
            let partner = ((r as usize + options.mapdist as usize) % depth.rows()) as u8;
            let mirror = table.row(partner);
            for c in 0..GRID_WIDTH {
                if row[c].valid && mirror[c].valid && row[c].mode != mirror[c].mode {
                    return Err(CompileError::merge(format!(
                        "row {} merges column {} as {:?} but partner row {} uses {:?}",
                        r, c, row[c].mode, partner, mirror[c].mode
                    ))
                    .at(Loc::new(partner, c as u8))
                    .with_hint("give partner rows the same window shapes in every column"));
                }
            }
        }
    }

    for (loc, d) in table.iter() {
        if !d.valid {
            continue;
        }
        let mut region = options.lmm_bytes as u64 * d.mode.group() as u64;
        if d.prefetch && options.mapdist == 0 {
            region /= 2;
        }
        let bytes = d.len as u64 * 4;
        if bytes > region {
            let mut err = CompileError::capacity(
                codes::E0102,
                format!("window of {} bytes exceeds the {}-byte local-memory region", bytes, region),
            )
            .at(loc);
            if let Some(s) = &d.symbol {
                err = err.with_symbol(s.clone());
            }
            return Err(err);
        }
    }
    debug!(pairs, quads, "local-memory regions merged");
    Ok(())
}

// ── Vertical broadcast ──────────────────────────────────────────────────────

/// Let identical read windows in non-adjacent rows share one refresh.
pub fn broadcast(ctx: &mut CompilationContext<'_>) -> CompileResult<()> {
    let depth = ctx.depth().rows() as u8;
    let table = table_mut(ctx)?;
    let mut shared = 0;
    for c in 0..GRID_WIDTH as u8 {
        for j in 2..depth {
            for i in 0..j - 1 {
                let (earlier, later) = (table.get(Loc::new(i, c)), table.get(Loc::new(j, c)));
                if !earlier.valid || !later.valid || earlier.window() != later.window() {
                    continue;
                }
                if earlier.write && later.write {
                    let mut err = CompileError::conflict(
                        codes::E0203,
                        format!("rows {} and {} both write the same window", i, j),
                    )
                    .at(Loc::new(j, c));
                    if let Some(s) = &later.symbol {
                        err = err.with_symbol(s.clone());
                    }
                    return Err(err);
                }
                if earlier.plain_read()
                    && later.plain_read()
                    && !earlier.is_copy()
                    && !later.is_copy()
                    && earlier.mode == later.mode
                {
                    let d = table.get_mut(Loc::new(j, c));
                    d.vcopy = true;
                    d.master = Some(Loc::new(i, c));
                    shared += 1;
                    break;
                }
            }
        }
    }
    debug!(shared, "vertical broadcasts assigned");
    Ok(())
}
