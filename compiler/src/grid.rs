// grid.rs — Compilation context and per-cell grid state
//
// Owns every piece of mutable state a compilation touches: the symbol table,
// the cell array with its unit occupancy and bus wiring, the placement
// cursor, and the per-record placements. Passes receive `&mut
// CompilationContext` in a fixed order; nothing here is global.
//
// Preconditions: `CompilationContext::new` receives a program whose symbol
//                table builds cleanly.
// Postconditions: slot claims are write-once.
// Failure modes: Conflict on a second claim of an occupied slot.
// Side effects: none.

use std::fmt;

use crate::arch::{GridDepth, Loc, GRID_WIDTH, UNIT_WIDTH};
use crate::diag::{codes, CompileError, CompileResult};
use crate::lmm::LmmTable;
use crate::microop::{Program, SlotKind};
use crate::opcode::MemUnit;
use crate::pipeline::CompileOptions;
use crate::symtab::{SymId, SymbolTable};

// ── Values on the bus ───────────────────────────────────────────────────────

/// A logical value that a physical register can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    /// One lane of a produced symbol.
    Sym(SymId, u8),
    /// Host constant, written into a boundary register before dispatch.
    Imm(u64),
}

/// Boundary-register input select (`brs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrSource {
    /// Not driven by the fabric; holds the host-written value.
    Hold,
    /// Local-memory read data.
    MemRead,
    /// Transfer register of the same lane.
    Transfer,
    /// Arithmetic result of the cell (lane 2 only).
    Exdr,
}

impl BrSource {
    pub fn code(self) -> u8 {
        match self {
            BrSource::Hold => 0,
            BrSource::MemRead => 1,
            BrSource::Transfer => 2,
            BrSource::Exdr => 3,
        }
    }
}

/// Transfer-register / write-lane input select (`trs`, `mws`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaneSource {
    /// Local-memory write data path.
    Lmwd,
    /// Arithmetic result of the cell.
    Exdr,
    /// Transfer-select: a boundary register of the previous row.
    Ts,
}

impl LaneSource {
    pub fn code(self) -> u8 {
        match self {
            LaneSource::Lmwd => 0,
            LaneSource::Exdr => 1,
            LaneSource::Ts => 2,
        }
    }
}

/// Address-generator base input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseSource {
    /// Host-loaded base register.
    Reg,
    /// The cell's own masked address generator.
    SelfLoop,
    /// Shared base selector over the previous row.
    Shared,
}

impl BaseSource {
    pub fn code(self) -> u8 {
        match self {
            BaseSource::Reg => 0,
            BaseSource::SelfLoop => 1,
            BaseSource::Shared => 2,
        }
    }
}

/// Address-generator offset input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OffsetSource {
    /// Host-loaded offset register.
    Reg,
    /// The cell's own arithmetic result.
    Exdr,
    /// Shared offset selector over the previous row.
    Shared,
}

impl OffsetSource {
    pub fn code(self) -> u8 {
        match self {
            OffsetSource::Reg | OffsetSource::Exdr => 0,
            OffsetSource::Shared => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrSlot {
    pub value: Value,
    pub src: BrSource,
}

// ── Wiring ──────────────────────────────────────────────────────────────────

/// Which logical value feeds each physical bus endpoint of one cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Wiring {
    pub br: [Option<BrSlot>; UNIT_WIDTH],
    /// Transfer-select: value taken from the previous row.
    pub ts: [Option<Value>; UNIT_WIDTH],
    pub trs: [Option<LaneSource>; UNIT_WIDTH],
    pub mws: [Option<LaneSource>; UNIT_WIDTH],
    /// Transfer registers owned by a prefetch/drain memory operation.
    pub tr_reserved: bool,
    /// Arithmetic inputs read from the previous row.
    pub ex_in: [Option<Value>; 3],
    pub ex1_self: bool,
    /// First arithmetic input read from this row's load data.
    pub ex1_fold: Option<Value>,
    pub cs: [Option<Value>; 4],
    pub ea_base: [Option<BaseSource>; 2],
    pub ea_offs: [Option<OffsetSource>; 2],
    pub ea_base_reg: [Option<u64>; 2],
    pub ea_offs_reg: [Option<u64>; 2],
    /// Shared base selector (`eabbrs`).
    pub ea_base_sel: Option<Value>,
    /// Shared offset selector (`eaobrs`).
    pub ea_offs_sel: Option<Value>,
    pub exd: Option<Value>,
}

impl Wiring {
    /// A lane usable for a fresh transfer-register carry.
    pub fn carry_lane_free(&self, lane: usize) -> bool {
        !self.tr_reserved
            && self.br[lane].is_none()
            && self.ts[lane].is_none()
            && self.trs[lane].is_none()
    }

    pub fn find_br(&self, value: Value) -> Option<usize> {
        self.br
            .iter()
            .position(|b| matches!(b, Some(slot) if slot.value == value))
    }

    pub fn claim_base(&mut self, unit: MemUnit, src: BaseSource, loc: Loc) -> CompileResult<()> {
        claim_once(&mut self.ea_base[unit.index()], src, loc, "address base")
    }

    pub fn claim_offset(&mut self, unit: MemUnit, src: OffsetSource, loc: Loc) -> CompileResult<()> {
        claim_once(&mut self.ea_offs[unit.index()], src, loc, "address offset")
    }

    pub fn claim_base_reg(&mut self, unit: MemUnit, value: u64, loc: Loc) -> CompileResult<()> {
        claim_once(&mut self.ea_base_reg[unit.index()], value, loc, "base register")
    }

    pub fn claim_offset_reg(&mut self, unit: MemUnit, value: u64, loc: Loc) -> CompileResult<()> {
        claim_once(&mut self.ea_offs_reg[unit.index()], value, loc, "offset register")
    }

    pub fn claim_base_sel(&mut self, value: Value, loc: Loc) -> CompileResult<()> {
        claim_once(&mut self.ea_base_sel, value, loc, "shared base selector")
    }

    pub fn claim_offs_sel(&mut self, value: Value, loc: Loc) -> CompileResult<()> {
        claim_once(&mut self.ea_offs_sel, value, loc, "shared offset selector")
    }
}

fn claim_once<T: PartialEq + Copy>(
    slot: &mut Option<T>,
    value: T,
    loc: Loc,
    what: &str,
) -> CompileResult<()> {
    match *slot {
        Some(existing) if existing != value => Err(CompileError::conflict(
            codes::E0202,
            format!("{} already carries a different value", what),
        )
        .at(loc)),
        _ => {
            *slot = Some(value);
            Ok(())
        }
    }
}

// ── Cells ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cell {
    /// Record index occupying each unit.
    pub exe: Option<usize>,
    pub cex: Option<usize>,
    pub mex: Option<usize>,
    pub mem: [Option<usize>; 2],
    /// Arithmetic fused with this cell's load.
    pub fold: bool,
    /// Idle arithmetic unit used as an identity pass-through.
    pub bypass: Option<Value>,
    pub wiring: Wiring,
}

impl Cell {
    pub fn slot(&self, kind: SlotKind) -> Option<usize> {
        match kind {
            SlotKind::Exe => self.exe,
            SlotKind::Cex => self.cex,
            SlotKind::Mex => self.mex,
            SlotKind::Mem(u) => self.mem[u.index()],
        }
    }

    pub fn is_free(&self, kind: SlotKind) -> bool {
        match kind {
            SlotKind::Exe => self.exe.is_none() && self.bypass.is_none(),
            other => self.slot(other).is_none(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.exe.is_none()
            && self.cex.is_none()
            && self.mex.is_none()
            && self.mem.iter().all(Option::is_none)
            && self.bypass.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grid {
    depth: GridDepth,
    rows: Vec<[Cell; GRID_WIDTH]>,
}

impl Grid {
    pub fn new(depth: GridDepth) -> Self {
        Grid {
            depth,
            rows: (0..depth.rows()).map(|_| Default::default()).collect(),
        }
    }

    pub fn depth(&self) -> GridDepth {
        self.depth
    }

    pub fn cell(&self, loc: Loc) -> &Cell {
        &self.rows[loc.row as usize][loc.col as usize]
    }

    pub fn cell_mut(&mut self, loc: Loc) -> &mut Cell {
        &mut self.rows[loc.row as usize][loc.col as usize]
    }

    pub fn row(&self, row: u8) -> &[Cell; GRID_WIDTH] {
        &self.rows[row as usize]
    }

    /// Claim a unit of a cell for record `idx`.
    pub fn claim(&mut self, loc: Loc, kind: SlotKind, idx: usize) -> CompileResult<()> {
        let cell = self.cell_mut(loc);
        if !cell.is_free(kind) {
            return Err(CompileError::conflict(
                codes::E0200,
                format!("{} slot is already occupied", kind),
            )
            .at(loc));
        }
        match kind {
            SlotKind::Exe => cell.exe = Some(idx),
            SlotKind::Cex => cell.cex = Some(idx),
            SlotKind::Mex => cell.mex = Some(idx),
            SlotKind::Mem(u) => cell.mem[u.index()] = Some(idx),
        }
        Ok(())
    }

    /// Locate `value` in the boundary registers of `row`.
    pub fn locate(&self, row: u8, value: Value) -> Option<(u8, u8)> {
        self.rows[row as usize]
            .iter()
            .enumerate()
            .find_map(|(c, cell)| cell.wiring.find_br(value).map(|l| (c as u8, l as u8)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Loc, &Cell)> {
        self.rows.iter().enumerate().flat_map(|(r, row)| {
            row.iter()
                .enumerate()
                .map(move |(c, cell)| (Loc::new(r as u8, c as u8), cell))
        })
    }

    /// Highest row holding any unit, if any.
    pub fn used_rows(&self) -> usize {
        self.rows
            .iter()
            .rposition(|row| row.iter().any(|c| !c.is_empty()))
            .map_or(0, |r| r + 1)
    }
}

impl fmt::Display for Grid {
    /// One line per occupied row: `E` arithmetic, `P` pass-through, `C`
    /// conditional, `M` address generation, `S`/`L` memory units, `f` fold.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for r in 0..self.used_rows() {
            write!(f, "{:2}:", r)?;
            for cell in &self.rows[r] {
                let mut s = String::new();
                s.push(if cell.exe.is_some() {
                    'E'
                } else if cell.bypass.is_some() {
                    'P'
                } else {
                    '.'
                });
                s.push(if cell.cex.is_some() { 'C' } else { '.' });
                s.push(if cell.mex.is_some() { 'M' } else { '.' });
                s.push(if cell.mem[0].is_some() { 'S' } else { '.' });
                s.push(if cell.mem[1].is_some() { 'L' } else { '.' });
                s.push(if cell.fold { 'f' } else { '.' });
                write!(f, " {}", s)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

// ── Placement state ─────────────────────────────────────────────────────────

/// Where a record was committed. 4-wide arithmetic reports column 0 and
/// spans the whole row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub loc: Loc,
    pub fold: bool,
    pub wide: bool,
}

/// Last-used (row, column) of the placement walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor {
    pub row: u8,
    pub col: u8,
}

impl Cursor {
    pub fn advance_to(&mut self, loc: Loc) {
        if (loc.row, loc.col) > (self.row, self.col) {
            self.row = loc.row;
            self.col = loc.col;
        }
    }
}

/// Register-usage counters gathered while routing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteStats {
    /// Fresh boundary/transfer-register pairs allocated for carries.
    pub carries: u32,
    /// Intermediate rows where an existing carry was reused.
    pub reuses: u32,
    /// Identity pass-throughs through idle arithmetic units.
    pub bypasses: u32,
    /// Host-written boundary registers.
    pub preloads: u32,
}

// ── Compilation context ─────────────────────────────────────────────────────

/// All state of one compilation, threaded through the passes in order.
#[derive(Debug)]
pub struct CompilationContext<'p> {
    pub program: &'p Program,
    pub options: CompileOptions,
    pub symtab: SymbolTable,
    pub grid: Grid,
    pub placements: Vec<Option<Placement>>,
    pub cursor: Cursor,
    pub stats: RouteStats,
    pub lmm: Option<LmmTable>,
}

impl<'p> CompilationContext<'p> {
    pub fn new(program: &'p Program, options: CompileOptions) -> CompileResult<Self> {
        for op in &program.ops {
            op.validate()?;
        }
        let symtab = SymbolTable::build(program)?;
        Ok(CompilationContext {
            program,
            options,
            symtab,
            grid: Grid::new(options.depth),
            placements: vec![None; program.ops.len()],
            cursor: Cursor::default(),
            stats: RouteStats::default(),
            lmm: None,
        })
    }

    pub fn depth(&self) -> GridDepth {
        self.options.depth
    }

    pub fn placement(&self, idx: usize) -> CompileResult<Placement> {
        self.placements[idx].ok_or_else(|| {
            CompileError::internal(format!("record {} has no placement", idx))
                .with_symbol(self.program.ops[idx].label())
        })
    }

    /// Location of a symbol's producer for lane `lane`.
    pub fn producer_loc(&self, sym: SymId, lane: u8) -> CompileResult<Loc> {
        let s = self.symtab.get(sym);
        let loc = s.loc.ok_or_else(|| {
            CompileError::internal("producer not yet placed").with_symbol(s.name.clone())
        })?;
        if s.producer.is_wide() {
            Ok(Loc::new(loc.row, lane))
        } else {
            Ok(loc)
        }
    }
}
