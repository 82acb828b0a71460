// emit.rs — Configuration emitter
//
// Pure translation from the final grid, wiring and descriptor table into
// the per-cell control words, descriptor mirror, boundary-register preloads
// and address registers the host runtime writes before a dispatch.
//
// Preconditions: routing and descriptor passes have run.
// Postconditions: every select names the register that carries the value.
// Failure modes: Internal when a referenced value was never allocated.
// Side effects: none.

use std::fmt::Write as _;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::arch::{br_select, GridDepth, Loc, GRID_WIDTH, UNIT_WIDTH};
use crate::conf::{to_le_bytes, Cdw0, Cdw1, Cdw2, ConfWord, LmmiWord};
use crate::diag::{CompileError, CompileResult};
use crate::grid::{BrSource, Cell, CompilationContext, Grid, Value};
use crate::lmm::{LmmDescriptor, LmmTable};
use crate::microop::{encode_mex_dist, encode_mex_limit, ExeInsn, LoopKind, OpKind, Operand};
use crate::opcode::{AluOp, MemUnit};
use crate::pipeline::bytes_to_hex;

/// Host constant written into a boundary register before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegPreload {
    pub loc: Loc,
    pub lane: u8,
    pub value: u64,
}

/// Per-cell address registers (32-bit on the bus).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AddrRegs {
    pub ea0b: u32,
    pub ea0o: u32,
    pub ea1b: u32,
    pub ea1o: u32,
    /// First byte of the local-memory window.
    pub top: u32,
    /// Last byte of the local-memory window.
    pub bot: u32,
}

/// Everything the runtime writes for one compiled kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Emitted {
    pub depth: GridDepth,
    pub mapdist: u8,
    pub conf: Vec<[ConfWord; GRID_WIDTH]>,
    pub lmmi: Vec<[LmmiWord; GRID_WIDTH]>,
    pub breg: Vec<RegPreload>,
    pub addr: Vec<[AddrRegs; GRID_WIDTH]>,
    /// Packed configuration, four words per cell, row-major.
    pub words: Vec<u64>,
}

impl Emitted {
    pub fn to_bytes(&self) -> Vec<u8> {
        to_le_bytes(&self.words)
    }

    /// `.word` listing, 32-bit halves with the low half first.
    pub fn to_asm(&self) -> String {
        let mut s = String::new();
        let per_row = GRID_WIDTH * 4;
        for (i, w) in self.words.iter().enumerate() {
            if i % 4 == 0 {
                let cell = i / 4;
                let _ = writeln!(s, "// [{}][{}]", cell / GRID_WIDTH, cell % GRID_WIDTH);
            }
            let _ = writeln!(s, "\t.word\t0x{:08x}", *w as u32);
            let _ = writeln!(s, "\t.word\t0x{:08x}", (*w >> 32) as u32);
            if (i + 1) % per_row == 0 && i + 1 < self.words.len() {
                s.push('\n');
            }
        }
        s
    }

    /// Two words per cell, row-major.
    pub fn lmmi_words(&self) -> CompileResult<Vec<u64>> {
        let mut out = Vec::with_capacity(self.lmmi.len() * GRID_WIDTH * 2);
        for row in &self.lmmi {
            for l in row {
                out.extend_from_slice(&l.pack()?);
            }
        }
        Ok(out)
    }

    /// SHA-256 of the configuration bytes; the runtime skips rewriting an
    /// unchanged configuration.
    pub fn fingerprint(&self) -> [u8; 32] {
        let digest = Sha256::digest(self.to_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        out
    }

    pub fn fingerprint_hex(&self) -> String {
        bytes_to_hex(&self.fingerprint())
    }

    pub fn lmmi_at(&self, loc: Loc) -> &LmmiWord {
        &self.lmmi[loc.row as usize][loc.col as usize]
    }

    pub fn conf_at(&self, loc: Loc) -> &ConfWord {
        &self.conf[loc.row as usize][loc.col as usize]
    }
}

// ── Select resolution ───────────────────────────────────────────────────────

struct Selects<'a> {
    grid: &'a Grid,
    loc: Loc,
    above: u8,
}

impl Selects<'_> {
    /// 4-bit select of the register in `row` carrying `value`.
    fn in_row(&self, row: u8, value: Option<Value>, what: &str) -> CompileResult<u8> {
        let Some(v) = value else { return Ok(0) };
        self.grid
            .locate(row, v)
            .map(|(c, l)| br_select(c, l))
            .ok_or_else(|| {
                CompileError::internal(format!("{} input {:?} is not carried by row {}", what, v, row))
                    .at(self.loc)
            })
    }

    fn above(&self, value: Option<Value>, what: &str) -> CompileResult<u8> {
        self.in_row(self.above, value, what)
    }
}

// ── Per-cell words ──────────────────────────────────────────────────────────

fn e2_select(e: &ExeInsn) -> (u8, u64) {
    match &e.src4 {
        None => (0, 0),
        Some(Operand::Imm(v)) => (0, *v),
        Some(s4) if e.srcs.get(1).map(|s| &s.value) == Some(s4) => (1, 0),
        Some(_) => (2, 0),
    }
}

fn e3_select(e: &ExeInsn) -> (bool, u8) {
    match &e.src5 {
        Some(Operand::Imm(v)) => (false, *v as u8),
        Some(Operand::Sym(_)) => (true, 0),
        None => (false, 0),
    }
}

fn cdw0(ctx: &CompilationContext<'_>, cell: &Cell, sel: &Selects<'_>) -> CompileResult<(Cdw0, u64)> {
    let w = &cell.wiring;
    let mut c = Cdw0 {
        v: !cell.is_empty(),
        ex1s: w.ex1_self,
        fold: cell.fold,
        ..Cdw0::default()
    };
    let mut e2imm = 0;

    c.ex1brs = match w.ex1_fold {
        Some(v) => sel.in_row(sel.loc.row, Some(v), "folded ex1")?,
        None => sel.above(w.ex_in[0], "ex1")?,
    };
    c.ex2brs = sel.above(w.ex_in[1], "ex2")?;
    c.ex3brs = sel.above(w.ex_in[2], "ex3")?;

    if let Some(idx) = cell.exe {
        match &ctx.program.ops[idx].kind {
            OpKind::Guard(g) => {
                c.op1 = match g.form {
                    LoopKind::While => AluOp::While.code(),
                    LoopKind::For => AluOp::For.code(),
                };
                c.init = 1;
                c.ex1s = true;
            }
            OpKind::Exe(e) | OpKind::Ex4(e) => {
                c.op1 = e.op1.code();
                c.op2 = e.op2.code();
                c.op3 = e.op3.code();
                let exp = |i: usize| e.srcs.get(i).map_or(0, |s| s.exp.code());
                c.ex1exp = exp(0);
                c.ex2exp = exp(1);
                c.ex3exp = exp(2);
                let (e2is, imm) = e2_select(e);
                c.e2is = e2is;
                e2imm = imm;
                let (e3is, e3imm) = e3_select(e);
                c.e3is = e3is;
                c.e3imm = e3imm;
                c.init = e.init;
            }
            _ => {
                return Err(CompileError::internal("arithmetic slot holds another record").at(sel.loc))
            }
        }
    } else if cell.bypass.is_some() {
        c.op1 = AluOp::Nop.code();
    }

    if let Some(idx) = cell.mex {
        let OpKind::Mex(m) = &ctx.program.ops[idx].kind else {
            return Err(CompileError::internal("address-generation slot holds another record").at(sel.loc));
        };
        let code = |v: Option<u8>| v.ok_or_else(|| CompileError::internal("address step not encodable").at(sel.loc));
        c.mex0op = m.op0.code();
        c.mex0init = m.init0;
        c.mex0dist = code(encode_mex_dist(m.dist0))?;
        c.mex1op = m.op1.code();
        c.mex1init = m.init1;
        c.mex1dist = code(encode_mex_dist(m.dist1))?;
        c.mexlimit = code(encode_mex_limit(m.limit))?;
    }
    Ok((c, e2imm))
}

fn cdw1(ctx: &CompilationContext<'_>, cell: &Cell, sel: &Selects<'_>) -> CompileResult<Cdw1> {
    let w = &cell.wiring;
    let mut c = Cdw1::default();
    for i in 0..4 {
        c.cs[i] = sel.above(w.cs[i], "condition")?;
    }
    if let Some(idx) = cell.cex {
        if let OpKind::Cex(x) = &ctx.program.ops[idx].kind {
            c.cex_tab = x.table;
        }
    }
    for unit in [MemUnit::Store, MemUnit::Load] {
        let u = unit.index();
        let Some(idx) = cell.mem[u] else { continue };
        let Some(m) = ctx.program.ops[idx].mem() else {
            return Err(CompileError::internal("memory slot holds a non-memory record").at(sel.loc));
        };
        let bs = w.ea_base[u].map_or(0, |b| b.code());
        let os = w.ea_offs[u].map_or(0, |o| o.code());
        match unit {
            MemUnit::Store => {
                c.ea0op = m.op.code();
                c.ea0bs = bs;
                c.ea0os = os;
                c.ea0msk = m.mask.code();
            }
            MemUnit::Load => {
                c.ea1op = m.op.code();
                c.ea1bs = bs;
                c.ea1os = os;
                c.ea1msk = m.mask.code();
            }
        }
    }
    c.eabbrs = sel.above(w.ea_base_sel, "shared base")?;
    c.eaobrs = sel.above(w.ea_offs_sel, "shared offset")?;
    Ok(c)
}

fn cdw2(cell: &Cell, d: &LmmDescriptor, mapdist: u8, sel: &Selects<'_>) -> CompileResult<Cdw2> {
    let w = &cell.wiring;
    let mut c = Cdw2 {
        mwsa: cell.mem[MemUnit::Store.index()].is_some(),
        mapdist,
        lmm_mode: d.mode.code(),
        lmm_axiw: d.bus_fills(),
        lmm_axir: d.bus_drains(),
        ..Cdw2::default()
    };
    for s in 0..UNIT_WIDTH {
        c.ts[s] = sel.above(w.ts[s], "transfer")?;
        c.trs[s] = w.trs[s].map_or(0, |t| t.code());
        c.mws[s] = w.mws[s].map_or(0, |t| t.code());
        c.brs[s] = w.br[s].map_or(0, |b| b.src.code());
    }
    Ok(c)
}

/// Host mirror of one descriptor; invalid descriptors become all-zero.
pub fn lmmi_word(d: &LmmDescriptor) -> LmmiWord {
    if !d.valid {
        return LmmiWord::default();
    }
    LmmiWord {
        v: true,
        rw: d.write,
        f: d.force,
        p: d.prefetch,
        bcas: d.bcas,
        hcopy: d.hcopy,
        vcopy: d.vcopy,
        blk: d.blk,
        cidx: d.cidx,
        len: d.len,
        ofs: d.ofs,
        top: d.top,
    }
}

fn addr_regs(cell: &Cell, d: &LmmDescriptor) -> AddrRegs {
    let low = |v: Option<u64>| v.unwrap_or(0) as u32;
    let w = &cell.wiring;
    let (top, bot) = if d.valid {
        let top = d.top as u32;
        (top, top.wrapping_add(d.len * 4).wrapping_sub(1))
    } else {
        (0, 0)
    };
    AddrRegs {
        ea0b: low(w.ea_base_reg[0]),
        ea0o: low(w.ea_offs_reg[0]),
        ea1b: low(w.ea_base_reg[1]),
        ea1o: low(w.ea_offs_reg[1]),
        top,
        bot,
    }
}

/// Descriptor mirrors of a whole table, row-major. Needs no routing.
pub fn lmmi_table(table: &LmmTable) -> Vec<[LmmiWord; GRID_WIDTH]> {
    (0..table.depth().rows() as u8)
        .map(|r| std::array::from_fn(|c| lmmi_word(table.get(Loc::new(r, c as u8)))))
        .collect()
}

/// Translate the finished grid into wire words.
pub fn emit(ctx: &CompilationContext<'_>) -> CompileResult<Emitted> {
    let depth = ctx.depth();
    let empty = LmmTable::new(depth);
    let table = ctx.lmm.as_ref().unwrap_or(&empty);
    let mapdist = ctx.options.mapdist;

    let mut conf = Vec::with_capacity(depth.rows());
    let mut lmmis = Vec::with_capacity(depth.rows());
    let mut addr = Vec::with_capacity(depth.rows());
    let mut breg = Vec::new();
    let mut words = Vec::with_capacity(depth.rows() * GRID_WIDTH * 4);

    for r in 0..depth.rows() as u8 {
        let mut crow = [ConfWord::default(); GRID_WIDTH];
        let mut lrow = [LmmiWord::default(); GRID_WIDTH];
        let mut arow = [AddrRegs::default(); GRID_WIDTH];
        for c in 0..GRID_WIDTH as u8 {
            let loc = Loc::new(r, c);
            let cell = ctx.grid.cell(loc);
            let d = table.get(loc);
            let sel = Selects {
                grid: &ctx.grid,
                loc,
                above: depth.prev_row(r),
            };
            let (c0, e2imm) = cdw0(ctx, cell, &sel)?;
            let word = ConfWord {
                cdw0: c0,
                cdw1: cdw1(ctx, cell, &sel)?,
                cdw2: cdw2(cell, d, mapdist, &sel)?,
                cdw3: e2imm,
            };
            words.extend_from_slice(&word.pack()?);
            crow[c as usize] = word;
            lrow[c as usize] = lmmi_word(d);
            arow[c as usize] = addr_regs(cell, d);
            for (lane, br) in cell.wiring.br.iter().enumerate() {
                if let Some(b) = br {
                    match (b.src, b.value) {
                        (BrSource::Hold, Value::Imm(value)) => breg.push(RegPreload {
                            loc,
                            lane: lane as u8,
                            value,
                        }),
                        (BrSource::Hold, Value::Sym(..)) => {
                            return Err(CompileError::internal("held register has no host value").at(loc))
                        }
                        _ => {}
                    }
                }
            }
        }
        conf.push(crow);
        lmmis.push(lrow);
        addr.push(arow);
    }

    Ok(Emitted {
        depth,
        mapdist,
        conf,
        lmmi: lmmis,
        breg,
        addr,
        words,
    })
}
