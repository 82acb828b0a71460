// route.rs — Inter-row value routing
//
// For every operand of every placed record, makes the value visible where
// the record reads it. A value produced at row p and read at row r must sit
// in a boundary register of every row p..r-1; each intermediate row is
// served by the first of these that succeeds:
//
//   reuse     a boundary register of the row already holds the value,
//   carry     a free boundary + transfer register pair relays it from the
//             row above (4-wide values need one cell with four free lanes),
//   bypass    an idle arithmetic unit passes it through as an identity op.
//
// Host constants are written into a boundary register of the row above the
// consumer (or the cell's address registers for memory base/offset).
//
// Preconditions: `place::place_all` has run.
// Postconditions: every value an endpoint reads is present in the register
//                 the emitter will select.
// Failure modes: Capacity (no register left, immediate too wide), Conflict
//                (shared selector or write lane claimed twice).
// Side effects: none.

use tracing::trace;

use crate::arch::{Loc, E3_IMM_BITS, GRID_WIDTH, UNIT_WIDTH};
use crate::depend::{self, Bound, Edge, Role, Rule};
use crate::diag::{codes, CompileError, CompileResult};
use crate::grid::{
    BaseSource, BrSlot, BrSource, CompilationContext, LaneSource, OffsetSource, Placement, Value,
    Wiring,
};
use crate::microop::{MicroOp, OpKind, Operand, OperandSlot, ProducerKind};
use crate::opcode::MemUnit;
use crate::symtab::SymId;

/// Route the operands of every placed record, in source order.
pub fn route_all(ctx: &mut CompilationContext<'_>) -> CompileResult<()> {
    let program = ctx.program;
    for (idx, op) in program.ops.iter().enumerate() {
        let placement = ctx.placement(idx)?;
        let bound = depend::resolve(ctx, idx)?;
        route_record(ctx, idx, op, placement, &bound)?;
    }
    trace!(stats = ?ctx.stats, "routing complete");
    Ok(())
}

fn route_record(
    ctx: &mut CompilationContext<'_>,
    idx: usize,
    op: &MicroOp,
    placement: Placement,
    bound: &Bound,
) -> CompileResult<()> {
    let columns: Vec<Loc> = if placement.wide {
        (0..GRID_WIDTH as u8)
            .map(|c| Loc::new(placement.loc.row, c))
            .collect()
    } else {
        vec![placement.loc]
    };

    if matches!(op.kind, OpKind::Guard(_)) {
        ctx.grid.cell_mut(placement.loc).wiring.ex1_self = true;
    }

    for (slot, operand) in op.operands() {
        if Role::of(slot) == Role::Window {
            continue;
        }
        match operand {
            Operand::Imm(v) => {
                for &loc in &columns {
                    route_host(ctx, op, slot, *v, loc)?;
                }
            }
            Operand::Sym(r) => {
                let sym = ctx.symtab.require(&r.name)?;
                let (host, producer_op) = {
                    let info = ctx.symtab.get(sym);
                    (info.host, info.op)
                };
                if let Some(host) = host {
                    for &loc in &columns {
                        route_host(ctx, op, slot, host.raw(), loc)?;
                    }
                    continue;
                }
                if producer_op == Some(idx) {
                    for &loc in &columns {
                        ctx.grid.cell_mut(loc).wiring.ex1_self = true;
                    }
                    continue;
                }
                if matches!(slot, OperandSlot::Src4 | OperandSlot::Src5) {
                    // aliases of sources 2/3, routed with them
                    continue;
                }
                let edge = *bound.edges.iter().find(|e| e.slot == slot).ok_or_else(|| {
                    CompileError::internal("operand edge missing").with_symbol(r.name.clone())
                })?;
                let producer_wide = edge.producer.is_wide();
                for (k, &loc) in columns.iter().enumerate() {
                    let lane = if producer_wide && placement.wide {
                        k as u8
                    } else {
                        r.lane
                    };
                    route_symbol(ctx, op, slot, &edge, sym, lane, loc, placement)?;
                }
            }
        }
    }
    Ok(())
}

fn mex_unit(u: u8) -> MemUnit {
    if u == 0 {
        MemUnit::Store
    } else {
        MemUnit::Load
    }
}

fn mem_unit(op: &MicroOp) -> CompileResult<MemUnit> {
    op.mem()
        .map(|m| m.op.unit())
        .ok_or_else(|| CompileError::internal("memory operand on a non-memory record"))
}

fn store_is_wide(op: &MicroOp) -> bool {
    op.mem().map_or(false, |m| m.op.is_wide())
}

// ── Host values ─────────────────────────────────────────────────────────────

fn route_host(
    ctx: &mut CompilationContext<'_>,
    op: &MicroOp,
    slot: OperandSlot,
    value: u64,
    loc: Loc,
) -> CompileResult<()> {
    let v = Value::Imm(value);
    let above = ctx.depth().prev_row(loc.row);
    match slot {
        OperandSlot::ExeSrc(i) => {
            preload(ctx, above, v)?;
            ctx.grid.cell_mut(loc).wiring.ex_in[i as usize] = Some(v);
        }
        OperandSlot::GuardInit | OperandSlot::GuardStep => {
            let i = if slot == OperandSlot::GuardInit { 0 } else { 1 };
            preload(ctx, above, v)?;
            ctx.grid.cell_mut(loc).wiring.ex_in[i] = Some(v);
        }
        OperandSlot::Src4 => {}
        OperandSlot::Src5 => {
            if value >> E3_IMM_BITS != 0 {
                return Err(CompileError::capacity(
                    codes::E0103,
                    format!("shift amount {} does not fit {} bits", value, E3_IMM_BITS),
                )
                .with_symbol(op.label())
                .at(loc));
            }
        }
        OperandSlot::CexCond(i) => {
            preload(ctx, above, v)?;
            ctx.grid.cell_mut(loc).wiring.cs[i as usize] = Some(v);
        }
        OperandSlot::MexBase(u) => {
            ctx.grid
                .cell_mut(loc)
                .wiring
                .claim_base_reg(mex_unit(u), value, loc)?;
        }
        OperandSlot::MexCmp(u) => {
            preload(ctx, above, v)?;
            claim_compare(&mut ctx.grid.cell_mut(loc).wiring, u, v, loc)?;
        }
        OperandSlot::MemBase => {
            let unit = mem_unit(op)?;
            let w = &mut ctx.grid.cell_mut(loc).wiring;
            w.claim_base(unit, BaseSource::Reg, loc)?;
            w.claim_base_reg(unit, value, loc)?;
        }
        OperandSlot::MemOffset => {
            let unit = mem_unit(op)?;
            let w = &mut ctx.grid.cell_mut(loc).wiring;
            w.claim_offset(unit, OffsetSource::Reg, loc)?;
            w.claim_offset_reg(unit, value, loc)?;
        }
        OperandSlot::MemData => {
            preload(ctx, above, v)?;
            let values = if store_is_wide(op) { vec![v; UNIT_WIDTH] } else { vec![v] };
            store_data(&mut ctx.grid.cell_mut(loc).wiring, &values, LaneSource::Ts, loc)?;
        }
        OperandSlot::MemCond => {
            return Err(CompileError::malformed(
                "memory predicate must come from a conditional-select",
            )
            .with_symbol(op.label())
            .at(loc));
        }
        OperandSlot::MemTop | OperandSlot::MemLen | OperandSlot::MemPtop => {}
    }
    Ok(())
}

/// Put a host constant into a boundary register of `row`.
fn preload(ctx: &mut CompilationContext<'_>, row: u8, value: Value) -> CompileResult<()> {
    if ctx.grid.locate(row, value).is_some() {
        return Ok(());
    }
    for c in 0..GRID_WIDTH as u8 {
        let w = &mut ctx.grid.cell_mut(Loc::new(row, c)).wiring;
        if let Some(s) = (0..UNIT_WIDTH).find(|&s| w.br[s].is_none() && w.trs[s].is_none()) {
            w.br[s] = Some(BrSlot {
                value,
                src: BrSource::Hold,
            });
            ctx.stats.preloads += 1;
            return Ok(());
        }
    }
    Err(CompileError::capacity(
        codes::E0101,
        format!("row {} has no boundary register left for a host value", row),
    )
    .at(Loc::new(row, 0)))
}

// ── Produced values ─────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn route_symbol(
    ctx: &mut CompilationContext<'_>,
    op: &MicroOp,
    slot: OperandSlot,
    edge: &Edge,
    sym: SymId,
    lane: u8,
    loc: Loc,
    placement: Placement,
) -> CompileResult<()> {
    let value = Value::Sym(sym, lane);
    match edge.rule {
        Rule::Pinned(_) => {
            if edge.producer == ProducerKind::Mex {
                let unit = mem_unit(op)?;
                ctx.grid
                    .cell_mut(loc)
                    .wiring
                    .claim_base(unit, BaseSource::SelfLoop, loc)?;
            }
            // conditional-select gates its own cell; nothing to wire
            return Ok(());
        }
        Rule::SameUnit(pin) if pin == loc => {
            let unit = mem_unit(op)?;
            let w = &mut ctx.grid.cell_mut(loc).wiring;
            w.exd = Some(value);
            match slot {
                OperandSlot::MemOffset => w.claim_offset(unit, OffsetSource::Exdr, loc)?,
                OperandSlot::MemData => store_data(w, &[value], LaneSource::Exdr, loc)?,
                _ => return Err(CompileError::internal("same-unit edge on a non-data operand")),
            }
            return Ok(());
        }
        _ => {}
    }

    if placement.fold && slot == OperandSlot::ExeSrc(0) {
        publish(ctx, value)?;
        ctx.grid.cell_mut(loc).wiring.ex1_fold = Some(value);
        return Ok(());
    }

    let from = ctx.producer_loc(sym, lane)?;
    if loc.row <= from.row {
        return Err(CompileError::internal(format!(
            "consumer at {} does not follow producer at {}",
            loc, from
        ))
        .with_symbol(ctx.symtab.name(sym).to_string()));
    }

    let values: Vec<Value> =
        if slot == OperandSlot::MemData && store_is_wide(op) && is_wide_value(ctx, sym) {
            (0..UNIT_WIDTH as u8).map(|s| Value::Sym(sym, s)).collect()
        } else {
            vec![value]
        };
    for &v in &values {
        publish(ctx, v)?;
    }
    for row in from.row + 1..loc.row {
        carry(ctx, row, &values).map_err(|e| e.with_symbol(ctx.symtab.name(sym).to_string()))?;
    }
    consume(ctx, op, slot, loc, &values)
}

/// 4-lane values: 4-wide arithmetic and 4-wide loads.
fn is_wide_value(ctx: &CompilationContext<'_>, sym: SymId) -> bool {
    let info = ctx.symtab.get(sym);
    match info.producer {
        ProducerKind::Ex4 => true,
        ProducerKind::Load => info
            .op
            .and_then(|i| ctx.program.ops[i].mem())
            .map_or(false, |m| m.op.is_wide()),
        _ => false,
    }
}

/// Make a produced value visible in its producer row's boundary registers.
fn publish(ctx: &mut CompilationContext<'_>, value: Value) -> CompileResult<()> {
    let Value::Sym(sym, lane) = value else {
        return Ok(());
    };
    let loc = ctx.producer_loc(sym, lane)?;
    if ctx.grid.cell(loc).wiring.find_br(value).is_some() {
        return Ok(());
    }
    let wide_value = is_wide_value(ctx, sym);
    let info = ctx.symtab.get(sym);
    let name = info.name.clone();
    let producer = info.producer;
    let w = &mut ctx.grid.cell_mut(loc).wiring;
    match producer {
        ProducerKind::Load => {
            let s = if wide_value {
                Some(lane as usize).filter(|&s| w.br[s].is_none())
            } else {
                (0..UNIT_WIDTH).find(|&s| w.br[s].is_none())
            };
            let Some(s) = s else {
                return Err(no_lane(&name, loc));
            };
            w.br[s] = Some(BrSlot {
                value,
                src: BrSource::MemRead,
            });
        }
        ProducerKind::Exe | ProducerKind::Guard | ProducerKind::Ex4 => {
            w.exd = Some(value);
            if let Some(s) = (0..UNIT_WIDTH).find(|&s| w.carry_lane_free(s)) {
                w.trs[s] = Some(LaneSource::Exdr);
                w.br[s] = Some(BrSlot {
                    value,
                    src: BrSource::Transfer,
                });
            } else if w.br[2].is_none() {
                w.br[2] = Some(BrSlot {
                    value,
                    src: BrSource::Exdr,
                });
            } else {
                return Err(no_lane(&name, loc));
            }
        }
        ProducerKind::Host | ProducerKind::Cex | ProducerKind::Mex => {
            return Err(CompileError::internal("value kind has no boundary-register output")
                .with_symbol(name)
                .at(loc));
        }
    }
    Ok(())
}

fn no_lane(name: &str, loc: Loc) -> CompileError {
    CompileError::capacity(codes::E0101, "no boundary register left for the result")
        .with_symbol(name)
        .at(loc)
}

/// Relay `values` into `row`.
fn carry(ctx: &mut CompilationContext<'_>, row: u8, values: &[Value]) -> CompileResult<()> {
    if values.iter().all(|&v| ctx.grid.locate(row, v).is_some()) {
        ctx.stats.reuses += 1;
        return Ok(());
    }
    if values.len() == 1 {
        try_carry_scalar(ctx, row, values[0])
            .or_else(|| try_bypass(ctx, row, values[0]))
            .ok_or_else(|| {
                CompileError::capacity(
                    codes::E0101,
                    format!("row {} has no carry register or idle unit left", row),
                )
                .at(Loc::new(row, 0))
            })
    } else {
        try_carry_wide(ctx, row, values).ok_or_else(|| {
            CompileError::capacity(
                codes::E0101,
                format!("row {} has no cell with four free carry lanes", row),
            )
            .at(Loc::new(row, 0))
        })
    }
}

fn try_carry_scalar(ctx: &mut CompilationContext<'_>, row: u8, value: Value) -> Option<()> {
    for c in 0..GRID_WIDTH as u8 {
        let w = &mut ctx.grid.cell_mut(Loc::new(row, c)).wiring;
        if let Some(s) = (0..UNIT_WIDTH).find(|&s| w.carry_lane_free(s)) {
            relay(w, s, value);
            ctx.stats.carries += 1;
            return Some(());
        }
    }
    None
}

fn try_carry_wide(ctx: &mut CompilationContext<'_>, row: u8, values: &[Value]) -> Option<()> {
    for c in 0..GRID_WIDTH as u8 {
        let w = &mut ctx.grid.cell_mut(Loc::new(row, c)).wiring;
        if (0..UNIT_WIDTH).all(|s| w.carry_lane_free(s)) {
            for (s, &v) in values.iter().enumerate() {
                relay(w, s, v);
            }
            ctx.stats.carries += values.len() as u32;
            return Some(());
        }
    }
    None
}

fn relay(w: &mut Wiring, lane: usize, value: Value) {
    w.ts[lane] = Some(value);
    w.trs[lane] = Some(LaneSource::Ts);
    w.br[lane] = Some(BrSlot {
        value,
        src: BrSource::Transfer,
    });
}

/// Route through an idle arithmetic unit configured as identity.
fn try_bypass(ctx: &mut CompilationContext<'_>, row: u8, value: Value) -> Option<()> {
    for c in 0..GRID_WIDTH as u8 {
        let cell = ctx.grid.cell_mut(Loc::new(row, c));
        let usable = cell.exe.is_none()
            && cell.bypass.is_none()
            && !cell.fold
            && cell.wiring.exd.is_none()
            && cell.wiring.br[2].is_none();
        if usable {
            cell.bypass = Some(value);
            cell.wiring.ex_in[0] = Some(value);
            cell.wiring.exd = Some(value);
            cell.wiring.br[2] = Some(BrSlot {
                value,
                src: BrSource::Exdr,
            });
            ctx.stats.bypasses += 1;
            return Some(());
        }
    }
    None
}

// ── Consumer endpoints ──────────────────────────────────────────────────────

fn consume(
    ctx: &mut CompilationContext<'_>,
    op: &MicroOp,
    slot: OperandSlot,
    loc: Loc,
    values: &[Value],
) -> CompileResult<()> {
    let v = values[0];
    let unit = op.mem().map(|m| m.op.unit());
    let w = &mut ctx.grid.cell_mut(loc).wiring;
    match slot {
        OperandSlot::ExeSrc(i) => w.ex_in[i as usize] = Some(v),
        OperandSlot::GuardInit => w.ex_in[0] = Some(v),
        OperandSlot::GuardStep => w.ex_in[1] = Some(v),
        OperandSlot::CexCond(i) => w.cs[i as usize] = Some(v),
        OperandSlot::MexBase(u) => {
            w.claim_base(mex_unit(u), BaseSource::Shared, loc)?;
            w.claim_base_sel(v, loc)?;
        }
        OperandSlot::MexCmp(u) => claim_compare(w, u, v, loc)?,
        OperandSlot::MemBase => {
            let unit = unit.ok_or_else(|| CompileError::internal("base on non-memory record"))?;
            w.claim_base(unit, BaseSource::Shared, loc)?;
            w.claim_base_sel(v, loc)?;
        }
        OperandSlot::MemOffset => {
            let unit = unit.ok_or_else(|| CompileError::internal("offset on non-memory record"))?;
            w.claim_offset(unit, OffsetSource::Shared, loc)?;
            w.claim_offs_sel(v, loc)?;
        }
        OperandSlot::MemData => {
            let lanes: Vec<Value> = if store_is_wide(op) && values.len() == 1 {
                vec![v; UNIT_WIDTH]
            } else {
                values.to_vec()
            };
            store_data(w, &lanes, LaneSource::Ts, loc)?;
        }
        OperandSlot::MemCond | OperandSlot::Src4 | OperandSlot::Src5 => {}
        OperandSlot::MemTop | OperandSlot::MemLen | OperandSlot::MemPtop => {}
    }
    Ok(())
}

fn claim_compare(w: &mut Wiring, u: u8, v: Value, loc: Loc) -> CompileResult<()> {
    if u == 0 {
        w.claim_base_sel(v, loc)
    } else {
        w.claim_offs_sel(v, loc)
    }
}

/// Wire store data into the write lanes. Four values fill lanes 0..3; one
/// value takes the first free lane.
fn store_data(w: &mut Wiring, values: &[Value], src: LaneSource, loc: Loc) -> CompileResult<()> {
    let conflict = || {
        CompileError::conflict(codes::E0202, "store write lanes already carry other data").at(loc)
    };
    if values.len() == UNIT_WIDTH {
        if (0..UNIT_WIDTH).any(|s| lane_taken(w, s, src)) {
            return Err(conflict());
        }
        for (s, &v) in values.iter().enumerate() {
            w.mws[s] = Some(src);
            if src == LaneSource::Ts {
                w.ts[s] = Some(v);
            }
        }
        return Ok(());
    }
    let s = (0..UNIT_WIDTH)
        .find(|&s| !lane_taken(w, s, src))
        .ok_or_else(conflict)?;
    w.mws[s] = Some(src);
    if src == LaneSource::Ts {
        w.ts[s] = Some(values[0]);
    }
    Ok(())
}

fn lane_taken(w: &Wiring, lane: usize, src: LaneSource) -> bool {
    w.mws[lane].is_some() || (src == LaneSource::Ts && (w.ts[lane].is_some() || w.tr_reserved))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::GridDepth;
    use crate::diag::ErrorKind;
    use crate::microop::Program;
    use crate::opcode::{AluOp, MemOp};
    use crate::pipeline::CompileOptions;
    use crate::place;

    fn routed(program: &Program) -> CompileResult<CompilationContext<'_>> {
        let opts = CompileOptions {
            depth: GridDepth::D8,
            ..CompileOptions::default()
        };
        let mut ctx = CompilationContext::new(program, opts)?;
        place::place_all(&mut ctx)?;
        route_all(&mut ctx)?;
        Ok(ctx)
    }

    fn imm(v: u64) -> Operand {
        Operand::imm(v)
    }

    fn sym(n: &str) -> Operand {
        Operand::sym(n)
    }

    #[test]
    fn adjacent_rows_need_no_carry() {
        let p = Program::default()
            .push(MicroOp::exe(AluOp::Add, "a", &[imm(1)]))
            .push(MicroOp::exe(AluOp::Add, "b", &[sym("a")]));
        let ctx = routed(&p).unwrap();
        assert_eq!(ctx.stats.carries, 0);
        let a = ctx.symtab.lookup("a").unwrap();
        assert_eq!(ctx.grid.locate(0, Value::Sym(a, 0)), Some((0, 0)));
        assert_eq!(
            ctx.grid.cell(Loc::new(1, 0)).wiring.ex_in[0],
            Some(Value::Sym(a, 0))
        );
    }

    #[test]
    fn distant_rows_carry_through_every_row() {
        let p = Program::default()
            .push(MicroOp::exe(AluOp::Add, "a", &[imm(1)]))
            .push(MicroOp::exe(AluOp::Add, "b", &[imm(2)]).at(3, 0))
            .push(MicroOp::exe(AluOp::Add, "c", &[sym("a"), sym("b")]));
        let ctx = routed(&p).unwrap();
        let a = Value::Sym(ctx.symtab.lookup("a").unwrap(), 0);
        for row in 0..4 {
            assert!(ctx.grid.locate(row, a).is_some(), "row {}", row);
        }
        assert_eq!(ctx.stats.carries, 3);
    }

    #[test]
    fn carries_are_reused_by_second_consumer() {
        let p = Program::default()
            .push(MicroOp::exe(AluOp::Add, "a", &[imm(1)]))
            .push(MicroOp::exe(AluOp::Add, "b", &[sym("a")]).at(3, 0))
            .push(MicroOp::exe(AluOp::Add, "c", &[sym("a")]).at(3, 1));
        let ctx = routed(&p).unwrap();
        assert_eq!(ctx.stats.carries, 2);
        assert_eq!(ctx.stats.reuses, 2);
    }

    #[test]
    fn host_constants_are_preloaded_above() {
        let p = Program::default()
            .host_imm("k", 42)
            .push(MicroOp::exe(AluOp::Add, "a", &[sym("k"), imm(42)]).at(2, 0));
        let ctx = routed(&p).unwrap();
        assert_eq!(ctx.stats.preloads, 1);
        assert_eq!(ctx.grid.locate(1, Value::Imm(42)), Some((0, 0)));
    }

    #[test]
    fn row_zero_reads_preloads_from_last_row() {
        let p = Program::default().push(MicroOp::exe(AluOp::Add, "a", &[imm(5)]));
        let ctx = routed(&p).unwrap();
        assert!(ctx.grid.locate(7, Value::Imm(5)).is_some());
    }

    #[test]
    fn reserved_row_falls_back_to_bypass() {
        let p = Program::default().push(MicroOp::exe(AluOp::Add, "a", &[imm(1)]));
        let mut ctx = routed(&p).unwrap();
        for c in 0..4 {
            ctx.grid.cell_mut(Loc::new(3, c)).wiring.tr_reserved = true;
        }
        carry(&mut ctx, 3, &[Value::Imm(77)]).unwrap();
        assert_eq!(ctx.stats.bypasses, 1);
        let cell = ctx.grid.cell(Loc::new(3, 0));
        assert_eq!(cell.bypass, Some(Value::Imm(77)));
        assert_eq!(cell.wiring.br[2].map(|b| b.src), Some(BrSource::Exdr));
        assert!(ctx.grid.to_string().contains(" 3: P"));
    }

    #[test]
    fn saturated_row_is_capacity_error() {
        let mut p = Program::default().push(MicroOp::exe(AluOp::Add, "a", &[imm(1)]).at(0, 0));
        // twelve arithmetic and four conditional immediates fill row 1
        for c in 0..4u8 {
            let base = 1000 + 10 * c as u64;
            p = p.push(
                MicroOp::exe(AluOp::Add, &format!("e{}", c), &[imm(base), imm(base + 1), imm(base + 2)])
                    .at(2, c),
            );
            p = p.push(
                MicroOp::new(OpKind::Cex(crate::microop::CexInsn {
                    op: crate::opcode::CexOp::Cexe,
                    dest: format!("k{}", c),
                    conds: vec![imm(base + 3)],
                    table: 0xaaaa,
                }))
                .at(2, c),
            );
        }
        p = p.push(MicroOp::exe(AluOp::Add, "x", &[sym("a")]).at(3, 0));
        let err = routed(&p).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Capacity);
        assert_eq!(err.code, codes::E0101);
        assert_eq!(err.loc, Some(Loc::new(1, 0)));
        assert_eq!(err.symbol.as_deref(), Some("a"));
    }

    #[test]
    fn wide_load_feeds_wide_store_lane_by_lane() {
        let p = Program::default()
            .host_addr("a", 0x1000)
            .host_addr("b", 0x2000)
            .push(MicroOp::load(MemOp::Ldrq, "q", imm(0), sym("a"), 16))
            .push(MicroOp::store(MemOp::Strq, sym("q"), imm(0), sym("b"), 16).at(3, 2));
        let ctx = routed(&p).unwrap();
        let q = ctx.symtab.lookup("q").unwrap();
        let w = &ctx.grid.cell(Loc::new(3, 2)).wiring;
        for s in 0..4u8 {
            assert_eq!(w.ts[s as usize], Some(Value::Sym(q, s)));
            assert_eq!(w.mws[s as usize], Some(LaneSource::Ts));
        }
        assert_eq!(ctx.stats.carries, 8);
    }

    #[test]
    fn oversized_shift_immediate_is_capacity() {
        let mut op = MicroOp::exe(AluOp::Add, "a", &[imm(1)]);
        if let OpKind::Exe(e) = &mut op.kind {
            e.op3 = crate::opcode::ShiftOp::Sll;
            e.src5 = Some(imm(64));
        }
        let p = Program::default().push(op);
        let err = routed(&p).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Capacity);
        assert_eq!(err.code, codes::E0103);
    }

    #[test]
    fn two_bases_through_shared_selector_conflict() {
        let p = Program::default()
            .host_addr("a", 0x1000)
            .push(MicroOp::exe(AluOp::Add, "p0", &[imm(0)]))
            .push(MicroOp::exe(AluOp::Add, "p1", &[imm(8)]))
            .push(MicroOp::load(MemOp::Ldr, "v", sym("p0"), sym("a"), 4).at(1, 0))
            .push(MicroOp::store(MemOp::Str, imm(3), sym("p1"), sym("a"), 4).at(1, 0));
        let err = routed(&p).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(err.code, codes::E0202);
    }
}
