// place.rs — Placement engine
//
// Walks the records in source order and commits each one to a grid cell.
// The walk keeps a "last used" cursor; a record without an explicit
// location is placed at or after the cursor, jumping forward when its
// dependency bound lies beyond it. Pattern matches are tried in priority
// order before the cursor walk:
//
//   1. folding: arithmetic whose first source is a scalar load is fused
//      into the load's own cell,
//   2. hard pins: conditional-select and address-generation results fix
//      the consumer's cell,
//   3. same-unit: data-class memory operands produced by the cell's own
//      arithmetic unit,
//   4. the cursor walk.
//
// Preconditions: the context was built from validated records.
// Postconditions: every record has a `Placement`; every destination symbol
//                 has a location; slots are claimed at most once.
// Failure modes: Capacity (rows exhausted, explicit location outside grid),
//                Conflict (slot occupied), Sequencing (explicit location
//                before the bound, pinned consumer elsewhere).
// Side effects: none.

use tracing::trace;

use crate::arch::{Loc, GRID_WIDTH};
use crate::depend::{self, Bound};
use crate::diag::{codes, CompileError, CompileResult};
use crate::grid::{CompilationContext, Placement};
use crate::microop::{MicroOp, OpKind, Operand, OperandSlot, SlotKind};
use crate::symtab::SymId;

/// Place every record in source order.
pub fn place_all(ctx: &mut CompilationContext<'_>) -> CompileResult<()> {
    for idx in 0..ctx.program.ops.len() {
        let placement = place_one(ctx, idx)?;
        commit(ctx, idx, placement)?;
    }
    Ok(())
}

fn place_one(ctx: &CompilationContext<'_>, idx: usize) -> CompileResult<Placement> {
    let op = &ctx.program.ops[idx];
    let bound = depend::resolve(ctx, idx)?;
    match op.at {
        Some(at) => place_explicit(ctx, idx, op, &bound, at),
        None => place_auto(ctx, idx, op, &bound),
    }
}

fn is_wide(op: &MicroOp) -> bool {
    matches!(op.kind, OpKind::Ex4(_))
}

// ── Explicit locations ──────────────────────────────────────────────────────

fn place_explicit(
    ctx: &CompilationContext<'_>,
    idx: usize,
    op: &MicroOp,
    bound: &Bound,
    at: Loc,
) -> CompileResult<Placement> {
    let wide = is_wide(op);
    if !at.in_grid(ctx.depth()) {
        return Err(CompileError::capacity(
            codes::E0104,
            format!("explicit location outside a {}-row grid", ctx.depth()),
        )
        .with_symbol(op.label())
        .at(at));
    }
    let at = if wide { Loc::new(at.row, 0) } else { at };

    if !wide && fold_candidate(ctx, idx, op, bound, false) == Some(at) {
        return Ok(Placement {
            loc: at,
            fold: true,
            wide,
        });
    }

    for pin in bound.hard_pins() {
        if pin != at {
            return Err(CompileError::sequencing(
                codes::E0302,
                format!("must share cell {} with its producer", pin),
            )
            .with_symbol(op.label())
            .at(at));
        }
    }

    let needed = if wide {
        (0..GRID_WIDTH as u8)
            .map(|c| bound.row_at(Loc::new(at.row, c)))
            .max()
            .unwrap_or(0)
    } else {
        bound.row_at(at)
    };
    if at.row < needed {
        return Err(CompileError::sequencing(
            codes::E0300,
            format!("explicit row {} is before dependency bound {}", at.row, needed),
        )
        .with_symbol(op.label())
        .at(at)
        .with_hint("only an arithmetic record fused with its load may sit one row early"));
    }
    Ok(Placement {
        loc: at,
        fold: false,
        wide,
    })
}

// ── Automatic placement ─────────────────────────────────────────────────────

fn place_auto(
    ctx: &CompilationContext<'_>,
    idx: usize,
    op: &MicroOp,
    bound: &Bound,
) -> CompileResult<Placement> {
    let kind = op.slot_kind();
    let wide = is_wide(op);

    if let Some(loc) = fold_candidate(ctx, idx, op, bound, true) {
        return Ok(Placement {
            loc,
            fold: true,
            wide: false,
        });
    }

    let pins = bound.hard_pins();
    if let Some(&pin) = pins.first() {
        if pins.len() > 1 {
            return Err(CompileError::sequencing(
                codes::E0302,
                format!("pinned to both {} and {}", pins[0], pins[1]),
            )
            .with_symbol(op.label()));
        }
        if bound.row_at(pin) > pin.row {
            return Err(CompileError::sequencing(
                codes::E0302,
                "other operands are not ready in the pinned cell",
            )
            .with_symbol(op.label())
            .at(pin));
        }
        return Ok(Placement {
            loc: pin,
            fold: false,
            wide,
        });
    }

    if !wide {
        for pin in bound.same_unit_pins() {
            if bound.row_at(pin) <= pin.row && ctx.grid.cell(pin).is_free(kind) {
                return Ok(Placement {
                    loc: pin,
                    fold: false,
                    wide,
                });
            }
        }
    }

    let min_row = bound.relaxed_row();
    let loc = if wide {
        walk_wide(ctx, min_row)
    } else {
        walk(ctx, kind, min_row)
    };
    loc.map(|loc| Placement {
        loc,
        fold: false,
        wide,
    })
    .map_err(|at| {
        CompileError::capacity(
            codes::E0100,
            format!("no free {} slot before row {}", kind, ctx.depth()),
        )
        .with_symbol(op.label())
        .at(at)
    })
}

/// Row-major scan from the cursor (or from `min_row` when it lies beyond).
fn walk(ctx: &CompilationContext<'_>, kind: SlotKind, min_row: u8) -> Result<Loc, Loc> {
    let rows = ctx.depth().rows() as u8;
    let (mut row, mut col) = if min_row > ctx.cursor.row {
        (min_row, 0)
    } else {
        (ctx.cursor.row, ctx.cursor.col)
    };
    while row < rows {
        let loc = Loc::new(row, col);
        if ctx.grid.cell(loc).is_free(kind) {
            return Ok(loc);
        }
        col += 1;
        if col as usize == GRID_WIDTH {
            col = 0;
            row += 1;
        }
    }
    Err(Loc::new(row, col))
}

/// First row at or after the cursor with every arithmetic slot free.
fn walk_wide(ctx: &CompilationContext<'_>, min_row: u8) -> Result<Loc, Loc> {
    let rows = ctx.depth().rows() as u8;
    let mut row = min_row.max(ctx.cursor.row);
    while row < rows {
        let all_free = (0..GRID_WIDTH as u8)
            .all(|c| ctx.grid.cell(Loc::new(row, c)).is_free(SlotKind::Exe));
        if all_free {
            return Ok(Loc::new(row, 0));
        }
        row += 1;
    }
    Err(Loc::new(row, 0))
}

// ── Folding ─────────────────────────────────────────────────────────────────

/// Cell of the scalar load that `op` can be fused with, if any.
///
/// The first source must be a scalar load at (r, c); every other operand,
/// including a second read of the same load, must be available at r; the arithmetic slot of (r, c) must be free and,
/// for automatic placement, r must not lie behind the cursor.
fn fold_candidate(
    ctx: &CompilationContext<'_>,
    idx: usize,
    op: &MicroOp,
    bound: &Bound,
    respect_cursor: bool,
) -> Option<Loc> {
    let OpKind::Exe(e) = &op.kind else { return None };
    let Operand::Sym(first) = &e.srcs.first()?.value else { return None };
    let sym: SymId = ctx.symtab.lookup(&first.name)?;
    let producer_op = ctx.symtab.get(sym).op?;
    if producer_op == idx {
        return None;
    }
    let load = ctx.program.ops[producer_op].mem()?;
    if !matches!(ctx.program.ops[producer_op].kind, OpKind::Mop(_)) || !load.op.produces_value() {
        return None;
    }
    let at = ctx.symtab.get(sym).loc?;
    let others_ready = bound
        .edges
        .iter()
        .filter(|edge| edge.slot != OperandSlot::ExeSrc(0))
        .all(|edge| edge.row_at(at) <= at.row);
    let cell = ctx.grid.cell(at);
    if !others_ready || !cell.is_free(SlotKind::Exe) || cell.fold {
        return None;
    }
    if respect_cursor && at.row < ctx.cursor.row {
        return None;
    }
    Some(at)
}

// ── Commit ──────────────────────────────────────────────────────────────────

fn commit(ctx: &mut CompilationContext<'_>, idx: usize, placement: Placement) -> CompileResult<()> {
    let program = ctx.program;
    let op = &program.ops[idx];
    let label = op.label();
    let loc = placement.loc;
    let kind = op.slot_kind();

    if placement.wide {
        for c in 0..GRID_WIDTH as u8 {
            let cell_loc = Loc::new(loc.row, c);
            if !ctx.grid.cell(cell_loc).is_free(SlotKind::Exe) {
                return Err(CompileError::conflict(
                    codes::E0200,
                    "4-wide arithmetic needs every arithmetic slot of its row",
                )
                .with_symbol(label)
                .at(cell_loc));
            }
        }
        for c in 0..GRID_WIDTH as u8 {
            ctx.grid.claim(Loc::new(loc.row, c), SlotKind::Exe, idx)?;
        }
    } else {
        ctx.grid
            .claim(loc, kind, idx)
            .map_err(|e| e.with_symbol(label.clone()))?;
    }

    let cell = ctx.grid.cell_mut(loc);
    if placement.fold {
        cell.fold = true;
    }
    if let Some(m) = op.mem() {
        if m.op.reserves_transfer() {
            cell.wiring.tr_reserved = true;
        }
    }

    for (dest, _) in op.dests() {
        let id = ctx.symtab.require(dest)?;
        ctx.symtab.commit(id, loc)?;
    }
    ctx.placements[idx] = Some(placement);
    ctx.cursor.advance_to(loc);
    trace!(record = idx, %loc, fold = placement.fold, "placed {}", label);
    Ok(())
}
