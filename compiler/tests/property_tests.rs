// Property-based tests for placement and coherency invariants.
//
// Three categories:
// 1. Placement: generated arithmetic chains never double-book a unit and
//    compile deterministically; mixed arithmetic, memory, conditional and
//    address-generation records honour the rule of every operand edge
// 2. Merging: copies agree with their master on every window field, and
//    neighbours that agree are merged
// 3. Coherency: dispatching the same descriptors twice moves nothing the
//    second time
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use std::collections::HashSet;

use gridc::arch::{GridDepth, Loc, GRID_WIDTH};
use gridc::conf::LmmiWord;
use gridc::depend::{self, Rule};
use gridc::diag::ErrorKind;
use gridc::lmm::LmmDescriptor;
use gridc::microop::{CexInsn, MexInsn, MicroOp, OpKind, Operand, OperandSlot, Program};
use gridc::opcode::{AluOp, CexOp, MemOp, MexOp};
use gridc::pass::PassId;
use gridc::pipeline::{compile, run_pipeline, CompileOptions};
use gridc::runtime::coherency::Table;
use gridc::runtime::{CoherencyState, Phase, Transfer};
use proptest::prelude::*;

// ── Generators ─────────────────────────────────────────────────────────────

/// Each record reads one or two earlier results or small constants.
fn arb_chain() -> impl Strategy<Value = Vec<(Option<usize>, Option<usize>, u64)>> {
    prop::collection::vec(
        (any::<Option<usize>>(), any::<Option<usize>>(), 0u64..8),
        1..10,
    )
}

fn chain_program(chain: &[(Option<usize>, Option<usize>, u64)]) -> Program {
    let mut p = Program::default();
    for (i, (a, b, imm)) in chain.iter().enumerate() {
        let pick = |r: &Option<usize>| match r {
            Some(j) if i > 0 => Operand::sym(format!("v{}", j % i)),
            _ => Operand::imm(*imm),
        };
        p = p.push(MicroOp::exe(AluOp::Add, &format!("v{}", i), &[pick(a), pick(b)]));
    }
    p
}

fn d64() -> CompileOptions {
    CompileOptions::default()
}

// ── Placement ──────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 200,
        ..ProptestConfig::default()
    })]

    #[test]
    fn no_unit_is_double_booked(chain in arb_chain()) {
        let p = chain_program(&chain);
        match compile(&p, &d64()) {
            Ok(k) => {
                let mut seen = HashSet::new();
                for (op, pl) in p.ops.iter().zip(&k.placements) {
                    prop_assert!(
                        seen.insert((pl.loc, op.slot_kind())),
                        "{} placed twice on {}", op.slot_kind(), pl.loc
                    );
                }
            }
            Err(e) => prop_assert_eq!(e.kind, ErrorKind::Capacity),
        }
    }

    #[test]
    fn compilation_is_deterministic(chain in arb_chain()) {
        let p = chain_program(&chain);
        let (a, b) = (compile(&p, &d64()), compile(&p, &d64()));
        match (a, b) {
            (Ok(a), Ok(b)) => {
                prop_assert_eq!(a.emitted.to_bytes(), b.emitted.to_bytes());
                prop_assert_eq!(a.listing(), b.listing());
                prop_assert_eq!(a.provenance.to_json(), b.provenance.to_json());
            }
            (Err(a), Err(b)) => prop_assert_eq!(a.to_string(), b.to_string()),
            _ => prop_assert!(false, "compilation outcome differs between runs"),
        }
    }
}

// ── Operand edges ──────────────────────────────────────────────────────────

/// Values each kind of record may read, by the role that reads them.
#[derive(Default)]
struct Pools {
    /// Arithmetic and load results.
    values: Vec<String>,
    /// Conditional-select results.
    conds: Vec<String>,
    /// Advanced bases, one consumer each.
    store_bases: Vec<String>,
    load_bases: Vec<String>,
}

fn pick(pool: &[String], n: usize) -> Option<Operand> {
    (!pool.is_empty()).then(|| Operand::sym(pool[n % pool.len()].clone()))
}

fn take(pool: &mut Vec<String>, n: usize) -> Option<Operand> {
    (!pool.is_empty()).then(|| Operand::sym(pool.swap_remove(n % pool.len())))
}

/// (record kind, operand picks, operand mode).
fn arb_mixed() -> impl Strategy<Value = Vec<(u8, usize, usize, u8)>> {
    prop::collection::vec((0u8..6, any::<usize>(), any::<usize>(), 0u8..4), 1..14)
}

/// Build records whose operands exercise every placement rule:
/// address-class bases, data-class offsets and store data, conditional
/// predicates pinned to their select, and advanced bases pinned to their
/// generator.
fn mixed_program(steps: &[(u8, usize, usize, u8)]) -> Program {
    let mut p = Program::default().host_addr("a", 0x1000);
    let mut pools = Pools::default();
    for (i, &(kind, x, y, mode)) in steps.iter().enumerate() {
        let or_imm = |o: Option<Operand>, v: u64| o.unwrap_or(Operand::imm(v));
        match kind {
            0 => {
                let dest = format!("e{}", i);
                let srcs = [or_imm(pick(&pools.values, x), 1), or_imm(pick(&pools.values, y), 2)];
                p = p.push(MicroOp::exe(AluOp::Add, &dest, &srcs));
                pools.values.push(dest);
            }
            1 | 2 => {
                let base = match mode {
                    1 => or_imm(pick(&pools.values, x), 0),
                    _ => Operand::imm(0),
                };
                let dest = format!("l{}", i);
                let mut op = if kind == 1 {
                    MicroOp::load(MemOp::Ldr, &dest, base, Operand::sym("a"), 16)
                } else {
                    let data = or_imm(pick(&pools.values, x), 7);
                    MicroOp::store(MemOp::Str, data, base, Operand::sym("a"), 16)
                };
                if let OpKind::Mop(m) = &mut op.kind {
                    if mode == 2 {
                        m.offset = or_imm(pick(&pools.values, y), 0);
                    }
                    if mode == 3 {
                        m.cond = pick(&pools.conds, y);
                    }
                }
                p = p.push(op);
                if kind == 1 {
                    pools.values.push(dest);
                }
            }
            3 => {
                let dest = format!("c{}", i);
                p = p.push(MicroOp::new(OpKind::Cex(CexInsn {
                    op: CexOp::Cexe,
                    dest: dest.clone(),
                    conds: vec![or_imm(pick(&pools.values, x), 1)],
                    table: 0xaaaa,
                })));
                pools.conds.push(dest);
            }
            4 => {
                let (d0, d1) = (format!("m{}s", i), format!("m{}l", i));
                p = p.push(MicroOp::new(OpKind::Mex(MexInsn {
                    op0: MexOp::Always,
                    op1: MexOp::Always,
                    dest0: Some(d0.clone()),
                    dest1: Some(d1.clone()),
                    base0: Operand::imm(0x100),
                    base1: Operand::imm(0x200),
                    dist0: 4,
                    dist1: 4,
                    limit: 0,
                    cmp0: None,
                    cmp1: None,
                    init0: true,
                    init1: true,
                })));
                pools.store_bases.push(d0);
                pools.load_bases.push(d1);
            }
            _ => {
                let dest = format!("l{}", i);
                if mode % 2 == 0 {
                    if let Some(base) = take(&mut pools.load_bases, x) {
                        p = p.push(MicroOp::load(MemOp::Ldr, &dest, base, Operand::sym("a"), 16));
                        pools.values.push(dest);
                    }
                } else if let Some(base) = take(&mut pools.store_bases, x) {
                    let data = or_imm(pick(&pools.values, y), 7);
                    p = p.push(MicroOp::store(MemOp::Str, data, base, Operand::sym("a"), 16));
                }
            }
        }
    }
    p
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        max_shrink_iters: 200,
        ..ProptestConfig::default()
    })]

    #[test]
    fn every_operand_edge_is_honoured(steps in arb_mixed()) {
        let p = mixed_program(&steps);
        let state = match run_pipeline(&p, &d64(), PassId::Route) {
            Ok(s) => s,
            Err(e) => {
                prop_assert!(
                    matches!(e.kind, ErrorKind::Capacity | ErrorKind::Conflict | ErrorKind::Sequencing),
                    "unexpected failure: {}", e
                );
                return Ok(());
            }
        };
        let ctx = &state.ctx;
        for idx in 0..p.ops.len() {
            let pl = ctx.placement(idx).unwrap();
            let at = pl.loc;
            let bound = depend::resolve(ctx, idx).unwrap();
            for edge in &bound.edges {
                let name = ctx.symtab.name(edge.sym);
                if pl.fold && edge.slot == OperandSlot::ExeSrc(0) {
                    // fused into the producing load's own cell
                    prop_assert_eq!(at, edge.from, "folded {} away from {}", p.ops[idx].label(), name);
                    continue;
                }
                prop_assert!(
                    at.row >= edge.row_at(at),
                    "{} at {} reads {} from {} under {:?}", p.ops[idx].label(), at, name, edge.from, edge.rule
                );
                match edge.rule {
                    Rule::Pinned(cell) => prop_assert_eq!(at, cell, "{} left its pinned cell", p.ops[idx].label()),
                    Rule::SameUnit(cell) if at.row == cell.row => prop_assert_eq!(at, cell),
                    _ => prop_assert!(at.row > edge.from.row, "{} shares row {} with {}", p.ops[idx].label(), at.row, name),
                }
            }
        }
    }
}

// ── Merging ────────────────────────────────────────────────────────────────

/// Window shape of one pinned load: (second top, short, force, partner,
/// block class). Fields are drawn from small pools so that neighbours often
/// coincide on some fields and differ on others.
type Shape = (bool, bool, bool, bool, u8);

fn arb_row() -> impl Strategy<Value = Vec<Option<Shape>>> {
    prop::collection::vec(
        prop::option::weighted(0.8, (any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>(), 0u8..2)),
        GRID_WIDTH,
    )
}

fn shaped_load(c: usize, (other_top, short, force, partner, blk): Shape) -> MicroOp {
    let top = if other_top { "b" } else { "a" };
    let len = if short { 32 } else { 64 };
    let mut op = MicroOp::load(MemOp::Ldr, &format!("x{}", c), Operand::imm(0), Operand::sym(top), len)
        .at(2, c as u8);
    if let OpKind::Mop(m) = &mut op.kind {
        m.force = force;
        m.blk = blk;
        m.ptop = partner.then(|| Operand::sym("pf"));
    }
    op
}

/// Every field that defines a shared region.
fn region_fields(d: &LmmDescriptor) -> (bool, bool, bool, u8, u32, u64, i32, bool) {
    (d.write, d.force, d.prefetch, d.blk, d.len, d.top, d.ofs, d.cidx)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        max_shrink_iters: 200,
        ..ProptestConfig::default()
    })]

    #[test]
    fn merged_neighbours_agree_on_every_region_field(row in arb_row()) {
        prop_assume!(row.iter().any(Option::is_some));
        let mut p = Program::default()
            .host_addr("a", 0x1000)
            .host_addr("b", 0x8000)
            .host_addr("pf", 0x20000);
        for (c, slot) in row.iter().enumerate() {
            if let Some(shape) = slot {
                p = p.push(shaped_load(c, *shape));
            }
        }
        let opts = CompileOptions { depth: GridDepth::D8, ..CompileOptions::default() };
        let k = compile(&p, &opts).unwrap();

        for (loc, d) in k.lmm.iter().filter(|(_, d)| d.valid && d.is_copy()) {
            let master = d.master.unwrap();
            prop_assert_eq!(master.row, loc.row);
            prop_assert!(master.col < loc.col);
            let m = k.lmm.get(master);
            prop_assert_eq!(region_fields(m), region_fields(d), "{} copies {}", loc, master);
            prop_assert_eq!(m.mode, d.mode);
            prop_assert!(m.bcas & (1 << loc.col) != 0);
        }

        // the converse: agreeing neighbours never stay private
        for (lo, hi) in [(0u8, 1u8), (2, 3)] {
            let (a, b) = (k.lmm.get(Loc::new(2, lo)), k.lmm.get(Loc::new(2, hi)));
            if a.valid && b.valid && region_fields(a) == region_fields(b) {
                prop_assert!(b.is_copy(), "[2][{}] and [2][{}] agree but were not merged", lo, hi);
            }
        }
    }
}

// ── Coherency ──────────────────────────────────────────────────────────────

const DEPTH: usize = 8;

/// Read and write windows at distinct addresses, one per cell at most.
fn arb_table() -> impl Strategy<Value = Table> {
    prop::collection::vec(any::<Option<(bool, u8)>>(), DEPTH * GRID_WIDTH).prop_map(|cells| {
        let mut t = vec![[LmmiWord::default(); GRID_WIDTH]; DEPTH];
        for (n, cell) in cells.into_iter().enumerate() {
            let Some((write, len)) = cell else { continue };
            t[n / GRID_WIDTH][n % GRID_WIDTH] = LmmiWord {
                v: true,
                rw: write,
                bcas: 1 << (n % GRID_WIDTH),
                len: len as u32 % 64 + 1,
                top: 0x10_0000 + n as u64 * 0x1000,
                ..LmmiWord::default()
            };
        }
        t
    })
}

/// Run one dispatch without post-execution writeback.
fn dispatch(state: &mut CoherencyState, table: &Table) -> Vec<(Phase, Vec<Transfer>)> {
    let mut out = Vec::new();
    state.begin(vec![table.clone()], 0).unwrap();
    for next in [Phase::Load, Phase::Exec, Phase::None] {
        let plan = state.plan().unwrap();
        out.push((plan.phase, plan.transfers.clone()));
        state.apply(plan).unwrap();
        state.advance(next).unwrap();
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 200,
        ..ProptestConfig::default()
    })]

    #[test]
    fn repeated_dispatch_moves_nothing(table in arb_table()) {
        let mut state = CoherencyState::new(DEPTH, 1, 8192);
        dispatch(&mut state, &table);
        let dirty = state.dirty().count();
        for (phase, transfers) in dispatch(&mut state, &table) {
            prop_assert!(transfers.is_empty(), "{} moved {:?}", phase, transfers);
        }
        prop_assert_eq!(state.dirty().count(), dirty);
    }

    #[test]
    fn flush_drains_every_written_window_once(table in arb_table()) {
        let mut state = CoherencyState::new(DEPTH, 1, 8192);
        dispatch(&mut state, &table);
        let written = table.iter().flatten().filter(|w| w.v && w.rw).count();
        prop_assert_eq!(state.dirty().count(), written);

        let plan = state.plan_flush().unwrap();
        let words: u64 = table.iter().flatten().filter(|w| w.v && w.rw).map(|w| w.len as u64).sum();
        prop_assert_eq!(plan.words(), words);
        state.apply(plan).unwrap();
        prop_assert_eq!(state.dirty().count(), 0);
        prop_assert!(state.plan_flush().unwrap().is_empty());
    }
}

#[test]
fn loc_display_matches_listing_format() {
    assert_eq!(Loc::new(3, 2).to_string(), "[3][2]");
}
