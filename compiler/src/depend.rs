// depend.rs — Dependency resolver
//
// Computes, for one record, the earliest row at which every operand is
// available, together with the cells some operands pin the record to.
// The bound depends on both the producer kind and the role the consumer
// reads the value in:
//
//   producer            consumer role                bound
//   ------------------  ---------------------------  -------------------------
//   conditional-select  condition / arithmetic       producer row, same cell
//   arith/guard/ex4     memory base (address)        producer row + 1
//   arith/guard/ex4     memory offset / store data   producer row, same unit
//   arith/guard/ex4     any other input              producer row + 1
//   address-generation  memory base                  producer row, same cell
//   memory load         any input                    producer row + 1
//
// Preconditions: every producer of an operand is already placed.
// Postconditions: `Bound::row_at(loc)` is the bound that applies when the
//                 record lands on `loc`.
// Failure modes: Sequencing (a value kind that cannot feed the role),
//                Malformed (window operands that are not host values).
// Side effects: none.

use crate::arch::Loc;
use crate::diag::{codes, CompileError, CompileResult};
use crate::grid::CompilationContext;
use crate::microop::{OpKind, Operand, OperandSlot, ProducerKind};
use crate::opcode::MemUnit;
use crate::symtab::SymId;

// ── Roles ───────────────────────────────────────────────────────────────────

/// How a consumer reads an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Arithmetic source, guard init/step.
    Arith,
    /// Conditional-select condition code.
    Cond,
    /// Address-generation base or compare stream.
    AddrGen,
    /// Memory base address (address-class).
    MemAddress,
    /// Memory offset or store data (data-class).
    MemData,
    /// Memory predicate.
    MemCond,
    /// Window description: top, length, partner top.
    Window,
}

impl Role {
    pub fn of(slot: OperandSlot) -> Role {
        match slot {
            OperandSlot::ExeSrc(_)
            | OperandSlot::Src4
            | OperandSlot::Src5
            | OperandSlot::GuardInit
            | OperandSlot::GuardStep => Role::Arith,
            OperandSlot::CexCond(_) => Role::Cond,
            OperandSlot::MexBase(_) | OperandSlot::MexCmp(_) => Role::AddrGen,
            OperandSlot::MemBase => Role::MemAddress,
            OperandSlot::MemOffset | OperandSlot::MemData => Role::MemData,
            OperandSlot::MemCond => Role::MemCond,
            OperandSlot::MemTop | OperandSlot::MemLen | OperandSlot::MemPtop => Role::Window,
        }
    }
}

// ── Edges ───────────────────────────────────────────────────────────────────

/// How an edge constrains placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    /// Row strictly after the producer.
    NextRow,
    /// Same row in exactly the producer's cell, otherwise the next row.
    SameUnit(Loc),
    /// Exactly the producer's cell.
    Pinned(Loc),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub slot: OperandSlot,
    pub sym: SymId,
    pub lane: u8,
    pub producer: ProducerKind,
    pub from: Loc,
    pub rule: Rule,
}

impl Edge {
    /// Lowest legal row for a consumer landing on `loc`.
    pub fn row_at(&self, loc: Loc) -> u8 {
        match self.rule {
            Rule::NextRow => self.from.row + 1,
            Rule::SameUnit(pin) | Rule::Pinned(pin) if pin == loc => pin.row,
            Rule::SameUnit(_) | Rule::Pinned(_) => self.from.row + 1,
        }
    }

    /// Optimistic bound: same-unit edges counted at the producer row.
    pub fn best_row(&self) -> u8 {
        match self.rule {
            Rule::NextRow => self.from.row + 1,
            Rule::SameUnit(pin) | Rule::Pinned(pin) => pin.row,
        }
    }
}

/// Everything placement needs to know about one record's operands.
#[derive(Debug, Clone, Default)]
pub struct Bound {
    pub edges: Vec<Edge>,
}

impl Bound {
    /// Optimistic lower bound (same-unit edges satisfied).
    pub fn row(&self) -> u8 {
        self.edges.iter().map(Edge::best_row).max().unwrap_or(0)
    }

    /// Lower bound when every same-unit edge is routed normally.
    pub fn relaxed_row(&self) -> u8 {
        self.edges
            .iter()
            .map(|e| match e.rule {
                Rule::SameUnit(_) => e.from.row + 1,
                _ => e.best_row(),
            })
            .max()
            .unwrap_or(0)
    }

    /// Bound that applies when the record lands on `loc`.
    pub fn row_at(&self, loc: Loc) -> u8 {
        self.edges.iter().map(|e| e.row_at(loc)).max().unwrap_or(0)
    }

    /// Cells the record must occupy exactly.
    pub fn hard_pins(&self) -> Vec<Loc> {
        let mut pins: Vec<Loc> = self
            .edges
            .iter()
            .filter_map(|e| match e.rule {
                Rule::Pinned(l) => Some(l),
                _ => None,
            })
            .collect();
        pins.dedup();
        pins
    }

    /// Cells that would let data-class operands skip routing.
    pub fn same_unit_pins(&self) -> Vec<Loc> {
        let mut pins: Vec<Loc> = Vec::new();
        for e in &self.edges {
            if let Rule::SameUnit(l) = e.rule {
                if !pins.contains(&l) {
                    pins.push(l);
                }
            }
        }
        pins
    }
}

// ── Resolution ──────────────────────────────────────────────────────────────

/// Memory unit a masked address generator's `dest0`/`dest1` drives.
fn mex_unit(ctx: &CompilationContext<'_>, producer_op: usize, name: &str) -> MemUnit {
    match &ctx.program.ops[producer_op].kind {
        OpKind::Mex(m) if m.dest1.as_deref() == Some(name) => MemUnit::Load,
        _ => MemUnit::Store,
    }
}

/// Compute the operand edges of record `idx`.
pub fn resolve(ctx: &CompilationContext<'_>, idx: usize) -> CompileResult<Bound> {
    let op = &ctx.program.ops[idx];
    let label = op.label();
    let mut bound = Bound::default();

    for (slot, operand) in op.operands() {
        let role = Role::of(slot);
        let Operand::Sym(r) = operand else { continue };
        let sym = ctx.symtab.require(&r.name)?;
        let info = ctx.symtab.get(sym);

        if role == Role::Window {
            if info.producer != ProducerKind::Host {
                return Err(CompileError::malformed(
                    "window top/length must be a host symbol or immediate",
                )
                .with_symbol(r.name.clone()));
            }
            continue;
        }
        if info.producer == ProducerKind::Host {
            if role == Role::MemCond {
                return Err(CompileError::sequencing(
                    codes::E0303,
                    "memory predicate must come from a conditional-select",
                )
                .with_symbol(r.name.clone()));
            }
            continue;
        }
        // Accumulator feedback is wired inside the unit.
        if info.op == Some(idx) {
            continue;
        }

        let from = ctx.producer_loc(sym, r.lane)?;
        let unsupported = || {
            Err(CompileError::sequencing(
                codes::E0303,
                format!("{:?} result cannot feed {:?} input of `{}`", info.producer, role, label),
            )
            .with_symbol(r.name.clone()))
        };

        let rule = match (info.producer, role) {
            (ProducerKind::Host, _) => continue,
            (ProducerKind::Cex, Role::MemCond | Role::Arith) => Rule::Pinned(from),
            (ProducerKind::Cex, _) => return unsupported(),
            (ProducerKind::Guard | ProducerKind::Exe | ProducerKind::Ex4, Role::MemData) => {
                Rule::SameUnit(from)
            }
            (ProducerKind::Guard | ProducerKind::Exe | ProducerKind::Ex4, Role::MemCond) => {
                return unsupported()
            }
            (ProducerKind::Guard | ProducerKind::Exe | ProducerKind::Ex4, _) => Rule::NextRow,
            (ProducerKind::Mex, Role::MemAddress) => {
                let unit = op.mem().map(|m| m.op.unit());
                let producer_op = info.op.unwrap_or(idx);
                if unit != Some(mex_unit(ctx, producer_op, &r.name)) {
                    return Err(CompileError::sequencing(
                        codes::E0303,
                        "advanced address drives the other memory unit",
                    )
                    .with_symbol(r.name.clone()));
                }
                Rule::Pinned(from)
            }
            (ProducerKind::Mex, _) => return unsupported(),
            (ProducerKind::Load, Role::MemCond) => return unsupported(),
            (ProducerKind::Load, _) => Rule::NextRow,
        };

        bound.edges.push(Edge {
            slot,
            sym,
            lane: r.lane,
            producer: info.producer,
            from,
            rule,
        });
    }
    Ok(bound)
}
