// symtab.rs — Symbol table
//
// Per-symbol metadata: who produces it, where it was placed, and the host
// value for symbols supplied by the caller.
//
// Preconditions: `build` receives validated records.
// Postconditions: every destination has exactly one producer; every operand
//                 names a host symbol or an earlier producer.
// Failure modes: Conflict (two producers), Sequencing (undefined or forward
//                reference), Internal (second commit).
// Side effects: none.

use std::collections::HashMap;

use crate::arch::Loc;
use crate::diag::{codes, CompileError, CompileResult};
use crate::microop::{Operand, OperandSlot, Program, ProducerKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymId(pub u32);

/// Host-supplied value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostValue {
    Imm(u64),
    Addr(u64),
}

impl HostValue {
    pub fn raw(self) -> u64 {
        match self {
            HostValue::Imm(v) | HostValue::Addr(v) => v,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub producer: ProducerKind,
    /// Index of the producing record (`None` for host symbols).
    pub op: Option<usize>,
    /// Assigned once the producer is committed.
    pub loc: Option<Loc>,
    pub host: Option<HostValue>,
}

#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    by_name: HashMap<String, SymId>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare host symbols, then every destination in source order, then
    /// check that each operand refers backwards.
    pub fn build(program: &Program) -> CompileResult<Self> {
        let mut table = SymbolTable::new();
        for s in &program.symbols {
            let value = match (s.imm, s.addr) {
                (Some(v), None) => HostValue::Imm(v),
                (None, Some(a)) => HostValue::Addr(a),
                _ => {
                    return Err(CompileError::malformed(
                        "host symbol needs exactly one of `imm` or `addr`",
                    )
                    .with_symbol(s.name.clone()))
                }
            };
            table.declare(&s.name, ProducerKind::Host, None, Some(value))?;
        }
        for (idx, op) in program.ops.iter().enumerate() {
            for (dest, kind) in op.dests() {
                table.declare(dest, kind, Some(idx), None)?;
            }
        }
        for (idx, op) in program.ops.iter().enumerate() {
            for (slot, operand) in op.operands() {
                let Operand::Sym(r) = operand else { continue };
                let id = table.lookup(&r.name).ok_or_else(|| {
                    CompileError::sequencing(codes::E0301, "symbol is never produced")
                        .with_symbol(r.name.clone())
                })?;
                let sym = table.get(id);
                let self_loop = slot == OperandSlot::ExeSrc(0) && sym.op == Some(idx);
                match sym.op {
                    Some(p) if p > idx || (p == idx && !self_loop) => {
                        return Err(CompileError::sequencing(
                            codes::E0301,
                            format!("record {} reads a value produced by record {}", idx, p),
                        )
                        .with_symbol(r.name.clone()));
                    }
                    _ => {}
                }
            }
        }
        Ok(table)
    }

    fn declare(
        &mut self,
        name: &str,
        producer: ProducerKind,
        op: Option<usize>,
        host: Option<HostValue>,
    ) -> CompileResult<SymId> {
        if self.by_name.contains_key(name) {
            return Err(
                CompileError::conflict(codes::E0201, "symbol has more than one producer")
                    .with_symbol(name),
            );
        }
        let id = SymId(self.symbols.len() as u32);
        self.symbols.push(Symbol {
            name: name.to_string(),
            producer,
            op,
            loc: None,
            host,
        });
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Option<SymId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: SymId) -> &Symbol {
        &self.symbols[id.0 as usize]
    }

    pub fn name(&self, id: SymId) -> &str {
        &self.symbols[id.0 as usize].name
    }

    /// Resolve a name that `build` has already checked.
    pub fn require(&self, name: &str) -> CompileResult<SymId> {
        self.lookup(name).ok_or_else(|| {
            CompileError::sequencing(codes::E0301, "symbol is never produced").with_symbol(name)
        })
    }

    /// Record the placement of a symbol's producer. Happens exactly once.
    pub fn commit(&mut self, id: SymId, loc: Loc) -> CompileResult<()> {
        let sym = &mut self.symbols[id.0 as usize];
        if sym.loc.is_some() {
            return Err(CompileError::internal("symbol committed twice")
                .with_symbol(sym.name.clone())
                .at(loc));
        }
        sym.loc = Some(loc);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (SymId, &Symbol)> {
        self.symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (SymId(i as u32), s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::ErrorKind;
    use crate::microop::MicroOp;
    use crate::opcode::{AluOp, MemOp};

    fn sym(n: &str) -> Operand {
        Operand::sym(n)
    }

    #[test]
    fn build_declares_hosts_and_dests() {
        let p = Program::default()
            .host_addr("a", 0x1000)
            .host_imm("n", 7)
            .push(MicroOp::load(MemOp::Ldr, "v", Operand::imm(0), sym("a"), 8))
            .push(MicroOp::exe(AluOp::Add, "w", &[sym("v"), sym("n")]));
        let t = SymbolTable::build(&p).unwrap();
        assert_eq!(t.len(), 4);
        let v = t.get(t.lookup("v").unwrap());
        assert_eq!(v.producer, ProducerKind::Load);
        assert_eq!(v.op, Some(0));
        assert_eq!(t.get(t.lookup("n").unwrap()).host, Some(HostValue::Imm(7)));
    }

    #[test]
    fn second_producer_is_conflict() {
        let p = Program::default()
            .push(MicroOp::exe(AluOp::Add, "x", &[Operand::imm(1)]))
            .push(MicroOp::exe(AluOp::Sub, "x", &[Operand::imm(2)]));
        let err = SymbolTable::build(&p).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert_eq!(err.symbol.as_deref(), Some("x"));
    }

    #[test]
    fn forward_reference_is_sequencing() {
        let p = Program::default()
            .push(MicroOp::exe(AluOp::Add, "x", &[sym("y")]))
            .push(MicroOp::exe(AluOp::Add, "y", &[Operand::imm(2)]));
        let err = SymbolTable::build(&p).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Sequencing);
        assert_eq!(err.code, codes::E0301);
    }

    #[test]
    fn accumulator_self_loop_is_allowed() {
        let p = Program::default().push(MicroOp::exe(AluOp::Add, "acc", &[sym("acc"), Operand::imm(1)]));
        assert!(SymbolTable::build(&p).is_ok());
    }

    #[test]
    fn commit_happens_once() {
        let p = Program::default().push(MicroOp::exe(AluOp::Add, "x", &[Operand::imm(1)]));
        let mut t = SymbolTable::build(&p).unwrap();
        let x = t.lookup("x").unwrap();
        t.commit(x, Loc::new(0, 0)).unwrap();
        assert_eq!(t.commit(x, Loc::new(1, 0)).unwrap_err().kind, ErrorKind::Internal);
    }
}
