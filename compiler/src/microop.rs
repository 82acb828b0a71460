// microop.rs — Micro-operation record format
//
// The closed set of records the front end hands to placement, deserialized
// from JSON. Each record carries typed operand references and an optional
// explicit grid location.
//
// Preconditions: none.
// Postconditions: `validate` accepts only records the fabric can express.
// Failure modes: `Malformed` errors from `validate`.
// Side effects: none.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::arch::Loc;
use crate::diag::{CompileError, CompileResult};
use crate::opcode::{AluOp, CexOp, Expand, LogicOp, Mask, MemOp, MemUnit, MexOp, ShiftOp};

// ── Operands ────────────────────────────────────────────────────────────────

/// A reference to a named value, optionally selecting one lane of a 4-wide
/// result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymRef {
    pub name: String,
    #[serde(default)]
    pub lane: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Imm(u64),
    Sym(SymRef),
}

impl Operand {
    pub fn imm(v: u64) -> Self {
        Operand::Imm(v)
    }

    pub fn sym(name: impl Into<String>) -> Self {
        Operand::Sym(SymRef {
            name: name.into(),
            lane: 0,
        })
    }

    pub fn lane(name: impl Into<String>, lane: u8) -> Self {
        Operand::Sym(SymRef {
            name: name.into(),
            lane,
        })
    }

    pub fn sym_name(&self) -> Option<&str> {
        match self {
            Operand::Sym(s) => Some(&s.name),
            Operand::Imm(_) => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Imm(v) => write!(f, "#{}", v),
            Operand::Sym(s) if s.lane == 0 => write!(f, "{}", s.name),
            Operand::Sym(s) => write!(f, "{}.{}", s.name, s.lane),
        }
    }
}

fn zero() -> Operand {
    Operand::Imm(0)
}

// ── Records ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    While,
    For,
}

/// Loop counter: `dest` starts at `init` and advances by `step` every
/// iteration; the fabric stops when it reaches zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardInsn {
    pub form: LoopKind,
    pub dest: String,
    pub init: Operand,
    pub step: Operand,
}

/// Conditional-select: combines up to four condition codes through a
/// 16-entry truth table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CexInsn {
    #[serde(default = "cexe")]
    pub op: CexOp,
    pub dest: String,
    pub conds: Vec<Operand>,
    pub table: u16,
}

fn cexe() -> CexOp {
    CexOp::Cexe
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExeSrc {
    pub value: Operand,
    #[serde(default)]
    pub exp: Expand,
}

/// Three-stage arithmetic: `op3(op2(op1(srcs), src4), src5)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExeInsn {
    pub op1: AluOp,
    pub dest: String,
    pub srcs: Vec<ExeSrc>,
    #[serde(default = "logic_nop")]
    pub op2: LogicOp,
    #[serde(default)]
    pub src4: Option<Operand>,
    #[serde(default = "shift_nop")]
    pub op3: ShiftOp,
    #[serde(default)]
    pub src5: Option<Operand>,
    #[serde(default)]
    pub init: u8,
}

fn logic_nop() -> LogicOp {
    LogicOp::Nop
}

fn shift_nop() -> ShiftOp {
    ShiftOp::Nop
}

/// Masked address generation: advances the store-unit base (`dest0`) and
/// the load-unit base (`dest1`) by fixed distances, optionally only while
/// a compare between two streams holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MexInsn {
    pub op0: MexOp,
    pub op1: MexOp,
    #[serde(default)]
    pub dest0: Option<String>,
    #[serde(default)]
    pub dest1: Option<String>,
    #[serde(default = "zero")]
    pub base0: Operand,
    #[serde(default = "zero")]
    pub base1: Operand,
    #[serde(default)]
    pub dist0: u32,
    #[serde(default)]
    pub dist1: u32,
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub cmp0: Option<Operand>,
    #[serde(default)]
    pub cmp1: Option<Operand>,
    #[serde(default)]
    pub init0: bool,
    #[serde(default)]
    pub init1: bool,
}

/// One memory access plus the window of main memory it works against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemInsn {
    pub op: MemOp,
    #[serde(default)]
    pub dest: Option<String>,
    #[serde(default)]
    pub src: Option<Operand>,
    #[serde(default)]
    pub cond: Option<Operand>,
    pub base: Operand,
    #[serde(default = "zero")]
    pub offset: Operand,
    #[serde(default)]
    pub mask: Mask,
    /// First byte of the main-memory window.
    pub top: Operand,
    /// Window length in 32-bit words.
    pub len: Operand,
    #[serde(default)]
    pub blk: u8,
    #[serde(default)]
    pub force: bool,
    /// Prefetch / drain partner window.
    #[serde(default)]
    pub ptop: Option<Operand>,
    /// Replica-indexed window (each replica owns a slice).
    #[serde(default)]
    pub cidx: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpKind {
    Guard(GuardInsn),
    Cex(CexInsn),
    Ex4(ExeInsn),
    Exe(ExeInsn),
    Mex(MexInsn),
    Mo4(MemInsn),
    Mop(MemInsn),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MicroOp {
    #[serde(flatten)]
    pub kind: OpKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<Loc>,
}

// ── Program ─────────────────────────────────────────────────────────────────

/// A host-provided symbol: an immediate or a main-memory address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSymbol {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imm: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub symbols: Vec<HostSymbol>,
    pub ops: Vec<MicroOp>,
}

impl Program {
    pub fn from_json(text: &str) -> Result<Program, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Compact JSON used for provenance hashing.
    pub fn canonical_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn host_imm(mut self, name: &str, value: u64) -> Self {
        self.symbols.push(HostSymbol {
            name: name.to_string(),
            imm: Some(value),
            addr: None,
        });
        self
    }

    pub fn host_addr(mut self, name: &str, addr: u64) -> Self {
        self.symbols.push(HostSymbol {
            name: name.to_string(),
            imm: None,
            addr: Some(addr),
        });
        self
    }

    pub fn push(mut self, op: MicroOp) -> Self {
        self.ops.push(op);
        self
    }
}

// ── Operand slots ───────────────────────────────────────────────────────────

/// Position of an operand within its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandSlot {
    /// Arithmetic source 1..=3 (index 0..=2).
    ExeSrc(u8),
    Src4,
    Src5,
    GuardInit,
    GuardStep,
    CexCond(u8),
    MexBase(u8),
    MexCmp(u8),
    MemBase,
    MemOffset,
    MemData,
    MemCond,
    MemTop,
    MemLen,
    MemPtop,
}

/// What a record produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProducerKind {
    Host,
    Guard,
    Cex,
    Exe,
    Ex4,
    Mex,
    Load,
}

impl ProducerKind {
    /// Result occupies four lanes.
    pub fn is_wide(self) -> bool {
        matches!(self, ProducerKind::Ex4)
    }
}

/// Which single-occupancy slot of a cell a record claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    Exe,
    Cex,
    Mex,
    Mem(MemUnit),
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotKind::Exe => f.write_str("arithmetic"),
            SlotKind::Cex => f.write_str("conditional"),
            SlotKind::Mex => f.write_str("address-generation"),
            SlotKind::Mem(MemUnit::Store) => f.write_str("store-class memory"),
            SlotKind::Mem(MemUnit::Load) => f.write_str("load-class memory"),
        }
    }
}

impl MicroOp {
    pub fn new(kind: OpKind) -> Self {
        MicroOp { kind, at: None }
    }

    /// Pin the record to an explicit location.
    pub fn at(mut self, row: u8, col: u8) -> Self {
        self.at = Some(Loc::new(row, col));
        self
    }

    pub fn exe(op1: AluOp, dest: &str, srcs: &[Operand]) -> Self {
        MicroOp::new(OpKind::Exe(ExeInsn::new(op1, dest, srcs)))
    }

    pub fn ex4(op1: AluOp, dest: &str, srcs: &[Operand]) -> Self {
        MicroOp::new(OpKind::Ex4(ExeInsn::new(op1, dest, srcs)))
    }

    pub fn load(op: MemOp, dest: &str, base: Operand, top: Operand, len: u64) -> Self {
        let insn = MemInsn::new(op, base, top, len).with_dest(dest);
        if op.is_wide() {
            MicroOp::new(OpKind::Mo4(insn))
        } else {
            MicroOp::new(OpKind::Mop(insn))
        }
    }

    pub fn store(op: MemOp, src: Operand, base: Operand, top: Operand, len: u64) -> Self {
        let insn = MemInsn::new(op, base, top, len).with_src(src);
        if op.is_wide() {
            MicroOp::new(OpKind::Mo4(insn))
        } else {
            MicroOp::new(OpKind::Mop(insn))
        }
    }

    pub fn slot_kind(&self) -> SlotKind {
        match &self.kind {
            OpKind::Guard(_) | OpKind::Ex4(_) | OpKind::Exe(_) => SlotKind::Exe,
            OpKind::Cex(_) => SlotKind::Cex,
            OpKind::Mex(_) => SlotKind::Mex,
            OpKind::Mo4(m) | OpKind::Mop(m) => SlotKind::Mem(m.op.unit()),
        }
    }

    pub fn mem(&self) -> Option<&MemInsn> {
        match &self.kind {
            OpKind::Mo4(m) | OpKind::Mop(m) => Some(m),
            _ => None,
        }
    }

    pub fn exe_insn(&self) -> Option<&ExeInsn> {
        match &self.kind {
            OpKind::Ex4(e) | OpKind::Exe(e) => Some(e),
            _ => None,
        }
    }

    /// Destination symbols with their producer kind.
    pub fn dests(&self) -> Vec<(&str, ProducerKind)> {
        match &self.kind {
            OpKind::Guard(g) => vec![(g.dest.as_str(), ProducerKind::Guard)],
            OpKind::Cex(c) => vec![(c.dest.as_str(), ProducerKind::Cex)],
            OpKind::Ex4(e) => vec![(e.dest.as_str(), ProducerKind::Ex4)],
            OpKind::Exe(e) => vec![(e.dest.as_str(), ProducerKind::Exe)],
            OpKind::Mex(m) => m
                .dest0
                .iter()
                .chain(m.dest1.iter())
                .map(|d| (d.as_str(), ProducerKind::Mex))
                .collect(),
            OpKind::Mo4(m) | OpKind::Mop(m) => m
                .dest
                .iter()
                .map(|d| (d.as_str(), ProducerKind::Load))
                .collect(),
        }
    }

    /// Every operand of the record, tagged with its slot.
    pub fn operands(&self) -> Vec<(OperandSlot, &Operand)> {
        let mut out = Vec::new();
        match &self.kind {
            OpKind::Guard(g) => {
                out.push((OperandSlot::GuardInit, &g.init));
                out.push((OperandSlot::GuardStep, &g.step));
            }
            OpKind::Cex(c) => {
                for (i, cond) in c.conds.iter().enumerate() {
                    out.push((OperandSlot::CexCond(i as u8), cond));
                }
            }
            OpKind::Ex4(e) | OpKind::Exe(e) => {
                for (i, s) in e.srcs.iter().enumerate() {
                    out.push((OperandSlot::ExeSrc(i as u8), &s.value));
                }
                if let Some(s4) = &e.src4 {
                    out.push((OperandSlot::Src4, s4));
                }
                if let Some(s5) = &e.src5 {
                    out.push((OperandSlot::Src5, s5));
                }
            }
            OpKind::Mex(m) => {
                out.push((OperandSlot::MexBase(0), &m.base0));
                out.push((OperandSlot::MexBase(1), &m.base1));
                if let Some(c) = &m.cmp0 {
                    out.push((OperandSlot::MexCmp(0), c));
                }
                if let Some(c) = &m.cmp1 {
                    out.push((OperandSlot::MexCmp(1), c));
                }
            }
            OpKind::Mo4(m) | OpKind::Mop(m) => {
                out.push((OperandSlot::MemBase, &m.base));
                out.push((OperandSlot::MemOffset, &m.offset));
                if let Some(s) = &m.src {
                    out.push((OperandSlot::MemData, s));
                }
                if let Some(c) = &m.cond {
                    out.push((OperandSlot::MemCond, c));
                }
                out.push((OperandSlot::MemTop, &m.top));
                out.push((OperandSlot::MemLen, &m.len));
                if let Some(p) = &m.ptop {
                    out.push((OperandSlot::MemPtop, p));
                }
            }
        }
        out
    }

    /// Short human label used in diagnostics.
    pub fn label(&self) -> String {
        match self.dests().first() {
            Some((d, _)) => d.to_string(),
            None => match &self.kind {
                OpKind::Mo4(m) | OpKind::Mop(m) => format!("{} {}", m.op, m.top),
                _ => "mex".to_string(),
            },
        }
    }

    /// Reject records whose shape the fabric cannot encode.
    pub fn validate(&self) -> CompileResult<()> {
        let label = self.label();
        let bad = |msg: String| Err(CompileError::malformed(msg).with_symbol(label.clone()));
        match &self.kind {
            OpKind::Guard(_) => {}
            OpKind::Cex(c) => {
                if c.conds.is_empty() || c.conds.len() > 4 {
                    return bad(format!(
                        "conditional-select takes 1 to 4 conditions, got {}",
                        c.conds.len()
                    ));
                }
            }
            OpKind::Ex4(e) | OpKind::Exe(e) => {
                if e.srcs.is_empty() || e.srcs.len() > 3 {
                    return bad(format!("arithmetic takes 1 to 3 sources, got {}", e.srcs.len()));
                }
                if e.init > 3 {
                    return bad(format!("init selector {} out of range", e.init));
                }
                if matches!(e.op1, AluOp::While | AluOp::For) {
                    return bad("loop opcodes belong to guard records".to_string());
                }
                if matches!(self.kind, OpKind::Ex4(_))
                    && (e.op2 != LogicOp::Nop || e.op3 != ShiftOp::Nop)
                {
                    return bad("4-wide arithmetic has no second or third stage".to_string());
                }
                if let Some(Operand::Sym(s4)) = &e.src4 {
                    let aliases = e.srcs.iter().skip(1).any(|s| match &s.value {
                        Operand::Sym(r) => r == s4,
                        Operand::Imm(_) => false,
                    });
                    if !aliases {
                        return bad("op2 operand must be an immediate or source 2/3".to_string());
                    }
                }
                if let Some(Operand::Sym(s5)) = &e.src5 {
                    let aliases = matches!(e.srcs.get(2), Some(ExeSrc { value: Operand::Sym(r), .. }) if r == s5);
                    if !aliases {
                        return bad("op3 operand must be an immediate or source 3".to_string());
                    }
                }
            }
            OpKind::Mex(m) => {
                if encode_mex_dist(m.dist0).is_none() || encode_mex_dist(m.dist1).is_none() {
                    return bad(format!(
                        "address step {}/{} not in {{0,1,2,4,8,16,32,64}}",
                        m.dist0, m.dist1
                    ));
                }
                if encode_mex_limit(m.limit).is_none() {
                    return bad(format!("address limit {} not a power of two in 8..=32768", m.limit));
                }
            }
            OpKind::Mo4(m) | OpKind::Mop(m) => {
                let wide = matches!(self.kind, OpKind::Mo4(_));
                if wide != m.op.is_wide() {
                    return bad(format!(
                        "{} is {}-wide but recorded as {}",
                        m.op,
                        if m.op.is_wide() { 4 } else { 1 },
                        if wide { "mo4" } else { "mop" }
                    ));
                }
                if m.op.produces_value() && m.dest.is_none() {
                    return bad(format!("{} needs a destination", m.op));
                }
                if !m.op.produces_value() && m.dest.is_some() {
                    return bad(format!("{} produces no value", m.op));
                }
                if m.op.consumes_value() && m.src.is_none() {
                    return bad(format!("{} needs a source value", m.op));
                }
                if m.blk > 3 {
                    return bad(format!("block class {} out of range", m.blk));
                }
            }
        }
        Ok(())
    }
}

impl ExeInsn {
    pub fn new(op1: AluOp, dest: &str, srcs: &[Operand]) -> Self {
        ExeInsn {
            op1,
            dest: dest.to_string(),
            srcs: srcs
                .iter()
                .map(|v| ExeSrc {
                    value: v.clone(),
                    exp: Expand::H3210,
                })
                .collect(),
            op2: LogicOp::Nop,
            src4: None,
            op3: ShiftOp::Nop,
            src5: None,
            init: 0,
        }
    }
}

impl MemInsn {
    pub fn new(op: MemOp, base: Operand, top: Operand, len: u64) -> Self {
        MemInsn {
            op,
            dest: None,
            src: None,
            cond: None,
            base,
            offset: Operand::Imm(0),
            mask: Mask::D0,
            top,
            len: Operand::Imm(len),
            blk: 0,
            force: false,
            ptop: None,
            cidx: false,
        }
    }

    pub fn with_dest(mut self, dest: &str) -> Self {
        self.dest = Some(dest.to_string());
        self
    }

    pub fn with_src(mut self, src: Operand) -> Self {
        self.src = Some(src);
        self
    }
}

/// 3-bit step code: 0, 1, 2, 4, ... 64 bytes.
pub fn encode_mex_dist(bytes: u32) -> Option<u8> {
    match bytes {
        0 => Some(0),
        1 | 2 | 4 | 8 | 16 | 32 | 64 => Some(bytes.trailing_zeros() as u8 + 1),
        _ => None,
    }
}

/// 4-bit limit code: 0 (none), 8, 16, ... 32768.
pub fn encode_mex_limit(limit: u32) -> Option<u8> {
    match limit {
        0 => Some(0),
        l if l.is_power_of_two() && (8..=32768).contains(&l) => Some(l.trailing_zeros() as u8 - 2),
        _ => None,
    }
}
