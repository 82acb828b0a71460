// conf.rs — Configuration-word wire format
//
// Structured models of the per-cell control words the fabric decodes
// directly, with explicit LSB-first packers. Field order and widths are
// fixed by the hardware; nothing here relies on in-memory layout.
//
// Preconditions: field values come from the emitter.
// Postconditions: `pack` produces words whose fields read back unchanged.
// Failure modes: Internal when a value does not fit its field.
// Side effects: none.

use serde::Serialize;

use crate::diag::{CompileError, CompileResult};

/// Accumulates fields into one 64-bit word, low bits first.
struct Packer {
    word: &'static str,
    bits: u64,
    pos: u32,
}

impl Packer {
    fn new(word: &'static str) -> Self {
        Packer { word, bits: 0, pos: 0 }
    }

    fn put(&mut self, field: &str, value: u64, width: u32) -> CompileResult<&mut Self> {
        if width < 64 && value >> width != 0 {
            return Err(CompileError::internal(format!(
                "{}.{} = {:#x} does not fit {} bits",
                self.word, field, value, width
            )));
        }
        if self.pos + width > 64 {
            return Err(CompileError::internal(format!("{} overflows 64 bits at {}", self.word, field)));
        }
        self.bits |= value << self.pos;
        self.pos += width;
        Ok(self)
    }

    fn flag(&mut self, field: &str, value: bool) -> CompileResult<&mut Self> {
        self.put(field, value as u64, 1)
    }

    fn finish(&self) -> u64 {
        self.bits
    }
}

/// Read `width` bits at `pos` of `word`.
pub fn field(word: u64, pos: u32, width: u32) -> u64 {
    if width >= 64 {
        word >> pos
    } else {
        (word >> pos) & ((1u64 << width) - 1)
    }
}

// ── cdw0: arithmetic inputs ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Cdw0 {
    pub v: bool,
    pub op1: u8,
    pub op2: u8,
    pub op3: u8,
    pub ex1brs: u8,
    /// 0: `ex1brs`, 1: own result (self-loop).
    pub ex1s: bool,
    pub ex1exp: u8,
    pub ex2brs: u8,
    pub ex2exp: u8,
    pub ex3brs: u8,
    pub ex3exp: u8,
    /// 0: `e2imm`, 1: input 2, 2: input 3.
    pub e2is: u8,
    pub e3imm: u8,
    /// 0: `e3imm`, 1: input 3.
    pub e3is: bool,
    pub init: u8,
    pub fold: bool,
    pub mex0op: u8,
    pub mex0init: bool,
    pub mex0dist: u8,
    pub mex1op: u8,
    pub mex1init: bool,
    pub mex1dist: u8,
    pub mexlimit: u8,
}

impl Cdw0 {
    pub fn pack(&self) -> CompileResult<u64> {
        let mut p = Packer::new("cdw0");
        p.flag("v", self.v)?
            .put("op1", self.op1 as u64, 6)?
            .put("op2", self.op2 as u64, 3)?
            .put("op3", self.op3 as u64, 3)?
            .put("ex1brs", self.ex1brs as u64, 4)?
            .flag("ex1s", self.ex1s)?
            .put("ex1exp", self.ex1exp as u64, 3)?
            .put("ex2brs", self.ex2brs as u64, 4)?
            .put("ex2exp", self.ex2exp as u64, 3)?
            .put("ex3brs", self.ex3brs as u64, 4)?
            .put("ex3exp", self.ex3exp as u64, 3)?
            .put("e2is", self.e2is as u64, 2)?
            .put("e3imm", self.e3imm as u64, 6)?
            .flag("e3is", self.e3is)?
            .put("init", self.init as u64, 2)?
            .flag("fold", self.fold)?
            .put("mex0op", self.mex0op as u64, 2)?
            .flag("mex0init", self.mex0init)?
            .put("mex0dist", self.mex0dist as u64, 3)?
            .put("mex1op", self.mex1op as u64, 2)?
            .flag("mex1init", self.mex1init)?
            .put("mex1dist", self.mex1dist as u64, 3)?
            .put("mexlimit", self.mexlimit as u64, 4)?;
        Ok(p.finish())
    }
}

// ── cdw1: conditional and address-generator inputs ──────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Cdw1 {
    pub cs: [u8; 4],
    /// Truth table over c3..c0; 0xffff when no conditional is mapped.
    pub cex_tab: u16,
    pub ea0op: u8,
    pub ea0bs: u8,
    pub ea0os: u8,
    pub ea0msk: u8,
    pub ea1op: u8,
    pub ea1bs: u8,
    pub ea1os: u8,
    pub ea1msk: u8,
    pub eabbrs: u8,
    pub eaobrs: u8,
}

impl Default for Cdw1 {
    fn default() -> Self {
        Cdw1 {
            cs: [0; 4],
            cex_tab: 0xffff,
            ea0op: 0,
            ea0bs: 0,
            ea0os: 0,
            ea0msk: 0,
            ea1op: 0,
            ea1bs: 0,
            ea1os: 0,
            ea1msk: 0,
            eabbrs: 0,
            eaobrs: 0,
        }
    }
}

impl Cdw1 {
    pub fn pack(&self) -> CompileResult<u64> {
        let mut p = Packer::new("cdw1");
        for (i, cs) in self.cs.iter().enumerate() {
            p.put(["cs0", "cs1", "cs2", "cs3"][i], *cs as u64, 4)?;
        }
        p.put("cex_tab", self.cex_tab as u64, 16)?
            .put("ea0op", self.ea0op as u64, 5)?
            .put("ea0bs", self.ea0bs as u64, 2)?
            .put("ea0os", self.ea0os as u64, 1)?
            .put("ea0msk", self.ea0msk as u64, 4)?
            .put("ea1op", self.ea1op as u64, 5)?
            .put("ea1bs", self.ea1bs as u64, 2)?
            .put("ea1os", self.ea1os as u64, 1)?
            .put("ea1msk", self.ea1msk as u64, 4)?
            .put("eabbrs", self.eabbrs as u64, 4)?
            .put("eaobrs", self.eaobrs as u64, 4)?;
        Ok(p.finish())
    }
}

// ── cdw2: transfer, write-lane and boundary-register inputs ─────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Cdw2 {
    pub ts: [u8; 4],
    pub trs: [u8; 4],
    /// 0: DMA write address, 1: store-unit address.
    pub mwsa: bool,
    pub mws: [u8; 4],
    pub brs: [u8; 4],
    pub mapdist: u8,
    pub lmm_mode: u8,
    /// Main memory fills local memory (lmr, lmf, lmp, lmx).
    pub lmm_axiw: bool,
    /// Local memory drains to main memory (lmw, lmd, lmx).
    pub lmm_axir: bool,
}

impl Cdw2 {
    pub fn pack(&self) -> CompileResult<u64> {
        let mut p = Packer::new("cdw2");
        for (i, v) in self.ts.iter().enumerate() {
            p.put(["ts0", "ts1", "ts2", "ts3"][i], *v as u64, 4)?;
        }
        for (i, v) in self.trs.iter().enumerate() {
            p.put(["trs0", "trs1", "trs2", "trs3"][i], *v as u64, 2)?;
        }
        p.flag("mwsa", self.mwsa)?;
        for (i, v) in self.mws.iter().enumerate() {
            p.put(["mws0", "mws1", "mws2", "mws3"][i], *v as u64, 2)?;
        }
        for (i, v) in self.brs.iter().enumerate() {
            p.put(["brs0", "brs1", "brs2", "brs3"][i], *v as u64, 2)?;
        }
        p.put("mapdist", self.mapdist as u64, 6)?
            .put("lmm_mode", self.lmm_mode as u64, 2)?
            .flag("lmm_axiw", self.lmm_axiw)?
            .flag("lmm_axir", self.lmm_axir)?;
        Ok(p.finish())
    }
}

/// The four control words of one cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfWord {
    pub cdw0: Cdw0,
    pub cdw1: Cdw1,
    pub cdw2: Cdw2,
    /// Second-stage immediate.
    pub cdw3: u64,
}

impl ConfWord {
    pub fn pack(&self) -> CompileResult<[u64; 4]> {
        Ok([self.cdw0.pack()?, self.cdw1.pack()?, self.cdw2.pack()?, self.cdw3])
    }
}

// ── Local-memory info ───────────────────────────────────────────────────────

/// Host-side descriptor mirror of one cell (two words on the wire).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub struct LmmiWord {
    pub v: bool,
    /// 0: load (memory to LMM), 1: store (LMM to memory).
    pub rw: bool,
    pub f: bool,
    pub p: bool,
    pub bcas: u8,
    pub hcopy: bool,
    pub vcopy: bool,
    pub blk: u8,
    pub cidx: bool,
    /// Window length in words; the wire field holds `len - 1`.
    pub len: u32,
    pub ofs: i32,
    pub top: u64,
}

impl LmmiWord {
    pub fn pack(&self) -> CompileResult<[u64; 2]> {
        let len = if self.v { self.len.saturating_sub(1) } else { 0 };
        let mut p = Packer::new("lmmi");
        p.flag("v", self.v)?
            .flag("rw", self.rw)?
            .flag("f", self.f)?
            .flag("p", self.p)?
            .put("bcas", self.bcas as u64, 4)?
            .flag("hcopy", self.hcopy)?
            .flag("vcopy", self.vcopy)?
            .put("blk", self.blk as u64, 2)?
            .flag("cidx", self.cidx)?
            .put("len", len as u64, 19)?
            .put("ofs", self.ofs as u32 as u64, 32)?;
        Ok([p.finish(), self.top])
    }

    pub fn unpack(words: [u64; 2]) -> Self {
        let w = words[0];
        let v = field(w, 0, 1) != 0;
        LmmiWord {
            v,
            rw: field(w, 1, 1) != 0,
            f: field(w, 2, 1) != 0,
            p: field(w, 3, 1) != 0,
            bcas: field(w, 4, 4) as u8,
            hcopy: field(w, 8, 1) != 0,
            vcopy: field(w, 9, 1) != 0,
            blk: field(w, 10, 2) as u8,
            cidx: field(w, 12, 1) != 0,
            len: if v { field(w, 13, 19) as u32 + 1 } else { 0 },
            ofs: field(w, 32, 32) as u32 as i32,
            top: words[1],
        }
    }

    /// Status nibble v, rw, f, p (MSB first).
    pub fn status(&self) -> u8 {
        (self.v as u8) << 3 | (self.rw as u8) << 2 | (self.f as u8) << 1 | self.p as u8
    }

    /// First byte past the window.
    pub fn end(&self) -> u64 {
        self.top.wrapping_add(self.len as u64 * 4)
    }
}

/// Little-endian byte image of a word sequence.
pub fn to_le_bytes(words: &[u64]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::ErrorKind;

    #[test]
    fn cdw0_fields_land_lsb_first() {
        let c = Cdw0 {
            v: true,
            op1: 0x17,
            ex1brs: 5,
            mexlimit: 13,
            ..Cdw0::default()
        };
        let w = c.pack().unwrap();
        assert_eq!(field(w, 0, 1), 1);
        assert_eq!(field(w, 1, 6), 0x17);
        assert_eq!(field(w, 13, 4), 5);
        assert_eq!(field(w, 59, 4), 13);
        assert_eq!(field(w, 63, 1), 0);
    }

    #[test]
    fn empty_cdw1_always_executes() {
        assert_eq!(Cdw1::default().pack().unwrap(), 0xffff << 16);
    }

    #[test]
    fn cdw2_mode_bits_sit_above_selects() {
        let c = Cdw2 {
            brs: [1, 0, 3, 0],
            mapdist: 2,
            lmm_mode: 3,
            lmm_axiw: true,
            ..Cdw2::default()
        };
        let w = c.pack().unwrap();
        assert_eq!(field(w, 33, 2), 1);
        assert_eq!(field(w, 37, 2), 3);
        assert_eq!(field(w, 41, 6), 2);
        assert_eq!(field(w, 47, 2), 3);
        assert_eq!(field(w, 49, 1), 1);
        assert_eq!(field(w, 50, 1), 0);
    }

    #[test]
    fn oversized_field_is_internal_error() {
        let c = Cdw0 {
            op1: 64,
            ..Cdw0::default()
        };
        let err = c.pack().unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
        assert!(err.message.contains("cdw0.op1"));
    }

    #[test]
    fn lmmi_stores_length_minus_one() {
        let l = LmmiWord {
            v: true,
            f: true,
            len: 64,
            ofs: -256,
            top: 0x1000,
            ..LmmiWord::default()
        };
        let words = l.pack().unwrap();
        assert_eq!(field(words[0], 13, 19), 63);
        assert_eq!(words[1], 0x1000);
        assert_eq!(LmmiWord::unpack(words), l);
        assert_eq!(l.status(), 0b1010);
        assert_eq!(l.end(), 0x1100);
    }

    #[test]
    fn bytes_are_little_endian() {
        assert_eq!(to_le_bytes(&[0x0102]), vec![2, 1, 0, 0, 0, 0, 0, 0]);
    }
}
