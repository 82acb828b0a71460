// opcode.rs — Fixed fabric encodings
//
// Numeric opcode, expansion and mask codes understood directly by the
// fabric's decoders. Values are part of the hardware interface and must not
// change.
//
// Preconditions: none (types only).
// Postconditions: none.
// Failure modes: none.
// Side effects: none.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! encoding {
    (
        $(#[$meta:meta])*
        $name:ident { $($variant:ident = $code:literal => $mnemonic:literal,)+ }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $mnemonic)] $variant,)+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant,)+];

            pub fn code(self) -> u8 {
                match self {
                    $($name::$variant => $code,)+
                }
            }

            pub fn from_code(code: u8) -> Option<Self> {
                match code {
                    $($code => Some($name::$variant),)+
                    _ => None,
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $($name::$variant => $mnemonic,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.mnemonic())
            }
        }
    };
}

// ── Arithmetic unit ─────────────────────────────────────────────────────────

encoding! {
    /// First-stage arithmetic operation (6-bit field).
    AluOp {
        Nop = 0x00 => "NOP",
        While = 0x01 => "WHILE",
        For = 0x02 => "FOR",
        Cvt53 = 0x06 => "CVT53",
        Sml8 = 0x07 => "SML8",
        Sfma = 0x08 => "SFMA",
        Cfma = 0x0a => "CFMA",
        Fma = 0x10 => "FMA",
        Fms = 0x11 => "FMS",
        Fml = 0x12 => "FML",
        Fad = 0x13 => "FAD",
        Fml3 = 0x14 => "FML3",
        Add3 = 0x15 => "ADD3",
        Sub3 = 0x16 => "SUB3",
        Add = 0x17 => "ADD",
        Sub = 0x18 => "SUB",
        CmpEq = 0x19 => "CMP_EQ",
        CmpNe = 0x1a => "CMP_NE",
        CmpLt = 0x1b => "CMP_LT",
        CmpLe = 0x1c => "CMP_LE",
        CmpGt = 0x1d => "CMP_GT",
        CmpGe = 0x1e => "CMP_GE",
        Cmov = 0x1f => "CMOV",
        Mauh3 = 0x20 => "MAUH3",
        Mauh = 0x21 => "MAUH",
        Msuh3 = 0x22 => "MSUH3",
        Msuh = 0x23 => "MSUH",
        Mluh = 0x24 => "MLUH",
        Mmrg = 0x25 => "MMRG",
        Mssad = 0x26 => "MSSAD",
        Msad = 0x27 => "MSAD",
        Minl3 = 0x28 => "MINL3",
        Minl = 0x29 => "MINL",
        Mh2bw = 0x2a => "MH2BW",
        Mcas = 0x2b => "MCAS",
        Mmid3 = 0x2c => "MMID3",
        Mmax3 = 0x2d => "MMAX3",
        Mmin3 = 0x2e => "MMIN3",
        Mmax = 0x2f => "MMAX",
        Mmin = 0x30 => "MMIN",
        Maj = 0x31 => "MAJ",
        Ch = 0x32 => "CH",
    }
}

encoding! {
    /// Second-stage logical operation (3-bit field).
    LogicOp {
        Nop = 0 => "NOP",
        And = 1 => "AND",
        Or = 2 => "OR",
        Xor = 3 => "XOR",
        Sumhh = 4 => "SUMHH",
        Sumhl = 5 => "SUMHL",
        Ad24 = 6 => "AD24",
        Rots = 7 => "ROTS",
    }
}

encoding! {
    /// Third-stage shift operation (3-bit field).
    ShiftOp {
        Nop = 0 => "NOP",
        Sll = 1 => "SLL",
        Srl = 2 => "SRL",
        Sraa = 3 => "SRAA",
        Srab = 4 => "SRAB",
        Srlm = 7 => "SRLM",
    }
}

encoding! {
    /// Input lane expansion applied before the arithmetic stage.
    Expand {
        H3210 = 0 => "H3210",
        H1010 = 1 => "H1010",
        H3232 = 2 => "H3232",
        B5410 = 3 => "B5410",
        B7632 = 4 => "B7632",
    }
}

impl Default for Expand {
    fn default() -> Self {
        Expand::H3210
    }
}

// ── Conditional and address-generation units ───────────────────────────────

encoding! {
    /// Conditional-select unit operation.
    CexOp {
        Nop = 0 => "NOP",
        Cexe = 1 => "CEXE",
    }
}

encoding! {
    /// Masked address-generation advance rule (2-bit field).
    MexOp {
        Nop = 0 => "NOP",
        Always = 1 => "ALWAYS",
        CmpaLe = 2 => "CMPA_LE",
        CmpaGe = 3 => "CMPA_GE",
    }
}

// ── Memory unit ─────────────────────────────────────────────────────────────

encoding! {
    /// Memory operation (5-bit field). Bit 4 selects the store-class unit.
    MemOp {
        Ldr = 0x01 => "LDR",
        Ldwr = 0x02 => "LDWR",
        Ldbr = 0x04 => "LDBR",
        Ldrq = 0x08 => "LDRQ",
        ImBufrd = 0x0e => "IM_BUFRD",
        ImDrain = 0x0f => "IM_DRAIN",
        Str = 0x11 => "STR",
        Stwr = 0x12 => "STWR",
        Stbr = 0x14 => "STBR",
        Strq = 0x18 => "STRQ",
        Lddmq = 0x19 => "LDDMQ",
        Tr = 0x1a => "TR",
        ImBufwr = 0x1e => "IM_BUFWR",
        ImPref = 0x1f => "IM_PREF",
    }
}

/// Which of a cell's two memory units an operation occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemUnit {
    /// EAG0, opcodes with bit 4 set.
    Store,
    /// EAG1.
    Load,
}

impl MemUnit {
    pub fn index(self) -> usize {
        match self {
            MemUnit::Store => 0,
            MemUnit::Load => 1,
        }
    }
}

impl MemOp {
    pub fn unit(self) -> MemUnit {
        if self.code() & 0x10 != 0 {
            MemUnit::Store
        } else {
            MemUnit::Load
        }
    }

    /// Moves all four lanes at once.
    pub fn is_wide(self) -> bool {
        matches!(
            self,
            MemOp::Ldrq
                | MemOp::Strq
                | MemOp::Lddmq
                | MemOp::Tr
                | MemOp::ImBufrd
                | MemOp::ImBufwr
                | MemOp::ImPref
                | MemOp::ImDrain
        )
    }

    /// Bypasses the local memory and talks to main memory directly.
    pub fn is_direct(self) -> bool {
        matches!(self, MemOp::Lddmq | MemOp::Tr)
    }

    /// Result lands in the cell's boundary registers.
    pub fn produces_value(self) -> bool {
        matches!(
            self,
            MemOp::Ldr | MemOp::Ldwr | MemOp::Ldbr | MemOp::Ldrq | MemOp::Lddmq | MemOp::ImBufrd
        )
    }

    /// Consumes store data through the write lanes.
    pub fn consumes_value(self) -> bool {
        matches!(
            self,
            MemOp::Str | MemOp::Stwr | MemOp::Stbr | MemOp::Strq | MemOp::Tr | MemOp::ImBufwr
        )
    }

    /// Prefetch / drain traffic driven through the transfer registers.
    pub fn reserves_transfer(self) -> bool {
        matches!(
            self,
            MemOp::ImPref | MemOp::ImDrain | MemOp::ImBufrd | MemOp::ImBufwr
        )
    }

    /// Produces main-memory traffic and therefore an LMM descriptor.
    pub fn needs_window(self) -> bool {
        !matches!(self, MemOp::ImBufrd | MemOp::ImBufwr)
    }

    /// Window is written back to main memory.
    pub fn writes_memory(self) -> bool {
        matches!(
            self,
            MemOp::Str | MemOp::Stwr | MemOp::Stbr | MemOp::Strq | MemOp::Tr | MemOp::ImDrain
        )
    }
}

encoding! {
    /// Byte/half/word/double lane mask for memory accesses.
    Mask {
        B0 = 0 => "B0",
        B1 = 1 => "B1",
        B2 = 2 => "B2",
        B3 = 3 => "B3",
        B4 = 4 => "B4",
        B5 = 5 => "B5",
        B6 = 6 => "B6",
        B7 = 7 => "B7",
        H0 = 8 => "H0",
        H1 = 9 => "H1",
        H2 = 10 => "H2",
        H3 = 11 => "H3",
        W0 = 12 => "W0",
        W1 = 13 => "W1",
        D0 = 14 => "D0",
    }
}

impl Default for Mask {
    fn default() -> Self {
        Mask::D0
    }
}
