// runtime — Host side of the fabric: register access, coherency, dispatch
//
// `mmio` fixes the byte layout of the control registers and DMA engine,
// `sim` is an in-memory port for tests, `coherency` decides which local
// memory windows move per dispatch phase, and `lane` drives one lane's
// replicas through a full dispatch.

pub mod coherency;
pub mod lane;
pub mod mmio;
pub mod sim;

use thiserror::Error;

use crate::arch::{GridDepth, MAX_REPLICAS};

pub use coherency::{CoherencyState, Direction, Phase, Plan, Transfer, Writeback};
pub use lane::{Dispatch, DispatchReport, Lane};
pub use mmio::{AddressMap, HardwarePort};
pub use sim::SimPort;

/// Default coalescing limit in 32-bit words.
pub const COALESCE_WORDS: u32 = 8192;

// ── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("kernel compiled for depth {compiled} but the fabric reports depth {live}")]
    DepthMismatch { compiled: GridDepth, live: u32 },

    #[error("two drains write overlapping memory [{first:#x}, {first_end:#x}) and [{second:#x}, {second_end:#x})")]
    DoubleWrite {
        first: u64,
        first_end: u64,
        second: u64,
        second_end: u64,
    },

    #[error("window at {top:#x} ({bytes} bytes) of replica {replica} cell [{row}][{col}] runs past the address space")]
    WindowOverflow {
        replica: usize,
        row: usize,
        col: usize,
        top: u64,
        bytes: u64,
    },

    #[error("DMA fault: mm2s status {mm2s:#010x}, s2mm status {s2mm:#010x}")]
    DmaFault { mm2s: u32, s2mm: u32 },

    #[error("{what} did not complete after {polls} polls")]
    Timeout { what: &'static str, polls: u64 },

    #[error("phase {requested:?} cannot follow {current:?}")]
    PhaseOrder { current: Phase, requested: Phase },

    #[error("replica {replica} out of range (lane has {replicas})")]
    ReplicaOutOfRange { replica: usize, replicas: usize },

    #[error("unsupported: {0}")]
    Unsupported(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

// ── Configuration ──────────────────────────────────────────────────────────

/// Per-lane runtime knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Chained fabric instances sharing this lane's bus.
    pub replicas: usize,
    /// Give up busy-waiting after this many polls. `None` waits forever.
    pub poll_limit: Option<u64>,
    /// Largest coalesced transfer, in 32-bit words.
    pub coalesce_words: u32,
    pub addr_map: AddressMap,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            replicas: 1,
            poll_limit: None,
            coalesce_words: COALESCE_WORDS,
            addr_map: AddressMap::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn validate(&self) -> RuntimeResult<()> {
        if self.replicas == 0 || self.replicas > MAX_REPLICAS {
            return Err(RuntimeError::ReplicaOutOfRange {
                replica: self.replicas,
                replicas: MAX_REPLICAS,
            });
        }
        if self.coalesce_words == 0 {
            return Err(RuntimeError::Unsupported(
                "coalescing limit must be at least one word".into(),
            ));
        }
        Ok(())
    }
}
