// pipeline.rs — Compile options, pass orchestration and provenance
//
// Owns one `CompilationContext` and runs the minimal set of passes for a
// given terminal PassId, timing each one. `compile` runs everything and
// packages the result as a `CompiledKernel`.
//
// Preconditions: options pass `CompileOptions::validate`.
// Postconditions: artifacts for all passes in `required_passes(terminal)`
//                 are populated, or the first error is returned.
// Failure modes: any pass error; there is no partial result.
// Side effects: per-pass timing logged at DEBUG.

use std::fmt::Write as _;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::arch::{GridDepth, Loc, LMM_BYTES, MAX_MAPDIST};
use crate::diag::{CompileError, CompileResult};
use crate::emit::{self, Emitted};
use crate::grid::{CompilationContext, Grid, Placement, RouteStats};
use crate::lmm::{self, LmmTable};
use crate::microop::Program;
use crate::pass::{descriptor, required_passes, PassId};
use crate::{place, route};

// ── Options ────────────────────────────────────────────────────────────────

/// Per-compilation knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    pub depth: GridDepth,
    /// Row distance between a memory record and its prefetch/drain partner.
    pub mapdist: u8,
    /// Local-memory bytes per cell.
    pub lmm_bytes: u32,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            depth: GridDepth::D64,
            mapdist: 0,
            lmm_bytes: LMM_BYTES,
        }
    }
}

impl CompileOptions {
    pub fn validate(&self) -> CompileResult<()> {
        if self.mapdist > MAX_MAPDIST {
            return Err(CompileError::malformed(format!(
                "mapdist {} exceeds {}",
                self.mapdist, MAX_MAPDIST
            )));
        }
        if self.mapdist as usize >= self.depth.rows() {
            return Err(CompileError::malformed(format!(
                "mapdist {} must be smaller than the grid depth {}",
                self.mapdist, self.depth
            )));
        }
        if self.lmm_bytes == 0 {
            return Err(CompileError::malformed("local memory size must be non-zero"));
        }
        Ok(())
    }
}

// ── Provenance ─────────────────────────────────────────────────────────────

/// Provenance metadata for reproducible builds and configuration reuse.
///
/// `program_hash`: SHA-256 of `Program::canonical_json()`.
/// `conf_fingerprint`: SHA-256 of the emitted configuration bytes.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub program_hash: [u8; 32],
    pub conf_fingerprint: [u8; 32],
    pub options: CompileOptions,
    pub compiler_version: &'static str,
}

impl Provenance {
    pub fn program_hash_hex(&self) -> String {
        bytes_to_hex(&self.program_hash)
    }

    pub fn conf_fingerprint_hex(&self) -> String {
        bytes_to_hex(&self.conf_fingerprint)
    }

    /// Serialize provenance as a JSON string for `--emit build-info`.
    pub fn to_json(&self) -> String {
        format!(
            "{{\n  \"program_hash\": \"{}\",\n  \"conf_fingerprint\": \"{}\",\n  \"depth\": {},\n  \"mapdist\": {},\n  \"lmm_bytes\": {},\n  \"manifest_schema_version\": 1,\n  \"compiler_version\": \"{}\"\n}}\n",
            self.program_hash_hex(),
            self.conf_fingerprint_hex(),
            self.options.depth,
            self.options.mapdist,
            self.options.lmm_bytes,
            self.compiler_version,
        )
    }
}

pub fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

/// Compute provenance from the input program and the emitted words.
pub fn compute_provenance(program: &Program, emitted: &Emitted, options: CompileOptions) -> Provenance {
    use sha2::{Digest, Sha256};

    let program_hash = {
        let mut hasher = Sha256::new();
        hasher.update(program.canonical_json().as_bytes());
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        hash
    };

    Provenance {
        program_hash,
        conf_fingerprint: emitted.fingerprint(),
        options,
        compiler_version: env!("CARGO_PKG_VERSION"),
    }
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// The compilation context plus what the runner collected.
pub struct CompilationState<'p> {
    pub ctx: CompilationContext<'p>,
    pub emitted: Option<Emitted>,
    pub timings: Vec<(PassId, Duration)>,
}

fn finish_pass(timings: &mut Vec<(PassId, Duration)>, pass: PassId, elapsed: Duration) {
    debug!(
        "gridc: {} complete, {:.1}ms",
        descriptor(pass).name,
        elapsed.as_secs_f64() * 1000.0
    );
    timings.push((pass, elapsed));
}

/// Run the minimal set of passes to produce `terminal`.
pub fn run_pipeline<'p>(
    program: &'p Program,
    options: &CompileOptions,
    terminal: PassId,
) -> CompileResult<CompilationState<'p>> {
    options.validate()?;
    let passes = required_passes(terminal);

    let t = Instant::now();
    let ctx = CompilationContext::new(program, *options)?;
    let mut state = CompilationState {
        ctx,
        emitted: None,
        timings: Vec::with_capacity(passes.len()),
    };
    finish_pass(&mut state.timings, PassId::Bind, t.elapsed());

    for &pass in &passes {
        let t = Instant::now();
        let result = match pass {
            PassId::Bind => continue,
            PassId::Place => place::place_all(&mut state.ctx),
            PassId::Route => route::route_all(&mut state.ctx),
            PassId::Synthesize => lmm::synthesize(&mut state.ctx),
            PassId::Merge => lmm::merge(&mut state.ctx),
            PassId::Broadcast => lmm::broadcast(&mut state.ctx),
            PassId::Emit => emit::emit(&state.ctx).map(|e| state.emitted = Some(e)),
        };
        if let Err(e) = result {
            debug!(pass = descriptor(pass).name, code = %e.code, "pass failed");
            return Err(e);
        }
        finish_pass(&mut state.timings, pass, t.elapsed());
    }
    Ok(state)
}

// ── Compiled kernel ────────────────────────────────────────────────────────

/// Everything produced by a full compilation.
#[derive(Debug, Clone)]
pub struct CompiledKernel {
    pub options: CompileOptions,
    pub grid: Grid,
    pub placements: Vec<Placement>,
    /// Diagnostic label of each record, in source order.
    pub labels: Vec<String>,
    pub lmm: LmmTable,
    pub emitted: Emitted,
    pub stats: RouteStats,
    pub provenance: Provenance,
}

/// Compile `program` through every pass.
pub fn compile(program: &Program, options: &CompileOptions) -> CompileResult<CompiledKernel> {
    let state = run_pipeline(program, options, PassId::Emit)?;
    let ctx = state.ctx;
    let emitted = state
        .emitted
        .ok_or_else(|| CompileError::internal("emit pass produced no output"))?;
    let lmm = ctx
        .lmm
        .ok_or_else(|| CompileError::internal("descriptor table missing after emit"))?;
    let placements = ctx
        .placements
        .iter()
        .enumerate()
        .map(|(i, p)| p.ok_or_else(|| CompileError::internal(format!("record {} unplaced", i))))
        .collect::<CompileResult<Vec<_>>>()?;
    let provenance = compute_provenance(program, &emitted, *options);
    Ok(CompiledKernel {
        options: *options,
        grid: ctx.grid,
        placements,
        labels: program.ops.iter().map(|op| op.label()).collect(),
        lmm,
        emitted,
        stats: ctx.stats,
        provenance,
    })
}

impl CompiledKernel {
    /// Human-readable placement, descriptor and routing summary.
    pub fn listing(&self) -> String {
        let mut s = String::new();
        let _ = writeln!(
            s,
            "grid: depth {}, {} rows used, mapdist {}",
            self.options.depth,
            self.grid.used_rows(),
            self.options.mapdist
        );
        s.push_str(&self.grid.to_string());
        s.push_str("records:\n");
        for (label, p) in self.labels.iter().zip(&self.placements) {
            let mut flags = String::new();
            if p.wide {
                flags.push_str(" wide");
            }
            if p.fold {
                flags.push_str(" fold");
            }
            let _ = writeln!(s, "  {} {}{}", p.loc, label, flags);
        }
        s.push_str("descriptors:\n");
        for (loc, d) in self.lmm.iter().filter(|(_, d)| d.valid) {
            let _ = write!(
                s,
                "  {} {} top={:#x} len={} mode={:?}",
                loc,
                d.class(),
                d.top,
                d.len,
                d.mode
            );
            if let Some(m) = d.master.filter(|_| d.is_copy()) {
                let _ = write!(s, " copy-of={}", m);
            }
            s.push('\n');
        }
        let _ = writeln!(
            s,
            "routing: carries={} reuses={} bypasses={} preloads={}",
            self.stats.carries, self.stats.reuses, self.stats.bypasses, self.stats.preloads
        );
        s
    }

    pub fn placement_of(&self, label: &str) -> Option<Loc> {
        self.labels
            .iter()
            .position(|l| l == label)
            .map(|i| self.placements[i].loc)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
