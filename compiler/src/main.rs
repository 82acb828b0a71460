use clap::Parser;
use std::io::Write;
use std::path::PathBuf;

use gridc::arch::GridDepth;
use gridc::emit::lmmi_table;
use gridc::microop::Program;
use gridc::pass::PassId;
use gridc::pipeline::{compile, run_pipeline, CompileOptions};

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum EmitStage {
    /// Little-endian configuration blob
    Words,
    /// `.word` assembler listing
    Asm,
    /// Placement, descriptor and routing summary
    Listing,
    /// Local-memory descriptors only (skips routing)
    Lmmi,
    /// Provenance JSON
    BuildInfo,
}

/// Supported grid depths; anything else is rejected while parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Depth {
    #[value(name = "8")]
    D8,
    #[value(name = "16")]
    D16,
    #[value(name = "32")]
    D32,
    #[value(name = "64")]
    D64,
}

impl From<Depth> for GridDepth {
    fn from(d: Depth) -> GridDepth {
        match d {
            Depth::D8 => GridDepth::D8,
            Depth::D16 => GridDepth::D16,
            Depth::D32 => GridDepth::D32,
            Depth::D64 => GridDepth::D64,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "gridc",
    version,
    about = "Grid fabric compiler backend: places micro-operations and emits configuration words"
)]
struct Cli {
    /// Input micro-operation program (JSON)
    input: PathBuf,

    /// Output file path (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Grid depth in rows
    #[arg(long, value_enum, default_value_t = Depth::D64)]
    depth: Depth,

    /// Row distance of prefetch/drain partners
    #[arg(long, default_value_t = 0)]
    mapdist: u8,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Words)]
    emit: EmitStage,

    /// Print compiler passes and timing
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(level)
        .with_target(false)
        .try_init();

    let depth = GridDepth::from(cli.depth);
    let options = CompileOptions {
        depth,
        mapdist: cli.mapdist,
        ..CompileOptions::default()
    };

    if cli.verbose {
        eprintln!("gridc: input  = {}", cli.input.display());
        eprintln!("gridc: depth  = {}, mapdist = {}", depth, cli.mapdist);
        eprintln!("gridc: emit   = {:?}", cli.emit);
    }

    // ── Read and decode input ──
    let text = match std::fs::read_to_string(&cli.input) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("gridc: error: {}: {}", cli.input.display(), e);
            std::process::exit(2);
        }
    };
    let program = match Program::from_json(&text) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("gridc: error: {}: {}", cli.input.display(), e);
            std::process::exit(1);
        }
    };

    if cli.verbose {
        eprintln!("gridc: {} records, {} host symbols", program.ops.len(), program.symbols.len());
    }

    // ── Compile ──
    let bytes = match cli.emit {
        EmitStage::Lmmi => {
            let state = match run_pipeline(&program, &options, PassId::Broadcast) {
                Ok(s) => s,
                Err(e) => fail(&e),
            };
            let Some(table) = state.ctx.lmm.as_ref() else {
                eprintln!("gridc: error: descriptor pass produced no table");
                std::process::exit(1);
            };
            let mut s = String::new();
            for (r, row) in lmmi_table(table).iter().enumerate() {
                for (c, w) in row.iter().enumerate().filter(|(_, w)| w.v) {
                    let d = table.get(gridc::arch::Loc::new(r as u8, c as u8));
                    match w.pack() {
                        Ok([w0, w1]) => s.push_str(&format!(
                            "[{}][{}] {} top={:#x} len={} ofs={} mode={:?}\t0x{:016x} 0x{:016x}\n",
                            r, c, d.class(), w.top, w.len, w.ofs, d.mode, w0, w1
                        )),
                        Err(e) => fail(&e),
                    }
                }
            }
            s.into_bytes()
        }
        stage => {
            let kernel = match compile(&program, &options) {
                Ok(k) => k,
                Err(e) => fail(&e),
            };
            if cli.verbose {
                eprintln!(
                    "gridc: {} rows used, {} descriptors, fingerprint {}",
                    kernel.grid.used_rows(),
                    kernel.lmm.valid_count(),
                    kernel.provenance.conf_fingerprint_hex()
                );
            }
            match stage {
                EmitStage::Words => kernel.emitted.to_bytes(),
                EmitStage::Asm => kernel.emitted.to_asm().into_bytes(),
                EmitStage::Listing => kernel.listing().into_bytes(),
                EmitStage::BuildInfo => kernel.provenance.to_json().into_bytes(),
                EmitStage::Lmmi => Vec::new(),
            }
        }
    };

    // ── Write output ──
    let result = match &cli.output {
        Some(path) => std::fs::write(path, &bytes),
        None => std::io::stdout().lock().write_all(&bytes),
    };
    if let Err(e) = result {
        eprintln!("gridc: error: cannot write output: {}", e);
        std::process::exit(2);
    }
}

fn fail(e: &gridc::diag::CompileError) -> ! {
    eprintln!("gridc: error: {}", e);
    std::process::exit(1);
}
