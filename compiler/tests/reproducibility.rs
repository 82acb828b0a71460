// Reproducibility tests for the command-line compiler.
//
// These tests verify that the binary produces byte-identical outputs for
// identical inputs, that every output stage is wired up, and that failures
// map to the documented exit codes.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn gridc_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_gridc"))
}

fn fixtures_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures")
}

fn fixture(name: &str) -> String {
    fixtures_dir().join(name).to_str().unwrap().to_string()
}

fn run(args: &[&str]) -> Output {
    Command::new(gridc_binary())
        .args(args)
        .output()
        .expect("failed to run gridc")
}

fn run_gridc(args: &[&str]) -> Vec<u8> {
    let output = run(args);
    assert!(
        output.status.success(),
        "gridc failed with args {:?}\nstderr: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    output.stdout
}

fn run_text(args: &[&str]) -> String {
    String::from_utf8(run_gridc(args)).expect("non-UTF8 output")
}

/// Compiling the same program twice produces byte-identical words.
#[test]
fn same_input_identical_words() {
    let input = fixture("add_store.json");
    let a = run_gridc(&[&input, "--depth", "8"]);
    let b = run_gridc(&[&input, "--depth", "8"]);
    assert!(!a.is_empty());
    assert_eq!(a, b, "configuration words differ between runs");
}

/// The blob holds four 64-bit words per cell of the requested depth.
#[test]
fn words_cover_the_whole_grid() {
    let input = fixture("add_store.json");
    for (depth, rows) in [("8", 8), ("16", 16)] {
        let out = run_gridc(&[&input, "--depth", depth]);
        assert_eq!(out.len(), rows * 4 * 4 * 8, "depth {}", depth);
    }
}

#[test]
fn asm_lists_two_directives_per_word() {
    let input = fixture("add_store.json");
    let asm = run_text(&[&input, "--depth", "8", "--emit", "asm"]);
    assert_eq!(asm.matches(".word").count(), 8 * 4 * 4 * 2);
}

#[test]
fn listing_shows_placement_and_pairing() {
    let input = fixture("pair_loads.json");
    let listing = run_text(&[&input, "--depth", "8", "--emit", "listing"]);
    assert!(listing.starts_with("grid: depth 8"), "got:\n{}", listing);
    assert!(listing.contains("  [2][0] x\n"));
    assert!(listing.contains("  [2][1] y\n"));
    assert!(listing.contains("mode=Pair copy-of=[2][0]"));
}

#[test]
fn lmmi_prints_valid_descriptors_only() {
    let input = fixture("pair_loads.json");
    let out = run_text(&[&input, "--depth", "8", "--emit", "lmmi"]);
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 2, "got:\n{}", out);
    assert!(lines[0].starts_with("[2][0] lmr top=0x1000 len=64"));
    assert!(lines[1].starts_with("[2][1] lmr"));
}

/// Build info carries hashes that identify the input and the output.
#[test]
fn build_info_is_stable_json() {
    let input = fixture("add_store.json");
    let a = run_text(&[&input, "--depth", "8", "--emit", "build-info"]);
    let b = run_text(&[&input, "--depth", "8", "--emit", "build-info"]);
    assert_eq!(a, b);
    let v: serde_json::Value = serde_json::from_str(&a).expect("build info is not JSON");
    assert_eq!(v["depth"], 8);
    assert_eq!(v["mapdist"], 0);
    assert_eq!(v["program_hash"].as_str().map(str::len), Some(64));
    assert_eq!(v["conf_fingerprint"].as_str().map(str::len), Some(64));

    let other = run_text(&[&fixture("pair_loads.json"), "--depth", "8", "--emit", "build-info"]);
    let w: serde_json::Value = serde_json::from_str(&other).unwrap();
    assert_ne!(v["program_hash"], w["program_hash"]);
}

#[test]
fn output_flag_writes_file() {
    let input = fixture("add_store.json");
    let out = std::env::temp_dir().join(format!("gridc-repro-{}.bin", std::process::id()));
    let out_str = out.to_str().unwrap();
    let stdout = run_gridc(&[&input, "--depth", "8", "-o", out_str]);
    assert!(stdout.is_empty());
    let written = std::fs::read(&out).unwrap();
    let _ = std::fs::remove_file(&out);
    assert_eq!(written, run_gridc(&[&input, "--depth", "8"]));
}

// ── Failures ───────────────────────────────────────────────────────────────

#[test]
fn missing_input_exits_2() {
    let output = run(&["/nonexistent/program.json"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("gridc: error:"));
}

#[test]
fn unsupported_depth_exits_2() {
    let output = run(&[&fixture("add_store.json"), "--depth", "12"]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("possible values: 8, 16, 32, 64"), "stderr: {}", stderr);
}

#[test]
fn compile_error_exits_1_with_symbol() {
    let output = run(&[&fixture("undefined_symbol.json"), "--depth", "8"]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("gridc: error:"), "stderr: {}", stderr);
    assert!(stderr.contains("nope"), "stderr: {}", stderr);
}
