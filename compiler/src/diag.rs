// diag.rs — Compile error model
//
// The single structured error returned by every compiler pass. Errors are
// fatal: the first one aborts the compilation unit and is propagated to the
// driver unchanged.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

use thiserror::Error;

use crate::arch::Loc;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0100`).
///
/// Codes are `&'static str` constants defined in the `codes` module.
/// Once assigned, a code keeps its meaning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    // Capacity
    pub const E0100: DiagCode = DiagCode("E0100"); // grid rows exhausted
    pub const E0101: DiagCode = DiagCode("E0101"); // no carry path left
    pub const E0102: DiagCode = DiagCode("E0102"); // LMM window too large
    pub const E0103: DiagCode = DiagCode("E0103"); // value does not fit its field
    pub const E0104: DiagCode = DiagCode("E0104"); // explicit location outside grid

    // Conflict
    pub const E0200: DiagCode = DiagCode("E0200"); // slot already occupied
    pub const E0201: DiagCode = DiagCode("E0201"); // symbol produced twice
    pub const E0202: DiagCode = DiagCode("E0202"); // shared selector disagreement
    pub const E0203: DiagCode = DiagCode("E0203"); // write-write on one window
    pub const E0204: DiagCode = DiagCode("E0204"); // two windows in one cell

    // Sequencing
    pub const E0300: DiagCode = DiagCode("E0300"); // explicit row before bound
    pub const E0301: DiagCode = DiagCode("E0301"); // undefined or forward symbol
    pub const E0302: DiagCode = DiagCode("E0302"); // pinned consumer not in producer cell
    pub const E0303: DiagCode = DiagCode("E0303"); // value kind cannot feed this role

    // Merge consistency
    pub const E0400: DiagCode = DiagCode("E0400"); // mapdist partner mode mismatch

    // Malformed input
    pub const E0500: DiagCode = DiagCode("E0500"); // record shape invalid

    // Internal
    pub const E0900: DiagCode = DiagCode("E0900"); // wiring slot never allocated
}

// ── Error kind ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Placement or routing would exceed grid bounds.
    Capacity,
    /// A slot, register or memory region claimed twice incompatibly.
    Conflict,
    /// Placement violates a dependency bound.
    Sequencing,
    /// Mirrored prefetch/drain descriptors disagree.
    MergeConsistency,
    /// Record shape the fabric cannot express.
    Malformed,
    /// Inconsistent compiler state.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Capacity => "capacity",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Sequencing => "sequencing",
            ErrorKind::MergeConsistency => "merge-consistency",
            ErrorKind::Malformed => "malformed",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ── Compile error ────────────────────────────────────────────────────────

/// A fatal compilation error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error[{code}]{}: {message}{}", place_suffix(.symbol, .loc), hint_suffix(.hint))]
pub struct CompileError {
    pub code: DiagCode,
    pub kind: ErrorKind,
    pub symbol: Option<String>,
    pub loc: Option<Loc>,
    pub message: String,
    pub hint: Option<String>,
}

fn place_suffix(symbol: &Option<String>, loc: &Option<Loc>) -> String {
    match (symbol, loc) {
        (Some(s), Some(l)) => format!(" at {} (`{}`)", l, s),
        (Some(s), None) => format!(" (`{}`)", s),
        (None, Some(l)) => format!(" at {}", l),
        (None, None) => String::new(),
    }
}

fn hint_suffix(hint: &Option<String>) -> String {
    match hint {
        Some(h) => format!("\n  hint: {}", h),
        None => String::new(),
    }
}

impl CompileError {
    pub fn new(kind: ErrorKind, code: DiagCode, message: impl Into<String>) -> Self {
        CompileError {
            code,
            kind,
            symbol: None,
            loc: None,
            message: message.into(),
            hint: None,
        }
    }

    pub fn capacity(code: DiagCode, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Capacity, code, message)
    }

    pub fn conflict(code: DiagCode, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, code, message)
    }

    pub fn sequencing(code: DiagCode, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Sequencing, code, message)
    }

    pub fn merge(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MergeConsistency, codes::E0400, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Malformed, codes::E0500, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, codes::E0900, message)
    }

    /// Attach the offending symbol.
    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    /// Attach the offending grid location.
    pub fn at(mut self, loc: Loc) -> Self {
        self.loc = Some(loc);
        self
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }
}

pub type CompileResult<T> = Result<T, CompileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_symbol_and_location() {
        let e = CompileError::capacity(codes::E0100, "grid depth exhausted")
            .with_symbol("acc")
            .at(Loc::new(8, 0));
        assert_eq!(
            e.to_string(),
            "capacity error[E0100] at [8][0] (`acc`): grid depth exhausted"
        );
    }

    #[test]
    fn display_without_context() {
        let e = CompileError::internal("lane missing");
        assert_eq!(e.to_string(), "internal error[E0900]: lane missing");
    }

    #[test]
    fn hint_renders_on_second_line() {
        let e = CompileError::sequencing(codes::E0300, "row 1 is before bound 3")
            .with_hint("drop the explicit location");
        let s = e.to_string();
        assert!(s.starts_with("sequencing error[E0300]: row 1"));
        assert!(s.ends_with("\n  hint: drop the explicit location"));
    }

    #[test]
    fn constructors_set_kind() {
        assert_eq!(CompileError::merge("x").kind, ErrorKind::MergeConsistency);
        assert_eq!(CompileError::malformed("x").code, codes::E0500);
    }
}
