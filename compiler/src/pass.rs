// pass.rs — Pass descriptor module: metadata, dependency resolution, artifact IDs
//
// Declares the backend's passes, their dependency edges, and the artifacts
// they produce. The pipeline runner uses this table to compute the minimal
// pass subset for each --emit target (descriptor output skips routing).

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Bind,
    Place,
    Route,
    Synthesize,
    Merge,
    Broadcast,
    Emit,
}

/// Machine-readable artifact identifiers, each a field of the compilation
/// context or state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    SymbolTable, // SymbolTable
    Placements,  // Vec<Option<Placement>> + Grid units
    Wiring,      // Grid wiring + RouteStats
    Descriptors, // LmmTable
    Emitted,     // Emitted
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a backend pass.
pub struct PassDescriptor {
    /// Human-readable name for verbose output.
    pub name: &'static str,
    /// Passes whose outputs this pass consumes.
    pub inputs: &'static [PassId],
    /// Artifacts this pass produces.
    pub outputs: &'static [ArtifactId],
    /// What invalidates this pass's output.
    pub invalidation_key: &'static str,
    /// Pre/post conditions (documentation only).
    pub invariants: &'static str,
}

pub fn descriptor(id: PassId) -> PassDescriptor {
    match id {
        PassId::Bind => PassDescriptor {
            name: "bind",
            inputs: &[],
            outputs: &[ArtifactId::SymbolTable],
            invalidation_key: "program",
            invariants: "records validated, one producer per symbol, operands refer backwards",
        },
        PassId::Place => PassDescriptor {
            name: "place",
            inputs: &[PassId::Bind],
            outputs: &[ArtifactId::Placements],
            invalidation_key: "program + depth",
            invariants: "no two records share a unit, every consumer at or after its bound",
        },
        PassId::Route => PassDescriptor {
            name: "route",
            inputs: &[PassId::Place],
            outputs: &[ArtifactId::Wiring],
            invalidation_key: "placements",
            invariants: "every value read is carried by the row above its reader",
        },
        PassId::Synthesize => PassDescriptor {
            name: "synthesize",
            inputs: &[PassId::Place],
            outputs: &[ArtifactId::Descriptors],
            invalidation_key: "placements + host symbols",
            invariants: "at most one window per cell",
        },
        PassId::Merge => PassDescriptor {
            name: "merge",
            inputs: &[PassId::Synthesize],
            outputs: &[ArtifactId::Descriptors],
            invalidation_key: "descriptors + mapdist + lmm_bytes",
            invariants: "merged descriptors bit-equal, mirrored rows agree, regions fit",
        },
        PassId::Broadcast => PassDescriptor {
            name: "broadcast",
            inputs: &[PassId::Merge],
            outputs: &[ArtifactId::Descriptors],
            invalidation_key: "descriptors",
            invariants: "no two rows write one window",
        },
        PassId::Emit => PassDescriptor {
            name: "emit",
            inputs: &[PassId::Route, PassId::Broadcast],
            outputs: &[ArtifactId::Emitted],
            invalidation_key: "wiring + descriptors + mapdist",
            invariants: "every select resolves to an allocated register",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All pass IDs in declaration order.
pub const ALL_PASSES: [PassId; 7] = [
    PassId::Bind,
    PassId::Place,
    PassId::Route,
    PassId::Synthesize,
    PassId::Merge,
    PassId::Broadcast,
    PassId::Emit,
];

/// Compute the minimal ordered set of passes needed to produce `terminal`.
/// Returns passes in topological (execution) order.
pub fn required_passes(terminal: PassId) -> Vec<PassId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(terminal, &mut visited, &mut order);
    order
}

fn visit(id: PassId, visited: &mut HashSet<PassId>, order: &mut Vec<PassId>) {
    if !visited.insert(id) {
        return;
    }
    for &dep in descriptor(id).inputs {
        visit(dep, visited, order);
    }
    order.push(id);
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_passes_broadcast_skips_route() {
        let passes = required_passes(PassId::Broadcast);
        assert_eq!(
            passes,
            vec![
                PassId::Bind,
                PassId::Place,
                PassId::Synthesize,
                PassId::Merge,
                PassId::Broadcast
            ]
        );
        assert!(!passes.contains(&PassId::Route));
    }

    #[test]
    fn required_passes_emit_includes_all() {
        let passes = required_passes(PassId::Emit);
        assert_eq!(passes.len(), ALL_PASSES.len());
        assert_eq!(
            passes,
            vec![
                PassId::Bind,
                PassId::Place,
                PassId::Route,
                PassId::Synthesize,
                PassId::Merge,
                PassId::Broadcast,
                PassId::Emit,
            ]
        );
    }

    #[test]
    fn required_passes_bind_is_minimal() {
        assert_eq!(required_passes(PassId::Bind), vec![PassId::Bind]);
    }

    #[test]
    fn all_descriptors_have_outputs() {
        for pass in &ALL_PASSES {
            let desc = descriptor(*pass);
            assert!(
                !desc.outputs.is_empty(),
                "pass {:?} has no outputs declared",
                pass
            );
        }
    }

    #[test]
    fn dependency_edges_are_consistent() {
        for pass in &ALL_PASSES {
            let order = required_passes(*pass);
            for dep in descriptor(*pass).inputs {
                let dep_pos = order.iter().position(|p| p == dep);
                let self_pos = order.iter().position(|p| p == pass);
                assert!(
                    dep_pos.unwrap() < self_pos.unwrap(),
                    "{:?} depends on {:?} but it comes later in topological order",
                    pass,
                    dep
                );
            }
        }
    }
}
