// pass.rs — Pass descriptors, dependency resolution and stage certs
//
// Declares the scheduler's passes (parse is outside the runner), their
// dependency edges and the artifacts they produce. The pipeline runner uses
// this to compute the minimal pass subset for each --emit target.

use std::collections::HashSet;

// ── Pass and Artifact identifiers ──────────────────────────────────────────

/// Identifies each pass (parse excluded; handled before the runner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassId {
    Resolve,
    Schedule,
    Finalize,
    Verify,
}

/// Pass outputs; each names one field of `pipeline::Artifacts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactId {
    Program,   // Program
    Schedule,  // ScheduledProgram
    Trace,     // Trace
    Finalized, // ScheduledProgram with branch targets set
    Cert,      // ScheduleCert
}

// ── Pass descriptor ────────────────────────────────────────────────────────

/// Static metadata about a pass.
pub struct PassDescriptor {
    /// Name printed by `--verbose`.
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
        PassId::Resolve => PassDescriptor {
            name: "resolve",
            inputs: &[],
            outputs: &[ArtifactId::Program],
            invalidation_key: "source + device overrides",
            invariants: "opcodes, registers and labels resolved for the target generation",
        },
        PassId::Schedule => PassDescriptor {
            name: "schedule",
            inputs: &[PassId::Resolve],
            outputs: &[ArtifactId::Schedule, ArtifactId::Trace],
            invalidation_key: "program + device",
            invariants: "every block scheduled, delay slots filled, thrend emitted",
        },
        PassId::Finalize => PassDescriptor {
            name: "finalize",
            inputs: &[PassId::Schedule],
            outputs: &[ArtifactId::Finalized],
            invalidation_key: "schedule",
            invariants: "branch offsets and branch uniforms set",
        },
        PassId::Verify => PassDescriptor {
            name: "verify",
            inputs: &[PassId::Resolve, PassId::Finalize],
            outputs: &[ArtifactId::Cert],
            invalidation_key: "program + finalized schedule",
            invariants: "V1-V5 obligations hold",
        },
    }
}

// ── Dependency resolution ──────────────────────────────────────────────────

/// All pass IDs in declaration order.
pub const ALL_PASSES: [PassId; 4] = [
    PassId::Resolve,
    PassId::Schedule,
    PassId::Finalize,
    PassId::Verify,
];

/// Passes needed for `terminal`, in execution order.
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

// ── Stage certs ────────────────────────────────────────────────────────────

/// Machine-checkable evidence that a pass met its postconditions.
pub trait StageCert {
    /// True when every obligation holds.
    fn all_pass(&self) -> bool;
    /// Named obligations with their outcome, in a stable order.
    fn obligations(&self) -> Vec<(&'static str, bool)>;

    /// Names of the obligations that failed.
    fn failed(&self) -> Vec<&'static str> {
        self.obligations()
            .into_iter()
            .filter(|(_, ok)| !ok)
            .map(|(name, _)| name)
            .collect()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_passes_schedule_skips_finalize_and_verify() {
        let passes = required_passes(PassId::Schedule);
        assert_eq!(passes, vec![PassId::Resolve, PassId::Schedule]);
    }

    #[test]
    fn required_passes_verify_includes_all() {
        let passes = required_passes(PassId::Verify);
        assert_eq!(passes, ALL_PASSES.to_vec());
    }

    #[test]
    fn required_passes_resolve_is_minimal() {
        assert_eq!(required_passes(PassId::Resolve), vec![PassId::Resolve]);
    }

    #[test]
    fn no_parse_in_pass_id() {
        for pass in &ALL_PASSES {
            assert_ne!(descriptor(*pass).name, "parse");
        }
    }

    #[test]
    fn all_descriptors_have_outputs() {
        for pass in &ALL_PASSES {
            assert!(
                !descriptor(*pass).outputs.is_empty(),
                "pass {:?} has no outputs declared",
                pass
            );
        }
    }

    #[test]
    fn dependency_edges_are_consistent() {
        for pass in &ALL_PASSES {
            let order = required_passes(*pass);
            let self_pos = order.iter().position(|p| p == pass);
            for dep in descriptor(*pass).inputs {
                let dep_pos = order.iter().position(|p| p == dep);
                assert!(
                    dep_pos < self_pos,
                    "{:?} depends on {:?} but it comes later in topological order",
                    pass,
                    dep
                );
            }
        }
    }

    struct Fixed(Vec<(&'static str, bool)>);

    impl StageCert for Fixed {
        fn all_pass(&self) -> bool {
            self.0.iter().all(|(_, ok)| *ok)
        }
        fn obligations(&self) -> Vec<(&'static str, bool)> {
            self.0.clone()
        }
    }

    #[test]
    fn failed_lists_only_false_obligations() {
        let cert = Fixed(vec![("A", true), ("B", false), ("C", false)]);
        assert!(!cert.all_pass());
        assert_eq!(cert.failed(), vec!["B", "C"]);
    }
}
