// Property-based tests for scheduler invariants.
//
// Generated straight-line programs (ALU ops over a small register window,
// uniform loads and, on V4.2, SFU writes with their r4 readers) must:
// 1. schedule, finalize and pass every verification obligation
// 2. schedule identically when run twice
// 3. never emit more bundles than a fully serial schedule would need
//
// Uses proptest with explicit configuration to prevent CI flakiness.

use qpusched::pass::{PassId, StageCert};
use qpusched::pipeline::{run_pipeline, CompilationState, PipelineOptions};
use qpusched::resolve::TargetOverrides;
use proptest::prelude::*;

// ── Program generator ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    Add(&'static str, u8, u8, u8),
    Mul(&'static str, u8, u8, u8),
    LoadUniform(u8),
    /// SFU write followed by an r4 read (V4.2 only).
    Sfu(u8, u8, u8),
}

fn reg() -> impl Strategy<Value = u8> {
    1u8..16
}

fn arb_op(with_sfu: bool) -> BoxedStrategy<Op> {
    let add = (prop_oneof![Just("fadd"), Just("fsub"), Just("add")], reg(), reg(), reg())
        .prop_map(|(op, d, a, b)| Op::Add(op, d, a, b));
    let mul = (prop_oneof![Just("fmul"), Just("smul24")], reg(), reg(), reg())
        .prop_map(|(op, d, a, b)| Op::Mul(op, d, a, b));
    let unif = reg().prop_map(Op::LoadUniform);
    if with_sfu {
        let sfu = (reg(), reg(), reg()).prop_map(|(s, d, b)| Op::Sfu(s, d, b));
        prop_oneof![4 => add, 3 => mul, 1 => unif, 1 => sfu].boxed()
    } else {
        prop_oneof![4 => add, 3 => mul, 1 => unif].boxed()
    }
}

/// A single-block program plus the number of source instructions.
fn arb_program() -> impl Strategy<Value = (String, usize)> {
    prop_oneof![Just("v42"), Just("v71")]
        .prop_flat_map(|target| {
            (
                Just(target),
                prop::collection::vec(arb_op(target == "v42"), 1..=24),
                prop_oneof![Just(1u32), Just(2), Just(4)],
            )
        })
        .prop_map(|(target, ops, threads)| render(target, threads, &ops))
}

fn render(target: &str, threads: u32, ops: &[Op]) -> (String, usize) {
    let mut body = String::new();
    let mut uniforms = String::new();
    let mut count = 0;
    let mut next_unif = 0;
    for op in ops {
        match *op {
            Op::Add(name, d, a, b) => {
                body.push_str(&format!("    {} rf{}, rf{}, rf{} ; nop\n", name, d, a, b));
                count += 1;
            }
            Op::Mul(name, d, a, b) => {
                body.push_str(&format!("    nop ; {} rf{}, rf{}, rf{}\n", name, d, a, b));
                count += 1;
            }
            Op::LoadUniform(d) => {
                uniforms.push_str(&format!(".uniform const {}\n", next_unif * 4));
                body.push_str(&format!("    nop ; nop ; ldunifrf.rf{} [unif={}]\n", d, next_unif));
                next_unif += 1;
                count += 1;
            }
            Op::Sfu(s, d, b) => {
                body.push_str(&format!("    or recip, rf{}, rf{} ; nop\n", s, s));
                body.push_str(&format!("    fadd rf{}, r4, rf{} ; nop\n", d, b));
                count += 2;
            }
        }
    }
    let source = format!(
        ".target {} threads={}\n{}block main:\n{}",
        target, threads, uniforms, body
    );
    (source, count)
}

// ── Helpers ─────────────────────────────────────────────────────────────────

fn compile(source: &str) -> Result<CompilationState, String> {
    let parsed = qpusched::parser::parse(source);
    if !parsed.errors.is_empty() {
        return Err(format!("parse errors: {:?}", parsed.errors));
    }
    let file = parsed.file.ok_or("no file")?;
    let mut state = CompilationState::new(file, TargetOverrides::default());
    run_pipeline(&mut state, PassId::Verify, &PipelineOptions::default(), |_, _| {})
        .map_err(|e| format!("{:?} failed: {:?}", e.failing_pass, state.diagnostics))?;
    Ok(state)
}

// ── Properties ──────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 200,
        .. ProptestConfig::default()
    })]

    #[test]
    fn scheduled_programs_verify((source, count) in arb_program()) {
        let state = compile(&source).map_err(TestCaseError::fail)?;
        let cert = state.artifacts.cert.as_ref().expect("cert");
        prop_assert!(cert.all_pass(), "failed {:?} for:\n{}", cert.failed(), source);

        let schedule = state.artifacts.schedule.as_ref().expect("schedule");
        prop_assert_eq!(schedule.stats.instructions as usize, count);
        let placed: usize = schedule.instructions().map(|i| i.origins.len()).sum();
        // The program-end switch is synthesized and carries no origin.
        prop_assert_eq!(placed, count);
    }

    #[test]
    fn scheduling_is_deterministic((source, _count) in arb_program()) {
        let first = compile(&source).map_err(TestCaseError::fail)?;
        let second = compile(&source).map_err(TestCaseError::fail)?;
        let a = first.artifacts.schedule.as_ref().expect("schedule").to_string();
        let b = second.artifacts.schedule.as_ref().expect("schedule").to_string();
        prop_assert_eq!(a, b);
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 50,
        max_shrink_iters: 100,
        .. ProptestConfig::default()
    })]

    /// Each source instruction costs at most its SFU wait plus one bundle,
    /// and the program end adds a switch with two delay slots.
    #[test]
    fn schedule_length_is_bounded((source, count) in arb_program()) {
        let state = compile(&source).map_err(TestCaseError::fail)?;
        let schedule = state.artifacts.schedule.as_ref().expect("schedule");
        let bound = 3 * count as u32 + 3;
        prop_assert!(
            schedule.stats.cycles <= bound,
            "{} cycles for {} instructions:\n{}",
            schedule.stats.cycles,
            count,
            schedule
        );
        prop_assert_eq!(schedule.stats.cycles as usize, schedule.instructions().count());
    }
}
