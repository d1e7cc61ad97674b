// End-to-end scheduling scenarios.
//
// Each test runs the library pipeline (parse → resolve → schedule →
// finalize → verify) on a small program and checks the shape of the
// result: which instructions pair, where delay slots land and how far
// apart hazard-bound instructions end up.

use qpusched::inst::Signals;
use qpusched::pass::{PassId, StageCert};
use qpusched::pipeline::{run_pipeline, CompilationState, PipelineOptions};
use qpusched::program::{ScheduledBlock, ScheduledProgram};
use qpusched::resolve::TargetOverrides;

fn compile(source: &str) -> CompilationState {
    let parsed = qpusched::parser::parse(source);
    assert!(parsed.errors.is_empty(), "parse errors: {:?}", parsed.errors);
    let mut state = CompilationState::new(parsed.file.unwrap(), TargetOverrides::default());
    let result = run_pipeline(&mut state, PassId::Verify, &PipelineOptions::default(), |_, _| {});
    assert!(result.is_ok(), "diagnostics: {:?}", state.diagnostics);
    let cert = state.artifacts.cert.as_ref().expect("cert");
    assert!(cert.all_pass(), "failed: {:?}", cert.failed());
    state
}

fn schedule_of(state: &CompilationState) -> &ScheduledProgram {
    state.artifacts.schedule.as_ref().expect("schedule")
}

/// Position of the instruction that carries source instruction `origin`.
fn position(block: &ScheduledBlock, origin: u32) -> usize {
    block
        .instructions
        .iter()
        .position(|i| i.origins.contains(&origin))
        .unwrap_or_else(|| panic!("origin {} not scheduled", origin))
}

fn sorted(mut v: Vec<u32>) -> Vec<u32> {
    v.sort_unstable();
    v
}

#[test]
fn independent_add_and_mul_ops_dual_issue() {
    let state = compile(
        ".target v71
block main:
    fadd rf1, rf2, rf3 ; nop
    fadd rf4, rf5, rf6 ; nop
    nop ; fmul rf7, rf8, rf9
    nop ; fmul rf10, rf11, rf12
",
    );
    let s = schedule_of(&state);
    let insts = &s.blocks[0].instructions;
    assert_eq!(sorted(insts[0].origins.clone()), vec![0, 2]);
    assert_eq!(sorted(insts[1].origins.clone()), vec![1, 3]);
    assert_eq!(s.stats.merged, 2);
    // Two bundles, then the program-end switch and its two delay slots.
    assert_eq!(insts.len(), 5);
    assert!(insts[2].has_sig(Signals::THRSW));
    assert_eq!(s.stats.cycles, 5);
}

#[test]
fn sfu_result_is_not_read_early() {
    let state = compile(
        ".target v42
block main:
    or recip, rf1, rf1 ; nop
    fadd rf2, r4, rf3 ; nop
",
    );
    let block = &schedule_of(&state).blocks[0];
    let producer = position(block, 0);
    let consumer = position(block, 1);
    assert!(
        consumer >= producer + 3,
        "r4 read at {} after SFU write at {}",
        consumer,
        producer
    );
}

#[test]
fn independent_work_fills_the_sfu_gap() {
    let state = compile(
        ".target v42
block main:
    or recip, rf1, rf1 ; nop
    fadd rf2, r4, rf3 ; nop
    fadd rf5, rf6, rf7 ; nop
    fadd rf8, rf9, rf10 ; nop
",
    );
    let block = &schedule_of(&state).blocks[0];
    let producer = position(block, 0);
    let consumer = position(block, 1);
    assert!(consumer >= producer + 3);
    for other in [2, 3] {
        let p = position(block, other);
        assert!(p > producer && p < consumer, "origin {} at {}", other, p);
    }
}

#[test]
fn branch_is_hoisted_over_its_delay_slots() {
    let state = compile(
        ".target v71
block a:
    fadd rf1, rf2, rf3 ; nop
    fadd rf4, rf5, rf6 ; nop
    fadd rf7, rf8, rf9 ; nop
    b b
block b:
    fadd rf10, rf11, rf12 ; nop
",
    );
    let s = schedule_of(&state);
    let a = &s.blocks[0];
    assert_eq!(a.branch_ip, Some(0));
    assert!(a.instructions[0].is_branch());
    assert_eq!(a.instructions.len(), 4);
    let branch = a.instructions[0].as_branch().expect("branch");
    // Target start minus the instruction after the delay slots, in bytes.
    assert_eq!(branch.offset, Some(0));
    assert_eq!(s.blocks[1].start_ip, 4);
    assert_eq!(s.blocks[1].end_ip, 7);
}

#[test]
fn last_thrsw_pair_and_program_end() {
    let state = compile(
        ".target v71
block main:
    fadd rf1, rf2, rf3 ; nop
    nop ; nop ; thrsw [last_thrsw]
    fadd rf4, rf5, rf6 ; nop
",
    );
    let insts = &schedule_of(&state).blocks[0].instructions;
    // The pair of switches marks the last one; the first rides on the fadd.
    assert!(insts[0].has_sig(Signals::THRSW));
    assert!(insts[0].origins.contains(&0));
    assert!(insts[1].has_sig(Signals::THRSW));
    let thrsw_count = insts.iter().filter(|i| i.has_sig(Signals::THRSW)).count();
    assert_eq!(thrsw_count, 3);
    assert!(insts.last().is_some_and(|i| !i.has_sig(Signals::THRSW)));
}

#[test]
fn uniform_stream_follows_issue_order() {
    let state = compile(
        ".target v71
.uniform const 10
.uniform const 20
block main:
    nop ; nop ; ldunifrf.rf1 [unif=0]
    nop ; nop ; ldunifrf.rf2 [unif=1]
    fadd rf3, rf1, rf2 ; nop
",
    );
    let s = schedule_of(&state);
    let indices: Vec<u32> = s.instructions().filter_map(|i| i.uniform).collect();
    assert_eq!(indices, vec![0, 1]);
    assert_eq!(s.uniforms.len(), 2);
    assert_eq!(s.uniforms[0].value, 10);
    assert_eq!(s.uniforms[1].value, 20);
}

#[test]
fn fall_through_blocks_keep_program_order() {
    let state = compile(
        ".target v42
block first:
    fadd rf1, rf2, rf3 ; nop
block second:
    fadd rf4, rf1, rf1 ; nop
",
    );
    let s = schedule_of(&state);
    assert_eq!(s.blocks.len(), 2);
    assert_eq!(s.blocks[0].start_ip, 0);
    assert_eq!(s.blocks[1].start_ip, s.blocks[0].end_ip + 1);
    // The program-end switch lands in the last block.
    assert!(s.blocks[0].instructions.iter().all(|i| !i.has_sig(Signals::THRSW)));
    assert!(s.blocks[1].instructions.iter().any(|i| i.has_sig(Signals::THRSW)));
}

#[test]
fn paired_ldvary_moves_up_one_instruction() {
    // The ldvary can't issue before the rf0 write, so it pairs into the
    // second bundle and is then moved up into the first.
    let state = compile(
        ".target v71 stage=fragment inputs=1
block main:
    fadd rf0, rf21, rf22 ; nop
    nop ; nop ; ldvary.rf10
    fadd rf23, rf30, rf22 ; nop
    fadd rf24, rf23, rf22 ; nop
    fadd rf25, rf24, rf22 ; nop
    nop ; fmul rf11, rf10, rf1
",
    );
    let s = schedule_of(&state);
    let insts = &s.blocks[0].instructions;
    assert!(insts[0].has_sig(Signals::LDVARY));
    assert_eq!(insts[0].origins, vec![0]);
    assert!(!insts[1].has_sig(Signals::LDVARY));
    // The reader of the varying joins the bundle the ldvary left.
    assert_eq!(sorted(insts[1].origins.clone()), vec![1, 2, 5]);
    assert_eq!(s.stats.merged, 2);
}

#[test]
fn uniform_loads_wait_behind_pending_varyings() {
    let source = |stage: &str| {
        format!(
            ".target v71 stage={} inputs=2
.uniform const 7
block main:
    nop ; nop ; ldunifrf.rf5 [unif=0]
    nop ; nop ; ldvary.rf10
    fadd rf6, rf5, rf10 ; nop
",
            stage
        )
    };

    let state = compile(&source("fragment"));
    let block = &schedule_of(&state).blocks[0];
    assert_eq!(position(block, 1), 0);
    // Only the uniform load is left while a varying is still expected, so
    // it issues anyway.
    assert_eq!(position(block, 0), 1);
    assert_eq!(position(block, 2), 2);

    let state = compile(&source("compute"));
    let block = &schedule_of(&state).blocks[0];
    assert_eq!(position(block, 0), 0);
    assert_eq!(position(block, 1), 1);
}

#[test]
fn ldunifa_waits_for_the_unifa_write() {
    let state = compile(
        ".target v71
block main:
    mov unifa, rf1 ; nop
    nop ; nop ; ldunifa
",
    );
    let block = &schedule_of(&state).blocks[0];
    assert_eq!(position(block, 0), 0);
    assert_eq!(position(block, 1), 4);
    assert!(block.instructions[1..4].iter().all(|i| i.origins.is_empty()));
}
