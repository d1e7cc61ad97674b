// pipeline.rs — Scheduler state and pass runner
//
// Holds every pass artifact and runs the minimal set of passes for a given
// terminal PassId: resolve, schedule, finalize, verify.
//
// Preconditions: the source file has been parsed into `state.file`.
// Postconditions: every artifact up to `terminal` is filled in, or has_error is set.
// Failure modes: any pass emitting error-level diagnostics; a failing
//   schedule cert becomes an E0300 error.
// Side effects: calls on_pass_complete after each pass for immediate display.

use std::time::{Duration, Instant};

use chumsky::error::Rich;
use chumsky::span::SimpleSpan;

use crate::ast::SourceFile;
use crate::device::DeviceInfo;
use crate::diag::{codes, no_span, DiagLevel, Diagnostic};
use crate::encoder::QpuEncoder;
use crate::lexer::Token;
use crate::pass::{descriptor, required_passes, PassId, StageCert};
use crate::program::{Program, ScheduledProgram};
use crate::resolve::TargetOverrides;
use crate::schedule::{SchedOptions, Trace};
use crate::verify::ScheduleCert;

// ── Artifact storage ───────────────────────────────────────────────────────

/// Pass outputs, filled in execution order.
#[derive(Debug, Default)]
pub struct Artifacts {
    pub program: Option<Program>,
    pub schedule: Option<ScheduledProgram>,
    pub trace: Option<Trace>,
    /// Set once branch offsets and uniforms have been written.
    pub finalized: bool,
    pub cert: Option<ScheduleCert>,
}

/// Provenance metadata for reproducible builds.
///
/// `source_hash`: SHA-256 of the raw `.qasm` source text.
/// `device_fingerprint`: SHA-256 of `DeviceInfo::canonical_json()`.
/// `scheduler_version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub source_hash: [u8; 32],
    pub device_fingerprint: [u8; 32],
    pub scheduler_version: &'static str,
}

impl Provenance {
    /// Hex string of the source hash (64 characters).
    pub fn source_hash_hex(&self) -> String {
        bytes_to_hex(&self.source_hash)
    }

    /// Hex string of the device fingerprint (64 characters).
    pub fn device_fingerprint_hex(&self) -> String {
        bytes_to_hex(&self.device_fingerprint)
    }

    /// `--emit build-info` output.
    pub fn to_json(&self) -> String {
        format!(
            "{{\n  \"source_hash\": \"{}\",\n  \"device_fingerprint\": \"{}\",\n  \"scheduler_version\": \"{}\"\n}}\n",
            self.source_hash_hex(),
            self.device_fingerprint_hex(),
            self.scheduler_version,
        )
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
    }
    s
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&hasher.finalize());
    hash
}

/// Compute provenance from source text and the effective device.
pub fn compute_provenance(source: &str, device: &DeviceInfo) -> Provenance {
    Provenance {
        source_hash: sha256(source.as_bytes()),
        device_fingerprint: sha256(device.canonical_json().as_bytes()),
        scheduler_version: env!("CARGO_PKG_VERSION"),
    }
}

/// Options shared by every pass.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptions {
    pub sched: SchedOptions,
    /// Print per-pass timing to stderr.
    pub verbose: bool,
}

/// Holds the parsed input, all artifacts and accumulated diagnostics.
pub struct CompilationState {
    pub file: SourceFile,
    pub overrides: TargetOverrides,
    pub artifacts: Artifacts,
    pub diagnostics: Vec<Diagnostic>,
    pub has_error: bool,
    pub provenance: Option<Provenance>,
}

impl CompilationState {
    pub fn new(file: SourceFile, overrides: TargetOverrides) -> Self {
        Self {
            file,
            overrides,
            artifacts: Artifacts::default(),
            diagnostics: Vec::new(),
            has_error: false,
            provenance: None,
        }
    }
}

// ── Parse errors ───────────────────────────────────────────────────────────

/// Turn parser errors into `E0001` diagnostics.
pub fn parse_diagnostics(errors: &[Rich<'static, Token, SimpleSpan>]) -> Vec<Diagnostic> {
    errors
        .iter()
        .map(|e| Diagnostic::error(codes::E0001, *e.span(), e.to_string()))
        .collect()
}

// ── Error type ─────────────────────────────────────────────────────────────

/// A pass reported an error; its diagnostics are in `CompilationState.diagnostics`.
#[derive(Debug)]
pub struct PipelineError {
    pub failing_pass: PassId,
}

fn has_error_diags(diags: &[Diagnostic]) -> bool {
    diags.iter().any(|d| d.level == DiagLevel::Error)
}

/// Report a pass's diagnostics and stop on the first error.
fn finish_pass(
    state: &mut CompilationState,
    pass_id: PassId,
    diags: Vec<Diagnostic>,
    elapsed: Duration,
    verbose: bool,
    on_pass_complete: &mut impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    on_pass_complete(pass_id, &diags);
    let is_err = has_error_diags(&diags);
    state.diagnostics.extend(diags);
    if verbose {
        eprintln!(
            "qpusched: {} complete, {:.1}ms",
            descriptor(pass_id).name,
            elapsed.as_secs_f64() * 1000.0
        );
    }
    if is_err {
        state.has_error = true;
        return Err(PipelineError {
            failing_pass: pass_id,
        });
    }
    Ok(())
}

/// Missing upstream artifact. Only reachable if `required_passes` and the
/// runner disagree.
fn missing(pass_id: PassId, what: &str) -> Vec<Diagnostic> {
    vec![Diagnostic::error(
        codes::E0300,
        no_span(),
        format!("{} ran without a {}", descriptor(pass_id).name, what),
    )]
}

// ── Pipeline runner ────────────────────────────────────────────────────────

/// Run `terminal` and every pass it depends on, in order.
///
/// `on_pass_complete` sees each pass's diagnostics before the next pass starts.
pub fn run_pipeline(
    state: &mut CompilationState,
    terminal: PassId,
    options: &PipelineOptions,
    mut on_pass_complete: impl FnMut(PassId, &[Diagnostic]),
) -> Result<(), PipelineError> {
    let verbose = options.verbose;
    for pass_id in required_passes(terminal) {
        let t = Instant::now();
        let diags = match pass_id {
            PassId::Resolve => {
                let result = crate::resolve::resolve(&state.file, &state.overrides);
                state.artifacts.program = Some(result.program);
                result.diagnostics
            }
            PassId::Schedule => match &state.artifacts.program {
                Some(program) => {
                    let result = crate::schedule::schedule(program, &options.sched);
                    state.artifacts.schedule = Some(result.schedule);
                    state.artifacts.trace = Some(result.trace);
                    result.diagnostics
                }
                None => missing(pass_id, "program"),
            },
            PassId::Finalize => match &mut state.artifacts.schedule {
                Some(schedule) => {
                    let encoder = QpuEncoder::new(schedule.device.caps());
                    let result = crate::finalize::set_branch_targets(schedule, &encoder);
                    state.artifacts.finalized = true;
                    result.diagnostics
                }
                None => missing(pass_id, "schedule"),
            },
            PassId::Verify => match (&state.artifacts.program, &state.artifacts.schedule) {
                (Some(program), Some(schedule)) => {
                    let cert = crate::verify::verify_schedule(program, schedule);
                    let mut diags = Vec::new();
                    if !cert.all_pass() {
                        diags.push(Diagnostic::error(
                            codes::E0300,
                            state.file.span,
                            format!("schedule verification failed: {}", cert.failed().join(", ")),
                        ));
                    }
                    state.artifacts.cert = Some(cert);
                    diags
                }
                _ => missing(pass_id, "finalized schedule"),
            },
        };
        finish_pass(
            state,
            pass_id,
            diags,
            t.elapsed(),
            verbose,
            &mut on_pass_complete,
        )?;
    }
    Ok(())
}
