use clap::Parser;
use std::io::Write;
use std::path::{Path, PathBuf};

use qpusched::device::{DeviceInfo, Generation};
use qpusched::pass::PassId;
use qpusched::pipeline::{self, CompilationState, PipelineOptions};
use qpusched::resolve::TargetOverrides;
use qpusched::schedule::SchedOptions;

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum EmitStage {
    Listing,
    Json,
    Dot,
    BuildInfo,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Target {
    V42,
    V71,
}

#[derive(Parser, Debug)]
#[command(
    name = "qpusched",
    version,
    about = "QPU instruction scheduler: list-schedules .qasm basic blocks into dual-issue bundles"
)]
struct Cli {
    /// Input .qasm source file
    source: PathBuf,

    /// Output file path (stdout when omitted)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Listing)]
    emit: EmitStage,

    /// Target generation, overriding the .target line
    #[arg(long, value_enum)]
    target: Option<Target>,

    /// Threads per QPU (1, 2 or 4), overriding the .target line
    #[arg(long)]
    threads: Option<u32>,

    /// JSON device description, overriding the .target line
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print the scheduler's per-tick trace to stderr
    #[arg(long)]
    debug: bool,

    /// Print phases and timing
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();
    let path = cli.source.display().to_string();

    if cli.verbose {
        eprintln!("qpusched: source = {}", path);
        eprintln!("qpusched: emit   = {:?}", cli.emit);
    }

    // ── Device overrides ──
    if let Some(t) = cli.threads {
        if !matches!(t, 1 | 2 | 4) {
            eprintln!("qpusched: error: --threads must be 1, 2 or 4 (got {})", t);
            std::process::exit(2);
        }
    }
    let device = cli.config.as_ref().map(|p| match load_device(p) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("qpusched: error: {}: {}", p.display(), e);
            std::process::exit(2);
        }
    });
    let overrides = TargetOverrides {
        device,
        generation: cli.target.map(|t| match t {
            Target::V42 => Generation::V42,
            Target::V71 => Generation::V71,
        }),
        threads: cli.threads,
    };

    // ── Read and parse source ──
    let source = match std::fs::read_to_string(&cli.source) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("qpusched: error: {}: {}", path, e);
            std::process::exit(2);
        }
    };

    let parse_result = qpusched::parser::parse(&source);
    if !parse_result.errors.is_empty() {
        for d in pipeline::parse_diagnostics(&parse_result.errors) {
            eprintln!("{}", d.render(&path, &source));
        }
        std::process::exit(1);
    }
    let Some(file) = parse_result.file else {
        eprintln!("qpusched: parse failed with no output");
        std::process::exit(1);
    };

    if cli.verbose {
        eprintln!("qpusched: parsed {} lines", file.lines.len());
    }

    // ── Passes ──
    let terminal = match cli.emit {
        EmitStage::Listing | EmitStage::Json => PassId::Verify,
        EmitStage::Dot | EmitStage::BuildInfo => PassId::Resolve,
    };
    let options = PipelineOptions {
        sched: SchedOptions { debug: cli.debug },
        verbose: cli.verbose,
    };
    let mut state = CompilationState::new(file, overrides);
    let result = pipeline::run_pipeline(&mut state, terminal, &options, |_, diags| {
        for d in diags {
            eprintln!("{}", d.render(&path, &source));
        }
    });

    if cli.debug {
        if let Some(trace) = &state.artifacts.trace {
            eprint!("{}", trace);
        }
    }
    if let Err(e) = result {
        if cli.verbose {
            eprintln!("qpusched: stopped after {:?}", e.failing_pass);
        }
        std::process::exit(1);
    }

    // ── Emit ──
    state.provenance = state
        .artifacts
        .program
        .as_ref()
        .map(|p| pipeline::compute_provenance(&source, &p.device));
    let output = match cli.emit {
        EmitStage::Listing => state.artifacts.schedule.as_ref().map(|s| s.to_string()),
        EmitStage::Json => match state.artifacts.schedule.as_ref().map(|s| s.to_json()) {
            Some(Ok(json)) => Some(json),
            Some(Err(e)) => {
                eprintln!("qpusched: error: JSON serialization failed: {}", e);
                std::process::exit(1);
            }
            None => None,
        },
        EmitStage::Dot => state.artifacts.program.as_ref().map(qpusched::dot::emit_dot),
        EmitStage::BuildInfo => state.provenance.as_ref().map(|p| p.to_json()),
    };
    let Some(output) = output else {
        eprintln!("qpusched: internal error: no output for {:?}", cli.emit);
        std::process::exit(1);
    };

    let written = match &cli.output {
        Some(p) => std::fs::write(p, &output),
        None => std::io::stdout().lock().write_all(output.as_bytes()),
    };
    if let Err(e) = written {
        eprintln!("qpusched: error: writing output: {}", e);
        std::process::exit(2);
    }
    if cli.verbose {
        if let Some(s) = &state.artifacts.schedule {
            eprintln!("qpusched: {}", s.stats);
        }
    }
}

fn load_device(path: &Path) -> Result<DeviceInfo, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&text).map_err(|e| e.to_string())
}
