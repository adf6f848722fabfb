//! One-off runs outside the verdict machinery: `run` compiles and executes
//! a single source for inspection, `perf` times it on the native judge.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Args;
use sytest_corpus::{normalize_observed, TestCase};
use sytest_proc::Checked;

use crate::backend::{BackendKind, Pipeline, LEXER_PASS_MARKER};
use crate::ToolchainArgs;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Source file to compile and execute.
    #[arg(value_name = "SOURCE")]
    pub source: PathBuf,

    /// Backend pipeline.
    #[arg(long, value_enum, default_value_t = BackendKind::Eeyore)]
    pub backend: BackendKind,

    /// Stdin for the program; defaults to the source's `.in` sibling.
    #[arg(long, value_name = "PATH")]
    pub stdin: Option<PathBuf>,

    #[command(flatten)]
    pub toolchain: ToolchainArgs,
}

#[derive(Debug, Args)]
pub struct PerfArgs {
    /// Source file to time on the native judge.
    #[arg(value_name = "SOURCE")]
    pub source: PathBuf,

    /// Stdin for the program; defaults to the source's `.in` sibling.
    #[arg(long, value_name = "PATH")]
    pub stdin: Option<PathBuf>,

    #[command(flatten)]
    pub toolchain: ToolchainArgs,
}

pub fn cmd_run(args: RunArgs) -> Result<ExitCode> {
    let pipeline = args.toolchain.pipeline(args.backend, false);
    let case = TestCase::from_source(args.source.clone());

    if args.backend == BackendKind::Lexer {
        return match pipeline.compile(&case.source)? {
            Checked::Failed { detail, .. } => {
                eprintln!("compile failed:\n{detail}");
                Ok(ExitCode::from(10))
            }
            Checked::Clean(out) => {
                print!("{out}");
                if out.trim_end().ends_with(LEXER_PASS_MARKER) {
                    Ok(ExitCode::SUCCESS)
                } else {
                    Ok(ExitCode::from(10))
                }
            }
        };
    }

    let stdin = read_stdin_fixture(args.stdin.as_ref(), &case)?;
    clear_stale_artifact(&pipeline)?;

    match pipeline.compile(&case.source)? {
        Checked::Failed { detail, .. } => {
            eprintln!("compile failed:\n{detail}");
            return Ok(ExitCode::from(10));
        }
        Checked::Clean(out) => {
            if !out.trim().is_empty() {
                eprintln!("compiler output: <<{}>>", out.trim());
            }
        }
    }

    let out = pipeline.execute(&case.source.display().to_string(), &stdin)?;
    if !out.stderr.is_empty() {
        eprint!("{}", out.stderr_lossy());
    }
    println!("{}", normalize_observed(&out.stdout, out.exit_status));
    Ok(ExitCode::SUCCESS)
}

pub fn cmd_perf(args: PerfArgs) -> Result<ExitCode> {
    let pipeline = args.toolchain.pipeline(BackendKind::Riscv, true);
    let case = TestCase::from_source(args.source.clone());
    let stdin = read_stdin_fixture(args.stdin.as_ref(), &case)?;

    clear_stale_artifact(&pipeline)?;

    match pipeline.compile(&case.source)? {
        Checked::Failed { detail, .. } => {
            eprintln!("compile failed:\n{detail}");
            return Ok(ExitCode::from(10));
        }
        Checked::Clean(out) => {
            if !out.trim().is_empty() {
                eprintln!("compiler output: <<{}>>", out.trim());
            }
        }
    }

    let started = Instant::now();
    let out = pipeline.execute(&case.source.display().to_string(), &stdin)?;
    let elapsed = started.elapsed();

    println!("{}", normalize_observed(&out.stdout, out.exit_status));
    println!("TIME: {:.1}", elapsed.as_secs_f64());
    Ok(ExitCode::SUCCESS)
}

fn read_stdin_fixture(override_path: Option<&PathBuf>, case: &TestCase) -> Result<Vec<u8>> {
    match override_path.or(case.stdin_path.as_ref()) {
        Some(p) => std::fs::read(p).with_context(|| format!("read stdin fixture: {}", p.display())),
        None => Ok(Vec::new()),
    }
}

/// The artifact path must never carry a previous run's output into a new
/// compile; unlike the session, a one-off run leaves the fresh artifact on
/// disk afterwards for inspection.
fn clear_stale_artifact(pipeline: &Pipeline) -> Result<()> {
    if !pipeline.backend.emits_artifact() {
        return Ok(());
    }
    let path = &pipeline.artifact;
    if path.is_file() {
        std::fs::remove_file(path)
            .with_context(|| format!("remove stale artifact: {}", path.display()))?;
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create artifact dir: {}", parent.display()))?;
        }
    }
    Ok(())
}
