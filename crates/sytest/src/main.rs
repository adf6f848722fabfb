use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::{Args, Parser};
use sytest_proc::RunLimits;
use sytest_vm::{JudgeConfig, ARTIFACT_FILE_NAME};

use backend::{BackendKind, Pipeline};
use report::{ReportFormat, SessionReport};
use session::{Outcome, Session};

mod backend;
mod report;
mod session;
mod single;

#[derive(Parser, Debug)]
#[command(name = "sytest")]
#[command(about = "Differential test harness for the SysY compiler toolchain.", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Run a golden-fixture corpus against one backend.
    Test(TestArgs),
    /// Compile and execute a single source file (debugging aid).
    Run(single::RunArgs),
    /// Time a single source file on the native judge.
    Perf(single::PerfArgs),
}

/// Tool locations and timeouts shared by every subcommand.
#[derive(Debug, Args)]
pub struct ToolchainArgs {
    /// Compiler binary.
    #[arg(long, value_name = "PATH", default_value = "build/compiler")]
    pub compiler: PathBuf,

    /// Local bytecode interpreter binary.
    #[arg(long, value_name = "PATH", default_value = "test/MiniVM/build/minivm")]
    pub vm: PathBuf,

    /// Artifact path for the local backends.
    #[arg(long, value_name = "PATH", default_value = "test/out.S")]
    pub artifact: PathBuf,

    /// Shared directory bind-mounted into the judge container.
    #[arg(long, value_name = "DIR", default_value = "test/docker_share")]
    pub share_dir: PathBuf,

    /// Judge container image.
    #[arg(long, value_name = "IMAGE", default_value = "riscv-dev-env")]
    pub image: String,

    /// Container runtime binary.
    #[arg(long, value_name = "BIN", default_value = "docker")]
    pub docker_bin: String,

    /// Invoke the container runtime through sudo (rootful daemons).
    #[arg(long)]
    pub sudo_docker: bool,

    /// Compiler wall limit, seconds.
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub compile_timeout_secs: u64,

    /// Interpreter wall limit, seconds.
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub exec_timeout_secs: u64,

    /// Judge container wall limit, seconds (containers start slowly).
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    pub judge_timeout_secs: u64,
}

impl ToolchainArgs {
    pub fn pipeline(&self, backend: BackendKind, timeit: bool) -> Pipeline {
        let judge = (backend == BackendKind::Riscv).then(|| JudgeConfig {
            docker_bin: self.docker_bin.clone(),
            sudo: self.sudo_docker,
            image: self.image.clone(),
            share_dir: self.share_dir.clone(),
            wall: Duration::from_secs(self.judge_timeout_secs),
            timeit,
        });
        // The native artifact must land inside the share the container
        // mounts; the executor reads it from there.
        let artifact = if backend == BackendKind::Riscv {
            self.share_dir.join(ARTIFACT_FILE_NAME)
        } else {
            self.artifact.clone()
        };
        Pipeline {
            backend,
            compiler: self.compiler.clone(),
            interpreter: self.vm.clone(),
            artifact,
            compile_limits: RunLimits::new(Duration::from_secs(self.compile_timeout_secs)),
            exec_limits: RunLimits::new(Duration::from_secs(self.exec_timeout_secs)),
            judge,
        }
    }
}

#[derive(Debug, Args)]
struct TestArgs {
    /// Backend pipeline to exercise.
    #[arg(long, value_enum)]
    backend: BackendKind,

    /// Corpus root directory.
    #[arg(long, value_name = "DIR", default_value = "testcases")]
    testcases: PathBuf,

    /// Override the backend's default inclusion glob.
    #[arg(long, value_name = "GLOB")]
    glob: Option<String>,

    /// Exclude an additional file name (repeatable).
    #[arg(long = "exclude", value_name = "NAME")]
    excludes: Vec<String>,

    /// Abort the whole session on the first compile error or mismatch.
    #[arg(long)]
    failfast: bool,

    /// Echo per-case progress and compiler chatter to stderr.
    #[arg(long)]
    verbose: bool,

    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    format: ReportFormat,

    #[command(flatten)]
    toolchain: ToolchainArgs,
}

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<ExitCode> {
    let cli = Cli::parse();
    match cli.command {
        Command::Test(args) => cmd_test(args),
        Command::Run(args) => single::cmd_run(args),
        Command::Perf(args) => single::cmd_perf(args),
    }
}

fn cmd_test(args: TestArgs) -> Result<ExitCode> {
    let glob = args
        .glob
        .as_deref()
        .unwrap_or_else(|| args.backend.default_glob());
    let exclude = exclusion_set(args.backend, &args.excludes);

    let cases = sytest_corpus::discover(&args.testcases, glob, &exclude)?;
    if cases.is_empty() {
        eprintln!(
            "no test cases under {} match {glob:?}",
            args.testcases.display()
        );
    }

    let started = Instant::now();
    let mut session = Session::new(
        args.toolchain.pipeline(args.backend, false),
        args.failfast,
        args.verbose,
    );
    let run = session.run(&cases);
    let report = SessionReport::from_run(
        args.backend,
        &args.testcases,
        &run,
        started.elapsed().as_millis() as u64,
    );
    report::emit(&report, args.format)?;

    Ok(match run.outcome {
        Outcome::Completed if report.ok => ExitCode::SUCCESS,
        Outcome::Completed => ExitCode::from(10),
        Outcome::AbortedOnMismatch => ExitCode::from(11),
        Outcome::AbortedOnFatalError => ExitCode::from(2),
    })
}

fn exclusion_set(backend: BackendKind, extra: &[String]) -> BTreeSet<String> {
    let mut exclude: BTreeSet<String> = backend
        .builtin_excludes()
        .iter()
        .map(|s| s.to_string())
        .collect();
    exclude.extend(extra.iter().cloned());
    exclude
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toolchain() -> ToolchainArgs {
        ToolchainArgs {
            compiler: PathBuf::from("build/compiler"),
            vm: PathBuf::from("test/MiniVM/build/minivm"),
            artifact: PathBuf::from("test/out.S"),
            share_dir: PathBuf::from("test/docker_share"),
            image: "riscv-dev-env".to_string(),
            docker_bin: "docker".to_string(),
            sudo_docker: false,
            compile_timeout_secs: 10,
            exec_timeout_secs: 10,
            judge_timeout_secs: 60,
        }
    }

    #[test]
    fn native_artifact_lands_in_the_judge_share() {
        let pipeline = toolchain().pipeline(BackendKind::Riscv, false);
        assert_eq!(pipeline.artifact, PathBuf::from("test/docker_share/out.S"));
        assert!(pipeline.judge.is_some());

        let pipeline = toolchain().pipeline(BackendKind::Tigger, false);
        assert_eq!(pipeline.artifact, PathBuf::from("test/out.S"));
        assert!(pipeline.judge.is_none());
    }

    #[test]
    fn judge_timeout_is_independent_of_interpreter_timeout() {
        let mut args = toolchain();
        args.exec_timeout_secs = 5;
        args.judge_timeout_secs = 120;
        let pipeline = args.pipeline(BackendKind::Riscv, false);
        assert_eq!(
            pipeline.judge.as_ref().unwrap().wall,
            Duration::from_secs(120)
        );
        assert_eq!(pipeline.exec_limits.wall, Duration::from_secs(5));
    }

    #[test]
    fn exclusions_merge_builtin_and_extra_names() {
        let extra = vec!["50_custom.sy".to_string()];
        let set = exclusion_set(BackendKind::Riscv, &extra);
        assert!(set.contains("92_matrix_add.sy"));
        assert!(set.contains("50_custom.sy"));

        let set = exclusion_set(BackendKind::Eeyore, &extra);
        assert!(!set.contains("92_matrix_add.sy"));
        assert!(set.contains("50_custom.sy"));
    }
}
