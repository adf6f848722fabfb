use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Result;
use clap::ValueEnum;
use serde::Serialize;
use sytest_proc::{run_checked, run_command, Checked, RunLimits, RunOutput};
use sytest_vm::JudgeConfig;

/// Success marker the compiler prints in lexer self-check mode.
pub const LEXER_PASS_MARKER: &str = "TEST PASSED!";

/// Fixtures whose routines pass more arguments than the target calling
/// convention's register budget allows. Register allocation and native
/// execution both reject them; this is a backend limitation, not a harness
/// defect.
pub const ARG_LIMIT_EXCLUDES: &[&str] = &[
    "92_matrix_add.sy",
    "93_matrix_sub.sy",
    "94_matrix_mul.sy",
    "95_matrix_tran.sy",
    "96_many_param_call.sy",
    "97_many_global_var.sy",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[clap(rename_all = "kebab_case")]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Compiler self-check: lex and parse only, no artifact, no executor.
    Lexer,
    /// Interpreter-level IR, run on the local bytecode interpreter.
    Eeyore,
    /// Register-allocated IR, run on the interpreter in `-t` mode.
    Tigger,
    /// RISC-V assembly, run on the sandboxed judge.
    Riscv,
}

impl BackendKind {
    /// The lexer walks everything; execution backends only the functional
    /// subtrees, which carry golden fixtures.
    pub fn default_glob(self) -> &'static str {
        match self {
            BackendKind::Lexer => "**/*.sy",
            _ => "**/func*/*.sy",
        }
    }

    pub fn builtin_excludes(self) -> &'static [&'static str] {
        match self {
            BackendKind::Tigger | BackendKind::Riscv => ARG_LIMIT_EXCLUDES,
            BackendKind::Lexer | BackendKind::Eeyore => &[],
        }
    }

    pub fn emits_artifact(self) -> bool {
        !matches!(self, BackendKind::Lexer)
    }

    fn compile_args(self, source: &Path, artifact: &Path) -> Vec<OsString> {
        match self {
            BackendKind::Lexer => vec![source.into()],
            BackendKind::Eeyore => vec![
                "-S".into(),
                "-e".into(),
                source.into(),
                "-o".into(),
                artifact.into(),
            ],
            BackendKind::Tigger => vec![
                "-S".into(),
                "-t".into(),
                source.into(),
                "-o".into(),
                artifact.into(),
            ],
            BackendKind::Riscv => {
                vec!["-S".into(), source.into(), "-o".into(), artifact.into()]
            }
        }
    }

    fn interpreter_args(self, artifact: &Path) -> Option<Vec<OsString>> {
        match self {
            BackendKind::Eeyore => Some(vec![artifact.into()]),
            BackendKind::Tigger => Some(vec!["-t".into(), artifact.into()]),
            BackendKind::Lexer | BackendKind::Riscv => None,
        }
    }
}

/// One backend's compile/execute recipe, bound to concrete tool paths and
/// timeouts for the duration of a session.
#[derive(Debug)]
pub struct Pipeline {
    pub backend: BackendKind,
    pub compiler: PathBuf,
    pub interpreter: PathBuf,
    /// Fixed artifact path; inside the judge share for the native backend.
    pub artifact: PathBuf,
    pub compile_limits: RunLimits,
    pub exec_limits: RunLimits,
    /// Present only for the native backend.
    pub judge: Option<JudgeConfig>,
}

impl Pipeline {
    /// Invoke the compiler for this backend. The reference compiler is an
    /// ASan build; leak reports on exit would pollute stdout and the exit
    /// status, so leak detection is off for harness runs.
    pub fn compile(&self, source: &Path) -> Result<Checked> {
        let mut cmd = Command::new(&self.compiler);
        cmd.env("ASAN_OPTIONS", "detect_leaks=0");
        for arg in self.backend.compile_args(source, &self.artifact) {
            cmd.arg(arg);
        }
        run_checked(cmd, b"", &self.compile_limits, &[])
    }

    /// Run the artifact on this backend's executor. `run_id` names the case
    /// for container identification; `stdin` is the case's stdin fixture.
    pub fn execute(&self, run_id: &str, stdin: &[u8]) -> Result<RunOutput> {
        match self.backend {
            BackendKind::Lexer => {
                anyhow::bail!("lexer backend has no execute stage")
            }
            BackendKind::Eeyore | BackendKind::Tigger => {
                let mut cmd = Command::new(&self.interpreter);
                let args = self
                    .backend
                    .interpreter_args(&self.artifact)
                    .unwrap_or_default();
                for arg in args {
                    cmd.arg(arg);
                }
                // The interpreter sometimes survives a direct kill; sweep it
                // by name as a fallback.
                let sweep_name = self
                    .interpreter
                    .file_name()
                    .map(|s| s.to_string_lossy().into_owned());
                let sweep: Vec<&str> = sweep_name.as_deref().into_iter().collect();
                run_command(cmd, stdin, &self.exec_limits, &sweep)
            }
            BackendKind::Riscv => {
                let judge = self
                    .judge
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("native backend without judge config"))?;
                judge.stage_stdin(stdin)?;
                judge.run(run_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn compile_flags_select_the_backend() {
        let src = Path::new("a.sy");
        let art = Path::new("out.S");
        assert_eq!(rendered(BackendKind::Lexer.compile_args(src, art)), ["a.sy"]);
        assert_eq!(
            rendered(BackendKind::Eeyore.compile_args(src, art)),
            ["-S", "-e", "a.sy", "-o", "out.S"]
        );
        assert_eq!(
            rendered(BackendKind::Tigger.compile_args(src, art)),
            ["-S", "-t", "a.sy", "-o", "out.S"]
        );
        assert_eq!(
            rendered(BackendKind::Riscv.compile_args(src, art)),
            ["-S", "a.sy", "-o", "out.S"]
        );
    }

    #[test]
    fn interpreter_dialect_flag_tracks_backend() {
        let art = Path::new("out.S");
        assert_eq!(
            rendered(BackendKind::Eeyore.interpreter_args(art).unwrap()),
            ["out.S"]
        );
        assert_eq!(
            rendered(BackendKind::Tigger.interpreter_args(art).unwrap()),
            ["-t", "out.S"]
        );
        assert!(BackendKind::Riscv.interpreter_args(art).is_none());
        assert!(BackendKind::Lexer.interpreter_args(art).is_none());
    }

    #[test]
    fn register_budget_excludes_cover_tigger_and_riscv_only() {
        assert!(BackendKind::Lexer.builtin_excludes().is_empty());
        assert!(BackendKind::Eeyore.builtin_excludes().is_empty());
        assert_eq!(BackendKind::Tigger.builtin_excludes(), ARG_LIMIT_EXCLUDES);
        assert_eq!(BackendKind::Riscv.builtin_excludes(), ARG_LIMIT_EXCLUDES);
        assert!(ARG_LIMIT_EXCLUDES.contains(&"96_many_param_call.sy"));
    }

    #[test]
    fn lexer_walks_the_whole_corpus() {
        assert_eq!(BackendKind::Lexer.default_glob(), "**/*.sy");
        assert_eq!(BackendKind::Eeyore.default_glob(), "**/func*/*.sy");
        assert!(!BackendKind::Lexer.emits_artifact());
        assert!(BackendKind::Riscv.emits_artifact());
    }
}
