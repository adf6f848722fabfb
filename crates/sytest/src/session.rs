use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use sytest_corpus::{load_golden, normalize_observed, TestCase};
use sytest_proc::{Checked, TIMEOUT_STATUS};

use crate::backend::{BackendKind, Pipeline, LEXER_PASS_MARKER};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Compile,
    Execute,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Compile => "compile",
            Stage::Execute => "execute",
        }
    }
}

/// Per-case outcome. The aggregate report must keep the four non-pass kinds
/// apart so a timeout is never mistaken for a divergence or a compile
/// regression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    CompileError { detail: String },
    RuntimeMismatch { actual: String, expected: String },
    Timeout { stage: Stage },
    MissingFixture { path: PathBuf },
}

impl Verdict {
    pub fn kind_str(&self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::CompileError { .. } => "compile-error",
            Verdict::RuntimeMismatch { .. } => "runtime-mismatch",
            Verdict::Timeout { .. } => "timeout",
            Verdict::MissingFixture { .. } => "missing-fixture",
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }

    /// Fail-fast halts on genuine failures only; timeouts and missing
    /// fixtures never stop the suite.
    fn halts_failfast(&self) -> bool {
        matches!(
            self,
            Verdict::CompileError { .. } | Verdict::RuntimeMismatch { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Completed,
    AbortedOnMismatch,
    AbortedOnFatalError,
}

#[derive(Debug)]
pub struct CaseResult {
    pub source: PathBuf,
    pub verdict: Verdict,
    pub duration_ms: u64,
}

#[derive(Debug)]
pub struct SessionRun {
    pub outcome: Outcome,
    pub results: Vec<CaseResult>,
    /// Rendering of the error that ended the session, if it aborted on a
    /// broken environment.
    pub fatal: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Idle,
    Running,
    Completed,
    AbortedOnMismatch,
    AbortedOnFatalError,
}

/// Drives the corpus through one backend pipeline, case at a time, verdicts
/// in discovery order.
pub struct Session {
    pipeline: Pipeline,
    failfast: bool,
    verbose: bool,
    state: SessionState,
}

impl Session {
    pub fn new(pipeline: Pipeline, failfast: bool, verbose: bool) -> Self {
        Self {
            pipeline,
            failfast,
            verbose,
            state: SessionState::Idle,
        }
    }

    pub fn run(&mut self, cases: &[TestCase]) -> SessionRun {
        debug_assert_eq!(self.state, SessionState::Idle);
        self.state = SessionState::Running;
        let mut results = Vec::with_capacity(cases.len());

        for case in cases {
            if self.verbose {
                eprintln!("trying {}", case.source.display());
            }

            let started = Instant::now();
            let verdict = match self.run_case(case) {
                Ok(v) => v,
                Err(err) => {
                    self.state = SessionState::AbortedOnFatalError;
                    return SessionRun {
                        outcome: Outcome::AbortedOnFatalError,
                        results,
                        fatal: Some(format!("{err:#}")),
                    };
                }
            };

            let halt = self.failfast && verdict.halts_failfast();
            results.push(CaseResult {
                source: case.source.clone(),
                verdict,
                duration_ms: started.elapsed().as_millis() as u64,
            });

            if halt {
                // The failing stage's child has already been reaped; no
                // orphans survive the abort.
                self.state = SessionState::AbortedOnMismatch;
                return SessionRun {
                    outcome: Outcome::AbortedOnMismatch,
                    results,
                    fatal: None,
                };
            }
        }

        self.state = SessionState::Completed;
        SessionRun {
            outcome: Outcome::Completed,
            results,
            fatal: None,
        }
    }

    fn run_case(&self, case: &TestCase) -> Result<Verdict> {
        match self.pipeline.backend {
            BackendKind::Lexer => self.lexer_case(case),
            _ => self.executed_case(case),
        }
    }

    /// Lexer self-check: the compile stage's own stdout is the verdict
    /// input; there is no artifact and no executor.
    fn lexer_case(&self, case: &TestCase) -> Result<Verdict> {
        match self.pipeline.compile(&case.source)? {
            Checked::Failed {
                exit_status: TIMEOUT_STATUS,
                ..
            } => Ok(Verdict::Timeout {
                stage: Stage::Compile,
            }),
            Checked::Failed { detail, .. } => Ok(Verdict::CompileError { detail }),
            Checked::Clean(out) => {
                if out.trim_end().ends_with(LEXER_PASS_MARKER) {
                    Ok(Verdict::Pass)
                } else {
                    Ok(Verdict::RuntimeMismatch {
                        actual: normalize_observed(out.as_bytes(), 0),
                        expected: LEXER_PASS_MARKER.to_string(),
                    })
                }
            }
        }
    }

    fn executed_case(&self, case: &TestCase) -> Result<Verdict> {
        if !case.golden_path.is_file() {
            return Ok(Verdict::MissingFixture {
                path: case.golden_path.clone(),
            });
        }
        let golden = load_golden(case)?;

        let _slot = ArtifactSlot::acquire(self.pipeline.artifact.clone())?;

        match self.pipeline.compile(&case.source)? {
            Checked::Failed {
                exit_status: TIMEOUT_STATUS,
                ..
            } => return Ok(Verdict::Timeout {
                stage: Stage::Compile,
            }),
            Checked::Failed { detail, .. } => return Ok(Verdict::CompileError { detail }),
            Checked::Clean(out) => {
                if self.verbose && !out.trim().is_empty() {
                    eprintln!("compiler output: <<{}>>", out.trim());
                }
            }
        }

        let run_id = case.source.display().to_string();
        let out = self.pipeline.execute(&run_id, &golden.stdin)?;
        if out.timed_out {
            return Ok(Verdict::Timeout {
                stage: Stage::Execute,
            });
        }

        let actual = normalize_observed(&out.stdout, out.exit_status);
        if actual == golden.expected {
            Ok(Verdict::Pass)
        } else {
            Ok(Verdict::RuntimeMismatch {
                actual,
                expected: golden.expected,
            })
        }
    }
}

/// Exclusive ownership of the fixed artifact path for one in-flight case:
/// acquire deletes any stale file, drop deletes whatever this case produced,
/// on every exit path.
struct ArtifactSlot {
    path: PathBuf,
}

impl ArtifactSlot {
    fn acquire(path: PathBuf) -> Result<Self> {
        if path.is_file() {
            std::fs::remove_file(&path)
                .with_context(|| format!("remove stale artifact: {}", path.display()))?;
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create artifact dir: {}", parent.display()))?;
            }
        }
        Ok(Self { path })
    }
}

impl Drop for ArtifactSlot {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
