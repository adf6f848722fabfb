use std::path::Path;

use anyhow::Result;
use clap::ValueEnum;
use serde::Serialize;

use crate::backend::BackendKind;
use crate::session::{Outcome, SessionRun, Stage, Verdict};

pub const REPORT_SCHEMA_VERSION: &str = "sytest.report@1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab_case")]
pub enum ReportFormat {
    Text,
    Json,
}

#[derive(Debug, Serialize)]
pub struct SessionReport {
    pub schema_version: &'static str,
    pub ok: bool,
    pub backend: BackendKind,
    pub corpus_root: String,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal: Option<String>,
    pub summary: VerdictSummary,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<CaseReport>,
}

#[derive(Debug, Default, Serialize)]
pub struct VerdictSummary {
    pub cases_total: usize,
    pub passed: usize,
    pub compile_errors: usize,
    pub mismatches: usize,
    pub timeouts: usize,
    pub missing_fixtures: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct CaseReport {
    pub source: String,
    pub verdict: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    pub duration_ms: u64,
}

impl SessionReport {
    pub fn from_run(
        backend: BackendKind,
        corpus_root: &Path,
        run: &SessionRun,
        duration_ms: u64,
    ) -> Self {
        let mut summary = VerdictSummary {
            cases_total: run.results.len(),
            duration_ms,
            ..VerdictSummary::default()
        };
        let mut failures = Vec::new();

        for result in &run.results {
            match &result.verdict {
                Verdict::Pass => summary.passed += 1,
                Verdict::CompileError { .. } => summary.compile_errors += 1,
                Verdict::RuntimeMismatch { .. } => summary.mismatches += 1,
                Verdict::Timeout { .. } => summary.timeouts += 1,
                Verdict::MissingFixture { .. } => summary.missing_fixtures += 1,
            }
            if !result.verdict.is_pass() {
                failures.push(case_report(result));
            }
        }

        let ok = run.outcome == Outcome::Completed && failures.is_empty();

        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            ok,
            backend,
            corpus_root: corpus_root.display().to_string(),
            outcome: run.outcome,
            fatal: run.fatal.clone(),
            summary,
            failures,
        }
    }
}

fn case_report(result: &crate::session::CaseResult) -> CaseReport {
    let mut report = CaseReport {
        source: result.source.display().to_string(),
        verdict: result.verdict.kind_str(),
        stage: None,
        detail: None,
        actual: None,
        expected: None,
        duration_ms: result.duration_ms,
    };
    match &result.verdict {
        Verdict::Pass => {}
        Verdict::CompileError { detail } => report.detail = Some(detail.clone()),
        Verdict::RuntimeMismatch { actual, expected } => {
            report.actual = Some(actual.clone());
            report.expected = Some(expected.clone());
        }
        Verdict::Timeout { stage } => report.stage = Some(*stage),
        Verdict::MissingFixture { path } => {
            report.detail = Some(format!("no golden fixture at {}", path.display()));
        }
    }
    report
}

pub fn emit(report: &SessionReport, format: ReportFormat) -> Result<()> {
    match format {
        ReportFormat::Json => {
            println!("{}", serde_json::to_string(report)?);
        }
        ReportFormat::Text => {
            for failure in &report.failures {
                match failure.stage {
                    Some(stage) => println!("{}\t{}\t({})", failure.verdict, failure.source, stage.as_str()),
                    None => println!("{}\t{}", failure.verdict, failure.source),
                }
                if let Some(detail) = &failure.detail {
                    print_block("detail", detail);
                }
                if let (Some(actual), Some(expected)) = (&failure.actual, &failure.expected) {
                    print_block("actual", actual);
                    print_block("expected", expected);
                }
            }
            let s = &report.summary;
            println!(
                "{} cases: {} passed, {} compile errors, {} mismatches, {} timeouts, {} missing fixtures ({} ms)",
                s.cases_total,
                s.passed,
                s.compile_errors,
                s.mismatches,
                s.timeouts,
                s.missing_fixtures,
                s.duration_ms
            );
            if let Some(fatal) = &report.fatal {
                println!("fatal: {fatal}");
            }
        }
    }
    Ok(())
}

fn print_block(label: &str, body: &str) {
    println!("  {label}: {{");
    for line in body.lines() {
        println!("    {line}");
    }
    println!("  }}");
}
