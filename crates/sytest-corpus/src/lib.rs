//! Corpus discovery and the golden oracle.
//!
//! A test case is a `*.sy` source with a sibling `<name>.out` golden fixture
//! (expected stdout plus exit status) and an optional `<name>.in` stdin
//! fixture.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

/// One discovered fixture. Immutable once materialized.
#[derive(Debug, Clone)]
pub struct TestCase {
    pub source: PathBuf,
    pub base_name: String,
    pub golden_path: PathBuf,
    pub stdin_path: Option<PathBuf>,
}

impl TestCase {
    pub fn from_source(source: PathBuf) -> Self {
        let base_name = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let golden_path = source.with_extension("out");
        let stdin_candidate = source.with_extension("in");
        let stdin_path = stdin_candidate.is_file().then_some(stdin_candidate);
        Self {
            source,
            base_name,
            golden_path,
            stdin_path,
        }
    }

    pub fn file_name(&self) -> String {
        self.source
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Enumerate cases under `root` whose root-relative path matches `pattern`,
/// skipping file names in `exclude_names`. The result is sorted
/// lexicographically by path so repeated runs visit cases in the same order.
pub fn discover(
    root: &Path,
    pattern: &str,
    exclude_names: &BTreeSet<String>,
) -> Result<Vec<TestCase>> {
    let include = compile_glob(pattern)?;

    let mut sources: Vec<PathBuf> = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.with_context(|| format!("walk corpus: {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if !include.is_match(rel) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if exclude_names.contains(&name) {
            continue;
        }
        sources.push(entry.into_path());
    }

    sources.sort();
    Ok(sources.into_iter().map(TestCase::from_source).collect())
}

fn compile_glob(pattern: &str) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    builder.add(Glob::new(pattern).with_context(|| format!("parse glob {pattern:?}"))?);
    builder.build().context("build globset")
}

/// The oracle for one case: pre-trimmed expected output plus stdin bytes.
#[derive(Debug, Clone)]
pub struct Golden {
    pub expected: String,
    pub stdin: Vec<u8>,
}

/// Read the golden pair for `case`. The caller is expected to have checked
/// `golden_path` exists (a missing oracle is a per-case verdict, not an
/// I/O failure); errors here mean the environment broke mid-run.
pub fn load_golden(case: &TestCase) -> Result<Golden> {
    let raw = std::fs::read_to_string(&case.golden_path)
        .with_context(|| format!("read golden fixture: {}", case.golden_path.display()))?;
    let stdin = match &case.stdin_path {
        Some(p) => {
            std::fs::read(p).with_context(|| format!("read stdin fixture: {}", p.display()))?
        }
        None => Vec::new(),
    };
    Ok(Golden {
        expected: normalize_expected(&raw),
        stdin,
    })
}

/// Canonical "observed behavior" string: trimmed stdout with the exit status
/// appended as a trailing line, trimmed again so empty stdout collapses to
/// just the status. Both the text a program prints and how it exits are part
/// of its observable contract (a runtime trap and a clean return must not
/// compare equal).
pub fn normalize_observed(stdout: &[u8], exit_status: i32) -> String {
    let text = String::from_utf8_lossy(stdout);
    format!("{}\n{}", text.trim(), exit_status)
        .trim()
        .to_string()
}

/// Golden fixtures already contain the status line; they only need the trim.
pub fn normalize_expected(text: &str) -> String {
    text.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;

    fn touch(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn corpus() -> tempfile::TempDir {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path();
        touch(&root.join("func_b/02_sub.sy"), "int main() {}");
        touch(&root.join("func_b/02_sub.out"), "0");
        touch(&root.join("func_a/01_add.sy"), "int main() {}");
        touch(&root.join("func_a/01_add.out"), "3\n0");
        touch(&root.join("func_a/01_add.in"), "1 2\n");
        touch(&root.join("func_a/notes.txt"), "not a test");
        touch(&root.join("perf/03_fft.sy"), "int main() {}");
        dir
    }

    #[test]
    fn discover_applies_glob_and_sorts() {
        let dir = corpus();
        let cases = discover(dir.path(), "**/func*/*.sy", &BTreeSet::new()).unwrap();
        let names: Vec<_> = cases.iter().map(|c| c.file_name()).collect();
        assert_eq!(names, ["01_add.sy", "02_sub.sy"]);
    }

    #[test]
    fn discover_wide_glob_reaches_all_subtrees() {
        let dir = corpus();
        let cases = discover(dir.path(), "**/*.sy", &BTreeSet::new()).unwrap();
        assert_eq!(cases.len(), 3);
    }

    #[test]
    fn discover_honors_exclusions() {
        let dir = corpus();
        let excluded = BTreeSet::from(["02_sub.sy".to_string()]);
        let cases = discover(dir.path(), "**/func*/*.sy", &excluded).unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].file_name(), "01_add.sy");
    }

    #[test]
    fn discover_missing_root_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(discover(&missing, "**/*.sy", &BTreeSet::new()).is_err());
    }

    #[test]
    fn case_resolves_sibling_fixtures() {
        let dir = corpus();
        let cases = discover(dir.path(), "**/func*/*.sy", &BTreeSet::new()).unwrap();

        let add = &cases[0];
        assert_eq!(add.base_name, "01_add");
        assert_eq!(add.golden_path, dir.path().join("func_a/01_add.out"));
        assert_eq!(add.stdin_path, Some(dir.path().join("func_a/01_add.in")));

        let sub = &cases[1];
        assert_eq!(sub.stdin_path, None);
    }

    #[test]
    fn load_golden_reads_expected_and_stdin() {
        let dir = corpus();
        let cases = discover(dir.path(), "**/func*/*.sy", &BTreeSet::new()).unwrap();

        let golden = load_golden(&cases[0]).unwrap();
        assert_eq!(golden.expected, "3\n0");
        assert_eq!(golden.stdin, b"1 2\n");

        let golden = load_golden(&cases[1]).unwrap();
        assert_eq!(golden.expected, "0");
        assert!(golden.stdin.is_empty());
    }

    #[test]
    fn normalize_appends_status_line() {
        assert_eq!(normalize_observed(b"3", 0), "3\n0");
        assert_eq!(normalize_observed(b"3\n", 0), "3\n0");
        assert_eq!(normalize_observed(b"  3  \n\n", 0), "3\n0");
    }

    #[test]
    fn normalize_empty_stdout_is_just_the_status() {
        assert_eq!(normalize_observed(b"", 0), "0");
        assert_eq!(normalize_observed(b"", 124), "124");
        assert_eq!(normalize_observed(b"", -1), "-1");
    }

    #[test]
    fn normalize_expected_trims_both_ends() {
        assert_eq!(normalize_expected("3\n0\n"), "3\n0");
        assert_eq!(normalize_expected("\n\n3\n0"), "3\n0");
    }
}
