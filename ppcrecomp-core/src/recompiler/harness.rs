//! Golden-File Regression Harness
//!
//! Every `*.bin` in the fixture directory is a raw big-endian instruction
//! blob. It is loaded at [`FIXTURE_BASE_ADDRESS`] with the entry at the
//! base, analysed with default options, and all of its functions are
//! emitted in address order into one text. That text must match
//! `<golden_dir>/<stem>.cpp` byte for byte.
//!
//! Fixtures are independent: a failure in one never stops the others.
//! In bless mode the goldens are written instead of compared.

use crate::recompiler::analysis::{AnalysisOptions, Analyzer};
use crate::recompiler::codegen::CodeGenerator;
use crate::recompiler::contract::RegisterContext;
use crate::recompiler::error::RecompilerError;
use crate::recompiler::image::Image;
use std::fmt;
use std::path::{Path, PathBuf};

/// Load address of every fixture blob.
pub const FIXTURE_BASE_ADDRESS: u32 = 0x0000_1000;

/// Outcome of one fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixtureOutcome {
    Passed,
    /// Golden written in bless mode
    Blessed,
    /// Emitted text differs; holds the line diff
    Mismatch(String),
    MissingGolden(PathBuf),
    /// The fixture could not be read or emitted
    Error(String),
}

impl FixtureOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Passed | Self::Blessed)
    }
}

/// Result of one fixture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureResult {
    pub name: String,
    pub outcome: FixtureOutcome,
}

/// Results of a harness run, in fixture name order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarnessReport {
    pub fixtures: Vec<FixtureResult>,
}

impl HarnessReport {
    /// True only if every fixture passed (or was blessed).
    pub fn passed(&self) -> bool {
        self.fixtures.iter().all(|f| f.outcome.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &FixtureResult> {
        self.fixtures.iter().filter(|f| !f.outcome.is_success())
    }
}

impl fmt::Display for HarnessReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for fixture in &self.fixtures {
            match &fixture.outcome {
                FixtureOutcome::Passed => writeln!(f, "PASS {}", fixture.name)?,
                FixtureOutcome::Blessed => writeln!(f, "BLESS {}", fixture.name)?,
                FixtureOutcome::Mismatch(diff) => {
                    writeln!(f, "FAIL {}", fixture.name)?;
                    write!(f, "{}", diff)?;
                }
                FixtureOutcome::MissingGolden(path) => {
                    writeln!(f, "FAIL {}: missing golden {}", fixture.name, path.display())?
                }
                FixtureOutcome::Error(message) => writeln!(f, "FAIL {}: {}", fixture.name, message)?,
            }
        }
        let failed = self.failures().count();
        write!(
            f,
            "{} fixture(s), {} passed, {} failed",
            self.fixtures.len(),
            self.fixtures.len() - failed,
            failed
        )
    }
}

/// Drives analysis and emission over fixture blobs.
pub struct RegressionHarness {
    fixture_dir: PathBuf,
    golden_dir: PathBuf,
    contract: RegisterContext,
    bless: bool,
}

impl RegressionHarness {
    pub fn new(fixture_dir: impl Into<PathBuf>, golden_dir: impl Into<PathBuf>, contract: RegisterContext) -> Self {
        Self {
            fixture_dir: fixture_dir.into(),
            golden_dir: golden_dir.into(),
            contract,
            bless: false,
        }
    }

    /// Write goldens instead of comparing against them.
    pub fn bless(mut self, bless: bool) -> Self {
        self.bless = bless;
        self
    }

    /// Evaluate every fixture.
    ///
    /// # Errors
    /// Only if the fixture directory cannot be listed; per-fixture problems
    /// are reported as failed fixtures.
    pub fn run(&self) -> Result<HarnessReport, RecompilerError> {
        let entries = std::fs::read_dir(&self.fixture_dir).map_err(|e| RecompilerError::io(&self.fixture_dir, e))?;
        let mut fixtures: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "bin"))
            .collect();
        fixtures.sort();
        log::info!("Running {} fixture(s) from {}", fixtures.len(), self.fixture_dir.display());

        let mut report = HarnessReport::default();
        for path in fixtures {
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let outcome = self.evaluate(&name, &path);
            match &outcome {
                FixtureOutcome::Passed | FixtureOutcome::Blessed => log::debug!("{}: ok", name),
                _ => log::warn!("{}: failed", name),
            }
            report.fixtures.push(FixtureResult { name, outcome });
        }
        Ok(report)
    }

    fn evaluate(&self, name: &str, path: &Path) -> FixtureOutcome {
        let emitted = match std::fs::read(path) {
            Ok(bytes) => emit_fixture(bytes, &self.contract),
            Err(e) => Err(RecompilerError::io(path, e)),
        };
        let emitted = match emitted {
            Ok(text) => text,
            Err(e) => return FixtureOutcome::Error(e.to_string()),
        };

        let golden = self.golden_dir.join(format!("{}.cpp", name));
        if self.bless {
            let written = std::fs::create_dir_all(&self.golden_dir)
                .and_then(|_| std::fs::write(&golden, &emitted))
                .map_err(|e| RecompilerError::io(&golden, e));
            return match written {
                Ok(()) => FixtureOutcome::Blessed,
                Err(e) => FixtureOutcome::Error(e.to_string()),
            };
        }

        match std::fs::read_to_string(&golden) {
            Ok(expected) if expected == emitted => FixtureOutcome::Passed,
            Ok(expected) => FixtureOutcome::Mismatch(line_diff(&expected, &emitted)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FixtureOutcome::MissingGolden(golden),
            Err(e) => FixtureOutcome::Error(RecompilerError::io(&golden, e).to_string()),
        }
    }
}

/// Analyse a raw blob at [`FIXTURE_BASE_ADDRESS`] and emit all of its
/// functions in address order.
pub fn emit_fixture(bytes: Vec<u8>, contract: &RegisterContext) -> Result<String, RecompilerError> {
    let mut image = Image::from_raw(bytes, FIXTURE_BASE_ADDRESS);
    let options = AnalysisOptions::default();
    let analysis = Analyzer::new(&mut image, &options).run();
    let generator = CodeGenerator::new(contract, &image, &analysis);
    let units = generator.generate_all()?;
    Ok(units
        .iter()
        .map(|u| u.text.as_str())
        .collect::<Vec<_>>()
        .join("\n"))
}

/// Largest LCS table `line_diff` builds. Bigger changed regions are
/// reported as a block replacement.
const MAX_DIFF_CELLS: usize = 1 << 22;

/// Line diff of `expected` against `actual`: `-` lines only in the golden,
/// `+` lines only in the output. Matching leading and trailing lines are
/// skipped and the rest is aligned by longest common subsequence.
pub fn line_diff(expected: &str, actual: &str) -> String {
    let old: Vec<&str> = expected.lines().collect();
    let new: Vec<&str> = actual.lines().collect();

    let prefix = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    let old_changed = &old[prefix..old.len() - suffix];
    let new_changed = &new[prefix..new.len() - suffix];

    let mut diff = String::new();
    let cells = (old_changed.len() + 1).saturating_mul(new_changed.len() + 1);
    if cells > MAX_DIFF_CELLS {
        for (i, line) in old_changed.iter().enumerate() {
            diff.push_str(&format!("-{}: {}\n", prefix + i + 1, line));
        }
        for (j, line) in new_changed.iter().enumerate() {
            diff.push_str(&format!("+{}: {}\n", prefix + j + 1, line));
        }
    } else {
        lcs_diff(old_changed, new_changed, prefix, &mut diff);
    }
    if diff.is_empty() && expected != actual {
        // Only line endings or the trailing newline differ.
        diff.push_str("~ whitespace at line ends differs\n");
    }
    diff
}

/// LCS alignment of two changed regions starting `offset` lines in.
fn lcs_diff(old: &[&str], new: &[&str], offset: usize, diff: &mut String) {
    // lcs[i][j] = LCS length of old[i..] and new[j..]
    let mut lcs = vec![vec![0u32; new.len() + 1]; old.len() + 1];
    for i in (0..old.len()).rev() {
        for j in (0..new.len()).rev() {
            lcs[i][j] = if old[i] == new[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < old.len() || j < new.len() {
        if i < old.len() && j < new.len() && old[i] == new[j] {
            i += 1;
            j += 1;
        } else if j < new.len() && (i == old.len() || lcs[i][j + 1] > lcs[i + 1][j]) {
            diff.push_str(&format!("+{}: {}\n", offset + j + 1, new[j]));
            j += 1;
        } else {
            diff.push_str(&format!("-{}: {}\n", offset + i + 1, old[i]));
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_shows_the_changed_token() {
        let diff = line_diff("a\nctx.r3.u64 = 1;\nc\n", "a\nctx.r3.u64 = 2;\nc\n");
        assert_eq!(diff, "-2: ctx.r3.u64 = 1;\n+2: ctx.r3.u64 = 2;\n");
    }

    #[test]
    fn identical_text_has_no_diff() {
        assert!(line_diff("x\ny\n", "x\ny\n").is_empty());
    }

    #[test]
    fn lines_after_an_insertion_keep_their_numbers() {
        let diff = line_diff("a\nb\nc\n", "a\nx\nb\nc\n");
        assert_eq!(diff, "+2: x\n");
    }

    #[test]
    fn large_rewrite_is_reported_as_a_block() {
        let old: String = (0..3000).map(|i| format!("old {}\n", i)).collect();
        let new: String = (0..3000).map(|i| format!("new {}\n", i)).collect();
        let expected = format!("head\n{}tail\n", old);
        let actual = format!("head\n{}tail\n", new);

        let diff = line_diff(&expected, &actual);
        let lines: Vec<&str> = diff.lines().collect();
        assert_eq!(lines.len(), 6000);
        assert_eq!(lines[0], "-2: old 0");
        assert_eq!(lines[2999], "-3001: old 2999");
        assert_eq!(lines[3000], "+2: new 0");
        assert_eq!(lines[5999], "+3001: new 2999");
    }

    #[test]
    fn trailing_newline_is_reported() {
        assert!(!line_diff("x\n", "x").is_empty());
    }
}
