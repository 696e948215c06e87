// Integration tests for the golden-file regression harness
mod utils;

use ppcrecomp_core::recompiler::harness::{emit_fixture, FixtureOutcome};
use ppcrecomp_core::{RegisterContext, RegressionHarness};
use std::path::Path;
use utils::*;

fn write_fixtures(dir: &Path) {
    std::fs::write(dir.join("branch.bin"), bytes(&if_then())).unwrap();
    std::fs::write(dir.join("straight.bin"), bytes(&straight_line())).unwrap();
    std::fs::write(dir.join("notes.txt"), "not a fixture").unwrap();
}

#[test]
fn test_bless_then_pass() {
    let fixtures = tempfile::tempdir().unwrap();
    let goldens = tempfile::tempdir().unwrap();
    write_fixtures(fixtures.path());

    let blessed = RegressionHarness::new(fixtures.path(), goldens.path(), RegisterContext::default_contract())
        .bless(true)
        .run()
        .unwrap();
    assert!(blessed.passed());
    assert_eq!(blessed.fixtures.len(), 2);
    assert!(blessed.fixtures.iter().all(|f| f.outcome == FixtureOutcome::Blessed));
    assert!(goldens.path().join("straight.cpp").exists());

    let report = RegressionHarness::new(fixtures.path(), goldens.path(), RegisterContext::default_contract())
        .run()
        .unwrap();
    assert!(report.passed(), "{}", report);
    assert_eq!(
        report.fixtures.iter().map(|f| f.name.as_str()).collect::<Vec<_>>(),
        vec!["branch", "straight"]
    );
}

#[test]
fn test_one_token_change_fails_only_that_fixture() {
    let fixtures = tempfile::tempdir().unwrap();
    let goldens = tempfile::tempdir().unwrap();
    write_fixtures(fixtures.path());
    let contract = RegisterContext::default_contract();

    let golden = emit_fixture(bytes(&straight_line()), &contract).unwrap();
    let altered = golden.replace("ctx.r5.u64;", "ctx.r6.u64;");
    assert_ne!(golden, altered);
    std::fs::write(goldens.path().join("straight.cpp"), &altered).unwrap();
    std::fs::write(
        goldens.path().join("branch.cpp"),
        emit_fixture(bytes(&if_then()), &contract).unwrap(),
    )
    .unwrap();

    let report = RegressionHarness::new(fixtures.path(), goldens.path(), contract)
        .run()
        .unwrap();
    assert!(!report.passed());
    assert_eq!(report.fixtures[0].outcome, FixtureOutcome::Passed);
    match &report.fixtures[1].outcome {
        FixtureOutcome::Mismatch(diff) => {
            assert!(diff.contains("-7: \tctx.r4.u64 = ctx.r4.u64 + ctx.r6.u64;"), "{}", diff);
            assert!(diff.contains("+7: \tctx.r4.u64 = ctx.r4.u64 + ctx.r5.u64;"), "{}", diff);
            assert_eq!(diff.lines().count(), 2);
        }
        other => panic!("expected a mismatch, got {:?}", other),
    }

    let summary = report.to_string();
    assert!(summary.contains("PASS branch"));
    assert!(summary.contains("FAIL straight"));
    assert!(summary.ends_with("2 fixture(s), 1 passed, 1 failed"));
}

#[test]
fn test_missing_golden_is_a_failure() {
    let fixtures = tempfile::tempdir().unwrap();
    let goldens = tempfile::tempdir().unwrap();
    std::fs::write(fixtures.path().join("straight.bin"), bytes(&straight_line())).unwrap();

    let report = RegressionHarness::new(fixtures.path(), goldens.path(), RegisterContext::default_contract())
        .run()
        .unwrap();
    assert!(!report.passed());
    assert_eq!(
        report.fixtures[0].outcome,
        FixtureOutcome::MissingGolden(goldens.path().join("straight.cpp"))
    );
}

#[test]
fn test_missing_fixture_directory_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = RegressionHarness::new(dir.path().join("absent"), dir.path(), RegisterContext::default_contract()).run();
    assert!(result.is_err());
}

#[test]
fn test_fixture_emission_is_address_ordered() {
    let contract = RegisterContext::default_contract();
    let text = emit_fixture(bytes(&[bl(0x1000, 0x1008), BLR, li(3, 1), BLR]), &contract).unwrap();
    let first = text.find("PPC_FUNC_IMPL(sub_00001000)").unwrap();
    let second = text.find("PPC_FUNC_IMPL(sub_00001008)").unwrap();
    assert!(first < second);
}
