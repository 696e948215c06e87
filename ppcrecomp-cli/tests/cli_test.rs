// Tests for the ppcrecomp binary
use std::path::Path;
use std::process::Command;

const BLR: u32 = 0x4E80_0020;

fn ppcrecomp() -> Command {
    Command::new(env!("CARGO_BIN_EXE_ppcrecomp"))
}

fn write_words(path: &Path, words: &[u32]) {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
    std::fs::write(path, bytes).unwrap();
}

fn write_contract(dir: &Path) -> std::path::PathBuf {
    let contract = dir.join("ppc_context.h");
    std::fs::write(&contract, include_str!("../../ppcrecomp-core/resources/ppc_context.h")).unwrap();
    contract
}

#[test]
fn recompiles_a_raw_image() {
    let dir = tempfile::tempdir().unwrap();
    write_words(&dir.path().join("code.bin"), &[0x3860_0001, BLR]);
    let config = dir.path().join("recomp.json");
    std::fs::write(
        &config,
        r#"{ "image": "code.bin", "format": "raw", "base_address": "0x82000000", "out_directory": "out" }"#,
    )
    .unwrap();
    let contract = write_contract(dir.path());

    let output = ppcrecomp().arg(&config).arg(&contract).output().unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(String::from_utf8_lossy(&output.stdout).contains("1 function(s) emitted"));
    assert!(dir.path().join("out/ppc_start.cpp").exists());
}

#[test]
fn missing_image_fails_without_output() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("recomp.json");
    std::fs::write(
        &config,
        r#"{ "image": "absent.bin", "format": "raw", "base_address": 0, "out_directory": "out" }"#,
    )
    .unwrap();
    let contract = write_contract(dir.path());

    let output = ppcrecomp().arg(&config).arg(&contract).output().unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("absent.bin"));
    assert!(!dir.path().join("out").exists());
}

#[test]
fn harness_exit_code_follows_the_report() {
    let fixtures = tempfile::tempdir().unwrap();
    let goldens = tempfile::tempdir().unwrap();
    write_words(&fixtures.path().join("ret.bin"), &[BLR]);

    let missing = ppcrecomp().arg(fixtures.path()).arg(goldens.path()).output().unwrap();
    assert_eq!(missing.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&missing.stdout).contains("FAIL ret"));

    let blessed = ppcrecomp()
        .arg(fixtures.path())
        .arg(goldens.path())
        .arg("--bless")
        .output()
        .unwrap();
    assert!(blessed.status.success());

    let passed = ppcrecomp().arg(fixtures.path()).arg(goldens.path()).output().unwrap();
    assert!(passed.status.success());
    assert!(String::from_utf8_lossy(&passed.stdout).contains("PASS ret"));
}
