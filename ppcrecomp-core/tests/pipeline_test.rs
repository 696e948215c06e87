// End-to-end tests for the recompilation pipeline
mod utils;

use ppcrecomp_core::recompiler::pipeline::{NoProgress, Progress, ProgressSink};
use ppcrecomp_core::{RecompilationPipeline, RecompilerConfig, RegisterContext};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use utils::*;

fn config(dir: &Path, words: &[u32], out: &str, extra: &str) -> RecompilerConfig {
    let image = dir.join("code.bin");
    std::fs::write(&image, bytes(words)).unwrap();
    let text = raw_config(&image, &dir.join(out), extra);
    RecompilerConfig::from_json_str(&text, dir).unwrap()
}

/// Every file in `dir` by name.
fn artifacts(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let path = entry.unwrap().path();
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            (name, std::fs::read(&path).unwrap())
        })
        .collect()
}

fn read(dir: &Path, name: &str) -> String {
    std::fs::read_to_string(dir.join(name)).unwrap()
}

/// Caller at the entry and a callee whose `bctr` cannot be resolved.
fn caller_and_dispatcher() -> Vec<u32> {
    let mut words = vec![bl(0x1000, 0x1008), BLR];
    words.extend(unresolved_dispatch());
    words
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl ProgressSink for Recorder {
    fn report(&self, event: Progress<'_>) {
        let text = match event {
            Progress::Stage(stage) => format!("stage {}", stage),
            Progress::EmitStarted(count) => format!("start {}", count),
            Progress::FunctionEmitted(name) => format!("emitted {}", name),
            Progress::EmitFinished => "finished".to_string(),
        };
        self.events.lock().unwrap().push(text);
    }
}

#[test]
fn test_entry_function_is_ppc_start() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), &switch_table(), "out", "");
    let stats = RecompilationPipeline::recompile(&config, &RegisterContext::default_contract(), &NoProgress).unwrap();

    assert_eq!(stats.total_functions, 1);
    assert_eq!(stats.emitted_functions, 1);
    assert_eq!(stats.jump_tables, 1);
    assert_eq!(stats.unresolved_branches, 0);
    assert_eq!(stats.artifacts_written, 4);

    let out = dir.path().join("out");
    let names: Vec<String> = artifacts(&out).into_keys().collect();
    assert_eq!(
        names,
        vec!["ppc_context.h", "ppc_func_mapping.cpp", "ppc_recomp_shared.h", "ppc_start.cpp"]
    );
    let routine = read(&out, "ppc_start.cpp");
    assert!(routine.starts_with("#include \"ppc_recomp_shared.h\"\n\n// ppc_start @ 0x00001000"));
    assert!(routine.contains("PPC_FUNC_IMPL(ppc_start) {"));
    assert!(read(&out, "ppc_func_mapping.cpp").contains("\t{ 0x00001000, ppc_start },\n"));
    assert!(read(&out, "ppc_recomp_shared.h").contains("PPC_EXTERN_FUNC(ppc_start);"));
    assert_eq!(read(&out, "ppc_context.h"), RegisterContext::default_contract().source());
}

#[test]
fn test_output_is_byte_identical_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let words = [
        lwz(4, 3, 0),       // 0x1000
        bl(0x1004, 0x1010), // 0x1004
        stw(4, 3, 4),       // 0x1008
        BLR,                // 0x100C
        cmpwi(0, 3, 0),     // 0x1010
        bne(0x1014, 0x101C),
        li(3, 1),
        BLR,                // 0x101C
    ];

    let contract = RegisterContext::default_contract();
    let parallel = config(dir.path(), &words, "parallel", "");
    let sequential = config(dir.path(), &words, "sequential", r#", "parallel": false"#);
    RecompilationPipeline::recompile(&parallel, &contract, &NoProgress).unwrap();
    RecompilationPipeline::recompile(&sequential, &contract, &NoProgress).unwrap();
    let first = artifacts(&dir.path().join("parallel"));
    assert_eq!(first, artifacts(&dir.path().join("sequential")));

    // A second run over an existing directory rewrites the same bytes.
    RecompilationPipeline::recompile(&parallel, &contract, &NoProgress).unwrap();
    assert_eq!(first, artifacts(&dir.path().join("parallel")));
    assert!(first.contains_key("ppc_start.cpp"));
    assert!(first.contains_key("sub_00001010.cpp"));
}

#[test]
fn test_missing_image_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let text = raw_config(&dir.path().join("missing.bin"), &dir.path().join("out"), "");
    let config = RecompilerConfig::from_json_str(&text, dir.path()).unwrap();

    let err = RecompilationPipeline::recompile(&config, &RegisterContext::default_contract(), &NoProgress).unwrap_err();
    assert!(format!("{:#}", err).contains("missing.bin"));
    assert!(!dir.path().join("out").exists());
}

#[test]
fn test_emit_error_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), &straight_line(), "out", "");
    let source: String = RegisterContext::default_contract()
        .source()
        .lines()
        .filter(|line| !line.contains("#define PPC_STORE_U32"))
        .map(|line| format!("{}\n", line))
        .collect();

    let err = RecompilationPipeline::recompile(&config, &RegisterContext::parse(&source), &NoProgress).unwrap_err();
    assert!(format!("{:#}", err).contains("PPC_STORE_U32"));
    assert!(!dir.path().join("out").exists());
}

#[test]
fn test_fallback_policy_dispatches_at_runtime() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), &caller_and_dispatcher(), "out", "");
    let stats = RecompilationPipeline::recompile(&config, &RegisterContext::default_contract(), &NoProgress).unwrap();

    assert_eq!(stats.emitted_functions, 2);
    assert_eq!(stats.skipped_functions, 0);
    assert_eq!(stats.unresolved_branches, 1);
    let out = dir.path().join("out");
    assert!(read(&out, "ppc_start.cpp").contains("\tsub_00001008(ctx, base);\n"));
    assert!(read(&out, "sub_00001008.cpp").contains("PPC_CALL_INDIRECT_FUNC(ctx.ctr.u32);"));
}

#[test]
fn test_skip_policy_omits_the_function() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), &caller_and_dispatcher(), "out", r#", "unresolved_dispatch": "skip""#);
    let stats = RecompilationPipeline::recompile(&config, &RegisterContext::default_contract(), &NoProgress).unwrap();

    assert_eq!(stats.total_functions, 2);
    assert_eq!(stats.emitted_functions, 1);
    assert_eq!(stats.skipped_functions, 1);
    let out = dir.path().join("out");
    assert!(!out.join("sub_00001008.cpp").exists());
    assert!(read(&out, "ppc_start.cpp").contains("\tPPC_CALL_INDIRECT_FUNC(0x00001008);\n"));
    assert!(!read(&out, "ppc_func_mapping.cpp").contains("0x00001008"));
}

#[test]
fn test_progress_reports_every_routine() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), &caller_and_dispatcher(), "out", "");
    let recorder = Recorder::default();
    RecompilationPipeline::recompile(&config, &RegisterContext::default_contract(), &recorder).unwrap();

    let events = recorder.events.into_inner().unwrap();
    assert_eq!(events.first().map(String::as_str), Some("stage Loading image"));
    assert!(events.contains(&"start 2".to_string()));
    assert_eq!(events.iter().filter(|e| e.starts_with("emitted ")).count(), 2);
    assert!(events.contains(&"emitted ppc_start".to_string()));
    let finished = events.iter().position(|e| e == "finished").unwrap();
    let writing = events.iter().position(|e| e == "stage Writing output").unwrap();
    assert!(finished < writing);
}

#[test]
fn test_reserved_symbol_name_keeps_support_files_intact() {
    let dir = tempfile::tempdir().unwrap();
    let words = [bl(0x1000, 0x1008), BLR, li(3, 1), BLR];
    let hint = r#", "functions": [{ "address": "0x1008", "name": "ppc_func_mapping" }]"#;
    let config = config(dir.path(), &words, "out", hint);
    RecompilationPipeline::recompile(&config, &RegisterContext::default_contract(), &NoProgress).unwrap();

    let out = dir.path().join("out");
    assert!(read(&out, "ppc_func_mapping_.cpp").contains("PPC_FUNC_IMPL(ppc_func_mapping_) {"));
    let mapping = read(&out, "ppc_func_mapping.cpp");
    assert!(mapping.contains("PPCFuncMapping PPCFuncMappings[] = {"), "{}", mapping);
    assert!(mapping.contains("\t{ 0x00001008, ppc_func_mapping_ },\n"), "{}", mapping);
}
