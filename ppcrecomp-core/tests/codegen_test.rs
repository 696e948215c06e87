// Integration tests for C++ emission
mod utils;

use ppcrecomp_core::recompiler::codegen::CodeGenerator;
use ppcrecomp_core::recompiler::validator::CodeValidator;
use ppcrecomp_core::{RecompilerError, RegisterContext};
use rayon::prelude::*;
use utils::*;

fn emit(words: &[u32]) -> Vec<ppcrecomp_core::recompiler::codegen::SourceUnit> {
    let contract = RegisterContext::default_contract();
    let mut image = raw_image(words);
    let analysis = analyse(&mut image);
    let units = CodeGenerator::new(&contract, &image, &analysis).generate_all().unwrap();
    for unit in &units {
        CodeValidator::validate_source(unit).unwrap();
    }
    units
}

#[test]
fn test_straight_line_function() {
    let units = emit(&straight_line());
    assert_eq!(units.len(), 1);
    let expected = "\
// sub_00001000 @ 0x00001000, 16 bytes, discovered by entry point
PPC_FUNC_IMPL(sub_00001000) {
\tPPC_FUNC_PROLOGUE();
\t// lwz r4,0(r3)
\tctx.r4.u64 = PPC_LOAD_U32(ctx.r3.u32);
\t// add r4,r4,r5
\tctx.r4.u64 = ctx.r4.u64 + ctx.r5.u64;
\t// stw r4,4(r3)
\tPPC_STORE_U32(ctx.r3.u32 + 4, ctx.r4.u32);
\t// blr
\treturn;
}
";
    assert_eq!(units[0].text, expected);
    assert_eq!(units[0].name, "sub_00001000");
    assert_eq!(units[0].address, BASE);
}

#[test]
fn test_conditional_branch_becomes_goto() {
    let units = emit(&single_branch());
    let text = &units[0].text;
    assert!(text.contains("\tctx.r4.s64 = 0;\n"), "{}", text);
    assert!(text.contains("\tctx.cr0.eq = ctx.r3.s32 == 0;\n"), "{}", text);
    assert!(text.contains("\tctx.cr0.so = ctx.xer.so;\n"), "{}", text);
    assert!(text.contains("\tif (ctx.cr0.eq) goto loc_0000100C;\n"), "{}", text);
    assert!(text.contains("\nloc_0000100C:\n"), "{}", text);
    assert_eq!(text.matches("loc_").count(), 2);
}

#[test]
fn test_negated_condition_and_fallthrough() {
    let units = emit(&if_then());
    let text = &units[0].text;
    let branch = text.find("\tif (!ctx.cr0.eq) goto loc_0000100C;\n").unwrap();
    let then = text.find("\tctx.r3.s64 = 1;\n").unwrap();
    let label = text.find("loc_0000100C:\n").unwrap();
    assert!(branch < then && then < label, "{}", text);
    // The fallthrough block is not a branch target.
    assert!(!text.contains("loc_00001008:"));
}

#[test]
fn test_jump_table_becomes_switch() {
    let units = emit(&switch_table());
    assert_eq!(units.len(), 1);
    let text = &units[0].text;
    assert!(text.contains("\tif (ctx.cr0.gt) goto loc_00001040;\n"), "{}", text);
    assert!(text.contains("\tswitch (ctx.r3.u32) {\n"), "{}", text);
    for (case, target) in [0x1030, 0x1034, 0x1038, 0x103C].iter().enumerate() {
        assert!(text.contains(&format!("\tcase {}:\n\t\tgoto loc_{:08X};\n", case, target)), "{}", text);
        assert!(text.contains(&format!("\nloc_{:08X}:\n", target)), "{}", text);
    }
    assert!(text.contains("\tdefault:\n\t\tPPC_UNREACHABLE();\n"), "{}", text);
    assert!(text.contains("\t// jump table data, 4 entries\n"), "{}", text);
    assert!(text.contains("// note: "), "recovery evidence is recorded: {}", text);
}

#[test]
fn test_in_place_scale_switches_on_ctr() {
    let units = emit(&in_place_switch_table());
    let text = &units[0].text;
    assert!(text.contains("\tctx.ctr.u64 = ctx.r3.u64;\n"), "{}", text);
    assert!(text.contains("\tswitch (ctx.ctr.u32) {\n"), "{}", text);
    assert!(!text.contains("switch (ctx.r3.u32)"), "{}", text);
    for target in [0x1030, 0x1034, 0x1038, 0x103C] {
        assert!(
            text.contains(&format!("\tcase 0x{:08X}:\n\t\tgoto loc_{:08X};\n", target, target)),
            "{}",
            text
        );
    }
    assert!(text.contains("\tdefault:\n\t\tPPC_UNREACHABLE();\n"), "{}", text);
}

#[test]
fn test_offset_table_switches_on_the_index() {
    let units = emit(&relative_switch_table());
    let text = &units[0].text;
    assert!(text.contains("\tswitch (ctx.r3.u32) {\n"), "{}", text);
    for (case, target) in [0x1040, 0x103C, 0x1038, 0x1034].iter().enumerate() {
        assert!(text.contains(&format!("\tcase {}:\n\t\tgoto loc_{:08X};\n", case, target)), "{}", text);
    }
}

#[test]
fn test_calls_use_emitted_names() {
    let units = emit(&[
        bl(0x1000, 0x1008), // 0x1000
        BLR,                // 0x1004
        li(3, 1),           // 0x1008
        BLR,                // 0x100C
    ]);
    assert_eq!(units.len(), 2);
    let caller = &units[0].text;
    assert!(caller.contains("\tctx.lr.u64 = 0x00001004;\n\tsub_00001008(ctx, base);\n"), "{}", caller);
    assert!(units[1].text.contains("discovered by call"));
}

#[test]
fn test_unresolved_dispatch_uses_runtime_lookup() {
    let units = emit(&unresolved_dispatch());
    let text = &units[0].text;
    assert!(text.contains("\tctx.ctr.u64 = ctx.r12.u64;\n"), "{}", text);
    assert!(text.contains("\tPPC_CALL_INDIRECT_FUNC(ctx.ctr.u32);\n\treturn;\n"), "{}", text);
}

#[test]
fn test_missing_helper_is_an_emit_error() {
    let source: String = RegisterContext::default_contract()
        .source()
        .lines()
        .filter(|line| !line.contains("#define PPC_LOAD_U32"))
        .map(|line| format!("{}\n", line))
        .collect();
    let contract = RegisterContext::parse(&source);
    let mut image = raw_image(&straight_line());
    let analysis = analyse(&mut image);

    let err = CodeGenerator::new(&contract, &image, &analysis).generate_all().unwrap_err();
    match err {
        RecompilerError::Emit { function, address, message, .. } => {
            assert_eq!(function, "sub_00001000");
            assert_eq!(address, BASE);
            assert!(message.contains("PPC_LOAD_U32"), "{}", message);
        }
        other => panic!("expected an emit error, got {:?}", other),
    }
}

#[test]
fn test_parallel_emission_matches_sequential() {
    let mut words = switch_table();
    // Trailing routines reached through calls from the first.
    let last = words.len() - 1;
    words[last] = bl(0x1040, 0x1048);
    words.extend([
        BLR,                // 0x1044
        li(3, 7),           // 0x1048
        bl(0x104C, 0x1054), // 0x104C
        BLR,                // 0x1050
        lwz(4, 3, 0),       // 0x1054
        BLR,                // 0x1058
    ]);

    let contract = RegisterContext::default_contract();
    let mut image = raw_image(&words);
    let analysis = analyse(&mut image);
    let generator = CodeGenerator::new(&contract, &image, &analysis);

    let sequential = generator.generate_all().unwrap();
    let functions: Vec<_> = analysis.functions.values().collect();
    let mut parallel: Vec<_> = functions
        .par_iter()
        .map(|f| generator.generate_function(f))
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    parallel.sort_by_key(|u| u.address);

    assert_eq!(sequential.len(), 3);
    assert_eq!(sequential, parallel);
}

#[test]
fn test_shared_header_and_mapping() {
    let contract = RegisterContext::default_contract();
    let mut image = raw_image(&[bl(0x1000, 0x1008), BLR, li(3, 1), BLR]);
    let analysis = analyse(&mut image);
    let generator = CodeGenerator::new(&contract, &image, &analysis);

    let header = generator.shared_header().unwrap();
    assert!(header.starts_with("#pragma once\n"));
    assert!(header.contains("PPC_EXTERN_FUNC(sub_00001000);\nPPC_EXTERN_FUNC(sub_00001008);\n"));

    let mapping = generator.function_mapping().unwrap();
    assert!(mapping.contains("\t{ 0x00001000, sub_00001000 },\n\t{ 0x00001008, sub_00001008 },\n"));
    assert!(mapping.ends_with("\t{ 0, nullptr }\n};\n"));
}
