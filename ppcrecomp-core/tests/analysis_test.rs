// Integration tests for function discovery, CFG construction and jump-table recovery
mod utils;

use ppcrecomp_core::recompiler::analysis::{
    AnalysisOptions, Analyzer, CaseSelector, DiscoveryReason, Edge, EdgeKind, EdgeTarget, TableKind,
};
use ppcrecomp_core::recompiler::config::{Address, AddressRange, JumpTableHint};
use ppcrecomp_core::recompiler::image::{Image, Permissions, Section, SymbolKind, SymbolTable};
use ppcrecomp_core::recompiler::validator::CodeValidator;
use utils::*;

#[test]
fn test_blocks_partition_the_function() {
    let mut image = raw_image(&if_then());
    let result = analyse(&mut image);
    let function = result.function(BASE).unwrap();

    assert_eq!(function.reason, DiscoveryReason::EntryPoint);
    assert_eq!(function.size, 0x10);
    assert_eq!(function.cfg.blocks.keys().copied().collect::<Vec<_>>(), vec![0x1000, 0x1008, 0x100C]);
    assert!(function.cfg.is_contiguous());
    assert_eq!(function.cfg.instruction_count(), 4);
    CodeValidator::validate_cfg(function).unwrap();

    let head = &function.cfg.blocks[&0x1000];
    assert_eq!(
        head.edges.as_slice(),
        &[
            Edge::new(EdgeKind::BranchTaken, EdgeTarget::Block(0x100C)),
            Edge::new(EdgeKind::BranchNotTaken, EdgeTarget::Block(0x1008)),
        ]
    );
    let tail = &function.cfg.blocks[&0x100C];
    assert_eq!(tail.edges.as_slice(), &[Edge::new(EdgeKind::Return, EdgeTarget::Exit)]);
}

#[test]
fn test_branch_to_next_instruction_gives_two_blocks() {
    let mut image = raw_image(&single_branch());
    let result = analyse(&mut image);
    let function = result.function(BASE).unwrap();

    assert_eq!(function.cfg.blocks.len(), 2);
    let head = &function.cfg.blocks[&0x1000];
    assert_eq!(head.end_address, 0x100C);
    assert!(head.edges.iter().all(|e| e.target == EdgeTarget::Block(0x100C)));
    assert_eq!(function.cfg.branch_targets().into_iter().collect::<Vec<_>>(), vec![0x100C]);
}

#[test]
fn test_calls_discover_new_functions() {
    let mut image = raw_image(&[
        bl(0x1000, 0x100C), // 0x1000
        b(0x1004, 0x1014),  // 0x1004 tail call
        NOP,                // 0x1008 unreachable padding
        li(3, 1),           // 0x100C
        BLR,                // 0x1010
        li(3, 2),           // 0x1014
        BLR,                // 0x1018
    ]);
    let result = analyse(&mut image);

    assert_eq!(result.functions.keys().copied().collect::<Vec<_>>(), vec![0x1000, 0x100C, 0x1014]);
    assert_eq!(result.functions[&0x100C].reason, DiscoveryReason::Call);
    assert_eq!(result.functions[&0x1014].reason, DiscoveryReason::TailCall);
    let caller = &result.functions[&0x1000];
    assert_eq!(caller.cfg.blocks[&0x1000].edges[0], Edge::new(EdgeKind::Call, EdgeTarget::Function(0x100C)));
    assert_eq!(image.symbols.get(0x100C).map(|s| s.name.as_str()), Some("sub_0000100C"));
    for function in result.functions.values() {
        CodeValidator::validate_cfg(function).unwrap();
    }
}

#[test]
fn test_bounded_table_is_recovered() {
    let mut image = raw_image(&switch_table());
    let result = analyse(&mut image);
    let function = result.function(BASE).unwrap();

    assert_eq!(result.len(), 1);
    assert_eq!(function.size, 0x44);
    let table = &function.jump_tables[&0x101C];
    assert_eq!(table.kind, TableKind::Absolute);
    assert_eq!(table.table_address, Some(0x1020));
    assert_eq!(table.selector, CaseSelector::Index(3));
    assert_eq!(table.targets, vec![0x1030, 0x1034, 0x1038, 0x103C]);
    assert_eq!(table.evidence.declared_entries, Some(4));
    assert!(!function.has_unresolved_dispatch());

    let data = &function.cfg.blocks[&0x1020];
    assert!(data.is_data());
    assert_eq!(data.data_words.len(), 4);
    assert_eq!(
        function.cfg.blocks[&0x1008].edges[0],
        Edge::new(EdgeKind::Indirect, EdgeTarget::Table(0x101C))
    );

    // The table is part of the function, not a symbol of its own.
    assert!(image.symbols.get(0x1020).is_none());
    assert_eq!(image.symbols.containing(0x1020).map(|s| s.address), Some(BASE));

    CodeValidator::validate_cfg(function).unwrap();
    CodeValidator::validate_jump_tables(function, &image).unwrap();
}

#[test]
fn test_every_table_target_decodes_to_code() {
    let mut image = raw_image(&switch_table());
    let result = analyse(&mut image);
    for table in result.jump_tables() {
        for target in &table.targets {
            assert!(image.is_executable(*target), "0x{:08X}", target);
            assert!(result.function(BASE).unwrap().cfg.blocks.contains_key(target));
        }
    }
}

#[test]
fn test_unrecoverable_bctr_is_unresolved() {
    let mut image = raw_image(&unresolved_dispatch());
    let result = analyse(&mut image);
    let function = result.function(BASE).unwrap();

    assert_eq!(function.unresolved, vec![0x1008]);
    assert!(function.jump_tables.is_empty());
    assert!(!function.diagnostics.is_empty());
    assert_eq!(
        function.cfg.blocks[&0x1000].edges[0],
        Edge::new(EdgeKind::Indirect, EdgeTarget::Unresolved)
    );
}

#[test]
fn test_configured_table_overrides_recovery() {
    let mut image = raw_image(&[
        lwz(12, 3, 0), // 0x1000
        mtctr(12),     // 0x1004
        BCTR,          // 0x1008
        li(3, 1),      // 0x100C
        BLR,           // 0x1010
        li(3, 2),      // 0x1014
        BLR,           // 0x1018
    ]);
    let options = AnalysisOptions {
        jump_tables: vec![JumpTableHint {
            address: Address(0x1008),
            register: 4,
            table: None,
            targets: vec![Address(0x100C), Address(0x1014)],
        }],
        ..AnalysisOptions::default()
    };
    let result = Analyzer::new(&mut image, &options).run();
    let function = result.function(BASE).unwrap();

    let table = &function.jump_tables[&0x1008];
    assert_eq!(table.kind, TableKind::Manual);
    assert_eq!(table.selector, CaseSelector::Index(4));
    assert_eq!(table.targets, vec![0x100C, 0x1014]);
    assert!(function.unresolved.is_empty());
    assert!(function.cfg.blocks.contains_key(&0x1014));
}

#[test]
fn test_excluded_seed_is_not_analysed() {
    let mut image = raw_image(&[li(3, 0), BLR]);
    let options = AnalysisOptions {
        exclude: vec![AddressRange {
            start: Address(0x1000),
            end: Address(0x1008),
        }],
        ..AnalysisOptions::default()
    };
    let result = Analyzer::new(&mut image, &options).run();
    assert!(result.is_empty());
    assert_eq!(result.diagnostics.len(), 1);
}

#[test]
fn test_in_place_scale_selects_by_target() {
    let mut image = raw_image(&in_place_switch_table());
    let result = analyse(&mut image);
    let table = &result.function(BASE).unwrap().jump_tables[&0x101C];

    assert_eq!(table.selector, CaseSelector::Target);
    assert_eq!(table.targets, vec![0x1030, 0x1034, 0x1038, 0x103C]);
    assert_eq!(table.evidence.declared_entries, Some(4));
}

#[test]
fn test_offset_table_keeps_case_order() {
    let mut image = raw_image(&relative_switch_table());
    let result = analyse(&mut image);
    let function = result.function(BASE).unwrap();
    let table = &function.jump_tables[&0x1020];

    assert_eq!(table.kind, TableKind::Relative { base: 0x1024 });
    assert_eq!(table.selector, CaseSelector::Index(3));
    assert_eq!(table.targets, vec![0x1040, 0x103C, 0x1038, 0x1034]);
    CodeValidator::validate_cfg(function).unwrap();
    CodeValidator::validate_jump_tables(function, &image).unwrap();
}

#[test]
fn test_symbols_never_share_bytes() {
    for (name, words) in all_fixtures() {
        let mut image = raw_image(&words);
        analyse(&mut image);
        let symbols: Vec<_> = image.symbols.iter().collect();
        for pair in symbols.windows(2) {
            assert!(
                pair[0].claimed_end() <= pair[1].address as u64,
                "{}: {} overlaps {}",
                name,
                pair[0].name,
                pair[1].name
            );
        }
    }
}

#[test]
fn test_out_of_line_table_gets_a_symbol() {
    let code = [
        cmplwi(0, 3, 1),         // 0x1000
        bgt(0x1004, 0x1024),     // 0x1004
        addis(11, 0, 0),         // 0x1008
        addi(11, 11, 0x2000),    // 0x100C
        rlwinm(12, 3, 2, 0, 29), // 0x1010
        lwzx(12, 11, 12),        // 0x1014
        mtctr(12),               // 0x1018
        BCTR,                    // 0x101C
        li(3, 1),                // 0x1020
        BLR,                     // 0x1024
    ];
    let table = bytes(&[0x1020, 0x1024]);
    let mut image = Image {
        sections: vec![
            Section {
                name: ".text".to_string(),
                address: BASE,
                size: code.len() as u32 * 4,
                data: bytes(&code),
                permissions: Permissions::CODE,
            },
            Section {
                name: ".rodata".to_string(),
                address: 0x2000,
                size: table.len() as u32,
                data: table,
                permissions: Permissions::DATA,
            },
        ],
        symbols: SymbolTable::new(),
        entry_point: BASE,
    };
    let result = analyse(&mut image);

    assert_eq!(result.function(BASE).unwrap().jump_tables[&0x101C].targets, vec![0x1020, 0x1024]);
    let symbol = image.symbols.get(0x2000).unwrap();
    assert_eq!(symbol.kind, SymbolKind::JumpTable);
    assert_eq!(symbol.name, "jumptable_00002000");
    assert_eq!(symbol.size, 8);
}
