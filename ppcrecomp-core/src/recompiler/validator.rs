//! Output and Analysis Validation
//!
//! Cheap structural checks run by the pipeline before anything is written.
//!
//! # Validation Checks
//! - **CFG partition**: the blocks of a function cover `[entry, extent)`
//!   without gaps or overlap, and every local edge lands on a block start
//! - **Jump tables**: every target decodes and lies in executable memory
//! - **Emitted source**: balanced braces and parentheses outside comments,
//!   and a label for every `goto`

use crate::recompiler::analysis::{EdgeTarget, Function};
use crate::recompiler::codegen::SourceUnit;
use crate::recompiler::decoder::Instruction;
use crate::recompiler::image::Image;
use anyhow::{bail, Result};
use std::collections::BTreeSet;

/// Structural validator for analysis results and generated C++.
pub struct CodeValidator;

impl CodeValidator {
    /// Check that the blocks of `function` partition its address range.
    pub fn validate_cfg(function: &Function) -> Result<()> {
        let cfg = &function.cfg;
        if !cfg.blocks.contains_key(&cfg.entry_block) {
            bail!(
                "function 0x{:08X}: entry block 0x{:08X} is missing",
                function.address,
                cfg.entry_block
            );
        }

        let mut expected = function.address;
        for block in cfg.blocks.values() {
            if block.start_address != expected {
                bail!(
                    "function 0x{:08X}: block at 0x{:08X} does not follow 0x{:08X} (gap or overlap)",
                    function.address,
                    block.start_address,
                    expected
                );
            }
            let words = (block.instructions.len() + block.data_words.len()) as u32;
            if block.end_address.wrapping_sub(block.start_address) != words * 4 {
                bail!(
                    "function 0x{:08X}: block at 0x{:08X} holds {} words but spans {} bytes",
                    function.address,
                    block.start_address,
                    words,
                    block.end_address.wrapping_sub(block.start_address)
                );
            }
            for edge in &block.edges {
                if let EdgeTarget::Block(target) = edge.target {
                    if !cfg.blocks.contains_key(&target) {
                        bail!(
                            "function 0x{:08X}: edge from 0x{:08X} targets 0x{:08X}, which starts no block",
                            function.address,
                            block.start_address,
                            target
                        );
                    }
                }
            }
            expected = block.end_address;
        }

        if expected.wrapping_sub(function.address) != function.size {
            bail!(
                "function 0x{:08X}: blocks end at 0x{:08X} but size is {} bytes",
                function.address,
                expected,
                function.size
            );
        }
        Ok(())
    }

    /// Check that every recovered jump-table target is decodable code.
    pub fn validate_jump_tables(function: &Function, image: &Image) -> Result<()> {
        for table in function.jump_tables.values() {
            for target in &table.targets {
                if !image.is_executable(*target) {
                    bail!(
                        "jump table for bctr at 0x{:08X}: target 0x{:08X} is not in executable memory",
                        table.branch_address,
                        target
                    );
                }
                let decodes = image
                    .read_u32(*target)
                    .map(|word| Instruction::decode(word, *target).is_ok())
                    .unwrap_or(false);
                if !decodes {
                    bail!(
                        "jump table for bctr at 0x{:08X}: target 0x{:08X} does not decode",
                        table.branch_address,
                        target
                    );
                }
            }
        }
        Ok(())
    }

    /// Check one emitted routine for balanced delimiters and dangling gotos.
    pub fn validate_source(unit: &SourceUnit) -> Result<()> {
        let mut braces = 0i64;
        let mut parens = 0i64;
        let mut labels = BTreeSet::new();
        let mut gotos = BTreeSet::new();

        for line in unit.text.lines() {
            let code = line.split("//").next().unwrap_or("").trim();
            if code.is_empty() {
                continue;
            }
            braces += code.matches('{').count() as i64 - code.matches('}').count() as i64;
            parens += code.matches('(').count() as i64 - code.matches(')').count() as i64;
            if braces < 0 || parens < 0 {
                bail!("{}: closing delimiter without an opener in `{}`", unit.name, code);
            }
            if let Some(label) = code.strip_suffix(':').filter(|l| l.starts_with("loc_")) {
                labels.insert(label.to_string());
            }
            if let Some(rest) = code.split("goto ").nth(1) {
                gotos.insert(rest.trim_end_matches(';').to_string());
            }
        }

        if braces != 0 {
            bail!("{}: {} unclosed brace(s)", unit.name, braces);
        }
        if parens != 0 {
            bail!("{}: {} unclosed parenthes(es)", unit.name, parens);
        }
        if let Some(missing) = gotos.difference(&labels).next() {
            bail!("{}: goto {} has no label", unit.name, missing);
        }
        log::debug!(
            "{}: {} label(s), {} goto target(s) validated",
            unit.name,
            labels.len(),
            gotos.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(text: &str) -> SourceUnit {
        SourceUnit {
            name: "sub_00001000".to_string(),
            address: 0x1000,
            text: text.to_string(),
        }
    }

    #[test]
    fn accepts_labelled_gotos() {
        let text = "PPC_FUNC_IMPL(f) {\n\tif (ctx.cr0.eq) goto loc_00001008;\nloc_00001008:\n\treturn;\n}\n";
        assert!(CodeValidator::validate_source(&unit(text)).is_ok());
    }

    #[test]
    fn rejects_dangling_goto() {
        let text = "PPC_FUNC_IMPL(f) {\n\tgoto loc_00001010;\n}\n";
        let err = CodeValidator::validate_source(&unit(text)).unwrap_err();
        assert!(err.to_string().contains("loc_00001010"));
    }

    #[test]
    fn ignores_delimiters_in_comments() {
        let text = "// note: unbalanced ( in a diagnostic\nPPC_FUNC_IMPL(f) {\n\t// lwz r3, 0(r1\n}\n";
        assert!(CodeValidator::validate_source(&unit(text)).is_ok());
    }

    #[test]
    fn rejects_unbalanced_braces() {
        assert!(CodeValidator::validate_source(&unit("PPC_FUNC_IMPL(f) {\n")).is_err());
    }
}
