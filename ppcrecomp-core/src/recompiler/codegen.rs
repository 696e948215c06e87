//! C++ Code Generator
//!
//! Lowers each analysed [`Function`] into one C++ routine written against
//! the register-context contract. The translation is a faithful
//! block-and-goto rendering of the CFG: one label per block that some
//! branch or switch case targets, one group of statements per instruction,
//! each preceded by its assembler text as a comment.
//!
//! # Emission Strategy
//! 1. **Header**: name, address, size, discovery reason, and every
//!    diagnostic attached to the function as `// note:` lines
//! 2. **Body**: blocks in address order; the last instruction of a block
//!    lowers its outgoing edges (`goto`, call, tail call, switch, return)
//! 3. **Locals**: `ea`, `temp` and `overflow` are declared only if the body
//!    used them, so the body is generated first and the prologue after
//!
//! The generator holds shared references only. Each call to
//! [`CodeGenerator::generate_function`] builds a fresh [`FunctionEmitter`],
//! which makes emission safe to run on a rayon pool with output identical
//! to a sequential run.

mod branch;
mod float;
mod integer;
mod memory;
pub mod register;
mod simd;
mod system;

use crate::recompiler::analysis::{AnalysisResult, DiscoveryReason, Function};
use crate::recompiler::contract::RegisterContext;
use crate::recompiler::decoder::{DecodedInstruction, Instruction, InstructionType, Operand};
use crate::recompiler::error::RecompilerError;
use crate::recompiler::image::{default_function_name, Image};
use register::RegisterNames;
pub use simd::uses_vector_unit;
use std::collections::{BTreeMap, BTreeSet};

/// One emitted routine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    pub name: String,
    pub address: u32,
    /// Routine text without `#include` lines
    pub text: String,
}

/// Translates analysed functions into C++.
pub struct CodeGenerator<'a> {
    contract: &'a RegisterContext,
    analysis: &'a AnalysisResult,
    /// Emitted name of every function, by entry address
    names: BTreeMap<u32, String>,
    /// Functions left out of the output; calls to them go through runtime dispatch
    omitted: BTreeSet<u32>,
}

impl<'a> CodeGenerator<'a> {
    pub fn new(contract: &'a RegisterContext, image: &'a Image, analysis: &'a AnalysisResult) -> Self {
        let names = analysis
            .functions
            .values()
            .map(|f| (f.address, f.name(image)))
            .collect();
        Self {
            contract,
            analysis,
            names,
            omitted: BTreeSet::new(),
        }
    }

    /// Leave these functions out; direct calls to them are dispatched at runtime.
    pub fn with_omitted(mut self, omitted: BTreeSet<u32>) -> Self {
        self.omitted = omitted;
        self
    }

    /// Emitted name of the function at `address`, or `None` if it is not
    /// part of the output.
    pub fn function_name(&self, address: u32) -> Option<&str> {
        if self.omitted.contains(&address) {
            return None;
        }
        self.names.get(&address).map(String::as_str)
    }

    /// Every emitted function as `(address, name)`, in address order.
    pub fn emitted_functions(&self) -> impl Iterator<Item = (u32, &str)> + '_ {
        self.names
            .iter()
            .filter(|(address, _)| !self.omitted.contains(address))
            .map(|(address, name)| (*address, name.as_str()))
    }

    /// Generate the routine for one function.
    ///
    /// # Errors
    /// [`RecompilerError::Emit`] if the contract lacks a field, member, or
    /// helper the function needs.
    pub fn generate_function(&self, function: &Function) -> Result<SourceUnit, RecompilerError> {
        let name = self
            .names
            .get(&function.address)
            .cloned()
            .unwrap_or_else(|| default_function_name(function.address));
        let text = FunctionEmitter::new(self, function)
            .emit(&name)
            .map_err(|e| e.in_function(&name, function.address))?;
        log::debug!("Emitted {} ({} bytes of source)", name, text.len());
        Ok(SourceUnit {
            name,
            address: function.address,
            text,
        })
    }

    /// Emit every function of the analysis, in address order, sequentially.
    pub fn generate_all(&self) -> Result<Vec<SourceUnit>, RecompilerError> {
        self.analysis
            .functions
            .values()
            .filter(|f| !self.omitted.contains(&f.address))
            .map(|f| self.generate_function(f))
            .collect()
    }

    /// `ppc_recomp_shared.h`: one declaration per emitted function.
    pub fn shared_header(&self) -> Result<String, RecompilerError> {
        self.contract.helper("PPC_EXTERN_FUNC")?;
        let mut text = String::from("#pragma once\n\n#include \"ppc_context.h\"\n\n");
        for (_, name) in self.emitted_functions() {
            text.push_str(&format!("PPC_EXTERN_FUNC({});\n", name));
        }
        Ok(text)
    }

    /// `ppc_func_mapping.cpp`: the guest address to routine table used for
    /// runtime dispatch, terminated by a null entry.
    pub fn function_mapping(&self) -> Result<String, RecompilerError> {
        if !self.contract.has_type("PPCFuncMapping") {
            return Err(RecompilerError::emit(
                "register context does not declare type `PPCFuncMapping`",
            ));
        }
        let mut text = String::from("#include \"ppc_recomp_shared.h\"\n\nPPCFuncMapping PPCFuncMappings[] = {\n");
        for (address, name) in self.emitted_functions() {
            text.push_str(&format!("\t{{ 0x{:08X}, {} }},\n", address, name));
        }
        text.push_str("\t{ 0, nullptr }\n};\n");
        Ok(text)
    }
}

/// Scratch locals a routine may need.
#[derive(Debug, Clone, Copy, Default)]
struct Locals {
    ea: bool,
    temp: bool,
    overflow: bool,
}

/// Per-function emission state.
pub(crate) struct FunctionEmitter<'g, 'a> {
    generator: &'g CodeGenerator<'a>,
    function: &'g Function,
    names: RegisterNames<'a>,
    /// Blocks that need a label
    labels: BTreeSet<u32>,
    body: String,
    locals: Locals,
}

impl<'g, 'a> FunctionEmitter<'g, 'a> {
    fn new(generator: &'g CodeGenerator<'a>, function: &'g Function) -> Self {
        let mut labels = function.cfg.branch_targets();
        for table in function.jump_tables.values() {
            labels.extend(table.targets.iter().copied());
        }
        Self {
            generator,
            function,
            names: RegisterNames::new(generator.contract),
            labels,
            body: String::new(),
            locals: Locals::default(),
        }
    }

    fn emit(mut self, name: &str) -> Result<String, RecompilerError> {
        self.names.helper("PPC_FUNC_IMPL")?;
        self.names.helper("PPC_FUNC_PROLOGUE")?;

        let function = self.function;
        for block in function.cfg.blocks.values() {
            if self.labels.contains(&block.start_address) {
                self.body.push_str(&format!("loc_{:08X}:\n", block.start_address));
            }
            if block.is_data() && self.is_table_data(block.start_address) {
                self.line(format!(
                    "// jump table data, {} entries",
                    block.data_words.len()
                ));
                continue;
            }

            let terminator = block.terminator().map(|inst| inst.address);
            for inst in &block.instructions {
                self.line(format!("// {}", inst));
                if Some(inst.address) == terminator {
                    self.branch(block, inst)?;
                } else {
                    self.instruction(inst)?;
                }
            }
            for (i, word) in block.data_words.iter().enumerate() {
                let address = block.start_address + 4 * (block.instructions.len() + i) as u32;
                self.names.helper("PPC_INVALID_INSTRUCTION")?;
                self.line(format!("// .long 0x{:08X}", word));
                self.line(format!("PPC_INVALID_INSTRUCTION(0x{:08X});", address));
            }
            if terminator.is_none() {
                self.fall_out(&block.edges, block.end_address)?;
            }
        }

        let mut text = format!(
            "// {} @ 0x{:08X}, {} bytes, discovered by {}\n",
            name,
            function.address,
            function.size,
            reason_text(function.reason)
        );
        for diagnostic in &function.diagnostics {
            text.push_str(&format!("// note: {}\n", diagnostic));
        }
        text.push_str(&format!("PPC_FUNC_IMPL({}) {{\n", name));
        text.push_str("\tPPC_FUNC_PROLOGUE();\n");
        if self.locals.ea {
            text.push_str("\tuint32_t ea{};\n");
        }
        if self.locals.temp {
            text.push_str("\tuint64_t temp{};\n");
        }
        if self.locals.overflow {
            text.push_str("\tint64_t overflow{};\n");
        }
        text.push_str(&self.body);
        text.push_str("}\n");
        Ok(text)
    }

    fn is_table_data(&self, address: u32) -> bool {
        self.function
            .jump_tables
            .values()
            .any(|t| t.table_address == Some(address))
    }

    /// Lower one non-branch instruction.
    fn instruction(&mut self, inst: &DecodedInstruction) -> Result<(), RecompilerError> {
        match inst.instruction.instruction_type {
            InstructionType::Arithmetic => self.arithmetic(&inst.instruction),
            InstructionType::Logical => self.logical(&inst.instruction),
            InstructionType::Compare => self.compare(&inst.instruction),
            InstructionType::Shift => self.shift(&inst.instruction),
            InstructionType::Rotate => self.rotate(&inst.instruction),
            InstructionType::Load => self.load(&inst.instruction),
            InstructionType::Store => self.store(&inst.instruction),
            InstructionType::Move => self.move_register(&inst.instruction),
            InstructionType::ConditionRegister => self.condition_register(&inst.instruction),
            InstructionType::FloatingPoint => self.floating_point(&inst.instruction),
            InstructionType::Vector => self.vector(&inst.instruction),
            InstructionType::System => self.system(&inst.instruction),
            InstructionType::Trap => self.trap(inst),
            // Branches only ever close a block.
            InstructionType::Branch => Err(RecompilerError::emit(format!(
                "branch `{}` at 0x{:08X} does not end its block",
                inst, inst.address
            ))),
        }
    }

    /// One statement at body indentation.
    fn line(&mut self, text: impl AsRef<str>) {
        self.body.push('\t');
        self.body.push_str(text.as_ref());
        self.body.push('\n');
    }

    /// Statements run only when `condition` holds.
    fn guarded(&mut self, condition: Option<&str>, statements: &[String]) {
        match (condition, statements) {
            (None, _) => {
                for statement in statements {
                    self.line(statement);
                }
            }
            (Some(condition), [single]) if !single.contains('\n') => {
                self.line(format!("if ({}) {}", condition, single));
            }
            (Some(condition), _) => {
                self.line(format!("if ({}) {{", condition));
                for statement in statements {
                    for part in statement.lines() {
                        self.line(format!("\t{}", part));
                    }
                }
                self.line("}");
            }
        }
    }

    /// `NAME(args...)`, checked against the contract.
    fn call(&self, helper: &str, args: &[&str]) -> Result<String, RecompilerError> {
        self.names.helper(helper)?;
        Ok(format!("{}({})", helper, args.join(", ")))
    }

    fn ea(&mut self) -> &'static str {
        self.locals.ea = true;
        "ea"
    }

    fn temp(&mut self) -> &'static str {
        self.locals.temp = true;
        "temp"
    }

    fn overflow(&mut self) -> &'static str {
        self.locals.overflow = true;
        "overflow"
    }

    /// Set `crN` from a comparison of `lhs` and `rhs`.
    fn compare_into(&mut self, field: u8, lhs: &str, rhs: &str) -> Result<(), RecompilerError> {
        let so = self.names.special("xer", "so")?;
        for (bit, op) in [("lt", "<"), ("gt", ">"), ("eq", "==")] {
            let target = self.names.cr_member(field, bit)?;
            self.line(format!("{} = {} {} {};", target, lhs, op, rhs));
        }
        let target = self.names.cr_member(field, "so")?;
        self.line(format!("{} = {};", target, so));
        Ok(())
    }

    /// Rc=1: compare the result in `rD` against zero into cr0.
    fn record(&mut self, d: u8, doubleword: bool) -> Result<(), RecompilerError> {
        let value = self.names.gpr(d, if doubleword { "s64" } else { "s32" })?;
        self.compare_into(0, &value, "0")
    }

    /// Operand `index` lowered as an intrinsic argument.
    fn argument(&mut self, inst: &Instruction, index: usize) -> Result<String, RecompilerError> {
        match inst.operand(index) {
            Some(Operand::Register(r)) => self.names.gpr(*r, "u64"),
            Some(Operand::FpRegister(r)) => self.names.fpr(*r),
            Some(Operand::VectorRegister(r)) => self.names.vr(*r),
            Some(Operand::CrField(c)) => self.names.cr(*c),
            Some(Operand::Immediate(v)) => Ok(v.to_string()),
            Some(Operand::UnsignedImmediate(v)) => Ok(format!("0x{:X}", v)),
            Some(Operand::CrBit(v) | Operand::ShiftAmount(v) | Operand::MaskBound(v)) => Ok(v.to_string()),
            Some(Operand::SpecialRegister(v)) => Ok(v.to_string()),
            Some(Operand::Address(a)) => Ok(format!("0x{:08X}", a)),
            Some(Operand::BranchOptions(v)) => Ok(v.to_string()),
            None => Err(malformed(inst)),
        }
    }

    /// `PPC_<MNEMONIC>(operands...)` with every operand in decode order.
    fn intrinsic(&mut self, inst: &Instruction) -> Result<String, RecompilerError> {
        let helper = format!("PPC_{}", inst.mnemonic.as_str().to_ascii_uppercase());
        let args = (0..inst.operands.len())
            .map(|i| self.argument(inst, i))
            .collect::<Result<Vec<_>, _>>()?;
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.call(&helper, &args)
    }
}

fn reason_text(reason: DiscoveryReason) -> &'static str {
    match reason {
        DiscoveryReason::EntryPoint => "entry point",
        DiscoveryReason::Hint => "configuration hint",
        DiscoveryReason::Symbol => "symbol",
        DiscoveryReason::Call => "call",
        DiscoveryReason::TailCall => "tail call",
    }
}

/// `base + offset` with the sign folded into the operator.
fn offset(base: &str, value: i64) -> String {
    match value {
        0 => base.to_string(),
        v if v < 0 => format!("{} - {}", base, v.unsigned_abs()),
        v => format!("{} + {}", base, v),
    }
}

#[cold]
fn malformed(inst: &Instruction) -> RecompilerError {
    RecompilerError::emit(format!("malformed operands for `{}`", inst))
}

/// Typed operand access that fails with an emit error instead of `None`.
trait RequiredOperands {
    fn req_gpr(&self, index: usize) -> Result<u8, RecompilerError>;
    fn req_fpr(&self, index: usize) -> Result<u8, RecompilerError>;
    fn req_vr(&self, index: usize) -> Result<u8, RecompilerError>;
    fn req_imm(&self, index: usize) -> Result<i32, RecompilerError>;
    fn req_uimm(&self, index: usize) -> Result<u32, RecompilerError>;
    fn req_shift(&self, index: usize) -> Result<u8, RecompilerError>;
    fn req_mask(&self, index: usize) -> Result<u8, RecompilerError>;
    fn req_crf(&self, index: usize) -> Result<u8, RecompilerError>;
    fn req_crbit(&self, index: usize) -> Result<u8, RecompilerError>;
    fn req_spr(&self, index: usize) -> Result<u16, RecompilerError>;
}

impl RequiredOperands for Instruction {
    fn req_gpr(&self, index: usize) -> Result<u8, RecompilerError> {
        self.gpr(index).ok_or_else(|| malformed(self))
    }
    fn req_fpr(&self, index: usize) -> Result<u8, RecompilerError> {
        self.fpr(index).ok_or_else(|| malformed(self))
    }
    fn req_vr(&self, index: usize) -> Result<u8, RecompilerError> {
        self.vr(index).ok_or_else(|| malformed(self))
    }
    fn req_imm(&self, index: usize) -> Result<i32, RecompilerError> {
        self.imm(index).ok_or_else(|| malformed(self))
    }
    fn req_uimm(&self, index: usize) -> Result<u32, RecompilerError> {
        self.uimm(index).ok_or_else(|| malformed(self))
    }
    fn req_shift(&self, index: usize) -> Result<u8, RecompilerError> {
        self.shift(index).ok_or_else(|| malformed(self))
    }
    fn req_mask(&self, index: usize) -> Result<u8, RecompilerError> {
        self.mask_bound(index).ok_or_else(|| malformed(self))
    }
    fn req_crf(&self, index: usize) -> Result<u8, RecompilerError> {
        self.crf(index).ok_or_else(|| malformed(self))
    }
    fn req_crbit(&self, index: usize) -> Result<u8, RecompilerError> {
        self.crbit(index).ok_or_else(|| malformed(self))
    }
    fn req_spr(&self, index: usize) -> Result<u16, RecompilerError> {
        self.spr(index).ok_or_else(|| malformed(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recompiler::analysis::{AnalysisOptions, Analyzer};

    /// Body of the routine emitted for `words` followed by `blr`.
    fn lower(words: &[u32]) -> String {
        let mut bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
        bytes.extend(0x4E80_0020u32.to_be_bytes());
        let mut image = Image::from_raw(bytes, 0x1000);
        let options = AnalysisOptions::default();
        let analysis = Analyzer::new(&mut image, &options).run();
        let contract = RegisterContext::default_contract();
        let generator = CodeGenerator::new(&contract, &image, &analysis);
        generator.generate_all().unwrap().remove(0).text
    }

    #[test]
    fn traps_test_only_the_enabled_conditions() {
        // tw 31,0,0 and tweqi r3,0
        let text = lower(&[0x7FE0_0008, 0x0C83_0000]);
        assert!(text.contains("\tPPC_TRAP(0x00001000);\n"), "{}", text);
        assert!(text.contains("\tif (ctx.r3.s32 == 0) PPC_TRAP(0x00001004);\n"), "{}", text);
    }

    #[test]
    fn xer_is_composed_from_its_bits() {
        // mfxer r3
        let text = lower(&[0x7C61_02A6]);
        assert!(
            text.contains("\tctx.r3.u64 = (ctx.xer.so << 31) | (ctx.xer.ov << 30) | (ctx.xer.ca << 29);\n"),
            "{}",
            text
        );
    }

    #[test]
    fn crclr_clears_the_bit() {
        // crxor 6,6,6
        let text = lower(&[(19 << 26) | (6 << 21) | (6 << 16) | (6 << 11) | (193 << 1)]);
        assert!(text.contains("\tctx.cr1.eq = 0;\n"), "{}", text);
    }

    #[test]
    fn rotate_and_record_update_cr0() {
        // rlwinm. r3,r4,0,24,31
        let text = lower(&[(21 << 26) | (4 << 21) | (3 << 16) | (24 << 6) | (31 << 1) | 1]);
        assert!(text.contains("\tctx.cr0.eq = ctx.r3.s32 == 0;\n"), "{}", text);
        assert!(!text.contains("temp"), "{}", text);
    }

    #[test]
    fn offsets_fold_the_sign() {
        assert_eq!(offset("ctx.r1.u32", 0), "ctx.r1.u32");
        assert_eq!(offset("ctx.r1.u32", 8), "ctx.r1.u32 + 8");
        assert_eq!(offset("ctx.r1.u32", -16), "ctx.r1.u32 - 16");
        assert_eq!(offset("x", i32::MIN as i64), "x - 2147483648");
    }
}
