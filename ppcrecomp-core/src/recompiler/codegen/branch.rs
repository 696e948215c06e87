//! Branch Lowering
//!
//! The terminator of a block lowers the block's outgoing edges:
//! - local targets become `goto loc_XXXXXXXX;`
//! - calls become direct calls of the emitted routine, or runtime dispatch
//!   through `PPC_CALL_INDIRECT_FUNC` when the callee is not emitted
//! - tail calls are a call followed by `return;`
//! - a recovered jump table becomes a `switch` on its index register with
//!   `PPC_UNREACHABLE()` as the default; when the index did not survive to
//!   the `bctr` the switch matches CTR against each distinct target
//!
//! BO decoding follows the architecture: bit 2 (0x04) clear decrements CTR,
//! bit 1 (0x02) selects CTR == 0, bit 4 (0x10) clear tests CR bit BI, and
//! bit 3 (0x08) selects the value it must have.

use super::FunctionEmitter;
use crate::recompiler::analysis::{BasicBlock, CaseSelector, Edge, EdgeTarget};
use crate::recompiler::decoder::{DecodedInstruction, Mnemonic};
use crate::recompiler::error::RecompilerError;

impl FunctionEmitter<'_, '_> {
    pub(super) fn branch(&mut self, block: &BasicBlock, inst: &DecodedInstruction) -> Result<(), RecompilerError> {
        let instruction = &inst.instruction;
        let next = inst.next_address();
        let condition = self.branch_condition(inst)?;
        let condition = condition.as_deref();
        let lr = self.names.special("lr", "u64")?;
        let mut sequential = block.edges.get(1..).unwrap_or(&[]);

        match instruction.mnemonic {
            Mnemonic::B | Mnemonic::Bc => {
                let target = instruction
                    .branch_target()
                    .ok_or_else(|| super::malformed(instruction))?;
                if instruction.flags.lk && target == next {
                    self.guarded(condition, &[format!("{} = 0x{:08X};", lr, next)]);
                    sequential = &block.edges;
                } else if instruction.flags.lk {
                    let call = self.call_expr(target)?;
                    self.guarded(condition, &[format!("{} = 0x{:08X};", lr, next), format!("{};", call)]);
                } else {
                    match block.edges.first().map(|e| e.target) {
                        Some(EdgeTarget::Block(local)) => {
                            self.guarded(condition, &[format!("goto loc_{:08X};", local)]);
                        }
                        Some(EdgeTarget::Function(callee) | EdgeTarget::External(callee)) => {
                            let call = self.call_expr(callee)?;
                            self.guarded(condition, &[format!("{};", call), "return;".to_string()]);
                        }
                        _ => return Err(unlowerable(inst)),
                    }
                }
            }
            Mnemonic::Bclr if instruction.flags.lk => {
                let temp = self.temp();
                let dispatch = self.call("PPC_CALL_INDIRECT_FUNC", &[temp])?;
                self.guarded(
                    condition,
                    &[
                        format!("{} = {};", temp, lr),
                        format!("{} = 0x{:08X};", lr, next),
                        format!("{};", dispatch),
                    ],
                );
            }
            Mnemonic::Bclr => self.guarded(condition, &["return;".to_string()]),
            Mnemonic::Bcctr => {
                let target = block.edges.first().map(|e| e.target);
                if let (false, Some(EdgeTarget::Table(at))) = (instruction.flags.lk, target) {
                    let statements = self.switch(at)?;
                    self.guarded(condition, &statements);
                } else {
                    let ctr = self.names.special("ctr", "u32")?;
                    let dispatch = format!("{};", self.call("PPC_CALL_INDIRECT_FUNC", &[&ctr])?);
                    if instruction.flags.lk {
                        self.guarded(condition, &[format!("{} = 0x{:08X};", lr, next), dispatch]);
                    } else if target == Some(EdgeTarget::Unresolved) {
                        self.guarded(condition, &[dispatch, "return;".to_string()]);
                    } else {
                        return Err(unlowerable(inst));
                    }
                }
            }
            _ => return Err(unlowerable(inst)),
        }

        self.fall_out(sequential, next)
    }

    /// Sequential flow that leaves the function continues in the routine
    /// that owns `next`.
    pub(super) fn fall_out(&mut self, edges: &[Edge], next: u32) -> Result<(), RecompilerError> {
        let leaves = edges.iter().any(|edge| {
            matches!(edge.target, EdgeTarget::Function(t) | EdgeTarget::External(t) if t == next)
        });
        if leaves {
            let call = self.call_expr(next)?;
            self.line(format!("{};", call));
            self.line("return;");
        }
        Ok(())
    }

    /// Condition under which the branch is taken, or `None` if always.
    /// Emits the CTR decrement when BO asks for one.
    fn branch_condition(&mut self, inst: &DecodedInstruction) -> Result<Option<String>, RecompilerError> {
        let instruction = &inst.instruction;
        if instruction.mnemonic == Mnemonic::B {
            return Ok(None);
        }
        let (bo, bi) = instruction
            .branch_options()
            .ok_or_else(|| super::malformed(instruction))?;

        let mut terms = Vec::new();
        if bo & 0x04 == 0 && instruction.mnemonic != Mnemonic::Bcctr {
            let ctr = self.names.special("ctr", "u64")?;
            self.line(format!("--{};", ctr));
            let ctr = self.names.special("ctr", "u32")?;
            let test = if bo & 0x02 != 0 { "==" } else { "!=" };
            terms.push(format!("{} {} 0", ctr, test));
        }
        if bo & 0x10 == 0 {
            let bit = self.names.cr_bit(bi)?;
            if bo & 0x08 != 0 {
                terms.push(bit);
            } else {
                terms.push(format!("!{}", bit));
            }
        }

        Ok(if terms.is_empty() {
            None
        } else {
            Some(terms.join(" && "))
        })
    }

    /// Direct call of `target` when it is emitted, runtime dispatch otherwise.
    fn call_expr(&self, target: u32) -> Result<String, RecompilerError> {
        match self.generator.function_name(target) {
            Some(name) => Ok(format!("{}(ctx, base)", name)),
            None => self.call("PPC_CALL_INDIRECT_FUNC", &[&format!("0x{:08X}", target)]),
        }
    }

    fn switch(&mut self, bctr: u32) -> Result<Vec<String>, RecompilerError> {
        let function = self.function;
        let table = function
            .jump_tables
            .get(&bctr)
            .ok_or_else(|| RecompilerError::emit(format!("no jump table recorded for bctr at 0x{:08X}", bctr)))?;
        let unreachable = self.call("PPC_UNREACHABLE", &[])?;

        let mut statements = Vec::with_capacity(table.targets.len() * 2 + 4);
        match table.selector {
            CaseSelector::Index(register) => {
                let index = self.names.gpr(register, "u32")?;
                statements.push(format!("switch ({}) {{", index));
                for (case, target) in table.targets.iter().enumerate() {
                    statements.push(format!("case {}:", case));
                    statements.push(format!("\tgoto loc_{:08X};", target));
                }
            }
            CaseSelector::Target => {
                let ctr = self.names.special("ctr", "u32")?;
                statements.push(format!("switch ({}) {{", ctr));
                let mut seen: Vec<u32> = Vec::with_capacity(table.targets.len());
                for &target in &table.targets {
                    if seen.contains(&target) {
                        continue;
                    }
                    seen.push(target);
                    statements.push(format!("case 0x{:08X}:", target));
                    statements.push(format!("\tgoto loc_{:08X};", target));
                }
            }
        }
        statements.push("default:".to_string());
        statements.push(format!("\t{};", unreachable));
        statements.push("}".to_string());
        Ok(statements)
    }
}

#[cold]
fn unlowerable(inst: &DecodedInstruction) -> RecompilerError {
    RecompilerError::emit(format!(
        "branch `{}` at 0x{:08X} has no lowerable edge",
        inst, inst.address
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recompiler::decoder::Instruction;

    #[test]
    fn unlowerable_names_the_branch() {
        let inst = Instruction::decode(0x4E80_0420, 0x8000_1000).unwrap();
        let message = unlowerable(&inst).to_string();
        assert!(message.contains("0x80001000"), "{}", message);
    }
}
