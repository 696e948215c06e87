//! Special-register moves, condition-register logic, cache and
//! synchronisation instructions, and traps.

use super::{FunctionEmitter, RequiredOperands};
use crate::recompiler::decoder::{
    DecodedInstruction, Instruction, Mnemonic, Operand, SPR_CTR, SPR_LR, SPR_XER, TBR_TBU,
};
use crate::recompiler::error::RecompilerError;

/// TO bits of a trap, most significant first, with the comparison each one
/// enables and whether it is signed.
const TRAP_CONDITIONS: [(u32, &str, bool); 5] = [
    (0x10, "<", true),
    (0x08, ">", true),
    (0x04, "==", true),
    (0x02, "<", false),
    (0x01, ">", false),
];

impl FunctionEmitter<'_, '_> {
    pub(super) fn move_register(&mut self, inst: &Instruction) -> Result<(), RecompilerError> {
        use Mnemonic::*;
        match inst.mnemonic {
            Mfspr => {
                let target = self.names.gpr(inst.req_gpr(0)?, "u64")?;
                let value = match inst.req_spr(1)? {
                    SPR_LR => self.names.special("lr", "u64")?,
                    SPR_CTR => self.names.special("ctr", "u64")?,
                    SPR_XER => format!(
                        "({} << 31) | ({} << 30) | ({} << 29)",
                        self.names.special("xer", "so")?,
                        self.names.special("xer", "ov")?,
                        self.names.special("xer", "ca")?
                    ),
                    spr => self.call("PPC_MFSPR", &[&spr.to_string()])?,
                };
                self.line(format!("{} = {};", target, value));
            }
            Mtspr => {
                let s = inst.req_gpr(1)?;
                match inst.req_spr(0)? {
                    spr @ (SPR_LR | SPR_CTR) => {
                        let name = if spr == SPR_LR { "lr" } else { "ctr" };
                        let target = self.names.special(name, "u64")?;
                        let source = self.names.gpr(s, "u64")?;
                        self.line(format!("{} = {};", target, source));
                    }
                    SPR_XER => {
                        let source = self.names.gpr(s, "u32")?;
                        for (bit, shift) in [("so", 31), ("ov", 30), ("ca", 29)] {
                            let target = self.names.special("xer", bit)?;
                            self.line(format!("{} = ({} >> {}) & 1;", target, source, shift));
                        }
                    }
                    spr => {
                        let source = self.names.gpr(s, "u64")?;
                        let statement = self.call("PPC_MTSPR", &[&spr.to_string(), &source])?;
                        self.line(format!("{};", statement));
                    }
                }
            }
            Mftb => {
                let target = self.names.gpr(inst.req_gpr(0)?, "u64")?;
                let value = self.call("PPC_MFTB", &[])?;
                if inst.spr(1) == Some(TBR_TBU) {
                    self.line(format!("{} = {} >> 32;", target, value));
                } else {
                    self.line(format!("{} = {};", target, value));
                }
            }
            Mfcr => {
                let target = self.names.gpr(inst.req_gpr(0)?, "u64")?;
                let value = self.call("PPC_MFCR", &["ctx"])?;
                self.line(format!("{} = {};", target, value));
            }
            Mtcrf => {
                let mask = format!("0x{:02X}", inst.req_uimm(0)?);
                let source = self.names.gpr(inst.req_gpr(1)?, "u32")?;
                let statement = self.call("PPC_MTCRF", &["ctx", &mask, &source])?;
                self.line(format!("{};", statement));
            }
            Mfmsr => {
                let target = self.names.gpr(inst.req_gpr(0)?, "u64")?;
                let msr = self.names.special("msr", "u64")?;
                self.line(format!("{} = {};", target, msr));
            }
            Mtmsr => {
                let msr = self.names.special("msr", "u64")?;
                let source = self.names.gpr(inst.req_gpr(0)?, "u32")?;
                self.line(format!("{} = ({} & 0xFFFFFFFF00000000) | {};", msr, msr, source));
            }
            Mtmsrd => {
                let msr = self.names.special("msr", "u64")?;
                let source = self.names.gpr(inst.req_gpr(0)?, "u64")?;
                self.line(format!("{} = {};", msr, source));
            }
            _ => return Err(super::malformed(inst)),
        }
        Ok(())
    }

    pub(super) fn condition_register(&mut self, inst: &Instruction) -> Result<(), RecompilerError> {
        use Mnemonic::*;
        if inst.mnemonic == Mcrf {
            let target = self.names.cr(inst.req_crf(0)?)?;
            let source = self.names.cr(inst.req_crf(1)?)?;
            self.line(format!("{} = {};", target, source));
            return Ok(());
        }

        let (d, a, b) = (inst.req_crbit(0)?, inst.req_crbit(1)?, inst.req_crbit(2)?);
        let target = self.names.cr_bit(d)?;
        let value = match inst.mnemonic {
            // crclr and crset
            Crxor if a == d && b == d => "0".to_string(),
            Creqv if a == d && b == d => "1".to_string(),
            _ => {
                let (x, y) = (self.names.cr_bit(a)?, self.names.cr_bit(b)?);
                match inst.mnemonic {
                    Crand => format!("{} & {}", x, y),
                    Crandc => format!("{} & !{}", x, y),
                    Creqv => format!("{} == {}", x, y),
                    Crnand => format!("!({} & {})", x, y),
                    Crnor => format!("!({} | {})", x, y),
                    Cror => format!("{} | {}", x, y),
                    Crorc => format!("{} | !{}", x, y),
                    Crxor => format!("{} ^ {}", x, y),
                    _ => return Err(super::malformed(inst)),
                }
            }
        };
        self.line(format!("{} = {};", target, value));
        Ok(())
    }

    pub(super) fn system(&mut self, inst: &Instruction) -> Result<(), RecompilerError> {
        let helper = format!("PPC_{}", inst.mnemonic.as_str().to_ascii_uppercase());
        let statement = match (inst.operand(0), inst.operand(1)) {
            (Some(Operand::Register(a)), Some(Operand::Register(b))) => {
                let address = self.indexed_address(*a, *b)?;
                self.call(&helper, &[&address])?
            }
            _ => self.call(&helper, &[])?,
        };
        self.line(format!("{};", statement));
        Ok(())
    }

    pub(super) fn trap(&mut self, inst: &DecodedInstruction) -> Result<(), RecompilerError> {
        let instruction = &inst.instruction;
        let to = instruction.req_uimm(0)? & 0x1F;
        if to == 0 {
            return Ok(());
        }
        let trap = self.call("PPC_TRAP", &[&format!("0x{:08X}", inst.address)])?;
        if to == 0x1F {
            self.line(format!("{};", trap));
            return Ok(());
        }

        let doubleword = matches!(instruction.mnemonic, Mnemonic::Td | Mnemonic::Tdi);
        let (signed, unsigned) = if doubleword { ("s64", "u64") } else { ("s32", "u32") };
        let a = instruction.req_gpr(1)?;
        let lhs_signed = self.names.gpr(a, signed)?;
        let lhs_unsigned = self.names.gpr(a, unsigned)?;
        let (rhs_signed, rhs_unsigned) = match instruction.operand(2) {
            Some(Operand::Register(b)) => (self.names.gpr(*b, signed)?, self.names.gpr(*b, unsigned)?),
            Some(Operand::Immediate(imm)) if doubleword => (imm.to_string(), format!("uint64_t(int64_t({}))", imm)),
            Some(Operand::Immediate(imm)) => (imm.to_string(), format!("0x{:X}", *imm as u32)),
            _ => return Err(super::malformed(instruction)),
        };

        let conditions: Vec<String> = TRAP_CONDITIONS
            .iter()
            .filter(|(bit, _, _)| to & bit != 0)
            .map(|(_, op, is_signed)| {
                if *is_signed {
                    format!("{} {} {}", lhs_signed, op, rhs_signed)
                } else {
                    format!("{} {} {}", lhs_unsigned, op, rhs_unsigned)
                }
            })
            .collect();
        self.line(format!("if ({}) {};", conditions.join(" || "), trap));
        Ok(())
    }
}
