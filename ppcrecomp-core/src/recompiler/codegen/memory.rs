//! Memory Access Lowering
//!
//! Loads and stores go through the contract's memory helpers, which
//! translate guest addresses and swap to big-endian. The effective address
//! is written inline for plain forms; update forms compute it into `ea`
//! first, access memory, and then write `ea` back to `rA`.

use super::{offset, FunctionEmitter, RequiredOperands};
use crate::recompiler::decoder::{Instruction, Mnemonic, Operand};
use crate::recompiler::error::RecompilerError;

impl FunctionEmitter<'_, '_> {
    /// Effective address of `d(rA)` or `rA|0 + rB` for operands 1 and 2.
    pub(super) fn address_operand(&mut self, inst: &Instruction) -> Result<String, RecompilerError> {
        let a = inst.req_gpr(1)?;
        match inst.operand(2) {
            Some(Operand::Immediate(d)) if a == 0 => Ok(d.to_string()),
            Some(Operand::Immediate(d)) => {
                let base = self.names.gpr(a, "u32")?;
                Ok(offset(&base, *d as i64))
            }
            Some(Operand::Register(b)) => {
                let b = self.names.gpr(*b, "u32")?;
                if a == 0 {
                    Ok(b)
                } else {
                    Ok(format!("{} + {}", self.names.gpr(a, "u32")?, b))
                }
            }
            _ => Err(super::malformed(inst)),
        }
    }

    /// `rA|0 + rB` for the two-register cache and vector-permute forms.
    pub(super) fn indexed_address(&mut self, a: u8, b: u8) -> Result<String, RecompilerError> {
        let b = self.names.gpr(b, "u32")?;
        if a == 0 {
            Ok(b)
        } else {
            Ok(format!("{} + {}", self.names.gpr(a, "u32")?, b))
        }
    }

    /// Address expression to use for the access, computing `ea` for update forms.
    fn access_address(&mut self, inst: &Instruction) -> Result<String, RecompilerError> {
        let address = self.address_operand(inst)?;
        if inst.mnemonic.is_update_form() {
            let ea = self.ea();
            self.line(format!("{} = {};", ea, address));
            Ok(ea.to_string())
        } else {
            Ok(address)
        }
    }

    fn write_back(&mut self, inst: &Instruction) -> Result<(), RecompilerError> {
        if inst.mnemonic.is_update_form() {
            let ra = self.names.gpr(inst.req_gpr(1)?, "u64")?;
            let ea = self.ea();
            self.line(format!("{} = {};", ra, ea));
        }
        Ok(())
    }

    pub(super) fn load(&mut self, inst: &Instruction) -> Result<(), RecompilerError> {
        use Mnemonic::*;
        if inst.mnemonic == Lmw {
            return self.load_multiple(inst);
        }
        let address = self.access_address(inst)?;
        let address = address.as_str();
        match inst.mnemonic {
            Lfs | Lfsu | Lfsx | Lfsux => {
                let target = self.names.fpr_member(inst.req_fpr(0)?, "f64")?;
                let value = self.call("PPC_LOAD_F32", &[address])?;
                self.line(format!("{} = {};", target, value));
            }
            Lfd | Lfdu | Lfdx | Lfdux => {
                let target = self.names.fpr_member(inst.req_fpr(0)?, "u64")?;
                let value = self.call("PPC_LOAD_U64", &[address])?;
                self.line(format!("{} = {};", target, value));
            }
            Lvx | Lvxl => {
                let target = self.names.vr(inst.req_vr(0)?)?;
                let value = self.call("PPC_LOAD_V128", &[address])?;
                self.line(format!("{} = {};", target, value));
            }
            Lwarx | Ldarx => {
                let (helper, member) = if inst.mnemonic == Lwarx {
                    ("PPC_LOAD_U32", "u32")
                } else {
                    ("PPC_LOAD_U64", "u64")
                };
                let reserved = self.names.special("reserved", member)?;
                let target = self.names.gpr(inst.req_gpr(0)?, "u64")?;
                let value = self.call(helper, &[address])?;
                self.line(format!("{} = {};", reserved, value));
                self.line(format!("{} = {};", target, reserved));
            }
            _ => {
                let (helper, member, cast) = match inst.mnemonic {
                    Lbz | Lbzu | Lbzx | Lbzux => ("PPC_LOAD_U8", "u64", None),
                    Lhz | Lhzu | Lhzx | Lhzux => ("PPC_LOAD_U16", "u64", None),
                    Lha | Lhau | Lhax | Lhaux => ("PPC_LOAD_U16", "s64", Some("int16_t")),
                    Lwz | Lwzu | Lwzx | Lwzux => ("PPC_LOAD_U32", "u64", None),
                    Lwa | Lwax | Lwaux => ("PPC_LOAD_U32", "s64", Some("int32_t")),
                    Ld | Ldu | Ldx | Ldux => ("PPC_LOAD_U64", "u64", None),
                    Lhbrx => ("PPC_LOAD_LE_U16", "u64", None),
                    Lwbrx => ("PPC_LOAD_LE_U32", "u64", None),
                    _ => return Err(super::malformed(inst)),
                };
                let target = self.names.gpr(inst.req_gpr(0)?, member)?;
                let value = self.call(helper, &[address])?;
                match cast {
                    Some(cast) => self.line(format!("{} = {}({});", target, cast, value)),
                    None => self.line(format!("{} = {};", target, value)),
                }
            }
        }
        self.write_back(inst)
    }

    pub(super) fn store(&mut self, inst: &Instruction) -> Result<(), RecompilerError> {
        use Mnemonic::*;
        if inst.mnemonic == Stmw {
            return self.store_multiple(inst);
        }
        let address = self.access_address(inst)?;
        let address = address.as_str();
        match inst.mnemonic {
            Stfs | Stfsu | Stfsx | Stfsux => {
                let source = self.names.fpr_member(inst.req_fpr(0)?, "f64")?;
                let value = format!("float({})", source);
                let store = self.call("PPC_STORE_F32", &[address, &value])?;
                self.line(format!("{};", store));
            }
            Stfd | Stfdu | Stfdx | Stfdux | Stfiwx => {
                let (helper, member) = if inst.mnemonic == Stfiwx {
                    ("PPC_STORE_U32", "u32")
                } else {
                    ("PPC_STORE_U64", "u64")
                };
                let source = self.names.fpr_member(inst.req_fpr(0)?, member)?;
                let store = self.call(helper, &[address, &source])?;
                self.line(format!("{};", store));
            }
            Stvx | Stvxl => {
                let source = self.names.vr(inst.req_vr(0)?)?;
                let store = self.call("PPC_STORE_V128", &[address, &source])?;
                self.line(format!("{};", store));
            }
            Stwcx | Stdcx => {
                let (helper, member) = if inst.mnemonic == Stwcx {
                    ("PPC_STORE_CONDITIONAL_U32", "u32")
                } else {
                    ("PPC_STORE_CONDITIONAL_U64", "u64")
                };
                let reserved = self.names.special("reserved", member)?;
                let source = self.names.gpr(inst.req_gpr(0)?, member)?;
                let store = self.call(helper, &[address, &reserved, &source])?;
                let so = self.names.special("xer", "so")?;
                for bit in ["lt", "gt"] {
                    let target = self.names.cr_member(0, bit)?;
                    self.line(format!("{} = 0;", target));
                }
                let eq = self.names.cr_member(0, "eq")?;
                self.line(format!("{} = {};", eq, store));
                let cr_so = self.names.cr_member(0, "so")?;
                self.line(format!("{} = {};", cr_so, so));
            }
            _ => {
                let (helper, member) = match inst.mnemonic {
                    Stb | Stbu | Stbx | Stbux => ("PPC_STORE_U8", "u8"),
                    Sth | Sthu | Sthx | Sthux => ("PPC_STORE_U16", "u16"),
                    Stw | Stwu | Stwx | Stwux => ("PPC_STORE_U32", "u32"),
                    Std | Stdu | Stdx | Stdux => ("PPC_STORE_U64", "u64"),
                    Sthbrx => ("PPC_STORE_LE_U16", "u16"),
                    Stwbrx => ("PPC_STORE_LE_U32", "u32"),
                    _ => return Err(super::malformed(inst)),
                };
                let source = self.names.gpr(inst.req_gpr(0)?, member)?;
                let store = self.call(helper, &[address, &source])?;
                self.line(format!("{};", store));
            }
        }
        self.write_back(inst)
    }

    /// `lmw rT, d(rA)`: rT..r31 from consecutive words.
    fn load_multiple(&mut self, inst: &Instruction) -> Result<(), RecompilerError> {
        let first = inst.req_gpr(0)?;
        let a = inst.req_gpr(1)?;
        let d = inst.req_imm(2)? as i64;
        let base = self.names.base_or_zero(a)?;
        for (i, r) in (first..32).enumerate() {
            let target = self.names.gpr(r, "u64")?;
            let address = multiple_address(&base, d + 4 * i as i64);
            let value = self.call("PPC_LOAD_U32", &[&address])?;
            self.line(format!("{} = {};", target, value));
        }
        Ok(())
    }

    /// `stmw rS, d(rA)`: rS..r31 to consecutive words.
    fn store_multiple(&mut self, inst: &Instruction) -> Result<(), RecompilerError> {
        let first = inst.req_gpr(0)?;
        let a = inst.req_gpr(1)?;
        let d = inst.req_imm(2)? as i64;
        let base = self.names.base_or_zero(a)?;
        for (i, r) in (first..32).enumerate() {
            let source = self.names.gpr(r, "u32")?;
            let address = multiple_address(&base, d + 4 * i as i64);
            let store = self.call("PPC_STORE_U32", &[&address, &source])?;
            self.line(format!("{};", store));
        }
        Ok(())
    }
}

fn multiple_address(base: &str, displacement: i64) -> String {
    if base == "0" {
        displacement.to_string()
    } else {
        offset(base, displacement)
    }
}
