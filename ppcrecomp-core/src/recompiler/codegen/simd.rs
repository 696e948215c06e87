//! AltiVec Lowering
//!
//! Vector instructions map onto `PPC_V*` intrinsics of the contract, which
//! operate on whole `PPCVRegister` values. Lane order is the contract's
//! business; the emitter only passes registers and immediates through.
//!
//! `lvsl`/`lvsr` compute a permute control vector from an address and are
//! the only vector instructions that read a GPR.

use super::{FunctionEmitter, RequiredOperands};
use crate::recompiler::decoder::{Instruction, Mnemonic, Operand};
use crate::recompiler::error::RecompilerError;

impl FunctionEmitter<'_, '_> {
    pub(super) fn vector(&mut self, inst: &Instruction) -> Result<(), RecompilerError> {
        match inst.mnemonic {
            Mnemonic::Lvsl | Mnemonic::Lvsr => {
                let target = self.names.vr(inst.req_vr(0)?)?;
                let address = self.indexed_address(inst.req_gpr(1)?, inst.req_gpr(2)?)?;
                let helper = if inst.mnemonic == Mnemonic::Lvsl {
                    "PPC_LVSL"
                } else {
                    "PPC_LVSR"
                };
                let value = self.call(helper, &[&address])?;
                self.line(format!("{} = {};", target, value));
            }
            _ => {
                let statement = self.intrinsic(inst)?;
                self.line(format!("{};", statement));
                // Only the compares have a record form; it summarises the
                // result lanes into cr6.
                if inst.flags.rc {
                    let target = self.names.vr(inst.req_vr(0)?)?;
                    let update = self.call("PPC_UPDATE_CR6", &[&target])?;
                    self.line(format!("{};", update));
                }
            }
        }
        Ok(())
    }
}

/// True for instructions that touch the vector register file.
pub fn uses_vector_unit(inst: &Instruction) -> bool {
    inst.operands
        .iter()
        .any(|op| matches!(op, Operand::VectorRegister(_)))
}
