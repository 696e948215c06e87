//! Floating-point lowering. Everything except `fmr` goes through a
//! `PPC_<MNEMONIC>` intrinsic that receives the registers in decode order.

use super::{FunctionEmitter, RequiredOperands};
use crate::recompiler::decoder::{Instruction, Mnemonic};
use crate::recompiler::error::RecompilerError;

impl FunctionEmitter<'_, '_> {
    pub(super) fn floating_point(&mut self, inst: &Instruction) -> Result<(), RecompilerError> {
        if inst.mnemonic == Mnemonic::Fmr {
            let target = self.names.fpr_member(inst.req_fpr(0)?, "u64")?;
            let source = self.names.fpr_member(inst.req_fpr(1)?, "u64")?;
            self.line(format!("{} = {};", target, source));
        } else {
            let statement = self.intrinsic(inst)?;
            self.line(format!("{};", statement));
        }
        if inst.flags.rc {
            let update = self.call("PPC_UPDATE_CR1", &[])?;
            self.line(format!("{};", update));
        }
        Ok(())
    }
}
