//! Register Naming
//!
//! Maps PowerPC registers to C++ expressions on the register-context struct.
//! Every name is resolved through the [`RegisterContext`] once and cached,
//! so a header that lays registers out as `r3` members or as an `r[32]`
//! array yields `ctx.r3.u32` or `ctx.r[3].u32` without the emitter caring.
//!
//! # Memory Optimizations
//! - Resolved names are cached in a `HashMap` keyed by a `Copy` tuple, so
//!   repeated uses of a register cost one lookup and one clone

use crate::recompiler::contract::RegisterContext;
use crate::recompiler::error::RecompilerError;
use std::collections::HashMap;

/// Register file or special register a name resolves against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Slot {
    Gpr(u8),
    Fpr(u8),
    Vr(u8),
    Cr(u8),
    Special(&'static str),
}

/// CR bit names in field order.
const CR_BITS: [&str; 4] = ["lt", "gt", "eq", "so"];

/// Per-function register name resolver.
pub struct RegisterNames<'c> {
    contract: &'c RegisterContext,
    /// `(slot, member)` to C++ expression; member `""` is the bare field
    resolved: HashMap<(Slot, &'static str), String>,
}

impl<'c> RegisterNames<'c> {
    pub fn new(contract: &'c RegisterContext) -> Self {
        Self {
            contract,
            resolved: HashMap::new(),
        }
    }

    pub fn contract(&self) -> &'c RegisterContext {
        self.contract
    }

    fn resolve(&mut self, slot: Slot, member: &'static str) -> Result<String, RecompilerError> {
        if let Some(name) = self.resolved.get(&(slot, member)) {
            return Ok(name.clone());
        }
        let field = match slot {
            Slot::Gpr(r) => self.contract.register("r", r)?,
            Slot::Fpr(r) => self.contract.register("f", r)?,
            Slot::Vr(r) => self.contract.register("v", r)?,
            Slot::Cr(n) => self.contract.register("cr", n)?,
            Slot::Special(name) => self.contract.field(name)?,
        };
        let name = if member.is_empty() {
            field.expr
        } else {
            self.contract.member(&field, member)?
        };
        self.resolved.insert((slot, member), name.clone());
        Ok(name)
    }

    /// `ctx.rN.member`, e.g. `gpr(3, "u32")` is `ctx.r3.u32`.
    #[inline]
    pub fn gpr(&mut self, r: u8, member: &'static str) -> Result<String, RecompilerError> {
        self.resolve(Slot::Gpr(r), member)
    }

    /// `rA` as an address operand: the literal `0` when `rA` is r0.
    pub fn base_or_zero(&mut self, r: u8) -> Result<String, RecompilerError> {
        if r == 0 {
            Ok("0".to_string())
        } else {
            self.gpr(r, "u32")
        }
    }

    /// Bare FP register, checked to have an `f64` view.
    pub fn fpr(&mut self, r: u8) -> Result<String, RecompilerError> {
        self.resolve(Slot::Fpr(r), "f64")?;
        self.resolve(Slot::Fpr(r), "")
    }

    pub fn fpr_member(&mut self, r: u8, member: &'static str) -> Result<String, RecompilerError> {
        self.resolve(Slot::Fpr(r), member)
    }

    /// Bare vector register, checked to have a `u32` lane view.
    pub fn vr(&mut self, r: u8) -> Result<String, RecompilerError> {
        self.resolve(Slot::Vr(r), "u32")?;
        self.resolve(Slot::Vr(r), "")
    }

    /// Bare CR field `crN`.
    pub fn cr(&mut self, field: u8) -> Result<String, RecompilerError> {
        self.resolve(Slot::Cr(field), "eq")?;
        self.resolve(Slot::Cr(field), "")
    }

    /// One bit of a CR field, e.g. `cr_member(0, "lt")`.
    pub fn cr_member(&mut self, field: u8, member: &'static str) -> Result<String, RecompilerError> {
        self.resolve(Slot::Cr(field), member)
    }

    /// CR bit `0..32` in PowerPC numbering.
    pub fn cr_bit(&mut self, bit: u8) -> Result<String, RecompilerError> {
        self.cr_member(bit / 4, CR_BITS[(bit % 4) as usize])
    }

    /// A special register such as `lr`, `ctr`, `xer`, `msr` or `reserved`.
    pub fn special(&mut self, name: &'static str, member: &'static str) -> Result<String, RecompilerError> {
        self.resolve(Slot::Special(name), member)
    }

    /// Fail unless the contract declares `name`.
    #[inline]
    pub fn helper(&self, name: &str) -> Result<(), RecompilerError> {
        self.contract.helper(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARRAY_CONTRACT: &str = r#"
        union Reg { int32_t s32; uint32_t u32; uint64_t u64; double f64; };
        struct Cr { uint8_t lt, gt, eq, so; };
        struct PPCContext { Reg r[32]; Reg f[32]; Cr cr[8]; Reg lr; };
    "#;

    #[test]
    fn names_follow_the_contract_layout() {
        let contract = RegisterContext::parse(ARRAY_CONTRACT);
        let mut names = RegisterNames::new(&contract);
        assert_eq!(names.gpr(3, "u32").unwrap(), "ctx.r[3].u32");
        assert_eq!(names.base_or_zero(0).unwrap(), "0");
        assert_eq!(names.fpr(1).unwrap(), "ctx.f[1]");
        assert_eq!(names.cr_bit(6).unwrap(), "ctx.cr[1].eq");
        assert_eq!(names.special("lr", "u64").unwrap(), "ctx.lr.u64");
    }

    #[test]
    fn missing_pieces_are_emit_errors() {
        let contract = RegisterContext::parse(ARRAY_CONTRACT);
        let mut names = RegisterNames::new(&contract);
        assert!(matches!(names.gpr(3, "s8"), Err(RecompilerError::Emit { .. })));
        assert!(matches!(names.vr(0), Err(RecompilerError::Emit { .. })));
        assert!(matches!(names.special("ctr", "u64"), Err(RecompilerError::Emit { .. })));
    }

    #[test]
    fn bundled_contract_uses_named_members() {
        let contract = RegisterContext::default_contract();
        let mut names = RegisterNames::new(&contract);
        assert_eq!(names.gpr(31, "s64").unwrap(), "ctx.r31.s64");
        assert_eq!(names.vr(7).unwrap(), "ctx.v7");
        assert_eq!(names.special("xer", "ca").unwrap(), "ctx.xer.ca");
    }
}
