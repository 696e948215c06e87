//! Integer Lowering
//!
//! Arithmetic, logical, compare, shift and rotate instructions become direct
//! expressions on the GPR unions. Results are written through `u64`/`s64`
//! so the upper half of a register is defined the same way the hardware
//! defines it; Rc forms compare the low word (or the doubleword for the
//! 64-bit-only instructions) into cr0.
//!
//! # Carry and Overflow
//! - XER[CA] is computed before the result is written, because `rD` may
//!   alias a source
//! - OE forms compute the exact 64-bit result of the 32-bit operation into
//!   `overflow` first and flag XER[OV] when it does not fit in 32 bits

use super::{offset, FunctionEmitter, RequiredOperands};
use crate::recompiler::decoder::{rotate_mask, Instruction, Mnemonic};
use crate::recompiler::error::RecompilerError;

/// Views of one GPR.
struct Gpr {
    u8: String,
    s32: String,
    u32: String,
    s64: String,
    u64: String,
}

/// How an OE form detects overflow.
enum OverflowCheck {
    /// Exact result as `int64_t`; overflow if it does not fit in 32 bits
    Exact(String),
    /// Boolean expression evaluated before the result is written
    Condition(String),
}

/// Statements of one XO-form instruction.
struct Lowered {
    check: Option<OverflowCheck>,
    before: Option<String>,
    result: String,
    /// `temp` holds a 33-bit sum whose top bit is the new carry
    carry_out: bool,
}

impl Lowered {
    fn plain(result: String) -> Self {
        Self {
            check: None,
            before: None,
            result,
            carry_out: false,
        }
    }
}

impl FunctionEmitter<'_, '_> {
    fn gpr_views(&mut self, r: u8) -> Result<Gpr, RecompilerError> {
        Ok(Gpr {
            u8: self.names.gpr(r, "u8")?,
            s32: self.names.gpr(r, "s32")?,
            u32: self.names.gpr(r, "u32")?,
            s64: self.names.gpr(r, "s64")?,
            u64: self.names.gpr(r, "u64")?,
        })
    }

    pub(super) fn arithmetic(&mut self, inst: &Instruction) -> Result<(), RecompilerError> {
        use Mnemonic::*;
        let d = inst.req_gpr(0)?;
        match inst.mnemonic {
            Addi | Addis | Addic | Mulli | Subfic => self.arithmetic_immediate(inst, d)?,
            _ => {
                let lowered = self.arithmetic_register(inst, d)?;
                self.write_lowered(lowered, inst.flags.oe)?;
            }
        }
        if inst.flags.rc {
            let doubleword = matches!(inst.mnemonic, Divd | Divdu | Mulhd | Mulhdu | Mulld);
            self.record(d, doubleword)?;
        }
        Ok(())
    }

    fn arithmetic_immediate(&mut self, inst: &Instruction, d: u8) -> Result<(), RecompilerError> {
        let a = inst.req_gpr(1)?;
        let imm = inst.req_imm(2)? as i64;
        let rd = self.names.gpr(d, "s64")?;
        let ra = self.gpr_views(a)?;
        match inst.mnemonic {
            Mnemonic::Addi if a == 0 => self.line(format!("{} = {};", rd, imm)),
            Mnemonic::Addi => self.line(format!("{} = {};", rd, offset(&ra.s64, imm))),
            Mnemonic::Addis if a == 0 => self.line(format!("{} = {};", rd, imm << 16)),
            Mnemonic::Addis => self.line(format!("{} = {};", rd, offset(&ra.s64, imm << 16))),
            Mnemonic::Addic => {
                let ca = self.names.special("xer", "ca")?;
                self.line(format!("{} = {} > 0x{:X};", ca, ra.u32, !(imm as u32)));
                self.line(format!("{} = {};", rd, offset(&ra.s64, imm)));
            }
            Mnemonic::Mulli => self.line(format!("{} = {} * {};", rd, ra.s64, imm)),
            Mnemonic::Subfic => {
                let ca = self.names.special("xer", "ca")?;
                self.line(format!("{} = {} <= 0x{:X};", ca, ra.u32, imm as u32));
                self.line(format!("{} = {} - {};", rd, imm, ra.s64));
            }
            _ => return Err(super::malformed(inst)),
        }
        Ok(())
    }

    fn arithmetic_register(&mut self, inst: &Instruction, d: u8) -> Result<Lowered, RecompilerError> {
        use Mnemonic::*;
        let rd = self.gpr_views(d)?;
        let a = self.gpr_views(inst.req_gpr(1)?)?;
        let ca = self.names.special("xer", "ca")?;

        // Single-source forms.
        let unary = match inst.mnemonic {
            Addme => Some((
                format!("int64_t({}) + {} - 1", a.s32, ca),
                format!("uint64_t({}) + {} + 0xFFFFFFFF", a.u32, ca),
                format!("{} = {} + {} - 1", rd.u64, a.u64, ca),
            )),
            Addze => Some((
                format!("int64_t({}) + {}", a.s32, ca),
                format!("uint64_t({}) + {}", a.u32, ca),
                format!("{} = {} + {}", rd.u64, a.u64, ca),
            )),
            Subfme => Some((
                format!("int64_t(~{}) + {} - 1", a.s32, ca),
                format!("uint64_t(~{}) + {} + 0xFFFFFFFF", a.u32, ca),
                format!("{} = ~{} + {} - 1", rd.u64, a.u64, ca),
            )),
            Subfze => Some((
                format!("int64_t(~{}) + {}", a.s32, ca),
                format!("uint64_t(~{}) + {}", a.u32, ca),
                format!("{} = ~{} + {}", rd.u64, a.u64, ca),
            )),
            _ => None,
        };
        if let Some((exact, sum, result)) = unary {
            let temp = self.temp();
            return Ok(Lowered {
                check: Some(OverflowCheck::Exact(exact)),
                before: Some(format!("{} = {}", temp, sum)),
                result,
                carry_out: true,
            });
        }
        if inst.mnemonic == Neg {
            return Ok(Lowered {
                check: Some(OverflowCheck::Exact(format!("-int64_t({})", a.s32))),
                ..Lowered::plain(format!("{} = ~{} + 1", rd.u64, a.u64))
            });
        }

        let b = self.gpr_views(inst.req_gpr(2)?)?;
        let lowered = match inst.mnemonic {
            Add => Lowered {
                check: Some(OverflowCheck::Exact(format!("int64_t({}) + int64_t({})", a.s32, b.s32))),
                ..Lowered::plain(format!("{} = {} + {}", rd.u64, a.u64, b.u64))
            },
            Addc => Lowered {
                check: Some(OverflowCheck::Exact(format!("int64_t({}) + int64_t({})", a.s32, b.s32))),
                before: Some(format!("{} = {} + {} < {}", ca, a.u32, b.u32, a.u32)),
                ..Lowered::plain(format!("{} = {} + {}", rd.u64, a.u64, b.u64))
            },
            Adde => {
                let temp = self.temp();
                Lowered {
                    check: Some(OverflowCheck::Exact(format!(
                        "int64_t({}) + int64_t({}) + {}",
                        a.s32, b.s32, ca
                    ))),
                    before: Some(format!("{} = uint64_t({}) + uint64_t({}) + {}", temp, a.u32, b.u32, ca)),
                    result: format!("{} = {} + {} + {}", rd.u64, a.u64, b.u64, ca),
                    carry_out: true,
                }
            }
            Subf => Lowered {
                check: Some(OverflowCheck::Exact(format!("int64_t({}) - int64_t({})", b.s32, a.s32))),
                ..Lowered::plain(format!("{} = {} - {}", rd.u64, b.u64, a.u64))
            },
            Subfc => Lowered {
                check: Some(OverflowCheck::Exact(format!("int64_t({}) - int64_t({})", b.s32, a.s32))),
                before: Some(format!("{} = {} >= {}", ca, b.u32, a.u32)),
                ..Lowered::plain(format!("{} = {} - {}", rd.u64, b.u64, a.u64))
            },
            Subfe => {
                let temp = self.temp();
                Lowered {
                    check: Some(OverflowCheck::Exact(format!(
                        "int64_t(~{}) + int64_t({}) + {}",
                        a.s32, b.s32, ca
                    ))),
                    before: Some(format!("{} = uint64_t(~{}) + uint64_t({}) + {}", temp, a.u32, b.u32, ca)),
                    result: format!("{} = ~{} + {} + {}", rd.u64, a.u64, b.u64, ca),
                    carry_out: true,
                }
            }
            Mullw => {
                let product = format!("int64_t({}) * int64_t({})", a.s32, b.s32);
                Lowered {
                    check: Some(OverflowCheck::Exact(product.clone())),
                    ..Lowered::plain(format!("{} = {}", rd.s64, product))
                }
            }
            Mulhw => Lowered::plain(format!(
                "{} = (int64_t({}) * int64_t({})) >> 32",
                rd.s64, a.s32, b.s32
            )),
            Mulhwu => Lowered::plain(format!(
                "{} = (uint64_t({}) * uint64_t({})) >> 32",
                rd.u64, a.u32, b.u32
            )),
            Mulld => Lowered {
                check: Some(OverflowCheck::Condition(self.call("PPC_MULLD_OVERFLOW", &[&a.s64, &b.s64])?)),
                ..Lowered::plain(format!("{} = {} * {}", rd.u64, a.u64, b.u64))
            },
            Mulhd => Lowered::plain(format!("{} = {}", rd.s64, self.call("PPC_MULHD", &[&a.s64, &b.s64])?)),
            Mulhdu => Lowered::plain(format!("{} = {}", rd.u64, self.call("PPC_MULHDU", &[&a.u64, &b.u64])?)),
            Divw => Lowered {
                check: Some(OverflowCheck::Condition(format!(
                    "{} == 0 || ({} == INT32_MIN && {} == -1)",
                    b.s32, a.s32, b.s32
                ))),
                ..Lowered::plain(format!("{} = {}", rd.s64, self.call("PPC_DIVW", &[&a.s32, &b.s32])?))
            },
            Divwu => Lowered {
                check: Some(OverflowCheck::Condition(format!("{} == 0", b.u32))),
                ..Lowered::plain(format!("{} = {}", rd.u64, self.call("PPC_DIVWU", &[&a.u32, &b.u32])?))
            },
            Divd => Lowered {
                check: Some(OverflowCheck::Condition(format!(
                    "{} == 0 || ({} == INT64_MIN && {} == -1)",
                    b.s64, a.s64, b.s64
                ))),
                ..Lowered::plain(format!("{} = {}", rd.s64, self.call("PPC_DIVD", &[&a.s64, &b.s64])?))
            },
            Divdu => Lowered {
                check: Some(OverflowCheck::Condition(format!("{} == 0", b.u64))),
                ..Lowered::plain(format!("{} = {}", rd.u64, self.call("PPC_DIVDU", &[&a.u64, &b.u64])?))
            },
            _ => return Err(super::malformed(inst)),
        };
        Ok(lowered)
    }

    fn write_lowered(&mut self, lowered: Lowered, oe: bool) -> Result<(), RecompilerError> {
        let check = lowered.check.filter(|_| oe);
        let (ov, so) = if check.is_some() {
            (self.names.special("xer", "ov")?, self.names.special("xer", "so")?)
        } else {
            (String::new(), String::new())
        };
        match &check {
            Some(OverflowCheck::Exact(exact)) => {
                let overflow = self.overflow();
                self.line(format!("{} = {};", overflow, exact));
            }
            Some(OverflowCheck::Condition(condition)) => self.line(format!("{} = {};", ov, condition)),
            None => {}
        }
        if let Some(before) = &lowered.before {
            self.line(format!("{};", before));
        }
        self.line(format!("{};", lowered.result));
        if lowered.carry_out {
            let ca = self.names.special("xer", "ca")?;
            let temp = self.temp();
            self.line(format!("{} = {} >> 32;", ca, temp));
        }
        if let Some(check) = &check {
            if let OverflowCheck::Exact(_) = check {
                let overflow = self.overflow();
                self.line(format!("{} = {} != int64_t(int32_t({}));", ov, overflow, overflow));
            }
            self.line(format!("{} |= {};", so, ov));
        }
        Ok(())
    }

    pub(super) fn logical(&mut self, inst: &Instruction) -> Result<(), RecompilerError> {
        use Mnemonic::*;
        let a = inst.req_gpr(0)?;
        let s = inst.req_gpr(1)?;
        let ra = self.names.gpr(a, "u64")?;
        let rs = self.gpr_views(s)?;

        let value = match inst.mnemonic {
            Ori if a == 0 && s == 0 && inst.uimm(2) == Some(0) => return Ok(()),
            Andi | Ori | Xori => {
                let uimm = inst.req_uimm(2)?;
                let op = logical_operator(inst.mnemonic);
                format!("{} {} 0x{:X}", rs.u64, op, uimm)
            }
            Andis | Oris | Xoris => {
                let uimm = inst.req_uimm(2)? as u64;
                let op = logical_operator(inst.mnemonic);
                format!("{} {} 0x{:X}", rs.u64, op, uimm << 16)
            }
            Or if inst.gpr(2) == Some(s) => rs.u64.clone(),
            And | Andc | Or | Orc | Xor => {
                let rb = self.names.gpr(inst.req_gpr(2)?, "u64")?;
                match inst.mnemonic {
                    Andc => format!("{} & ~{}", rs.u64, rb),
                    Orc => format!("{} | ~{}", rs.u64, rb),
                    m => format!("{} {} {}", rs.u64, logical_operator(m), rb),
                }
            }
            Nand | Nor | Eqv => {
                let rb = self.names.gpr(inst.req_gpr(2)?, "u64")?;
                let op = match inst.mnemonic {
                    Nand => "&",
                    Nor => "|",
                    _ => "^",
                };
                format!("~({} {} {})", rs.u64, op, rb)
            }
            Cntlzw => self.call("PPC_CNTLZW", &[&rs.u32])?,
            Cntlzd => self.call("PPC_CNTLZD", &[&rs.u64])?,
            Extsb | Extsh | Extsw => {
                let member = match inst.mnemonic {
                    Extsb => "s8",
                    Extsh => "s16",
                    _ => "s32",
                };
                let source = self.names.gpr(s, member)?;
                let target = self.names.gpr(a, "s64")?;
                self.line(format!("{} = {};", target, source));
                if inst.flags.rc {
                    self.record(a, inst.mnemonic == Extsw)?;
                }
                return Ok(());
            }
            _ => return Err(super::malformed(inst)),
        };
        self.line(format!("{} = {};", ra, value));
        if inst.flags.rc {
            self.record(a, inst.mnemonic == Cntlzd)?;
        }
        Ok(())
    }

    pub(super) fn compare(&mut self, inst: &Instruction) -> Result<(), RecompilerError> {
        use Mnemonic::*;
        let field = inst.req_crf(0)?;
        let a = self.gpr_views(inst.req_gpr(1)?)?;
        let (lhs, rhs) = match inst.mnemonic {
            Cmpw => (a.s32, self.names.gpr(inst.req_gpr(2)?, "s32")?),
            Cmplw => (a.u32, self.names.gpr(inst.req_gpr(2)?, "u32")?),
            Cmpd => (a.s64, self.names.gpr(inst.req_gpr(2)?, "s64")?),
            Cmpld => (a.u64, self.names.gpr(inst.req_gpr(2)?, "u64")?),
            Cmpwi => (a.s32, inst.req_imm(2)?.to_string()),
            Cmpdi => (a.s64, inst.req_imm(2)?.to_string()),
            Cmplwi => (a.u32, inst.req_uimm(2)?.to_string()),
            Cmpldi => (a.u64, inst.req_uimm(2)?.to_string()),
            _ => return Err(super::malformed(inst)),
        };
        self.compare_into(field, &lhs, &rhs)
    }

    pub(super) fn shift(&mut self, inst: &Instruction) -> Result<(), RecompilerError> {
        use Mnemonic::*;
        let a = inst.req_gpr(0)?;
        let ra = self.gpr_views(a)?;
        let rs = self.gpr_views(inst.req_gpr(1)?)?;
        match inst.mnemonic {
            Slw | Srw | Sld | Srd => {
                let rb = self.gpr_views(inst.req_gpr(2)?)?;
                let (source, limit, mask) = match inst.mnemonic {
                    Slw | Srw => (&rs.u32, 0x20, 0x1F),
                    _ => (&rs.u64, 0x40, 0x3F),
                };
                let op = if matches!(inst.mnemonic, Slw | Sld) { "<<" } else { ">>" };
                self.line(format!(
                    "{} = {} & 0x{:X} ? 0 : ({} {} ({} & 0x{:X}));",
                    ra.u64, rb.u8, limit, source, op, rb.u8, mask
                ));
            }
            Sraw | Srad => {
                let rb = self.gpr_views(inst.req_gpr(2)?)?;
                let ca = self.names.special("xer", "ca")?;
                let temp = self.temp();
                if inst.mnemonic == Sraw {
                    self.line(format!("{} = {} & 0x3F;", temp, rb.u32));
                    self.line(format!(
                        "{} = ({} < 0) & (({} & ((1ull << {}) - 1)) != 0);",
                        ca, rs.s32, rs.u32, temp
                    ));
                    self.line(format!("{} = {} >> ({} > 0x1F ? 0x1F : {});", ra.s64, rs.s32, temp, temp));
                } else {
                    self.line(format!("{} = {} & 0x7F;", temp, rb.u64));
                    self.line(format!(
                        "{} = ({} < 0) & (({} > 0x3F) | (({} & ((1ull << ({} & 0x3F)) - 1)) != 0));",
                        ca, rs.s64, temp, rs.u64, temp
                    ));
                    self.line(format!("{} = {} >> ({} > 0x3F ? 0x3F : {});", ra.s64, rs.s64, temp, temp));
                }
            }
            Srawi | Sradi => {
                let sh = inst.req_shift(2)? as u32;
                let ca = self.names.special("xer", "ca")?;
                let (signed, unsigned) = if inst.mnemonic == Srawi {
                    (&rs.s32, &rs.u32)
                } else {
                    (&rs.s64, &rs.u64)
                };
                if sh == 0 {
                    self.line(format!("{} = 0;", ca));
                    self.line(format!("{} = {};", ra.s64, signed));
                } else {
                    let lost = (1u64 << sh) - 1;
                    self.line(format!("{} = ({} < 0) & (({} & 0x{:X}) != 0);", ca, signed, unsigned, lost));
                    self.line(format!("{} = {} >> {};", ra.s64, signed, sh));
                }
            }
            _ => return Err(super::malformed(inst)),
        }
        if inst.flags.rc {
            self.record(a, !matches!(inst.mnemonic, Slw | Srw | Sraw | Srawi))?;
        }
        Ok(())
    }

    pub(super) fn rotate(&mut self, inst: &Instruction) -> Result<(), RecompilerError> {
        use Mnemonic::*;
        let a = inst.req_gpr(0)?;
        let ra = self.names.gpr(a, "u64")?;
        let rs = self.gpr_views(inst.req_gpr(1)?)?;
        let word = matches!(inst.mnemonic, Rlwinm | Rlwnm | Rlwimi);

        let (rotated, mask) = if word {
            let mb = inst.req_mask(3)? as u32;
            let me = inst.req_mask(4)? as u32;
            let amount = match inst.mnemonic {
                Rlwnm => {
                    let rb = self.names.gpr(inst.req_gpr(2)?, "u8")?;
                    format!("{} & 0x1F", rb)
                }
                _ => inst.req_shift(2)?.to_string(),
            };
            (
                self.call("PPC_ROTL32", &[&rs.u32, &amount])?,
                rotate_mask(mb + 32, me + 32),
            )
        } else {
            let sh = inst.req_shift(2)? as u32;
            let bound = inst.req_mask(3)? as u32;
            let mask = match inst.mnemonic {
                Rldicl => rotate_mask(bound, 63),
                Rldicr => rotate_mask(0, bound),
                _ => rotate_mask(bound, 63 - sh),
            };
            (self.call("PPC_ROTL64", &[&rs.u64, &sh.to_string()])?, mask)
        };

        if matches!(inst.mnemonic, Rlwimi | Rldimi) {
            self.line(format!(
                "{} = ({} & 0x{:X}) | ({} & 0x{:X});",
                ra, rotated, mask, ra, !mask
            ));
        } else {
            self.line(format!("{} = {} & 0x{:X};", ra, rotated, mask));
        }
        if inst.flags.rc {
            self.record(a, !word)?;
        }
        Ok(())
    }
}

fn logical_operator(mnemonic: Mnemonic) -> &'static str {
    match mnemonic {
        Mnemonic::And | Mnemonic::Andi | Mnemonic::Andis => "&",
        Mnemonic::Or | Mnemonic::Ori | Mnemonic::Oris => "|",
        _ => "^",
    }
}
