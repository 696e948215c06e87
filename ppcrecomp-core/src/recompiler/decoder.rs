//! PowerPC Instruction Decoder
//!
//! This module decodes 32-bit big-endian PowerPC words into a structured
//! [`Instruction`]. It covers the integer, floating-point, AltiVec and
//! system instructions that compilers for 32-bit PowerPC consoles and the
//! 64-bit Xenon emit.
//!
//! # Instruction Format
//! - **Primary opcode**: bits 0-5 (`word >> 26`)
//! - **Extended opcode**: bits 21-30 (`(word >> 1) & 0x3FF`) for opcodes 19, 31, 63
//! - **XO-form**: 9-bit extended opcode with the OE bit at bit 21
//! - **A-form**: 5-bit extended opcode (`(word >> 1) & 0x1F`) for opcodes 59 and 63
//! - **VA/VX-form**: 6 and 11-bit extended opcodes for AltiVec (opcode 4)
//!
//! Branch targets are resolved to absolute addresses while decoding, so an
//! instruction never needs its address again after this point.
//!
//! # Memory Optimizations
//! - Operands are stored in a `SmallVec<[Operand; 4]>`; only rotates with
//!   both mask bounds spill to the heap.
//! - `InstructionType` and `Mnemonic` are `#[repr(u8)]`/`#[repr(u16)]`.

use crate::recompiler::error::RecompilerError;
use smallvec::SmallVec;
use std::fmt;

/// Operand list of a decoded instruction.
pub type Operands = SmallVec<[Operand; 4]>;

/// Special-purpose register numbers the emitter maps to named context fields.
pub const SPR_XER: u16 = 1;
pub const SPR_LR: u16 = 8;
pub const SPR_CTR: u16 = 9;
pub const TBR_TBL: u16 = 268;
pub const TBR_TBU: u16 = 269;

/// Instruction category used to dispatch emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum InstructionType {
    Arithmetic,
    Logical,
    Compare,
    Shift,
    Rotate,
    Load,
    Store,
    Branch,
    Move,
    ConditionRegister,
    FloatingPoint,
    Vector,
    System,
    Trap,
}

/// Every instruction the decoder understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum Mnemonic {
    // Arithmetic
    Add,
    Addc,
    Adde,
    Addi,
    Addic,
    Addis,
    Addme,
    Addze,
    Divd,
    Divdu,
    Divw,
    Divwu,
    Mulhd,
    Mulhdu,
    Mulhw,
    Mulhwu,
    Mulld,
    Mulli,
    Mullw,
    Neg,
    Subf,
    Subfc,
    Subfe,
    Subfic,
    Subfme,
    Subfze,
    // Logical
    And,
    Andc,
    Andi,
    Andis,
    Cntlzd,
    Cntlzw,
    Eqv,
    Extsb,
    Extsh,
    Extsw,
    Nand,
    Nor,
    Or,
    Orc,
    Ori,
    Oris,
    Xor,
    Xori,
    Xoris,
    // Compare
    Cmpd,
    Cmpdi,
    Cmpld,
    Cmpldi,
    Cmplw,
    Cmplwi,
    Cmpw,
    Cmpwi,
    // Shift
    Sld,
    Slw,
    Srad,
    Sradi,
    Sraw,
    Srawi,
    Srd,
    Srw,
    // Rotate
    Rldic,
    Rldicl,
    Rldicr,
    Rldimi,
    Rlwimi,
    Rlwinm,
    Rlwnm,
    // Load
    Lbz,
    Lbzu,
    Lbzux,
    Lbzx,
    Ld,
    Ldarx,
    Ldu,
    Ldux,
    Ldx,
    Lha,
    Lhau,
    Lhaux,
    Lhax,
    Lhbrx,
    Lhz,
    Lhzu,
    Lhzux,
    Lhzx,
    Lmw,
    Lwa,
    Lwarx,
    Lwaux,
    Lwax,
    Lwbrx,
    Lwz,
    Lwzu,
    Lwzux,
    Lwzx,
    Lfd,
    Lfdu,
    Lfdux,
    Lfdx,
    Lfs,
    Lfsu,
    Lfsux,
    Lfsx,
    Lvx,
    Lvxl,
    // Store
    Stb,
    Stbu,
    Stbux,
    Stbx,
    Std,
    Stdcx,
    Stdu,
    Stdux,
    Stdx,
    Sth,
    Sthbrx,
    Sthu,
    Sthux,
    Sthx,
    Stmw,
    Stw,
    Stwbrx,
    Stwcx,
    Stwu,
    Stwux,
    Stwx,
    Stfd,
    Stfdu,
    Stfdux,
    Stfdx,
    Stfiwx,
    Stfs,
    Stfsu,
    Stfsux,
    Stfsx,
    Stvx,
    Stvxl,
    // Branch
    B,
    Bc,
    Bcctr,
    Bclr,
    // Move
    Mfcr,
    Mfmsr,
    Mfspr,
    Mftb,
    Mtcrf,
    Mtmsr,
    Mtmsrd,
    Mtspr,
    // ConditionRegister
    Crand,
    Crandc,
    Creqv,
    Crnand,
    Crnor,
    Cror,
    Crorc,
    Crxor,
    Mcrf,
    // FloatingPoint
    Fabs,
    Fadd,
    Fadds,
    Fcfid,
    Fcmpo,
    Fcmpu,
    Fctid,
    Fctidz,
    Fctiw,
    Fctiwz,
    Fdiv,
    Fdivs,
    Fmadd,
    Fmadds,
    Fmr,
    Fmsub,
    Fmsubs,
    Fmul,
    Fmuls,
    Fnabs,
    Fneg,
    Fnmadd,
    Fnmadds,
    Fnmsub,
    Fnmsubs,
    Fres,
    Frsp,
    Frsqrte,
    Fsel,
    Fsqrt,
    Fsqrts,
    Fsub,
    Fsubs,
    Mffs,
    Mtfsb0,
    Mtfsb1,
    Mtfsf,
    // Vector
    Lvsl,
    Lvsr,
    Vaddfp,
    Vadduwm,
    Vand,
    Vandc,
    Vcfsx,
    Vcfux,
    Vcmpbfp,
    Vcmpeqfp,
    Vcmpequw,
    Vcmpgefp,
    Vcmpgtfp,
    Vcmpgtsw,
    Vcmpgtuw,
    Vctsxs,
    Vctuxs,
    Vmaddfp,
    Vmaxfp,
    Vminfp,
    Vmrghw,
    Vmrglw,
    Vnmsubfp,
    Vnor,
    Vor,
    Vperm,
    Vrefp,
    Vrsqrtefp,
    Vsel,
    Vsldoi,
    Vslw,
    Vspltisb,
    Vspltish,
    Vspltisw,
    Vspltw,
    Vsraw,
    Vsrw,
    Vsubfp,
    Vsubuwm,
    Vxor,
    // System
    Dcbf,
    Dcbi,
    Dcbst,
    Dcbt,
    Dcbtst,
    Dcbz,
    Eieio,
    Icbi,
    Isync,
    Sc,
    Sync,
    // Trap
    Td,
    Tdi,
    Tw,
    Twi,
}

impl Mnemonic {
    /// Base assembler name, without OE/Rc suffixes.
    pub fn as_str(self) -> &'static str {
        match self {
            Mnemonic::Add => "add",
            Mnemonic::Addc => "addc",
            Mnemonic::Adde => "adde",
            Mnemonic::Addi => "addi",
            Mnemonic::Addic => "addic",
            Mnemonic::Addis => "addis",
            Mnemonic::Addme => "addme",
            Mnemonic::Addze => "addze",
            Mnemonic::Divd => "divd",
            Mnemonic::Divdu => "divdu",
            Mnemonic::Divw => "divw",
            Mnemonic::Divwu => "divwu",
            Mnemonic::Mulhd => "mulhd",
            Mnemonic::Mulhdu => "mulhdu",
            Mnemonic::Mulhw => "mulhw",
            Mnemonic::Mulhwu => "mulhwu",
            Mnemonic::Mulld => "mulld",
            Mnemonic::Mulli => "mulli",
            Mnemonic::Mullw => "mullw",
            Mnemonic::Neg => "neg",
            Mnemonic::Subf => "subf",
            Mnemonic::Subfc => "subfc",
            Mnemonic::Subfe => "subfe",
            Mnemonic::Subfic => "subfic",
            Mnemonic::Subfme => "subfme",
            Mnemonic::Subfze => "subfze",
            Mnemonic::And => "and",
            Mnemonic::Andc => "andc",
            Mnemonic::Andi => "andi",
            Mnemonic::Andis => "andis",
            Mnemonic::Cntlzd => "cntlzd",
            Mnemonic::Cntlzw => "cntlzw",
            Mnemonic::Eqv => "eqv",
            Mnemonic::Extsb => "extsb",
            Mnemonic::Extsh => "extsh",
            Mnemonic::Extsw => "extsw",
            Mnemonic::Nand => "nand",
            Mnemonic::Nor => "nor",
            Mnemonic::Or => "or",
            Mnemonic::Orc => "orc",
            Mnemonic::Ori => "ori",
            Mnemonic::Oris => "oris",
            Mnemonic::Xor => "xor",
            Mnemonic::Xori => "xori",
            Mnemonic::Xoris => "xoris",
            Mnemonic::Cmpd => "cmpd",
            Mnemonic::Cmpdi => "cmpdi",
            Mnemonic::Cmpld => "cmpld",
            Mnemonic::Cmpldi => "cmpldi",
            Mnemonic::Cmplw => "cmplw",
            Mnemonic::Cmplwi => "cmplwi",
            Mnemonic::Cmpw => "cmpw",
            Mnemonic::Cmpwi => "cmpwi",
            Mnemonic::Sld => "sld",
            Mnemonic::Slw => "slw",
            Mnemonic::Srad => "srad",
            Mnemonic::Sradi => "sradi",
            Mnemonic::Sraw => "sraw",
            Mnemonic::Srawi => "srawi",
            Mnemonic::Srd => "srd",
            Mnemonic::Srw => "srw",
            Mnemonic::Rldic => "rldic",
            Mnemonic::Rldicl => "rldicl",
            Mnemonic::Rldicr => "rldicr",
            Mnemonic::Rldimi => "rldimi",
            Mnemonic::Rlwimi => "rlwimi",
            Mnemonic::Rlwinm => "rlwinm",
            Mnemonic::Rlwnm => "rlwnm",
            Mnemonic::Lbz => "lbz",
            Mnemonic::Lbzu => "lbzu",
            Mnemonic::Lbzux => "lbzux",
            Mnemonic::Lbzx => "lbzx",
            Mnemonic::Ld => "ld",
            Mnemonic::Ldarx => "ldarx",
            Mnemonic::Ldu => "ldu",
            Mnemonic::Ldux => "ldux",
            Mnemonic::Ldx => "ldx",
            Mnemonic::Lha => "lha",
            Mnemonic::Lhau => "lhau",
            Mnemonic::Lhaux => "lhaux",
            Mnemonic::Lhax => "lhax",
            Mnemonic::Lhbrx => "lhbrx",
            Mnemonic::Lhz => "lhz",
            Mnemonic::Lhzu => "lhzu",
            Mnemonic::Lhzux => "lhzux",
            Mnemonic::Lhzx => "lhzx",
            Mnemonic::Lmw => "lmw",
            Mnemonic::Lwa => "lwa",
            Mnemonic::Lwarx => "lwarx",
            Mnemonic::Lwaux => "lwaux",
            Mnemonic::Lwax => "lwax",
            Mnemonic::Lwbrx => "lwbrx",
            Mnemonic::Lwz => "lwz",
            Mnemonic::Lwzu => "lwzu",
            Mnemonic::Lwzux => "lwzux",
            Mnemonic::Lwzx => "lwzx",
            Mnemonic::Lfd => "lfd",
            Mnemonic::Lfdu => "lfdu",
            Mnemonic::Lfdux => "lfdux",
            Mnemonic::Lfdx => "lfdx",
            Mnemonic::Lfs => "lfs",
            Mnemonic::Lfsu => "lfsu",
            Mnemonic::Lfsux => "lfsux",
            Mnemonic::Lfsx => "lfsx",
            Mnemonic::Lvx => "lvx",
            Mnemonic::Lvxl => "lvxl",
            Mnemonic::Stb => "stb",
            Mnemonic::Stbu => "stbu",
            Mnemonic::Stbux => "stbux",
            Mnemonic::Stbx => "stbx",
            Mnemonic::Std => "std",
            Mnemonic::Stdcx => "stdcx",
            Mnemonic::Stdu => "stdu",
            Mnemonic::Stdux => "stdux",
            Mnemonic::Stdx => "stdx",
            Mnemonic::Sth => "sth",
            Mnemonic::Sthbrx => "sthbrx",
            Mnemonic::Sthu => "sthu",
            Mnemonic::Sthux => "sthux",
            Mnemonic::Sthx => "sthx",
            Mnemonic::Stmw => "stmw",
            Mnemonic::Stw => "stw",
            Mnemonic::Stwbrx => "stwbrx",
            Mnemonic::Stwcx => "stwcx",
            Mnemonic::Stwu => "stwu",
            Mnemonic::Stwux => "stwux",
            Mnemonic::Stwx => "stwx",
            Mnemonic::Stfd => "stfd",
            Mnemonic::Stfdu => "stfdu",
            Mnemonic::Stfdux => "stfdux",
            Mnemonic::Stfdx => "stfdx",
            Mnemonic::Stfiwx => "stfiwx",
            Mnemonic::Stfs => "stfs",
            Mnemonic::Stfsu => "stfsu",
            Mnemonic::Stfsux => "stfsux",
            Mnemonic::Stfsx => "stfsx",
            Mnemonic::Stvx => "stvx",
            Mnemonic::Stvxl => "stvxl",
            Mnemonic::B => "b",
            Mnemonic::Bc => "bc",
            Mnemonic::Bcctr => "bcctr",
            Mnemonic::Bclr => "bclr",
            Mnemonic::Mfcr => "mfcr",
            Mnemonic::Mfmsr => "mfmsr",
            Mnemonic::Mfspr => "mfspr",
            Mnemonic::Mftb => "mftb",
            Mnemonic::Mtcrf => "mtcrf",
            Mnemonic::Mtmsr => "mtmsr",
            Mnemonic::Mtmsrd => "mtmsrd",
            Mnemonic::Mtspr => "mtspr",
            Mnemonic::Crand => "crand",
            Mnemonic::Crandc => "crandc",
            Mnemonic::Creqv => "creqv",
            Mnemonic::Crnand => "crnand",
            Mnemonic::Crnor => "crnor",
            Mnemonic::Cror => "cror",
            Mnemonic::Crorc => "crorc",
            Mnemonic::Crxor => "crxor",
            Mnemonic::Mcrf => "mcrf",
            Mnemonic::Fabs => "fabs",
            Mnemonic::Fadd => "fadd",
            Mnemonic::Fadds => "fadds",
            Mnemonic::Fcfid => "fcfid",
            Mnemonic::Fcmpo => "fcmpo",
            Mnemonic::Fcmpu => "fcmpu",
            Mnemonic::Fctid => "fctid",
            Mnemonic::Fctidz => "fctidz",
            Mnemonic::Fctiw => "fctiw",
            Mnemonic::Fctiwz => "fctiwz",
            Mnemonic::Fdiv => "fdiv",
            Mnemonic::Fdivs => "fdivs",
            Mnemonic::Fmadd => "fmadd",
            Mnemonic::Fmadds => "fmadds",
            Mnemonic::Fmr => "fmr",
            Mnemonic::Fmsub => "fmsub",
            Mnemonic::Fmsubs => "fmsubs",
            Mnemonic::Fmul => "fmul",
            Mnemonic::Fmuls => "fmuls",
            Mnemonic::Fnabs => "fnabs",
            Mnemonic::Fneg => "fneg",
            Mnemonic::Fnmadd => "fnmadd",
            Mnemonic::Fnmadds => "fnmadds",
            Mnemonic::Fnmsub => "fnmsub",
            Mnemonic::Fnmsubs => "fnmsubs",
            Mnemonic::Fres => "fres",
            Mnemonic::Frsp => "frsp",
            Mnemonic::Frsqrte => "frsqrte",
            Mnemonic::Fsel => "fsel",
            Mnemonic::Fsqrt => "fsqrt",
            Mnemonic::Fsqrts => "fsqrts",
            Mnemonic::Fsub => "fsub",
            Mnemonic::Fsubs => "fsubs",
            Mnemonic::Mffs => "mffs",
            Mnemonic::Mtfsb0 => "mtfsb0",
            Mnemonic::Mtfsb1 => "mtfsb1",
            Mnemonic::Mtfsf => "mtfsf",
            Mnemonic::Lvsl => "lvsl",
            Mnemonic::Lvsr => "lvsr",
            Mnemonic::Vaddfp => "vaddfp",
            Mnemonic::Vadduwm => "vadduwm",
            Mnemonic::Vand => "vand",
            Mnemonic::Vandc => "vandc",
            Mnemonic::Vcfsx => "vcfsx",
            Mnemonic::Vcfux => "vcfux",
            Mnemonic::Vcmpbfp => "vcmpbfp",
            Mnemonic::Vcmpeqfp => "vcmpeqfp",
            Mnemonic::Vcmpequw => "vcmpequw",
            Mnemonic::Vcmpgefp => "vcmpgefp",
            Mnemonic::Vcmpgtfp => "vcmpgtfp",
            Mnemonic::Vcmpgtsw => "vcmpgtsw",
            Mnemonic::Vcmpgtuw => "vcmpgtuw",
            Mnemonic::Vctsxs => "vctsxs",
            Mnemonic::Vctuxs => "vctuxs",
            Mnemonic::Vmaddfp => "vmaddfp",
            Mnemonic::Vmaxfp => "vmaxfp",
            Mnemonic::Vminfp => "vminfp",
            Mnemonic::Vmrghw => "vmrghw",
            Mnemonic::Vmrglw => "vmrglw",
            Mnemonic::Vnmsubfp => "vnmsubfp",
            Mnemonic::Vnor => "vnor",
            Mnemonic::Vor => "vor",
            Mnemonic::Vperm => "vperm",
            Mnemonic::Vrefp => "vrefp",
            Mnemonic::Vrsqrtefp => "vrsqrtefp",
            Mnemonic::Vsel => "vsel",
            Mnemonic::Vsldoi => "vsldoi",
            Mnemonic::Vslw => "vslw",
            Mnemonic::Vspltisb => "vspltisb",
            Mnemonic::Vspltish => "vspltish",
            Mnemonic::Vspltisw => "vspltisw",
            Mnemonic::Vspltw => "vspltw",
            Mnemonic::Vsraw => "vsraw",
            Mnemonic::Vsrw => "vsrw",
            Mnemonic::Vsubfp => "vsubfp",
            Mnemonic::Vsubuwm => "vsubuwm",
            Mnemonic::Vxor => "vxor",
            Mnemonic::Dcbf => "dcbf",
            Mnemonic::Dcbi => "dcbi",
            Mnemonic::Dcbst => "dcbst",
            Mnemonic::Dcbt => "dcbt",
            Mnemonic::Dcbtst => "dcbtst",
            Mnemonic::Dcbz => "dcbz",
            Mnemonic::Eieio => "eieio",
            Mnemonic::Icbi => "icbi",
            Mnemonic::Isync => "isync",
            Mnemonic::Sc => "sc",
            Mnemonic::Sync => "sync",
            Mnemonic::Td => "td",
            Mnemonic::Tdi => "tdi",
            Mnemonic::Tw => "tw",
            Mnemonic::Twi => "twi",
        }
    }

    /// Category used by the emitter.
    pub fn instruction_type(self) -> InstructionType {
        match self {
            Mnemonic::Add | Mnemonic::Addc | Mnemonic::Adde | Mnemonic::Addi |
            Mnemonic::Addic | Mnemonic::Addis | Mnemonic::Addme | Mnemonic::Addze |
            Mnemonic::Divd | Mnemonic::Divdu | Mnemonic::Divw | Mnemonic::Divwu |
            Mnemonic::Mulhd | Mnemonic::Mulhdu | Mnemonic::Mulhw | Mnemonic::Mulhwu |
            Mnemonic::Mulld | Mnemonic::Mulli | Mnemonic::Mullw | Mnemonic::Neg |
            Mnemonic::Subf | Mnemonic::Subfc | Mnemonic::Subfe | Mnemonic::Subfic |
            Mnemonic::Subfme | Mnemonic::Subfze => InstructionType::Arithmetic,
            Mnemonic::And | Mnemonic::Andc | Mnemonic::Andi | Mnemonic::Andis |
            Mnemonic::Cntlzd | Mnemonic::Cntlzw | Mnemonic::Eqv | Mnemonic::Extsb |
            Mnemonic::Extsh | Mnemonic::Extsw | Mnemonic::Nand | Mnemonic::Nor | Mnemonic::Or |
            Mnemonic::Orc | Mnemonic::Ori | Mnemonic::Oris | Mnemonic::Xor | Mnemonic::Xori |
            Mnemonic::Xoris => InstructionType::Logical,
            Mnemonic::Cmpd | Mnemonic::Cmpdi | Mnemonic::Cmpld | Mnemonic::Cmpldi |
            Mnemonic::Cmplw | Mnemonic::Cmplwi | Mnemonic::Cmpw | Mnemonic::Cmpwi => InstructionType::Compare,
            Mnemonic::Sld | Mnemonic::Slw | Mnemonic::Srad | Mnemonic::Sradi | Mnemonic::Sraw |
            Mnemonic::Srawi | Mnemonic::Srd | Mnemonic::Srw => InstructionType::Shift,
            Mnemonic::Rldic | Mnemonic::Rldicl | Mnemonic::Rldicr | Mnemonic::Rldimi |
            Mnemonic::Rlwimi | Mnemonic::Rlwinm | Mnemonic::Rlwnm => InstructionType::Rotate,
            Mnemonic::Lbz | Mnemonic::Lbzu | Mnemonic::Lbzux | Mnemonic::Lbzx | Mnemonic::Ld |
            Mnemonic::Ldarx | Mnemonic::Ldu | Mnemonic::Ldux | Mnemonic::Ldx | Mnemonic::Lha |
            Mnemonic::Lhau | Mnemonic::Lhaux | Mnemonic::Lhax | Mnemonic::Lhbrx |
            Mnemonic::Lhz | Mnemonic::Lhzu | Mnemonic::Lhzux | Mnemonic::Lhzx | Mnemonic::Lmw |
            Mnemonic::Lwa | Mnemonic::Lwarx | Mnemonic::Lwaux | Mnemonic::Lwax |
            Mnemonic::Lwbrx | Mnemonic::Lwz | Mnemonic::Lwzu | Mnemonic::Lwzux |
            Mnemonic::Lwzx | Mnemonic::Lfd | Mnemonic::Lfdu | Mnemonic::Lfdux |
            Mnemonic::Lfdx | Mnemonic::Lfs | Mnemonic::Lfsu | Mnemonic::Lfsux |
            Mnemonic::Lfsx | Mnemonic::Lvx | Mnemonic::Lvxl => InstructionType::Load,
            Mnemonic::Stb | Mnemonic::Stbu | Mnemonic::Stbux | Mnemonic::Stbx | Mnemonic::Std |
            Mnemonic::Stdcx | Mnemonic::Stdu | Mnemonic::Stdux | Mnemonic::Stdx |
            Mnemonic::Sth | Mnemonic::Sthbrx | Mnemonic::Sthu | Mnemonic::Sthux |
            Mnemonic::Sthx | Mnemonic::Stmw | Mnemonic::Stw | Mnemonic::Stwbrx |
            Mnemonic::Stwcx | Mnemonic::Stwu | Mnemonic::Stwux | Mnemonic::Stwx |
            Mnemonic::Stfd | Mnemonic::Stfdu | Mnemonic::Stfdux | Mnemonic::Stfdx |
            Mnemonic::Stfiwx | Mnemonic::Stfs | Mnemonic::Stfsu | Mnemonic::Stfsux |
            Mnemonic::Stfsx | Mnemonic::Stvx | Mnemonic::Stvxl => InstructionType::Store,
            Mnemonic::B | Mnemonic::Bc | Mnemonic::Bcctr | Mnemonic::Bclr => InstructionType::Branch,
            Mnemonic::Mfcr | Mnemonic::Mfmsr | Mnemonic::Mfspr | Mnemonic::Mftb |
            Mnemonic::Mtcrf | Mnemonic::Mtmsr | Mnemonic::Mtmsrd | Mnemonic::Mtspr => InstructionType::Move,
            Mnemonic::Crand | Mnemonic::Crandc | Mnemonic::Creqv | Mnemonic::Crnand |
            Mnemonic::Crnor | Mnemonic::Cror | Mnemonic::Crorc | Mnemonic::Crxor |
            Mnemonic::Mcrf => InstructionType::ConditionRegister,
            Mnemonic::Fabs | Mnemonic::Fadd | Mnemonic::Fadds | Mnemonic::Fcfid |
            Mnemonic::Fcmpo | Mnemonic::Fcmpu | Mnemonic::Fctid | Mnemonic::Fctidz |
            Mnemonic::Fctiw | Mnemonic::Fctiwz | Mnemonic::Fdiv | Mnemonic::Fdivs |
            Mnemonic::Fmadd | Mnemonic::Fmadds | Mnemonic::Fmr | Mnemonic::Fmsub |
            Mnemonic::Fmsubs | Mnemonic::Fmul | Mnemonic::Fmuls | Mnemonic::Fnabs |
            Mnemonic::Fneg | Mnemonic::Fnmadd | Mnemonic::Fnmadds | Mnemonic::Fnmsub |
            Mnemonic::Fnmsubs | Mnemonic::Fres | Mnemonic::Frsp | Mnemonic::Frsqrte |
            Mnemonic::Fsel | Mnemonic::Fsqrt | Mnemonic::Fsqrts | Mnemonic::Fsub |
            Mnemonic::Fsubs | Mnemonic::Mffs | Mnemonic::Mtfsb0 | Mnemonic::Mtfsb1 |
            Mnemonic::Mtfsf => InstructionType::FloatingPoint,
            Mnemonic::Lvsl | Mnemonic::Lvsr | Mnemonic::Vaddfp | Mnemonic::Vadduwm |
            Mnemonic::Vand | Mnemonic::Vandc | Mnemonic::Vcfsx | Mnemonic::Vcfux |
            Mnemonic::Vcmpbfp | Mnemonic::Vcmpeqfp | Mnemonic::Vcmpequw | Mnemonic::Vcmpgefp |
            Mnemonic::Vcmpgtfp | Mnemonic::Vcmpgtsw | Mnemonic::Vcmpgtuw | Mnemonic::Vctsxs |
            Mnemonic::Vctuxs | Mnemonic::Vmaddfp | Mnemonic::Vmaxfp | Mnemonic::Vminfp |
            Mnemonic::Vmrghw | Mnemonic::Vmrglw | Mnemonic::Vnmsubfp | Mnemonic::Vnor |
            Mnemonic::Vor | Mnemonic::Vperm | Mnemonic::Vrefp | Mnemonic::Vrsqrtefp |
            Mnemonic::Vsel | Mnemonic::Vsldoi | Mnemonic::Vslw | Mnemonic::Vspltisb |
            Mnemonic::Vspltish | Mnemonic::Vspltisw | Mnemonic::Vspltw | Mnemonic::Vsraw |
            Mnemonic::Vsrw | Mnemonic::Vsubfp | Mnemonic::Vsubuwm | Mnemonic::Vxor => InstructionType::Vector,
            Mnemonic::Dcbf | Mnemonic::Dcbi | Mnemonic::Dcbst | Mnemonic::Dcbt |
            Mnemonic::Dcbtst | Mnemonic::Dcbz | Mnemonic::Eieio | Mnemonic::Icbi |
            Mnemonic::Isync | Mnemonic::Sc | Mnemonic::Sync => InstructionType::System,
            Mnemonic::Td | Mnemonic::Tdi | Mnemonic::Tw | Mnemonic::Twi => InstructionType::Trap,
        }
    }

    /// Loads and stores whose effective address is `d(rA)`.
    pub fn is_displacement_form(self) -> bool {
        matches!(
            self,
            Mnemonic::Lbz
                | Mnemonic::Lbzu
                | Mnemonic::Ld
                | Mnemonic::Ldu
                | Mnemonic::Lha
                | Mnemonic::Lhau
                | Mnemonic::Lhz
                | Mnemonic::Lhzu
                | Mnemonic::Lmw
                | Mnemonic::Lwa
                | Mnemonic::Lwz
                | Mnemonic::Lwzu
                | Mnemonic::Lfd
                | Mnemonic::Lfdu
                | Mnemonic::Lfs
                | Mnemonic::Lfsu
                | Mnemonic::Stb
                | Mnemonic::Stbu
                | Mnemonic::Std
                | Mnemonic::Stdu
                | Mnemonic::Sth
                | Mnemonic::Sthu
                | Mnemonic::Stmw
                | Mnemonic::Stw
                | Mnemonic::Stwu
                | Mnemonic::Stfd
                | Mnemonic::Stfdu
                | Mnemonic::Stfs
                | Mnemonic::Stfsu
        )
    }

    /// Loads and stores that write the effective address back to `rA`.
    pub fn is_update_form(self) -> bool {
        matches!(
            self,
            Mnemonic::Lbzu
                | Mnemonic::Lbzux
                | Mnemonic::Ldu
                | Mnemonic::Ldux
                | Mnemonic::Lhau
                | Mnemonic::Lhaux
                | Mnemonic::Lhzu
                | Mnemonic::Lhzux
                | Mnemonic::Lwaux
                | Mnemonic::Lwzu
                | Mnemonic::Lwzux
                | Mnemonic::Lfdu
                | Mnemonic::Lfdux
                | Mnemonic::Lfsu
                | Mnemonic::Lfsux
                | Mnemonic::Stbu
                | Mnemonic::Stbux
                | Mnemonic::Stdu
                | Mnemonic::Stdux
                | Mnemonic::Sthu
                | Mnemonic::Sthux
                | Mnemonic::Stwu
                | Mnemonic::Stwux
                | Mnemonic::Stfdu
                | Mnemonic::Stfdux
                | Mnemonic::Stfsu
                | Mnemonic::Stfsux
        )
    }
}

impl fmt::Display for Mnemonic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instruction operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    /// General-purpose register (r0-r31)
    Register(u8),
    /// Floating-point register (f0-f31)
    FpRegister(u8),
    /// AltiVec register (v0-v31)
    VectorRegister(u8),
    /// Sign-extended immediate or displacement
    Immediate(i32),
    /// Zero-extended immediate, field mask, or TO bits
    UnsignedImmediate(u32),
    /// Absolute branch target
    Address(u32),
    /// Condition register field (cr0-cr7)
    CrField(u8),
    /// Condition register bit (0-31)
    CrBit(u8),
    /// BO field of a conditional branch
    BranchOptions(u8),
    /// Special-purpose or time-base register number
    SpecialRegister(u16),
    /// Rotate or shift amount
    ShiftAmount(u8),
    /// MB or ME field of a rotate
    MaskBound(u8),
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Operand::Register(r) => write!(f, "r{}", r),
            Operand::FpRegister(r) => write!(f, "f{}", r),
            Operand::VectorRegister(r) => write!(f, "v{}", r),
            Operand::Immediate(v) => write!(f, "{}", v),
            Operand::UnsignedImmediate(v) => write!(f, "0x{:X}", v),
            Operand::Address(a) => write!(f, "0x{:08X}", a),
            Operand::CrField(c) => write!(f, "cr{}", c),
            Operand::CrBit(b) => write!(f, "{}", b),
            Operand::BranchOptions(b) => write!(f, "{}", b),
            Operand::SpecialRegister(s) => write!(f, "{}", s),
            Operand::ShiftAmount(s) => write!(f, "{}", s),
            Operand::MaskBound(m) => write!(f, "{}", m),
        }
    }
}

/// OE, Rc, LK and AA bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct InstructionFlags {
    /// Record form: update CR0 (CR1 for FP, CR6 for vector compares)
    pub rc: bool,
    /// Overflow enable: update XER[OV] and XER[SO]
    pub oe: bool,
    /// Link: branch writes the return address to LR
    pub lk: bool,
    /// Absolute branch target
    pub aa: bool,
}

impl InstructionFlags {
    pub const NONE: InstructionFlags = InstructionFlags {
        rc: false,
        oe: false,
        lk: false,
        aa: false,
    };

    #[inline]
    fn record(word: u32) -> Self {
        InstructionFlags {
            rc: word & 1 != 0,
            ..Self::NONE
        }
    }

    #[inline]
    fn always_record() -> Self {
        InstructionFlags {
            rc: true,
            ..Self::NONE
        }
    }
}

/// PowerPC instruction representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Primary opcode (bits 0-5)
    pub opcode: u8,
    pub mnemonic: Mnemonic,
    pub instruction_type: InstructionType,
    pub flags: InstructionFlags,
    pub operands: Operands,
}

/// Decoded instruction with its raw word and address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub instruction: Instruction,
    pub raw: u32,
    pub address: u32,
}

type Decoded = Option<(Mnemonic, InstructionFlags, Operands)>;

#[inline(always)]
fn operands<const N: usize>(items: [Operand; N]) -> Operands {
    items.into_iter().collect()
}

#[inline(always)]
fn rd(word: u32) -> u8 {
    ((word >> 21) & 0x1F) as u8
}

#[inline(always)]
fn ra(word: u32) -> u8 {
    ((word >> 16) & 0x1F) as u8
}

#[inline(always)]
fn rb(word: u32) -> u8 {
    ((word >> 11) & 0x1F) as u8
}

#[inline(always)]
fn rc_field(word: u32) -> u8 {
    ((word >> 6) & 0x1F) as u8
}

#[inline(always)]
fn simm(word: u32) -> i32 {
    (word & 0xFFFF) as u16 as i16 as i32
}

#[inline(always)]
fn uimm(word: u32) -> u32 {
    word & 0xFFFF
}

#[inline(always)]
fn xo10(word: u32) -> u32 {
    (word >> 1) & 0x3FF
}

/// Bit mask for a rotate with PowerPC (MSB = bit 0) bounds `mb..=me` in
/// 64-bit numbering. A 32-bit rotate uses `rotate_mask(mb + 32, me + 32)`.
/// When `mb > me` the mask wraps around.
#[inline]
pub fn rotate_mask(mb: u32, me: u32) -> u64 {
    let begin: u64 = u64::MAX >> (mb & 63);
    let end: u64 = u64::MAX << (63 - (me & 63));
    if mb <= me {
        begin & end
    } else {
        begin | end
    }
}

impl Instruction {
    /// Decode a PowerPC instruction from a 32-bit word.
    ///
    /// # Arguments
    /// * `word` - 32-bit instruction word (big-endian order already applied)
    /// * `address` - Address of the word, used to resolve relative branches
    ///
    /// # Errors
    /// Returns [`RecompilerError::Decode`] for encodings outside the
    /// supported set.
    #[inline(never)] // Large function - don't inline
    pub fn decode(word: u32, address: u32) -> Result<DecodedInstruction, RecompilerError> {
        let opcode: u8 = ((word >> 26) & 0x3F) as u8;

        let decoded: Decoded = match opcode {
            2 => trap_immediate(Mnemonic::Tdi, word),
            3 => trap_immediate(Mnemonic::Twi, word),
            4 => decode_vector(word),
            7 => arith_immediate(Mnemonic::Mulli, word, InstructionFlags::NONE),
            8 => arith_immediate(Mnemonic::Subfic, word, InstructionFlags::NONE),
            10 => {
                let mnemonic = if word & 0x0020_0000 != 0 {
                    Mnemonic::Cmpldi
                } else {
                    Mnemonic::Cmplwi
                };
                Some((
                    mnemonic,
                    InstructionFlags::NONE,
                    operands([
                        Operand::CrField(rd(word) >> 2),
                        Operand::Register(ra(word)),
                        Operand::UnsignedImmediate(uimm(word)),
                    ]),
                ))
            }
            11 => {
                let mnemonic = if word & 0x0020_0000 != 0 {
                    Mnemonic::Cmpdi
                } else {
                    Mnemonic::Cmpwi
                };
                Some((
                    mnemonic,
                    InstructionFlags::NONE,
                    operands([
                        Operand::CrField(rd(word) >> 2),
                        Operand::Register(ra(word)),
                        Operand::Immediate(simm(word)),
                    ]),
                ))
            }
            12 => arith_immediate(Mnemonic::Addic, word, InstructionFlags::NONE),
            13 => arith_immediate(Mnemonic::Addic, word, InstructionFlags::always_record()),
            14 => arith_immediate(Mnemonic::Addi, word, InstructionFlags::NONE),
            15 => arith_immediate(Mnemonic::Addis, word, InstructionFlags::NONE),
            16 => {
                let bd: i32 = (word & 0xFFFC) as u16 as i16 as i32;
                let flags = branch_flags(word);
                let target = branch_target(address, bd, flags.aa);
                Some((
                    Mnemonic::Bc,
                    flags,
                    operands([
                        Operand::BranchOptions(rd(word)),
                        Operand::CrBit(ra(word)),
                        Operand::Address(target),
                    ]),
                ))
            }
            17 if word & 2 != 0 => Some((Mnemonic::Sc, InstructionFlags::NONE, Operands::new())),
            18 => {
                // LI is a 24-bit word offset; shift it to the top and back
                // down to sign-extend the 26-bit byte offset.
                let li: i32 = (((word & 0x03FF_FFFC) << 6) as i32) >> 6;
                let flags = branch_flags(word);
                let target = branch_target(address, li, flags.aa);
                Some((Mnemonic::B, flags, operands([Operand::Address(target)])))
            }
            19 => decode_opcode_19(word),
            20 => rotate_word_immediate(Mnemonic::Rlwimi, word),
            21 => rotate_word_immediate(Mnemonic::Rlwinm, word),
            23 => Some((
                Mnemonic::Rlwnm,
                InstructionFlags::record(word),
                operands([
                    Operand::Register(ra(word)),
                    Operand::Register(rd(word)),
                    Operand::Register(rb(word)),
                    Operand::MaskBound(rc_field(word)),
                    Operand::MaskBound(((word >> 1) & 0x1F) as u8),
                ]),
            )),
            24 => logical_immediate(Mnemonic::Ori, word, InstructionFlags::NONE),
            25 => logical_immediate(Mnemonic::Oris, word, InstructionFlags::NONE),
            26 => logical_immediate(Mnemonic::Xori, word, InstructionFlags::NONE),
            27 => logical_immediate(Mnemonic::Xoris, word, InstructionFlags::NONE),
            28 => logical_immediate(Mnemonic::Andi, word, InstructionFlags::always_record()),
            29 => logical_immediate(Mnemonic::Andis, word, InstructionFlags::always_record()),
            30 => decode_rotate_doubleword(word),
            31 => decode_opcode_31(word),
            32..=47 => {
                let mnemonic = match opcode {
                    32 => Mnemonic::Lwz,
                    33 => Mnemonic::Lwzu,
                    34 => Mnemonic::Lbz,
                    35 => Mnemonic::Lbzu,
                    36 => Mnemonic::Stw,
                    37 => Mnemonic::Stwu,
                    38 => Mnemonic::Stb,
                    39 => Mnemonic::Stbu,
                    40 => Mnemonic::Lhz,
                    41 => Mnemonic::Lhzu,
                    42 => Mnemonic::Lha,
                    43 => Mnemonic::Lhau,
                    44 => Mnemonic::Sth,
                    45 => Mnemonic::Sthu,
                    46 => Mnemonic::Lmw,
                    _ => Mnemonic::Stmw,
                };
                Some((
                    mnemonic,
                    InstructionFlags::NONE,
                    operands([
                        Operand::Register(rd(word)),
                        Operand::Register(ra(word)),
                        Operand::Immediate(simm(word)),
                    ]),
                ))
            }
            48..=55 => {
                let mnemonic = match opcode {
                    48 => Mnemonic::Lfs,
                    49 => Mnemonic::Lfsu,
                    50 => Mnemonic::Lfd,
                    51 => Mnemonic::Lfdu,
                    52 => Mnemonic::Stfs,
                    53 => Mnemonic::Stfsu,
                    54 => Mnemonic::Stfd,
                    _ => Mnemonic::Stfdu,
                };
                Some((
                    mnemonic,
                    InstructionFlags::NONE,
                    operands([
                        Operand::FpRegister(rd(word)),
                        Operand::Register(ra(word)),
                        Operand::Immediate(simm(word)),
                    ]),
                ))
            }
            58 | 62 => {
                let mnemonic = match (opcode, word & 3) {
                    (58, 0) => Mnemonic::Ld,
                    (58, 1) => Mnemonic::Ldu,
                    (58, 2) => Mnemonic::Lwa,
                    (62, 0) => Mnemonic::Std,
                    (62, 1) => Mnemonic::Stdu,
                    _ => return Err(unknown(word, address, "invalid DS-form extended opcode")),
                };
                Some((
                    mnemonic,
                    InstructionFlags::NONE,
                    operands([
                        Operand::Register(rd(word)),
                        Operand::Register(ra(word)),
                        Operand::Immediate((word & 0xFFFC) as u16 as i16 as i32),
                    ]),
                ))
            }
            59 => decode_single_precision(word),
            63 => decode_opcode_63(word),
            _ => None,
        };

        let (mnemonic, flags, operands) = decoded.ok_or_else(|| {
            unknown(
                word,
                address,
                &format!("unsupported encoding (primary opcode {})", opcode),
            )
        })?;

        Ok(DecodedInstruction {
            instruction: Instruction {
                opcode,
                mnemonic,
                instruction_type: mnemonic.instruction_type(),
                flags,
                operands,
            },
            raw: word,
            address,
        })
    }

    #[inline]
    pub fn operand(&self, index: usize) -> Option<&Operand> {
        self.operands.get(index)
    }

    /// GPR number of operand `index`.
    pub fn gpr(&self, index: usize) -> Option<u8> {
        match self.operands.get(index)? {
            Operand::Register(r) => Some(*r),
            _ => None,
        }
    }

    pub fn fpr(&self, index: usize) -> Option<u8> {
        match self.operands.get(index)? {
            Operand::FpRegister(r) => Some(*r),
            _ => None,
        }
    }

    pub fn vr(&self, index: usize) -> Option<u8> {
        match self.operands.get(index)? {
            Operand::VectorRegister(r) => Some(*r),
            _ => None,
        }
    }

    pub fn imm(&self, index: usize) -> Option<i32> {
        match self.operands.get(index)? {
            Operand::Immediate(v) => Some(*v),
            _ => None,
        }
    }

    pub fn uimm(&self, index: usize) -> Option<u32> {
        match self.operands.get(index)? {
            Operand::UnsignedImmediate(v) => Some(*v),
            _ => None,
        }
    }

    pub fn shift(&self, index: usize) -> Option<u8> {
        match self.operands.get(index)? {
            Operand::ShiftAmount(v) => Some(*v),
            _ => None,
        }
    }

    pub fn mask_bound(&self, index: usize) -> Option<u8> {
        match self.operands.get(index)? {
            Operand::MaskBound(v) => Some(*v),
            _ => None,
        }
    }

    pub fn crf(&self, index: usize) -> Option<u8> {
        match self.operands.get(index)? {
            Operand::CrField(v) => Some(*v),
            _ => None,
        }
    }

    pub fn crbit(&self, index: usize) -> Option<u8> {
        match self.operands.get(index)? {
            Operand::CrBit(v) => Some(*v),
            _ => None,
        }
    }

    pub fn spr(&self, index: usize) -> Option<u16> {
        match self.operands.get(index)? {
            Operand::SpecialRegister(v) => Some(*v),
            _ => None,
        }
    }

    /// BO and BI of a conditional branch.
    pub fn branch_options(&self) -> Option<(u8, u8)> {
        match (self.operands.first()?, self.operands.get(1)?) {
            (Operand::BranchOptions(bo), Operand::CrBit(bi)) => Some((*bo, *bi)),
            _ => None,
        }
    }

    /// Resolved target of a direct branch.
    pub fn branch_target(&self) -> Option<u32> {
        self.operands.iter().find_map(|op| match op {
            Operand::Address(a) => Some(*a),
            _ => None,
        })
    }

    /// True for `b`, `bl`, and conditional branches with BO = 1z1zz.
    pub fn is_unconditional(&self) -> bool {
        match self.mnemonic {
            Mnemonic::B => true,
            Mnemonic::Bc | Mnemonic::Bclr | Mnemonic::Bcctr => self
                .branch_options()
                .map(|(bo, _)| bo & 0x14 == 0x14)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// GPR written by this instruction's first operand, for the forms where
    /// operand 0 is the destination.
    pub fn gpr_destination(&self) -> Option<u8> {
        if matches!(self.mnemonic, Mnemonic::Mtmsr | Mnemonic::Mtmsrd) {
            return None;
        }
        match self.instruction_type {
            InstructionType::Arithmetic
            | InstructionType::Logical
            | InstructionType::Shift
            | InstructionType::Rotate
            | InstructionType::Load
            | InstructionType::Move => self.gpr(0),
            _ => None,
        }
    }
}

impl DecodedInstruction {
    #[inline]
    pub fn is_branch(&self) -> bool {
        self.instruction.instruction_type == InstructionType::Branch
    }

    /// Address of the next sequential instruction.
    #[inline]
    pub fn next_address(&self) -> u32 {
        self.address.wrapping_add(4)
    }

    #[inline]
    pub fn mnemonic(&self) -> Mnemonic {
        self.instruction.mnemonic
    }
}

fn unknown(word: u32, address: u32, message: &str) -> RecompilerError {
    RecompilerError::instruction_decode(message, address, word)
}

fn branch_flags(word: u32) -> InstructionFlags {
    InstructionFlags {
        lk: word & 1 != 0,
        aa: word & 2 != 0,
        ..InstructionFlags::NONE
    }
}

#[inline]
fn branch_target(address: u32, offset: i32, absolute: bool) -> u32 {
    if absolute {
        offset as u32
    } else {
        address.wrapping_add(offset as u32)
    }
}

fn trap_immediate(mnemonic: Mnemonic, word: u32) -> Decoded {
    Some((
        mnemonic,
        InstructionFlags::NONE,
        operands([
            Operand::UnsignedImmediate(rd(word) as u32),
            Operand::Register(ra(word)),
            Operand::Immediate(simm(word)),
        ]),
    ))
}

fn arith_immediate(mnemonic: Mnemonic, word: u32, flags: InstructionFlags) -> Decoded {
    Some((
        mnemonic,
        flags,
        operands([
            Operand::Register(rd(word)),
            Operand::Register(ra(word)),
            Operand::Immediate(simm(word)),
        ]),
    ))
}

/// D-form logical ops take `rS` in the RT slot and write `rA`.
fn logical_immediate(mnemonic: Mnemonic, word: u32, flags: InstructionFlags) -> Decoded {
    Some((
        mnemonic,
        flags,
        operands([
            Operand::Register(ra(word)),
            Operand::Register(rd(word)),
            Operand::UnsignedImmediate(uimm(word)),
        ]),
    ))
}

fn rotate_word_immediate(mnemonic: Mnemonic, word: u32) -> Decoded {
    Some((
        mnemonic,
        InstructionFlags::record(word),
        operands([
            Operand::Register(ra(word)),
            Operand::Register(rd(word)),
            Operand::ShiftAmount(rb(word)),
            Operand::MaskBound(rc_field(word)),
            Operand::MaskBound(((word >> 1) & 0x1F) as u8),
        ]),
    ))
}

fn decode_rotate_doubleword(word: u32) -> Decoded {
    let sh: u8 = (rb(word) as u32 | ((word & 2) << 4)) as u8;
    let field: u32 = (word >> 5) & 0x3F;
    let bound: u8 = (((field & 1) << 5) | (field >> 1)) as u8;
    let mnemonic = match (word >> 2) & 0x7 {
        0 => Mnemonic::Rldicl,
        1 => Mnemonic::Rldicr,
        2 => Mnemonic::Rldic,
        3 => Mnemonic::Rldimi,
        _ => return None,
    };
    Some((
        mnemonic,
        InstructionFlags::record(word),
        operands([
            Operand::Register(ra(word)),
            Operand::Register(rd(word)),
            Operand::ShiftAmount(sh),
            Operand::MaskBound(bound),
        ]),
    ))
}

fn decode_opcode_19(word: u32) -> Decoded {
    let cr_logical = |mnemonic: Mnemonic| {
        Some((
            mnemonic,
            InstructionFlags::NONE,
            operands([
                Operand::CrBit(rd(word)),
                Operand::CrBit(ra(word)),
                Operand::CrBit(rb(word)),
            ]),
        ))
    };
    match xo10(word) {
        0 => Some((
            Mnemonic::Mcrf,
            InstructionFlags::NONE,
            operands([
                Operand::CrField(rd(word) >> 2),
                Operand::CrField(ra(word) >> 2),
            ]),
        )),
        16 | 528 => {
            let mnemonic = if xo10(word) == 16 {
                Mnemonic::Bclr
            } else {
                Mnemonic::Bcctr
            };
            Some((
                mnemonic,
                InstructionFlags {
                    lk: word & 1 != 0,
                    ..InstructionFlags::NONE
                },
                operands([Operand::BranchOptions(rd(word)), Operand::CrBit(ra(word))]),
            ))
        }
        33 => cr_logical(Mnemonic::Crnor),
        129 => cr_logical(Mnemonic::Crandc),
        150 => Some((Mnemonic::Isync, InstructionFlags::NONE, Operands::new())),
        193 => cr_logical(Mnemonic::Crxor),
        225 => cr_logical(Mnemonic::Crnand),
        257 => cr_logical(Mnemonic::Crand),
        289 => cr_logical(Mnemonic::Creqv),
        417 => cr_logical(Mnemonic::Crorc),
        449 => cr_logical(Mnemonic::Cror),
        _ => None,
    }
}

/// Opcode 31: X-forms first, then XO-form arithmetic keyed by the 9-bit
/// extended opcode with OE split off.
#[inline(never)]
fn decode_opcode_31(word: u32) -> Decoded {
    use Mnemonic::*;

    let three_gpr = |mnemonic: Mnemonic, flags: InstructionFlags| {
        Some((
            mnemonic,
            flags,
            operands([
                Operand::Register(rd(word)),
                Operand::Register(ra(word)),
                Operand::Register(rb(word)),
            ]),
        ))
    };
    // Logical and shift X-forms write rA from rS.
    let logical = |mnemonic: Mnemonic| {
        Some((
            mnemonic,
            InstructionFlags::record(word),
            operands([
                Operand::Register(ra(word)),
                Operand::Register(rd(word)),
                Operand::Register(rb(word)),
            ]),
        ))
    };
    let unary = |mnemonic: Mnemonic| {
        Some((
            mnemonic,
            InstructionFlags::record(word),
            operands([Operand::Register(ra(word)), Operand::Register(rd(word))]),
        ))
    };
    let fp_indexed = |mnemonic: Mnemonic| {
        Some((
            mnemonic,
            InstructionFlags::NONE,
            operands([
                Operand::FpRegister(rd(word)),
                Operand::Register(ra(word)),
                Operand::Register(rb(word)),
            ]),
        ))
    };
    let vector_indexed = |mnemonic: Mnemonic| {
        Some((
            mnemonic,
            InstructionFlags::NONE,
            operands([
                Operand::VectorRegister(rd(word)),
                Operand::Register(ra(word)),
                Operand::Register(rb(word)),
            ]),
        ))
    };
    let cache = |mnemonic: Mnemonic| {
        Some((
            mnemonic,
            InstructionFlags::NONE,
            operands([Operand::Register(ra(word)), Operand::Register(rb(word))]),
        ))
    };
    let compare = |mnemonic: Mnemonic| {
        Some((
            mnemonic,
            InstructionFlags::NONE,
            operands([
                Operand::CrField(rd(word) >> 2),
                Operand::Register(ra(word)),
                Operand::Register(rb(word)),
            ]),
        ))
    };
    let long = word & 0x0020_0000 != 0;
    let none = InstructionFlags::NONE;
    let spr: u16 = ((ra(word) as u32) | ((rb(word) as u32) << 5)) as u16;

    let x_form = match xo10(word) {
        0 => compare(if long { Cmpd } else { Cmpw }),
        4 => Some((
            Tw,
            none,
            operands([
                Operand::UnsignedImmediate(rd(word) as u32),
                Operand::Register(ra(word)),
                Operand::Register(rb(word)),
            ]),
        )),
        6 => vector_indexed(Lvsl),
        19 => Some((Mfcr, none, operands([Operand::Register(rd(word))]))),
        20 => three_gpr(Lwarx, none),
        21 => three_gpr(Ldx, none),
        23 => three_gpr(Lwzx, none),
        24 => logical(Slw),
        26 => unary(Cntlzw),
        27 => logical(Sld),
        28 => logical(And),
        32 => compare(if long { Cmpld } else { Cmplw }),
        38 => vector_indexed(Lvsr),
        53 => three_gpr(Ldux, none),
        54 => cache(Dcbst),
        55 => three_gpr(Lwzux, none),
        58 => unary(Cntlzd),
        60 => logical(Andc),
        68 => Some((
            Td,
            none,
            operands([
                Operand::UnsignedImmediate(rd(word) as u32),
                Operand::Register(ra(word)),
                Operand::Register(rb(word)),
            ]),
        )),
        83 => Some((Mfmsr, none, operands([Operand::Register(rd(word))]))),
        84 => three_gpr(Ldarx, none),
        86 => cache(Dcbf),
        87 => three_gpr(Lbzx, none),
        103 => vector_indexed(Lvx),
        119 => three_gpr(Lbzux, none),
        124 => logical(Nor),
        144 => Some((
            Mtcrf,
            none,
            operands([
                Operand::UnsignedImmediate((word >> 12) & 0xFF),
                Operand::Register(rd(word)),
            ]),
        )),
        146 => Some((Mtmsr, none, operands([Operand::Register(rd(word))]))),
        149 => three_gpr(Stdx, none),
        150 => three_gpr(Stwcx, InstructionFlags::always_record()),
        151 => three_gpr(Stwx, none),
        178 => Some((Mtmsrd, none, operands([Operand::Register(rd(word))]))),
        181 => three_gpr(Stdux, none),
        183 => three_gpr(Stwux, none),
        214 => three_gpr(Stdcx, InstructionFlags::always_record()),
        215 => three_gpr(Stbx, none),
        231 => vector_indexed(Stvx),
        246 => cache(Dcbtst),
        247 => three_gpr(Stbux, none),
        278 => cache(Dcbt),
        279 => three_gpr(Lhzx, none),
        284 => logical(Eqv),
        311 => three_gpr(Lhzux, none),
        316 => logical(Xor),
        339 => Some((
            Mfspr,
            none,
            operands([Operand::Register(rd(word)), Operand::SpecialRegister(spr)]),
        )),
        341 => three_gpr(Lwax, none),
        343 => three_gpr(Lhax, none),
        359 => vector_indexed(Lvxl),
        371 => Some((
            Mftb,
            none,
            operands([Operand::Register(rd(word)), Operand::SpecialRegister(spr)]),
        )),
        373 => three_gpr(Lwaux, none),
        375 => three_gpr(Lhaux, none),
        407 => three_gpr(Sthx, none),
        412 => logical(Orc),
        439 => three_gpr(Sthux, none),
        444 => logical(Or),
        467 => Some((
            Mtspr,
            none,
            operands([Operand::SpecialRegister(spr), Operand::Register(rd(word))]),
        )),
        470 => cache(Dcbi),
        476 => logical(Nand),
        487 => vector_indexed(Stvxl),
        534 => three_gpr(Lwbrx, none),
        535 => fp_indexed(Lfsx),
        536 => logical(Srw),
        539 => logical(Srd),
        567 => fp_indexed(Lfsux),
        598 => Some((Sync, none, Operands::new())),
        599 => fp_indexed(Lfdx),
        631 => fp_indexed(Lfdux),
        662 => three_gpr(Stwbrx, none),
        663 => fp_indexed(Stfsx),
        695 => fp_indexed(Stfsux),
        727 => fp_indexed(Stfdx),
        759 => fp_indexed(Stfdux),
        790 => three_gpr(Lhbrx, none),
        792 => logical(Sraw),
        794 => logical(Srad),
        824 => Some((
            Srawi,
            InstructionFlags::record(word),
            operands([
                Operand::Register(ra(word)),
                Operand::Register(rd(word)),
                Operand::ShiftAmount(rb(word)),
            ]),
        )),
        826 | 827 => Some((
            Sradi,
            InstructionFlags::record(word),
            operands([
                Operand::Register(ra(word)),
                Operand::Register(rd(word)),
                Operand::ShiftAmount((rb(word) as u32 | ((word & 2) << 4)) as u8),
            ]),
        )),
        854 => Some((Eieio, none, Operands::new())),
        918 => three_gpr(Sthbrx, none),
        922 => unary(Extsh),
        954 => unary(Extsb),
        982 => cache(Icbi),
        983 => fp_indexed(Stfiwx),
        986 => unary(Extsw),
        1014 => cache(Dcbz),
        _ => None,
    };
    if x_form.is_some() {
        return x_form;
    }

    let flags = InstructionFlags {
        rc: word & 1 != 0,
        oe: word & 0x400 != 0,
        ..InstructionFlags::NONE
    };
    let two_gpr = |mnemonic: Mnemonic| {
        Some((
            mnemonic,
            flags,
            operands([Operand::Register(rd(word)), Operand::Register(ra(word))]),
        ))
    };
    // The high-word multiplies have no OE bit.
    let no_oe = InstructionFlags {
        oe: false,
        ..flags
    };
    match (word >> 1) & 0x1FF {
        8 => three_gpr(Subfc, flags),
        9 => three_gpr(Mulhdu, no_oe),
        10 => three_gpr(Addc, flags),
        11 => three_gpr(Mulhwu, no_oe),
        40 => three_gpr(Subf, flags),
        73 => three_gpr(Mulhd, no_oe),
        75 => three_gpr(Mulhw, no_oe),
        104 => two_gpr(Neg),
        136 => three_gpr(Subfe, flags),
        138 => three_gpr(Adde, flags),
        200 => two_gpr(Subfze),
        202 => two_gpr(Addze),
        232 => two_gpr(Subfme),
        233 => three_gpr(Mulld, flags),
        234 => two_gpr(Addme),
        235 => three_gpr(Mullw, flags),
        266 => three_gpr(Add, flags),
        457 => three_gpr(Divdu, flags),
        459 => three_gpr(Divwu, flags),
        489 => three_gpr(Divd, flags),
        491 => three_gpr(Divw, flags),
        _ => None,
    }
}

fn decode_single_precision(word: u32) -> Decoded {
    use Mnemonic::*;
    let flags = InstructionFlags::record(word);
    let (d, a, b, c) = (rd(word), ra(word), rb(word), rc_field(word));
    let ops: Operands = match (word >> 1) & 0x1F {
        18 | 20 | 21 => operands([Operand::FpRegister(d), Operand::FpRegister(a), Operand::FpRegister(b)]),
        22 | 24 => operands([Operand::FpRegister(d), Operand::FpRegister(b)]),
        25 => operands([Operand::FpRegister(d), Operand::FpRegister(a), Operand::FpRegister(c)]),
        28..=31 => operands([
            Operand::FpRegister(d),
            Operand::FpRegister(a),
            Operand::FpRegister(c),
            Operand::FpRegister(b),
        ]),
        _ => return None,
    };
    let mnemonic = match (word >> 1) & 0x1F {
        18 => Fdivs,
        20 => Fsubs,
        21 => Fadds,
        22 => Fsqrts,
        24 => Fres,
        25 => Fmuls,
        28 => Fmsubs,
        29 => Fmadds,
        30 => Fnmsubs,
        _ => Fnmadds,
    };
    Some((mnemonic, flags, ops))
}

fn decode_opcode_63(word: u32) -> Decoded {
    use Mnemonic::*;
    let flags = InstructionFlags::record(word);
    let (d, a, b, c) = (rd(word), ra(word), rb(word), rc_field(word));

    // A-form extended opcodes all have bit 4 set; X-form ones never do.
    let xo5 = (word >> 1) & 0x1F;
    if xo5 >= 16 {
        let ops: Operands = match xo5 {
            18 | 20 | 21 => operands([Operand::FpRegister(d), Operand::FpRegister(a), Operand::FpRegister(b)]),
            22 | 26 => operands([Operand::FpRegister(d), Operand::FpRegister(b)]),
            25 => operands([Operand::FpRegister(d), Operand::FpRegister(a), Operand::FpRegister(c)]),
            23 | 28..=31 => operands([
                Operand::FpRegister(d),
                Operand::FpRegister(a),
                Operand::FpRegister(c),
                Operand::FpRegister(b),
            ]),
            _ => return None,
        };
        let mnemonic = match xo5 {
            18 => Fdiv,
            20 => Fsub,
            21 => Fadd,
            22 => Fsqrt,
            23 => Fsel,
            25 => Fmul,
            26 => Frsqrte,
            28 => Fmsub,
            29 => Fmadd,
            30 => Fnmsub,
            _ => Fnmadd,
        };
        return Some((mnemonic, flags, ops));
    }

    let unary = |mnemonic: Mnemonic| {
        Some((
            mnemonic,
            flags,
            operands([Operand::FpRegister(d), Operand::FpRegister(b)]),
        ))
    };
    match xo10(word) {
        0 | 32 => Some((
            if xo10(word) == 0 { Fcmpu } else { Fcmpo },
            InstructionFlags::NONE,
            operands([
                Operand::CrField(d >> 2),
                Operand::FpRegister(a),
                Operand::FpRegister(b),
            ]),
        )),
        12 => unary(Frsp),
        14 => unary(Fctiw),
        15 => unary(Fctiwz),
        38 => Some((Mtfsb1, flags, operands([Operand::CrBit(d)]))),
        40 => unary(Fneg),
        70 => Some((Mtfsb0, flags, operands([Operand::CrBit(d)]))),
        72 => unary(Fmr),
        136 => unary(Fnabs),
        264 => unary(Fabs),
        583 => Some((Mffs, flags, operands([Operand::FpRegister(d)]))),
        711 => Some((
            Mtfsf,
            flags,
            operands([
                Operand::UnsignedImmediate((word >> 17) & 0xFF),
                Operand::FpRegister(b),
            ]),
        )),
        814 => unary(Fctid),
        815 => unary(Fctidz),
        846 => unary(Fcfid),
        _ => None,
    }
}

/// AltiVec (opcode 4): VA-form by the low 6 bits, then VX-form by the low
/// 11 bits, then VXR compares with the record bit at 0x400.
fn decode_vector(word: u32) -> Decoded {
    use Mnemonic::*;
    let none = InstructionFlags::NONE;
    let (d, a, b, c) = (rd(word), ra(word), rb(word), rc_field(word));
    let v = Operand::VectorRegister;

    let va = match word & 0x3F {
        42 => Some((Vsel, operands([v(d), v(a), v(b), v(c)]))),
        43 => Some((Vperm, operands([v(d), v(a), v(b), v(c)]))),
        44 => Some((
            Vsldoi,
            operands([v(d), v(a), v(b), Operand::ShiftAmount(((word >> 6) & 0xF) as u8)]),
        )),
        46 => Some((Vmaddfp, operands([v(d), v(a), v(c), v(b)]))),
        47 => Some((Vnmsubfp, operands([v(d), v(a), v(c), v(b)]))),
        _ => None,
    };
    if let Some((mnemonic, ops)) = va {
        return Some((mnemonic, none, ops));
    }

    let binary = |mnemonic: Mnemonic| Some((mnemonic, none, operands([v(d), v(a), v(b)])));
    let unary = |mnemonic: Mnemonic| Some((mnemonic, none, operands([v(d), v(b)])));
    let with_uimm = |mnemonic: Mnemonic| {
        Some((
            mnemonic,
            none,
            operands([v(d), v(b), Operand::UnsignedImmediate(a as u32)]),
        ))
    };
    let splat_immediate = |mnemonic: Mnemonic| {
        // SIMM is a signed 5-bit field in the vA slot.
        let value: i32 = ((a as i32) << 27) >> 27;
        Some((mnemonic, none, operands([v(d), Operand::Immediate(value)])))
    };

    let vx = match word & 0x7FF {
        10 => binary(Vaddfp),
        74 => binary(Vsubfp),
        128 => binary(Vadduwm),
        140 => binary(Vmrghw),
        266 => unary(Vrefp),
        330 => unary(Vrsqrtefp),
        388 => binary(Vslw),
        396 => binary(Vmrglw),
        644 => binary(Vsrw),
        652 => with_uimm(Vspltw),
        778 => with_uimm(Vcfux),
        780 => splat_immediate(Vspltisb),
        842 => with_uimm(Vcfsx),
        844 => splat_immediate(Vspltish),
        900 => binary(Vsraw),
        906 => with_uimm(Vctuxs),
        908 => splat_immediate(Vspltisw),
        970 => with_uimm(Vctsxs),
        1028 => binary(Vand),
        1034 => binary(Vmaxfp),
        1092 => binary(Vandc),
        1098 => binary(Vminfp),
        1152 => binary(Vsubuwm),
        1156 => binary(Vor),
        1220 => binary(Vxor),
        1284 => binary(Vnor),
        _ => None,
    };
    if vx.is_some() {
        return vx;
    }

    let mnemonic = match word & 0x3FF {
        134 => Vcmpequw,
        198 => Vcmpeqfp,
        454 => Vcmpgefp,
        646 => Vcmpgtuw,
        710 => Vcmpgtfp,
        902 => Vcmpgtsw,
        966 => Vcmpbfp,
        _ => return None,
    };
    Some((
        mnemonic,
        InstructionFlags {
            rc: word & 0x400 != 0,
            ..none
        },
        operands([v(d), v(a), v(b)]),
    ))
}

const CR_TRUE_NAMES: [&str; 4] = ["lt", "gt", "eq", "so"];
const CR_FALSE_NAMES: [&str; 4] = ["ge", "le", "ne", "ns"];

/// Simplified condition suffix for BO/BI (`eq`, `ne`, `dnz`, ...), `""` for
/// branch-always, `None` when no simplified form applies.
fn simplified_condition(bo: u8, bi: u8) -> Option<(String, bool)> {
    let bit = (bi % 4) as usize;
    match bo & 0x1E {
        0x0C => Some((CR_TRUE_NAMES[bit].to_string(), true)),
        0x04 => Some((CR_FALSE_NAMES[bit].to_string(), true)),
        0x14 => Some((String::new(), false)),
        0x10 => Some(("dnz".to_string(), false)),
        0x12 => Some(("dz".to_string(), false)),
        _ => None,
    }
}

impl Instruction {
    fn fmt_branch(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let link = if self.flags.lk { "l" } else { "" };
        let absolute = if self.flags.aa { "a" } else { "" };
        if self.mnemonic == Mnemonic::B {
            let target = self.branch_target().unwrap_or(0);
            return write!(f, "b{}{} 0x{:08X}", link, absolute, target);
        }

        let (bo, bi) = self.branch_options().unwrap_or((0x14, 0));
        let suffix = match self.mnemonic {
            Mnemonic::Bclr => "lr",
            Mnemonic::Bcctr => "ctr",
            _ => "",
        };
        match simplified_condition(bo, bi) {
            Some((cond, uses_cr)) => {
                write!(f, "b{}{}{}{}", cond, suffix, link, absolute)?;
                let field = bi / 4;
                let mut first = true;
                if uses_cr && field != 0 {
                    write!(f, " cr{}", field)?;
                    first = false;
                }
                if let Some(target) = self.branch_target() {
                    write!(f, "{}0x{:08X}", if first { " " } else { "," }, target)?;
                }
                Ok(())
            }
            None => {
                write!(f, "bc{}{}{} {},{}", suffix, link, absolute, bo, bi)?;
                if let Some(target) = self.branch_target() {
                    write!(f, ",0x{:08X}", target)?;
                }
                Ok(())
            }
        }
    }

    fn fmt_simplified(&self, f: &mut fmt::Formatter<'_>) -> Option<fmt::Result> {
        let dot = if self.flags.rc { "." } else { "" };
        let ops = &self.operands;
        Some(match self.mnemonic {
            Mnemonic::Ori if ops[..] == [Operand::Register(0), Operand::Register(0), Operand::UnsignedImmediate(0)] => {
                f.write_str("nop")
            }
            Mnemonic::Or if self.gpr(1) == self.gpr(2) => {
                write!(f, "mr{} {},{}", dot, ops[0], ops[1])
            }
            Mnemonic::Addi if self.gpr(1) == Some(0) => write!(f, "li {},{}", ops[0], ops[2]),
            Mnemonic::Addis if self.gpr(1) == Some(0) => write!(f, "lis {},{}", ops[0], ops[2]),
            Mnemonic::Mfspr | Mnemonic::Mtspr => {
                let (spr, reg) = if self.mnemonic == Mnemonic::Mfspr {
                    (self.spr(1)?, ops[0])
                } else {
                    (self.spr(0)?, ops[1])
                };
                let name = match spr {
                    SPR_XER => "xer",
                    SPR_LR => "lr",
                    SPR_CTR => "ctr",
                    _ => return None,
                };
                let dir = if self.mnemonic == Mnemonic::Mfspr { "mf" } else { "mt" };
                write!(f, "{}{} {}", dir, name, reg)
            }
            Mnemonic::Rlwinm => {
                let (sh, mb, me) = (self.shift(2)?, self.mask_bound(3)?, self.mask_bound(4)?);
                if mb == 0 && me == 31 - sh && sh != 0 {
                    write!(f, "slwi{} {},{},{}", dot, ops[0], ops[1], sh)
                } else if me == 31 && sh != 0 && mb == 32 - sh {
                    write!(f, "srwi{} {},{},{}", dot, ops[0], ops[1], mb)
                } else if sh == 0 && me == 31 {
                    write!(f, "clrlwi{} {},{},{}", dot, ops[0], ops[1], mb)
                } else {
                    return None;
                }
            }
            _ => return None,
        })
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.instruction_type == InstructionType::Branch {
            return self.fmt_branch(f);
        }
        if let Some(result) = self.fmt_simplified(f) {
            return result;
        }

        f.write_str(self.mnemonic.as_str())?;
        if self.flags.oe {
            f.write_str("o")?;
        }
        if self.flags.rc {
            f.write_str(".")?;
        }

        if self.mnemonic.is_displacement_form() && self.operands.len() == 3 {
            return write!(
                f,
                " {},{}({})",
                self.operands[0], self.operands[2], self.operands[1]
            );
        }
        for (i, operand) in self.operands.iter().enumerate() {
            f.write_str(if i == 0 { " " } else { "," })?;
            write!(f, "{}", operand)?;
        }
        Ok(())
    }
}

impl fmt::Display for DecodedInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.instruction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotate_mask_handles_wraparound() {
        // rlwinm ...,0,29 clears the two low bits.
        assert_eq!(rotate_mask(32, 61), 0x0000_0000_FFFF_FFFC);
        assert_eq!(rotate_mask(0, 63), u64::MAX);
        // mb > me wraps through bit 0.
        assert_eq!(rotate_mask(63, 32), 0xFFFF_FFFF_8000_0001);
    }

    #[test]
    fn simplified_conditions() {
        assert_eq!(simplified_condition(12, 2), Some(("eq".to_string(), true)));
        assert_eq!(simplified_condition(4, 24 + 1), Some(("le".to_string(), true)));
        assert_eq!(simplified_condition(20, 0), Some((String::new(), false)));
        assert_eq!(simplified_condition(16, 0), Some(("dnz".to_string(), false)));
        assert_eq!(simplified_condition(8, 0), None);
    }
}
