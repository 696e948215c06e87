//! Test Utilities
//!
//! Instruction encoders and fixture builders shared by the integration
//! tests. Every test file pulls this in with `mod utils;`, so not every
//! helper is used everywhere.
#![allow(dead_code)]

use ppcrecomp_core::recompiler::analysis::{AnalysisOptions, AnalysisResult, Analyzer};
use ppcrecomp_core::recompiler::image::Image;
use std::path::Path;

pub const BASE: u32 = 0x1000;

pub const BLR: u32 = 0x4E80_0020;
pub const BCTR: u32 = 0x4E80_0420;
pub const NOP: u32 = 0x6000_0000;

pub fn addi(d: u32, a: u32, simm: i16) -> u32 {
    (14 << 26) | (d << 21) | (a << 16) | (simm as u16 as u32)
}

pub fn li(d: u32, simm: i16) -> u32 {
    addi(d, 0, simm)
}

pub fn addis(d: u32, a: u32, simm: i16) -> u32 {
    (15 << 26) | (d << 21) | (a << 16) | (simm as u16 as u32)
}

pub fn ori(a: u32, s: u32, uimm: u16) -> u32 {
    (24 << 26) | (s << 21) | (a << 16) | uimm as u32
}

pub fn add(d: u32, a: u32, b: u32) -> u32 {
    (31 << 26) | (d << 21) | (a << 16) | (b << 11) | (266 << 1)
}

pub fn lwz(d: u32, a: u32, disp: i16) -> u32 {
    (32 << 26) | (d << 21) | (a << 16) | (disp as u16 as u32)
}

pub fn stw(s: u32, a: u32, disp: i16) -> u32 {
    (36 << 26) | (s << 21) | (a << 16) | (disp as u16 as u32)
}

pub fn lwzx(d: u32, a: u32, b: u32) -> u32 {
    (31 << 26) | (d << 21) | (a << 16) | (b << 11) | (23 << 1)
}

pub fn cmpwi(crf: u32, a: u32, simm: i16) -> u32 {
    (11 << 26) | (crf << 23) | (a << 16) | (simm as u16 as u32)
}

pub fn cmplwi(crf: u32, a: u32, uimm: u16) -> u32 {
    (10 << 26) | (crf << 23) | (a << 16) | uimm as u32
}

pub fn rlwinm(a: u32, s: u32, sh: u32, mb: u32, me: u32) -> u32 {
    (21 << 26) | (s << 21) | (a << 16) | (sh << 11) | (mb << 6) | (me << 1)
}

pub fn mtctr(s: u32) -> u32 {
    (31 << 26) | (s << 21) | (9 << 16) | (467 << 1)
}

/// `bc` from `from` to `to`.
pub fn bc(bo: u32, bi: u32, from: u32, to: u32) -> u32 {
    let offset = to.wrapping_sub(from);
    (16 << 26) | (bo << 21) | (bi << 16) | (offset & 0xFFFC)
}

pub fn beq(from: u32, to: u32) -> u32 {
    bc(12, 2, from, to)
}

pub fn bne(from: u32, to: u32) -> u32 {
    bc(4, 2, from, to)
}

pub fn bgt(from: u32, to: u32) -> u32 {
    bc(12, 1, from, to)
}

pub fn b(from: u32, to: u32) -> u32 {
    (18 << 26) | (to.wrapping_sub(from) & 0x03FF_FFFC)
}

pub fn bl(from: u32, to: u32) -> u32 {
    b(from, to) | 1
}

pub fn bytes(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_be_bytes()).collect()
}

pub fn raw_image(words: &[u32]) -> Image {
    Image::from_raw(bytes(words), BASE)
}

pub fn analyse(image: &mut Image) -> AnalysisResult {
    let options = AnalysisOptions::default();
    Analyzer::new(image, &options).run()
}

/// `lwz r4,0(r3); add r4,r4,r5; stw r4,4(r3); blr`
pub fn straight_line() -> Vec<u32> {
    vec![lwz(4, 3, 0), add(4, 4, 5), stw(4, 3, 4), BLR]
}

/// One label besides the entry: a conditional branch over nothing.
pub fn single_branch() -> Vec<u32> {
    vec![li(4, 0), cmpwi(0, 3, 0), beq(0x1008, 0x100C), BLR]
}

/// `if (r3 != 0) r3 = 1; return;` as three blocks.
pub fn if_then() -> Vec<u32> {
    vec![cmpwi(0, 3, 0), bne(0x1004, 0x100C), li(3, 1), BLR]
}

/// Bounded four-way switch on r3 with the table inline after the `bctr`.
pub fn switch_table() -> Vec<u32> {
    vec![
        cmplwi(0, 3, 3),           // 0x1000
        bgt(0x1004, 0x1040),       // 0x1004
        addis(11, 0, 0),           // 0x1008 lis r11,0
        addi(11, 11, 0x1020),      // 0x100C
        rlwinm(12, 3, 2, 0, 29),   // 0x1010
        lwzx(12, 11, 12),          // 0x1014
        mtctr(12),                 // 0x1018
        BCTR,                      // 0x101C
        0x1030,                    // 0x1020 table
        0x1034,
        0x1038,
        0x103C,
        li(3, 10),                 // 0x1030
        li(3, 11),
        li(3, 12),
        li(3, 13),
        BLR,                       // 0x1040
    ]
}

/// [`switch_table`] with the scale done in place, so r3 holds the loaded
/// target rather than the index by the time of the `bctr`.
pub fn in_place_switch_table() -> Vec<u32> {
    let mut words = switch_table();
    words[4] = rlwinm(3, 3, 2, 0, 29); // 0x1010
    words[5] = lwzx(3, 11, 3); // 0x1014
    words[6] = mtctr(3); // 0x1018
    words
}

/// Four-way switch through an offset table at 0x1024 whose targets run
/// backwards through the cases.
pub fn relative_switch_table() -> Vec<u32> {
    vec![
        cmplwi(0, 3, 3),           // 0x1000
        bgt(0x1004, 0x1044),       // 0x1004
        addis(11, 0, 0),           // 0x1008 lis r11,0
        addi(11, 11, 0x1024),      // 0x100C
        rlwinm(12, 3, 2, 0, 29),   // 0x1010
        lwzx(12, 11, 12),          // 0x1014
        add(12, 12, 11),           // 0x1018
        mtctr(12),                 // 0x101C
        BCTR,                      // 0x1020
        0x1C,                      // 0x1024 table, offsets from 0x1024
        0x18,
        0x14,
        0x10,
        li(3, 10),                 // 0x1034
        li(3, 11),
        li(3, 12),
        li(3, 13),                 // 0x1040
        BLR,                       // 0x1044
    ]
}

/// Every fixture program above, by name.
pub fn all_fixtures() -> Vec<(&'static str, Vec<u32>)> {
    vec![
        ("straight_line", straight_line()),
        ("single_branch", single_branch()),
        ("if_then", if_then()),
        ("switch_table", switch_table()),
        ("in_place_switch_table", in_place_switch_table()),
        ("relative_switch_table", relative_switch_table()),
        ("unresolved_dispatch", unresolved_dispatch()),
    ]
}

/// `bctr` through a register nothing in the function sets up.
pub fn unresolved_dispatch() -> Vec<u32> {
    vec![lwz(12, 3, 0), mtctr(12), BCTR]
}

/// Config JSON for a raw image at [`BASE`].
pub fn raw_config(image: &Path, out: &Path, extra: &str) -> String {
    format!(
        r#"{{
            "image": {:?},
            "format": "raw",
            "base_address": "0x{:08X}",
            "out_directory": {:?}{}
        }}"#,
        image.display().to_string(),
        BASE,
        out.display().to_string(),
        extra
    )
}
