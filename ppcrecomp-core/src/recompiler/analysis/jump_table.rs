//! Jump Table Recovery
//!
//! Recognises the switch dispatch sequences compilers emit in front of a
//! `bctr` and reads the table they index:
//!
//! ```text
//! cmplwi  crN, rIdx, N-1        ; optional bound check
//! bgt     crN, default
//! lis     rBase, table@ha
//! addi    rBase, rBase, table@l ; or ori
//! slwi    rOff, rIdx, 2         ; rlwinm rOff, rIdx, 2, 0, 29
//! lwzx    rT, rBase, rOff
//! add     rT, rT, rBase         ; only for offset tables
//! mtctr   rT
//! bctr
//! ```
//!
//! Every entry is validated by decoding its target inside the owning
//! function's region. Reading stops at the first entry that fails, at any
//! symbol boundary, or after `N` entries when a bound check was found.
//!
//! When the scale overwrites the index (`rlwinm rIdx, rIdx, 2, 0, 29`), or
//! a later instruction does, the index is gone at the `bctr` and cases are
//! selected by the CTR target instead.

use crate::recompiler::analysis::control_flow::{BasicBlock, ControlFlowGraph, Region, ScanContext};
use crate::recompiler::config::JumpTableHint;
use crate::recompiler::decoder::{DecodedInstruction, Instruction, Mnemonic, SPR_CTR};
use crate::recompiler::error::RecompilerError;
use smallvec::SmallVec;

/// Upper bound on entries read from a table without a bound check.
pub const MAX_JUMP_TABLE_ENTRIES: u32 = 1024;

/// Instructions before the dispatch block that are searched for the
/// table address and the bound check.
const LOOKBACK_INSTRUCTIONS: u32 = 8;

/// How table entries turn into targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// Entries are absolute addresses
    Absolute,
    /// Entries are offsets added to `base`
    Relative { base: u32 },
    /// Targets came from configuration
    Manual,
}

/// Value a dispatch selects its case by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseSelector {
    /// Register still holding the zero-based case index at the branch
    Index(u8),
    /// The index was overwritten before the branch, so cases are matched
    /// against the target address loaded into CTR
    Target,
}

/// Why reading the table stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// All entries allowed by the bound check were read
    BoundReached,
    /// Entry `index` held `value`, which is not a valid target
    InvalidEntry { index: u32, value: u32 },
    /// The next entry starts another symbol or claimed code
    SymbolBoundary(u32),
    /// The next entry is outside file-backed data
    OutOfData(u32),
    /// `MAX_JUMP_TABLE_ENTRIES` were read
    Limit,
    /// Configured table, nothing was read
    Manual,
}

/// What the recovery is based on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableEvidence {
    /// Address of the `cmplwi` bounding the index, if any
    pub bound_check: Option<u32>,
    /// Number of cases the bound check allows
    pub declared_entries: Option<u32>,
    /// Addresses of the matched dispatch instructions
    pub pattern: SmallVec<[u32; 8]>,
    pub stop: StopReason,
}

/// A recovered (or configured) jump table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpTable {
    /// Address of the `bctr` that dispatches through this table
    pub branch_address: u32,
    /// Location of the table data, unknown for some manual tables
    pub table_address: Option<u32>,
    pub selector: CaseSelector,
    pub kind: TableKind,
    /// Case targets in table order
    pub targets: Vec<u32>,
    pub evidence: TableEvidence,
}

impl JumpTable {
    /// Bytes of table data covered by the validated entries.
    pub fn data_size(&self) -> u32 {
        (self.targets.len() as u32).saturating_mul(4)
    }

    /// One-line summary used in diagnostics and emitted comments.
    pub fn describe(&self) -> String {
        let location = match self.table_address {
            Some(address) => format!("jump table at 0x{:08X}", address),
            None => "configured jump table".to_string(),
        };
        let mut text = format!(
            "{} for bctr at 0x{:08X}: {} entr{} {}",
            location,
            self.branch_address,
            self.targets.len(),
            if self.targets.len() == 1 { "y" } else { "ies" },
            match self.selector {
                CaseSelector::Index(r) => format!("indexed by r{}", r),
                CaseSelector::Target => "selected by target address".to_string(),
            }
        );
        if let TableKind::Relative { base } = self.kind {
            text.push_str(&format!(", offsets from 0x{:08X}", base));
        }
        if let Some(check) = self.evidence.bound_check {
            text.push_str(&format!(", bound check at 0x{:08X}", check));
        }
        let stop = match self.evidence.stop {
            StopReason::BoundReached => "bound reached".to_string(),
            StopReason::InvalidEntry { index, value } => {
                format!("entry {} (0x{:08X}) is not code", index, value)
            }
            StopReason::SymbolBoundary(address) => format!("boundary at 0x{:08X}", address),
            StopReason::OutOfData(address) => format!("no data at 0x{:08X}", address),
            StopReason::Limit => "entry limit".to_string(),
            StopReason::Manual => "configured".to_string(),
        };
        text.push_str(&format!(" ({})", stop));
        text
    }
}

/// Recover the table for the `bctr` ending `block`.
pub fn recover(
    ctx: &ScanContext<'_>,
    region: Region,
    block: &BasicBlock,
    cfg: &ControlFlowGraph,
) -> Result<JumpTable, RecompilerError> {
    let bctr = block
        .instructions
        .last()
        .ok_or_else(|| RecompilerError::recovery(block.start_address, "empty dispatch block"))?;
    let fail = |message: &str| RecompilerError::recovery(bctr.address, message);

    let mut window: Vec<DecodedInstruction> = lookback(ctx, region, block.start_address);
    window.extend(block.instructions.iter().cloned());
    let bctr_index = window.len() - 1;

    let mtctr_index = (0..bctr_index)
        .rev()
        .find(|&i| window[i].mnemonic() == Mnemonic::Mtspr && window[i].instruction.spr(0) == Some(SPR_CTR))
        .ok_or_else(|| fail("indirect branch without a visible mtctr"))?;
    let target_register = window[mtctr_index]
        .instruction
        .gpr(1)
        .ok_or_else(|| fail("malformed mtctr"))?;

    let mut pattern: SmallVec<[u32; 8]> = SmallVec::new();
    pattern.push(window[mtctr_index].address);

    let definition = find_definition(&window, mtctr_index, target_register)
        .ok_or_else(|| fail("CTR value is not loaded from memory"))?;

    // Offset tables add a base to the loaded entry.
    let (load_index, relative_base) = match window[definition].mnemonic() {
        Mnemonic::Lwzx => (definition, None),
        Mnemonic::Add => {
            let inst = &window[definition].instruction;
            let (a, b) = (
                inst.gpr(1).ok_or_else(|| fail("malformed add"))?,
                inst.gpr(2).ok_or_else(|| fail("malformed add"))?,
            );
            let mut found = None;
            for (loaded, base) in [(a, b), (b, a)] {
                if let Some(li) = find_definition(&window, definition, loaded)
                    .filter(|&li| window[li].mnemonic() == Mnemonic::Lwzx)
                {
                    let base_value = resolve_constant(&window, definition, base)
                        .ok_or_else(|| fail("offset table base is not a constant"))?;
                    found = Some((li, Some(base_value)));
                    break;
                }
            }
            pattern.push(window[definition].address);
            found.ok_or_else(|| fail("add feeding CTR does not combine a table load"))?
        }
        _ => return Err(fail("CTR value is not loaded from a table")),
    };
    pattern.push(window[load_index].address);

    let load = &window[load_index].instruction;
    let (load_a, load_b) = (
        load.gpr(1).ok_or_else(|| fail("malformed lwzx"))?,
        load.gpr(2).ok_or_else(|| fail("malformed lwzx"))?,
    );

    let mut matched: Option<(u8, u32, usize)> = None;
    for (offset, base) in [(load_b, load_a), (load_a, load_b)] {
        let Some(shift_index) = find_definition(&window, load_index, offset) else {
            continue;
        };
        let shift = &window[shift_index].instruction;
        let scales_by_four = shift.mnemonic == Mnemonic::Rlwinm
            && shift.shift(2) == Some(2)
            && shift.mask_bound(3) == Some(0)
            && shift.mask_bound(4) == Some(29);
        if !scales_by_four {
            continue;
        }
        let (Some(index_register), Some(table)) =
            (shift.gpr(1), resolve_constant(&window, load_index, base))
        else {
            continue;
        };
        matched = Some((index_register, table, shift_index));
        break;
    }
    let (index_register, table_address, shift_index) =
        matched.ok_or_else(|| fail("table load is not indexed by a scaled register with a constant base"))?;
    pattern.push(window[shift_index].address);

    let index_live = (shift_index..bctr_index)
        .all(|i| window[i].instruction.gpr_destination() != Some(index_register));
    let selector = if index_live {
        CaseSelector::Index(index_register)
    } else {
        CaseSelector::Target
    };

    // A `cmplwi rIdx, N-1` before the scale bounds the table.
    let bound_check = (0..shift_index).rev().find(|&i| {
        let inst = &window[i].instruction;
        inst.mnemonic == Mnemonic::Cmplwi && inst.gpr(1) == Some(index_register)
    });
    let declared_entries = bound_check
        .and_then(|i| window[i].instruction.uimm(2))
        .map(|n| n.saturating_add(1));

    let kind = match relative_base {
        Some(base) => TableKind::Relative { base },
        None => TableKind::Absolute,
    };
    let limit = declared_entries
        .map(|n| n.min(MAX_JUMP_TABLE_ENTRIES))
        .unwrap_or(MAX_JUMP_TABLE_ENTRIES);

    let mut targets: Vec<u32> = Vec::new();
    let mut stop = StopReason::Limit;
    let table_end = table_address as u64 + limit as u64 * 4;
    for index in 0..limit {
        let entry = table_address.wrapping_add(index * 4);
        if index > 0 && ctx.is_boundary(entry) {
            stop = StopReason::SymbolBoundary(entry);
            break;
        }
        if cfg.block_containing(entry).is_some() || block.contains(entry) {
            stop = StopReason::SymbolBoundary(entry);
            break;
        }
        let Some(value) = ctx.image.read_u32(entry) else {
            stop = StopReason::OutOfData(entry);
            break;
        };
        let target = match kind {
            TableKind::Relative { base } => base.wrapping_add(value),
            _ => value,
        };
        let inside_table = (target as u64) >= table_address as u64 && (target as u64) < table_end;
        if inside_table || !region.contains(target) || !ctx.is_code(target) {
            stop = StopReason::InvalidEntry { index, value };
            break;
        }
        targets.push(target);
    }
    if declared_entries.is_some() && targets.len() as u32 == limit {
        stop = StopReason::BoundReached;
    }

    log::debug!(
        "bctr 0x{:08X}: table 0x{:08X}, {} target(s), {:?}",
        bctr.address,
        table_address,
        targets.len(),
        selector
    );

    Ok(JumpTable {
        branch_address: bctr.address,
        table_address: Some(table_address),
        selector,
        kind,
        targets,
        evidence: TableEvidence {
            bound_check: bound_check.map(|i| window[i].address),
            declared_entries,
            pattern,
            stop,
        },
    })
}

/// Build a table from configuration. Targets are kept in order up to the
/// first one that is not code inside the function.
pub fn from_hint(ctx: &ScanContext<'_>, region: Region, hint: &JumpTableHint) -> JumpTable {
    let mut targets: Vec<u32> = Vec::with_capacity(hint.targets.len());
    let mut stop = StopReason::Manual;
    for (index, target) in hint.targets.iter().enumerate() {
        if !region.contains(target.0) || !ctx.is_code(target.0) {
            stop = StopReason::InvalidEntry {
                index: index as u32,
                value: target.0,
            };
            break;
        }
        targets.push(target.0);
    }
    JumpTable {
        branch_address: hint.address.0,
        table_address: hint.table.map(|t| t.0),
        selector: CaseSelector::Index(hint.register),
        kind: TableKind::Manual,
        targets,
        evidence: TableEvidence {
            bound_check: None,
            declared_entries: Some(hint.targets.len() as u32),
            pattern: SmallVec::new(),
            stop,
        },
    }
}

/// Straight-line instructions that flow into `start`, oldest first.
fn lookback(ctx: &ScanContext<'_>, region: Region, start: u32) -> Vec<DecodedInstruction> {
    let mut prefix: Vec<DecodedInstruction> = Vec::new();
    let mut address = start;
    for _ in 0..LOOKBACK_INSTRUCTIONS {
        if address <= region.entry {
            break;
        }
        address -= 4;
        let Some(inst) = ctx
            .image
            .read_u32(address)
            .and_then(|word| Instruction::decode(word, address).ok())
        else {
            break;
        };
        if inst.is_branch() && (inst.instruction.is_unconditional() || inst.instruction.flags.lk) {
            break;
        }
        prefix.push(inst);
    }
    prefix.reverse();
    prefix
}

/// Index of the nearest instruction before `before` that writes `register`.
fn find_definition(window: &[DecodedInstruction], before: usize, register: u8) -> Option<usize> {
    (0..before)
        .rev()
        .find(|&i| window[i].instruction.gpr_destination() == Some(register))
}

/// Value of `register` at `before` if it is built from immediates
/// (`lis`, `addi`, `ori`, `mr`).
fn resolve_constant(window: &[DecodedInstruction], before: usize, register: u8) -> Option<u32> {
    let index = find_definition(window, before, register)?;
    let inst = &window[index].instruction;
    match inst.mnemonic {
        Mnemonic::Addis => {
            let high = (inst.imm(2)? as u32) << 16;
            match inst.gpr(1)? {
                0 => Some(high),
                source => Some(resolve_constant(window, index, source)?.wrapping_add(high)),
            }
        }
        Mnemonic::Addi => {
            let low = inst.imm(2)? as u32;
            match inst.gpr(1)? {
                0 => Some(low),
                source => Some(resolve_constant(window, index, source)?.wrapping_add(low)),
            }
        }
        Mnemonic::Ori => Some(resolve_constant(window, index, inst.gpr(1)?)? | inst.uimm(2)?),
        Mnemonic::Or if inst.gpr(1) == inst.gpr(2) => resolve_constant(window, index, inst.gpr(1)?),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(base: u32, words: &[u32]) -> Vec<DecodedInstruction> {
        words
            .iter()
            .enumerate()
            .map(|(i, w)| Instruction::decode(*w, base + i as u32 * 4).unwrap())
            .collect()
    }

    #[test]
    fn constants_follow_lis_addi_chains() {
        let window = decode_all(
            0x1000,
            &[
                0x3D60_8200, // lis r11,-32256
                0x396B_1234, // addi r11,r11,4660
                0x616B_0001, // ori r11,r11,0x1
            ],
        );
        assert_eq!(resolve_constant(&window, 2, 11), Some(0x8200_1234));
        assert_eq!(resolve_constant(&window, 3, 11), Some(0x8200_1235));
        assert_eq!(resolve_constant(&window, 0, 11), None);
    }

    #[test]
    fn negative_low_half_borrows_from_high_half() {
        let window = decode_all(
            0x1000,
            &[
                0x3D60_8201, // lis r11,-32255
                0x396B_FFF0, // addi r11,r11,-16
            ],
        );
        assert_eq!(resolve_constant(&window, 2, 11), Some(0x8200_FFF0));
    }
}
