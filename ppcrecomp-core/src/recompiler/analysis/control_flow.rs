//! Control Flow Analysis
//!
//! Builds the control flow graph (CFG) of one function by recursive descent
//! from its entry. Blocks are keyed by start address and never overlap; a
//! branch into the middle of an existing block splits it.
//!
//! # Memory Optimizations
//! - `EdgeKind` uses `#[repr(u8)]`
//! - `BasicBlock.edges` uses `SmallVec<[Edge; 2]>` (most blocks have ≤2 successors)
//! - Claimed words are tracked in a `BitVec` indexed by `(address - entry) / 4`
//!   instead of a `HashSet<u32>`
//!
//! # CFG Construction Algorithm
//! 1. **Bound the function**: next known entry, size hint, data boundary,
//!    exclude range, or the end of the executable section
//! 2. **Decode linearly** from each pending block start until a control
//!    transfer, an already-claimed block start, the bound, or an
//!    undecodable word
//! 3. **Classify transfers**: targets inside the bound become local blocks,
//!    targets outside become calls or tail calls to other functions
//! 4. **Fill gaps** so the blocks cover `[entry, extent)` without holes

use crate::recompiler::analysis::jump_table::{self, JumpTable};
use crate::recompiler::config::{AddressRange, JumpTableHint};
use crate::recompiler::decoder::{DecodedInstruction, Instruction, Mnemonic};
use crate::recompiler::error::{Diagnostic, DiagnosticKind, RecompilerError};
use crate::recompiler::image::Image;
use bitvec::prelude::*;
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};

/// Role of a control-flow edge.
///
/// # Memory Optimization
/// Uses `#[repr(u8)]` to reduce size from default enum size to 1 byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EdgeKind {
    /// Sequential flow into the next block
    Fallthrough = 0,
    /// Taken side of a branch
    BranchTaken = 1,
    /// Not-taken side of a conditional branch
    BranchNotTaken = 2,
    /// Call with link; execution resumes at the fallthrough edge
    Call = 3,
    /// Transfer to another function without link
    TailCall = 4,
    /// Return through LR
    Return = 5,
    /// Indirect branch through CTR
    Indirect = 6,
}

/// Where an edge goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeTarget {
    /// Block of the same function
    Block(u32),
    /// Entry of a known function
    Function(u32),
    /// Address outside any code region
    External(u32),
    /// Jump table keyed by the address of its `bctr`
    Table(u32),
    /// Indirect target that could not be recovered
    Unresolved,
    /// Leaves the function through LR
    Exit,
}

/// Edge in the control flow graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub kind: EdgeKind,
    pub target: EdgeTarget,
}

impl Edge {
    #[inline]
    pub fn new(kind: EdgeKind, target: EdgeTarget) -> Self {
        Self { kind, target }
    }
}

/// Basic block in the control flow graph.
///
/// A maximal run of instructions with a single entry (the first
/// instruction) and a single exit (the last). Undecodable words and inline
/// jump-table entries are kept in `data_words` after the instructions, so
/// the block still accounts for every word in `[start_address, end_address)`.
#[derive(Debug, Clone, PartialEq)]
pub struct BasicBlock {
    /// Start address of this basic block in the original binary
    pub start_address: u32,
    /// One past the last word of this block
    pub end_address: u32,
    /// Instructions in this basic block (in execution order)
    pub instructions: Vec<DecodedInstruction>,
    /// Words that close the block as data
    pub data_words: Vec<u32>,
    /// Outgoing edges. Conditional branches list the taken edge first;
    /// calls list the call edge first and the return point second.
    pub edges: SmallVec<[Edge; 2]>,
}

impl BasicBlock {
    #[inline]
    pub fn contains(&self, address: u32) -> bool {
        address >= self.start_address && address < self.end_address
    }

    /// Last instruction, if it transfers control.
    pub fn terminator(&self) -> Option<&DecodedInstruction> {
        if !self.data_words.is_empty() {
            return None;
        }
        self.instructions.last().filter(|inst| inst.is_branch())
    }

    /// True for blocks made only of data words (inline jump tables).
    pub fn is_data(&self) -> bool {
        self.instructions.is_empty() && !self.data_words.is_empty()
    }
}

/// Control flow graph of one function.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlFlowGraph {
    /// Entry address (function entry point)
    pub entry_block: u32,
    /// Basic blocks by start address
    pub blocks: BTreeMap<u32, BasicBlock>,
}

impl ControlFlowGraph {
    pub fn new(entry: u32) -> Self {
        Self {
            entry_block: entry,
            blocks: BTreeMap::new(),
        }
    }

    pub fn block_containing(&self, address: u32) -> Option<&BasicBlock> {
        self.blocks
            .range(..=address)
            .next_back()
            .map(|(_, b)| b)
            .filter(|b| b.contains(address))
    }

    /// One past the highest address covered by any block.
    pub fn extent(&self) -> u32 {
        self.blocks
            .values()
            .map(|b| b.end_address)
            .max()
            .unwrap_or(self.entry_block)
    }

    /// Split the block containing `at` so that a block starts at `at`.
    /// The head keeps a fallthrough edge to the tail; the tail inherits the
    /// original edges. Returns `false` if `at` is unclaimed or already a
    /// block start.
    pub fn split_block(&mut self, at: u32) -> bool {
        let Some(start) = self.block_containing(at).map(|b| b.start_address) else {
            return false;
        };
        if start == at {
            return false;
        }
        let Some(head) = self.blocks.get_mut(&start) else {
            return false;
        };

        let split_index = ((at - start) / 4) as usize;
        let tail_instructions = if split_index <= head.instructions.len() {
            head.instructions.split_off(split_index)
        } else {
            Vec::new()
        };
        // Splitting inside the data words keeps only the later words.
        let data_split = split_index.saturating_sub(head.instructions.len());
        let tail_data = if split_index > head.instructions.len() {
            head.data_words.split_off(data_split.min(head.data_words.len()))
        } else {
            std::mem::take(&mut head.data_words)
        };
        let tail = BasicBlock {
            start_address: at,
            end_address: head.end_address,
            instructions: tail_instructions,
            data_words: tail_data,
            edges: std::mem::take(&mut head.edges),
        };
        head.end_address = at;
        head.edges
            .push(Edge::new(EdgeKind::Fallthrough, EdgeTarget::Block(at)));
        self.blocks.insert(at, tail);
        true
    }

    /// Blocks cover `[entry, extent)` exactly once, in order.
    pub fn is_contiguous(&self) -> bool {
        let mut expected = self.entry_block;
        for block in self.blocks.values() {
            if block.start_address != expected || block.end_address <= block.start_address {
                return false;
            }
            expected = block.end_address;
        }
        true
    }

    /// Blocks that are reached by a taken branch (and so need a label).
    pub fn branch_targets(&self) -> BTreeSet<u32> {
        let mut targets = BTreeSet::new();
        for block in self.blocks.values() {
            for edge in &block.edges {
                if let (EdgeKind::BranchTaken, EdgeTarget::Block(t)) = (edge.kind, edge.target) {
                    targets.insert(t);
                }
            }
        }
        targets
    }

    pub fn instruction_count(&self) -> usize {
        self.blocks.values().map(|b| b.instructions.len()).sum()
    }
}

/// Address range a function may claim: `[entry, bound)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub entry: u32,
    pub bound: u64,
}

impl Region {
    #[inline]
    pub fn contains(&self, address: u32) -> bool {
        address >= self.entry && (address as u64) < self.bound
    }
}

/// Read-only view of the global analysis state while one function is scanned.
pub struct ScanContext<'a> {
    pub image: &'a Image,
    /// Every function entry known so far
    pub entries: &'a BTreeSet<u32>,
    /// Data symbols and out-of-line jump tables
    pub boundaries: &'a BTreeSet<u32>,
    /// Size hints by entry
    pub sizes: &'a BTreeMap<u32, u32>,
    pub exclude: &'a [AddressRange],
    /// Manual jump tables by `bctr` address
    pub manual_tables: &'a BTreeMap<u32, JumpTableHint>,
}

impl<'a> ScanContext<'a> {
    pub fn is_excluded(&self, address: u32) -> bool {
        self.exclude.iter().any(|r| r.contains(address))
    }

    /// Start of a function, data symbol, or recovered table.
    pub fn is_boundary(&self, address: u32) -> bool {
        self.entries.contains(&address)
            || self.boundaries.contains(&address)
            || self.image.symbols.get(address).is_some()
    }

    /// Executable, not excluded, and decodable.
    pub fn is_code(&self, address: u32) -> bool {
        self.image.is_executable(address)
            && !self.is_excluded(address)
            && self
                .image
                .read_u32(address)
                .map(|w| Instruction::decode(w, address).is_ok())
                .unwrap_or(false)
    }

    /// Compute the region of the function at `entry`.
    pub fn region(&self, entry: u32) -> Region {
        if self.is_excluded(entry) {
            return Region { entry, bound: entry as u64 };
        }
        let mut bound: u64 = self.image.code_end(entry).unwrap_or(entry as u64);
        let after = entry.saturating_add(1);
        if let Some(next) = self.entries.range(after..).next() {
            bound = bound.min(*next as u64);
        }
        if let Some(next) = self.boundaries.range(after..).next() {
            bound = bound.min(*next as u64);
        }
        if let Some(size) = self.sizes.get(&entry).filter(|s| **s > 0) {
            bound = bound.min(entry as u64 + *size as u64);
        }
        for range in self.exclude {
            if range.start.0 > entry {
                bound = bound.min(range.start.0 as u64);
            }
        }
        Region { entry, bound }
    }
}

/// Result of scanning one function.
#[derive(Debug, Clone)]
pub struct FunctionScan {
    pub cfg: ControlFlowGraph,
    pub region: Region,
    /// Direct call targets (new function seeds)
    pub calls: BTreeSet<u32>,
    /// Tail-call targets (new function seeds)
    pub tail_calls: BTreeSet<u32>,
    /// Recovered or configured jump tables by `bctr` address
    pub jump_tables: BTreeMap<u32, JumpTable>,
    /// Addresses of indirect branches left unresolved
    pub unresolved: Vec<u32>,
    pub diagnostics: Vec<Diagnostic>,
}

impl FunctionScan {
    pub fn extent(&self) -> u32 {
        self.cfg.extent()
    }
}

/// Per-function CFG builder.
pub struct ControlFlowAnalyzer<'c, 'a> {
    ctx: &'c ScanContext<'a>,
    region: Region,
    pending: BTreeSet<u32>,
    claimed: BitVec<u32>,
    scan: FunctionScan,
}

impl<'c, 'a> ControlFlowAnalyzer<'c, 'a> {
    /// Build the CFG of the function at `entry`.
    pub fn build_cfg(ctx: &'c ScanContext<'a>, entry: u32) -> FunctionScan {
        let region = ctx.region(entry);
        let mut analyzer = ControlFlowAnalyzer {
            ctx,
            region,
            pending: BTreeSet::new(),
            claimed: BitVec::new(),
            scan: FunctionScan {
                cfg: ControlFlowGraph::new(entry),
                region,
                calls: BTreeSet::new(),
                tail_calls: BTreeSet::new(),
                jump_tables: BTreeMap::new(),
                unresolved: Vec::new(),
                diagnostics: Vec::new(),
            },
        };

        if region.contains(entry) {
            analyzer.pending.insert(entry);
        }
        let mut last_gap: Option<u32> = None;
        loop {
            while let Some(start) = analyzer.pending.pop_first() {
                analyzer.visit(start);
            }
            // Unreached words between blocks still belong to the function.
            match analyzer.first_gap() {
                Some(gap) if last_gap != Some(gap) => {
                    last_gap = Some(gap);
                    analyzer.pending.insert(gap);
                }
                _ => break,
            }
        }

        log::debug!(
            "Function 0x{:08X}: {} block(s), extent 0x{:08X}, bound 0x{:08X}",
            entry,
            analyzer.scan.cfg.blocks.len(),
            analyzer.scan.cfg.extent(),
            region.bound
        );
        analyzer.scan
    }

    #[inline]
    fn word_index(&self, address: u32) -> usize {
        ((address - self.region.entry) / 4) as usize
    }

    fn is_claimed(&self, address: u32) -> bool {
        self.claimed
            .get(self.word_index(address))
            .map(|bit| *bit)
            .unwrap_or(false)
    }

    fn claim(&mut self, start: u32, end: u32) {
        let last = self.word_index(end - 4);
        if self.claimed.len() <= last {
            self.claimed.resize(last + 1, false);
        }
        for index in self.word_index(start)..=last {
            self.claimed.set(index, true);
        }
    }

    fn first_gap(&self) -> Option<u32> {
        let extent = self.scan.cfg.extent();
        let words = self.word_index(extent);
        self.claimed[..words.min(self.claimed.len())]
            .first_zero()
            .map(|index| self.region.entry + (index as u32) * 4)
    }

    fn enqueue_local(&mut self, address: u32) {
        if !self.scan.cfg.blocks.contains_key(&address) {
            self.pending.insert(address);
        }
    }

    fn visit(&mut self, start: u32) {
        if self.scan.cfg.blocks.contains_key(&start) {
            return;
        }
        if self.is_claimed(start) {
            self.scan.cfg.split_block(start);
            return;
        }

        let mut block = BasicBlock {
            start_address: start,
            end_address: start,
            instructions: Vec::new(),
            data_words: Vec::new(),
            edges: SmallVec::new(),
        };
        let mut address = start;
        loop {
            if address != start
                && (!self.region.contains(address) || self.scan.cfg.blocks.contains_key(&address))
            {
                let target = self.fallthrough_target(address);
                block.edges.push(Edge::new(fallthrough_kind(target), target));
                break;
            }
            let Some(word) = self.ctx.image.read_u32(address) else {
                if address == start {
                    return;
                }
                let target = self.fallthrough_target(address);
                block.edges.push(Edge::new(fallthrough_kind(target), target));
                break;
            };
            match Instruction::decode(word, address) {
                Ok(inst) => {
                    address = address.wrapping_add(4);
                    let ends_block = inst.is_branch();
                    block.instructions.push(inst);
                    if ends_block {
                        break;
                    }
                }
                Err(err) => {
                    log::debug!("0x{:08X}: undecodable word 0x{:08X}", address, word);
                    self.scan.diagnostics.push(Diagnostic::from_error(&err));
                    block.data_words.push(word);
                    address = address.wrapping_add(4);
                    break;
                }
            }
        }
        block.end_address = address;
        self.claim(start, address);

        if block.data_words.is_empty() {
            if let Some(inst) = block.instructions.last().filter(|i| i.is_branch()).cloned() {
                self.terminate(&mut block, &inst);
            }
        }
        let table_blocks = self.take_inline_tables(&block);
        self.scan.cfg.blocks.insert(start, block);
        for table in table_blocks {
            self.claim(table.start_address, table.end_address);
            self.scan.cfg.blocks.insert(table.start_address, table);
        }
    }

    /// Target of sequential flow out of the region or into another block.
    fn fallthrough_target(&mut self, next: u32) -> EdgeTarget {
        if self.region.contains(next) && self.ctx.image.is_executable(next) {
            self.enqueue_local(next);
            EdgeTarget::Block(next)
        } else if self.ctx.is_code(next) {
            self.scan.tail_calls.insert(next);
            EdgeTarget::Function(next)
        } else {
            EdgeTarget::External(next)
        }
    }

    /// Target of a direct branch without link.
    fn branch_target(&mut self, from: u32, target: u32) -> EdgeTarget {
        if self.region.contains(target) && self.ctx.image.is_executable(target) {
            self.enqueue_local(target);
            EdgeTarget::Block(target)
        } else if self.ctx.is_code(target) {
            self.scan.tail_calls.insert(target);
            EdgeTarget::Function(target)
        } else {
            self.scan.diagnostics.push(Diagnostic::new(
                from,
                DiagnosticKind::RecoveryAmbiguity,
                format!("branch to 0x{:08X} leaves all code regions", target),
            ));
            EdgeTarget::External(target)
        }
    }

    /// Target of a direct call.
    fn call_target(&mut self, from: u32, target: u32) -> EdgeTarget {
        if self.ctx.is_code(target) {
            self.scan.calls.insert(target);
            EdgeTarget::Function(target)
        } else {
            self.scan.diagnostics.push(Diagnostic::new(
                from,
                DiagnosticKind::RecoveryAmbiguity,
                format!("call to 0x{:08X} outside code, dispatched at runtime", target),
            ));
            EdgeTarget::External(target)
        }
    }

    fn terminate(&mut self, block: &mut BasicBlock, inst: &DecodedInstruction) {
        let instruction = &inst.instruction;
        let next = inst.next_address();
        let conditional = !instruction.is_unconditional();
        let link = instruction.flags.lk;

        match instruction.mnemonic {
            Mnemonic::B | Mnemonic::Bc => {
                let Some(target) = instruction.branch_target() else {
                    return;
                };
                if link && target == next {
                    // `bcl 20,31,$+4` only loads the address of the next
                    // instruction into LR.
                    let fall = self.fallthrough_target(next);
                    block.edges.push(Edge::new(fallthrough_kind(fall), fall));
                } else if link {
                    let callee = self.call_target(inst.address, target);
                    block.edges.push(Edge::new(EdgeKind::Call, callee));
                    let fall = self.fallthrough_target(next);
                    block.edges.push(Edge::new(fallthrough_kind(fall), fall));
                } else {
                    let taken = self.branch_target(inst.address, target);
                    if conditional {
                        block.edges.push(Edge::new(EdgeKind::BranchTaken, taken));
                        let fall = self.fallthrough_target(next);
                        block.edges.push(Edge::new(EdgeKind::BranchNotTaken, fall));
                    } else {
                        let kind = match taken {
                            EdgeTarget::Block(_) => EdgeKind::BranchTaken,
                            _ => EdgeKind::TailCall,
                        };
                        block.edges.push(Edge::new(kind, taken));
                    }
                }
            }
            Mnemonic::Bclr | Mnemonic::Bcctr if link => {
                block.edges.push(Edge::new(EdgeKind::Call, EdgeTarget::Unresolved));
                let fall = self.fallthrough_target(next);
                block.edges.push(Edge::new(fallthrough_kind(fall), fall));
            }
            Mnemonic::Bclr => {
                block.edges.push(Edge::new(EdgeKind::Return, EdgeTarget::Exit));
                if conditional {
                    let fall = self.fallthrough_target(next);
                    block.edges.push(Edge::new(EdgeKind::BranchNotTaken, fall));
                }
            }
            Mnemonic::Bcctr => {
                let target = self.resolve_indirect(block, inst);
                block.edges.push(Edge::new(EdgeKind::Indirect, target));
                if conditional {
                    let fall = self.fallthrough_target(next);
                    block.edges.push(Edge::new(EdgeKind::BranchNotTaken, fall));
                }
            }
            _ => {}
        }
    }

    fn resolve_indirect(&mut self, block: &BasicBlock, inst: &DecodedInstruction) -> EdgeTarget {
        let recovered: Result<JumpTable, RecompilerError> =
            match self.ctx.manual_tables.get(&inst.address) {
                Some(hint) => Ok(jump_table::from_hint(self.ctx, self.region, hint)),
                None => jump_table::recover(self.ctx, self.region, block, &self.scan.cfg),
            };

        match recovered {
            Ok(table) if !table.targets.is_empty() => {
                self.scan.diagnostics.push(Diagnostic::new(
                    inst.address,
                    DiagnosticKind::Hypothesis,
                    table.describe(),
                ));
                for target in &table.targets {
                    self.enqueue_local(*target);
                }
                self.scan.jump_tables.insert(inst.address, table);
                EdgeTarget::Table(inst.address)
            }
            Ok(table) => {
                self.scan.unresolved.push(inst.address);
                self.scan.diagnostics.push(Diagnostic::new(
                    inst.address,
                    DiagnosticKind::RecoveryAmbiguity,
                    format!("{}; no entry validated", table.describe()),
                ));
                EdgeTarget::Unresolved
            }
            Err(err) => {
                self.scan.unresolved.push(inst.address);
                self.scan.diagnostics.push(Diagnostic::from_error(&err));
                EdgeTarget::Unresolved
            }
        }
    }

    /// Jump tables stored inside the function's own region become data
    /// blocks so the partition stays contiguous.
    fn take_inline_tables(&self, block: &BasicBlock) -> Vec<BasicBlock> {
        let mut data_blocks = Vec::new();
        let Some(bctr) = block.terminator().filter(|i| i.mnemonic() == Mnemonic::Bcctr) else {
            return data_blocks;
        };
        let Some(table) = self.scan.jump_tables.get(&bctr.address) else {
            return data_blocks;
        };
        let Some(start) = table.table_address.filter(|a| self.region.contains(*a)) else {
            return data_blocks;
        };
        let end = start.wrapping_add(table.data_size());
        let overlaps = self.scan.cfg.blocks.values().any(|b| b.start_address < end && start < b.end_address)
            || (block.start_address < end && start < block.end_address);
        if overlaps || !self.region.contains(end.wrapping_sub(4)) {
            return data_blocks;
        }
        let words: Vec<u32> = (0..table.targets.len() as u32)
            .filter_map(|i| self.ctx.image.read_u32(start + i * 4))
            .collect();
        data_blocks.push(BasicBlock {
            start_address: start,
            end_address: end,
            instructions: Vec::new(),
            data_words: words,
            edges: SmallVec::new(),
        });
        data_blocks
    }
}

#[inline]
fn fallthrough_kind(target: EdgeTarget) -> EdgeKind {
    match target {
        EdgeTarget::Block(_) => EdgeKind::Fallthrough,
        _ => EdgeKind::TailCall,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(start: u32, words: u32) -> BasicBlock {
        BasicBlock {
            start_address: start,
            end_address: start + words * 4,
            instructions: (0..words)
                .map(|i| Instruction::decode(0x6000_0000, start + i * 4).unwrap())
                .collect(),
            data_words: Vec::new(),
            edges: SmallVec::from_slice(&[Edge::new(EdgeKind::Return, EdgeTarget::Exit)]),
        }
    }

    #[test]
    fn split_moves_edges_to_the_tail() {
        let mut cfg = ControlFlowGraph::new(0x1000);
        cfg.blocks.insert(0x1000, block(0x1000, 4));
        assert!(cfg.split_block(0x1008));
        assert!(!cfg.split_block(0x1008));
        let head = &cfg.blocks[&0x1000];
        let tail = &cfg.blocks[&0x1008];
        assert_eq!(head.end_address, 0x1008);
        assert_eq!(head.instructions.len(), 2);
        assert_eq!(head.edges[0], Edge::new(EdgeKind::Fallthrough, EdgeTarget::Block(0x1008)));
        assert_eq!(tail.instructions.len(), 2);
        assert_eq!(tail.edges[0].kind, EdgeKind::Return);
        assert!(cfg.is_contiguous());
    }

    #[test]
    fn region_contains_is_half_open() {
        let region = Region { entry: 0x1000, bound: 0x1010 };
        assert!(region.contains(0x100C));
        assert!(!region.contains(0x1010));
        assert!(!region.contains(0x0FFC));
    }
}
