//! Analysis Module
//!
//! Function discovery over a loaded [`Image`]. A work-list of function
//! entries (entry point, hints, symbols) is processed lowest address first;
//! each entry gets a control flow graph built by recursive descent, and every
//! call or tail-call target found along the way becomes a new entry. Once the
//! work-list drains, functions whose extent swallowed a later-discovered entry
//! are re-scanned with the tighter bound until nothing changes.
//!
//! The result is frozen into an [`AnalysisResult`] and the image's symbol
//! table is populated with Function, Thunk, and JumpTable symbols.

pub mod control_flow;
pub mod jump_table;

pub use control_flow::{
    BasicBlock, ControlFlowAnalyzer, ControlFlowGraph, Edge, EdgeKind, EdgeTarget, FunctionScan,
    Region, ScanContext,
};
pub use jump_table::{CaseSelector, JumpTable, StopReason, TableEvidence, TableKind, MAX_JUMP_TABLE_ENTRIES};

use crate::recompiler::config::{AddressRange, FunctionHint, JumpTableHint, RecompilerConfig};
use crate::recompiler::decoder::Mnemonic;
use crate::recompiler::error::{Diagnostic, DiagnosticKind};
use crate::recompiler::image::{default_function_name, sanitize_identifier, Image, Symbol, SymbolKind};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Re-scan rounds before the fixpoint gives up.
const MAX_FIXPOINT_ROUNDS: usize = 16;

/// Inputs to analysis besides the image itself.
#[derive(Debug, Clone, Default)]
pub struct AnalysisOptions {
    pub exclude: Vec<AddressRange>,
    pub jump_tables: Vec<JumpTableHint>,
    pub function_hints: Vec<FunctionHint>,
}

impl AnalysisOptions {
    pub fn from_config(config: &RecompilerConfig) -> Self {
        Self {
            exclude: config.exclude.clone(),
            jump_tables: config.jump_tables.clone(),
            function_hints: config.functions.clone(),
        }
    }
}

/// How a function entry was first found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DiscoveryReason {
    EntryPoint,
    /// Listed in the configuration
    Hint,
    /// Function symbol from the container
    Symbol,
    /// Target of a `bl`
    Call,
    /// Target of a branch or fallthrough leaving another function
    TailCall,
}

/// A frozen, analysed function.
#[derive(Debug, Clone)]
pub struct Function {
    pub address: u32,
    /// Bytes from the entry to the end of the last block
    pub size: u32,
    pub reason: DiscoveryReason,
    pub cfg: ControlFlowGraph,
    /// Jump tables owned by this function, by `bctr` address
    pub jump_tables: BTreeMap<u32, JumpTable>,
    /// `bctr` addresses that need runtime dispatch
    pub unresolved: Vec<u32>,
    pub diagnostics: Vec<Diagnostic>,
}

impl Function {
    #[inline]
    pub fn end(&self) -> u32 {
        self.address.wrapping_add(self.size)
    }

    pub fn has_unresolved_dispatch(&self) -> bool {
        !self.unresolved.is_empty()
    }

    /// Name recorded in the symbol table.
    pub fn name(&self, image: &Image) -> String {
        image
            .symbols
            .get(self.address)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| default_function_name(self.address))
    }
}

/// Frozen result of analysis.
#[derive(Debug, Clone, Default)]
pub struct AnalysisResult {
    /// Functions by entry address
    pub functions: BTreeMap<u32, Function>,
    /// Findings not tied to one function
    pub diagnostics: Vec<Diagnostic>,
}

impl AnalysisResult {
    pub fn function(&self, address: u32) -> Option<&Function> {
        self.functions.get(&address)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Every jump table, in function order.
    pub fn jump_tables(&self) -> impl Iterator<Item = &JumpTable> {
        self.functions.values().flat_map(|f| f.jump_tables.values())
    }

    /// Global diagnostics followed by each function's, in address order.
    pub fn all_diagnostics(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .chain(self.functions.values().flat_map(|f| f.diagnostics.iter()))
    }
}

/// Function discovery over one image.
pub struct Analyzer<'a> {
    image: &'a mut Image,
    options: &'a AnalysisOptions,
    reasons: BTreeMap<u32, DiscoveryReason>,
    entries: BTreeSet<u32>,
    boundaries: BTreeSet<u32>,
    sizes: BTreeMap<u32, u32>,
    manual_tables: BTreeMap<u32, JumpTableHint>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Analyzer<'a> {
    pub fn new(image: &'a mut Image, options: &'a AnalysisOptions) -> Self {
        let manual_tables = options
            .jump_tables
            .iter()
            .map(|hint| (hint.address.0, hint.clone()))
            .collect();
        Self {
            image,
            options,
            reasons: BTreeMap::new(),
            entries: BTreeSet::new(),
            boundaries: BTreeSet::new(),
            sizes: BTreeMap::new(),
            manual_tables,
            diagnostics: Vec::new(),
        }
    }

    /// Discover every reachable function and freeze the result.
    pub fn run(mut self) -> AnalysisResult {
        self.seed_initial();

        let mut scans: BTreeMap<u32, FunctionScan> = BTreeMap::new();
        let mut pending: BTreeSet<u32> = self.entries.clone();
        let mut round = 0;
        loop {
            while let Some(entry) = pending.pop_first() {
                let scan = self.scan(entry);
                for callee in &scan.calls {
                    if self.add_entry(*callee, DiscoveryReason::Call) {
                        pending.insert(*callee);
                    }
                }
                for target in &scan.tail_calls {
                    if self.add_entry(*target, DiscoveryReason::TailCall) {
                        pending.insert(*target);
                    }
                }
                for table in scan.jump_tables.values() {
                    if let Some(address) = table.table_address.filter(|a| !scan.region.contains(*a)) {
                        self.boundaries.insert(address);
                    }
                }
                scans.insert(entry, scan);
            }

            // Entries only grow, so extents only shrink.
            let stale: Vec<u32> = scans
                .iter()
                .filter(|(entry, scan)| {
                    let start = entry.saturating_add(1);
                    let end = scan.extent();
                    any_in(&self.entries, start, end) || any_in(&self.boundaries, start, end)
                })
                .map(|(entry, _)| *entry)
                .collect();
            if stale.is_empty() {
                break;
            }
            round += 1;
            if round > MAX_FIXPOINT_ROUNDS {
                self.diagnostics.push(Diagnostic::new(
                    stale[0],
                    DiagnosticKind::RecoveryAmbiguity,
                    format!(
                        "function bounds still changing after {} rounds; {} function(s) may overlap later entries",
                        MAX_FIXPOINT_ROUNDS,
                        stale.len()
                    ),
                ));
                break;
            }
            log::debug!("Fixpoint round {}: re-scanning {} function(s)", round, stale.len());
            for entry in stale {
                scans.remove(&entry);
                pending.insert(entry);
            }
        }

        self.freeze(scans)
    }

    fn seed_initial(&mut self) {
        let hinted: BTreeSet<u32> = self
            .options
            .function_hints
            .iter()
            .map(|h| h.address.0)
            .collect();
        for hint in &self.options.function_hints {
            if let Some(size) = hint.size.filter(|s| s.0 > 0) {
                self.sizes.insert(hint.address.0, size.0);
            }
        }

        let mut seeds: Vec<(u32, DiscoveryReason)> = vec![(self.image.entry_point, DiscoveryReason::EntryPoint)];
        for symbol in self.image.symbols.iter() {
            match symbol.kind {
                SymbolKind::Function | SymbolKind::Thunk => {
                    let reason = if hinted.contains(&symbol.address) {
                        DiscoveryReason::Hint
                    } else {
                        DiscoveryReason::Symbol
                    };
                    if symbol.size > 0 {
                        self.sizes.entry(symbol.address).or_insert(symbol.size);
                    }
                    seeds.push((symbol.address, reason));
                }
                SymbolKind::Data | SymbolKind::JumpTable => {
                    self.boundaries.insert(symbol.address);
                }
            }
        }
        for hint in &self.options.function_hints {
            seeds.push((hint.address.0, DiscoveryReason::Hint));
        }

        for (address, reason) in seeds {
            if self.options.exclude.iter().any(|r| r.contains(address)) {
                self.diagnostics.push(Diagnostic::new(
                    address,
                    DiagnosticKind::Policy,
                    "function seed lies in an excluded range",
                ));
                continue;
            }
            if !self.image.is_executable(address) {
                self.diagnostics.push(Diagnostic::new(
                    address,
                    DiagnosticKind::RecoveryAmbiguity,
                    "function seed is not in executable data",
                ));
                continue;
            }
            self.add_entry(address, reason);
        }
        log::info!(
            "Seeded {} function entr{}, {} data boundar{}",
            self.entries.len(),
            if self.entries.len() == 1 { "y" } else { "ies" },
            self.boundaries.len(),
            if self.boundaries.len() == 1 { "y" } else { "ies" }
        );
    }

    /// Record a new entry. Returns `false` if it was already known.
    fn add_entry(&mut self, address: u32, reason: DiscoveryReason) -> bool {
        if !self.entries.insert(address) {
            return false;
        }
        self.reasons.insert(address, reason);
        // A data symbol that turns out to be called is code.
        self.boundaries.remove(&address);
        true
    }

    fn scan(&self, entry: u32) -> FunctionScan {
        let ctx = ScanContext {
            image: &*self.image,
            entries: &self.entries,
            boundaries: &self.boundaries,
            sizes: &self.sizes,
            exclude: &self.options.exclude,
            manual_tables: &self.manual_tables,
        };
        ControlFlowAnalyzer::build_cfg(&ctx, entry)
    }

    fn freeze(mut self, scans: BTreeMap<u32, FunctionScan>) -> AnalysisResult {
        let mut functions: BTreeMap<u32, Function> = BTreeMap::new();
        let mut used_names: BTreeSet<String> = BTreeSet::new();

        for (entry, scan) in scans {
            if scan.cfg.blocks.is_empty() {
                self.diagnostics.push(Diagnostic::new(
                    entry,
                    DiagnosticKind::Decode,
                    "function entry produced no blocks",
                ));
                continue;
            }
            let size = scan.extent().wrapping_sub(entry);

            let recovered = self
                .image
                .symbols
                .get(entry)
                .filter(|s| s.is_code())
                .and_then(|s| sanitize_identifier(&s.name));
            let mut name = recovered.unwrap_or_else(|| default_function_name(entry));
            if used_names.contains(&name) {
                name = format!("{}_{:08X}", name, entry);
            }
            used_names.insert(name.clone());

            let kind = if is_thunk(&scan.cfg) {
                SymbolKind::Thunk
            } else {
                SymbolKind::Function
            };
            self.image.symbols.upsert(Symbol::new(entry, size, name, kind));

            let mut diagnostics = scan.diagnostics;
            diagnostics.sort();
            diagnostics.dedup();
            functions.insert(
                entry,
                Function {
                    address: entry,
                    size,
                    reason: self.reasons.get(&entry).copied().unwrap_or(DiscoveryReason::Symbol),
                    cfg: scan.cfg,
                    jump_tables: scan.jump_tables,
                    unresolved: scan.unresolved,
                    diagnostics,
                },
            );
        }

        // Code symbols that never became functions (excluded or not
        // decodable) would claim addresses nothing emits.
        let orphaned: Vec<u32> = self
            .image
            .symbols
            .iter()
            .filter(|s| s.is_code() && !functions.contains_key(&s.address))
            .map(|s| s.address)
            .collect();
        for address in orphaned {
            log::debug!("Dropping code symbol at 0x{:08X} without a function", address);
            self.image.symbols.remove(address);
        }

        // Tables inside a function's range stay part of that function.
        for table in functions.values().flat_map(|f| f.jump_tables.values()) {
            let Some(address) = table.table_address else {
                continue;
            };
            let size = table.data_size();
            if let Some(owner) = self.image.symbols.overlapping(address, address as u64 + size as u64) {
                log::debug!("Jump table 0x{:08X} lies within {}", address, owner.name);
                continue;
            }
            self.image.symbols.insert(Symbol::new(
                address,
                size,
                format!("jumptable_{:08X}", address),
                SymbolKind::JumpTable,
            ));
        }

        self.diagnostics.sort();
        let result = AnalysisResult {
            functions,
            diagnostics: self.diagnostics,
        };
        for diagnostic in result.all_diagnostics() {
            diagnostic.log();
        }
        log::info!(
            "Analysed {} function(s), {} jump table(s), {} diagnostic(s)",
            result.functions.len(),
            result.jump_tables().count(),
            result.all_diagnostics().count()
        );
        result
    }
}

#[inline]
fn any_in(set: &BTreeSet<u32>, start: u32, end: u32) -> bool {
    start < end && set.range(start..end).next().is_some()
}

/// A single unconditional branch into another function.
fn is_thunk(cfg: &ControlFlowGraph) -> bool {
    let mut blocks = cfg.blocks.values();
    match (blocks.next(), blocks.next()) {
        (Some(block), None) => {
            block.instructions.len() == 1
                && block.instructions[0].mnemonic() == Mnemonic::B
                && !block.instructions[0].instruction.flags.lk
                && block.edges.iter().all(|e| e.kind == EdgeKind::TailCall)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(words: &[u32]) -> Image {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
        Image::from_raw(bytes, 0x1000)
    }

    #[test]
    fn call_targets_become_functions() {
        let mut image = raw(&[
            0x4800_0009, // bl 0x1008
            0x4E80_0020, // blr
            0x3860_0001, // li r3,1
            0x4E80_0020, // blr
        ]);
        let options = AnalysisOptions::default();
        let result = Analyzer::new(&mut image, &options).run();
        assert_eq!(result.functions.keys().copied().collect::<Vec<_>>(), vec![0x1000, 0x1008]);
        assert_eq!(result.functions[&0x1008].reason, DiscoveryReason::Call);
        assert_eq!(result.functions[&0x1000].size, 8);
        assert_eq!(image.symbols.get(0x1008).map(|s| s.name.as_str()), Some("sub_00001008"));
    }

    #[test]
    fn single_branch_functions_are_thunks() {
        let mut image = raw(&[
            0x4800_0004, // b 0x1004
            0x4E80_0020, // blr
        ]);
        let options = AnalysisOptions {
            function_hints: vec![FunctionHint {
                address: crate::recompiler::config::Address(0x1004),
                size: None,
                name: Some("target".to_string()),
            }],
            ..AnalysisOptions::default()
        };
        image
            .symbols
            .upsert(Symbol::new(0x1004, 0, "target", SymbolKind::Function));
        let result = Analyzer::new(&mut image, &options).run();
        assert_eq!(result.functions[&0x1004].reason, DiscoveryReason::Hint);
        assert_eq!(image.symbols.get(0x1000).map(|s| s.kind), Some(SymbolKind::Thunk));
        assert_eq!(image.symbols.get(0x1004).map(|s| s.name.as_str()), Some("target"));
    }

    #[test]
    fn range_query_handles_empty_ranges() {
        let set: BTreeSet<u32> = [0x1004].into_iter().collect();
        assert!(any_in(&set, 0x1001, 0x1008));
        assert!(!any_in(&set, 0x1008, 0x1008));
        assert!(!any_in(&set, 0x1010, 0x1008));
    }
}
