//! Recompilation Pipeline
//!
//! Orchestrates a run from configuration to written artifacts.
//!
//! # Pipeline Stages
//! 1. **Load**: build the [`Image`] from the configured container
//! 2. **Analyse**: discover functions, build CFGs, recover jump tables
//! 3. **Rename entry**: the entry function becomes `ppc_start`
//! 4. **Emit**: one routine per function (on a rayon pool when `parallel`),
//!    plus the shared declarations header and the dispatch table
//! 5. **Write**: artifacts go to the output directory only after every
//!    function emitted; an emit error leaves the directory untouched
//!
//! Each stage is also callable on its own through [`PipelineContext`],
//! which is how the tests drive partial runs.

use crate::recompiler::analysis::{AnalysisOptions, AnalysisResult, Analyzer, Function};
use crate::recompiler::codegen::{uses_vector_unit, CodeGenerator, SourceUnit};
use crate::recompiler::config::{RecompilerConfig, UnresolvedDispatch};
use crate::recompiler::contract::RegisterContext;
use crate::recompiler::error::{Diagnostic, DiagnosticKind, RecompilerError};
use crate::recompiler::image::Image;
use crate::recompiler::validator::CodeValidator;
use anyhow::{Context, Result};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Name given to the function at the image entry point.
pub const ENTRY_FUNCTION_NAME: &str = "ppc_start";
/// Declarations of every emitted routine.
pub const SHARED_HEADER_FILE: &str = "ppc_recomp_shared.h";
/// Guest address to routine table.
pub const FUNCTION_MAPPING_FILE: &str = "ppc_func_mapping.cpp";
/// Copy of the register-context contract the output was generated against.
pub const CONTEXT_HEADER_FILE: &str = "ppc_context.h";

/// Progress events reported while the pipeline runs.
#[derive(Debug, Clone, Copy)]
pub enum Progress<'a> {
    /// A stage started
    Stage(&'a str),
    /// Emission is about to produce this many routines
    EmitStarted(usize),
    /// One routine was emitted
    FunctionEmitted(&'a str),
    /// Emission finished
    EmitFinished,
}

/// Receiver of [`Progress`] events. Must be `Sync` because parallel
/// emission reports from the rayon pool.
pub trait ProgressSink: Sync {
    fn report(&self, event: Progress<'_>);
}

/// Discards every event.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _event: Progress<'_>) {}
}

/// Statistics collected during pipeline execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub total_functions: usize,
    pub emitted_functions: usize,
    pub skipped_functions: usize,
    pub vector_functions: usize,
    pub total_instructions: usize,
    pub jump_tables: usize,
    pub unresolved_branches: usize,
    pub diagnostics: usize,
    pub artifacts_written: usize,
}

/// State carried through the pipeline stages.
#[derive(Default)]
pub struct PipelineContext {
    pub image: Option<Image>,
    pub analysis: Option<AnalysisResult>,
    pub units: Vec<SourceUnit>,
    pub shared_header: Option<String>,
    pub function_mapping: Option<String>,
    /// Functions left out by the unresolved-dispatch policy
    pub omitted: BTreeSet<u32>,
    pub stats: PipelineStats,
}

impl PipelineContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Recompilation pipeline orchestrator.
pub struct RecompilationPipeline;

impl RecompilationPipeline {
    /// Run every stage for `config` against `contract`.
    ///
    /// # Errors
    /// Configuration and image errors from loading, emit errors from code
    /// generation, and I/O errors from writing. Nothing is written unless
    /// every function emitted.
    pub fn recompile(
        config: &RecompilerConfig,
        contract: &RegisterContext,
        progress: &dyn ProgressSink,
    ) -> Result<PipelineStats> {
        let mut ctx = PipelineContext::new();
        Self::stage_load(&mut ctx, config, progress)?;
        Self::stage_analyze(&mut ctx, config, progress)?;
        Self::stage_rename_entry(&mut ctx)?;
        Self::stage_emit(&mut ctx, config, contract, progress)?;
        Self::stage_write_output(&mut ctx, &config.out_directory, contract, progress)?;
        log::info!(
            "Recompilation complete: {} function(s) emitted, {} skipped, {} artifact(s) written",
            ctx.stats.emitted_functions,
            ctx.stats.skipped_functions,
            ctx.stats.artifacts_written
        );
        Ok(ctx.stats)
    }

    /// Stage: load the executable image.
    pub fn stage_load(ctx: &mut PipelineContext, config: &RecompilerConfig, progress: &dyn ProgressSink) -> Result<()> {
        progress.report(Progress::Stage("Loading image"));
        log::info!("Stage: loading {}", config.image.display());
        let image = Image::load(config)?;
        log::info!(
            "Loaded {} section(s), entry point 0x{:08X}",
            image.sections.len(),
            image.entry_point
        );
        ctx.image = Some(image);
        Ok(())
    }

    /// Stage: analyse the loaded image.
    pub fn stage_analyze(ctx: &mut PipelineContext, config: &RecompilerConfig, progress: &dyn ProgressSink) -> Result<()> {
        progress.report(Progress::Stage("Analysing"));
        log::info!("Stage: analysing functions...");
        let image = ctx.image.as_mut().context("no image loaded")?;
        let options = AnalysisOptions::from_config(config);
        let analysis = Analyzer::new(image, &options).run();

        for function in analysis.functions.values() {
            if let Err(err) = CodeValidator::validate_cfg(function) {
                log::warn!("{:#}", err);
            }
            if let Err(err) = CodeValidator::validate_jump_tables(function, image) {
                log::warn!("{:#}", err);
            }
        }

        ctx.stats.total_functions = analysis.functions.len();
        ctx.stats.total_instructions = analysis
            .functions
            .values()
            .map(|f| f.cfg.instruction_count())
            .sum();
        ctx.stats.jump_tables = analysis.jump_tables().count();
        ctx.stats.unresolved_branches = analysis.functions.values().map(|f| f.unresolved.len()).sum();
        ctx.analysis = Some(analysis);
        Ok(())
    }

    /// Stage: give the entry function its fixed name.
    pub fn stage_rename_entry(ctx: &mut PipelineContext) -> Result<()> {
        let image = ctx.image.as_mut().context("no image loaded")?;
        let analysis = ctx.analysis.as_ref().context("no analysis result")?;
        let entry = image.entry_point;
        if analysis.function(entry).is_none() {
            log::warn!("No function at entry point 0x{:08X}; nothing renamed", entry);
            return Ok(());
        }

        // A recovered symbol may already use the name.
        let clash = image
            .symbols
            .iter()
            .find(|s| s.name == ENTRY_FUNCTION_NAME && s.address != entry)
            .map(|s| s.address);
        if let Some(address) = clash {
            let renamed = format!("{}_{:08X}", ENTRY_FUNCTION_NAME, address);
            log::debug!("Renaming 0x{:08X} to {} to free the entry name", address, renamed);
            image.symbols.rename(address, renamed);
        }
        image.symbols.rename(entry, ENTRY_FUNCTION_NAME);
        log::info!("Entry function 0x{:08X} renamed to {}", entry, ENTRY_FUNCTION_NAME);
        Ok(())
    }

    /// Stage: emit every function, the shared header and the mapping table.
    pub fn stage_emit(
        ctx: &mut PipelineContext,
        config: &RecompilerConfig,
        contract: &RegisterContext,
        progress: &dyn ProgressSink,
    ) -> Result<()> {
        progress.report(Progress::Stage("Emitting"));
        log::info!("Stage: emitting C++...");
        let image = ctx.image.as_ref().context("no image loaded")?;
        let analysis = ctx.analysis.as_mut().context("no analysis result")?;

        ctx.omitted = apply_dispatch_policy(analysis, config.unresolved_dispatch);
        let analysis: &AnalysisResult = analysis;
        let generator = CodeGenerator::new(contract, image, analysis).with_omitted(ctx.omitted.clone());

        let functions: Vec<&Function> = analysis
            .functions
            .values()
            .filter(|f| !ctx.omitted.contains(&f.address))
            .collect();
        progress.report(Progress::EmitStarted(functions.len()));

        let emit = |function: &&Function| -> Result<SourceUnit, RecompilerError> {
            let unit = generator.generate_function(function)?;
            progress.report(Progress::FunctionEmitted(&unit.name));
            Ok(unit)
        };
        let mut units: Vec<SourceUnit> = if config.parallel {
            functions.par_iter().map(emit).collect::<Result<_, _>>()?
        } else {
            functions.iter().map(emit).collect::<Result<_, _>>()?
        };
        units.sort_by_key(|u| u.address);
        progress.report(Progress::EmitFinished);

        for unit in &units {
            CodeValidator::validate_source(unit)
                .with_context(|| format!("emitted routine {} at 0x{:08X} is malformed", unit.name, unit.address))?;
        }

        ctx.shared_header = Some(generator.shared_header()?);
        ctx.function_mapping = Some(generator.function_mapping()?);
        ctx.stats.emitted_functions = units.len();
        ctx.stats.skipped_functions = ctx.omitted.len();
        ctx.stats.vector_functions = functions
            .iter()
            .filter(|f| {
                f.cfg
                    .blocks
                    .values()
                    .flat_map(|b| &b.instructions)
                    .any(|i| uses_vector_unit(&i.instruction))
            })
            .count();
        ctx.stats.diagnostics = analysis.all_diagnostics().count();
        ctx.units = units;
        Ok(())
    }

    /// Stage: write every artifact to `out_directory`.
    pub fn stage_write_output(
        ctx: &mut PipelineContext,
        out_directory: &Path,
        contract: &RegisterContext,
        progress: &dyn ProgressSink,
    ) -> Result<()> {
        progress.report(Progress::Stage("Writing output"));
        log::info!("Stage: writing output to {}...", out_directory.display());
        let shared_header = ctx.shared_header.as_ref().context("nothing emitted")?;
        let function_mapping = ctx.function_mapping.as_ref().context("nothing emitted")?;

        std::fs::create_dir_all(out_directory).map_err(|e| RecompilerError::io(out_directory, e))?;
        let mut written = 0usize;
        for unit in &ctx.units {
            let text = format!("#include \"{}\"\n\n{}", SHARED_HEADER_FILE, unit.text);
            write_artifact(&out_directory.join(format!("{}.cpp", unit.name)), &text)?;
            written += 1;
        }
        write_artifact(&out_directory.join(CONTEXT_HEADER_FILE), contract.source())?;
        write_artifact(&out_directory.join(SHARED_HEADER_FILE), shared_header)?;
        write_artifact(&out_directory.join(FUNCTION_MAPPING_FILE), function_mapping)?;
        ctx.stats.artifacts_written = written + 3;
        Ok(())
    }

    /// Paths the pipeline writes for the emitted units, in write order.
    pub fn artifact_paths(ctx: &PipelineContext, out_directory: &Path) -> Vec<PathBuf> {
        ctx.units
            .iter()
            .map(|u| out_directory.join(format!("{}.cpp", u.name)))
            .chain(
                [CONTEXT_HEADER_FILE, SHARED_HEADER_FILE, FUNCTION_MAPPING_FILE]
                    .iter()
                    .map(|f| out_directory.join(f)),
            )
            .collect()
    }
}

/// Functions to leave out under `policy`. Under `Skip`, every function with
/// an unresolved indirect branch is omitted and gets a policy diagnostic.
fn apply_dispatch_policy(analysis: &mut AnalysisResult, policy: UnresolvedDispatch) -> BTreeSet<u32> {
    if policy == UnresolvedDispatch::Fallback {
        return BTreeSet::new();
    }
    let mut omitted = BTreeSet::new();
    for function in analysis.functions.values_mut() {
        if !function.has_unresolved_dispatch() {
            continue;
        }
        let diagnostic = Diagnostic::new(
            function.address,
            DiagnosticKind::Policy,
            format!(
                "omitted: {} unresolved indirect branch(es), calls dispatch at runtime",
                function.unresolved.len()
            ),
        );
        diagnostic.log();
        analysis.diagnostics.push(diagnostic);
        omitted.insert(function.address);
    }
    omitted
}

fn write_artifact(path: &Path, text: &str) -> Result<(), RecompilerError> {
    log::debug!("Writing {}", path.display());
    std::fs::write(path, text).map_err(|e| RecompilerError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recompiler::analysis::ControlFlowGraph;

    fn function(address: u32, unresolved: Vec<u32>) -> Function {
        Function {
            address,
            size: 4,
            reason: crate::recompiler::analysis::DiscoveryReason::Call,
            cfg: ControlFlowGraph::new(address),
            jump_tables: Default::default(),
            unresolved,
            diagnostics: Vec::new(),
        }
    }

    #[test]
    fn skip_policy_omits_unresolved_functions() {
        let mut analysis = AnalysisResult::default();
        analysis.functions.insert(0x1000, function(0x1000, vec![0x1008]));
        analysis.functions.insert(0x2000, function(0x2000, Vec::new()));

        let omitted = apply_dispatch_policy(&mut analysis, UnresolvedDispatch::Skip);
        assert_eq!(omitted.into_iter().collect::<Vec<_>>(), vec![0x1000]);
        assert_eq!(analysis.diagnostics.len(), 1);
        assert_eq!(analysis.diagnostics[0].kind, DiagnosticKind::Policy);
    }

    #[test]
    fn fallback_policy_keeps_everything() {
        let mut analysis = AnalysisResult::default();
        analysis.functions.insert(0x1000, function(0x1000, vec![0x1008]));
        assert!(apply_dispatch_policy(&mut analysis, UnresolvedDispatch::Fallback).is_empty());
        assert!(analysis.diagnostics.is_empty());
    }
}
