// CLI command handlers
use anyhow::{Context, Result};
use ppcrecomp_core::recompiler::{
    config::RecompilerConfig,
    contract::RegisterContext,
    harness::{HarnessReport, RegressionHarness},
    pipeline::{PipelineStats, ProgressSink, RecompilationPipeline},
};
use std::path::Path;

/// Load `config_path` and `contract_path` and run the whole pipeline.
pub fn recompile(config_path: &Path, contract_path: &Path, progress: &dyn ProgressSink) -> Result<PipelineStats> {
    println!("[ppcrecomp] Reading config {}", config_path.display());
    let config = RecompilerConfig::load(config_path)
        .with_context(|| format!("Failed to load config {}", config_path.display()))?;

    println!("[ppcrecomp] Reading register context {}", contract_path.display());
    let contract = RegisterContext::from_file(contract_path)
        .with_context(|| format!("Failed to load register context {}", contract_path.display()))?;

    let stats = RecompilationPipeline::recompile(&config, &contract, progress)?;
    println!("[ppcrecomp] Output directory: {}", config.out_directory.display());
    Ok(stats)
}

/// Run the golden-file harness over `fixture_dir`.
pub fn run_harness(
    fixture_dir: &Path,
    golden_dir: &Path,
    contract_path: Option<&Path>,
    bless: bool,
) -> Result<HarnessReport> {
    let contract = match contract_path {
        Some(path) => RegisterContext::from_file(path)
            .with_context(|| format!("Failed to load register context {}", path.display()))?,
        None => RegisterContext::default_contract(),
    };
    println!(
        "[ppcrecomp] {} fixtures in {} against {}",
        if bless { "Blessing" } else { "Checking" },
        fixture_dir.display(),
        golden_dir.display()
    );
    let report = RegressionHarness::new(fixture_dir, golden_dir, contract)
        .bless(bless)
        .run()
        .context("Failed to run the fixture harness")?;
    Ok(report)
}
