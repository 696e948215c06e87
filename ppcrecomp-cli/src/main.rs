// CLI application
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use ppcrecomp_core::recompiler::pipeline::{Progress, ProgressSink};
use std::path::PathBuf;
use std::process::ExitCode;

mod commands;

/// `ppcrecomp <CONFIG> <CONTRACT>` recompiles the image a config file
/// describes; `ppcrecomp <FIXTURE_DIR> <GOLDEN_DIR>` runs the golden-file
/// harness.
#[derive(Parser)]
#[command(name = "ppcrecomp")]
#[command(about = "Static recompiler for PowerPC executables to C++")]
#[command(version)]
struct Cli {
    /// Config file (JSON), or a directory of `*.bin` fixtures
    input: PathBuf,

    /// Register-context header, or the golden directory in harness mode
    second: PathBuf,

    /// Register-context header for harness mode (default: bundled header)
    #[arg(long)]
    contract: Option<PathBuf>,

    /// Harness mode: write goldens instead of comparing
    #[arg(long)]
    bless: bool,
}

fn main() -> anyhow::Result<ExitCode> {
    env_logger::init();

    let cli = Cli::parse();

    if cli.input.is_dir() {
        let report = commands::run_harness(&cli.input, &cli.second, cli.contract.as_deref(), cli.bless)?;
        println!("{}", report);
        return Ok(if report.passed() {
            ExitCode::SUCCESS
        } else {
            ExitCode::from(1)
        });
    }

    if cli.contract.is_some() || cli.bless {
        anyhow::bail!("--contract and --bless only apply when INPUT is a fixture directory");
    }
    let progress = ConsoleProgress::new();
    let stats = commands::recompile(&cli.input, &cli.second, &progress)?;
    println!(
        "[ppcrecomp] {} function(s) emitted ({} skipped, {} using AltiVec), {} instruction(s), {} jump table(s), {} unresolved branch(es), {} diagnostic(s)",
        stats.emitted_functions,
        stats.skipped_functions,
        stats.vector_functions,
        stats.total_instructions,
        stats.jump_tables,
        stats.unresolved_branches,
        stats.diagnostics
    );
    Ok(ExitCode::SUCCESS)
}

/// Stage lines on stdout and a progress bar while routines are emitted.
struct ConsoleProgress {
    bar: ProgressBar,
}

impl ConsoleProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        Self { bar }
    }
}

impl ProgressSink for ConsoleProgress {
    fn report(&self, event: Progress<'_>) {
        match event {
            Progress::Stage(stage) => println!("[ppcrecomp] {}...", stage),
            Progress::EmitStarted(total) => {
                self.bar.set_length(total as u64);
                self.bar.set_position(0);
            }
            Progress::FunctionEmitted(name) => {
                self.bar.set_message(name.to_string());
                self.bar.inc(1);
            }
            Progress::EmitFinished => self.bar.finish_and_clear(),
        }
    }
}
