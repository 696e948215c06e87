//! Static recompiler for PowerPC executables.
//!
//! [`recompiler`] turns an executable image into C++ routines written
//! against a register-context header; [`runtime`] holds the guest-memory
//! accessors that generated code links against.

pub mod recompiler;
pub mod runtime;

pub use recompiler::config::RecompilerConfig;
pub use recompiler::contract::RegisterContext;
pub use recompiler::error::RecompilerError;
pub use recompiler::harness::{HarnessReport, RegressionHarness};
pub use recompiler::pipeline::{PipelineStats, RecompilationPipeline};
