//! Error Handling
//!
//! Error types for the recompiler built with `thiserror`, plus the
//! non-fatal [`Diagnostic`] records that analysis attaches to functions.
//!
//! # Error Categories
//! - **Configuration errors**: unreadable config, missing or unsupported image
//! - **Decode errors**: a word that is not a supported PowerPC instruction
//! - **Recovery ambiguities**: an indirect branch whose targets could not be proven
//! - **Emit errors**: the register-context contract lacks something a function needs
//! - **I/O errors**: artifact or golden-file writes

use serde::Serialize;
use thiserror::Error;

/// Recompiler error types.
///
/// Only `Config`, `Emit` and `Io` abort a run. `Decode` and
/// `RecoveryAmbiguity` are produced during analysis and downgraded to
/// [`Diagnostic`]s attached to the affected function.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecompilerError {
    /// Configuration or image loading error.
    #[error("Configuration error: {message}\nSuggestion: {suggestion}")]
    Config { message: String, suggestion: String },

    /// Instruction decoding error.
    ///
    /// Occurs when a word is not a supported PowerPC encoding.
    #[error("Instruction decode error at 0x{address:08X}: {message}\nRaw instruction: 0x{raw:08X}\nSuggestion: {suggestion}")]
    Decode {
        address: u32,
        raw: u32,
        message: String,
        suggestion: String,
    },

    /// Indirect control-flow recovery could not determine the target set.
    #[error("Recovery ambiguity at 0x{address:08X}: {message}")]
    RecoveryAmbiguity { address: u32, message: String },

    /// Code emission error.
    ///
    /// Occurs when the register-context contract does not define a field,
    /// member, or helper that the function being emitted requires.
    #[error("Code generation error in {function} at 0x{address:08X}: {message}\nSuggestion: {suggestion}")]
    Emit {
        function: String,
        address: u32,
        message: String,
        suggestion: String,
    },

    /// Filesystem error while reading inputs or writing artifacts.
    #[error("I/O error on {path}: {message}")]
    Io { path: String, message: String },
}

impl RecompilerError {
    /// Create a configuration error with a suggestion.
    pub fn config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create an instruction decode error with context.
    pub fn instruction_decode(message: impl Into<String>, address: u32, raw: u32) -> Self {
        let suggestion = if (raw & 0xFC00_0000) == 0 {
            "This might be data, not an instruction. Check the function bounds or add an exclude range."
        } else {
            "This instruction may be unsupported or corrupted. Check the binary."
        };
        Self::Decode {
            address,
            raw,
            message: message.into(),
            suggestion: suggestion.to_string(),
        }
    }

    /// Create a recovery ambiguity for an indirect branch.
    pub fn recovery(address: u32, message: impl Into<String>) -> Self {
        Self::RecoveryAmbiguity {
            address,
            message: message.into(),
        }
    }

    /// Create an emit error. The function name and address are filled in
    /// by [`RecompilerError::in_function`] once the emitter knows them.
    pub fn emit(message: impl Into<String>) -> Self {
        Self::Emit {
            function: String::new(),
            address: 0,
            message: message.into(),
            suggestion: "Add the missing field or helper to the register-context header.".to_string(),
        }
    }

    /// Create an I/O error for `path`.
    #[cold]
    pub fn io(path: impl AsRef<std::path::Path>, err: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            message: err.to_string(),
        }
    }

    /// Attach the function being emitted to an emit error.
    pub fn in_function(self, name: &str, at: u32) -> Self {
        match self {
            Self::Emit {
                function,
                message,
                suggestion,
                ..
            } if function.is_empty() => Self::Emit {
                function: name.to_string(),
                address: at,
                message,
                suggestion,
            },
            other => other,
        }
    }

    /// True for errors that end the run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config { .. } | Self::Emit { .. } | Self::Io { .. })
    }
}

impl From<std::io::Error> for RecompilerError {
    #[cold] // Error paths are cold
    fn from(err: std::io::Error) -> Self {
        RecompilerError::Io {
            path: "<unknown>".to_string(),
            message: err.to_string(),
        }
    }
}

/// Kind of a non-fatal analysis finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(u8)]
pub enum DiagnosticKind {
    /// An undecodable word was treated as data.
    Decode,
    /// An indirect branch could not be resolved.
    RecoveryAmbiguity,
    /// A structure was recovered from a pattern and may be wrong.
    Hypothesis,
    /// A configured policy changed the output (e.g. a skipped function).
    Policy,
}

/// A non-fatal finding attached to a function or to the analysis result.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Diagnostic {
    pub address: u32,
    pub kind: DiagnosticKind,
    pub message: String,
}

impl Diagnostic {
    pub fn new(address: u32, kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            address,
            kind,
            message: message.into(),
        }
    }

    /// Downgrade a local error into a diagnostic.
    pub fn from_error(err: &RecompilerError) -> Self {
        match err {
            RecompilerError::Decode {
                address,
                raw,
                message,
                ..
            } => Self::new(
                *address,
                DiagnosticKind::Decode,
                format!("{} (0x{:08X}), treated as data", message, raw),
            ),
            RecompilerError::RecoveryAmbiguity { address, message } => {
                Self::new(*address, DiagnosticKind::RecoveryAmbiguity, message.clone())
            }
            RecompilerError::Emit {
                address, message, ..
            } => Self::new(*address, DiagnosticKind::Policy, message.clone()),
            other => Self::new(0, DiagnosticKind::Policy, other.to_string()),
        }
    }

    /// Log the diagnostic through the `log` facade.
    pub fn log(&self) {
        match self.kind {
            DiagnosticKind::Hypothesis => log::debug!("0x{:08X}: {}", self.address, self.message),
            _ => log::warn!("0x{:08X}: {}", self.address, self.message),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            DiagnosticKind::Decode => "decode",
            DiagnosticKind::RecoveryAmbiguity => "unresolved",
            DiagnosticKind::Hypothesis => "hypothesis",
            DiagnosticKind::Policy => "policy",
        };
        write!(f, "{} 0x{:08X}: {}", kind, self.address, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_error_picks_up_function_once() {
        let err = RecompilerError::emit("no field `r3`").in_function("sub_00001000", 0x1000);
        let again = err.clone().in_function("other", 0x2000);
        assert_eq!(err, again);
        assert!(err.to_string().contains("sub_00001000"));
        assert!(err.is_fatal());
    }

    #[test]
    fn decode_error_becomes_diagnostic() {
        let err = RecompilerError::instruction_decode("unknown primary opcode 0", 0x1004, 0);
        assert!(!err.is_fatal());
        let diag = Diagnostic::from_error(&err);
        assert_eq!(diag.kind, DiagnosticKind::Decode);
        assert_eq!(diag.address, 0x1004);
    }
}
