//! Recompiler Configuration
//!
//! The run configuration is a JSON document read with `serde_json`.
//! Addresses may be written either as JSON numbers or as strings
//! (`"0x82000000"` or decimal), since hexadecimal is how they are usually
//! copied out of a disassembler.

use crate::recompiler::error::RecompilerError;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::{Path, PathBuf};

/// A guest address read from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub u32);

impl Address {
    /// Parse `0x`-prefixed hexadecimal or plain decimal text.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let value = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => text.parse::<u32>().ok()?,
        };
        Some(Self(value))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{:08X}", self.0))
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AddressVisitor;

        impl<'de> Visitor<'de> for AddressVisitor {
            type Value = Address;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a 32-bit address as a number or a \"0x\" string")
            }

            fn visit_u64<E: de::Error>(self, value: u64) -> Result<Address, E> {
                u32::try_from(value)
                    .map(Address)
                    .map_err(|_| E::custom(format!("address {value:#x} does not fit in 32 bits")))
            }

            fn visit_i64<E: de::Error>(self, value: i64) -> Result<Address, E> {
                u32::try_from(value)
                    .map(Address)
                    .map_err(|_| E::custom(format!("address {value} is out of range")))
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Address, E> {
                Address::parse(value)
                    .ok_or_else(|| E::custom(format!("invalid address string {value:?}")))
            }
        }

        deserializer.deserialize_any(AddressVisitor)
    }
}

/// Container format of the input image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// Detect from the file magic.
    #[default]
    Auto,
    Elf,
    Dol,
    /// Flat big-endian code loaded at `base_address`.
    Raw,
}

/// What to do with functions whose indirect branches could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnresolvedDispatch {
    /// Emit a runtime dispatch through `PPC_CALL_INDIRECT_FUNC`.
    #[default]
    Fallback,
    /// Leave the function out of the output and record a diagnostic.
    Skip,
}

/// A known function start, optionally with its size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionHint {
    pub address: Address,
    #[serde(default)]
    pub size: Option<Address>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Half-open address range `[start, end)` that is never treated as code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRange {
    pub start: Address,
    pub end: Address,
}

impl AddressRange {
    pub fn contains(&self, address: u32) -> bool {
        address >= self.start.0 && address < self.end.0
    }
}

/// A jump table supplied by hand. `address` is the `bctr` it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JumpTableHint {
    pub address: Address,
    /// GPR holding the zero-based case index at the branch.
    pub register: u8,
    /// Location of the table data, if known.
    #[serde(default)]
    pub table: Option<Address>,
    pub targets: Vec<Address>,
}

fn default_parallel() -> bool {
    true
}

/// Full configuration of a recompilation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecompilerConfig {
    /// Path to the input executable.
    pub image: PathBuf,
    #[serde(default)]
    pub format: ImageFormat,
    #[serde(default)]
    pub base_address: Option<Address>,
    #[serde(default)]
    pub entry_point: Option<Address>,
    pub out_directory: PathBuf,
    #[serde(default)]
    pub functions: Vec<FunctionHint>,
    #[serde(default)]
    pub exclude: Vec<AddressRange>,
    #[serde(default)]
    pub jump_tables: Vec<JumpTableHint>,
    #[serde(default)]
    pub unresolved_dispatch: UnresolvedDispatch,
    #[serde(default = "default_parallel")]
    pub parallel: bool,
}

impl RecompilerConfig {
    /// Read a configuration file. Relative paths inside it are resolved
    /// against the directory containing the file.
    pub fn load(path: &Path) -> Result<Self, RecompilerError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RecompilerError::config(
                format!("cannot read configuration {}: {}", path.display(), e),
                "Pass the path of an existing JSON configuration file.",
            )
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_json_str(&text, base_dir)
    }

    /// Parse configuration text, resolving relative paths against `base_dir`.
    pub fn from_json_str(text: &str, base_dir: &Path) -> Result<Self, RecompilerError> {
        let mut config: RecompilerConfig = serde_json::from_str(text).map_err(|e| {
            RecompilerError::config(
                format!("invalid configuration: {}", e),
                "Check the field names and that addresses are numbers or \"0x\" strings.",
            )
        })?;
        config.resolve_paths(base_dir);
        config.validate()?;
        Ok(config)
    }

    fn resolve_paths(&mut self, base_dir: &Path) {
        if self.image.is_relative() {
            self.image = base_dir.join(&self.image);
        }
        if self.out_directory.is_relative() {
            self.out_directory = base_dir.join(&self.out_directory);
        }
    }

    fn validate(&self) -> Result<(), RecompilerError> {
        for range in &self.exclude {
            if range.end.0 <= range.start.0 {
                return Err(RecompilerError::config(
                    format!(
                        "exclude range 0x{:08X}..0x{:08X} is empty",
                        range.start.0, range.end.0
                    ),
                    "Exclude ranges are half-open; `end` must be greater than `start`.",
                ));
            }
        }
        for table in &self.jump_tables {
            if table.register > 31 {
                return Err(RecompilerError::config(
                    format!(
                        "jump table at 0x{:08X} names register r{}",
                        table.address.0, table.register
                    ),
                    "Use a general-purpose register number between 0 and 31.",
                ));
            }
        }
        Ok(())
    }

    /// True if `address` falls in any configured exclude range.
    pub fn is_excluded(&self, address: u32) -> bool {
        self.exclude.iter().any(|r| r.contains(address))
    }
}
