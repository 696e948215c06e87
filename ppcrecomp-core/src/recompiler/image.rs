//! Image Model
//!
//! The loaded executable: its sections, the entry point, and the single
//! symbol table that analysis populates. The symbol table is owned by the
//! [`Image`] and only mutated through `&mut Image`, so there is exactly one
//! writer while analysis runs and a frozen view afterwards.

use crate::recompiler::config::RecompilerConfig;
use crate::recompiler::error::RecompilerError;
use crate::recompiler::parser;
use serde::Serialize;
use std::collections::BTreeMap;

/// Section permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Permissions {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Permissions {
    pub const CODE: Permissions = Permissions {
        read: true,
        write: false,
        execute: true,
    };
    pub const DATA: Permissions = Permissions {
        read: true,
        write: true,
        execute: false,
    };
}

/// A contiguous, addressable range of the image.
#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub address: u32,
    /// File-backed bytes. May be shorter than `size` for zero-fill sections.
    pub data: Vec<u8>,
    pub size: u32,
    pub permissions: Permissions,
}

impl Section {
    /// One past the last address, widened so sections ending at 4 GiB work.
    #[inline]
    pub fn end(&self) -> u64 {
        self.address as u64 + self.size as u64
    }

    #[inline]
    pub fn contains(&self, address: u32) -> bool {
        address >= self.address && (address as u64) < self.end()
    }

    /// Read a big-endian word from file-backed data.
    #[inline] // Hot path - called for every decoded word
    pub fn read_u32(&self, address: u32) -> Option<u32> {
        let offset = address.checked_sub(self.address)? as usize;
        let bytes = self.data.get(offset..offset.checked_add(4)?)?;
        Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// What a symbol names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum SymbolKind {
    Function,
    Data,
    /// A function whose only instruction is a branch to another function.
    Thunk,
    JumpTable,
}

/// A named, typed, address-anchored entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Symbol {
    pub address: u32,
    /// Size in bytes; 0 when unknown.
    pub size: u32,
    pub name: String,
    pub kind: SymbolKind,
}

impl Symbol {
    pub fn new(address: u32, size: u32, name: impl Into<String>, kind: SymbolKind) -> Self {
        Self {
            address,
            size,
            name: name.into(),
            kind,
        }
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.address as u64 + self.size as u64
    }

    /// End of the claimed range; an unsized symbol claims one byte.
    pub fn claimed_end(&self) -> u64 {
        self.end().max(self.address as u64 + 1)
    }

    pub fn is_code(&self) -> bool {
        matches!(self.kind, SymbolKind::Function | SymbolKind::Thunk)
    }
}

/// Address-ordered symbol table. At most one symbol per address.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: BTreeMap<u32, Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a symbol. Returns `false` and leaves the table unchanged if
    /// the address is already taken.
    pub fn insert(&mut self, symbol: Symbol) -> bool {
        if self.symbols.contains_key(&symbol.address) {
            return false;
        }
        self.symbols.insert(symbol.address, symbol);
        true
    }

    /// Insert or overwrite the symbol at `symbol.address`.
    pub fn upsert(&mut self, symbol: Symbol) {
        self.symbols.insert(symbol.address, symbol);
    }

    pub fn get(&self, address: u32) -> Option<&Symbol> {
        self.symbols.get(&address)
    }

    pub fn get_mut(&mut self, address: u32) -> Option<&mut Symbol> {
        self.symbols.get_mut(&address)
    }

    pub fn remove(&mut self, address: u32) -> Option<Symbol> {
        self.symbols.remove(&address)
    }

    /// Rename the symbol at `address`. Returns `false` if there is none.
    pub fn rename(&mut self, address: u32, name: impl Into<String>) -> bool {
        match self.symbols.get_mut(&address) {
            Some(symbol) => {
                symbol.name = name.into();
                true
            }
            None => false,
        }
    }

    /// The symbol whose sized range covers `address`, if any.
    pub fn containing(&self, address: u32) -> Option<&Symbol> {
        self.symbols
            .range(..=address)
            .next_back()
            .map(|(_, s)| s)
            .filter(|s| s.address == address || (address as u64) < s.end())
    }

    /// A symbol claiming any byte of `start..end`. Unsized symbols claim
    /// their own address.
    pub fn overlapping(&self, start: u32, end: u64) -> Option<&Symbol> {
        if end <= start as u64 {
            return None;
        }
        self.symbols
            .values()
            .take_while(|s| (s.address as u64) < end)
            .find(|s| s.claimed_end() > start as u64)
    }

    /// First symbol strictly after `address`.
    pub fn next_after(&self, address: u32) -> Option<&Symbol> {
        self.symbols
            .range(address.saturating_add(1)..)
            .next()
            .map(|(_, s)| s)
            .filter(|s| s.address > address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.values()
    }

    pub fn of_kind(&self, kind: SymbolKind) -> impl Iterator<Item = &Symbol> {
        self.symbols.values().filter(move |s| s.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// The loaded executable.
#[derive(Debug, Clone)]
pub struct Image {
    pub sections: Vec<Section>,
    pub symbols: SymbolTable,
    pub entry_point: u32,
}

impl Image {
    /// Load the image named by the configuration and seed its symbol table
    /// with the configured function hints.
    pub fn load(config: &RecompilerConfig) -> Result<Self, RecompilerError> {
        let data = std::fs::read(&config.image).map_err(|e| {
            RecompilerError::config(
                format!("cannot read image {}: {}", config.image.display(), e),
                "Check the `image` path in the configuration.",
            )
        })?;

        let container = parser::load_container(
            &data,
            config.format,
            config.base_address.map(|a| a.0),
        )?;

        let mut image = Image {
            sections: container.sections,
            symbols: SymbolTable::new(),
            entry_point: container.entry_point,
        };
        if let Some(entry) = config.entry_point {
            image.entry_point = entry.0;
        }
        if image.sections.iter().all(|s| !s.permissions.execute) {
            return Err(RecompilerError::config(
                format!("{} has no executable sections", config.image.display()),
                "Check the image format or supply `format: \"raw\"` with a base address.",
            ));
        }

        for symbol in container.symbols {
            if !image.symbols.insert(symbol.clone()) {
                log::debug!(
                    "Duplicate symbol {} at 0x{:08X} ignored",
                    symbol.name,
                    symbol.address
                );
            }
        }
        for hint in &config.functions {
            let size = hint.size.map(|s| s.0).unwrap_or(0);
            let name = hint
                .name
                .clone()
                .unwrap_or_else(|| default_function_name(hint.address.0));
            image
                .symbols
                .upsert(Symbol::new(hint.address.0, size, name, SymbolKind::Function));
        }

        log::info!(
            "Loaded {} section(s), {} symbol(s), entry 0x{:08X}",
            image.sections.len(),
            image.symbols.len(),
            image.entry_point
        );
        Ok(image)
    }

    /// A one-section executable image holding `data` at `base`, entry at `base`.
    pub fn from_raw(data: Vec<u8>, base: u32) -> Self {
        let section = parser::raw_section(data, base);
        Image {
            sections: vec![section],
            symbols: SymbolTable::new(),
            entry_point: base,
        }
    }

    pub fn section_containing(&self, address: u32) -> Option<&Section> {
        self.sections.iter().find(|s| s.contains(address))
    }

    #[inline]
    pub fn read_u32(&self, address: u32) -> Option<u32> {
        self.section_containing(address)?.read_u32(address)
    }

    /// True if `address` is word-aligned, file-backed, and executable.
    pub fn is_executable(&self, address: u32) -> bool {
        address % 4 == 0
            && self
                .section_containing(address)
                .map(|s| s.permissions.execute && s.read_u32(address).is_some())
                .unwrap_or(false)
    }

    /// End of the executable section containing `address`.
    pub fn code_end(&self, address: u32) -> Option<u64> {
        self.section_containing(address)
            .filter(|s| s.permissions.execute)
            .map(|s| s.address as u64 + s.data.len().min(s.size as usize) as u64)
    }
}

/// `sub_XXXXXXXX`, the name of a function without a recovered symbol.
pub fn default_function_name(address: u32) -> String {
    format!("sub_{:08X}", address)
}

/// C++ keywords and the names emitted code and support files already use.
const RESERVED_IDENTIFIERS: &[&str] = &[
    "alignas", "alignof", "and", "and_eq", "asm", "auto", "bitand", "bitor", "bool", "break",
    "case", "catch", "char", "char8_t", "char16_t", "char32_t", "class", "compl", "concept",
    "const", "consteval", "constexpr", "constinit", "const_cast", "continue", "co_await",
    "co_return", "co_yield", "decltype", "default", "delete", "do", "double", "dynamic_cast",
    "else", "enum", "explicit", "export", "extern", "false", "float", "for", "friend", "goto",
    "if", "inline", "int", "long", "mutable", "namespace", "new", "noexcept", "not", "not_eq",
    "nullptr", "operator", "or", "or_eq", "private", "protected", "public", "register",
    "reinterpret_cast", "requires", "return", "short", "signed", "sizeof", "static",
    "static_assert", "static_cast", "struct", "switch", "template", "this", "thread_local",
    "throw", "true", "try", "typedef", "typeid", "typename", "union", "unsigned", "using",
    "virtual", "void", "volatile", "wchar_t", "while", "xor", "xor_eq", "main",
    // routine parameters and locals
    "ctx", "base", "ea", "temp", "overflow",
    // support files and the declarations in the context header
    "ppc_context", "ppc_recomp_shared", "ppc_func_mapping", "ppc_guest_base", "ppc_guest_limit",
    "PPCContext", "PPCFuncMapping", "PPCFuncMappings", "PPCXERRegister", "PPCCRRegister",
];

/// Whether `identifier` would clash with a C++ keyword, a helper macro or a
/// name the generated sources already define.
pub fn is_reserved_identifier(identifier: &str) -> bool {
    identifier.starts_with("PPC_") || RESERVED_IDENTIFIERS.contains(&identifier)
}

/// Turn a recovered symbol name into a C++ identifier. Returns `None` when
/// nothing usable is left. Reserved names get a trailing `_`.
pub fn sanitize_identifier(name: &str) -> Option<String> {
    let mut identifier: String = name
        .replace([' ', '-', '.', ':', '@', '$'], "_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if identifier.is_empty() || identifier.chars().all(|c| c == '_') {
        return None;
    }
    if identifier.starts_with(|c: char| c.is_ascii_digit()) {
        identifier.insert(0, '_');
    }
    if is_reserved_identifier(&identifier) {
        identifier.push('_');
    }
    Some(identifier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_table_keeps_one_symbol_per_address() {
        let mut table = SymbolTable::new();
        assert!(table.insert(Symbol::new(0x1000, 8, "a", SymbolKind::Function)));
        assert!(!table.insert(Symbol::new(0x1000, 4, "b", SymbolKind::Data)));
        assert_eq!(table.get(0x1000).map(|s| s.name.as_str()), Some("a"));
        assert_eq!(table.containing(0x1004).map(|s| s.address), Some(0x1000));
        assert!(table.containing(0x1008).is_none());
        assert!(table.next_after(0x1000).is_none());
    }

    #[test]
    fn overlapping_covers_sized_and_unsized_symbols() {
        let mut table = SymbolTable::new();
        table.insert(Symbol::new(0x1000, 0x40, "f", SymbolKind::Function));
        table.insert(Symbol::new(0x2000, 0, "d", SymbolKind::Data));
        assert_eq!(table.overlapping(0x1020, 0x1030).map(|s| s.address), Some(0x1000));
        assert!(table.overlapping(0x1040, 0x1050).is_none());
        assert_eq!(table.overlapping(0x1FF0, 0x2004).map(|s| s.address), Some(0x2000));
        assert!(table.overlapping(0x2001, 0x2010).is_none());
        assert!(table.overlapping(0x1000, 0x1000).is_none());
    }

    #[test]
    fn raw_image_reads_big_endian_words() {
        let image = Image::from_raw(vec![0x4E, 0x80, 0x00, 0x20, 0x60, 0x00], 0x1000);
        assert_eq!(image.read_u32(0x1000), Some(0x4E80_0020));
        assert_eq!(image.read_u32(0x1004), None);
        assert!(image.is_executable(0x1000));
        assert!(!image.is_executable(0x1002));
        assert_eq!(image.code_end(0x1000), Some(0x1006));
    }

    #[test]
    fn sanitized_names_are_identifiers() {
        assert_eq!(sanitize_identifier("__start").as_deref(), Some("__start"));
        assert_eq!(sanitize_identifier("foo.bar@4").as_deref(), Some("foo_bar_4"));
        assert_eq!(sanitize_identifier("1st").as_deref(), Some("_1st"));
        assert_eq!(sanitize_identifier("..."), None);
    }

    #[test]
    fn reserved_names_get_a_suffix() {
        assert_eq!(sanitize_identifier("delete").as_deref(), Some("delete_"));
        assert_eq!(sanitize_identifier("new").as_deref(), Some("new_"));
        assert_eq!(sanitize_identifier("ppc_func_mapping").as_deref(), Some("ppc_func_mapping_"));
        assert_eq!(sanitize_identifier("PPC_LOAD_U32").as_deref(), Some("PPC_LOAD_U32_"));
        assert_eq!(sanitize_identifier("ctx").as_deref(), Some("ctx_"));
        assert_eq!(sanitize_identifier("newline").as_deref(), Some("newline"));
    }
}
