//! Register-Context Contract
//!
//! The generated C++ never hard-codes the guest register file. It is written
//! against a header that declares a `PPCContext` struct (registers as
//! individual members like `r3` or arrays like `r[32]`) and the helper
//! macros and functions used for memory access and complex instructions.
//!
//! This module reads just enough of that header to answer three questions
//! during emission: does the context have this field, does the field's type
//! have this member, and is this helper declared. Anything missing is an
//! [`RecompilerError::Emit`].

use crate::recompiler::error::RecompilerError;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// The contract shipped with the crate.
const DEFAULT_CONTRACT: &str = include_str!("../../resources/ppc_context.h");

/// Identifiers followed by `(` that are not helper names.
const KEYWORDS: &[&str] = &[
    "if", "while", "for", "switch", "return", "sizeof", "alignof", "alignas", "decltype",
    "static_assert", "static_cast", "reinterpret_cast", "const_cast", "dynamic_cast",
    "__declspec", "__attribute__", "defined", "noexcept", "operator",
];

/// A resolved field of the context: the C++ expression and its declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRef {
    pub expr: String,
    pub ty: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Member {
    ty: String,
    array: Option<usize>,
}

type Members = BTreeMap<String, Member>;

/// Parsed register-context header.
#[derive(Debug, Clone, Default)]
pub struct RegisterContext {
    context_type: String,
    fields: Members,
    aggregates: BTreeMap<String, Members>,
    helpers: BTreeSet<String>,
    source: String,
}

impl RegisterContext {
    /// Parse a header. Parsing never fails; a header without a context
    /// struct simply resolves no fields.
    pub fn parse(text: &str) -> Self {
        let (code, mut helpers) = preprocess(text);
        let tokens = tokenize(&code);

        let mut aggregates: BTreeMap<String, Members> = BTreeMap::new();
        let mut depth: usize = 0;
        let mut i = 0;
        while i < tokens.len() {
            match tokens[i].as_str() {
                "{" => depth += 1,
                "}" => depth = depth.saturating_sub(1),
                "struct" | "union" | "class" if depth == 0 => {
                    if let Some(next) = parse_aggregate(&tokens, i, &mut aggregates) {
                        i = next;
                        continue;
                    }
                }
                name if depth == 0 && is_identifier(name) => {
                    if tokens.get(i + 1).map(String::as_str) == Some("(") && !KEYWORDS.contains(&name) {
                        helpers.insert(name.to_string());
                    }
                }
                _ => {}
            }
            i += 1;
        }

        let context_type = if aggregates.contains_key("PPCContext") {
            "PPCContext".to_string()
        } else {
            aggregates
                .keys()
                .find(|name| name.ends_with("Context"))
                .cloned()
                .unwrap_or_default()
        };
        let fields = aggregates.get(&context_type).cloned().unwrap_or_default();
        log::debug!(
            "Register context {}: {} field(s), {} type(s), {} helper(s)",
            if context_type.is_empty() { "<none>" } else { &context_type },
            fields.len(),
            aggregates.len(),
            helpers.len()
        );

        Self {
            context_type,
            fields,
            aggregates,
            helpers,
            source: text.to_string(),
        }
    }

    /// Read and parse a header file.
    pub fn from_file(path: &Path) -> Result<Self, RecompilerError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            RecompilerError::config(
                format!("cannot read register context {}: {}", path.display(), e),
                "Pass the path of the PPCContext header as the second argument.",
            )
        })?;
        Ok(Self::parse(&text))
    }

    /// The header bundled with the crate.
    pub fn default_contract() -> Self {
        Self::parse(DEFAULT_CONTRACT)
    }

    /// Text the contract was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Name of the context struct, empty if none was found.
    pub fn context_type(&self) -> &str {
        &self.context_type
    }

    /// A named field such as `lr` or `xer`.
    pub fn field(&self, name: &str) -> Result<FieldRef, RecompilerError> {
        self.fields
            .get(name)
            .map(|m| FieldRef {
                expr: format!("ctx.{}", name),
                ty: m.ty.clone(),
            })
            .ok_or_else(|| self.missing(&format!("field `{}`", name)))
    }

    /// Register `index` of a register file (`r`, `f`, `v`, `cr`), either as
    /// member `r3` or as element `r[3]`.
    pub fn register(&self, file: &str, index: u8) -> Result<FieldRef, RecompilerError> {
        let name = format!("{}{}", file, index);
        if let Some(member) = self.fields.get(&name) {
            return Ok(FieldRef {
                expr: format!("ctx.{}", name),
                ty: member.ty.clone(),
            });
        }
        match self.fields.get(file) {
            Some(Member { ty, array: Some(len) }) if (index as usize) < *len => Ok(FieldRef {
                expr: format!("ctx.{}[{}]", file, index),
                ty: ty.clone(),
            }),
            _ => Err(self.missing(&format!("register `{}`", name))),
        }
    }

    /// `field.member`, checked against the field's type.
    pub fn member(&self, field: &FieldRef, member: &str) -> Result<String, RecompilerError> {
        let known = self
            .aggregates
            .get(&field.ty)
            .map(|members| members.contains_key(member))
            .unwrap_or(false);
        if known {
            Ok(format!("{}.{}", field.expr, member))
        } else {
            Err(RecompilerError::emit(format!(
                "type `{}` of `{}` has no member `{}`",
                field.ty, field.expr, member
            )))
        }
    }

    /// Fail unless `name` is a declared macro or function.
    pub fn helper(&self, name: &str) -> Result<(), RecompilerError> {
        if self.helpers.contains(name) {
            Ok(())
        } else {
            Err(self.missing(&format!("helper `{}`", name)))
        }
    }

    pub fn has_helper(&self, name: &str) -> bool {
        self.helpers.contains(name)
    }

    /// True if a struct or union called `name` is declared.
    pub fn has_type(&self, name: &str) -> bool {
        self.aggregates.contains_key(name)
    }

    fn missing(&self, what: &str) -> RecompilerError {
        RecompilerError::emit(format!("register context does not declare {}", what))
    }
}

#[inline]
fn is_identifier(token: &str) -> bool {
    token
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false)
}

/// Strip comments and preprocessor lines. `#define` names are returned as
/// helpers.
fn preprocess(text: &str) -> (String, BTreeSet<String>) {
    let mut without_comments = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, chars.peek()) {
            ('/', Some('/')) => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        without_comments.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut last = '\0';
                for next in chars.by_ref() {
                    if next == '\n' {
                        without_comments.push('\n');
                    }
                    if last == '*' && next == '/' {
                        break;
                    }
                    last = next;
                }
                without_comments.push(' ');
            }
            _ => without_comments.push(c),
        }
    }

    let mut helpers = BTreeSet::new();
    let mut code = String::with_capacity(without_comments.len());
    let mut continued = false;
    for line in without_comments.lines() {
        let directive = continued || line.trim_start().starts_with('#');
        if directive {
            if !continued {
                let rest = line.trim_start()[1..].trim_start();
                if let Some(definition) = rest.strip_prefix("define") {
                    let name: String = definition
                        .trim_start()
                        .chars()
                        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                        .collect();
                    if !name.is_empty() {
                        helpers.insert(name);
                    }
                }
            }
            continued = line.trim_end().ends_with('\\');
            code.push('\n');
            continue;
        }
        code.push_str(line);
        code.push('\n');
    }
    (code, helpers)
}

/// Identifiers, numbers, and single punctuation characters. String and
/// character literals are dropped.
fn tokenize(code: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = code.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_alphanumeric() || c == '_' {
            let mut word = String::new();
            while let Some(&n) = chars.peek() {
                if n.is_ascii_alphanumeric() || n == '_' || (n == '.' && word.starts_with(|d: char| d.is_ascii_digit())) {
                    word.push(n);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(word);
        } else if c == '"' || c == '\'' {
            chars.next();
            let mut escaped = false;
            for n in chars.by_ref() {
                if escaped {
                    escaped = false;
                } else if n == '\\' {
                    escaped = true;
                } else if n == c {
                    break;
                }
            }
        } else {
            tokens.push(c.to_string());
            chars.next();
        }
    }
    tokens
}

/// Index of the token closing the bracket opened at `open`.
fn matching(tokens: &[String], open: usize) -> Option<usize> {
    let (opening, closing) = match tokens.get(open)?.as_str() {
        "{" => ("{", "}"),
        "(" => ("(", ")"),
        "[" => ("[", "]"),
        _ => return None,
    };
    let mut depth = 0usize;
    for (offset, token) in tokens[open..].iter().enumerate() {
        if token == opening {
            depth += 1;
        } else if token == closing {
            depth -= 1;
            if depth == 0 {
                return Some(open + offset);
            }
        }
    }
    None
}

/// Skip `alignas(...)`, `__declspec(...)`, `__attribute__((...))`, and
/// `[[...]]` starting at `i`.
fn skip_attributes(tokens: &[String], mut i: usize) -> usize {
    loop {
        match tokens.get(i).map(String::as_str) {
            Some("alignas" | "__declspec" | "__attribute__") => match matching(tokens, i + 1) {
                Some(close) => i = close + 1,
                None => return i + 1,
            },
            Some("[") if tokens.get(i + 1).map(String::as_str) == Some("[") => {
                match matching(tokens, i) {
                    Some(close) => i = close + 1,
                    None => return i + 1,
                }
            }
            _ => return i,
        }
    }
}

/// Parse `struct Name { ... } ...;` at `start`. Returns the index after
/// the declaration, or `None` for forward declarations and uses.
fn parse_aggregate(
    tokens: &[String],
    start: usize,
    aggregates: &mut BTreeMap<String, Members>,
) -> Option<usize> {
    let mut i = skip_attributes(tokens, start + 1);
    let mut name = None;
    if let Some(token) = tokens.get(i).filter(|t| is_identifier(t)) {
        name = Some(token.clone());
        i = skip_attributes(tokens, i + 1);
    }
    // Skip base classes.
    if tokens.get(i).map(String::as_str) == Some(":") {
        while i < tokens.len() && tokens[i] != "{" && tokens[i] != ";" {
            i += 1;
        }
    }
    if tokens.get(i).map(String::as_str) != Some("{") {
        return None;
    }
    let close = matching(tokens, i)?;
    let owner = name.clone().unwrap_or_default();
    let members = parse_members(&tokens[i + 1..close], &owner, aggregates);

    // `typedef struct { ... } Name;` names the type after the body.
    let mut end = close + 1;
    let mut trailing = None;
    while end < tokens.len() && tokens[end] != ";" {
        if trailing.is_none() && is_identifier(&tokens[end]) {
            trailing = Some(tokens[end].clone());
        }
        end += 1;
    }
    if let Some(type_name) = name.or(trailing) {
        aggregates.insert(type_name, members);
    }
    Some(end + 1)
}

/// Member declarations of an aggregate body. Anonymous nested unions and
/// structs contribute their members directly.
fn parse_members(tokens: &[String], owner: &str, aggregates: &mut BTreeMap<String, Members>) -> Members {
    let mut members = Members::new();
    for statement in split_statements(tokens) {
        let statement = strip_attributes(statement);
        let Some(first) = statement.first() else {
            continue;
        };
        if matches!(
            first.as_str(),
            "static" | "using" | "typedef" | "friend" | "enum" | "template" | "public" | "private" | "protected"
        ) {
            continue;
        }

        if let Some(open) = statement.iter().position(|t| t == "{") {
            let is_aggregate = statement[..open]
                .iter()
                .any(|t| t == "struct" || t == "union");
            if !is_aggregate {
                continue;
            }
            let Some(close) = matching(&statement, open) else {
                continue;
            };
            let declarator = statement[close + 1..].iter().find(|t| is_identifier(t)).cloned();
            match declarator {
                None => {
                    let inner = parse_members(&statement[open + 1..close], owner, aggregates);
                    members.extend(inner);
                }
                Some(field) => {
                    let nested_type = format!("{}::{}", owner, field);
                    let inner = parse_members(&statement[open + 1..close], &nested_type, aggregates);
                    aggregates.insert(nested_type.clone(), inner);
                    members.insert(field, Member { ty: nested_type, array: None });
                }
            }
            continue;
        }
        if statement.iter().any(|t| t == "(") {
            continue;
        }

        let mut groups = statement.split(|t| t == ",");
        let Some(head) = groups.next() else {
            continue;
        };
        let head = cut_initializer(head);
        let Some(name_index) = declarator_index(head) else {
            continue;
        };
        let ty = head[..name_index]
            .iter()
            .filter(|t| !matches!(t.as_str(), "const" | "volatile" | "mutable"))
            .cloned()
            .collect::<Vec<_>>()
            .join(" ");
        let (name, array) = declarator(&head[name_index..]);
        members.insert(name, Member { ty: ty.clone(), array });
        for group in groups {
            let group = cut_initializer(group);
            if let Some(index) = declarator_index(group) {
                let (name, array) = declarator(&group[index..]);
                members.insert(name, Member { ty: ty.clone(), array });
            }
        }
    }
    members
}

/// Split a body at top-level `;`. A `}` closing a function body also ends
/// a statement.
fn split_statements(tokens: &[String]) -> Vec<&[String]> {
    let mut statements = Vec::new();
    let mut start = 0;
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate() {
        match token.as_str() {
            "{" | "(" | "[" => depth += 1,
            "}" | ")" | "]" => {
                depth = depth.saturating_sub(1);
                let aggregate = tokens[start..i].iter().any(|t| t == "struct" || t == "union");
                if token == "}" && depth == 0 && !aggregate {
                    statements.push(&tokens[start..=i]);
                    start = i + 1;
                }
            }
            ";" if depth == 0 => {
                statements.push(&tokens[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < tokens.len() {
        statements.push(&tokens[start..]);
    }
    statements
}

fn strip_attributes(statement: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(statement.len());
    let mut i = 0;
    while i < statement.len() {
        let next = skip_attributes(statement, i);
        if next != i {
            i = next;
            continue;
        }
        out.push(statement[i].clone());
        i += 1;
    }
    out
}

fn cut_initializer(group: &[String]) -> &[String] {
    match group.iter().position(|t| t == "=" || t == ":") {
        Some(end) => &group[..end],
        None => group,
    }
}

/// Index of the declared name: the last identifier before any `[`.
fn declarator_index(group: &[String]) -> Option<usize> {
    let end = group.iter().position(|t| t == "[").unwrap_or(group.len());
    (0..end).rev().find(|&i| is_identifier(&group[i]))
}

fn declarator(tokens: &[String]) -> (String, Option<usize>) {
    let name = tokens[0].clone();
    let array = match (tokens.get(1).map(String::as_str), tokens.get(2)) {
        (Some("["), Some(size)) => parse_size(size),
        _ => None,
    };
    (name, array)
}

fn parse_size(token: &str) -> Option<usize> {
    let digits = token.trim_end_matches(['u', 'U', 'l', 'L']);
    match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => digits.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARRAY_HEADER: &str = r#"
        #pragma once
        #define PPC_LOAD_U32(x) load32(x) /* big-endian */
        #define LONG_MACRO(a) \
            do { struct fake { int q; }; } while (0)
        union Reg { uint32_t u32; uint64_t u64; };
        typedef struct {
            uint8_t lt, gt, eq, so;
        } CR;
        struct alignas(16) GuestContext {
            Reg r[32];
            Reg lr;
            CR cr[8];
            union { Reg ctr; Reg count; };
            void reset() { lr.u64 = 0; }
        };
        inline uint32_t load32(uint32_t address);
    "#;

    #[test]
    fn array_registers_resolve_to_elements() {
        let contract = RegisterContext::parse(ARRAY_HEADER);
        assert_eq!(contract.context_type(), "GuestContext");
        let r3 = contract.register("r", 3).unwrap();
        assert_eq!(r3.expr, "ctx.r[3]");
        assert_eq!(contract.member(&r3, "u64").unwrap(), "ctx.r[3].u64");
        assert!(contract.member(&r3, "f64").is_err());
        assert_eq!(contract.register("cr", 7).unwrap().expr, "ctx.cr[7]");
        assert!(contract.register("cr", 8).is_err());
        assert!(contract.register("f", 1).is_err());
        assert_eq!(contract.field("ctr").unwrap().ty, "Reg");
        assert!(contract.field("reset").is_err());
        let cr = contract.register("cr", 0).unwrap();
        assert_eq!(contract.member(&cr, "so").unwrap(), "ctx.cr[0].so");
    }

    #[test]
    fn helpers_come_from_defines_and_functions() {
        let contract = RegisterContext::parse(ARRAY_HEADER);
        assert!(contract.helper("PPC_LOAD_U32").is_ok());
        assert!(contract.helper("LONG_MACRO").is_ok());
        assert!(contract.helper("load32").is_ok());
        assert!(contract.helper("PPC_STORE_U32").is_err());
        assert!(!contract.has_type("fake"));
    }

    #[test]
    fn bundled_contract_has_named_registers() {
        let contract = RegisterContext::default_contract();
        assert_eq!(contract.context_type(), "PPCContext");
        for (file, count) in [("r", 32), ("f", 32), ("v", 32), ("cr", 8)] {
            for index in 0..count {
                assert!(contract.register(file, index).is_ok(), "{}{}", file, index);
            }
        }
        let v0 = contract.register("v", 0).unwrap();
        assert_eq!(contract.member(&v0, "f32").unwrap(), "ctx.v0.f32");
        let xer = contract.field("xer").unwrap();
        assert!(contract.member(&xer, "ca").is_ok());
        assert!(contract.has_type("PPCFuncMapping"));
        assert!(contract.helper("PPC_FUNC_IMPL").is_ok());
    }
}
