//! Executable Container Parsers
//!
//! Turns the bytes of an input file into sections, an entry point, and any
//! symbols the container carries. Three containers are understood:
//! - **ELF** (big-endian PowerPC, 32 or 64-bit class), parsed with `goblin`
//! - **DOL** (GameCube/Wii), 7 text + 11 data sections behind a fixed header
//! - **Raw**: a flat blob of big-endian code at a configured base address
//!
//! Xbox 360 XEX containers are recognised and rejected: their compressed,
//! encrypted payload must be extracted to a flat image first.

use crate::recompiler::config::ImageFormat;
use crate::recompiler::error::RecompilerError;
use crate::recompiler::image::{Permissions, Section, Symbol, SymbolKind};
use goblin::elf::header::{EM_PPC, EM_PPC64};
use goblin::elf::section_header::{SHF_ALLOC, SHF_EXECINSTR, SHF_WRITE, SHT_NOBITS};
use goblin::elf::sym::{STT_FUNC, STT_OBJECT};
use goblin::elf::Elf;
use std::io::{Cursor, Read};

const ELF_MAGIC: &[u8; 4] = b"\x7FELF";
const XEX_MAGIC: &[u8; 4] = b"XEX2";

/// Everything a container tells us before analysis.
#[derive(Debug, Clone, Default)]
pub struct LoadedContainer {
    pub sections: Vec<Section>,
    pub entry_point: u32,
    pub symbols: Vec<Symbol>,
}

/// Parse `data` as `format`, detecting the container for [`ImageFormat::Auto`].
pub fn load_container(
    data: &[u8],
    format: ImageFormat,
    base_address: Option<u32>,
) -> Result<LoadedContainer, RecompilerError> {
    if data.starts_with(XEX_MAGIC) {
        return Err(RecompilerError::config(
            "XEX containers are not supported",
            "Extract the PE image from the XEX and load it with `format: \"raw\"`.",
        ));
    }

    let format = match format {
        ImageFormat::Auto if data.starts_with(ELF_MAGIC) => ImageFormat::Elf,
        ImageFormat::Auto if DolFile::looks_like_dol(data) => ImageFormat::Dol,
        ImageFormat::Auto if base_address.is_some() => ImageFormat::Raw,
        ImageFormat::Auto => {
            return Err(RecompilerError::config(
                "cannot detect the image format",
                "Set `format` to \"elf\", \"dol\" or \"raw\" (raw also needs `base_address`).",
            ))
        }
        other => other,
    };
    if let (ImageFormat::Elf | ImageFormat::Dol, Some(base)) = (format, base_address) {
        log::warn!(
            "base_address 0x{:08X} ignored: {:?} images carry their own load addresses",
            base,
            format
        );
    }

    let container = match format {
        ImageFormat::Elf => parse_elf(data)?,
        ImageFormat::Dol => DolFile::parse(data)?.into_container(),
        ImageFormat::Raw | ImageFormat::Auto => {
            let base = base_address.ok_or_else(|| {
                RecompilerError::config(
                    "raw images need a base address",
                    "Set `base_address` in the configuration.",
                )
            })?;
            LoadedContainer {
                sections: vec![raw_section(data.to_vec(), base)],
                entry_point: base,
                symbols: Vec::new(),
            }
        }
    };

    log::debug!(
        "Parsed {:?} container: {} section(s), entry 0x{:08X}",
        format,
        container.sections.len(),
        container.entry_point
    );
    Ok(container)
}

/// One executable section covering `data` at `base`.
pub fn raw_section(data: Vec<u8>, base: u32) -> Section {
    let size = u32::try_from(data.len()).unwrap_or(u32::MAX);
    Section {
        name: ".text".to_string(),
        address: base,
        data,
        size,
        permissions: Permissions::CODE,
    }
}

fn parse_elf(data: &[u8]) -> Result<LoadedContainer, RecompilerError> {
    let elf = Elf::parse(data).map_err(|e| {
        RecompilerError::config(
            format!("malformed ELF: {}", e),
            "Check that the image is not truncated.",
        )
    })?;

    if elf.little_endian {
        return Err(RecompilerError::config(
            "little-endian ELF images are not supported",
            "Only big-endian PowerPC executables can be recompiled.",
        ));
    }
    if elf.header.e_machine != EM_PPC && elf.header.e_machine != EM_PPC64 {
        return Err(RecompilerError::config(
            format!("ELF machine {} is not PowerPC", elf.header.e_machine),
            "Only PowerPC executables can be recompiled.",
        ));
    }

    let mut sections: Vec<Section> = Vec::with_capacity(elf.section_headers.len());
    for header in &elf.section_headers {
        if header.sh_flags & SHF_ALLOC as u64 == 0 || header.sh_size == 0 {
            continue;
        }
        let name = elf
            .shdr_strtab
            .get_at(header.sh_name)
            .unwrap_or("")
            .to_string();
        let address = u32::try_from(header.sh_addr).map_err(|_| {
            RecompilerError::config(
                format!("section {} is mapped above 4 GiB", name),
                "Only 32-bit guest address spaces are supported.",
            )
        })?;
        let size = u32::try_from(header.sh_size).unwrap_or(u32::MAX);
        let bytes = if header.sh_type == SHT_NOBITS {
            Vec::new()
        } else {
            let start = header.sh_offset as usize;
            let end = start.saturating_add(header.sh_size as usize);
            data.get(start..end)
                .ok_or_else(|| {
                    RecompilerError::config(
                        format!("section {} extends beyond the file", name),
                        "Check that the image is not truncated.",
                    )
                })?
                .to_vec()
        };
        sections.push(Section {
            name,
            address,
            data: bytes,
            size,
            permissions: Permissions {
                read: true,
                write: header.sh_flags & SHF_WRITE as u64 != 0,
                execute: header.sh_flags & SHF_EXECINSTR as u64 != 0,
            },
        });
    }

    let mut symbols: Vec<Symbol> = Vec::new();
    for sym in elf.syms.iter() {
        let kind = match sym.st_type() {
            STT_FUNC => SymbolKind::Function,
            STT_OBJECT => SymbolKind::Data,
            _ => continue,
        };
        let Ok(address) = u32::try_from(sym.st_value) else {
            continue;
        };
        if address == 0 {
            continue;
        }
        let name = elf.strtab.get_at(sym.st_name).unwrap_or("");
        if name.is_empty() {
            continue;
        }
        symbols.push(Symbol::new(
            address,
            u32::try_from(sym.st_size).unwrap_or(0),
            name,
            kind,
        ));
    }
    symbols.sort_by_key(|s| s.address);

    Ok(LoadedContainer {
        sections,
        entry_point: elf.entry as u32,
        symbols,
    })
}

/// DOL file structure.
///
/// Represents a parsed GameCube DOL executable file with all sections loaded.
#[derive(Debug, Clone)]
pub struct DolFile {
    /// Text (executable) sections
    pub text_sections: Vec<Section>,
    /// Data sections
    pub data_sections: Vec<Section>,
    /// BSS section address (uninitialized data)
    pub bss_address: u32,
    /// BSS section size
    pub bss_size: u32,
    /// Program entry point address
    pub entry_point: u32,
}

const NUM_TEXT_SECTIONS: usize = 7;
const NUM_DATA_SECTIONS: usize = 11;
const DOL_HEADER_SIZE: usize = 0x100;

impl DolFile {
    /// Heuristic for [`ImageFormat::Auto`]: a header-sized file whose first
    /// text section starts after the header and is mapped somewhere.
    pub fn looks_like_dol(data: &[u8]) -> bool {
        if data.len() < DOL_HEADER_SIZE {
            return false;
        }
        let word = |offset: usize| {
            u32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
        };
        let first_text_offset = word(0x00);
        let first_text_address = word(0x48);
        first_text_offset as usize >= DOL_HEADER_SIZE
            && (first_text_offset as usize) < data.len()
            && first_text_address != 0
    }

    /// Parse a DOL file from byte data.
    ///
    /// # Algorithm
    /// 1. Read text section offsets, addresses, and sizes (7 sections)
    /// 2. Read data section offsets, addresses, and sizes (11 sections)
    /// 3. Read BSS address and size
    /// 4. Read entry point
    /// 5. Load section data from file
    ///
    /// # Errors
    /// Returns a configuration error if the DOL file is malformed or too small.
    #[inline(never)] // Large function - don't inline
    pub fn parse(data: &[u8]) -> Result<Self, RecompilerError> {
        if data.len() < DOL_HEADER_SIZE {
            return Err(RecompilerError::config(
                format!(
                    "DOL file too small: {} bytes (minimum {} bytes)",
                    data.len(),
                    DOL_HEADER_SIZE
                ),
                "Check that the DOL file is valid and not truncated.",
            ));
        }

        let mut cursor: Cursor<&[u8]> = Cursor::new(data);

        let text_offsets: [u32; NUM_TEXT_SECTIONS] = read_table(&mut cursor)?;
        let data_offsets: [u32; NUM_DATA_SECTIONS] = read_table(&mut cursor)?;
        let text_addresses: [u32; NUM_TEXT_SECTIONS] = read_table(&mut cursor)?;
        let data_addresses: [u32; NUM_DATA_SECTIONS] = read_table(&mut cursor)?;
        let text_sizes: [u32; NUM_TEXT_SECTIONS] = read_table(&mut cursor)?;
        let data_sizes: [u32; NUM_DATA_SECTIONS] = read_table(&mut cursor)?;

        // BSS address and size live at 0xD8, the entry point right after.
        const BSS_OFFSET: u64 = 0xD8u64;
        cursor.set_position(BSS_OFFSET);
        let bss_address: u32 = read_u32_be(&mut cursor)?;
        let bss_size: u32 = read_u32_be(&mut cursor)?;
        let entry_point: u32 = read_u32_be(&mut cursor)?;

        let text_sections = load_sections(
            data,
            "text",
            &text_offsets,
            &text_addresses,
            &text_sizes,
            Permissions::CODE,
        )?;
        let data_sections = load_sections(
            data,
            "data",
            &data_offsets,
            &data_addresses,
            &data_sizes,
            Permissions::DATA,
        )?;

        Ok(Self {
            text_sections,
            data_sections,
            bss_address,
            bss_size,
            entry_point,
        })
    }

    /// Convert into the container form shared by all parsers.
    pub fn into_container(self) -> LoadedContainer {
        let mut sections: Vec<Section> =
            Vec::with_capacity(self.text_sections.len() + self.data_sections.len() + 1);
        sections.extend(self.text_sections);
        sections.extend(self.data_sections);
        if self.bss_size != 0 {
            sections.push(Section {
                name: ".bss".to_string(),
                address: self.bss_address,
                data: Vec::new(),
                size: self.bss_size,
                permissions: Permissions::DATA,
            });
        }
        LoadedContainer {
            sections,
            entry_point: self.entry_point,
            symbols: Vec::new(),
        }
    }
}

fn load_sections(
    data: &[u8],
    kind: &str,
    offsets: &[u32],
    addresses: &[u32],
    sizes: &[u32],
    permissions: Permissions,
) -> Result<Vec<Section>, RecompilerError> {
    let mut sections: Vec<Section> = Vec::with_capacity(offsets.len());
    for i in 0usize..offsets.len() {
        if offsets[i] == 0 || sizes[i] == 0 {
            continue;
        }
        let offset: usize = offsets[i] as usize;
        let size: usize = sizes[i] as usize;
        let bytes = data.get(offset..offset.saturating_add(size)).ok_or_else(|| {
            RecompilerError::config(
                format!(
                    "{} section {} extends beyond file: offset {}, size {}",
                    kind, i, offset, size
                ),
                "Check that the DOL file is valid and not truncated.",
            )
        })?;
        sections.push(Section {
            name: format!(".{}{}", kind, i),
            address: addresses[i],
            data: bytes.to_vec(),
            size: sizes[i],
            permissions,
        });
    }
    Ok(sections)
}

fn read_table<const N: usize>(cursor: &mut Cursor<&[u8]>) -> Result<[u32; N], RecompilerError> {
    let mut values: [u32; N] = [0u32; N];
    for value in values.iter_mut() {
        *value = read_u32_be(cursor)?;
    }
    Ok(values)
}

/// Read a big-endian u32 from a cursor.
#[inline] // Hot path - may be inlined
fn read_u32_be(cursor: &mut Cursor<&[u8]>) -> Result<u32, RecompilerError> {
    let mut buf: [u8; 4] = [0u8; 4];
    cursor.read_exact(&mut buf).map_err(|e| {
        RecompilerError::config(
            format!("failed to read DOL header: {}", e),
            "Check that the DOL file is valid and not truncated.",
        )
    })?;
    Ok(u32::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(buf: &mut [u8], offset: usize, value: u32) {
        buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    fn small_dol() -> Vec<u8> {
        let mut dol = vec![0u8; 0x108];
        put(&mut dol, 0x00, 0x100); // text0 offset
        put(&mut dol, 0x48, 0x8000_3100); // text0 address
        put(&mut dol, 0x90, 0x8); // text0 size
        put(&mut dol, 0xE0, 0x8000_3100); // entry
        put(&mut dol, 0x100, 0x3860_0000);
        put(&mut dol, 0x104, 0x4E80_0020);
        dol
    }

    #[test]
    fn dol_text_section_and_entry_are_loaded() {
        let dol = small_dol();
        assert!(DolFile::looks_like_dol(&dol));
        let container = load_container(&dol, ImageFormat::Auto, None).unwrap();
        assert_eq!(container.entry_point, 0x8000_3100);
        assert_eq!(container.sections.len(), 1);
        assert_eq!(container.sections[0].read_u32(0x8000_3104), Some(0x4E80_0020));
        assert!(container.sections[0].permissions.execute);
    }

    #[test]
    fn base_address_does_not_move_a_dol() {
        let container = load_container(&small_dol(), ImageFormat::Dol, Some(0x8200_0000)).unwrap();
        assert_eq!(container.entry_point, 0x8000_3100);
        assert_eq!(container.sections[0].address, 0x8000_3100);
    }

    #[test]
    fn xex_is_rejected() {
        let err = load_container(b"XEX2\0\0\0\0", ImageFormat::Auto, None).unwrap_err();
        assert!(matches!(err, RecompilerError::Config { .. }));
    }

    #[test]
    fn raw_needs_a_base_address() {
        assert!(load_container(&[0u8; 8], ImageFormat::Raw, None).is_err());
        let container = load_container(&[0u8; 8], ImageFormat::Raw, Some(0x8200_0000)).unwrap();
        assert_eq!(container.entry_point, 0x8200_0000);
    }

    #[test]
    fn truncated_dol_is_a_config_error() {
        let err = DolFile::parse(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, RecompilerError::Config { .. }));
    }
}
