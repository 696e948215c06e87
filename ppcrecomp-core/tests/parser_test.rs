// Integration tests for configuration and image loading
mod utils;

use ppcrecomp_core::recompiler::config::{Address, ImageFormat};
use ppcrecomp_core::recompiler::image::{Image, SymbolKind};
use ppcrecomp_core::{RecompilerConfig, RecompilerError};
use utils::*;

#[test]
fn test_config_paths_resolve_against_its_directory() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("recomp.json");
    std::fs::write(
        &config_path,
        r#"{ "image": "game.bin", "format": "raw", "base_address": 4096, "out_directory": "out" }"#,
    )
    .unwrap();

    let config = RecompilerConfig::load(&config_path).unwrap();
    assert_eq!(config.image, dir.path().join("game.bin"));
    assert_eq!(config.out_directory, dir.path().join("out"));
    assert_eq!(config.format, ImageFormat::Raw);
    assert_eq!(config.base_address, Some(Address(BASE)));
}

#[test]
fn test_missing_config_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = RecompilerConfig::load(&dir.path().join("absent.json")).unwrap_err();
    assert!(matches!(err, RecompilerError::Config { .. }));
}

#[test]
fn test_out_directory_is_required() {
    let err = RecompilerConfig::from_json_str(r#"{ "image": "a.bin" }"#, std::path::Path::new(".")).unwrap_err();
    assert!(matches!(err, RecompilerError::Config { .. }));
}

#[test]
fn test_raw_image_loads_with_hints() {
    let dir = tempfile::tempdir().unwrap();
    let image_path = dir.path().join("code.bin");
    std::fs::write(&image_path, bytes(&if_then())).unwrap();
    let text = raw_config(
        &image_path,
        &dir.path().join("out"),
        r#", "entry_point": "0x1004", "functions": [{ "address": "0x1000", "name": "compare_zero" }]"#,
    );
    let config = RecompilerConfig::from_json_str(&text, dir.path()).unwrap();

    let image = Image::load(&config).unwrap();
    assert_eq!(image.entry_point, 0x1004);
    assert!(image.is_executable(0x100C));
    assert!(!image.is_executable(0x1010));
    assert_eq!(image.read_u32(0x100C), Some(BLR));
    let hint = image.symbols.get(0x1000).unwrap();
    assert_eq!(hint.name, "compare_zero");
    assert_eq!(hint.kind, SymbolKind::Function);
}

#[test]
fn test_missing_image_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let text = raw_config(&dir.path().join("missing.bin"), &dir.path().join("out"), "");
    let config = RecompilerConfig::from_json_str(&text, dir.path()).unwrap();

    let err = Image::load(&config).unwrap_err();
    match err {
        RecompilerError::Config { message, .. } => assert!(message.contains("missing.bin"), "{}", message),
        other => panic!("expected a config error, got {:?}", other),
    }
}

#[test]
fn test_dol_entry_and_text_section() {
    let mut dol = vec![0u8; 0x100];
    let mut put = |offset: usize, value: u32| dol[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    put(0x00, 0x100); // text0 offset
    put(0x48, 0x8000_3100); // text0 address
    put(0x90, 0x10); // text0 size
    put(0xE0, 0x8000_3100); // entry
    dol.extend(bytes(&[li(3, 0), NOP, NOP, BLR]));

    let dir = tempfile::tempdir().unwrap();
    let image_path = dir.path().join("main.dol");
    std::fs::write(&image_path, &dol).unwrap();
    let text = format!(
        r#"{{ "image": {:?}, "out_directory": "out" }}"#,
        image_path.display().to_string()
    );
    let config = RecompilerConfig::from_json_str(&text, dir.path()).unwrap();

    let image = Image::load(&config).unwrap();
    assert_eq!(image.entry_point, 0x8000_3100);
    assert!(image.is_executable(0x8000_310C));
    assert_eq!(image.read_u32(0x8000_310C), Some(BLR));
}
