//! Bundle container metadata access.
//!
//! A bundle archive (`.bdl`) is a gzipped tar carrying a `manifest.json` at
//! its root next to the code assets. This module only reads metadata; actual
//! extraction to disk is a privileged operation owned by the daemon.

use crate::config::PathsConfig;
use crate::model::AbilityEntry;
use crate::{CapsaError, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

/// Declared metadata of a bundle, as carried in its `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    pub name: String,
    pub label: String,
    pub version: u32,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub small_icon_path: Option<String>,
    #[serde(default)]
    pub big_icon_path: Option<String>,
    #[serde(default)]
    pub ability: Option<AbilityEntry>,
}

/// Check whether a path looks like an installable bundle archive: a regular
/// file carrying the bundle suffix.
pub fn is_bundle_file(path: &Path) -> bool {
    path.is_file()
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(PathsConfig::BUNDLE_SUFFIX))
}

/// Read the full manifest out of a bundle archive without extracting it.
pub fn read_manifest(bundle_path: &Path) -> Result<BundleManifest> {
    let file = File::open(bundle_path)
        .map_err(|e| CapsaError::io_with_path(e, bundle_path))?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));

    let entries = archive.entries().map_err(|e| CapsaError::Parse {
        message: format!("{} is not a bundle archive: {}", bundle_path.display(), e),
    })?;

    for entry in entries {
        let mut entry = entry.map_err(|e| CapsaError::Parse {
            message: format!("corrupt entry in {}: {}", bundle_path.display(), e),
        })?;
        if !is_manifest_entry(&entry) {
            continue;
        }
        let mut contents = String::new();
        entry
            .read_to_string(&mut contents)
            .map_err(|e| CapsaError::Parse {
                message: format!("unreadable manifest in {}: {}", bundle_path.display(), e),
            })?;
        return parse_manifest_str(&contents, bundle_path);
    }

    Err(CapsaError::Parse {
        message: format!("no manifest.json in {}", bundle_path.display()),
    })
}

/// Cheap name+version probe of a bundle archive. Used by the boot scanner,
/// which needs only the declared identity to decide install/update/skip.
pub fn parse_attributes(bundle_path: &Path) -> Result<(String, u32)> {
    let manifest = read_manifest(bundle_path)?;
    Ok((manifest.name, manifest.version))
}

/// Read the manifest of an already installed bundle from its code directory.
pub fn read_installed_manifest(code_path: &Path) -> Result<BundleManifest> {
    let manifest_path = code_path.join("manifest.json");
    let contents = std::fs::read_to_string(&manifest_path)
        .map_err(|e| CapsaError::io_with_path(e, &manifest_path))?;
    parse_manifest_str(&contents, code_path)
}

fn is_manifest_entry<R: Read>(entry: &tar::Entry<'_, R>) -> bool {
    let Ok(path) = entry.path() else {
        return false;
    };
    // Root-level manifest.json only, with or without a leading "./".
    path.file_name().map(|n| n == "manifest.json").unwrap_or(false)
        && path
            .parent()
            .map(|d| d.as_os_str().is_empty() || d == Path::new("."))
            .unwrap_or(true)
}

fn parse_manifest_str(contents: &str, origin: &Path) -> Result<BundleManifest> {
    let manifest: BundleManifest =
        serde_json::from_str(contents).map_err(|e| CapsaError::Parse {
            message: format!("invalid manifest in {}: {}", origin.display(), e),
        })?;
    if manifest.name.is_empty() {
        return Err(CapsaError::Parse {
            message: format!("empty bundle name in {}", origin.display()),
        });
    }
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    fn write_bundle(dir: &Path, file_name: &str, manifest_json: &str) -> std::path::PathBuf {
        let path = dir.join(file_name);
        let file = File::create(&path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let bytes = manifest_json.as_bytes();
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "manifest.json", bytes).unwrap();

        let code = b"// entry point";
        let mut header = tar::Header::new_gnu();
        header.set_size(code.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "src/index.js", &code[..]).unwrap();

        builder.into_inner().unwrap().finish().unwrap();
        path
    }

    #[test]
    fn test_read_manifest_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = write_bundle(
            temp.path(),
            "clock.bdl",
            r#"{"name":"com.example.clock","label":"Clock","version":3,"appId":"app-77"}"#,
        );

        let manifest = read_manifest(&path).unwrap();
        assert_eq!(manifest.name, "com.example.clock");
        assert_eq!(manifest.version, 3);
        assert_eq!(manifest.app_id, "app-77");
    }

    #[test]
    fn test_parse_attributes() {
        let temp = TempDir::new().unwrap();
        let path = write_bundle(
            temp.path(),
            "clock.bdl",
            r#"{"name":"com.example.clock","label":"Clock","version":9}"#,
        );

        let (name, version) = parse_attributes(&path).unwrap();
        assert_eq!(name, "com.example.clock");
        assert_eq!(version, 9);
    }

    #[test]
    fn test_not_an_archive_is_parse_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("junk.bdl");
        std::fs::write(&path, b"not gzip at all").unwrap();

        match read_manifest(&path) {
            Err(CapsaError::Parse { .. }) => {}
            other => panic!("expected Parse error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_manifest_is_parse_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("empty.bdl");
        let file = File::create(&path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let builder = tar::Builder::new(encoder);
        builder.into_inner().unwrap().finish().unwrap();

        assert!(matches!(read_manifest(&path), Err(CapsaError::Parse { .. })));
    }

    #[test]
    fn test_empty_name_rejected() {
        let temp = TempDir::new().unwrap();
        let path = write_bundle(
            temp.path(),
            "anon.bdl",
            r#"{"name":"","label":"Anon","version":1}"#,
        );
        assert!(matches!(read_manifest(&path), Err(CapsaError::Parse { .. })));
    }

    #[test]
    fn test_is_bundle_file() {
        let temp = TempDir::new().unwrap();
        let good = temp.path().join("a.bdl");
        std::fs::write(&good, b"x").unwrap();
        let bad = temp.path().join("a.zip");
        std::fs::write(&bad, b"x").unwrap();

        assert!(is_bundle_file(&good));
        assert!(!is_bundle_file(&bad));
        assert!(!is_bundle_file(temp.path()));
    }
}
