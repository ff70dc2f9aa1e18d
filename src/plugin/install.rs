//! Plugin artifact install: download-by-scheme, checksum verification,
//! zip extraction with Zip-Slip defense, spec.md §4.9.

use crate::errors::{AppError, AppResult};
use crate::plugin::manifest::ArtifactSource;
use log::info;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Fetch the artifact bytes named by `source.url`, dispatching on scheme:
/// `http(s)://` via `reqwest`, `file://` via `tokio::fs`.
pub async fn download(source: &ArtifactSource) -> AppResult<Vec<u8>> {
    if let Some(path) = source.url.strip_prefix("file://") {
        return tokio::fs::read(path).await.map_err(Into::into);
    }
    if source.url.starts_with("http://") || source.url.starts_with("https://") {
        let bytes = reqwest::get(&source.url).await?.bytes().await?;
        return Ok(bytes.to_vec());
    }
    Err(AppError::Plugin {
        operation: "download".to_string(),
        reason: format!("unsupported URL scheme: {}", source.url),
    })
}

/// Verify `bytes` against `source.checksum` (`sha256:<hex>`).
pub fn verify_checksum(bytes: &[u8], source: &ArtifactSource) -> AppResult<()> {
    let expected = source.sha256_hex().ok_or_else(|| AppError::Plugin {
        operation: "checksum".to_string(),
        reason: format!("unsupported checksum format: {}", source.checksum),
    })?;
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let actual = hex::encode(hasher.finalize());
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(AppError::ChecksumMismatch {
            artifact: source.url.clone(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Remove any prior install directory and unzip `bytes` into
/// `<install_dir>/<plugin_id>/<version>/`, rejecting any entry whose
/// cleaned path would escape that root (Zip-Slip defense).
pub fn extract(bytes: &[u8], install_dir: &Path, plugin_id: &str, version: &str) -> AppResult<PathBuf> {
    let target_root = install_dir.join(plugin_id).join(version);
    if target_root.exists() {
        std::fs::remove_dir_all(&target_root)?;
    }
    std::fs::create_dir_all(&target_root)?;

    let cursor = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor)?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(relative) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            return Err(AppError::ZipSlip {
                entry: entry.name().to_string(),
            });
        };
        let out_path = target_root.join(&relative);
        if !out_path.starts_with(&target_root) {
            return Err(AppError::ZipSlip {
                entry: entry.name().to_string(),
            });
        }
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out_file = std::fs::File::create(&out_path)?;
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        std::io::Write::write_all(&mut out_file, &buf)?;
    }
    info!("extracted plugin {plugin_id}@{version} into {}", target_root.display());
    Ok(target_root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_with_entry(name: &str, content: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let cursor = std::io::Cursor::new(&mut buf);
            let mut writer = zip::ZipWriter::new(cursor);
            writer.start_file(name, zip::write::SimpleFileOptions::default()).unwrap();
            writer.write_all(content).unwrap();
            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn verify_checksum_accepts_matching_digest() {
        let bytes = b"hello world";
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest = hex::encode(hasher.finalize());
        let source = ArtifactSource {
            url: "file:///tmp/a.zip".to_string(),
            checksum: format!("sha256:{digest}"),
        };
        verify_checksum(bytes, &source).unwrap();
    }

    #[test]
    fn verify_checksum_rejects_mismatch() {
        let source = ArtifactSource {
            url: "file:///tmp/a.zip".to_string(),
            checksum: "sha256:deadbeef".to_string(),
        };
        let err = verify_checksum(b"hello", &source).unwrap_err();
        assert!(matches!(err, AppError::ChecksumMismatch { .. }));
    }

    #[test]
    fn extract_writes_entries_under_target_root() {
        let dir = tempfile::tempdir().unwrap();
        let zip_bytes = zip_with_entry("plugin.bin", b"payload");
        let out = extract(&zip_bytes, dir.path(), "demo", "1.0.0").unwrap();
        assert!(out.join("plugin.bin").exists());
        assert_eq!(std::fs::read(out.join("plugin.bin")).unwrap(), b"payload");
    }
}
