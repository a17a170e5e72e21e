use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::db::DB_FILE;
use crate::storage::REMOTE_DB_FILE;

const MANIFEST_ENTRY: &str = "manifest.json";
pub const BUNDLE_FORMAT_V1: &str = "gradeimport-workspace-v1";

/// Workspace files a bundle may carry. The workspace DB is mandatory.
const BUNDLED_FILES: [(&str, bool); 2] = [(DB_FILE, true), (REMOTE_DB_FILE, false)];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestEntry {
    path: String,
    file: String,
    bytes: u64,
    sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    format: String,
    version: u32,
    app_version: String,
    exported_at: String,
    source_workspace: String,
    entries: Vec<ManifestEntry>,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
    pub files_restored: Vec<String>,
}

fn sha256_file(path: &Path) -> anyhow::Result<(String, u64)> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open {}", path.to_string_lossy()))?;
    let mut hasher = Sha256::new();
    let bytes = std::io::copy(&mut f, &mut hasher)
        .with_context(|| format!("failed to hash {}", path.to_string_lossy()))?;
    Ok((format!("{:x}", hasher.finalize()), bytes))
}

pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join(DB_FILE);
    if !db_path.is_file() {
        return Err(anyhow!(
            "workspace database not found: {}",
            db_path.to_string_lossy()
        ));
    }

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }

    let mut entries = Vec::new();
    for (file, _) in BUNDLED_FILES {
        let src = workspace_path.join(file);
        if !src.is_file() {
            continue;
        }
        let (sha256, bytes) = sha256_file(&src)?;
        entries.push(ManifestEntry {
            path: format!("db/{}", file),
            file: file.to_string(),
            bytes,
            sha256,
        });
    }
    let manifest = Manifest {
        format: BUNDLE_FORMAT_V1.to_string(),
        version: 1,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        exported_at: chrono::Utc::now().to_rfc3339(),
        source_workspace: workspace_path.to_string_lossy().to_string(),
        entries,
    };

    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file(MANIFEST_ENTRY, opts)
        .context("failed to start manifest entry")?;
    zip.write_all(
        serde_json::to_string_pretty(&manifest)
            .context("failed to serialize manifest")?
            .as_bytes(),
    )
    .context("failed to write manifest entry")?;

    for entry in &manifest.entries {
        zip.start_file(entry.path.as_str(), opts)
            .with_context(|| format!("failed to start entry {}", entry.path))?;
        let mut src = File::open(workspace_path.join(&entry.file))
            .with_context(|| format!("failed to open {}", entry.file))?;
        std::io::copy(&mut src, &mut zip)
            .with_context(|| format!("failed to write entry {}", entry.path))?;
    }

    zip.finish().context("failed to finalize zip bundle")?;
    tracing::info!(
        out = %out_path.to_string_lossy(),
        entries = manifest.entries.len() + 1,
        "workspace bundle exported"
    );

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        entry_count: manifest.entries.len() + 1,
    })
}

pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace_path).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace_path.to_string_lossy()
        )
    })?;

    if !is_zip_file(in_path)? {
        // A bare database file restores the workspace DB only.
        let dst = workspace_path.join(DB_FILE);
        std::fs::copy(in_path, &dst).with_context(|| {
            format!(
                "failed to copy sqlite backup from {} to {}",
                in_path.to_string_lossy(),
                dst.to_string_lossy()
            )
        })?;
        return Ok(ImportSummary {
            bundle_format_detected: "sqlite3".to_string(),
            files_restored: vec![DB_FILE.to_string()],
        });
    }

    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: Manifest =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid")?;
    if manifest.format != BUNDLE_FORMAT_V1 {
        return Err(anyhow!("unsupported bundle format: {}", manifest.format));
    }

    for (file, required) in BUNDLED_FILES {
        if required && !manifest.entries.iter().any(|e| e.file == file) {
            return Err(anyhow!("bundle missing {}", file));
        }
    }

    // Extract and verify everything before touching the live files.
    let mut staged: Vec<(PathBuf, PathBuf)> = Vec::new();
    for entry in &manifest.entries {
        if !BUNDLED_FILES.iter().any(|(f, _)| *f == entry.file) {
            return Err(anyhow!("unexpected bundle entry: {}", entry.file));
        }
        let tmp = workspace_path.join(format!("{}.importing", entry.file));
        if tmp.exists() {
            let _ = std::fs::remove_file(&tmp);
        }
        let mut out = File::create(&tmp)
            .with_context(|| format!("failed to create temp file {}", tmp.to_string_lossy()))?;
        {
            let mut zipped = archive
                .by_name(&entry.path)
                .with_context(|| format!("bundle missing {}", entry.path))?;
            std::io::copy(&mut zipped, &mut out)
                .with_context(|| format!("failed to extract {}", entry.path))?;
        }
        out.flush().context("failed to flush extracted file")?;
        let (sha256, _) = sha256_file(&tmp)?;
        if sha256 != entry.sha256 {
            let _ = std::fs::remove_file(&tmp);
            return Err(anyhow!("checksum mismatch for {}", entry.path));
        }
        staged.push((tmp, workspace_path.join(&entry.file)));
    }

    let mut restored = Vec::new();
    for (file, _) in BUNDLED_FILES {
        let dst = workspace_path.join(file);
        if dst.exists() {
            std::fs::remove_file(&dst).with_context(|| {
                format!("failed to remove existing {}", dst.to_string_lossy())
            })?;
        }
    }
    for (tmp, dst) in staged {
        std::fs::rename(&tmp, &dst).with_context(|| {
            format!("failed to move extracted file to {}", dst.to_string_lossy())
        })?;
        restored.push(
            dst.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        );
    }
    tracing::info!(files = ?restored, "workspace bundle imported");

    Ok(ImportSummary {
        bundle_format_detected: BUNDLE_FORMAT_V1.to_string(),
        files_restored: restored,
    })
}

fn is_zip_file(path: &Path) -> anyhow::Result<bool> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open input file {}", path.to_string_lossy()))?;
    let mut sig = [0u8; 4];
    let read = f.read(&mut sig).context("failed to read file signature")?;
    if read < 4 {
        return Ok(false);
    }
    Ok(sig == [0x50, 0x4B, 0x03, 0x04])
}
