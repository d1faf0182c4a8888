use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use indicatif::HumanBytes;
use snafu::prelude::*;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Hard cap on the uploaded archive.
pub const MAX_ARCHIVE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Debug, Snafu)]
pub enum Error {
    /// Could not read {path} while packaging
    ReadEntry {
        path: String,
        source: std::io::Error,
    },

    /// Could not write archive {path}
    WriteArchive {
        path: String,
        source: std::io::Error,
    },

    /// Archive error for {path}
    Zip {
        path: String,
        source: zip::result::ZipError,
    },

    /// Max file size exceeded, the file cannot be uploaded ({size}). Please limit the upload to {limit} per run; study sizes: {studies}
    SizeLimitExceeded {
        size: String,
        limit: String,
        studies: String,
    },
}

/// One archived file.
#[derive(Debug, Clone)]
pub struct ManifestEntry {
    /// Path inside the archive, relative to the preprocess root.
    pub archive_path: String,
    /// Uncompressed size.
    pub bytes: u64,
}

/// Accounting of everything that went into the archive.
#[derive(Debug, Default)]
pub struct ArchiveManifest {
    pub entries: Vec<ManifestEntry>,
    /// Uncompressed total.
    pub total_bytes: u64,
    /// Compressed archive size on disk.
    pub archive_bytes: u64,
}

impl ArchiveManifest {
    /// Uncompressed bytes per top-level directory (one per study).
    pub fn study_totals(&self) -> Vec<(String, u64)> {
        let mut totals: HashMap<String, u64> = HashMap::new();
        for entry in &self.entries {
            let study = entry
                .archive_path
                .split('/')
                .next()
                .unwrap_or(entry.archive_path.as_str());
            *totals.entry(study.to_string()).or_default() += entry.bytes;
        }
        let mut totals: Vec<_> = totals.into_iter().collect();
        totals.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        totals
    }
}

/// Zip the preprocess tree into a temporary archive ready for upload.
///
/// Returns the archive path and its manifest. The caller owns the file
/// and removes it after the upload.
pub fn pack_for_upload(
    root: &Path,
    study_labels: &HashMap<String, String>,
) -> Result<(PathBuf, ArchiveManifest), Error> {
    let dest = std::env::temp_dir().join(format!(
        "{}_upload.zip",
        uuid::Uuid::new_v4().simple()
    ));
    let manifest = pack_tree(root, &dest, MAX_ARCHIVE_BYTES, study_labels)?;
    info!(
        "Packaged {} file(s), {} compressed",
        manifest.entries.len(),
        HumanBytes(manifest.archive_bytes)
    );
    Ok((dest, manifest))
}

/// Write every file under `root` into a deflate zip at `dest`,
/// enforcing `max_bytes` on the final archive size.
///
/// On overflow the partial archive is removed and the error names the
/// heaviest studies so the caller can split the run.
pub fn pack_tree(
    root: &Path,
    dest: &Path,
    max_bytes: u64,
    study_labels: &HashMap<String, String>,
) -> Result<ArchiveManifest, Error> {
    let file = File::create(dest).context(WriteArchiveSnafu {
        path: dest.display().to_string(),
    })?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(9));

    let mut manifest = ArchiveManifest::default();

    for entry in WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        debug!("Adding '{}' to archive", relative);

        writer
            .start_file(relative.as_str(), options)
            .context(ZipSnafu {
                path: relative.clone(),
            })?;
        let data = std::fs::read(path).context(ReadEntrySnafu {
            path: path.display().to_string(),
        })?;
        writer.write_all(&data).context(WriteArchiveSnafu {
            path: dest.display().to_string(),
        })?;

        manifest.total_bytes += data.len() as u64;
        manifest.entries.push(ManifestEntry {
            archive_path: relative,
            bytes: data.len() as u64,
        });
    }

    let file = writer.finish().context(ZipSnafu {
        path: dest.display().to_string(),
    })?;
    manifest.archive_bytes = file
        .metadata()
        .map(|m| m.len())
        .unwrap_or(manifest.total_bytes);
    drop(file);

    if manifest.archive_bytes > max_bytes {
        let studies = manifest
            .study_totals()
            .into_iter()
            .map(|(study, bytes)| {
                let label = study_labels.get(&study).cloned().unwrap_or(study);
                format!("{} ({})", label, HumanBytes(bytes))
            })
            .collect::<Vec<_>>()
            .join(", ");
        let _ = std::fs::remove_file(dest);
        return SizeLimitExceededSnafu {
            size: HumanBytes(manifest.archive_bytes).to_string(),
            limit: HumanBytes(max_bytes).to_string(),
            studies,
        }
        .fail();
    }

    Ok(manifest)
}
