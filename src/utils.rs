use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Short hash used in place of local paths anywhere data leaves the machine.
///
/// Local paths may contain PHI (patient names in folder names are common),
/// so studies and files are identified on the wire by the first 8 hex
/// characters of the SHA-256 of the path string.
pub fn create_hash(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(digest)[..8].to_string()
}

/// Hash of a filesystem path, using its platform string form.
pub fn hash_path(path: &Path) -> String {
    create_hash(&path.to_string_lossy())
}

/// Find study directories under `root`.
///
/// A directory is a study directory when it contains only files
/// (at least one, no subdirectories). `root` itself qualifies.
pub fn study_dirs(root: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_dir())
        .filter(|e| is_study_dir(e.path()))
        .map(|e| e.into_path())
        .collect();
    dirs.sort();
    dirs
}

fn is_study_dir(dir: &Path) -> bool {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return false;
    };
    let mut has_file = false;
    for entry in entries.flatten() {
        if entry.path().is_dir() {
            return false;
        }
        has_file = true;
    }
    has_file
}

/// Sorted list of the regular files directly inside `dir`.
pub fn files_in_dir(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    files.sort();
    files
}
