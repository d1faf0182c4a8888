use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use tracing::{info, warn};

use crate::utils;

#[derive(Debug, Snafu)]
pub enum Error {
    /// Could not open results archive {path}
    OpenResults {
        path: String,
        source: std::io::Error,
    },

    /// Could not unpack results archive {path}
    Unzip {
        path: String,
        source: zip::result::ZipError,
    },

    /// Results table {path} is missing from the downloaded payload
    MissingTable { path: String },

    /// Could not read results table {path}
    ReadTable { path: String, source: csv::Error },

    /// Could not write results table {path}
    WriteTable { path: String, source: csv::Error },
}

/// Study-level result row, rewritten with the local study path.
#[derive(Debug, Clone, Serialize)]
pub struct StudyResult {
    pub study_path: String,
    pub score: f64,
}

/// File-level result row, rewritten with the local file path.
///
/// Bounding-box columns are only populated when the score exceeded the
/// server-side threshold; otherwise the cells stay empty.
#[derive(Debug, Clone, Serialize)]
pub struct FileResult {
    pub file_path: String,
    pub x1: Option<f64>,
    pub y1: Option<f64>,
    pub x2: Option<f64>,
    pub y2: Option<f64>,
    pub slice: Option<f64>,
    pub score: Option<f64>,
}

impl FileResult {
    /// True when the row carries a complete drawable box.
    pub fn has_box(&self) -> bool {
        self.x1.is_some()
            && self.y1.is_some()
            && self.x2.is_some()
            && self.y2.is_some()
            && self.score.is_some()
    }
}

#[derive(Debug, Deserialize)]
struct RawStudyRow {
    #[serde(rename = "StudyInstanceUID")]
    study_uid: String,
    score: f64,
}

#[derive(Debug, Deserialize)]
struct RawFileRow {
    #[serde(rename = "StudyInstanceUID")]
    study_uid: String,
    #[serde(rename = "SOPInstanceUID")]
    sop_uid: String,
    x1: Option<f64>,
    y1: Option<f64>,
    x2: Option<f64>,
    y2: Option<f64>,
    slice: Option<f64>,
    score: Option<f64>,
}

/// Rebuild the wire-identifier → local-path map by re-walking the input
/// with the same hashing the extractor used.
pub fn build_hash_map(input: &Path) -> HashMap<String, PathBuf> {
    let mut map = HashMap::new();
    if input.is_file() {
        if let Some(parent) = input.parent() {
            map.insert(utils::hash_path(parent), parent.to_path_buf());
        }
        map.insert(utils::hash_path(input), input.to_path_buf());
        return map;
    }
    for study_dir in utils::study_dirs(input) {
        map.insert(utils::hash_path(&study_dir), study_dir.clone());
        for file in utils::files_in_dir(&study_dir) {
            map.insert(utils::hash_path(&file), file);
        }
    }
    map
}

/// Unpack the downloaded payload and rewrite both tables with local
/// paths. Returns the parsed study-level and file-level rows.
pub fn process_results(
    results_zip: &Path,
    output_dir: &Path,
    session_id: &str,
    input: &Path,
) -> Result<(Vec<StudyResult>, Vec<FileResult>), Error> {
    let csv_dir = output_dir.join(session_id).join("csv");
    let file = File::open(results_zip).context(OpenResultsSnafu {
        path: results_zip.display().to_string(),
    })?;
    let mut archive = zip::ZipArchive::new(file).context(UnzipSnafu {
        path: results_zip.display().to_string(),
    })?;
    archive.extract(&csv_dir).context(UnzipSnafu {
        path: results_zip.display().to_string(),
    })?;

    let hash_map = build_hash_map(input);
    rewrite_tables(&csv_dir, session_id, &hash_map)
}

/// Rewrite `{session}_study.csv` and `{session}_dicom.csv` in place,
/// replacing path hashes with the local paths they were derived from.
///
/// Rows whose hash is unknown locally are reported and dropped; a
/// partially intelligible payload still yields results.
fn rewrite_tables(
    csv_dir: &Path,
    session_id: &str,
    hash_map: &HashMap<String, PathBuf>,
) -> Result<(Vec<StudyResult>, Vec<FileResult>), Error> {
    let study_path = csv_dir.join(format!("{}_study.csv", session_id));
    let dicom_path = csv_dir.join(format!("{}_dicom.csv", session_id));
    ensure!(
        study_path.is_file(),
        MissingTableSnafu {
            path: study_path.display().to_string()
        }
    );
    ensure!(
        dicom_path.is_file(),
        MissingTableSnafu {
            path: dicom_path.display().to_string()
        }
    );

    let mut studies = Vec::new();
    let mut reader = csv::Reader::from_path(&study_path).context(ReadTableSnafu {
        path: study_path.display().to_string(),
    })?;
    for row in reader.deserialize::<RawStudyRow>() {
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                warn!("Skipping malformed study row: {}", e);
                continue;
            }
        };
        let Some(path) = hash_map.get(&row.study_uid) else {
            warn!("Study id {} does not match any local study", row.study_uid);
            continue;
        };
        studies.push(StudyResult {
            study_path: path.to_string_lossy().into_owned(),
            score: row.score,
        });
    }

    let mut files = Vec::new();
    let mut reader = csv::Reader::from_path(&dicom_path).context(ReadTableSnafu {
        path: dicom_path.display().to_string(),
    })?;
    for row in reader.deserialize::<RawFileRow>() {
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                warn!("Skipping malformed file row: {}", e);
                continue;
            }
        };
        if !hash_map.contains_key(&row.study_uid) {
            warn!("Study id {} does not match any local study", row.study_uid);
            continue;
        }
        let Some(path) = hash_map.get(&row.sop_uid) else {
            warn!("File id {} does not match any local file", row.sop_uid);
            continue;
        };
        files.push(FileResult {
            file_path: path.to_string_lossy().into_owned(),
            x1: row.x1,
            y1: row.y1,
            x2: row.x2,
            y2: row.y2,
            slice: row.slice,
            score: row.score,
        });
    }

    write_table(&study_path, &studies)?;
    write_table(&dicom_path, &files)?;
    info!(
        "Parsed {} study result(s) and {} file result(s)",
        studies.len(),
        files.len()
    );

    Ok((studies, files))
}

fn write_table<T: Serialize>(path: &Path, rows: &[T]) -> Result<(), Error> {
    let mut writer = csv::Writer::from_path(path).context(WriteTableSnafu {
        path: path.display().to_string(),
    })?;
    for row in rows {
        writer.serialize(row).context(WriteTableSnafu {
            path: path.display().to_string(),
        })?;
    }
    writer.flush().map_err(|e| Error::WriteTable {
        path: path.display().to_string(),
        source: csv::Error::from(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "mammoscreen_{}_{}",
            name,
            uuid::Uuid::new_v4().simple()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_build_hash_map_for_file_input() {
        let root = scratch_dir("hashmap_file");
        let file = root.join("im1.dcm");
        fs::write(&file, b"x").unwrap();

        let map = build_hash_map(&file);
        assert_eq!(map.get(&utils::hash_path(&file)), Some(&file));
        assert_eq!(map.get(&utils::hash_path(&root)), Some(&root));

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_rewrite_tables_maps_hashes_and_drops_unknown_rows() {
        let root = scratch_dir("rewrite");
        let study = root.join("input").join("study_a");
        fs::create_dir_all(&study).unwrap();
        let im = study.join("im1.dcm");
        fs::write(&im, b"x").unwrap();

        let study_hash = utils::hash_path(&study);
        let file_hash = utils::hash_path(&im);

        let csv_dir = root.join("csv");
        fs::create_dir_all(&csv_dir).unwrap();
        fs::write(
            csv_dir.join("sess_study.csv"),
            format!("StudyInstanceUID,score\n{study_hash},0.82\ndeadbeef,0.10\n"),
        )
        .unwrap();
        fs::write(
            csv_dir.join("sess_dicom.csv"),
            format!(
                "StudyInstanceUID,SOPInstanceUID,x1,y1,x2,y2,slice,score\n\
                 {study_hash},{file_hash},10,20,110,220,-1,0.82\n\
                 {study_hash},{file_hash},,,,,,\n\
                 {study_hash},cafebabe,1,2,3,4,0,0.5\n"
            ),
        )
        .unwrap();

        let map = build_hash_map(&root.join("input"));
        let (studies, files) = rewrite_tables(&csv_dir, "sess", &map).unwrap();

        assert_eq!(studies.len(), 1);
        assert_eq!(studies[0].study_path, study.to_string_lossy());
        assert!((studies[0].score - 0.82).abs() < 1e-9);

        assert_eq!(files.len(), 2);
        assert!(files[0].has_box());
        assert_eq!(files[0].slice, Some(-1.0));
        assert!(!files[1].has_box());

        // Tables were rewritten with local paths
        let rewritten = fs::read_to_string(csv_dir.join("sess_study.csv")).unwrap();
        assert!(rewritten.starts_with("study_path,score\n"));
        assert!(rewritten.contains(&*study.to_string_lossy()));
        let rewritten = fs::read_to_string(csv_dir.join("sess_dicom.csv")).unwrap();
        assert!(rewritten.starts_with("file_path,x1,y1,x2,y2,slice,score\n"));
        assert!(!rewritten.contains("cafebabe"));

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_rewrite_tables_requires_both_tables() {
        let root = scratch_dir("missing_table");
        let csv_dir = root.join("csv");
        fs::create_dir_all(&csv_dir).unwrap();
        fs::write(csv_dir.join("sess_study.csv"), "StudyInstanceUID,score\n").unwrap();

        let err = rewrite_tables(&csv_dir, "sess", &HashMap::new()).unwrap_err();
        assert!(matches!(err, Error::MissingTable { .. }));

        fs::remove_dir_all(&root).unwrap();
    }
}
