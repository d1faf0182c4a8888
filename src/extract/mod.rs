use std::path::{Path, PathBuf};
use std::time::Duration;

use dicom_pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption};
use image::{ImageBuffer, Luma};
use indicatif::{ProgressBar, ProgressStyle};
use snafu::prelude::*;
use tracing::{debug, info, warn};

use crate::utils;

pub mod metadata;

pub use metadata::{FileMetadata, ALLOWED_SOP_CLASS_UIDS};

#[derive(Debug, Snafu)]
pub enum Error {
    /// Input path {path} does not exist
    MissingInput { path: String },

    /// Could not read {path} as a DICOM file
    ReadFile {
        path: String,
        source: Box<dicom_object::ReadError>,
    },

    /// SOPClassUID incorrect ({uid}); only digital mammography and breast tomosynthesis objects are accepted
    DisallowedSopClass { uid: String },

    /// BurnedInAnnotation not found or != "NO"
    BurnedInAnnotation,

    /// Could not find a view code match for {value}
    UnknownViewPosition { value: String },

    /// Could not decode pixel data from {path}
    DecodePixels {
        path: String,
        source: Box<dicom_pixeldata::Error>,
    },

    /// The NumberOfFrames field ({declared}) and the pixel data ({actual} frames) are inconsistent
    FrameCountMismatch { declared: u32, actual: u32 },

    /// Decoded frame geometry does not match the image dimensions for {path}
    FrameGeometry { path: String },

    /// Could not encode frame image {path}
    EncodeFrame {
        path: String,
        source: image::ImageError,
    },

    /// Could not write preprocessed data to {path}
    WritePreprocessed {
        path: String,
        source: std::io::Error,
    },

    /// Please use a new or empty folder as the preprocess directory ({path} is not empty)
    PreprocessDirNotEmpty { path: String },

    /// A single-file input must yield at most one image, got {count}
    SingleFileInput { count: usize },
}

/// One extracted DICOM file: hashes, metadata and where its frames went.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub source: PathBuf,
    pub study_hash: String,
    pub file_hash: String,
    pub metadata: FileMetadata,
    pub frames: u32,
    pub exported_bytes: u64,
}

/// All extracted files of one study directory.
#[derive(Debug, Clone)]
pub struct StudyRecord {
    pub source: PathBuf,
    pub study_hash: String,
    pub files: Vec<FileRecord>,
}

/// Outcome of walking the whole input.
#[derive(Debug, Default)]
pub struct ExtractSummary {
    pub studies: Vec<StudyRecord>,
    pub rejected: usize,
}

impl ExtractSummary {
    pub fn num_images(&self) -> usize {
        self.studies.iter().map(|s| s.files.len()).sum()
    }
}

/// Ensure the preprocess directory is usable: create it when missing,
/// accept it only when empty otherwise.
pub fn prepare_preprocess_dir(dir: &Path) -> Result<(), Error> {
    if dir.exists() {
        let occupied = std::fs::read_dir(dir)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(true);
        ensure!(
            dir.is_dir() && !occupied,
            PreprocessDirNotEmptySnafu {
                path: dir.display().to_string()
            }
        );
        return Ok(());
    }
    std::fs::create_dir_all(dir).context(WritePreprocessedSnafu {
        path: dir.display().to_string(),
    })
}

/// Walk `input` and populate `preprocess_dir` with pixel frames and
/// metadata for every valid file.
///
/// A file input is treated as a single-image study rooted at its parent
/// directory. Rejected files are reported and skipped; they never abort
/// the study they belong to.
pub fn extract_input(input: &Path, preprocess_dir: &Path) -> Result<ExtractSummary, Error> {
    let mut summary = ExtractSummary::default();

    if input.is_file() {
        let parent = input.parent().unwrap_or_else(|| Path::new("."));
        let (study, rejected) = read_study(parent, preprocess_dir, Some(input), None)?;
        summary.rejected = rejected;
        if !study.files.is_empty() {
            summary.studies.push(study);
        }
        ensure!(
            summary.num_images() <= 1,
            SingleFileInputSnafu {
                count: summary.num_images()
            }
        );
        return Ok(summary);
    }

    ensure!(
        input.is_dir(),
        MissingInputSnafu {
            path: input.display().to_string()
        }
    );

    let study_dirs = utils::study_dirs(input);
    let total_files: u64 = study_dirs
        .iter()
        .map(|d| utils::files_in_dir(d).len() as u64)
        .sum();

    let progress = ProgressBar::new(total_files);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40} {pos}/{len} {wide_msg}")
            .expect("Invalid progress bar template"),
    );
    progress.enable_steady_tick(Duration::new(0, 480_000_000));

    for study_dir in &study_dirs {
        let (study, rejected) = read_study(study_dir, preprocess_dir, None, Some(&progress))?;
        summary.rejected += rejected;
        if !study.files.is_empty() {
            summary.studies.push(study);
        }
    }
    progress.finish_with_message("done");

    Ok(summary)
}

/// Read every DICOM file directly inside `study_dir`.
///
/// Returns the study record plus the number of rejected files.
fn read_study(
    study_dir: &Path,
    preprocess_dir: &Path,
    only_include: Option<&Path>,
    progress: Option<&ProgressBar>,
) -> Result<(StudyRecord, usize), Error> {
    let study_hash = utils::hash_path(study_dir);
    let mut files = Vec::new();
    let mut rejected = 0usize;

    for path in utils::files_in_dir(study_dir) {
        if let Some(only) = only_include {
            if path != only {
                continue;
            }
        }
        debug!("Reading file '{}'", path.display());
        match read_file(&path, &study_hash, preprocess_dir) {
            Ok(record) => files.push(record),
            Err(e) => {
                warn!(
                    "File {} could not be processed correctly as a DICOM file ({}) (skipped)",
                    path.display(),
                    e
                );
                rejected += 1;
            }
        }
        if let Some(pb) = progress {
            pb.inc(1);
        }
    }

    if !files.is_empty() {
        write_study_metadata(preprocess_dir, &study_hash, &files)?;
        info!(
            "Study {} -> {} ({} image(s))",
            study_dir.display(),
            study_hash,
            files.len()
        );
    }

    Ok((
        StudyRecord {
            source: study_dir.to_path_buf(),
            study_hash,
            files,
        },
        rejected,
    ))
}

/// Validate the gatekeeping attributes of a candidate file.
///
/// Acceptance requires an allowed SOP class and an explicit
/// BurnedInAnnotation of "NO"; anything else could carry PHI inside the
/// pixel data and is refused.
pub fn validate(sop_class_uid: &str, burned_in_annotation: Option<&str>) -> Result<(), Error> {
    ensure!(
        ALLOWED_SOP_CLASS_UIDS.contains(&sop_class_uid),
        DisallowedSopClassSnafu { uid: sop_class_uid }
    );
    let burned_in = burned_in_annotation.unwrap_or_default();
    ensure!(burned_in.eq_ignore_ascii_case("NO"), BurnedInAnnotationSnafu);
    Ok(())
}

fn read_file(path: &Path, study_hash: &str, preprocess_dir: &Path) -> Result<FileRecord, Error> {
    let obj = dicom_object::open_file(path)
        .map_err(Box::from)
        .context(ReadFileSnafu {
            path: path.display().to_string(),
        })?;

    let sop_class_uid = obj
        .meta()
        .media_storage_sop_class_uid
        .trim_end_matches('\0')
        .to_string();
    let burned_in = metadata::element_str(&obj, dicom_dictionary_std::tags::BURNED_IN_ANNOTATION);
    validate(
        &sop_class_uid,
        if burned_in.is_empty() {
            None
        } else {
            Some(burned_in.as_str())
        },
    )?;

    let file_hash = utils::hash_path(path);
    let meta = metadata::read_metadata(&obj, &sop_class_uid, study_hash, &file_hash)?;

    let decoded = obj
        .decode_pixel_data()
        .map_err(Box::from)
        .context(DecodePixelsSnafu {
            path: path.display().to_string(),
        })?;
    let frames = decoded.number_of_frames();

    if let Ok(declared) = meta.number_of_frames.parse::<u32>() {
        ensure!(
            declared == frames,
            FrameCountMismatchSnafu {
                declared,
                actual: frames
            }
        );
    }

    // Apply the file's VOI LUT unless the manufacturer is one the service
    // windows on its own.
    let manufacturer = metadata::normalize_manufacturer(&meta.manufacturer);
    let options = if matches!(manufacturer.as_str(), "ge" | "hologic") {
        ConvertOptions::new()
    } else {
        ConvertOptions::new().with_voi_lut(VoiLutOption::First)
    };

    let frame_dest = preprocess_dir.join(study_hash).join(&file_hash);
    std::fs::create_dir_all(&frame_dest).context(WritePreprocessedSnafu {
        path: frame_dest.display().to_string(),
    })?;

    let (rows, columns) = (decoded.rows(), decoded.columns());
    let mut exported_bytes = 0u64;
    for frame in 0..frames {
        let pixels = decoded
            .to_vec_frame_with_options::<u16>(frame, &options)
            .map_err(Box::from)
            .context(DecodePixelsSnafu {
                path: path.display().to_string(),
            })?;
        let frame_path = frame_dest.join(format!("frame_{}.png", frame));
        let buffer = ImageBuffer::<Luma<u16>, Vec<u16>>::from_raw(columns, rows, pixels)
            .context(FrameGeometrySnafu {
                path: frame_path.display().to_string(),
            })?;
        buffer.save(&frame_path).context(EncodeFrameSnafu {
            path: frame_path.display().to_string(),
        })?;
        exported_bytes += std::fs::metadata(&frame_path)
            .map(|m| m.len())
            .unwrap_or(0);
    }

    Ok(FileRecord {
        source: path.to_path_buf(),
        study_hash: study_hash.to_string(),
        file_hash,
        metadata: meta,
        frames,
        exported_bytes,
    })
}

fn write_study_metadata(
    preprocess_dir: &Path,
    study_hash: &str,
    files: &[FileRecord],
) -> Result<(), Error> {
    let study_dest = preprocess_dir.join(study_hash);
    std::fs::create_dir_all(&study_dest).context(WritePreprocessedSnafu {
        path: study_dest.display().to_string(),
    })?;
    let metadata_path = study_dest.join("study_metadata.json");
    let table: Vec<&FileMetadata> = files.iter().map(|f| &f.metadata).collect();
    let file = std::fs::File::create(&metadata_path).context(WritePreprocessedSnafu {
        path: metadata_path.display().to_string(),
    })?;
    serde_json::to_writer_pretty(file, &table).map_err(|e| Error::WritePreprocessed {
        path: metadata_path.display().to_string(),
        source: e.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::metadata::{BREAST_TOMOSYNTHESIS, DIGITAL_MAMMOGRAPHY_FOR_PRESENTATION};

    #[test]
    fn test_validate_accepts_allowed_classes() {
        assert!(validate(DIGITAL_MAMMOGRAPHY_FOR_PRESENTATION, Some("NO")).is_ok());
        assert!(validate(BREAST_TOMOSYNTHESIS, Some("NO")).is_ok());
        // Attribute comparison is case-insensitive
        assert!(validate(BREAST_TOMOSYNTHESIS, Some("no")).is_ok());
    }

    #[test]
    fn test_validate_rejects_other_sop_classes() {
        // CT Image Storage
        let err = validate("1.2.840.10008.5.1.4.1.1.2", Some("NO")).unwrap_err();
        assert!(matches!(err, Error::DisallowedSopClass { .. }));
    }

    #[test]
    fn test_validate_rejects_burned_in_annotations() {
        let err = validate(DIGITAL_MAMMOGRAPHY_FOR_PRESENTATION, Some("YES")).unwrap_err();
        assert!(matches!(err, Error::BurnedInAnnotation));
        let err = validate(DIGITAL_MAMMOGRAPHY_FOR_PRESENTATION, None).unwrap_err();
        assert!(matches!(err, Error::BurnedInAnnotation));
    }

    #[test]
    fn test_prepare_preprocess_dir_requires_empty() {
        let root = std::env::temp_dir().join(format!(
            "mammoscreen_prep_{}",
            uuid::Uuid::new_v4().simple()
        ));
        // Missing directory is created
        prepare_preprocess_dir(&root).unwrap();
        assert!(root.is_dir());
        // Empty directory is accepted
        prepare_preprocess_dir(&root).unwrap();
        // Occupied directory is refused
        std::fs::write(root.join("leftover"), b"x").unwrap();
        let err = prepare_preprocess_dir(&root).unwrap_err();
        assert!(matches!(err, Error::PreprocessDirNotEmpty { .. }));
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_extract_input_missing_path() {
        let bogus = std::env::temp_dir().join("mammoscreen_does_not_exist");
        let scratch = std::env::temp_dir().join(format!(
            "mammoscreen_extract_{}",
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::create_dir_all(&scratch).unwrap();
        let err = extract_input(&bogus, &scratch).unwrap_err();
        assert!(matches!(err, Error::MissingInput { .. }));
        std::fs::remove_dir_all(&scratch).unwrap();
    }

    #[test]
    fn test_non_dicom_files_are_rejected_not_fatal() {
        let root = std::env::temp_dir().join(format!(
            "mammoscreen_reject_{}",
            uuid::Uuid::new_v4().simple()
        ));
        let study = root.join("study");
        std::fs::create_dir_all(&study).unwrap();
        std::fs::write(study.join("not_a_dicom.dcm"), b"garbage").unwrap();
        let scratch = root.join("preprocessed");
        std::fs::create_dir_all(&scratch).unwrap();

        let summary = extract_input(&root, &scratch).unwrap();
        assert_eq!(summary.num_images(), 0);
        assert_eq!(summary.rejected, 1);
        assert!(summary.studies.is_empty());

        std::fs::remove_dir_all(&root).unwrap();
    }
}
