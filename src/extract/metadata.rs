use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::{DefaultDicomObject, InMemDicomObject};
use serde::{Deserialize, Serialize};

use super::{Error, UnknownViewPositionSnafu};

/// SOP classes eligible for evaluation.
pub const DIGITAL_MAMMOGRAPHY_FOR_PRESENTATION: &str = "1.2.840.10008.5.1.4.1.1.1.2";
pub const BREAST_TOMOSYNTHESIS: &str = "1.2.840.10008.5.1.4.1.1.13.1.3";

pub const ALLOWED_SOP_CLASS_UIDS: [&str; 2] = [
    DIGITAL_MAMMOGRAPHY_FOR_PRESENTATION,
    BREAST_TOMOSYNTHESIS,
];

/// Non-PHI metadata shipped alongside the pixel data for one file.
///
/// Field names mirror the DICOM attribute keywords; values are kept as
/// strings with missing attributes coerced to "". `StudyInstanceUID` and
/// `SOPInstanceUID` carry path hashes, never the original UIDs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    #[serde(rename = "SOPClassUID")]
    pub sop_class_uid: String,
    #[serde(rename = "ViewPosition")]
    pub view_position: String,
    #[serde(rename = "ImageLaterality")]
    pub image_laterality: String,
    #[serde(rename = "Rows")]
    pub rows: String,
    #[serde(rename = "Columns")]
    pub columns: String,
    #[serde(rename = "Manufacturer")]
    pub manufacturer: String,
    #[serde(rename = "ManufacturerModelName")]
    pub manufacturer_model_name: String,
    #[serde(rename = "NumberOfFrames")]
    pub number_of_frames: String,
    #[serde(rename = "PatientOrientation")]
    pub patient_orientation: String,
    #[serde(rename = "BitsAllocated")]
    pub bits_allocated: String,
    #[serde(rename = "WindowWidth")]
    pub window_width: String,
    #[serde(rename = "WindowCenter")]
    pub window_center: String,
    #[serde(rename = "WindowCenterWidthExplanation")]
    pub window_center_width_explanation: String,
    #[serde(rename = "HighBit")]
    pub high_bit: String,
    #[serde(rename = "StudyInstanceUID")]
    pub study_instance_uid: String,
    #[serde(rename = "SOPInstanceUID")]
    pub sop_instance_uid: String,
    pub dcm_path: String,
    pub frame_dir: String,
}

/// Map a verbose view position (CID 4014 code meaning) to its acronym.
pub fn view_position_code(verbose: &str) -> Result<String, Error> {
    const CODE_TO_ACRONYM: &[(&str, &str)] = &[
        ("medio-lateral", "ML"),
        ("medio-lateral oblique", "MLO"),
        ("latero-medial", "LM"),
        ("latero-medial oblique", "LMO"),
        ("cranio-caudal", "CC"),
        ("caudo-cranial (from below)", "FB"),
        ("superolateral to inferomedial oblique", "SIO"),
        ("inferomedial to superolateral oblique", "ISO"),
        ("exaggerated cranio-caudal", "XCC"),
        ("cranio-caudal exaggerated laterally", "XCCL"),
        ("cranio-caudal exaggerated medially", "XCCM"),
        ("tissue specimen from breast", "SPECIMEN"),
    ];
    if let Some((_, acronym)) = CODE_TO_ACRONYM.iter().find(|(k, _)| *k == verbose) {
        return Ok((*acronym).to_string());
    }
    // Some vendors write the meaning without hyphens
    match verbose.trim().to_lowercase().as_str() {
        "mediolateral oblique" => Ok("MLO".to_string()),
        "craniocaudal" => Ok("CC".to_string()),
        _ => UnknownViewPositionSnafu { value: verbose }.fail(),
    }
}

/// Collapse manufacturer strings into the identifiers the service keys on.
pub fn normalize_manufacturer(manufacturer: &str) -> String {
    let lower = manufacturer.to_lowercase();
    if lower.contains("hologic") || lower.contains("lorad") {
        "hologic".to_string()
    } else if lower.replace(' ', "").contains("gemedicalsystems") {
        "ge".to_string()
    } else {
        manufacturer.to_string()
    }
}

/// String value of a top-level element, "" when absent or unreadable.
pub fn element_str(obj: &DefaultDicomObject, tag: Tag) -> String {
    obj.element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|s| s.trim_end_matches('\0').trim().to_string())
        .unwrap_or_default()
}

/// Follow a chain of single-item sequences down to a leaf element.
///
/// Each tag in `path` must resolve to a sequence whose first item is
/// descended into; `leaf` is read from the innermost item.
fn nested_str(obj: &DefaultDicomObject, path: &[Tag], leaf: Tag) -> Option<String> {
    let (first, rest) = path.split_first()?;
    let mut item: &InMemDicomObject = obj.element(*first).ok()?.value().items()?.first()?;
    for tag in rest {
        item = item.element(*tag).ok()?.value().items()?.first()?;
    }
    item.element(leaf)
        .ok()?
        .to_str()
        .ok()
        .map(|s| s.trim_end_matches('\0').trim().to_string())
}

/// Build the metadata record for one validated file.
///
/// Tomosynthesis objects keep the interesting attributes inside
/// sequences, so `ViewPosition`, `ImageLaterality` and the window
/// parameters are pulled from their nested locations and normalized to
/// the same representation 2D mammography files carry at the top level.
pub fn read_metadata(
    obj: &DefaultDicomObject,
    sop_class_uid: &str,
    study_hash: &str,
    file_hash: &str,
) -> Result<FileMetadata, Error> {
    let is_dbt = sop_class_uid == BREAST_TOMOSYNTHESIS;

    let view_position = if is_dbt {
        // ViewCodeSequence[0].CodeMeaning
        match nested_str(obj, &[Tag(0x0054, 0x0220)], Tag(0x0008, 0x0104)) {
            Some(verbose) => view_position_code(&verbose)?,
            None => String::new(),
        }
    } else {
        element_str(obj, tags::VIEW_POSITION)
    };

    let image_laterality = if is_dbt {
        // Vendor sequence carrying the frame laterality; first character only
        nested_str(obj, &[Tag(0x0019, 0x108A)], Tag(0x0019, 0x1087))
            .and_then(|s| s.chars().next())
            .map(|c| c.to_string())
            .unwrap_or_default()
    } else {
        element_str(obj, tags::IMAGE_LATERALITY)
    };

    // SharedFunctionalGroupsSequence[0].FrameVOILUTSequence[0]
    let (window_width, window_center) = if is_dbt {
        let shared = [Tag(0x5200, 0x9229), Tag(0x0028, 0x9132)];
        (
            nested_int_str(obj, &shared, Tag(0x0028, 0x1051)),
            nested_int_str(obj, &shared, Tag(0x0028, 0x1050)),
        )
    } else {
        (
            element_str(obj, tags::WINDOW_WIDTH),
            element_str(obj, tags::WINDOW_CENTER),
        )
    };

    Ok(FileMetadata {
        sop_class_uid: sop_class_uid.to_string(),
        view_position,
        image_laterality,
        rows: element_str(obj, tags::ROWS),
        columns: element_str(obj, tags::COLUMNS),
        manufacturer: element_str(obj, tags::MANUFACTURER),
        manufacturer_model_name: element_str(obj, tags::MANUFACTURER_MODEL_NAME),
        number_of_frames: element_str(obj, tags::NUMBER_OF_FRAMES),
        patient_orientation: element_str(obj, tags::PATIENT_ORIENTATION),
        bits_allocated: element_str(obj, tags::BITS_ALLOCATED),
        window_width,
        window_center,
        window_center_width_explanation: element_str(obj, tags::WINDOW_CENTER_WIDTH_EXPLANATION),
        high_bit: element_str(obj, tags::HIGH_BIT),
        study_instance_uid: study_hash.to_string(),
        sop_instance_uid: file_hash.to_string(),
        dcm_path: file_hash.to_string(),
        frame_dir: format!("{}/{}", study_hash, file_hash),
    })
}

fn nested_int_str(obj: &DefaultDicomObject, path: &[Tag], leaf: Tag) -> String {
    nested_str(obj, path, leaf)
        .and_then(|s| s.parse::<f64>().ok())
        .map(|v| (v as i64).to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_position_code_known_meanings() {
        assert_eq!(view_position_code("cranio-caudal").unwrap(), "CC");
        assert_eq!(view_position_code("medio-lateral oblique").unwrap(), "MLO");
        assert_eq!(view_position_code("caudo-cranial (from below)").unwrap(), "FB");
        assert_eq!(
            view_position_code("tissue specimen from breast").unwrap(),
            "SPECIMEN"
        );
    }

    #[test]
    fn test_view_position_code_vendor_variants() {
        assert_eq!(view_position_code("Mediolateral Oblique").unwrap(), "MLO");
        assert_eq!(view_position_code(" craniocaudal ").unwrap(), "CC");
    }

    #[test]
    fn test_view_position_code_rejects_unknown() {
        let err = view_position_code("lateral decubitus").unwrap_err();
        assert!(err.to_string().contains("lateral decubitus"));
    }

    #[test]
    fn test_normalize_manufacturer() {
        assert_eq!(normalize_manufacturer("HOLOGIC, Inc."), "hologic");
        assert_eq!(normalize_manufacturer("LORAD"), "hologic");
        assert_eq!(normalize_manufacturer("GE MEDICAL SYSTEMS"), "ge");
        assert_eq!(normalize_manufacturer("GEMedicalSystems"), "ge");
        assert_eq!(normalize_manufacturer("SIEMENS"), "SIEMENS");
    }

    #[test]
    fn test_allowed_sop_class_set() {
        assert!(ALLOWED_SOP_CLASS_UIDS.contains(&DIGITAL_MAMMOGRAPHY_FOR_PRESENTATION));
        assert!(ALLOWED_SOP_CLASS_UIDS.contains(&BREAST_TOMOSYNTHESIS));
        assert!(!ALLOWED_SOP_CLASS_UIDS.contains(&"1.2.840.10008.5.1.4.1.1.2"));
    }
}
