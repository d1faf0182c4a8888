use std::collections::HashMap;
use std::path::{Path, PathBuf};

use dicom_pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption};
use image::{Rgb, RgbImage};
use snafu::prelude::*;
use tracing::{info, warn};

use crate::extract::metadata::BREAST_TOMOSYNTHESIS;
use crate::results::FileResult;

const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_THICKNESS: u32 = 3;

#[derive(Debug, Snafu)]
pub enum Error {
    /// Could not read {path} as a DICOM file
    ReadFile {
        path: String,
        source: Box<dicom_object::ReadError>,
    },

    /// Could not decode pixel data from {path}
    DecodePixels {
        path: String,
        source: Box<dicom_pixeldata::Error>,
    },

    /// Slice {slice} is out of range for {path} ({frames} frame(s))
    SliceOutOfRange {
        path: String,
        slice: i64,
        frames: u32,
    },

    /// Bounding box ({x1}, {y1})-({x2}, {y2}) is degenerate
    DegenerateBox { x1: u32, y1: u32, x2: u32, y2: u32 },

    /// Could not write annotated image {path}
    WriteImage {
        path: String,
        source: image::ImageError,
    },

    /// Could not create output directory {path}
    CreateOutputDir {
        path: String,
        source: std::io::Error,
    },
}

/// Render the best box of every file onto its image.
///
/// Per-file failures are reported and skipped so one unreadable image
/// never aborts the batch. Returns the number of images written.
pub fn plot_results(rows: &[FileResult], output_dir: &Path) -> usize {
    let mut written = 0usize;
    for row in best_rows(rows) {
        match render_annotated(row, output_dir) {
            Ok(path) => {
                info!("Annotated image written to {}", path.display());
                written += 1;
            }
            Err(e) => {
                warn!("Could not render a result for {} ({})", row.file_path, e);
            }
        }
    }
    written
}

/// For every file keep the highest-scoring row, then drop rows without
/// a complete box (no prediction above the server threshold).
fn best_rows(rows: &[FileResult]) -> Vec<&FileResult> {
    let mut best: HashMap<&str, &FileResult> = HashMap::new();
    for row in rows.iter().filter(|r| r.score.is_some()) {
        best.entry(row.file_path.as_str())
            .and_modify(|current| {
                if row.score > current.score {
                    *current = row;
                }
            })
            .or_insert(row);
    }
    let mut selected: Vec<&FileResult> = best.into_values().filter(|r| r.has_box()).collect();
    selected.sort_by(|a, b| a.file_path.cmp(&b.file_path));
    selected
}

/// Decode the referenced frame, draw the box, and save the annotated
/// image under `<output_dir>/<study_dirname>/`.
fn render_annotated(row: &FileResult, output_dir: &Path) -> Result<PathBuf, Error> {
    let file_path = Path::new(&row.file_path);
    let mut image = load_frame(file_path, row.slice.map(|s| s as i64).unwrap_or(-1))?;

    // rows reaching here passed has_box()
    let score = row.score.unwrap_or_default();
    let (x1, y1) = clamp_point(row.x1.unwrap_or_default(), row.y1.unwrap_or_default(), &image);
    let (x2, y2) = clamp_point(row.x2.unwrap_or_default(), row.y2.unwrap_or_default(), &image);
    ensure!(x1 < x2 && y1 < y2, DegenerateBoxSnafu { x1, y1, x2, y2 });
    draw_box(&mut image, x1, y1, x2, y2, BOX_THICKNESS);

    let study_dirname = file_path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_name = file_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let dest_dir = output_dir.join(study_dirname);
    std::fs::create_dir_all(&dest_dir).context(CreateOutputDirSnafu {
        path: dest_dir.display().to_string(),
    })?;
    let dest = dest_dir.join(format!("{}_score_{:.4}.png", file_name, score));
    image.save(&dest).context(WriteImageSnafu {
        path: dest.display().to_string(),
    })?;
    Ok(dest)
}

/// Load one frame of a DICOM file as an 8-bit RGB image, VOI LUT
/// applied. For tomosynthesis a negative slice selects the middle
/// frame; 2D mammography always renders frame 0.
fn load_frame(path: &Path, slice: i64) -> Result<RgbImage, Error> {
    let obj = dicom_object::open_file(path)
        .map_err(Box::from)
        .context(ReadFileSnafu {
            path: path.display().to_string(),
        })?;
    let is_dbt = obj.meta().media_storage_sop_class_uid.trim_end_matches('\0')
        == BREAST_TOMOSYNTHESIS;

    let decoded = obj
        .decode_pixel_data()
        .map_err(Box::from)
        .context(DecodePixelsSnafu {
            path: path.display().to_string(),
        })?;
    let frames = decoded.number_of_frames();

    let frame = if is_dbt {
        let frame = if slice < 0 { i64::from(frames / 2) } else { slice };
        ensure!(
            frame >= 0 && (frame as u32) < frames,
            SliceOutOfRangeSnafu {
                path: path.display().to_string(),
                slice,
                frames,
            }
        );
        frame as u32
    } else {
        0
    };

    let options = ConvertOptions::new().with_voi_lut(VoiLutOption::First);
    let rendered = decoded
        .to_dynamic_image_with_options(frame, &options)
        .map_err(Box::from)
        .context(DecodePixelsSnafu {
            path: path.display().to_string(),
        })?;

    // 8-bit grayscale, expanded to RGB so the box stands out
    let gray = rendered.to_luma8();
    let rgb = RgbImage::from_fn(gray.width(), gray.height(), |x, y| {
        let v = gray.get_pixel(x, y).0[0];
        Rgb([v, v, v])
    });
    Ok(rgb)
}

fn clamp_point(x: f64, y: f64, image: &RgbImage) -> (u32, u32) {
    let clamp = |v: f64, max: u32| -> u32 {
        if v.is_finite() && v > 0.0 {
            (v as u32).min(max.saturating_sub(1))
        } else {
            0
        }
    };
    (clamp(x, image.width()), clamp(y, image.height()))
}

/// Draw a hollow rectangle of the given edge thickness.
pub fn draw_box(image: &mut RgbImage, x1: u32, y1: u32, x2: u32, y2: u32, thickness: u32) {
    let (width, height) = image.dimensions();
    let mut put = |x: u32, y: u32| {
        if x < width && y < height {
            image.put_pixel(x, y, BOX_COLOR);
        }
    };
    for t in 0..thickness {
        for x in x1..=x2 {
            put(x, y1.saturating_add(t));
            put(x, y2.saturating_sub(t));
        }
        for y in y1..=y2 {
            put(x1.saturating_add(t), y);
            put(x2.saturating_sub(t), y);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(file: &str, score: Option<f64>, with_box: bool) -> FileResult {
        FileResult {
            file_path: file.to_string(),
            x1: with_box.then_some(10.0),
            y1: with_box.then_some(20.0),
            x2: with_box.then_some(40.0),
            y2: with_box.then_some(60.0),
            slice: Some(-1.0),
            score,
        }
    }

    #[test]
    fn test_best_rows_keeps_highest_score_per_file() {
        let rows = vec![
            row("/a/im1", Some(0.2), true),
            row("/a/im1", Some(0.9), true),
            row("/a/im2", Some(0.5), true),
        ];
        let best = best_rows(&rows);
        assert_eq!(best.len(), 2);
        assert_eq!(best[0].file_path, "/a/im1");
        assert_eq!(best[0].score, Some(0.9));
        assert_eq!(best[1].file_path, "/a/im2");
    }

    #[test]
    fn test_best_rows_drops_rows_without_boxes() {
        let rows = vec![
            row("/a/im1", Some(0.9), false),
            row("/a/im2", None, true),
            row("/a/im3", Some(0.4), true),
        ];
        let best = best_rows(&rows);
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].file_path, "/a/im3");
    }

    #[test]
    fn test_draw_box_paints_border_only() {
        let mut image = RgbImage::from_pixel(100, 100, Rgb([7, 7, 7]));
        draw_box(&mut image, 10, 20, 50, 70, 3);

        // Border pixels are red
        assert_eq!(*image.get_pixel(10, 20), BOX_COLOR);
        assert_eq!(*image.get_pixel(30, 20), BOX_COLOR);
        assert_eq!(*image.get_pixel(30, 22), BOX_COLOR);
        assert_eq!(*image.get_pixel(50, 70), BOX_COLOR);
        assert_eq!(*image.get_pixel(10, 45), BOX_COLOR);
        // Interior and exterior are untouched
        assert_eq!(*image.get_pixel(30, 45), Rgb([7, 7, 7]));
        assert_eq!(*image.get_pixel(5, 5), Rgb([7, 7, 7]));
        assert_eq!(*image.get_pixel(90, 90), Rgb([7, 7, 7]));
    }

    #[test]
    fn test_draw_box_is_clipped_to_image_bounds() {
        let mut image = RgbImage::from_pixel(32, 32, Rgb([0, 0, 0]));
        // Would touch the last row/column; must not panic
        draw_box(&mut image, 0, 0, 31, 31, 3);
        assert_eq!(*image.get_pixel(31, 31), BOX_COLOR);
    }

    #[test]
    fn test_clamp_point() {
        let image = RgbImage::new(100, 50);
        assert_eq!(clamp_point(-5.0, 10.0, &image), (0, 10));
        assert_eq!(clamp_point(500.0, 500.0, &image), (99, 49));
        assert_eq!(clamp_point(10.4, 20.9, &image), (10, 20));
    }
}
