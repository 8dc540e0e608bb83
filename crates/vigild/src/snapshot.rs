//! Face crop images referenced by visits and unknown sightings.

use chrono::{DateTime, Utc};
use image::{ImageBuffer, ImageFormat, Rgb};
use std::path::{Path, PathBuf};
use thiserror::Error;
use vigil_core::recognizer::{crop_face, RecognizerError};
use vigil_core::BoundingBox;
use vigil_stream::Frame;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("frame buffer does not match {width}x{height} RGB")]
    BadFrame { width: u32, height: u32 },
    #[error("crop failed: {0}")]
    Crop(#[from] RecognizerError),
    #[error("failed to create {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write image: {0}")]
    Write(#[from] image::ImageError),
}

/// File label for a snapshot: the person's name with whitespace replaced by
/// `_`, or `Unknown`.
pub fn snapshot_label(name: Option<&str>) -> String {
    match name {
        Some(name) => name.split_whitespace().collect::<Vec<_>>().join("_"),
        None => "Unknown".to_string(),
    }
}

/// `<dir>/<YYYYmmdd_HHMMSS_ffffff>_<label>.jpg`. A non-zero `ordinal`
/// disambiguates several events emitted from the same frame.
pub fn snapshot_path(dir: &Path, at: DateTime<Utc>, label: &str, ordinal: usize) -> PathBuf {
    let stamp = at.format("%Y%m%d_%H%M%S_%6f");
    let file = if ordinal == 0 {
        format!("{stamp}_{label}.jpg")
    } else {
        format!("{stamp}_{label}_{}.jpg", ordinal + 1)
    };
    dir.join(file)
}

/// Crop the face out of `frame` and write it as JPEG to `path`.
pub fn save_face_crop(frame: &Frame, face: &BoundingBox, path: &Path) -> Result<(), SnapshotError> {
    let (width, height) = (frame.width, frame.height);
    let view = ImageBuffer::<Rgb<u8>, &[u8]>::from_raw(width, height, &frame.data[..])
        .ok_or(SnapshotError::BadFrame { width, height })?;
    let crop = crop_face(&view, face)?;

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|source| SnapshotError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    crop.save_with_format(path, ImageFormat::Jpeg)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_label() {
        assert_eq!(snapshot_label(Some("Mary Ann  Lee")), "Mary_Ann_Lee");
        assert_eq!(snapshot_label(None), "Unknown");
    }

    #[test]
    fn test_path_format() {
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap()
            + chrono::Duration::microseconds(42);
        let dir = Path::new("/data/images");
        assert_eq!(
            snapshot_path(dir, at, "Asha", 0),
            PathBuf::from("/data/images/20260102_030405_000042_Asha.jpg")
        );
        assert_eq!(
            snapshot_path(dir, at, "Unknown", 1),
            PathBuf::from("/data/images/20260102_030405_000042_Unknown_2.jpg")
        );
    }

    #[test]
    fn test_save_face_crop_writes_jpeg() {
        let dir = std::env::temp_dir().join(format!("vigil-snap-{}", uuid::Uuid::new_v4()));
        let path = dir.join("images").join("face.jpg");
        let frame = Frame {
            data: vec![120; 64 * 48 * 3],
            width: 64,
            height: 48,
            captured_at: Utc::now(),
            sequence: 0,
        };
        let face = BoundingBox {
            x: 20.0,
            y: 10.0,
            width: 16.0,
            height: 20.0,
            confidence: 0.9,
        };

        save_face_crop(&frame, &face, &path).unwrap();
        let written = image::open(&path).unwrap();
        assert_eq!(written.width(), written.height());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_save_rejects_malformed_frame() {
        let frame = Frame {
            data: vec![0; 10],
            width: 64,
            height: 48,
            captured_at: Utc::now(),
            sequence: 0,
        };
        let face = BoundingBox {
            x: 0.0,
            y: 0.0,
            width: 8.0,
            height: 8.0,
            confidence: 0.9,
        };
        assert!(matches!(
            save_face_crop(&frame, &face, Path::new("/nonexistent/x.jpg")),
            Err(SnapshotError::BadFrame { .. })
        ));
    }
}
