//! Reference embeddings from still photos.

use anyhow::{bail, Context, Result};
use std::path::Path;
use vigil_core::{DetectedFace, Embedding, FaceEmbedder};

/// Embed the face in each image.
///
/// Every image must contain at least one face; when it holds several, the
/// largest one is taken.
pub fn embed_images(
    embedder: &mut dyn FaceEmbedder,
    images: &[impl AsRef<Path>],
) -> Result<Vec<Embedding>> {
    let mut embeddings = Vec::with_capacity(images.len());
    for path in images {
        let path = path.as_ref();
        let rgb = image::open(path)
            .with_context(|| format!("failed to read image {}", path.display()))?
            .to_rgb8();
        let (width, height) = rgb.dimensions();
        let faces = embedder
            .detect_and_embed(rgb.as_raw(), width, height)
            .with_context(|| format!("face detection failed on {}", path.display()))?;

        let count = faces.len();
        let Some(face) = largest_face(faces) else {
            bail!("no face found in {}", path.display());
        };
        if count > 1 {
            tracing::warn!(
                image = %path.display(),
                faces = count,
                "several faces found, using the largest"
            );
        }
        embeddings.push(face.embedding);
    }
    Ok(embeddings)
}

fn largest_face(faces: Vec<DetectedFace>) -> Option<DetectedFace> {
    faces
        .into_iter()
        .max_by(|a, b| a.bbox.area().total_cmp(&b.bbox.area()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{BoundingBox, EmbedError};

    fn face(size: f32, tag: f32) -> DetectedFace {
        DetectedFace {
            embedding: Embedding::new(vec![tag]),
            bbox: BoundingBox {
                x: 0.0,
                y: 0.0,
                width: size,
                height: size,
                confidence: 0.9,
            },
        }
    }

    /// Reports a fixed set of faces for every image.
    struct Fixed(Vec<DetectedFace>);

    impl FaceEmbedder for Fixed {
        fn detect_and_embed(
            &mut self,
            _rgb: &[u8],
            _width: u32,
            _height: u32,
        ) -> Result<Vec<DetectedFace>, EmbedError> {
            Ok(self.0.clone())
        }
    }

    fn temp_image() -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("vigil-enroll-{}.png", uuid::Uuid::new_v4()));
        image::RgbImage::new(8, 8).save(&path).unwrap();
        path
    }

    #[test]
    fn test_largest_face_wins() {
        let picked = largest_face(vec![face(10.0, 1.0), face(40.0, 2.0), face(20.0, 3.0)]).unwrap();
        assert_eq!(picked.embedding, Embedding::new(vec![2.0]));
        assert!(largest_face(Vec::new()).is_none());
    }

    #[test]
    fn test_embed_images() {
        let path = temp_image();
        let mut embedder = Fixed(vec![face(30.0, 7.0)]);
        let embeddings = embed_images(&mut embedder, &[&path]).unwrap();
        assert_eq!(embeddings, vec![Embedding::new(vec![7.0])]);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_image_without_face_rejected() {
        let path = temp_image();
        let err = embed_images(&mut Fixed(Vec::new()), &[&path]).unwrap_err();
        assert!(err.to_string().contains("no face found"));
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_missing_image_rejected() {
        let err = embed_images(&mut Fixed(Vec::new()), &["/nonexistent/face.jpg"]).unwrap_err();
        assert!(err.to_string().contains("failed to read image"));
    }
}
