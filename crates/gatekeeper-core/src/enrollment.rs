//! Embedding store: identity → reference embeddings, loaded once at startup.
//!
//! The enrollment source is a directory tree with one sub-directory per
//! identity, each holding that person's reference photos:
//!
//! ```text
//! faces/
//!   alice/ front.jpg  glasses.png
//!   bob/   front.jpg
//! ```
//!
//! Identities and photos are visited in lexicographic order, which fixes
//! the enrollment order used by the matcher's tie-break.

use crate::encoder::FaceEncoder;
use crate::types::{Embedding, Identity};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum EnrollmentError {
    #[error("enrollment source unreadable: {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no usable reference faces found under {0}")]
    Empty(String),
    #[error("identity {name} has no reference embeddings")]
    EmptyIdentity { name: String },
    #[error("identity {name}: embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("identity {name}: embedding contains non-finite values")]
    NonFinite { name: String },
    #[error("identity {name} is enrolled more than once")]
    DuplicateIdentity { name: String },
}

/// Read-only snapshot of every enrolled identity.
#[derive(Debug, Clone)]
pub struct EmbeddingStore {
    identities: Vec<Identity>,
    dimension: usize,
}

impl EmbeddingStore {
    /// Build a store from in-memory identities, preserving their order.
    ///
    /// Names must be unique, every identity must own at least one
    /// embedding, and all embeddings must be finite and share one
    /// dimensionality.
    pub fn from_identities(identities: Vec<Identity>) -> Result<Self, EnrollmentError> {
        let mut dimension = None;
        let mut seen = HashSet::new();
        for identity in &identities {
            if !seen.insert(identity.name.as_str()) {
                return Err(EnrollmentError::DuplicateIdentity {
                    name: identity.name.clone(),
                });
            }
            if identity.embeddings.is_empty() {
                return Err(EnrollmentError::EmptyIdentity {
                    name: identity.name.clone(),
                });
            }
            for embedding in &identity.embeddings {
                if !embedding.is_finite() {
                    return Err(EnrollmentError::NonFinite {
                        name: identity.name.clone(),
                    });
                }
                let expected = *dimension.get_or_insert(embedding.dim());
                if embedding.dim() != expected {
                    return Err(EnrollmentError::DimensionMismatch {
                        name: identity.name.clone(),
                        expected,
                        actual: embedding.dim(),
                    });
                }
            }
        }

        let dimension = dimension.ok_or_else(|| EnrollmentError::Empty("<memory>".into()))?;
        Ok(Self {
            identities,
            dimension,
        })
    }

    /// Build a store without validation, for exercising the matcher on
    /// inputs `from_identities` refuses.
    #[cfg(test)]
    pub(crate) fn from_parts_unchecked(identities: Vec<Identity>, dimension: usize) -> Self {
        Self {
            identities,
            dimension,
        }
    }

    /// Load reference photos from `root`, encoding each one with `encoder`.
    ///
    /// Photos that cannot be decoded, contain no face, or yield an embedding
    /// that is empty, non-finite or of a different length than the first
    /// usable photo are skipped with a warning; only an unreadable root or
    /// an empty result is fatal.
    pub fn load<E: FaceEncoder + ?Sized>(
        root: &Path,
        encoder: &mut E,
    ) -> Result<Self, EnrollmentError> {
        tracing::info!(path = %root.display(), "loading enrollment database");

        let mut identities = Vec::new();
        let mut dimension: Option<usize> = None;
        for person_dir in sorted_entries(root)? {
            if !person_dir.is_dir() {
                continue;
            }
            let Some(name) = person_dir.file_name().and_then(|n| n.to_str()) else {
                tracing::warn!(path = %person_dir.display(), "skipping non UTF-8 identity directory");
                continue;
            };

            let photos = match sorted_entries(&person_dir) {
                Ok(p) => p,
                Err(e) => {
                    tracing::warn!(identity = name, error = %e, "skipping unreadable identity directory");
                    continue;
                }
            };

            let mut embeddings = Vec::new();
            for photo in photos.iter().filter(|p| is_image(p)) {
                let Some(embedding) = encode_photo(photo, encoder) else {
                    continue;
                };
                if embedding.dim() == 0 || !embedding.is_finite() {
                    tracing::warn!(path = %photo.display(), "unusable embedding for reference photo");
                    continue;
                }
                let expected = *dimension.get_or_insert(embedding.dim());
                if embedding.dim() != expected {
                    tracing::warn!(
                        path = %photo.display(),
                        expected,
                        actual = embedding.dim(),
                        "reference embedding has the wrong length"
                    );
                    continue;
                }
                embeddings.push(embedding);
            }

            if embeddings.is_empty() {
                tracing::warn!(identity = name, "no usable reference photos; identity not enrolled");
                continue;
            }

            tracing::info!(identity = name, references = embeddings.len(), "identity enrolled");
            identities.push(Identity::new(name, embeddings));
        }

        if identities.is_empty() {
            return Err(EnrollmentError::Empty(root.display().to_string()));
        }

        let store = Self::from_identities(identities)?;
        tracing::info!(
            identities = store.identities.len(),
            embeddings = store.len(),
            dimension = store.dimension,
            "enrollment database loaded"
        );
        Ok(store)
    }

    /// Every (identity, reference embedding) pair in enrollment order.
    pub fn all_embeddings(&self) -> impl Iterator<Item = (&Identity, &Embedding)> + '_ {
        self.identities
            .iter()
            .flat_map(|identity| identity.embeddings.iter().map(move |e| (identity, e)))
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    /// Total number of reference embeddings.
    pub fn len(&self) -> usize {
        self.identities.iter().map(|i| i.embeddings.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Dimensionality shared by every reference embedding.
    pub fn dimension(&self) -> usize {
        self.dimension
    }
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, EnrollmentError> {
    let read = std::fs::read_dir(dir).map_err(|source| EnrollmentError::Unreadable {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut entries: Vec<PathBuf> = read.filter_map(|e| e.ok().map(|e| e.path())).collect();
    entries.sort();
    Ok(entries)
}

fn is_image(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
}

/// Decode one reference photo and return the embedding of its best face.
fn encode_photo<E: FaceEncoder + ?Sized>(path: &Path, encoder: &mut E) -> Option<Embedding> {
    tracing::debug!(path = %path.display(), "loading reference photo");

    let gray = match image::open(path) {
        Ok(img) => img.to_luma8(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to decode reference photo");
            return None;
        }
    };
    let (width, height) = gray.dimensions();

    match encoder.encode(gray.as_raw(), width, height) {
        Ok(probes) => match probes.into_iter().next() {
            Some(probe) => Some(probe.embedding),
            None => {
                tracing::warn!(path = %path.display(), "no faces found in reference photo");
                None
            }
        },
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to encode reference photo");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::EncoderError;
    use crate::types::{BoundingBox, Probe};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Encodes a frame as a 2-d embedding derived from its first pixel;
    /// a black first pixel means "no face".
    struct PixelEncoder;

    impl FaceEncoder for PixelEncoder {
        fn encode(&mut self, frame: &[u8], _w: u32, _h: u32) -> Result<Vec<Probe>, EncoderError> {
            let p = frame.first().copied().unwrap_or(0);
            if p == 0 {
                return Ok(Vec::new());
            }
            Ok(vec![Probe {
                bounding_box: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 1.0,
                    height: 1.0,
                    confidence: 0.9,
                },
                embedding: Embedding::new(vec![p as f32 / 255.0, 0.0]),
            }])
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "gatekeeper-enroll-{tag}-{}-{n}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_photo(dir: &Path, file: &str, value: u8) {
        std::fs::create_dir_all(dir).unwrap();
        image::GrayImage::from_pixel(4, 4, image::Luma([value]))
            .save(dir.join(file))
            .unwrap();
    }

    fn emb(v: &[f32]) -> Embedding {
        Embedding::new(v.to_vec())
    }

    #[test]
    fn test_load_orders_identities_and_photos() {
        let root = temp_dir("order");
        write_photo(&root.join("bob"), "a.png", 200);
        write_photo(&root.join("alice"), "b.png", 100);
        write_photo(&root.join("alice"), "a.png", 50);

        let store = EmbeddingStore::load(&root, &mut PixelEncoder).unwrap();
        let names: Vec<&str> = store.identities().iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
        assert_eq!(store.len(), 3);
        assert_eq!(store.dimension(), 2);

        let alice = &store.identities()[0];
        assert!((alice.embeddings[0].values[0] - 50.0 / 255.0).abs() < 1e-6);
        assert!((alice.embeddings[1].values[0] - 100.0 / 255.0).abs() < 1e-6);

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_load_skips_faceless_and_corrupt_photos() {
        let root = temp_dir("skip");
        write_photo(&root.join("alice"), "face.png", 120);
        write_photo(&root.join("alice"), "empty.png", 0);
        std::fs::write(root.join("alice").join("broken.jpg"), b"not an image").unwrap();
        std::fs::write(root.join("alice").join("notes.txt"), b"ignored").unwrap();
        // Identity with no usable photo is dropped, not fatal.
        write_photo(&root.join("carol"), "empty.png", 0);

        let store = EmbeddingStore::load(&root, &mut PixelEncoder).unwrap();
        assert_eq!(store.identities().len(), 1);
        assert_eq!(store.identities()[0].name, "alice");
        assert_eq!(store.len(), 1);

        std::fs::remove_dir_all(&root).unwrap();
    }

    /// Like `PixelEncoder`, but a few pixel values yield malformed embeddings.
    struct FlakyEncoder;

    impl FaceEncoder for FlakyEncoder {
        fn encode(&mut self, frame: &[u8], w: u32, h: u32) -> Result<Vec<Probe>, EncoderError> {
            let values = match frame.first().copied().unwrap_or(0) {
                10 => vec![0.1, 0.2, 0.3],
                20 => Vec::new(),
                30 => vec![f32::NAN, 0.0],
                _ => return PixelEncoder.encode(frame, w, h),
            };
            Ok(vec![Probe {
                bounding_box: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 1.0,
                    height: 1.0,
                    confidence: 0.9,
                },
                embedding: Embedding::new(values),
            }])
        }
    }

    #[test]
    fn test_load_skips_malformed_embeddings() {
        let root = temp_dir("malformed");
        write_photo(&root.join("alice"), "a.png", 120);
        write_photo(&root.join("alice"), "b.png", 10);
        write_photo(&root.join("alice"), "c.png", 20);
        write_photo(&root.join("bob"), "a.png", 30);
        write_photo(&root.join("bob"), "b.png", 200);
        write_photo(&root.join("carol"), "a.png", 10);

        let store = EmbeddingStore::load(&root, &mut FlakyEncoder).unwrap();
        let names: Vec<&str> = store.identities().iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.dimension(), 2);

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_from_identities_rejects_non_finite() {
        let err = EmbeddingStore::from_identities(vec![
            Identity::new("alice", vec![emb(&[0.0, 0.0])]),
            Identity::new("mallory", vec![emb(&[f32::NAN, 0.0])]),
        ])
        .unwrap_err();
        assert!(matches!(err, EnrollmentError::NonFinite { name } if name == "mallory"));
    }

    #[test]
    fn test_from_identities_rejects_duplicate_names() {
        let err = EmbeddingStore::from_identities(vec![
            Identity::new("bob", vec![emb(&[0.0])]),
            Identity::new("alice", vec![emb(&[0.1])]),
            Identity::new("carol", vec![emb(&[0.2])]),
            Identity::new("alice", vec![emb(&[0.3])]),
        ])
        .unwrap_err();
        assert!(matches!(err, EnrollmentError::DuplicateIdentity { name } if name == "alice"));
    }

    #[test]
    fn test_load_unreadable_root() {
        let root = std::env::temp_dir().join("gatekeeper-enroll-does-not-exist-9f3a");
        let err = EmbeddingStore::load(&root, &mut PixelEncoder).unwrap_err();
        assert!(matches!(err, EnrollmentError::Unreadable { .. }));
    }

    #[test]
    fn test_load_no_faces_is_fatal() {
        let root = temp_dir("empty");
        write_photo(&root.join("alice"), "empty.png", 0);
        let err = EmbeddingStore::load(&root, &mut PixelEncoder).unwrap_err();
        assert!(matches!(err, EnrollmentError::Empty(_)));
        std::fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn test_from_identities_rejects_empty_identity() {
        let err = EmbeddingStore::from_identities(vec![Identity::new("alice", vec![])]).unwrap_err();
        assert!(matches!(err, EnrollmentError::EmptyIdentity { .. }));
    }

    #[test]
    fn test_from_identities_rejects_mixed_dimensions() {
        let err = EmbeddingStore::from_identities(vec![
            Identity::new("alice", vec![emb(&[0.0, 1.0])]),
            Identity::new("bob", vec![emb(&[0.0, 1.0, 2.0])]),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            EnrollmentError::DimensionMismatch { expected: 2, actual: 3, .. }
        ));
    }

    #[test]
    fn test_all_embeddings_in_enrollment_order() {
        let store = EmbeddingStore::from_identities(vec![
            Identity::new("bob", vec![emb(&[1.0]), emb(&[2.0])]),
            Identity::new("alice", vec![emb(&[3.0])]),
        ])
        .unwrap();
        let flat: Vec<(&str, f32)> = store
            .all_embeddings()
            .map(|(i, e)| (i.name.as_str(), e.values[0]))
            .collect();
        assert_eq!(flat, vec![("bob", 1.0), ("bob", 2.0), ("alice", 3.0)]);
    }
}
