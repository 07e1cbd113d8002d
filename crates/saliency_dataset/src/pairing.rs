//! Discovering image/mask pairs on disk.

use crate::types::{DatasetError, DatasetResult, SamplePair};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Where images and masks live relative to the data root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    pub root: PathBuf,
    pub image_subdir: PathBuf,
    pub mask_subdir: PathBuf,
    /// Image extension without the leading dot.
    pub image_ext: String,
    /// Mask extension without the leading dot.
    pub mask_ext: String,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            image_subdir: Path::new("DUTS-TR").join("DUTS-TR-Image"),
            mask_subdir: Path::new("DUTS-TR").join("DUTS-TR-Mask"),
            image_ext: "jpg".to_string(),
            mask_ext: "png".to_string(),
        }
    }
}

impl PairingConfig {
    pub fn image_dir(&self) -> PathBuf {
        self.root.join(&self.image_subdir)
    }

    pub fn mask_dir(&self) -> PathBuf {
        self.root.join(&self.mask_subdir)
    }
}

/// Regular files directly under `dir` whose extension is `ext`.
fn files_with_ext(dir: &Path, ext: &str) -> DatasetResult<Vec<PathBuf>> {
    let io_err = |source: std::io::Error| DatasetError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some(ext) {
            files.push(path);
        }
    }
    Ok(files)
}

/// Index every `<stem>.<image_ext>` under the image directory and pair it with
/// `<stem>.<mask_ext>` under the mask directory.
///
/// Fails when either directory is missing, when no image matches, when any
/// image has no mask, or when the mask directory holds masks no image claims.
/// Pairs are sorted by stem so indexing is stable across platforms.
pub fn index_pairs(cfg: &PairingConfig) -> DatasetResult<Vec<SamplePair>> {
    let image_dir = cfg.image_dir();
    let mask_dir = cfg.mask_dir();
    for dir in [&image_dir, &mask_dir] {
        if !dir.is_dir() {
            return Err(DatasetError::MissingDirectory { path: dir.clone() });
        }
    }
    let image_ext = cfg.image_ext.trim_start_matches('.');
    let mask_ext = cfg.mask_ext.trim_start_matches('.');

    let mut pairs = Vec::new();
    for path in files_with_ext(&image_dir, image_ext)? {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let mask = mask_dir.join(format!("{stem}.{mask_ext}"));
        if !mask.is_file() {
            return Err(DatasetError::MissingMask { image: path, mask });
        }
        pairs.push(SamplePair {
            stem: stem.to_string(),
            image: path,
            mask,
        });
    }
    if pairs.is_empty() {
        return Err(DatasetError::NoImages {
            dir: image_dir,
            ext: image_ext.to_string(),
        });
    }
    let masks = files_with_ext(&mask_dir, mask_ext)?.len();
    if masks != pairs.len() {
        return Err(DatasetError::CountMismatch {
            images: pairs.len(),
            masks,
            mask_dir,
        });
    }
    pairs.sort_by(|a, b| a.stem.cmp(&b.stem));
    tracing::info!(
        "indexed {} image/mask pairs under {}",
        pairs.len(),
        cfg.root.display()
    );
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(root: &Path) -> PairingConfig {
        PairingConfig {
            root: root.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn pairs_by_stem_including_dotted_names() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = layout(tmp.path());
        fs::create_dir_all(cfg.image_dir()).unwrap();
        fs::create_dir_all(cfg.mask_dir()).unwrap();
        for stem in ["b", "a.v2"] {
            fs::write(cfg.image_dir().join(format!("{stem}.jpg")), b"x").unwrap();
            fs::write(cfg.mask_dir().join(format!("{stem}.png")), b"x").unwrap();
        }
        fs::write(cfg.image_dir().join("notes.txt"), b"x").unwrap();

        let pairs = index_pairs(&cfg).unwrap();
        let stems: Vec<_> = pairs.iter().map(|p| p.stem.as_str()).collect();
        assert_eq!(stems, vec!["a.v2", "b"]);
        assert_eq!(pairs[0].mask, cfg.mask_dir().join("a.v2.png"));
    }

    #[test]
    fn missing_mask_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = layout(tmp.path());
        fs::create_dir_all(cfg.image_dir()).unwrap();
        fs::create_dir_all(cfg.mask_dir()).unwrap();
        fs::write(cfg.image_dir().join("lonely.jpg"), b"x").unwrap();

        let err = index_pairs(&cfg).unwrap_err();
        assert!(matches!(err, DatasetError::MissingMask { .. }));
    }

    #[test]
    fn orphan_masks_are_a_count_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = layout(tmp.path());
        fs::create_dir_all(cfg.image_dir()).unwrap();
        fs::create_dir_all(cfg.mask_dir()).unwrap();
        fs::write(cfg.image_dir().join("a.jpg"), b"x").unwrap();
        fs::write(cfg.mask_dir().join("a.png"), b"x").unwrap();
        fs::write(cfg.mask_dir().join("orphan.png"), b"x").unwrap();
        // Other extensions in the mask directory are ignored.
        fs::write(cfg.mask_dir().join("readme.md"), b"x").unwrap();

        match index_pairs(&cfg) {
            Err(DatasetError::CountMismatch { images, masks, .. }) => {
                assert_eq!((images, masks), (1, 2));
            }
            other => panic!("expected a count mismatch, got {other:?}"),
        }

        fs::remove_file(cfg.mask_dir().join("orphan.png")).unwrap();
        assert_eq!(index_pairs(&cfg).unwrap().len(), 1);
    }

    #[test]
    fn empty_or_missing_directories_fail_fast() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = layout(tmp.path());
        assert!(matches!(
            index_pairs(&cfg),
            Err(DatasetError::MissingDirectory { .. })
        ));

        fs::create_dir_all(cfg.image_dir()).unwrap();
        fs::create_dir_all(cfg.mask_dir()).unwrap();
        assert!(matches!(index_pairs(&cfg), Err(DatasetError::NoImages { .. })));
    }
}
