//! Checkpoint naming and model record persistence.

use crate::error::{TrainError, TrainResult};
use burn::module::Module;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::Backend;
use std::fs;
use std::path::{Path, PathBuf};

const ITER_TAG: &str = "_bce_itr_";
const TRAIN_TAG: &str = "_train_";

/// `<model_dir>/<model_name>_bce_itr_<iteration>_train_<loss>_tar_<tar>.pth`
pub fn checkpoint_path(
    model_dir: &Path,
    model_name: &str,
    iteration: usize,
    train_loss: f64,
    tar_loss: f64,
) -> PathBuf {
    model_dir.join(format!(
        "{model_name}{ITER_TAG}{iteration}{TRAIN_TAG}{train_loss:.6}_tar_{tar_loss:.6}.pth"
    ))
}

/// Iteration embedded in a checkpoint file name.
pub fn parse_iteration(path: &Path) -> Option<usize> {
    let name = path.file_name()?.to_str()?;
    let (_, rest) = name.rsplit_once(ITER_TAG)?;
    let (iter, _) = rest.split_once(TRAIN_TAG)?;
    iter.parse().ok()
}

/// Write the full model record (parameters, norm statistics, observer ranges).
pub fn save_checkpoint<B: Backend, M: Module<B>>(model: &M, path: &Path) -> TrainResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| TrainError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let bytes = Recorder::<B>::record(&recorder, model.clone().into_record(), ()).map_err(|e| {
        TrainError::Checkpoint {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
    })?;
    fs::write(path, bytes).map_err(|source| TrainError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::debug!("wrote checkpoint {}", path.display());
    Ok(())
}

/// Restore `model` from a file written by [`save_checkpoint`].
pub fn load_checkpoint<B: Backend, M: Module<B>>(
    model: M,
    path: &Path,
    device: &B::Device,
) -> TrainResult<M> {
    let bytes = fs::read(path).map_err(|source| TrainError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let recorder = BinBytesRecorder::<FullPrecisionSettings>::default();
    let record = Recorder::<B>::load(&recorder, bytes, device).map_err(|e| {
        TrainError::Checkpoint {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
    })?;
    Ok(model.load_record(record))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_follow_the_pattern() {
        let path = checkpoint_path(Path::new("saved_models/u2netp"), "u2netp", 2000, 1.5, 0.25);
        assert_eq!(
            path,
            Path::new("saved_models/u2netp/u2netp_bce_itr_2000_train_1.500000_tar_0.250000.pth")
        );
    }

    #[test]
    fn names_are_injective_in_iteration() {
        let dir = Path::new("out");
        let a = checkpoint_path(dir, "u2net", 4, 0.1, 0.1);
        let b = checkpoint_path(dir, "u2net", 40, 0.1, 0.1);
        let c = checkpoint_path(dir, "u2net", 400, 0.1, 0.1);
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(parse_iteration(&a), Some(4));
        assert_eq!(parse_iteration(&b), Some(40));
        assert_eq!(parse_iteration(&c), Some(400));
    }

    #[test]
    fn foreign_names_do_not_parse() {
        assert_eq!(parse_iteration(Path::new("model.bin")), None);
        assert_eq!(parse_iteration(Path::new("x_bce_itr_abc_train_1_tar_1.pth")), None);
    }
}
