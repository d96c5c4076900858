//! Raw parameter snapshots.
//!
//! Each parameter is stored in its own file as the little-endian `f32`
//! contents of its tensor, with no header. A snapshot of a model is the set
//! of files `<prefix><name>.bin` in one directory, so `model-3-fc1_weights.bin`
//! holds the weights of layer `fc1` after epoch 3.

use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::tensor::TensorId;
use briny::prelude::*;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Bytes read from disk for a tensor of known size.
struct RawParameter<'a> {
    bytes: &'a [u8],
    expected: usize,
}

impl Validate for RawParameter<'_> {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.bytes.len() != self.expected {
            return Err(ValidationError);
        }
        Ok(())
    }
}

/// Writes the contents of `id` to `path`.
pub fn save_parameter(rt: &mut Runtime, id: TensorId, path: impl AsRef<Path>) -> Result<()> {
    let values = rt.read_tensor(id)?;
    let mut file = BufWriter::new(File::create(path.as_ref())?);
    for value in values {
        file.write_all(&value.to_le_bytes())?;
    }
    file.flush()?;
    Ok(())
}

/// Overwrites `id` with the contents of `path`.
///
/// # Errors
/// [`Error::Snapshot`] if the file size does not match the tensor.
pub fn load_parameter(rt: &mut Runtime, id: TensorId, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    let expected = rt.shape(id)?.byte_len();

    let raw = RawParameter {
        bytes: &bytes,
        expected: expected as usize,
    };
    raw.validate().map_err(|_| Error::Snapshot {
        path: path.to_path_buf(),
        found: bytes.len() as u64,
        expected,
    })?;

    let values: Vec<f32> = raw
        .bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    rt.write_tensor(id, &values)
}

fn snapshot_path(rt: &Runtime, id: TensorId, dir: &Path, prefix: &str) -> Result<PathBuf> {
    Ok(dir.join(format!("{prefix}{}.bin", rt.name(id)?)))
}

/// Saves every tensor in `params` under `dir`, returning the written paths.
pub fn save_snapshot(
    rt: &mut Runtime,
    params: &[TensorId],
    dir: impl AsRef<Path>,
    prefix: &str,
) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    let mut written = Vec::with_capacity(params.len());
    for &id in params {
        let path = snapshot_path(rt, id, dir, prefix)?;
        save_parameter(rt, id, &path)?;
        written.push(path);
    }
    log::info!("saved {} parameters to {}", written.len(), dir.display());
    Ok(written)
}

/// Restores every tensor in `params` from a snapshot written by [`save_snapshot`].
pub fn load_snapshot(
    rt: &mut Runtime,
    params: &[TensorId],
    dir: impl AsRef<Path>,
    prefix: &str,
) -> Result<()> {
    let dir = dir.as_ref();
    for &id in params {
        let path = snapshot_path(rt, id, dir, prefix)?;
        load_parameter(rt, id, path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Shape;

    fn scratch_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("gpugrad-{label}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn raw_file_is_little_endian_f32() {
        let dir = scratch_dir("raw");
        let mut rt = Runtime::cpu();
        let w = rt.tensor("w", Shape::row(2), &[1.0, -2.5]).unwrap();
        let paths = save_snapshot(&mut rt, &[w], &dir, "model-0-").unwrap();

        assert_eq!(paths, vec![dir.join("model-0-w.bin")]);
        let bytes = fs::read(&paths[0]).unwrap();
        let mut expected = 1.0f32.to_le_bytes().to_vec();
        expected.extend_from_slice(&(-2.5f32).to_le_bytes());
        assert_eq!(bytes, expected);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn rejects_truncated_files() {
        let dir = scratch_dir("short");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("w.bin");
        fs::write(&path, [0u8; 6]).unwrap();

        let mut rt = Runtime::cpu();
        let w = rt.tensor("w", Shape::row(2), &[0.0, 0.0]).unwrap();
        let err = load_parameter(&mut rt, w, &path).unwrap_err();
        assert!(matches!(err, Error::Snapshot { found: 6, expected: 8, .. }));
        fs::remove_dir_all(dir).unwrap();
    }
}
