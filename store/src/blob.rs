use std::path::{Path, PathBuf};

use tokio::fs;

use crate::{PersistErr, Result};

/// Flat `f32` blob storage for merged checkpoints.
///
/// Blobs are written to a temp sibling and renamed into place, so readers
/// never observe a half-written checkpoint.
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    /// Creates the blob store rooted at `dir`, creating it if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();

        fs::create_dir_all(&dir)
            .await
            .map_err(|e| PersistErr::new(&dir, "create_dir", e))?;

        Ok(Self { dir })
    }

    /// Writes a named `f32` blob and returns its path.
    ///
    /// # Arguments
    /// * `name` - The blob file name, unique per checkpoint.
    /// * `data` - The flat parameter vector.
    pub async fn write_f32(&self, name: &str, data: &[f32]) -> Result<PathBuf> {
        let path = self.dir.join(name);
        let tmp_path = path.with_extension("tmp");
        let bytes: &[u8] = bytemuck::cast_slice(data);

        fs::write(&tmp_path, bytes)
            .await
            .map_err(|e| PersistErr::new(&tmp_path, "write", e))?;
        fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| PersistErr::new(&path, "rename", e))?;

        Ok(path)
    }

    /// Reads a named `f32` blob back into an owned vector.
    pub async fn read_f32(&self, name: &str) -> Result<Vec<f32>> {
        let path = self.dir.join(name);
        let bytes = fs::read(&path)
            .await
            .map_err(|e| PersistErr::new(&path, "read", e))?;

        if bytes.len() % size_of::<f32>() != 0 {
            return Err(PersistErr::new(
                &path,
                "read",
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("blob of {} bytes is not a whole number of f32 values", bytes.len()),
                ),
            ));
        }

        let mut out = vec![0.0f32; bytes.len() / size_of::<f32>()];
        bytemuck::cast_slice_mut::<f32, u8>(&mut out).copy_from_slice(&bytes);
        Ok(out)
    }

    /// The directory blobs live under.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();

        let data = [1.0f32, -2.5, 0.0, 1e-6];
        let path = store.write_f32("ckpt-1.bin", &data).await.unwrap();
        assert!(path.ends_with("ckpt-1.bin"));

        let read = store.read_f32("ckpt-1.bin").await.unwrap();
        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn truncated_blob_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::open(dir.path()).await.unwrap();

        store.write_f32("ckpt-2.bin", &[1.0, 2.0]).await.unwrap();

        let path = dir.path().join("ckpt-2.bin");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.pop();
        std::fs::write(&path, bytes).unwrap();

        assert!(store.read_f32("ckpt-2.bin").await.is_err());
    }
}
