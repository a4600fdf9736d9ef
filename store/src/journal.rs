use std::{collections::HashMap, marker::PhantomData, path::PathBuf};

use log::warn;
use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    fs::{self, File, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};

use crate::{PersistErr, Result};

/// A journaled record. Later entries with the same key supersede earlier ones
/// during replay.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn key(&self) -> String;
}

/// An append-only JSON-lines journal for one record family.
///
/// `append` does not return until the line is flushed to the OS and synced,
/// which is what lets callers treat the journal as a write-ahead log.
pub struct Journal<T> {
    path: PathBuf,
    file: Mutex<File>,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record> Journal<T> {
    /// Opens (creating if needed) the journal at `path`.
    ///
    /// # Arguments
    /// * `path` - The journal file location; parent directories are created.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| PersistErr::new(parent, "create_dir", e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| PersistErr::new(&path, "open", e))?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            _record: PhantomData,
        })
    }

    /// Appends one record and syncs it to disk.
    ///
    /// # Arguments
    /// * `record` - The record to persist.
    ///
    /// # Returns
    /// A `PersistErr` if the line could not be written durably.
    pub async fn append(&self, record: &T) -> Result<()> {
        let mut line = serde_json::to_vec(record).map_err(|e| {
            PersistErr::new(&self.path, "serialize", std::io::Error::other(e))
        })?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line)
            .await
            .map_err(|e| PersistErr::new(&self.path, "append", e))?;
        file.sync_data()
            .await
            .map_err(|e| PersistErr::new(&self.path, "sync", e))?;

        Ok(())
    }

    /// Replays the journal into the latest record per key.
    ///
    /// A torn or malformed line (e.g. a crash mid-append) is skipped with a
    /// warning; everything before it still counts.
    ///
    /// # Returns
    /// The surviving records keyed by `Record::key`.
    pub async fn replay(&self) -> Result<HashMap<String, T>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(PersistErr::new(&self.path, "read", e)),
        };

        let mut latest = HashMap::new();

        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<T>(line) {
                Ok(record) => {
                    latest.insert(record.key(), record);
                }
                Err(e) => {
                    warn!(
                        path = self.path.display().to_string(), line_no;
                        "skipping unreadable journal line: {e}"
                    );
                }
            }
        }

        Ok(latest)
    }

    /// Rewrites the journal to contain exactly the given live records.
    ///
    /// Writes a sibling temp file first and renames it over the journal, then
    /// reopens the append handle.
    pub async fn compact<'a, I>(&self, live: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a T>,
        T: 'a,
    {
        let tmp_path = self.path.with_extension("tmp");
        let mut out = Vec::new();

        for record in live {
            let line = serde_json::to_vec(record).map_err(|e| {
                PersistErr::new(&self.path, "serialize", std::io::Error::other(e))
            })?;
            out.extend_from_slice(&line);
            out.push(b'\n');
        }

        let mut file = self.file.lock().await;

        fs::write(&tmp_path, &out)
            .await
            .map_err(|e| PersistErr::new(&tmp_path, "write", e))?;
        fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| PersistErr::new(&self.path, "rename", e))?;

        *file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| PersistErr::new(&self.path, "reopen", e))?;

        Ok(())
    }
}
