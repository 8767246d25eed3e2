//! A document store persisted as a single JSON file.
//!
//! Every commit loads the file, applies the write batch to the loaded
//! documents, writes the result to `documents.json.tmp` and renames it over
//! `documents.json`. The rename is atomic, so after a crash the file holds
//! either the previous or the new state, never a mix.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;
use crate::store::{DocumentKey, DocumentStore, Documents, WriteBatch};

const FILE_NAME: &str = "documents.json";
const TMP_FILE_NAME: &str = "documents.json.tmp";

/// File-backed [`DocumentStore`].
///
/// Intended for demos, local development and small read models. Commits are
/// serialized through an async mutex; concurrent readers see the last
/// completed commit.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    /// Open (or create) a store in `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Path of the JSON file holding all documents.
    pub fn path(&self) -> PathBuf {
        self.dir.join(FILE_NAME)
    }

    /// Every document in `collection`, keyed by document ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file cannot be read or parsed.
    pub fn collection(&self, collection: &str) -> Result<BTreeMap<String, Value>, StoreError> {
        let mut documents = load_documents(&self.path())?;
        Ok(documents.remove(collection).unwrap_or_default())
    }
}

/// Load all documents. A missing file is an empty store; a corrupt file is
/// an error, since it also holds checkpoints.
fn load_documents(path: &Path) -> Result<Documents, StoreError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Documents::new()),
        Err(e) => Err(e.into()),
    }
}

fn save_documents(dir: &Path, documents: &Documents) -> Result<(), StoreError> {
    let path = dir.join(FILE_NAME);
    let tmp_path = dir.join(TMP_FILE_NAME);
    let json = serde_json::to_string_pretty(documents)?;
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn get(&self, key: &DocumentKey) -> Result<Option<Value>, StoreError> {
        let mut documents = load_documents(&self.path())?;
        Ok(documents
            .get_mut(&key.collection)
            .and_then(|c| c.remove(&key.id)))
    }

    async fn commit(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut documents = load_documents(&self.path())?;
        let mutations = batch.len();
        batch.apply_to(&mut documents);
        save_documents(&self.dir, &documents)?;
        tracing::debug!(path = %self.path().display(), mutations, "documents saved");
        Ok(())
    }
}
