//! Where raw dictionary bytes come from.

use std::{io, path::PathBuf};

use anyhow::{format_err, Context};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::instrument;

use crate::Result;

/// A source of raw dictionary blobs, keyed by dictionary id.
#[async_trait]
pub trait DictionaryAssets: Send + Sync + 'static {
    /// Fetch the raw bytes for `id`. Returns `None` if there is no such
    /// dictionary.
    async fn fetch(&self, id: &str) -> Result<Option<Bytes>>;
}

/// Dictionaries stored as files in a local directory, one file per id.
pub struct DirectoryAssets {
    root: PathBuf,
}

impl DirectoryAssets {
    /// Serve dictionaries from `root`.
    pub fn new(root: impl Into<PathBuf>) -> DirectoryAssets {
        DirectoryAssets { root: root.into() }
    }
}

#[async_trait]
impl DictionaryAssets for DirectoryAssets {
    #[instrument(name = "DirectoryAssets::fetch", level = "trace", skip(self))]
    async fn fetch(&self, id: &str) -> Result<Option<Bytes>> {
        // Ids come from request paths, so never let them walk out of `root`.
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return Err(format_err!("invalid dictionary id {:?}", id));
        }
        let path = self.root.join(id);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err)
                .with_context(|| format!("could not read {}", path.display())),
        }
    }
}
