//! Per-user content cache laid out as `root/{user_id}/{article_id}.{ext}`.
//!
//! Writes go to a dot-prefixed temp file in the user partition and are
//! renamed into place, so readers, cleanup and search only ever see a
//! complete file or no file.

mod cleanup;
mod search;

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;

pub use cleanup::CleanupReport;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct ContentCache {
    root: PathBuf,
    extension: String,
}

impl ContentCache {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            extension: extension.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn user_dir(&self, user_id: i64) -> PathBuf {
        self.root.join(user_id.to_string())
    }

    pub fn entry_path(&self, user_id: i64, article_id: i64) -> PathBuf {
        self.user_dir(user_id)
            .join(format!("{}.{}", article_id, self.extension))
    }

    /// Cached content, or `None` on a miss.
    pub async fn get(&self, user_id: i64, article_id: i64) -> Result<Option<String>> {
        match tokio::fs::read(self.entry_path(user_id, article_id)).await {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Store `content`, creating the user partition if needed and replacing
    /// any previous entry.
    pub async fn set(&self, user_id: i64, article_id: i64, content: &str) -> Result<()> {
        let dir = self.user_dir(user_id);
        tokio::fs::create_dir_all(&dir).await?;

        let temp = dir.join(format!(
            ".{}.{}.{}.tmp",
            article_id,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        if let Err(e) = tokio::fs::write(&temp, content.as_bytes()).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&temp, self.entry_path(user_id, article_id)).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e.into());
        }
        tracing::debug!(user_id, article_id, bytes = content.len(), "Cached article content");
        Ok(())
    }

    pub async fn delete(&self, user_id: i64, article_id: i64) -> Result<()> {
        match tokio::fs::remove_file(self.entry_path(user_id, article_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, user_id: i64, article_id: i64) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.entry_path(user_id, article_id)).await?)
    }

    /// Article id for a cache file name like `42.html`; `None` for temp
    /// files and anything with another extension.
    fn article_id_of(&self, path: &Path) -> Option<i64> {
        if path.extension()?.to_str()? != self.extension {
            return None;
        }
        path.file_stem()?.to_str()?.parse().ok()
    }

    /// Leftover of an interrupted write: `.{article}.{pid}.{n}.tmp`.
    fn is_temp_file(path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with('.') && name.ends_with(".tmp"))
    }
}
