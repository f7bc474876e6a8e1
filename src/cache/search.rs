use std::collections::BTreeSet;

use regex::{Regex, RegexBuilder};

use super::ContentCache;
use crate::error::{AppError, Result};

impl ContentCache {
    /// Ids of the user's cached articles whose content contains `query` as
    /// a literal, case-insensitive substring. Only that user's partition is
    /// read.
    pub async fn search(&self, user_id: i64, query: &str) -> Result<BTreeSet<i64>> {
        let Some(matcher) = literal_matcher(query)? else {
            return Ok(BTreeSet::new());
        };
        let cache = self.clone();
        tokio::task::spawn_blocking(move || cache.search_partition(user_id, &matcher))
            .await
            .map_err(|e| AppError::Internal(format!("cache search task failed: {e}")))?
    }

    fn search_partition(&self, user_id: i64, matcher: &Regex) -> Result<BTreeSet<i64>> {
        let mut hits = BTreeSet::new();
        let entries = match std::fs::read_dir(self.user_dir(user_id)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(hits),
            Err(e) => return Err(e.into()),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(article_id) = self.article_id_of(&path) else {
                continue;
            };
            match std::fs::read(&path) {
                Ok(bytes) => {
                    if matcher.is_match(&String::from_utf8_lossy(&bytes)) {
                        hits.insert(article_id);
                    }
                }
                // evicted or rewritten under us
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("Failed to read cached {:?}: {}", path, e),
            }
        }

        Ok(hits)
    }
}

/// Build a matcher that treats every character of `query` literally.
/// Returns `None` for a blank query.
fn literal_matcher(query: &str) -> Result<Option<Regex>> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(None);
    }
    let matcher = RegexBuilder::new(&regex::escape(query))
        .case_insensitive(true)
        .build()
        .map_err(|e| AppError::Internal(format!("escaped query failed to compile: {e}")))?;
    Ok(Some(matcher))
}
