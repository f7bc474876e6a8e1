use std::collections::BTreeSet;

use tracing::debug;

use crate::cache::ContentCache;
use crate::db::Repository;
use crate::error::Result;
use crate::models::ArticleWithTags;

/// Articles of `user_id` whose cached content or metadata contains `query`
/// literally, ignoring surrounding whitespace. Both sides run concurrently
/// and their hits are merged.
pub async fn search_articles(
    repo: &Repository,
    cache: &ContentCache,
    user_id: i64,
    query: &str,
) -> Result<Vec<ArticleWithTags>> {
    let query = query.trim();
    if query.is_empty() {
        return Ok(Vec::new());
    }

    let (content_hits, metadata_hits) = futures::try_join!(
        cache.search(user_id, query),
        repo.search_metadata(user_id, query)
    )?;
    debug!(
        user_id,
        content = content_hits.len(),
        metadata = metadata_hits.len(),
        "Search hits"
    );

    let ids: BTreeSet<i64> = content_hits.into_iter().chain(metadata_hits).collect();
    let ids: Vec<i64> = ids.into_iter().collect();
    repo.articles_by_ids(user_id, &ids).await
}
