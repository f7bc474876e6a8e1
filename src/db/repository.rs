use std::collections::HashMap;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension, Row};
use tokio_rusqlite::Connection;

use crate::error::{AppError, Result};
use crate::models::{
    normalize_tag_names, Article, ArticleFilter, ArticleStatus, ArticleWithTags,
    CompletedExtraction, Rating, ReadingPosition, Tag,
};

use super::schema::SCHEMA;

const ARTICLE_COLUMNS: &str = "id, user_id, url, title, description, site_name, image_url, summary, \
     language, word_count, reading_time_seconds, status, processing_attempts, last_error, \
     archived, archived_at, rating, created_at, updated_at, processed_at, read_at, \
     reading_position_element, reading_position_offset";

pub const MAX_ATTEMPTS_ERROR: &str = "Max retry attempts exceeded";

/// Handle to the article store. Cheap to clone; every clone talks to the
/// same background connection, and every method is one atomic call.
#[derive(Clone)]
pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub async fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.busy_timeout(std::time::Duration::from_secs(5))?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    // Article lifecycle

    pub async fn create_article(&self, user_id: i64, url: &str) -> Result<i64> {
        let url = url.to_string();
        let now = timestamp(Utc::now());
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO articles (user_id, url, status, created_at, updated_at)
                     VALUES (?1, ?2, 'pending', ?3, ?3)",
                    params![user_id, url, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    /// Unscoped lookup for the pipeline. Read paths serving a user go
    /// through [`Repository::get_user_article`].
    pub async fn get_article(&self, id: i64) -> Result<Option<Article>> {
        let article = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = ?1");
                let article = conn
                    .query_row(&sql, params![id], article_from_row)
                    .optional()?;
                Ok(article)
            })
            .await?;
        Ok(article)
    }

    pub async fn get_user_article(&self, user_id: i64, id: i64) -> Result<Option<ArticleWithTags>> {
        let mut found = self.articles_by_ids(user_id, &[id]).await?;
        Ok(found.pop())
    }

    /// `{pending, processing, failed} -> processing`. Returns false when the
    /// article is gone or already terminal.
    pub async fn mark_processing(&self, id: i64) -> Result<bool> {
        let now = timestamp(Utc::now());
        let sql = format!(
            "UPDATE articles SET status = 'processing', updated_at = ?1
             WHERE id = ?2 AND status IN ({})",
            status_list(ArticleStatus::sources_of(ArticleStatus::Processing))
        );
        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(&sql, params![now, id])?;
                Ok(changed)
            })
            .await?;
        Ok(changed > 0)
    }

    /// Write extraction results and replace the tag set in one transaction.
    ///
    /// A completed article may be completed again (last write wins); an
    /// `error` article is left alone. Returns false when nothing was written.
    pub async fn complete_article(&self, id: i64, done: CompletedExtraction) -> Result<bool> {
        let now = timestamp(Utc::now());
        let tags = normalize_tag_names(&done.tags);
        let select_owner = format!(
            "SELECT user_id FROM articles WHERE id = ?1 AND status IN ({})",
            status_list(ArticleStatus::sources_of(ArticleStatus::Completed))
        );
        let written = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let user_id: Option<i64> = tx
                    .query_row(&select_owner, params![id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(user_id) = user_id else {
                    return Ok(false);
                };

                tx.execute(
                    "UPDATE articles SET
                         title = ?1, description = ?2, site_name = ?3, image_url = ?4,
                         summary = ?5, language = ?6, word_count = ?7,
                         reading_time_seconds = ?8, status = 'completed',
                         last_error = NULL, processed_at = ?9, updated_at = ?9
                     WHERE id = ?10",
                    params![
                        done.title,
                        done.description,
                        done.site_name,
                        done.image_url,
                        done.summary,
                        done.language,
                        done.word_count,
                        done.reading_time_seconds,
                        now,
                        id,
                    ],
                )?;

                tx.execute("DELETE FROM article_tags WHERE article_id = ?1", params![id])?;
                for name in &tags {
                    let key = tag_key(name);
                    tx.execute(
                        "INSERT INTO tags (user_id, name, name_key) VALUES (?1, ?2, ?3)
                         ON CONFLICT(user_id, name_key) DO NOTHING",
                        params![user_id, name, key],
                    )?;
                    let tag_id: i64 = tx.query_row(
                        "SELECT id FROM tags WHERE user_id = ?1 AND name_key = ?2",
                        params![user_id, key],
                        |row| row.get(0),
                    )?;
                    tx.execute(
                        "INSERT OR IGNORE INTO article_tags (article_id, tag_id) VALUES (?1, ?2)",
                        params![id, tag_id],
                    )?;
                }

                tx.commit()?;
                Ok(true)
            })
            .await?;
        Ok(written)
    }

    /// Record a failed attempt. Never moves a completed or errored article.
    pub async fn mark_failed(&self, id: i64, error: &str) -> Result<bool> {
        let error = error.to_string();
        let now = timestamp(Utc::now());
        let sql = format!(
            "UPDATE articles SET status = 'failed', last_error = ?1,
                 processing_attempts = processing_attempts + 1, updated_at = ?2
             WHERE id = ?3 AND status IN ({})",
            status_list(ArticleStatus::sources_of(ArticleStatus::Failed))
        );
        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(&sql, params![error, now, id])?;
                Ok(changed)
            })
            .await?;
        Ok(changed > 0)
    }

    /// Force any non-terminal article to `error`.
    pub async fn mark_error(&self, id: i64, error: &str) -> Result<bool> {
        let error = error.to_string();
        let now = timestamp(Utc::now());
        let sql = format!(
            "UPDATE articles SET status = 'error', last_error = ?1, updated_at = ?2
             WHERE id = ?3 AND status IN ({})",
            status_list(ArticleStatus::sources_of(ArticleStatus::Error))
        );
        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(&sql, params![error, now, id])?;
                Ok(changed)
            })
            .await?;
        Ok(changed > 0)
    }

    // Retry sweep queries

    /// Non-terminal articles untouched since `cutoff` that still have attempts left.
    pub async fn find_stuck(
        &self,
        cutoff: DateTime<Utc>,
        max_attempts: i64,
        limit: i64,
    ) -> Result<Vec<Article>> {
        let cutoff = timestamp(cutoff);
        let sql = format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles
             WHERE status IN ({})
               AND updated_at < ?1
               AND processing_attempts < ?2
             ORDER BY updated_at
             LIMIT ?3",
            status_list(ArticleStatus::RETRYABLE)
        );
        let articles = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let articles = stmt
                    .query_map(params![cutoff, max_attempts, limit], article_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(articles)
            })
            .await?;
        Ok(articles)
    }

    /// Non-terminal articles that have used up their attempts, whatever
    /// their current status.
    pub async fn find_exhausted(&self, max_attempts: i64, limit: i64) -> Result<Vec<Article>> {
        let sql = format!(
            "SELECT {ARTICLE_COLUMNS} FROM articles
             WHERE status IN ({})
               AND processing_attempts >= ?1
             ORDER BY updated_at
             LIMIT ?2",
            status_list(ArticleStatus::non_terminal())
        );
        let articles = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let articles = stmt
                    .query_map(params![max_attempts, limit], article_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(articles)
            })
            .await?;
        Ok(articles)
    }

    // User-facing reads

    pub async fn list_articles(&self, filter: ArticleFilter) -> Result<Vec<ArticleWithTags>> {
        let articles = self
            .conn
            .call(move |conn| {
                let mut sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE user_id = ?");
                let mut values: Vec<Value> = vec![Value::Integer(filter.user_id)];

                if !filter.statuses.is_empty() {
                    let placeholders = vec!["?"; filter.statuses.len()].join(", ");
                    sql.push_str(&format!(" AND status IN ({placeholders})"));
                    values.extend(
                        filter
                            .statuses
                            .iter()
                            .map(|s| Value::Text(s.as_str().to_string())),
                    );
                }
                if let Some(archived) = filter.archived {
                    sql.push_str(" AND archived = ?");
                    values.push(Value::Integer(archived as i64));
                }
                if let Some(query) = filter.query.as_deref().filter(|q| !q.trim().is_empty()) {
                    sql.push_str(
                        " AND (title LIKE ? ESCAPE '\\' OR description LIKE ? ESCAPE '\\'
                               OR summary LIKE ? ESCAPE '\\' OR url LIKE ? ESCAPE '\\')",
                    );
                    let pattern = like_pattern(query.trim());
                    values.extend(std::iter::repeat(Value::Text(pattern)).take(4));
                }
                sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?");
                values.push(Value::Integer(filter.limit));
                values.push(Value::Integer(filter.offset));

                let mut stmt = conn.prepare(&sql)?;
                let articles = stmt
                    .query_map(params_from_iter(values), article_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                let tags = load_tags(conn, &articles)?;
                Ok(attach_tags(articles, tags))
            })
            .await?;
        Ok(articles)
    }

    /// Ids of the user's articles whose title, description or summary
    /// contains `query` literally (LIKE wildcards escaped).
    pub async fn search_metadata(&self, user_id: i64, query: &str) -> Result<Vec<i64>> {
        let pattern = like_pattern(query);
        let ids = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id FROM articles
                     WHERE user_id = ?1
                       AND (title LIKE ?2 ESCAPE '\\' OR description LIKE ?2 ESCAPE '\\'
                            OR summary LIKE ?2 ESCAPE '\\')
                     ORDER BY id",
                )?;
                let ids = stmt
                    .query_map(params![user_id, pattern], |row| row.get(0))?
                    .collect::<std::result::Result<Vec<i64>, _>>()?;
                Ok(ids)
            })
            .await?;
        Ok(ids)
    }

    /// Resolve ids to the user's articles; ids owned by other users are dropped.
    pub async fn articles_by_ids(&self, user_id: i64, ids: &[i64]) -> Result<Vec<ArticleWithTags>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = ids.to_vec();
        let articles = self
            .conn
            .call(move |conn| {
                let placeholders = vec!["?"; ids.len()].join(", ");
                let sql = format!(
                    "SELECT {ARTICLE_COLUMNS} FROM articles
                     WHERE user_id = ? AND id IN ({placeholders})
                     ORDER BY created_at DESC, id DESC"
                );
                let values = std::iter::once(user_id).chain(ids);
                let mut stmt = conn.prepare(&sql)?;
                let articles = stmt
                    .query_map(params_from_iter(values), article_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                let tags = load_tags(conn, &articles)?;
                Ok(attach_tags(articles, tags))
            })
            .await?;
        Ok(articles)
    }

    pub async fn list_tags(&self, user_id: i64) -> Result<Vec<Tag>> {
        let tags = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT id, user_id, name FROM tags WHERE user_id = ?1 ORDER BY name")?;
                let tags = stmt
                    .query_map(params![user_id], tag_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(tags)
            })
            .await?;
        Ok(tags)
    }

    // User-facing writes

    pub async fn set_archived(&self, user_id: i64, id: i64, archived: bool) -> Result<()> {
        let archived_at = archived.then(|| timestamp(Utc::now()));
        self.update_owned(user_id, id, move |conn| {
            conn.execute(
                "UPDATE articles SET archived = ?1, archived_at = ?2
                 WHERE id = ?3 AND user_id = ?4",
                params![archived, archived_at, id, user_id],
            )
        })
        .await
    }

    pub async fn set_rating(&self, user_id: i64, id: i64, rating: Rating) -> Result<()> {
        self.update_owned(user_id, id, move |conn| {
            conn.execute(
                "UPDATE articles SET rating = ?1 WHERE id = ?2 AND user_id = ?3",
                params![rating.as_i64(), id, user_id],
            )
        })
        .await
    }

    pub async fn mark_read(&self, user_id: i64, id: i64) -> Result<()> {
        let now = timestamp(Utc::now());
        self.update_owned(user_id, id, move |conn| {
            conn.execute(
                "UPDATE articles SET read_at = ?1 WHERE id = ?2 AND user_id = ?3",
                params![now, id, user_id],
            )
        })
        .await
    }

    pub async fn save_reading_position(
        &self,
        user_id: i64,
        id: i64,
        position: ReadingPosition,
    ) -> Result<()> {
        self.update_owned(user_id, id, move |conn| {
            conn.execute(
                "UPDATE articles SET reading_position_element = ?1, reading_position_offset = ?2
                 WHERE id = ?3 AND user_id = ?4",
                params![position.element, position.offset, id, user_id],
            )
        })
        .await
    }

    pub async fn delete_article(&self, user_id: i64, id: i64) -> Result<()> {
        self.update_owned(user_id, id, move |conn| {
            conn.execute(
                "DELETE FROM article_tags WHERE article_id IN
                     (SELECT id FROM articles WHERE id = ?1 AND user_id = ?2)",
                params![id, user_id],
            )?;
            conn.execute(
                "DELETE FROM articles WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
        })
        .await
    }

    /// Run a single-row write scoped to `user_id`, mapping "no row touched"
    /// to `NotFound`.
    async fn update_owned<F>(&self, user_id: i64, id: i64, write: F) -> Result<()>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<usize> + Send + 'static,
    {
        let changed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let changed = write(&tx)?;
                tx.commit()?;
                Ok(changed)
            })
            .await?;
        if changed == 0 {
            return Err(AppError::NotFound(format!("article {id} for user {user_id}")));
        }
        Ok(())
    }
}

/// Escape LIKE wildcards so `query` only matches itself, then wrap it for a
/// substring match. Pair with `ESCAPE '\'`.
pub fn like_pattern(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len() + 2);
    escaped.push('%');
    for c in query.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// `'pending', 'failed'` style SQL list. Values come from the enum only.
fn status_list(statuses: impl IntoIterator<Item = ArticleStatus>) -> String {
    statuses
        .into_iter()
        .map(|status| format!("'{}'", status.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Uniqueness key for a tag name: Unicode lowercase, so "Über" and "über"
/// share one row.
fn tag_key(name: &str) -> String {
    name.to_lowercase()
}

pub(crate) fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    // Try RFC3339 first (e.g., "2026-01-11T12:34:56.000Z")
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Try SQLite datetime format (e.g., "2026-01-11 12:34:56")
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

fn optional_datetime(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    Ok(row
        .get::<_, Option<String>>(idx)?
        .and_then(|s| parse_datetime(&s)))
}

fn article_from_row(row: &Row) -> rusqlite::Result<Article> {
    let status: String = row.get(11)?;
    let status = status.parse::<ArticleStatus>().map_err(|_| {
        rusqlite::Error::InvalidColumnType(11, "status".into(), rusqlite::types::Type::Text)
    })?;
    let rating = Rating::try_from(row.get::<_, i64>(16)?).map_err(|_| {
        rusqlite::Error::InvalidColumnType(16, "rating".into(), rusqlite::types::Type::Integer)
    })?;
    let position_element: Option<String> = row.get(21)?;
    let position_offset: Option<i64> = row.get(22)?;

    Ok(Article {
        id: row.get(0)?,
        user_id: row.get(1)?,
        url: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        site_name: row.get(5)?,
        image_url: row.get(6)?,
        summary: row.get(7)?,
        language: row.get(8)?,
        word_count: row.get(9)?,
        reading_time_seconds: row.get(10)?,
        status,
        processing_attempts: row.get(12)?,
        last_error: row.get(13)?,
        archived: row.get::<_, i64>(14)? != 0,
        archived_at: optional_datetime(row, 15)?,
        rating,
        created_at: optional_datetime(row, 17)?.unwrap_or_else(Utc::now),
        updated_at: optional_datetime(row, 18)?.unwrap_or_else(Utc::now),
        processed_at: optional_datetime(row, 19)?,
        read_at: optional_datetime(row, 20)?,
        reading_position: position_element.map(|element| ReadingPosition {
            element,
            offset: position_offset.unwrap_or(0),
        }),
    })
}

fn tag_from_row(row: &Row) -> rusqlite::Result<Tag> {
    Ok(Tag {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
    })
}

fn load_tags(
    conn: &rusqlite::Connection,
    articles: &[Article],
) -> rusqlite::Result<HashMap<i64, Vec<Tag>>> {
    let mut by_article: HashMap<i64, Vec<Tag>> = HashMap::new();
    if articles.is_empty() {
        return Ok(by_article);
    }
    let placeholders = vec!["?"; articles.len()].join(", ");
    let sql = format!(
        "SELECT at.article_id, t.id, t.user_id, t.name
         FROM article_tags at
         JOIN tags t ON t.id = at.tag_id
         WHERE at.article_id IN ({placeholders})
         ORDER BY t.name"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(articles.iter().map(|a| a.id)), |row| {
        Ok((
            row.get::<_, i64>(0)?,
            Tag {
                id: row.get(1)?,
                user_id: row.get(2)?,
                name: row.get(3)?,
            },
        ))
    })?;
    for row in rows {
        let (article_id, tag) = row?;
        by_article.entry(article_id).or_default().push(tag);
    }
    Ok(by_article)
}

fn attach_tags(articles: Vec<Article>, mut tags: HashMap<i64, Vec<Tag>>) -> Vec<ArticleWithTags> {
    articles
        .into_iter()
        .map(|article| {
            let tags = tags.remove(&article.id).unwrap_or_default();
            ArticleWithTags { article, tags }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn repo() -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("articles.db");
        let repo = Repository::new(path.to_str().unwrap()).await.unwrap();
        (dir, repo)
    }

    fn extraction(tags: &[&str]) -> CompletedExtraction {
        CompletedExtraction {
            title: Some("Title".into()),
            word_count: 225,
            reading_time_seconds: 60,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    fn tag_names(article: &ArticleWithTags) -> Vec<&str> {
        article.tags.iter().map(|t| t.name.as_str()).collect()
    }

    #[tokio::test]
    async fn new_articles_start_pending() {
        let (_dir, repo) = repo().await;
        let id = repo.create_article(1, "https://example.com/a").await.unwrap();

        let article = repo.get_article(id).await.unwrap().unwrap();
        assert_eq!(article.status, ArticleStatus::Pending);
        assert_eq!(article.processing_attempts, 0);
        assert!(article.processed_at.is_none());
        assert_eq!(article.rating, Rating::Neutral);
    }

    #[tokio::test]
    async fn completion_clears_error_and_sets_processed_at() {
        let (_dir, repo) = repo().await;
        let id = repo.create_article(1, "https://example.com/a").await.unwrap();
        assert!(repo.mark_processing(id).await.unwrap());
        assert!(repo.mark_failed(id, "HTTP 503").await.unwrap());
        assert!(repo.mark_processing(id).await.unwrap());

        assert!(repo.complete_article(id, extraction(&["rust"])).await.unwrap());

        let article = repo.get_article(id).await.unwrap().unwrap();
        assert_eq!(article.status, ArticleStatus::Completed);
        assert!(article.last_error.is_none());
        assert!(article.processed_at.is_some());
        assert_eq!(article.processing_attempts, 1);
    }

    #[tokio::test]
    async fn second_completion_replaces_tags() {
        let (_dir, repo) = repo().await;
        let id = repo.create_article(7, "https://example.com/a").await.unwrap();

        repo.complete_article(id, extraction(&["rust", "async"])).await.unwrap();
        repo.complete_article(id, extraction(&["Databases", "RUST"])).await.unwrap();

        let article = repo.get_user_article(7, id).await.unwrap().unwrap();
        assert_eq!(tag_names(&article), vec!["Databases", "rust"]);
        // the tag row is reused, so no duplicates accumulate per user
        assert_eq!(repo.list_tags(7).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn tag_uniqueness_folds_unicode_case() {
        let (_dir, repo) = repo().await;
        let first = repo.create_article(3, "https://example.com/a").await.unwrap();
        let second = repo.create_article(3, "https://example.com/b").await.unwrap();

        repo.complete_article(first, extraction(&["Über"])).await.unwrap();
        repo.complete_article(second, extraction(&["über", "ÉCOLE"])).await.unwrap();
        repo.complete_article(first, extraction(&["école"])).await.unwrap();

        let tags = repo.list_tags(3).await.unwrap();
        let names: Vec<&str> = tags.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["ÉCOLE", "Über"]);
        let second = repo.get_user_article(3, second).await.unwrap().unwrap();
        assert_eq!(second.tags.len(), 2);
    }

    #[tokio::test]
    async fn user_writes_do_not_delay_retries() {
        let (_dir, repo) = repo().await;
        let id = repo.create_article(1, "https://example.com/a").await.unwrap();
        let before = repo.get_article(id).await.unwrap().unwrap().updated_at;

        repo.set_rating(1, id, Rating::Up).await.unwrap();
        repo.set_archived(1, id, true).await.unwrap();
        repo.mark_read(1, id).await.unwrap();

        let after = repo.get_article(id).await.unwrap().unwrap();
        assert_eq!(after.updated_at, before);
        assert_eq!(after.rating, Rating::Up);
        assert!(after.archived && after.read_at.is_some());
        let stuck = repo
            .find_stuck(before + Duration::milliseconds(1), 3, 100)
            .await
            .unwrap();
        assert_eq!(stuck.len(), 1);
    }

    #[tokio::test]
    async fn failure_never_moves_terminal_articles() {
        let (_dir, repo) = repo().await;
        let id = repo.create_article(1, "https://example.com/a").await.unwrap();
        repo.complete_article(id, extraction(&[])).await.unwrap();

        assert!(!repo.mark_failed(id, "late duplicate").await.unwrap());
        assert!(!repo.mark_error(id, MAX_ATTEMPTS_ERROR).await.unwrap());
        assert!(!repo.mark_processing(id).await.unwrap());

        let article = repo.get_article(id).await.unwrap().unwrap();
        assert_eq!(article.status, ArticleStatus::Completed);
        assert_eq!(article.processing_attempts, 0);
    }

    #[tokio::test]
    async fn error_is_final() {
        let (_dir, repo) = repo().await;
        let id = repo.create_article(1, "https://example.com/a").await.unwrap();
        assert!(repo.mark_error(id, MAX_ATTEMPTS_ERROR).await.unwrap());

        assert!(!repo.complete_article(id, extraction(&["x"])).await.unwrap());
        assert!(!repo.mark_processing(id).await.unwrap());
        let article = repo.get_article(id).await.unwrap().unwrap();
        assert_eq!(article.status, ArticleStatus::Error);
        assert_eq!(article.last_error.as_deref(), Some(MAX_ATTEMPTS_ERROR));
    }

    #[tokio::test]
    async fn completing_a_deleted_article_is_a_no_op() {
        let (_dir, repo) = repo().await;
        let id = repo.create_article(1, "https://example.com/a").await.unwrap();
        repo.delete_article(1, id).await.unwrap();

        assert!(!repo.complete_article(id, extraction(&["x"])).await.unwrap());
        assert!(!repo.mark_failed(id, "gone").await.unwrap());
        assert!(repo.list_tags(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stuck_and_exhausted_are_disjoint() {
        let (_dir, repo) = repo().await;
        let retryable = repo.create_article(1, "https://example.com/a").await.unwrap();
        let exhausted = repo.create_article(1, "https://example.com/b").await.unwrap();
        for _ in 0..2 {
            repo.mark_failed(retryable, "boom").await.unwrap();
        }
        for _ in 0..3 {
            repo.mark_failed(exhausted, "boom").await.unwrap();
        }

        let later = Utc::now() + Duration::minutes(30);
        let stuck: Vec<i64> = repo
            .find_stuck(later, 3, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();
        let done: Vec<i64> = repo
            .find_exhausted(3, 100)
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.id)
            .collect();

        assert_eq!(stuck, vec![retryable]);
        assert_eq!(done, vec![exhausted]);
    }

    #[tokio::test]
    async fn recent_articles_are_not_stuck() {
        let (_dir, repo) = repo().await;
        repo.create_article(1, "https://example.com/a").await.unwrap();

        let cutoff = Utc::now() - Duration::minutes(10);
        assert!(repo.find_stuck(cutoff, 3, 100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn metadata_search_escapes_like_wildcards() {
        let (_dir, repo) = repo().await;
        let done = repo.create_article(1, "https://example.com/a").await.unwrap();
        let other = repo.create_article(1, "https://example.com/b").await.unwrap();
        let foreign = repo.create_article(2, "https://example.com/c").await.unwrap();
        let mut with_percent = extraction(&[]);
        with_percent.title = Some("Migration is 100% done".into());
        repo.complete_article(done, with_percent.clone()).await.unwrap();
        let mut plain = extraction(&[]);
        plain.title = Some("Top 1000 crates".into());
        repo.complete_article(other, plain).await.unwrap();
        repo.complete_article(foreign, with_percent).await.unwrap();

        assert_eq!(repo.search_metadata(1, "100%").await.unwrap(), vec![done]);
        assert_eq!(repo.search_metadata(1, "1_0").await.unwrap(), Vec::<i64>::new());
        assert_eq!(repo.search_metadata(1, "TOP").await.unwrap(), vec![other]);
    }

    #[test]
    fn like_pattern_escapes_specials() {
        assert_eq!(like_pattern("100%"), "%100\\%%");
        assert_eq!(like_pattern("a_b\\c"), "%a\\_b\\\\c%");
    }

    #[tokio::test]
    async fn listing_filters_by_user_status_and_archive() {
        let (_dir, repo) = repo().await;
        let a = repo.create_article(1, "https://example.com/a").await.unwrap();
        let b = repo.create_article(1, "https://example.com/b").await.unwrap();
        repo.create_article(2, "https://example.com/c").await.unwrap();
        repo.complete_article(a, extraction(&["keep"])).await.unwrap();
        repo.set_archived(1, b, true).await.unwrap();

        let all = repo.list_articles(ArticleFilter::for_user(1)).await.unwrap();
        assert_eq!(all.len(), 2);

        let completed = repo
            .list_articles(ArticleFilter::for_user(1).statuses([ArticleStatus::Completed]))
            .await
            .unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(tag_names(&completed[0]), vec!["keep"]);

        let archived = repo
            .list_articles(ArticleFilter::for_user(1).archived(true))
            .await
            .unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].article.id, b);
        assert!(archived[0].article.archived_at.is_some());

        let paged = repo
            .list_articles(ArticleFilter::for_user(1).page(1, 1))
            .await
            .unwrap();
        assert_eq!(paged.len(), 1);
    }

    #[tokio::test]
    async fn writes_are_scoped_to_the_owner() {
        let (_dir, repo) = repo().await;
        let id = repo.create_article(1, "https://example.com/a").await.unwrap();

        assert!(matches!(
            repo.set_rating(2, id, Rating::Up).await,
            Err(AppError::NotFound(_))
        ));
        assert!(repo.get_user_article(2, id).await.unwrap().is_none());

        repo.set_rating(1, id, Rating::Down).await.unwrap();
        repo.mark_read(1, id).await.unwrap();
        repo.save_reading_position(
            1,
            id,
            ReadingPosition {
                element: "p:nth-of-type(4)".into(),
                offset: 120,
            },
        )
        .await
        .unwrap();

        let article = repo.get_user_article(1, id).await.unwrap().unwrap().article;
        assert_eq!(article.rating, Rating::Down);
        assert!(article.read_at.is_some());
        assert_eq!(article.reading_position.unwrap().offset, 120);
    }
}
