use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::ai::ArticleTagger;
use crate::cache::ContentCache;
use crate::db::Repository;
use crate::error::{AppError, Result};
use crate::models::{Article, CompletedExtraction};
use crate::services::{
    reading_time_seconds, word_count, ContentExtractor, Extracted, PageFetcher, Readability,
};

/// Width html2text wraps at when flattening content for the tagger.
const TAGGER_TEXT_WIDTH: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed,
    /// The article was gone or already terminal; nothing was written.
    Skipped,
}

/// One-shot extraction of a single article.
///
/// Every invocation that gets past `mark_processing` leaves the article
/// `completed` or `failed`. The worker never retries on its own.
#[derive(Clone)]
pub struct ExtractionWorker {
    repo: Repository,
    cache: ContentCache,
    fetcher: Arc<dyn PageFetcher>,
    extractor: Arc<dyn ContentExtractor>,
    tagger: Option<Arc<dyn ArticleTagger>>,
}

impl ExtractionWorker {
    pub fn new(repo: Repository, cache: ContentCache, fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            repo,
            cache,
            fetcher,
            extractor: Arc::new(Readability),
            tagger: None,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn ContentExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_tagger(mut self, tagger: Option<Arc<dyn ArticleTagger>>) -> Self {
        self.tagger = tagger;
        self
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub async fn process(&self, article_id: i64) -> Result<WorkerOutcome> {
        let Some(article) = self.repo.get_article(article_id).await? else {
            return Err(AppError::NotFound(format!("article {article_id}")));
        };
        if !self.repo.mark_processing(article_id).await? {
            debug!(article_id, status = %article.status, "Article not processable, skipping");
            return Ok(WorkerOutcome::Skipped);
        }
        debug!(article_id, url = %article.url, attempt = article.processing_attempts + 1, "Extracting article");

        match self.complete(&article).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(article_id, error = %e, retryable = e.is_retryable(), "Extraction failed");
                if let Err(record) = self.repo.mark_failed(article_id, &e.to_string()).await {
                    error!(article_id, error = %record, "Failed to record extraction failure");
                }
                Err(e)
            }
        }
    }

    /// Fetch and extract an already-completed article again to refill a
    /// cache miss. Status and attempts are left untouched.
    pub async fn refetch_content(&self, article: &Article) -> Result<String> {
        let (extracted, _) = self.fetch_and_extract(&article.url).await?;
        self.cache
            .set(article.user_id, article.id, &extracted.content)
            .await?;
        debug!(article_id = article.id, "Refilled content cache");
        Ok(extracted.content)
    }

    async fn complete(&self, article: &Article) -> Result<WorkerOutcome> {
        let (extracted, words) = self.fetch_and_extract(&article.url).await?;

        let mut done = CompletedExtraction {
            title: extracted.title.clone(),
            description: extracted.excerpt.clone(),
            site_name: extracted.site_name.clone(),
            image_url: extracted.image_url.clone(),
            language: extracted.language.clone(),
            word_count: words,
            reading_time_seconds: reading_time_seconds(words),
            ..Default::default()
        };

        if let Some(tagger) = &self.tagger {
            let text = html2text::from_read(extracted.content.as_bytes(), TAGGER_TEXT_WIDTH)
                .map_err(|e| AppError::ExternalService(format!("flattening content failed: {e}")))?;
            let title = extracted.title.as_deref().unwrap_or(&article.url);
            let suggestion = tagger.suggest(title, &text).await?;
            done.tags = suggestion.tags;
            done.summary = suggestion.summary;
        }

        // cache first so a completed article always has content behind it
        self.cache
            .set(article.user_id, article.id, &extracted.content)
            .await?;

        if self.repo.complete_article(article.id, done).await? {
            debug!(article_id = article.id, words, "Article completed");
            Ok(WorkerOutcome::Completed)
        } else {
            debug!(article_id = article.id, "Article deleted or terminalized mid-flight, result dropped");
            if let Err(e) = self.cache.delete(article.user_id, article.id).await {
                warn!(article_id = article.id, error = %e, "Failed to drop orphaned cache entry");
            }
            Ok(WorkerOutcome::Skipped)
        }
    }

    async fn fetch_and_extract(&self, url: &str) -> Result<(Extracted, i64)> {
        let page = self.fetcher.fetch(url).await?;
        let extractor = Arc::clone(&self.extractor);
        tokio::task::spawn_blocking(move || -> Result<(Extracted, i64)> {
            let extracted = extractor.extract(&page.html, &page.final_url)?;
            let words = word_count(&extracted.content);
            Ok((extracted, words))
        })
        .await
        .map_err(|e| AppError::Internal(format!("extraction task failed: {e}")))?
    }
}
