use std::future::Future;
use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};
use url::Url;

use crate::ai::{ArticleTagger, ClaudeTagger};
use crate::cache::{CleanupReport, ContentCache};
use crate::config::Config;
use crate::db::Repository;
use crate::error::{AppError, Result};
use crate::models::{ArticleStatus, ArticleWithTags};
use crate::pipeline::{
    Callbacks, Dispatcher, ExtractionWorker, RetryPolicy, RetryScheduler, SweepReport, TaskEvent,
    TaskHandle,
};
use crate::search::search_articles;
use crate::services::{FetchSettings, HttpFetcher, PageFetcher};

/// Wires the store, cache and pipeline together for one process.
pub struct App {
    pub config: Config,
    pub repository: Repository,
    pub cache: ContentCache,
    worker: ExtractionWorker,
    dispatcher: Dispatcher,
    scheduler: RetryScheduler,
}

impl App {
    pub async fn new(config: &Config) -> Result<Self> {
        let fetcher = HttpFetcher::new(FetchSettings::from(config))?;

        let tagger: Option<Arc<dyn ArticleTagger>> = match &config.claude_api_key {
            Some(key) => Some(Arc::new(ClaudeTagger::new(key.clone())?)),
            None => None,
        };

        Self::with_collaborators(config, Arc::new(fetcher), tagger).await
    }

    pub async fn with_collaborators(
        config: &Config,
        fetcher: Arc<dyn PageFetcher>,
        tagger: Option<Arc<dyn ArticleTagger>>,
    ) -> Result<Self> {
        let repository = Repository::new(&config.db_path).await?;
        let cache = ContentCache::new(config.cache_dir.clone(), config.cache_extension.clone());

        let worker = ExtractionWorker::new(repository.clone(), cache.clone(), fetcher).with_tagger(tagger);
        let dispatcher = Dispatcher::new(worker.clone(), config.worker_concurrency);
        let scheduler = RetryScheduler::new(
            repository.clone(),
            dispatcher.clone(),
            RetryPolicy::from(config),
        );

        Ok(Self {
            config: config.clone(),
            repository,
            cache,
            worker,
            dispatcher,
            scheduler,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Store `raw_url` as a pending article for `user_id` and start extracting it.
    pub async fn submit_url(&self, user_id: i64, raw_url: &str, callbacks: Callbacks) -> Result<TaskHandle> {
        let url = validate_submission(raw_url)?;
        let id = self.repository.create_article(user_id, url.as_str()).await?;
        info!(article_id = id, user_id, url = %url, "Article submitted");
        Ok(self.dispatcher.spawn(id, callbacks))
    }

    /// Cached content of a completed article, re-extracting it on a cache miss.
    /// Articles that have not completed yet have no content.
    pub async fn read_content(&self, user_id: i64, article_id: i64) -> Result<Option<String>> {
        let Some(found) = self.repository.get_user_article(user_id, article_id).await? else {
            return Err(AppError::NotFound(format!("article {article_id}")));
        };
        if found.article.status != ArticleStatus::Completed {
            return Ok(None);
        }
        if let Some(content) = self.cache.get(user_id, article_id).await? {
            return Ok(Some(content));
        }

        debug!(article_id, "Cache miss, re-extracting");
        let content = self.worker.refetch_content(&found.article).await?;
        Ok(Some(content))
    }

    pub async fn delete_article(&self, user_id: i64, article_id: i64) -> Result<()> {
        self.repository.delete_article(user_id, article_id).await?;
        self.cache.delete(user_id, article_id).await?;
        info!(article_id, user_id, "Article deleted");
        Ok(())
    }

    pub async fn search(&self, user_id: i64, query: &str) -> Result<Vec<ArticleWithTags>> {
        search_articles(&self.repository, &self.cache, user_id, query).await
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.scheduler.sweep().await
    }

    /// One sweep whose retries have all finished by the time it returns.
    pub async fn sweep_and_wait(&self) -> Result<(SweepReport, Vec<TaskEvent>)> {
        self.scheduler.sweep_and_wait().await
    }

    pub async fn cleanup_cache(&self) -> Result<CleanupReport> {
        self.cache.cleanup(self.config.cache_max_age()).await
    }

    /// Control loop: retry sweeps and cache cleanups on their own periods
    /// until `shutdown` resolves. Both run once right away.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let mut retry = tokio::time::interval(self.scheduler.policy().interval);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup = tokio::time::interval(self.config.cleanup_interval());
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            retry_every = ?self.scheduler.policy().interval,
            cleanup_every = ?self.config.cleanup_interval(),
            "Control loop started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = retry.tick() => {
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Retry sweep failed");
                    }
                }
                _ = cleanup.tick() => {
                    if let Err(e) = self.cleanup_cache().await {
                        error!(error = %e, "Cache cleanup failed");
                    }
                }
            }
        }

        self.dispatcher.close();
        info!("Control loop stopped");
        Ok(())
    }
}

fn validate_submission(raw_url: &str) -> Result<Url> {
    let url = Url::parse(raw_url.trim())
        .map_err(|e| AppError::Validation(format!("invalid URL {raw_url:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(AppError::Validation(format!(
                "unsupported URL scheme {other:?}, expected http or https"
            )))
        }
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(AppError::Validation(format!("URL {raw_url:?} has no host")));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testing::{article_html, StaticFetcher};
    use crate::pipeline::TaskOutcome;
    use std::time::Duration;

    async fn app(dir: &tempfile::TempDir, fetcher: Arc<dyn PageFetcher>) -> App {
        let config = Config {
            db_path: dir.path().join("app.db").to_string_lossy().to_string(),
            cache_dir: dir.path().join("content"),
            ..Config::default()
        };
        App::with_collaborators(&config, fetcher, None).await.unwrap()
    }

    #[test]
    fn submission_validation() {
        assert!(validate_submission("https://example.com/a?b=c").is_ok());
        assert!(validate_submission("  http://example.com  ").is_ok());
        for bad in ["ftp://example.com/file", "javascript:alert(1)", "not a url", "file:///etc/passwd"] {
            assert!(
                matches!(validate_submission(bad), Err(AppError::Validation(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn submit_extracts_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, StaticFetcher::arc(article_html(45))).await;

        let handle = app
            .submit_url(3, "https://example.com/long-read", Callbacks::none())
            .await
            .unwrap();
        let id = handle.article_id();
        assert_eq!(handle.wait().await, TaskOutcome::Completed);

        let content = app.read_content(3, id).await.unwrap().unwrap();
        assert!(content.contains("word"));
        assert!(matches!(app.read_content(4, id).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn rejected_submission_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, StaticFetcher::arc(article_html(10))).await;

        let err = app
            .submit_url(1, "gopher://example.com", Callbacks::none())
            .await
            .err()
            .unwrap();

        assert!(!err.is_retryable());
        let listed = app
            .repository
            .list_articles(crate::models::ArticleFilter::for_user(1))
            .await
            .unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn cache_miss_is_refilled() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = StaticFetcher::arc(article_html(20));
        let app = app(&dir, fetcher.clone()).await;
        let handle = app
            .submit_url(1, "https://example.com/a", Callbacks::none())
            .await
            .unwrap();
        let id = handle.article_id();
        handle.wait().await;
        app.cache.delete(1, id).await.unwrap();

        let content = app.read_content(1, id).await.unwrap();

        assert!(content.is_some());
        assert_eq!(fetcher.calls(), 2);
        assert!(app.cache.exists(1, id).await.unwrap());
    }

    #[tokio::test]
    async fn pending_article_has_no_content_yet() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = StaticFetcher::arc(article_html(20));
        let app = app(&dir, fetcher.clone()).await;
        let id = app.repository.create_article(1, "https://example.com/a").await.unwrap();

        assert_eq!(app.read_content(1, id).await.unwrap(), None);
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn delete_removes_row_and_cache_entry() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, StaticFetcher::arc(article_html(20))).await;
        let handle = app
            .submit_url(1, "https://example.com/a", Callbacks::none())
            .await
            .unwrap();
        let id = handle.article_id();
        handle.wait().await;

        app.delete_article(1, id).await.unwrap();

        assert!(app.repository.get_article(id).await.unwrap().is_none());
        assert!(!app.cache.exists(1, id).await.unwrap());
        assert!(matches!(app.delete_article(1, id).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn control_loop_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, StaticFetcher::arc(article_html(20))).await;

        let run = app.run(tokio::time::sleep(Duration::from_millis(50)));
        tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("control loop did not stop")
            .unwrap();
    }
}
