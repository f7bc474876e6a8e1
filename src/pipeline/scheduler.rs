use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::dispatcher::{Callbacks, Dispatcher, TaskEvent, TaskHandle};
use crate::config::Config;
use crate::db::{Repository, MAX_ATTEMPTS_ERROR};
use crate::error::Result;

/// How many articles one sweep looks at per query.
const SWEEP_BATCH: i64 = 100;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Time between sweeps.
    pub interval: Duration,
    /// How long an article must sit untouched before it counts as stuck.
    pub retry_delay: chrono::Duration,
    pub max_attempts: i64,
    pub batch_size: i64,
}

impl From<&Config> for RetryPolicy {
    fn from(config: &Config) -> Self {
        Self {
            interval: config.retry_interval(),
            retry_delay: chrono::Duration::minutes(config.retry_delay_minutes),
            max_attempts: config.max_attempts,
            batch_size: SWEEP_BATCH,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub retried: usize,
    /// Stuck articles skipped because a dispatch for them is still queued or running.
    pub already_queued: usize,
    pub terminalized: usize,
    pub errors: usize,
}

/// Periodic recovery for articles that never finished.
///
/// A sweep re-dispatches stuck articles that still have attempts left and
/// moves exhausted ones to `error`. Both candidate lists are read before
/// anything is acted on, so one sweep never does both to the same article.
/// Articles the dispatcher is still working on are not dispatched again.
#[derive(Clone)]
pub struct RetryScheduler {
    repo: Repository,
    dispatcher: Dispatcher,
    policy: RetryPolicy,
}

impl RetryScheduler {
    pub fn new(repo: Repository, dispatcher: Dispatcher, policy: RetryPolicy) -> Self {
        Self {
            repo,
            dispatcher,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Sweep without waiting for the retries it launches.
    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let (report, _handles) = self.run_sweep(now).await?;
        Ok(report)
    }

    /// Sweep and return once every retry it launched has finished.
    ///
    /// Short-lived processes use this: a dispatch still queued when the
    /// runtime shuts down is dropped without ever running.
    pub async fn sweep_and_wait(&self) -> Result<(SweepReport, Vec<TaskEvent>)> {
        self.sweep_and_wait_at(Utc::now()).await
    }

    pub async fn sweep_and_wait_at(&self, now: DateTime<Utc>) -> Result<(SweepReport, Vec<TaskEvent>)> {
        let (report, handles) = self.run_sweep(now).await?;
        let finished = futures::future::join_all(handles.into_iter().map(|handle| async move {
            let article_id = handle.article_id();
            TaskEvent {
                article_id,
                outcome: handle.wait().await,
            }
        }))
        .await;
        Ok((report, finished))
    }

    async fn run_sweep(&self, now: DateTime<Utc>) -> Result<(SweepReport, Vec<TaskHandle>)> {
        let cutoff = now - self.policy.retry_delay;
        let stuck = self
            .repo
            .find_stuck(cutoff, self.policy.max_attempts, self.policy.batch_size)
            .await?;
        let exhausted = self
            .repo
            .find_exhausted(self.policy.max_attempts, self.policy.batch_size)
            .await?;

        let mut report = SweepReport::default();
        let mut handles = Vec::with_capacity(stuck.len());

        for article in &stuck {
            if self.dispatcher.is_in_flight(article.id) {
                debug!(article_id = article.id, "Retry skipped, dispatch still in flight");
                report.already_queued += 1;
                continue;
            }
            info!(
                article_id = article.id,
                status = %article.status,
                attempts = article.processing_attempts,
                "Retrying stuck article"
            );
            // the worker records its own outcome
            handles.push(self.dispatcher.spawn(article.id, Callbacks::none()));
            report.retried += 1;
        }

        for article in &exhausted {
            match self.repo.mark_error(article.id, MAX_ATTEMPTS_ERROR).await {
                Ok(true) => {
                    warn!(
                        article_id = article.id,
                        attempts = article.processing_attempts,
                        "Giving up on article"
                    );
                    report.terminalized += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    error!(article_id = article.id, error = %e, "Failed to terminalize article");
                    report.errors += 1;
                }
            }
        }

        if report.retried + report.already_queued + report.terminalized + report.errors > 0 {
            info!(
                retried = report.retried,
                already_queued = report.already_queued,
                terminalized = report.terminalized,
                errors = report.errors,
                "Retry sweep finished"
            );
        }
        Ok((report, handles))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ArticleStatus;
    use crate::pipeline::testing::{article_html, harness, FailingFetcher, GatedFetcher, StaticFetcher};
    use crate::pipeline::TaskOutcome;
    use crate::pipeline::ExtractionWorker;
    use crate::services::PageFetcher;
    use std::sync::Arc;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_secs(300),
            retry_delay: chrono::Duration::minutes(10),
            max_attempts: 3,
            batch_size: 100,
        }
    }

    fn scheduler(repo: &Repository, cache: crate::cache::ContentCache, fetcher: Arc<dyn PageFetcher>) -> RetryScheduler {
        let worker = ExtractionWorker::new(repo.clone(), cache, fetcher);
        RetryScheduler::new(repo.clone(), Dispatcher::new(worker, 2), policy())
    }

    #[tokio::test]
    async fn fresh_articles_are_left_alone() {
        let (_dir, repo, cache) = harness().await;
        let fetcher = StaticFetcher::arc(article_html(20));
        let scheduler = scheduler(&repo, cache, fetcher.clone());
        repo.create_article(1, "https://example.com/a").await.unwrap();

        let report = scheduler.sweep().await.unwrap();

        assert_eq!(report, SweepReport::default());
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn stale_pending_article_is_redispatched() {
        let (_dir, repo, cache) = harness().await;
        let scheduler = scheduler(&repo, cache.clone(), StaticFetcher::arc(article_html(20)));
        let id = repo.create_article(1, "https://example.com/a").await.unwrap();
        let mut events = scheduler.dispatcher.subscribe();

        let report = scheduler
            .sweep_at(Utc::now() + chrono::Duration::minutes(11))
            .await
            .unwrap();

        assert_eq!(report.retried, 1);
        assert_eq!(events.recv().await.unwrap().article_id, id);
        let article = repo.get_article(id).await.unwrap().unwrap();
        assert_eq!(article.status, ArticleStatus::Completed);
        assert!(cache.exists(1, id).await.unwrap());
    }

    #[tokio::test]
    async fn queued_retries_are_not_dispatched_twice() {
        let (_dir, repo, cache) = harness().await;
        let fetcher = GatedFetcher::arc(article_html(20));
        let worker = ExtractionWorker::new(repo.clone(), cache, fetcher.clone());
        let scheduler = RetryScheduler::new(repo.clone(), Dispatcher::new(worker, 1), policy());
        let first = repo.create_article(1, "https://example.com/a").await.unwrap();
        let second = repo.create_article(1, "https://example.com/b").await.unwrap();
        let mut events = scheduler.dispatcher.subscribe();

        let report = scheduler
            .sweep_at(Utc::now() + chrono::Duration::minutes(11))
            .await
            .unwrap();
        assert_eq!(report.retried, 2);

        // one retry holds the only permit, the other waits for it
        let report = scheduler
            .sweep_at(Utc::now() + chrono::Duration::minutes(22))
            .await
            .unwrap();
        assert_eq!(report.retried, 0);
        assert_eq!(report.already_queued, 2);

        fetcher.release(2);
        let mut done = vec![events.recv().await.unwrap(), events.recv().await.unwrap()];
        done.sort_by_key(|e| e.article_id);
        assert_eq!(done.iter().map(|e| e.article_id).collect::<Vec<_>>(), vec![first, second]);
        assert!(done.iter().all(|e| e.outcome == TaskOutcome::Completed));
        assert_eq!(fetcher.calls(), 2);
        for id in [first, second] {
            let article = repo.get_article(id).await.unwrap().unwrap();
            assert_eq!(article.status, ArticleStatus::Completed);
            assert_eq!(article.processing_attempts, 0);
        }
    }

    #[test]
    fn waiting_sweep_finishes_before_the_runtime_goes_away() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (dir, repo, cache) = runtime.block_on(harness());
        let scheduler = scheduler(&repo, cache.clone(), StaticFetcher::arc(article_html(20)));
        let ids: Vec<i64> = runtime.block_on(async {
            let mut ids = Vec::new();
            for n in 0..3 {
                ids.push(repo.create_article(1, &format!("https://example.com/{n}")).await.unwrap());
            }
            ids
        });

        let (report, finished) = runtime
            .block_on(scheduler.sweep_and_wait_at(Utc::now() + chrono::Duration::minutes(11)))
            .unwrap();
        drop(runtime);

        assert_eq!(report.retried, 3);
        assert_eq!(finished.len(), 3);
        assert!(finished.iter().all(|e| e.outcome == TaskOutcome::Completed));
        let after = tokio::runtime::Runtime::new().unwrap();
        after.block_on(async {
            let repo = Repository::new(dir.path().join("articles.db").to_str().unwrap())
                .await
                .unwrap();
            for id in ids {
                let article = repo.get_article(id).await.unwrap().unwrap();
                assert_eq!(article.status, ArticleStatus::Completed);
                assert!(cache.exists(1, id).await.unwrap());
            }
        });
    }

    #[tokio::test]
    async fn last_attempt_is_retried_then_terminalized_next_sweep() {
        let (_dir, repo, cache) = harness().await;
        let scheduler = scheduler(&repo, cache, FailingFetcher::arc("HTTP 500"));
        let id = repo.create_article(1, "https://example.com/a").await.unwrap();
        repo.mark_failed(id, "HTTP 500").await.unwrap();
        repo.mark_failed(id, "HTTP 500").await.unwrap();
        let mut events = scheduler.dispatcher.subscribe();

        let first = scheduler
            .sweep_at(Utc::now() + chrono::Duration::minutes(11))
            .await
            .unwrap();
        assert_eq!(first.retried, 1);
        assert_eq!(first.terminalized, 0);
        events.recv().await.unwrap();

        let article = repo.get_article(id).await.unwrap().unwrap();
        assert_eq!(article.status, ArticleStatus::Failed);
        assert_eq!(article.processing_attempts, 3);

        let second = scheduler
            .sweep_at(Utc::now() + chrono::Duration::minutes(22))
            .await
            .unwrap();
        assert_eq!(second.retried, 0);
        assert_eq!(second.terminalized, 1);

        let article = repo.get_article(id).await.unwrap().unwrap();
        assert_eq!(article.status, ArticleStatus::Error);
        assert_eq!(article.last_error.as_deref(), Some(MAX_ATTEMPTS_ERROR));
    }

    #[tokio::test]
    async fn exhausted_processing_article_is_terminalized() {
        let (_dir, repo, cache) = harness().await;
        let fetcher = StaticFetcher::arc(article_html(20));
        let scheduler = scheduler(&repo, cache, fetcher.clone());
        let id = repo.create_article(1, "https://example.com/a").await.unwrap();
        for _ in 0..3 {
            repo.mark_failed(id, "timeout").await.unwrap();
        }
        // worker died mid-flight after the last attempt was counted
        repo.mark_processing(id).await.unwrap();

        let report = scheduler.sweep().await.unwrap();

        assert_eq!(report.terminalized, 1);
        assert_eq!(report.retried, 0);
        assert_eq!(fetcher.calls(), 0);
        let article = repo.get_article(id).await.unwrap().unwrap();
        assert_eq!(article.status, ArticleStatus::Error);
    }

    #[tokio::test]
    async fn terminal_articles_are_ignored() {
        let (_dir, repo, cache) = harness().await;
        let scheduler = scheduler(&repo, cache, StaticFetcher::arc(article_html(20)));
        let done = repo.create_article(1, "https://example.com/a").await.unwrap();
        let dead = repo.create_article(1, "https://example.com/b").await.unwrap();
        scheduler.dispatcher.spawn(done, Callbacks::none()).wait().await;
        for _ in 0..3 {
            repo.mark_failed(dead, "nope").await.unwrap();
        }
        repo.mark_error(dead, MAX_ATTEMPTS_ERROR).await.unwrap();

        let report = scheduler
            .sweep_at(Utc::now() + chrono::Duration::days(1))
            .await
            .unwrap();

        assert_eq!(report, SweepReport::default());
    }

    #[test]
    fn policy_follows_config() {
        let config = Config::default();
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_attempts, config.max_attempts);
        assert_eq!(policy.retry_delay, chrono::Duration::minutes(config.retry_delay_minutes));
        assert_eq!(policy.interval, config.retry_interval());
    }
}
