//! Stub collaborators shared by the pipeline tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use url::Url;

use crate::ai::{ArticleTagger, TagSuggestion};
use crate::cache::ContentCache;
use crate::db::Repository;
use crate::error::{AppError, Result};
use crate::services::{FetchedPage, PageFetcher};

pub async fn harness() -> (tempfile::TempDir, Repository, ContentCache) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("articles.db");
    let repo = Repository::new(db_path.to_str().unwrap()).await.unwrap();
    let cache = ContentCache::new(dir.path().join("content"), "html");
    (dir, repo, cache)
}

/// A page whose main content holds exactly `words` words, split into
/// paragraphs of at most 25.
pub fn article_html(words: usize) -> String {
    let paragraphs: Vec<String> = (0..words)
        .collect::<Vec<_>>()
        .chunks(25)
        .map(|chunk| format!("<p>{}</p>", vec!["word"; chunk.len()].join(" ")))
        .collect();
    format!(
        r#"<html lang="en"><head>
<title>Fixture | Site</title>
<meta property="og:title" content="Fixture headline">
<meta property="og:site_name" content="Fixture Site">
</head><body>
<header><h1>Fixture headline</h1></header>
<nav class="menu"><a href="/">Home</a></nav>
<article class="post-body">{}<script>track()</script></article>
</body></html>"#,
        paragraphs.join("\n")
    )
}

pub struct StaticFetcher {
    html: String,
    calls: AtomicUsize,
}

impl StaticFetcher {
    pub fn arc(html: String) -> Arc<Self> {
        Arc::new(Self {
            html,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageFetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(FetchedPage {
            final_url: Url::parse(url)?,
            html: self.html.clone(),
        })
    }
}

pub struct FailingFetcher {
    message: String,
    calls: AtomicUsize,
}

impl FailingFetcher {
    pub fn arc(message: &str) -> Arc<Self> {
        Arc::new(Self {
            message: message.to_string(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageFetcher for FailingFetcher {
    async fn fetch(&self, _url: &str) -> Result<FetchedPage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(AppError::ExternalService(self.message.clone()))
    }
}

/// Serves `html` only after `release` lets a fetch through.
pub struct GatedFetcher {
    html: String,
    gate: Semaphore,
    calls: AtomicUsize,
}

impl GatedFetcher {
    pub fn arc(html: String) -> Arc<Self> {
        Arc::new(Self {
            html,
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn release(&self, fetches: usize) {
        self.gate.add_permits(fetches);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageFetcher for GatedFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.gate
            .acquire()
            .await
            .map_err(|e| AppError::Internal(e.to_string()))?
            .forget();
        Ok(FetchedPage {
            final_url: Url::parse(url)?,
            html: self.html.clone(),
        })
    }
}

pub struct PanickingFetcher;

#[async_trait]
impl PageFetcher for PanickingFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage> {
        panic!("parser blew up on {url}");
    }
}

pub struct FixedTagger {
    suggestion: TagSuggestion,
}

impl FixedTagger {
    pub fn arc(tags: &[&str], summary: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            suggestion: TagSuggestion {
                tags: tags.iter().map(|t| t.to_string()).collect(),
                summary: summary.map(str::to_string),
            },
        })
    }
}

#[async_trait]
impl ArticleTagger for FixedTagger {
    async fn suggest(&self, _title: &str, _text: &str) -> Result<TagSuggestion> {
        Ok(self.suggestion.clone())
    }
}
