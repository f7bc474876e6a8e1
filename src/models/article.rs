use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Tag;
use crate::error::AppError;

/// Processing lifecycle of an article.
///
/// `Pending -> Processing -> {Completed | Failed}`, `Failed -> Processing`
/// on retry and `Failed -> Error` once attempts are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Error,
}

impl ArticleStatus {
    pub const ALL: [ArticleStatus; 5] = [
        ArticleStatus::Pending,
        ArticleStatus::Processing,
        ArticleStatus::Completed,
        ArticleStatus::Failed,
        ArticleStatus::Error,
    ];

    /// States a worker may pick up or the retry sweep may re-dispatch.
    pub const RETRYABLE: [ArticleStatus; 3] = [
        ArticleStatus::Pending,
        ArticleStatus::Processing,
        ArticleStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ArticleStatus::Pending => "pending",
            ArticleStatus::Processing => "processing",
            ArticleStatus::Completed => "completed",
            ArticleStatus::Failed => "failed",
            ArticleStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        match self {
            ArticleStatus::Completed | ArticleStatus::Error => true,
            ArticleStatus::Pending | ArticleStatus::Processing | ArticleStatus::Failed => false,
        }
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// `Processing -> Processing` is allowed so a stuck article can be
    /// re-dispatched, and `Completed -> Completed` so a duplicate worker's
    /// completion overwrites the first one.
    pub fn can_transition_to(self, next: ArticleStatus) -> bool {
        use ArticleStatus::*;
        match (self, next) {
            (Pending | Processing | Failed, Processing) => true,
            (Pending | Processing | Failed, Completed) => true,
            (Pending | Processing | Failed, Failed) => true,
            (Pending | Processing | Failed, Error) => true,
            (Completed, Completed) => true,
            (Completed, _) => false,
            (Error, _) => false,
            (_, Pending) => false,
        }
    }
}

impl ArticleStatus {
    /// Every status that may legally move to `next`.
    pub fn sources_of(next: ArticleStatus) -> Vec<ArticleStatus> {
        Self::ALL
            .into_iter()
            .filter(|status| status.can_transition_to(next))
            .collect()
    }

    pub fn non_terminal() -> Vec<ArticleStatus> {
        Self::ALL.into_iter().filter(|s| !s.is_terminal()).collect()
    }
}

impl fmt::Display for ArticleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArticleStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ArticleStatus::Pending),
            "processing" => Ok(ArticleStatus::Processing),
            "completed" => Ok(ArticleStatus::Completed),
            "failed" => Ok(ArticleStatus::Failed),
            "error" => Ok(ArticleStatus::Error),
            other => Err(AppError::Validation(format!("unknown article status {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Rating {
    Down,
    #[default]
    Neutral,
    Up,
}

impl Rating {
    pub fn as_i64(self) -> i64 {
        match self {
            Rating::Down => -1,
            Rating::Neutral => 0,
            Rating::Up => 1,
        }
    }
}

impl TryFrom<i64> for Rating {
    type Error = AppError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Rating::Down),
            0 => Ok(Rating::Neutral),
            1 => Ok(Rating::Up),
            other => Err(AppError::Validation(format!(
                "rating must be -1, 0 or 1, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadingPosition {
    pub element: String,
    pub offset: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub user_id: i64,
    pub url: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub site_name: Option<String>,
    pub image_url: Option<String>,
    pub summary: Option<String>,
    pub language: Option<String>,
    pub word_count: i64,
    pub reading_time_seconds: i64,
    pub status: ArticleStatus,
    pub processing_attempts: i64,
    pub last_error: Option<String>,
    pub archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
    pub rating: Rating,
    pub created_at: DateTime<Utc>,
    /// Last lifecycle write. Archive, rating and read marks leave it alone.
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub reading_position: Option<ReadingPosition>,
}

impl Article {
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.url)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArticleWithTags {
    pub article: Article,
    pub tags: Vec<Tag>,
}

/// Everything a successful extraction writes back in one transaction.
#[derive(Debug, Clone, Default)]
pub struct CompletedExtraction {
    pub title: Option<String>,
    pub description: Option<String>,
    pub site_name: Option<String>,
    pub image_url: Option<String>,
    pub summary: Option<String>,
    pub language: Option<String>,
    pub word_count: i64,
    pub reading_time_seconds: i64,
    pub tags: Vec<String>,
}

/// Filtered, paginated listing of one user's articles.
#[derive(Debug, Clone)]
pub struct ArticleFilter {
    pub user_id: i64,
    pub statuses: Vec<ArticleStatus>,
    pub archived: Option<bool>,
    pub query: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl ArticleFilter {
    pub fn for_user(user_id: i64) -> Self {
        Self {
            user_id,
            statuses: Vec::new(),
            archived: None,
            query: None,
            limit: 50,
            offset: 0,
        }
    }

    pub fn statuses(mut self, statuses: impl IntoIterator<Item = ArticleStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn archived(mut self, archived: bool) -> Self {
        self.archived = Some(archived);
        self
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn page(mut self, limit: i64, offset: i64) -> Self {
        self.limit = limit;
        self.offset = offset;
        self
    }
}
