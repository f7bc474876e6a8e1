mod article;
mod tag;

pub use article::{
    Article, ArticleFilter, ArticleStatus, ArticleWithTags, CompletedExtraction, Rating,
    ReadingPosition,
};
pub use tag::{normalize_tag_names, Tag};
