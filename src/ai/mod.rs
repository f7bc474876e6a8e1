mod tagger;

pub use tagger::{ArticleTagger, ClaudeTagger, TagSuggestion};
