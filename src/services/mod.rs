mod fetcher;
mod readability;
mod url_guard;

#[cfg(test)]
pub(crate) mod testing;

pub use fetcher::{FetchSettings, FetchedPage, HttpFetcher, PageFetcher};
pub use readability::{
    reading_time_seconds, word_count, ContentExtractor, Extracted, Readability, WORDS_PER_MINUTE,
};
pub use url_guard::{GuardedResolver, Refused, UrlGuard};
