mod repository;
mod schema;

pub use repository::{like_pattern, Repository, MAX_ATTEMPTS_ERROR};
