//! Article ingestion core: extraction workers, retry sweeps, a per-user
//! content cache and literal search over it.

pub mod ai;
pub mod app;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod search;
pub mod services;

pub use app::App;
pub use config::Config;
pub use error::{AppError, Result};
