use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("input file not found: {}", .0.display())]
    InputNotFound(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("{0}")]
    Config(String),
    #[error("cache file {} is unreadable: {detail}", .path.display())]
    CacheCorrupt { path: PathBuf, detail: String },
    #[error("cache migration failed for {}: {detail}", .path.display())]
    CacheMigration { path: PathBuf, detail: String },
}
