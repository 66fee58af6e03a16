use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("data error: {0}")]
    Data(String),
    #[error("cursor for {folder} is at uidvalidity {stored}, refusing to advance with {requested}")]
    StaleEpoch {
        folder: String,
        stored: u32,
        requested: u32,
    },
}
