#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("db error: {0}")]
    Db(#[from] meter_db::DbError),
    #[error("time parse error: {0}")]
    Time(#[from] chrono::ParseError),
    #[error("report codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("invariant violation: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
