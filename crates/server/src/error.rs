/// Pass-level outcomes the scheduler logs and moves on from; nothing here
/// is fatal to the process.
#[derive(Debug, thiserror::Error)]
pub enum PassError {
    #[error("transient upstream error: {0}")]
    TransientUpstream(String),
    #[error("upstream parse error: {0}")]
    Parse(String),
    #[error("persistence error: {0}")]
    Persistence(#[from] meter_db::DbError),
    #[error("engine error: {0}")]
    Engine(#[from] meter_engine::EngineError),
}

pub type Result<T> = std::result::Result<T, PassError>;
