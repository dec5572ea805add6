use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("snapshot unavailable for {symbol}@{provider_id}: {reason}")]
    SnapshotUnavailable {
        symbol: String,
        provider_id: String,
        reason: String,
    },

    #[error("no book subscribed for {symbol}@{provider_id}")]
    UnknownBook { symbol: String, provider_id: String },

    #[error("resync for {symbol} did not converge after {attempts} attempts")]
    ResyncExhausted { symbol: String, attempts: u32 },
}

pub type Result<T> = std::result::Result<T, EngineError>;
