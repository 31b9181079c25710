use thiserror::Error;

pub type FunnelResult<T> = Result<T, FunnelError>;

#[derive(Error, Debug)]
pub enum FunnelError {
    #[error("Funnel {funnel_id} has no steps")]
    EmptyFunnel { funnel_id: String },

    #[error("Funnel {funnel_id} not found")]
    FunnelNotFound { funnel_id: String },

    #[error("Funnel {funnel_id} has been deleted")]
    FunnelDeleted { funnel_id: String },

    #[error("Invalid funnel definition: {0}")]
    InvalidDefinition(String),

    #[error("Invalid reporting period: {0}")]
    InvalidPeriod(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<config::ConfigError> for FunnelError {
    fn from(e: config::ConfigError) -> Self {
        FunnelError::Config(e.to_string())
    }
}
