use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("liveness lost: {0}")]
    LivenessLost(String),

    #[error(
        "membership did not converge within {elapsed:?}: discovered {discovered:?}, committed {committed:?}"
    )]
    ConvergenceTimeout {
        discovered: Vec<String>,
        committed: Vec<String>,
        elapsed: Duration,
    },

    #[error("elastic manager is shutting down")]
    ShuttingDown,
}

impl Error {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn liveness_lost(msg: impl Into<String>) -> Self {
        Self::LivenessLost(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
