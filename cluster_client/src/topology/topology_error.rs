use crate::{error_chain_fmt, MonitorError};

#[derive(thiserror::Error)]
pub enum TopologyError {
    #[error("Topology is misconfigured: {0}")]
    Configuration(String),
    #[error("No primary is currently available")]
    NoPrimary,
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}
impl std::fmt::Debug for TopologyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
