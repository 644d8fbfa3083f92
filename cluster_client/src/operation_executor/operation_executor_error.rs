use crate::{connection::ConnectionError, error_chain_fmt, ReadMode, ServerAddress, TopologyError};

#[derive(thiserror::Error)]
pub enum OperationError {
    #[error("No replica set member available for query with read preference matching mode {read_mode}")]
    NoEligibleServer { read_mode: ReadMode },
    #[error("No primary is currently available")]
    NoPrimary,
    #[error("Server is not primary (code {code}): {message}")]
    NotPrimary { code: i64, message: String },
    #[error("Could not talk to {address}")]
    Connection {
        address: ServerAddress,
        #[source]
        source: ConnectionError,
    },
    #[error("Command `{command}` failed with code {code}: {message}")]
    CommandFailed {
        command: String,
        code: i64,
        message: String,
    },
    #[error("Invalid command document: {0}")]
    InvalidCommand(String),
    #[error("Operation deadline exceeded")]
    DeadlineExceeded {
        #[source]
        last_error: Box<OperationError>,
    },
    #[error(transparent)]
    Topology(TopologyError),
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}
impl std::fmt::Debug for OperationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl From<TopologyError> for OperationError {
    fn from(e: TopologyError) -> Self {
        match e {
            TopologyError::NoPrimary => OperationError::NoPrimary,
            other => OperationError::Topology(other),
        }
    }
}

impl OperationError {
    /// Conditions a rescan may fix: elections, restarts and network blips.
    pub fn is_retryable(&self) -> bool {
        match self {
            OperationError::NoEligibleServer { .. }
            | OperationError::NoPrimary
            | OperationError::NotPrimary { .. } => true,
            OperationError::Connection { source, .. } => source.is_transport(),
            _ => false,
        }
    }
}
