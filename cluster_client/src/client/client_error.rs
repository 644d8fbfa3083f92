use crate::{
    error_chain_fmt, AddressError, ConnectionStringError, OperationError, TopologyError,
};

#[derive(thiserror::Error)]
pub enum ClientError {
    #[error("No seeds were supplied and a client can't exist without at least one")]
    MissingSeedsError,
    #[error("No connector was supplied, so there is no way to reach a server")]
    MissingConnectorError,
    #[error("No database name was configured for this client")]
    MissingDatabaseError,
    #[error(transparent)]
    InvalidConnectionString(#[from] ConnectionStringError),
    #[error(transparent)]
    InvalidSeed(#[from] AddressError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}
impl std::fmt::Debug for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
