use tracing::instrument;

use crate::{
    connection::Connector, Client, ClientError, ConnectionString, Conventions, OperationExecutor,
    ReadPreference, ServerAddress, Topology, TopologyMode,
};

#[derive(Debug, Default)]
pub struct ClientBuilder {
    connection_string: Option<String>,
    connector: Option<Box<dyn Connector>>,
    conventions: Conventions,
    database_name: Option<String>,
    mode: Option<TopologyMode>,
    read_preference: Option<ReadPreference>,
    replica_set: Option<String>,
    seeds: Vec<String>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds seed addresses (`host[:port]`). May be combined with a connection
    /// string; both lists are used.
    pub fn set_seeds<T>(mut self, seeds: &[T]) -> Self
    where
        T: AsRef<str>,
    {
        for s in seeds {
            self.seeds.push(s.as_ref().to_string());
        }
        self
    }

    pub fn set_connection_string(mut self, connection_string: &str) -> Self {
        self.connection_string = Some(connection_string.to_string());
        self
    }

    /// Overrides the mode inferred from the replica-set name and the
    /// connection string.
    pub fn set_mode(mut self, mode: TopologyMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn set_replica_set(mut self, replica_set: &str) -> Self {
        self.replica_set = Some(replica_set.to_string());
        self
    }

    pub fn set_database_name(mut self, database_name: &str) -> Self {
        self.database_name = Some(database_name.to_string());
        self
    }

    pub fn set_read_preference(mut self, read_preference: ReadPreference) -> Self {
        self.read_preference = Some(read_preference);
        self
    }

    pub fn set_connector(mut self, connector: Box<dyn Connector>) -> Self {
        tracing::trace!("Using connector: {:?}", &connector);
        self.connector = Some(connector);
        self
    }

    pub fn set_conventions(mut self, conventions: Conventions) -> Self {
        self.conventions = conventions;
        self
    }

    /// Validates the configuration, starts the topology actor and returns a
    /// handle to it.
    ///
    /// Each call starts a new actor with its own monitors, so the builder
    /// can be used as a template. Must be called from within a tokio runtime.
    #[instrument(level = "debug", name = "Build ClientBuilder", skip(self))]
    pub fn build(&self) -> Result<Client, ClientError> {
        let parsed = self
            .connection_string
            .as_deref()
            .map(str::parse::<ConnectionString>)
            .transpose()?;

        let seeds = collect_seeds(&self.seeds, parsed.as_ref())?;
        if seeds.is_empty() {
            tracing::error!("No seeds were supplied and a client can't exist without at least one");
            return Err(ClientError::MissingSeedsError);
        }

        let connector = self
            .connector
            .clone()
            .ok_or(ClientError::MissingConnectorError)?;

        let replica_set = self
            .replica_set
            .clone()
            .or_else(|| parsed.as_ref().and_then(|p| p.replica_set().map(str::to_string)));
        let mode = self.mode.unwrap_or_else(|| {
            infer_mode(parsed.as_ref().and_then(ConnectionString::mode), replica_set.as_deref())
        });
        let database_name = self
            .database_name
            .clone()
            .or_else(|| parsed.as_ref().and_then(|p| p.database().map(str::to_string)));
        let read_preference = self
            .read_preference
            .clone()
            .or_else(|| parsed.as_ref().and_then(|p| p.read_preference().cloned()))
            .unwrap_or_default();

        tracing::debug!("Starting {} topology with seeds {:?}", mode, seeds);
        let topology = Topology::new(mode, seeds, connector.clone(), &self.conventions)?;
        let executor = OperationExecutor::new(topology, connector, self.conventions.clone());

        Ok(Client::new(
            executor,
            database_name,
            read_preference,
            replica_set,
        ))
    }
}

/// Parses the explicit seeds followed by the connection string hosts,
/// dropping duplicates.
fn collect_seeds(
    seeds: &[String],
    parsed: Option<&ConnectionString>,
) -> Result<Vec<ServerAddress>, ClientError> {
    let mut addresses = seeds
        .iter()
        .map(|s| s.parse::<ServerAddress>())
        .collect::<Result<Vec<_>, _>>()?;
    if let Some(parsed) = parsed {
        addresses.extend(parsed.hosts().iter().cloned());
    }
    let mut unique = Vec::with_capacity(addresses.len());
    for address in addresses {
        if !unique.contains(&address) {
            unique.push(address);
        }
    }
    Ok(unique)
}

/// A connection string mode wins; otherwise a replica-set name means
/// ReplicaSet and anything else is a direct connection.
fn infer_mode(from_connection_string: Option<TopologyMode>, replica_set: Option<&str>) -> TopologyMode {
    match (from_connection_string, replica_set) {
        (Some(mode), _) => mode,
        (None, Some(_)) => TopologyMode::ReplicaSet,
        (None, None) => TopologyMode::Standalone,
    }
}
