use serde_json::Value;
use tracing::instrument;

use crate::{
    connection::Document, ClientBuilder, ClientError, Database, OperationExecutor, ReadPreference,
    Topology,
};

/**
A handle to a running topology and the executor that routes operations
through it.

Cloning is cheap: every clone shares the same topology actor and monitors.
The actor stops when the last clone is dropped or [`Client::close`] is
called.
*/
#[derive(Clone, Debug)]
pub struct Client {
    executor: OperationExecutor,
    database_name: Option<String>,
    read_preference: ReadPreference,
    replica_set: Option<String>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    // Only the builder creates clients.
    pub(crate) fn new(
        executor: OperationExecutor,
        database_name: Option<String>,
        read_preference: ReadPreference,
        replica_set: Option<String>,
    ) -> Self {
        Self {
            executor,
            database_name,
            read_preference,
            replica_set,
        }
    }

    pub fn topology(&self) -> &Topology {
        self.executor.topology()
    }

    pub fn executor(&self) -> &OperationExecutor {
        &self.executor
    }

    /// The default read preference, inherited by every database.
    pub fn read_preference(&self) -> &ReadPreference {
        &self.read_preference
    }

    pub fn replica_set(&self) -> Option<&str> {
        self.replica_set.as_deref()
    }

    pub fn database(&self, name: &str) -> Database {
        Database::new(name, self.executor.clone(), self.read_preference.clone())
    }

    /// The database named in the connection string or builder.
    pub fn default_database(&self) -> Result<Database, ClientError> {
        self.database_name
            .as_deref()
            .map(|name| self.database(name))
            .ok_or(ClientError::MissingDatabaseError)
    }

    /// Runs a command against the `admin` database.
    #[instrument(level = "debug", name = "Client - Command", skip(self))]
    pub async fn command(&self, body: Value) -> Result<Document, ClientError> {
        Ok(self.database("admin").command(body).await?)
    }

    /// Stops the topology actor and closes every monitoring connection.
    #[instrument(level = "debug", name = "Client - Close", skip(self))]
    pub async fn close(&self) -> Result<(), ClientError> {
        Ok(self.topology().close().await?)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_test::assert_err;

    use super::*;
    use crate::{
        test_support::{hello_primary, init_tracing, MockCluster},
        Conventions, ServerAddress,
    };

    #[tokio::test]
    async fn admin_commands_go_to_the_primary_and_close_stops_the_topology() {
        // Arrange
        init_tracing();
        let a = ServerAddress::new("a", 27017);
        let cluster = MockCluster::new();
        cluster.set_reply(&a, hello_primary("rs0", &["a"]));
        let client = Client::builder()
            .set_seeds(&["a"])
            .set_replica_set("rs0")
            .set_connector(cluster.connector())
            .set_conventions(Conventions::default().set_disable_topology_updates(true))
            .build()
            .unwrap();
        client.topology().scan().await.unwrap();

        // Act
        let reply = client.command(json!({ "ping": 1 })).await.unwrap();
        client.close().await.unwrap();

        // Assert
        assert_eq!(reply["ok"], json!(1));
        assert_eq!(cluster.commands(&a), vec!["ping"]);
        assert_err!(client.topology().scan().await);
        assert!(matches!(
            client.default_database(),
            Err(ClientError::MissingDatabaseError)
        ));
    }
}
