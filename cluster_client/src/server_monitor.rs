use std::time::Duration;

use tokio::time::Instant;
use tracing::instrument;

use crate::{
    connection::{Command, Connection, ConnectionError, Connector},
    error_chain_fmt, HelloReply, ServerAddress, ServerDescription,
};

/// Probes one server. Owns exactly one monitoring connection, which is
/// reused between probes and dropped whenever it fails.
#[derive(Debug)]
pub struct ServerMonitor {
    address: ServerAddress,
    connector: Box<dyn Connector>,
    connection: Option<Box<dyn Connection>>,
    /// Upper bound for connecting plus the role check
    timeout: Duration,
}

impl ServerMonitor {
    pub fn new(address: ServerAddress, connector: Box<dyn Connector>, timeout: Duration) -> Self {
        Self {
            address,
            connector,
            connection: None,
            timeout,
        }
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Checks the server's role and measures the round trip.
    ///
    /// A transport failure is a fact about the server, not an error: the
    /// connection is closed and an unknown description carrying the measured
    /// round trip comes back. Anything else is a bug somewhere and is
    /// returned as a [`MonitorError`].
    #[instrument(level = "debug", skip(self), fields(address = %self.address))]
    pub async fn probe(&mut self) -> Result<ServerDescription, MonitorError> {
        let start = Instant::now();

        let result = match tokio::time::timeout(self.timeout, self.check()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(self.address.clone())),
        };
        let round_trip_time = start.elapsed();

        match result {
            Ok(reply) => {
                let description =
                    ServerDescription::from_hello(self.address.clone(), &reply, round_trip_time);
                tracing::debug!(
                    "Probe of {} found {:?} in {:?}",
                    self.address,
                    description.role(),
                    round_trip_time
                );
                Ok(description)
            }
            Err(e) if e.is_transport() => {
                tracing::debug!("Probe of {} failed, disconnecting. Caused by: {}", self.address, e);
                self.disconnect().await;
                Ok(ServerDescription::unknown(
                    self.address.clone(),
                    round_trip_time,
                    Some(e.to_string()),
                ))
            }
            Err(e) => {
                tracing::error!("Probe of {} hit an unexpected error: {}", self.address, e);
                self.disconnect().await;
                Err(MonitorError::Connection {
                    address: self.address.clone(),
                    source: e,
                })
            }
        }
    }

    async fn check(&mut self) -> Result<HelloReply, ConnectionError> {
        if self.connection.is_none() {
            tracing::trace!("Opening monitoring connection to {}", self.address);
            self.connection = Some(self.connector.connect(&self.address).await?);
        }
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| ConnectionError::Socket("monitoring connection vanished".to_string()))?;

        let reply = connection.send(&Command::hello()).await?;
        HelloReply::from_document(reply)
            .map_err(|e| ConnectionError::Protocol(format!("malformed hello reply: {}", e)))
    }

    /// Closes the monitoring connection, if one is open.
    pub async fn disconnect(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.disconnect().await;
        }
    }
}

#[derive(thiserror::Error)]
pub enum MonitorError {
    #[error("Monitoring {address} failed with a non-transport error")]
    Connection {
        address: ServerAddress,
        #[source]
        source: ConnectionError,
    },
}
impl std::fmt::Debug for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
