use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::time::Instant;
use tracing::{instrument, Span};

use crate::{
    connection::{Connection, ConnectionError, Connector, Document},
    AttemptOutcome, Conventions, Operation, OperationContext, OperationError, ReadMode,
    ReadPreference, ServerAddress, ServerDescription, ServerSelector, Topology, TopologyMode,
};

/// A reply together with the connection and server that produced it. Cursors
/// keep both for their lifetime.
#[derive(Debug)]
pub struct PinnedReply {
    pub address: ServerAddress,
    pub connection: Box<dyn Connection>,
    pub reply: Document,
}

/// Runs operations against the topology: select, execute, and on a transient
/// failure disconnect, back off, rescan and select again, a bounded number of
/// times.
#[derive(Clone, Debug)]
pub struct OperationExecutor {
    topology: Topology,
    connector: Box<dyn Connector>,
    selector: ServerSelector,
    conventions: Conventions,
}

impl OperationExecutor {
    pub fn new(topology: Topology, connector: Box<dyn Connector>, conventions: Conventions) -> Self {
        Self {
            topology,
            connector,
            selector: ServerSelector::new(conventions.local_threshold()),
            conventions,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn conventions(&self) -> &Conventions {
        &self.conventions
    }

    /// Runs one operation and returns its reply.
    pub async fn run(
        &self,
        operation: &Operation,
        preference: &ReadPreference,
    ) -> Result<Document, OperationError> {
        self.run_with_deadline(operation, preference, None).await
    }

    /// Like [`OperationExecutor::run`], but gives up instead of backing off
    /// past `deadline`.
    pub async fn run_with_deadline(
        &self,
        operation: &Operation,
        preference: &ReadPreference,
        deadline: Option<Instant>,
    ) -> Result<Document, OperationError> {
        let mut pinned = self.run_pinned(operation, preference, deadline).await?;
        pinned.connection.disconnect().await;
        Ok(pinned.reply)
    }

    /// Runs one operation and hands back the connection it ran on, so a
    /// cursor can keep talking to the same server.
    #[instrument(
        level = "debug",
        name = "Operation Executor - Run",
        skip(self, operation),
        fields(command = %operation.name(), operation_id)
    )]
    pub async fn run_pinned(
        &self,
        operation: &Operation,
        preference: &ReadPreference,
        deadline: Option<Instant>,
    ) -> Result<PinnedReply, OperationError> {
        let mut context = OperationContext::new(deadline);
        Span::current().record("operation_id", context.operation_id.to_string());

        loop {
            let outcome = AttemptOutcome::from(self.attempt(&mut context, operation, preference).await);
            let error = match outcome {
                AttemptOutcome::Success(pinned) => return Ok(pinned),
                AttemptOutcome::Fatal(e) => return Err(e),
                AttemptOutcome::Retryable(e) => e,
            };

            if let Some(address) = context.selected.take() {
                self.topology.disconnect(&address).await?;
            }

            context.retry_count += 1;
            if context.retry_count > self.conventions.max_retries() {
                tracing::warn!(
                    "Giving up on `{}` after {} retries. Caused by: {}",
                    operation.name(),
                    self.conventions.max_retries(),
                    error
                );
                return Err(error);
            }

            let backoff = self.conventions.retry_backoff();
            if context.would_overrun(backoff) {
                return Err(OperationError::DeadlineExceeded {
                    last_error: Box::new(error),
                });
            }

            tracing::warn!(
                "Retry {} of `{}` in {:?}. Caused by: {}",
                context.retry_count,
                operation.name(),
                backoff,
                error
            );
            tokio::time::sleep(backoff).await;
            self.topology.scan().await?;
        }
    }

    /// Select, then execute. One pass of the retry loop.
    async fn attempt(
        &self,
        context: &mut OperationContext,
        operation: &Operation,
        preference: &ReadPreference,
    ) -> Result<PinnedReply, OperationError> {
        let snapshot = self.topology.snapshot();
        let candidates = self.selector.select(preference, snapshot.descriptions());
        let candidate = pick(preference.mode(), candidates).ok_or(OperationError::NoEligibleServer {
            read_mode: preference.mode(),
        })?;

        let mut address = candidate.address().clone();
        if !operation.secondary_ok()
            && !candidate.role().is_primary_like()
            && self.conventions.reroute_to_primary()
            && snapshot.mode() != TopologyMode::Standalone
        {
            tracing::warn!(
                "Database command '{}' rerouted to primary server",
                operation.name()
            );
            address = self
                .selector
                .select(&ReadPreference::primary(), snapshot.descriptions())
                .into_iter()
                .next()
                .map(|primary| primary.address().clone())
                .ok_or(OperationError::NoPrimary)?;
        }
        context.selected = Some(address.clone());
        tracing::debug!("Sending `{}` to {}", operation.name(), address);

        let mut connection = self.connect(&address, context.deadline).await?;
        let limit = within_deadline(self.conventions.socket_timeout(), context.deadline);
        let sent = tokio::time::timeout(limit, connection.send(operation.as_command()))
            .await
            .unwrap_or_else(|_| Err(ConnectionError::Timeout(address.clone())));
        let reply = match sent {
            Ok(reply) => reply,
            Err(source) => {
                connection.disconnect().await;
                return Err(OperationError::Connection { address, source });
            }
        };

        match operation.check_reply(reply) {
            Ok(reply) => Ok(PinnedReply {
                address,
                connection,
                reply,
            }),
            Err(e) => {
                connection.disconnect().await;
                Err(e)
            }
        }
    }

    async fn connect(
        &self,
        address: &ServerAddress,
        deadline: Option<Instant>,
    ) -> Result<Box<dyn Connection>, OperationError> {
        let limit = within_deadline(self.conventions.connect_timeout(), deadline);
        let connected = tokio::time::timeout(limit, self.connector.connect(address))
            .await
            .unwrap_or_else(|_| Err(ConnectionError::Timeout(address.clone())));
        connected.map_err(|source| OperationError::Connection {
            address: address.clone(),
            source,
        })
    }
}

/// Shortens `limit` to whatever is left before `deadline`.
fn within_deadline(limit: Duration, deadline: Option<Instant>) -> Duration {
    match deadline {
        Some(deadline) => limit.min(deadline.saturating_duration_since(Instant::now())),
        None => limit,
    }
}

/// `Nearest` spreads load across the whole latency window; every other mode
/// takes the head of the list.
fn pick(mode: ReadMode, candidates: Vec<ServerDescription>) -> Option<ServerDescription> {
    match mode {
        ReadMode::Nearest => candidates.choose(&mut rand::thread_rng()).cloned(),
        _ => candidates.into_iter().next(),
    }
}
