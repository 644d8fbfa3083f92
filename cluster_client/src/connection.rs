//! The transport seam.
//!
//! Encoding commands onto the wire and managing sockets belong to whoever
//! implements these traits. The topology core only needs to open a
//! connection to an address, send a command document and get a reply
//! document back, and it needs to be able to tell a transport failure apart
//! from everything else.

use std::fmt::Debug;

use async_trait::async_trait;
use dyn_clone::DynClone;
use serde_json::{Map, Value};

use crate::{error_chain_fmt, ServerAddress};

/// A command or reply body. The first key of a command is its name.
pub type Document = Map<String, Value>;

/// A command addressed to one database.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub database: String,
    pub body: Document,
}

impl Command {
    pub fn new(database: &str, body: Document) -> Self {
        Self {
            database: database.to_string(),
            body,
        }
    }

    /// The role-check command sent by every monitor.
    pub fn hello() -> Self {
        let mut body = Document::new();
        body.insert("hello".to_string(), Value::from(1));
        Self::new("admin", body)
    }

    /// Returns the command name, which is the first key of the body.
    pub fn name(&self) -> &str {
        self.body.keys().next().map(String::as_str).unwrap_or_default()
    }
}

/// Opens connections. Cloned into every monitor and into the executor.
#[async_trait]
pub trait Connector: DynClone + Debug + Send + Sync {
    async fn connect(&self, address: &ServerAddress)
        -> Result<Box<dyn Connection>, ConnectionError>;
}
dyn_clone::clone_trait_object!(Connector);

/// One open connection to one server.
#[async_trait]
pub trait Connection: Debug + Send + Sync {
    async fn send(&mut self, command: &Command) -> Result<Document, ConnectionError>;

    /// Closes the connection. Must be safe to call more than once.
    async fn disconnect(&mut self);
}

#[derive(thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection to {0} was refused")]
    ConnectionRefused(ServerAddress),
    #[error("I/O error talking to the server")]
    Io(#[from] std::io::Error),
    #[error("Socket error: {0}")]
    Socket(String),
    #[error("Timed out talking to {0}")]
    Timeout(ServerAddress),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}
impl std::fmt::Debug for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl ConnectionError {
    /// True for the connectivity class: the server may be fine again after a
    /// reconnect or an election, so callers may retry.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ConnectionError::ConnectionRefused(_)
                | ConnectionError::Io(_)
                | ConnectionError::Socket(_)
                | ConnectionError::Timeout(_)
        )
    }
}
