//! Operations are the only way user work reaches a server.
//!
//! An [`Operation`] wraps the command document together with what the
//! executor needs to route it: whether it may run on a secondary. Commands
//! are routed to the primary unless they are known to be read-only.
use serde_json::{json, Value};

use crate::{
    connection::{Command, Document},
    OperationError,
};

/// Commands that only read and may follow the read preference to a
/// secondary. Everything else needs the primary.
const SECONDARY_OK_COMMANDS: &[&str] = &[
    "aggregate",
    "buildinfo",
    "buildInfo",
    "collStats",
    "count",
    "dbStats",
    "distinct",
    "find",
    "geoNear",
    "getMore",
    "hello",
    "isMaster",
    "ismaster",
    "listCollections",
    "listIndexes",
    "ping",
    "serverStatus",
];

/// Server error codes meaning "this server is not (or no longer) primary".
const NOT_PRIMARY_CODES: &[i64] = &[10107, 13435, 11602, 189, 91];

#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    command: Command,
    secondary_ok: bool,
}

impl Operation {
    /// A database command. The first key of `body` names the command.
    pub fn command(database: &str, body: Value) -> Result<Self, OperationError> {
        let body = into_document(body)?;
        let command = Command::new(database, body);
        let secondary_ok = SECONDARY_OK_COMMANDS.contains(&command.name());
        Ok(Self {
            command,
            secondary_ok,
        })
    }

    /// The initial query of a cursor.
    pub fn find(database: &str, collection: &str, filter: Value, batch_size: Option<u32>) -> Result<Self, OperationError> {
        let mut body = json!({ "find": collection, "filter": filter });
        if let Some(batch_size) = batch_size {
            body["batchSize"] = json!(batch_size);
        }
        Self::command(database, body)
    }

    pub fn count(database: &str, collection: &str, filter: Value) -> Result<Self, OperationError> {
        Self::command(database, json!({ "count": collection, "query": filter }))
    }

    pub fn insert(database: &str, collection: &str, documents: Vec<Value>) -> Result<Self, OperationError> {
        Self::command(
            database,
            json!({ "insert": collection, "documents": documents, "ordered": true }),
        )
    }

    pub fn get_more(database: &str, collection: &str, cursor_id: i64, batch_size: Option<u32>) -> Result<Self, OperationError> {
        let mut body = json!({ "getMore": cursor_id, "collection": collection });
        if let Some(batch_size) = batch_size {
            body["batchSize"] = json!(batch_size);
        }
        Self::command(database, body)
    }

    pub fn kill_cursors(database: &str, collection: &str, cursor_id: i64) -> Result<Self, OperationError> {
        Self::command(
            database,
            json!({ "killCursors": collection, "cursors": [cursor_id] }),
        )
    }

    pub fn name(&self) -> &str {
        self.command.name()
    }

    pub fn database(&self) -> &str {
        &self.command.database
    }

    pub fn as_command(&self) -> &Command {
        &self.command
    }

    /// Whether a secondary may serve this operation.
    pub fn secondary_ok(&self) -> bool {
        self.secondary_ok
    }

    /// Checks a reply for a command failure.
    pub fn check_reply(&self, reply: Document) -> Result<Document, OperationError> {
        let ok = reply.get("ok").and_then(Value::as_f64).unwrap_or(0.0);
        if ok == 1.0 {
            return Ok(reply);
        }

        let code = reply.get("code").and_then(Value::as_i64).unwrap_or(0);
        let message = reply
            .get("errmsg")
            .and_then(Value::as_str)
            .unwrap_or("no error message")
            .to_string();

        let lowered = message.to_lowercase();
        if NOT_PRIMARY_CODES.contains(&code)
            || lowered.contains("not master")
            || lowered.contains("not primary")
        {
            return Err(OperationError::NotPrimary { code, message });
        }
        Err(OperationError::CommandFailed {
            command: self.name().to_string(),
            code,
            message,
        })
    }
}

fn into_document(body: Value) -> Result<Document, OperationError> {
    match body {
        Value::Object(document) if !document.is_empty() => Ok(document),
        other => Err(OperationError::InvalidCommand(other.to_string())),
    }
}
