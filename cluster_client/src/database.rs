//! Databases, collections and cursors: thin wrappers that turn user calls
//! into [`Operation`]s and hand them to the [`OperationExecutor`].

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::instrument;

use crate::{
    connection::{Connection, ConnectionError, Document},
    Operation, OperationError, OperationExecutor, PinnedReply, ReadPreference, ServerAddress,
};

#[derive(Clone, Debug)]
pub struct Database {
    name: String,
    executor: OperationExecutor,
    read_preference: ReadPreference,
}

impl Database {
    pub(crate) fn new(name: &str, executor: OperationExecutor, read_preference: ReadPreference) -> Self {
        Self {
            name: name.to_string(),
            executor,
            read_preference,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs a command with the database's read preference. Commands that
    /// write are sent to the primary whatever the preference says.
    pub async fn command(&self, body: Value) -> Result<Document, OperationError> {
        self.command_with_read(body, &self.read_preference).await
    }

    #[instrument(level = "debug", name = "Database - Command", skip(self), fields(database = %self.name))]
    pub async fn command_with_read(
        &self,
        body: Value,
        read_preference: &ReadPreference,
    ) -> Result<Document, OperationError> {
        let operation = Operation::command(&self.name, body)?;
        self.executor.run(&operation, read_preference).await
    }

    pub fn collection(&self, name: &str) -> Collection {
        Collection {
            database: self.name.clone(),
            name: name.to_string(),
            executor: self.executor.clone(),
            read_preference: self.read_preference.clone(),
            batch_size: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Collection {
    database: String,
    name: String,
    executor: OperationExecutor,
    read_preference: ReadPreference,
    batch_size: Option<u32>,
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn with_read_preference(mut self, read_preference: ReadPreference) -> Self {
        self.read_preference = read_preference;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Inserts one document on the primary. Returns the number inserted.
    pub async fn insert_one(&self, document: Value) -> Result<u64, OperationError> {
        self.insert_many(vec![document]).await
    }

    #[instrument(level = "debug", name = "Collection - Insert", skip(self, documents), fields(collection = %self.name))]
    pub async fn insert_many(&self, documents: Vec<Value>) -> Result<u64, OperationError> {
        let operation = Operation::insert(&self.database, &self.name, documents)?;
        let reply = self
            .executor
            .run(&operation, &ReadPreference::primary())
            .await?;
        Ok(reply.get("n").and_then(Value::as_u64).unwrap_or_default())
    }

    #[instrument(level = "debug", name = "Collection - Count", skip(self), fields(collection = %self.name))]
    pub async fn count(&self, filter: Value) -> Result<u64, OperationError> {
        let operation = Operation::count(&self.database, &self.name, filter)?;
        let reply = self.executor.run(&operation, &self.read_preference).await?;
        Ok(reply.get("n").and_then(Value::as_u64).unwrap_or_default())
    }

    /// Starts a query. The returned cursor stays on the server that answered
    /// the first batch.
    #[instrument(level = "debug", name = "Collection - Find", skip(self), fields(collection = %self.name))]
    pub async fn find(&self, filter: Value) -> Result<Cursor, OperationError> {
        let operation = Operation::find(&self.database, &self.name, filter, self.batch_size)?;
        let pinned = self
            .executor
            .run_pinned(&operation, &self.read_preference, None)
            .await?;
        Cursor::open(
            pinned,
            &self.database,
            &self.name,
            self.batch_size,
            self.executor.conventions().socket_timeout(),
        )
    }

    /// Reads a whole result set. A transient failure part way through
    /// restarts the query from the beginning, up to `max_retries` times.
    pub async fn find_to_vec(&self, filter: Value) -> Result<Vec<Value>, OperationError> {
        let conventions = self.executor.conventions();
        let mut restarts = 0;
        loop {
            let mut cursor = self.find(filter.clone()).await?;
            let address = cursor.address().clone();
            let error = match cursor.collect_remaining().await {
                Ok(documents) => return Ok(documents),
                Err(e) if e.is_retryable() && restarts < conventions.max_retries() => e,
                Err(e) => return Err(e),
            };

            restarts += 1;
            tracing::warn!(
                "Restarting query on `{}` after a broken stream from {}. Caused by: {}",
                self.name,
                address,
                error
            );
            self.executor.topology().disconnect(&address).await?;
            tokio::time::sleep(conventions.retry_backoff()).await;
            self.executor.topology().scan().await?;
        }
    }
}

#[derive(Deserialize)]
struct CursorReply {
    cursor: CursorBody,
}

#[derive(Deserialize)]
struct CursorBody {
    id: i64,
    #[serde(rename = "firstBatch", alias = "nextBatch", default)]
    batch: Vec<Value>,
}

fn parse_cursor_reply(reply: Document) -> Result<CursorBody, OperationError> {
    serde_json::from_value::<CursorReply>(Value::Object(reply))
        .map(|r| r.cursor)
        .map_err(|e| anyhow::anyhow!("Malformed cursor reply. Caused by: {}", e).into())
}

/**
A server-side result set, read one batch at a time.

A cursor is bound to the server and connection that answered its first
batch; `getMore` never goes anywhere else. If that connection breaks, the
cursor is abandoned: the error is returned once and every later call yields
`None`. Dropping a cursor drops its connection.
*/
#[derive(Debug)]
pub struct Cursor {
    address: ServerAddress,
    connection: Option<Box<dyn Connection>>,
    database: String,
    collection: String,
    id: i64,
    batch_size: Option<u32>,
    first_batch: Option<Vec<Value>>,
    socket_timeout: Duration,
}

impl Cursor {
    fn open(
        pinned: PinnedReply,
        database: &str,
        collection: &str,
        batch_size: Option<u32>,
        socket_timeout: Duration,
    ) -> Result<Self, OperationError> {
        let PinnedReply {
            address,
            connection,
            reply,
        } = pinned;
        let body = parse_cursor_reply(reply)?;
        Ok(Self {
            address,
            connection: Some(connection),
            database: database.to_string(),
            collection: collection.to_string(),
            id: body.id,
            batch_size,
            first_batch: Some(body.batch),
            socket_timeout,
        })
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// False once the server has no more results or the cursor was
    /// abandoned or killed.
    pub fn is_open(&self) -> bool {
        self.id != 0 && self.connection.is_some()
    }

    /// Returns the next batch, or `None` once the cursor is exhausted.
    #[instrument(level = "debug", name = "Cursor - Next Batch", skip(self), fields(address = %self.address))]
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Value>>, OperationError> {
        if let Some(batch) = self.first_batch.take() {
            if !batch.is_empty() || self.id == 0 {
                if self.id == 0 {
                    self.release().await;
                }
                return Ok(Some(batch));
            }
        }
        if !self.is_open() {
            self.release().await;
            return Ok(None);
        }

        let operation =
            Operation::get_more(&self.database, &self.collection, self.id, self.batch_size)?;
        let result = match self.connection.as_mut() {
            Some(connection) => tokio::time::timeout(
                self.socket_timeout,
                connection.send(operation.as_command()),
            )
            .await
            .unwrap_or_else(|_| Err(ConnectionError::Timeout(self.address.clone()))),
            None => return Ok(None),
        };
        let reply = match result {
            Ok(reply) => reply,
            Err(source) => {
                self.abandon().await;
                return Err(OperationError::Connection {
                    address: self.address.clone(),
                    source,
                });
            }
        };

        let body = match operation.check_reply(reply).and_then(parse_cursor_reply) {
            Ok(body) => body,
            Err(e) => {
                self.abandon().await;
                return Err(e);
            }
        };
        self.id = body.id;
        if self.id == 0 {
            self.release().await;
        }
        Ok(Some(body.batch))
    }

    /// Drains every remaining batch.
    pub async fn collect_remaining(&mut self) -> Result<Vec<Value>, OperationError> {
        let mut documents = Vec::new();
        while let Some(batch) = self.next_batch().await? {
            documents.extend(batch);
        }
        Ok(documents)
    }

    /// Tells the server to discard the cursor and closes the connection.
    #[instrument(level = "debug", name = "Cursor - Kill", skip(self), fields(address = %self.address))]
    pub async fn kill(&mut self) {
        if self.is_open() {
            let kill = Operation::kill_cursors(&self.database, &self.collection, self.id);
            if let (Ok(kill), Some(connection)) = (kill, self.connection.as_mut()) {
                if let Err(e) = connection.send(kill.as_command()).await {
                    tracing::debug!("killCursors failed on {}. Caused by: {}", self.address, e);
                }
            }
        }
        self.id = 0;
        self.first_batch = None;
        self.release().await;
    }

    async fn abandon(&mut self) {
        tracing::warn!(
            "Abandoning cursor {} on {} after a broken stream",
            self.id,
            self.address
        );
        self.id = 0;
        self.release().await;
    }

    async fn release(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.disconnect().await;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use serde_json::json;

    use super::*;
    use crate::{
        test_support::{hello_primary, hello_secondary, init_tracing, MockCluster},
        Client, Conventions,
    };

    fn address(host: &str) -> ServerAddress {
        ServerAddress::new(host, 27017)
    }

    async fn client(cluster: &MockCluster) -> Client {
        cluster.set_reply(&address("a"), hello_primary("rs0", &["a", "b"]));
        cluster.set_reply(&address("b"), hello_secondary("rs0", &["a", "b"]));
        let client = Client::builder()
            .set_seeds(&["a"])
            .set_replica_set("rs0")
            .set_connector(cluster.connector())
            .set_conventions(Conventions::default().set_disable_topology_updates(true))
            .build()
            .unwrap();
        client.topology().scan().await.unwrap();
        client
    }

    fn first_batch(id: i64, documents: Vec<Value>) -> Value {
        json!({ "ok": 1, "cursor": { "id": id, "ns": "test.people", "firstBatch": documents } })
    }

    fn next_batch(id: i64, documents: Vec<Value>) -> Value {
        json!({ "ok": 1, "cursor": { "id": id, "ns": "test.people", "nextBatch": documents } })
    }

    #[tokio::test]
    async fn cursor_stays_on_its_server_until_exhausted() {
        // Arrange
        init_tracing();
        let cluster = MockCluster::new();
        let client = client(&cluster).await;
        cluster.set_command_replies(&address("b"), "find", vec![first_batch(42, vec![json!(1), json!(2)])]);
        cluster.set_command_replies(&address("b"), "getMore", vec![next_batch(0, vec![json!(3)])]);
        let people = client
            .database("test")
            .collection("people")
            .with_read_preference(ReadPreference::secondary());

        // Act
        let mut cursor = people.find(json!({})).await.unwrap();
        let documents = cursor.collect_remaining().await.unwrap();

        // Assert
        assert_eq!(documents, vec![json!(1), json!(2), json!(3)]);
        assert_eq!(cursor.address(), &address("b"));
        assert!(!cursor.is_open());
        assert_eq!(cluster.commands(&address("b")), vec!["find", "getMore"]);
        assert!(cluster.commands(&address("a")).is_empty());
        assert_eq!(cluster.disconnects(&address("b")), 1);
    }

    #[tokio::test]
    async fn broken_stream_abandons_the_cursor() {
        init_tracing();
        let cluster = MockCluster::new();
        let client = client(&cluster).await;
        cluster.set_command_replies(&address("a"), "find", vec![first_batch(42, vec![json!(1)])]);
        let people = client.database("test").collection("people");

        let mut cursor = people.find(json!({})).await.unwrap();
        assert_eq!(cursor.next_batch().await.unwrap(), Some(vec![json!(1)]));
        cluster.set_down(&address("a"));
        let broken = cursor.next_batch().await;
        let after = cursor.next_batch().await;

        assert!(matches!(broken, Err(OperationError::Connection { .. })));
        assert_eq!(after.unwrap(), None);
        assert!(!cursor.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_get_more_times_out_and_abandons_the_cursor() {
        init_tracing();
        let cluster = MockCluster::new();
        let client = client(&cluster).await;
        cluster.set_command_replies(&address("a"), "find", vec![first_batch(42, vec![json!(1)])]);
        let people = client.database("test").collection("people");

        let mut cursor = people.find(json!({})).await.unwrap();
        assert_eq!(cursor.next_batch().await.unwrap(), Some(vec![json!(1)]));
        cluster.set_delay(&address("a"), Duration::from_secs(10_000));
        let started = tokio::time::Instant::now();
        let hung = cursor.next_batch().await;

        assert!(matches!(
            hung,
            Err(OperationError::Connection {
                source: ConnectionError::Timeout(_),
                ..
            })
        ));
        assert_eq!(started.elapsed(), Conventions::default().socket_timeout());
        assert!(!cursor.is_open());
    }

    #[tokio::test]
    async fn kill_discards_the_server_cursor() {
        init_tracing();
        let cluster = MockCluster::new();
        let client = client(&cluster).await;
        cluster.set_command_replies(&address("a"), "find", vec![first_batch(42, vec![json!(1)])]);
        let people = client.database("test").collection("people");

        let mut cursor = people.find(json!({})).await.unwrap();
        cursor.kill().await;

        assert_eq!(cluster.commands(&address("a")), vec!["find", "killCursors"]);
        assert_eq!(cursor.next_batch().await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn find_to_vec_restarts_the_whole_stream_after_a_transient_failure() {
        // Arrange
        init_tracing();
        let cluster = MockCluster::new();
        let client = client(&cluster).await;
        cluster.set_command_replies(&address("a"), "find", vec![first_batch(42, vec![json!(1)])]);
        cluster.set_command_replies(
            &address("a"),
            "getMore",
            vec![
                json!({ "ok": 0, "code": 91, "errmsg": "shutdown in progress" }),
                next_batch(0, vec![json!(2)]),
            ],
        );
        let people = client.database("test").collection("people");

        // Act
        let documents = people.find_to_vec(json!({})).await.unwrap();

        // Assert
        assert_eq!(documents, vec![json!(1), json!(2)]);
        assert_eq!(
            cluster.commands(&address("a")),
            vec!["find", "getMore", "find", "getMore"]
        );
    }

    #[tokio::test]
    async fn inserts_always_go_to_the_primary() {
        init_tracing();
        let cluster = MockCluster::new();
        let client = client(&cluster).await;
        cluster.set_command_replies(&address("a"), "insert", vec![json!({ "ok": 1, "n": 2 })]);
        let people = client
            .database("test")
            .collection("people")
            .with_read_preference(ReadPreference::secondary());

        let inserted = people
            .insert_many(vec![json!({ "name": "ada" }), json!({ "name": "alan" })])
            .await
            .unwrap();

        assert_eq!(inserted, 2);
        assert_eq!(cluster.commands(&address("a")), vec!["insert"]);
        assert!(cluster.commands(&address("b")).is_empty());
    }

    #[tokio::test]
    async fn count_follows_the_read_preference() {
        init_tracing();
        let cluster = MockCluster::new();
        let client = client(&cluster).await;
        cluster.set_command_replies(&address("b"), "count", vec![json!({ "ok": 1, "n": 7 })]);
        let people = client
            .database("test")
            .collection("people")
            .with_read_preference(ReadPreference::secondary());

        assert_eq!(people.count(json!({ "age": { "$gt": 30 } })).await.unwrap(), 7);
        assert_eq!(cluster.commands(&address("b")), vec!["count"]);
    }

    #[tokio::test]
    async fn database_command_uses_the_inherited_read_preference() {
        init_tracing();
        let cluster = MockCluster::new();
        let client = client(&cluster).await;
        let database = client.database("test");

        database.command(json!({ "dbStats": 1 })).await.unwrap();
        database
            .command_with_read(json!({ "dbStats": 1 }), &ReadPreference::secondary())
            .await
            .unwrap();

        assert_eq!(cluster.commands(&address("a")), vec!["dbStats"]);
        assert_eq!(cluster.commands(&address("b")), vec!["dbStats"]);
    }
}
