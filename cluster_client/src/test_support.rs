//! An in-memory cluster for tests. Each address gets a scripted role-check
//! reply and scripted command replies, and every connect, probe and
//! disconnect is counted.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, Once},
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::subscriber::set_global_default;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

use crate::{
    connection::{Command, Connection, ConnectionError, Connector, Document},
    ServerAddress,
};

static TRACING: Once = Once::new();

/// Installs a subscriber once per test binary. Output is only shown when
/// `TEST_LOG` is set.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = LogTracer::init();
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));
        if std::env::var("TEST_LOG").is_ok() {
            let formatting_layer =
                BunyanFormattingLayer::new("cluster_client-tests".into(), std::io::stdout);
            let subscriber = Registry::default()
                .with(env_filter)
                .with(JsonStorageLayer)
                .with(formatting_layer);
            let _ = set_global_default(subscriber);
        } else {
            let formatting_layer =
                BunyanFormattingLayer::new("cluster_client-tests".into(), std::io::sink);
            let subscriber = Registry::default()
                .with(env_filter)
                .with(JsonStorageLayer)
                .with(formatting_layer);
            let _ = set_global_default(subscriber);
        }
    });
}

pub fn hosts(hosts: &[&str]) -> Vec<String> {
    hosts.iter().map(|h| format!("{}:27017", h)).collect()
}

pub fn hello_primary(set_name: &str, members: &[&str]) -> Value {
    json!({ "ok": 1, "ismaster": true, "setName": set_name, "hosts": hosts(members) })
}

pub fn hello_secondary(set_name: &str, members: &[&str]) -> Value {
    json!({ "ok": 1, "ismaster": false, "secondary": true, "setName": set_name, "hosts": hosts(members) })
}

pub fn hello_arbiter(set_name: &str, members: &[&str]) -> Value {
    json!({ "ok": 1, "arbiterOnly": true, "setName": set_name, "hosts": hosts(members) })
}

pub fn hello_standalone() -> Value {
    json!({ "ok": 1, "ismaster": true })
}

pub fn hello_mongos() -> Value {
    json!({ "ok": 1, "ismaster": true, "msg": "isdbgrid" })
}

#[derive(Debug, Default)]
struct MockServer {
    hello: Option<Value>,
    down: bool,
    delay: Duration,
    replies: HashMap<String, VecDeque<Value>>,
    commands: Vec<String>,
    connects: usize,
    probes: usize,
    disconnects: usize,
}

#[derive(Clone, Debug, Default)]
pub struct MockCluster {
    servers: Arc<Mutex<HashMap<ServerAddress, MockServer>>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Box<dyn Connector> {
        Box::new(MockConnector {
            cluster: self.clone(),
        })
    }

    fn with_server<R>(&self, address: &ServerAddress, f: impl FnOnce(&mut MockServer) -> R) -> R {
        let mut servers = self.servers.lock().unwrap();
        f(servers.entry(address.clone()).or_default())
    }

    pub fn set_reply(&self, address: &ServerAddress, hello: Value) {
        self.with_server(address, |s| {
            s.hello = Some(hello);
            s.down = false;
        });
    }

    pub fn set_down(&self, address: &ServerAddress) {
        self.with_server(address, |s| s.down = true);
    }

    pub fn set_up(&self, address: &ServerAddress) {
        self.with_server(address, |s| s.down = false);
    }

    pub fn set_delay(&self, address: &ServerAddress, delay: Duration) {
        self.with_server(address, |s| s.delay = delay);
    }

    /// Queues replies for a command. The last one keeps being returned once
    /// the queue is down to it.
    pub fn set_command_replies(&self, address: &ServerAddress, command: &str, replies: Vec<Value>) {
        self.with_server(address, |s| {
            s.replies.insert(command.to_string(), replies.into());
        });
    }

    pub fn connects(&self, address: &ServerAddress) -> usize {
        self.with_server(address, |s| s.connects)
    }

    pub fn probes(&self, address: &ServerAddress) -> usize {
        self.with_server(address, |s| s.probes)
    }

    pub fn disconnects(&self, address: &ServerAddress) -> usize {
        self.with_server(address, |s| s.disconnects)
    }

    /// Names of the non-hello commands a server received, in order.
    pub fn commands(&self, address: &ServerAddress) -> Vec<String> {
        self.with_server(address, |s| s.commands.clone())
    }
}

#[derive(Clone, Debug)]
struct MockConnector {
    cluster: MockCluster,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        address: &ServerAddress,
    ) -> Result<Box<dyn Connection>, ConnectionError> {
        let reachable = self.cluster.with_server(address, |s| {
            let reachable = s.hello.is_some() && !s.down;
            if reachable {
                s.connects += 1;
            }
            reachable
        });
        if !reachable {
            return Err(ConnectionError::ConnectionRefused(address.clone()));
        }
        Ok(Box::new(MockConnection {
            address: address.clone(),
            cluster: self.cluster.clone(),
            closed: false,
        }))
    }
}

#[derive(Debug)]
struct MockConnection {
    address: ServerAddress,
    cluster: MockCluster,
    closed: bool,
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&mut self, command: &Command) -> Result<Document, ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Socket("connection is closed".to_string()));
        }

        let delay = self.cluster.with_server(&self.address, |s| s.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let reply = self.cluster.with_server(&self.address, |s| {
            if s.down {
                return None;
            }
            if command.name() == "hello" {
                s.probes += 1;
                return s.hello.clone();
            }
            s.commands.push(command.name().to_string());
            let reply = match s.replies.get_mut(command.name()) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            };
            Some(reply.unwrap_or_else(|| json!({ "ok": 1 })))
        });

        match reply {
            Some(Value::Object(document)) => Ok(document),
            Some(other) => Err(ConnectionError::Protocol(format!("not a document: {}", other))),
            None => Err(ConnectionError::Socket(format!(
                "connection to {} reset by peer",
                self.address
            ))),
        }
    }

    async fn disconnect(&mut self) {
        if !self.closed {
            self.closed = true;
            self.cluster
                .with_server(&self.address, |s| s.disconnects += 1);
        }
    }
}
