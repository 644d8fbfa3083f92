/*!
cluster_client is the topology and failover core of a client for a replicated
document database.

It discovers which endpoints belong to a cluster, keeps probing them for their
role (primary, secondary, arbiter, standalone, router or hidden), selects an
endpoint for every operation according to a [`ReadPreference`], and retries
operations across elections, restarts and network blips with a bounded number
of rescans.

The library requires tokio. Like the document store it grew out of, the
[`Topology`] is an actor: a single background task owns every monitor and every
server description, and cheap cloneable handles talk to it over channels.
Readers never wait for a scan to finish; they get a copy-on-read
[`TopologySnapshot`] of the last completed scan.

The wire protocol is not part of this crate. Plug a transport in through the
[`Connector`](connection::Connector) and [`Connection`](connection::Connection)
traits.

# Example
```rust,no_run
# async fn run(connector: Box<dyn cluster_client::connection::Connector>) -> anyhow::Result<()> {
use cluster_client::{ClientBuilder, ReadPreference};
use serde_json::json;

let client = ClientBuilder::new()
    .set_connection_string("mongodb://db1:27017,db2:27017/test?replicaSet=rs0")
    .set_connector(connector)
    .build()?;

client.topology().scan().await?;
let stats = client
    .database("test")
    .command_with_read(json!({ "dbStats": 1 }), &ReadPreference::secondary_preferred())
    .await?;
println!("{:?}", stats);
# Ok(())
# }
```
*/

mod address;
mod client;
mod connection_string;
mod conventions;
mod database;
mod events;
mod hello;
mod operation_executor;
mod read_preference;
mod server_description;
mod server_monitor;
mod server_selector;
mod topology;

pub mod connection;
pub mod operation;
pub mod orchestration;

#[cfg(test)]
mod test_support;

pub use address::*;
pub use client::*;
pub use connection_string::*;
pub use conventions::*;
pub use database::*;
pub use events::*;
pub use hello::*;
pub use operation::Operation;
pub use operation_executor::*;
pub use read_preference::*;
pub use server_description::*;
pub use server_monitor::*;
pub use server_selector::*;
pub use topology::*;

pub fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{}", cause)?;
        current = cause.source();
    }
    Ok(())
}
