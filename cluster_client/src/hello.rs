use std::collections::BTreeMap;

use serde::Deserialize;

use crate::{connection::Document, ServerAddress, ServerRole};

/// The reply to the role-check command.
///
/// Older servers answer with `ismaster`, newer ones with `isWritablePrimary`;
/// both are accepted.
#[derive(Debug, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HelloReply {
    #[serde(default)]
    pub ok: f64,
    #[serde(default, alias = "ismaster")]
    pub is_writable_primary: bool,
    #[serde(default)]
    pub secondary: bool,
    #[serde(default)]
    pub arbiter_only: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub set_name: Option<String>,
    #[serde(default)]
    pub hosts: Vec<ServerAddress>,
    #[serde(default)]
    pub passives: Vec<ServerAddress>,
    #[serde(default)]
    pub arbiters: Vec<ServerAddress>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub primary: Option<ServerAddress>,
}

impl HelloReply {
    pub fn from_document(document: Document) -> serde_json::Result<Self> {
        serde_json::from_value(serde_json::Value::Object(document))
    }

    pub fn is_ok(&self) -> bool {
        self.ok == 1.0
    }

    pub fn role(&self) -> ServerRole {
        if !self.is_ok() {
            ServerRole::Unknown
        } else if self.msg.as_deref() == Some("isdbgrid") {
            ServerRole::Mongos
        } else if self.is_writable_primary && self.set_name.is_some() {
            ServerRole::Primary
        } else if self.is_writable_primary {
            ServerRole::Standalone
        } else if self.hidden {
            ServerRole::Hidden
        } else if self.secondary {
            ServerRole::Secondary
        } else if self.arbiter_only {
            ServerRole::Arbiter
        } else {
            ServerRole::Unknown
        }
    }

    /// Every member this server knows about.
    pub fn all_hosts(&self) -> impl Iterator<Item = &ServerAddress> {
        self.hosts
            .iter()
            .chain(self.passives.iter())
            .chain(self.arbiters.iter())
    }
}
