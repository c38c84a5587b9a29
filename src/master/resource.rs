//! Persisted resource records and their key layout
//!
//! A record is JSON under `/resources/<name>`. Field names are kept in the
//! capitalised form already present in existing stores.

use serde::{Deserialize, Serialize};

use super::error::{MasterError, Result};

/// Prefix of every resource key
pub const RESOURCE_PATH: &str = "/resources";

/// Key all masters campaign on
pub const ELECTION_KEY: &str = "/resources/election";

/// Assignment record of one crawl task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(rename = "ID", default)]
    pub id: String,

    #[serde(rename = "Name")]
    pub name: String,

    /// `<nodeID>|<nodeAddress>`, empty while unassigned
    #[serde(rename = "AssignedNode", default)]
    pub assigned_node: String,

    /// Unix nanoseconds of the last assignment
    #[serde(rename = "CreationTime", default)]
    pub creation_time: i64,
}

impl ResourceSpec {
    /// An unassigned record
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn is_assigned(&self) -> bool {
        !self.assigned_node.is_empty()
    }

    /// Node ID of the assignment
    pub fn node_id(&self) -> Result<&str> {
        parse_assigned_node(&self.assigned_node).map(|(id, _)| id)
    }

    /// Store key of this record
    pub fn path(&self) -> String {
        resource_path(&self.name)
    }
}

pub fn resource_path(name: &str) -> String {
    format!("{RESOURCE_PATH}/{name}")
}

pub fn encode_assigned_node(node_id: &str, address: &str) -> String {
    format!("{node_id}|{address}")
}

/// Split an assignment into node ID and address
pub fn parse_assigned_node(assigned: &str) -> Result<(&str, &str)> {
    match assigned.split_once('|') {
        Some((id, address)) if !id.is_empty() => Ok((id, address)),
        _ => Err(MasterError::InvalidAssignedNode(assigned.to_string())),
    }
}
