use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One immutable version of a replicated record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordVersion {
    pub version_id: String,
    pub origin_node: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

impl RecordVersion {
    pub fn new(origin_node: impl Into<String>, data: Value) -> Self {
        Self {
            version_id: Uuid::new_v4().to_string(),
            origin_node: origin_node.into(),
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn stamp(&self) -> VersionStamp {
        VersionStamp {
            timestamp: self.timestamp,
            origin_node: self.origin_node.clone(),
            version_id: self.version_id.clone(),
        }
    }
}

/// Conflict-resolution key. Later timestamp wins; equal timestamps fall back
/// to origin id then version id, so every node derives the same winner.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionStamp {
    pub timestamp: DateTime<Utc>,
    pub origin_node: String,
    pub version_id: String,
}

/// Unit of replication pushed between storage peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationPackage {
    pub data_id: String,
    pub version: RecordVersion,
}

/// Append-only in-memory version store. Every write adds a version to the
/// record's history; nothing is ever rewritten in place.
#[derive(Debug, Default)]
pub struct VersionStore {
    records: HashMap<String, Vec<RecordVersion>>,
}

impl VersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, data_id: &str, version: RecordVersion) {
        self.records
            .entry(data_id.to_string())
            .or_default()
            .push(version);
    }

    /// The winning version of a record under the conflict-resolution order.
    pub fn current(&self, data_id: &str) -> Option<&RecordVersion> {
        self.records
            .get(data_id)?
            .iter()
            .max_by_key(|version| version.stamp())
    }

    /// Full history in arrival order.
    pub fn history(&self, data_id: &str) -> Option<&[RecordVersion]> {
        self.records.get(data_id).map(Vec::as_slice)
    }

    /// Newest stamp per record, the shape exchanged during anti-entropy.
    pub fn summary(&self) -> HashMap<String, VersionStamp> {
        self.records
            .iter()
            .filter_map(|(data_id, versions)| {
                versions
                    .iter()
                    .map(RecordVersion::stamp)
                    .max()
                    .map(|stamp| (data_id.clone(), stamp))
            })
            .collect()
    }

    /// Equality match over the current version of each record. The query
    /// must be a JSON object; every query field must be present and equal in
    /// the record's data.
    pub fn find(&self, query: &Value) -> Vec<(String, RecordVersion)> {
        let Some(fields) = query.as_object() else {
            return Vec::new();
        };
        self.records
            .keys()
            .filter_map(|data_id| {
                let current = self.current(data_id)?;
                let data = current.data.as_object()?;
                let matches = fields
                    .iter()
                    .all(|(key, want)| data.get(key) == Some(want));
                matches.then(|| (data_id.clone(), current.clone()))
            })
            .collect()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }
}
