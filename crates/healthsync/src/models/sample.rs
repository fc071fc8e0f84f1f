//! Health samples as returned by a health source

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{Cursor, DataTypeId};

/// Where a sample was recorded
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// Human-readable source name (app or device)
    pub name: String,
    /// Bundle identifier / package name of the writing app
    pub bundle_id: Option<String>,
    /// Device model, if the source reports one
    pub device: Option<String>,
}

/// A single health sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Source-assigned unique id (used as `uid` on the wire)
    pub id: String,
    pub type_id: DataTypeId,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Type-specific values, already extracted into plain JSON
    pub value_fields: BTreeMap<String, serde_json::Value>,
    pub source: SourceInfo,
}

impl Sample {
    pub fn new(id: impl Into<String>, type_id: DataTypeId, start_time: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            type_id,
            start_time,
            end_time: None,
            value_fields: BTreeMap::new(),
            source: SourceInfo::default(),
        }
    }

    pub fn with_end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.value_fields.insert(key.into(), value.into());
        self
    }

    pub fn with_source(mut self, source: SourceInfo) -> Self {
        self.source = source;
        self
    }
}

/// Parameters for one read against a health source
#[derive(Debug, Clone, PartialEq)]
pub struct ReadRequest {
    pub type_id: DataTypeId,
    /// Resume position; `None` reads from `since` (or the beginning)
    pub cursor: Option<Cursor>,
    /// Lower time bound for reads without a cursor
    pub since: Option<DateTime<Utc>>,
    /// Maximum number of samples to return
    pub limit: Option<usize>,
}

/// Result of a read: new samples and the position after them
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadBatch {
    pub samples: Vec<Sample>,
    pub new_cursor: Option<Cursor>,
}

impl ReadBatch {
    pub fn new(samples: Vec<Sample>, new_cursor: Option<Cursor>) -> Self {
        Self { samples, new_cursor }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
