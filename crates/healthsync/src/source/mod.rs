//! Health source adapter abstraction
//!
//! A health source is the platform store (HealthKit, Samsung Health, ...)
//! seen as a capability: given a type and an optional cursor, return the
//! samples after that cursor and a new cursor.

mod memory;

use anyhow::Result;

use crate::models::{DataTypeId, ReadBatch, ReadRequest};

pub use memory::InMemoryHealthSource;

/// Read access to a device health store
pub trait HealthSource: Send + Sync {
    /// Ask the user for read access; returns the types that were granted
    fn request_permission(&self, type_ids: &[DataTypeId]) -> Result<Vec<DataTypeId>>;

    /// Samples after `request.cursor` (or since `request.since`), oldest first
    fn read_since(&self, request: &ReadRequest) -> Result<ReadBatch>;
}
