//! Scriptable in-memory health source
//!
//! Each type has an append-only sample log. A cursor is the number of log
//! entries consumed, so re-reading from an old cursor returns the same
//! window again, the way anchored queries behave on device.

use anyhow::{Result, bail};
use chrono::{Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::HealthSource;
use crate::models::{Cursor, DataTypeId, ReadBatch, ReadRequest, Sample, SourceInfo};

#[derive(Default)]
struct Inner {
    logs: HashMap<DataTypeId, Vec<Sample>>,
    denied: HashSet<DataTypeId>,
    fail_next_read: HashMap<DataTypeId, String>,
    reads: Vec<ReadRequest>,
}

#[derive(Default)]
pub struct InMemoryHealthSource {
    inner: Mutex<Inner>,
}

impl InMemoryHealthSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append samples to a type's log
    pub fn add_samples(&self, type_id: &DataTypeId, samples: Vec<Sample>) {
        self.inner()
            .logs
            .entry(type_id.clone())
            .or_default()
            .extend(samples);
    }

    /// Append `count` synthetic samples recorded over the last few days
    pub fn add_generated_samples(&self, type_id: &DataTypeId, count: usize) {
        let mut inner = self.inner();
        let log = inner.logs.entry(type_id.clone()).or_default();
        let offset = log.len();
        let base = Utc::now() - Duration::days(3);

        log.extend((0..count).map(|i| {
            let n = offset + i;
            let start = base + Duration::seconds(n as i64 * 30);
            Sample::new(format!("{}-{}", type_id, n), type_id.clone(), start)
                .with_end_time(start + Duration::seconds(30))
                .with_value("value", n as f64)
                .with_source(SourceInfo {
                    name: "Test Watch".to_string(),
                    bundle_id: Some("com.example.watch".to_string()),
                    device: Some("Watch7,1".to_string()),
                })
        }));
    }

    /// Refuse permission for a type in later `request_permission` calls
    pub fn deny(&self, type_id: &DataTypeId) {
        self.inner().denied.insert(type_id.clone());
    }

    /// Make the next read of a type fail
    pub fn fail_next_read(&self, type_id: &DataTypeId, error: &str) {
        self.inner()
            .fail_next_read
            .insert(type_id.clone(), error.to_string());
    }

    /// Number of reads issued for a type
    pub fn read_count(&self, type_id: &DataTypeId) -> usize {
        self.inner()
            .reads
            .iter()
            .filter(|r| &r.type_id == type_id)
            .count()
    }

    /// Every read request received, in order
    pub fn reads(&self) -> Vec<ReadRequest> {
        self.inner().reads.clone()
    }

    /// Cursor positioned after every sample currently in a type's log
    pub fn head_cursor(&self, type_id: &DataTypeId) -> Cursor {
        let len = self.inner().logs.get(type_id).map_or(0, Vec::len);
        Cursor::new(len.to_string())
    }
}

impl HealthSource for InMemoryHealthSource {
    fn request_permission(&self, type_ids: &[DataTypeId]) -> Result<Vec<DataTypeId>> {
        let inner = self.inner();
        Ok(type_ids
            .iter()
            .filter(|t| !inner.denied.contains(*t))
            .cloned()
            .collect())
    }

    fn read_since(&self, request: &ReadRequest) -> Result<ReadBatch> {
        let mut inner = self.inner();
        inner.reads.push(request.clone());

        if let Some(error) = inner.fail_next_read.remove(&request.type_id) {
            bail!("read failed for {}: {}", request.type_id, error);
        }

        let start = match &request.cursor {
            Some(cursor) => match cursor.as_str().parse::<usize>() {
                Ok(position) => position,
                Err(_) => bail!("invalid cursor {:?}", cursor),
            },
            None => 0,
        };

        let log = inner.logs.get(&request.type_id).map(Vec::as_slice).unwrap_or(&[]);
        let limit = request.limit.unwrap_or(usize::MAX);

        let mut samples = Vec::new();
        let mut position = start;
        for sample in log.iter().skip(start) {
            if samples.len() >= limit {
                break;
            }
            position += 1;
            if request.since.is_some_and(|since| sample.start_time < since) {
                continue;
            }
            samples.push(sample.clone());
        }

        let new_cursor = if position > start || request.cursor.is_none() {
            Some(Cursor::new(position.to_string()))
        } else {
            request.cursor.clone()
        };

        Ok(ReadBatch::new(samples, new_cursor))
    }
}
