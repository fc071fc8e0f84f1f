//! Wire payload for the sync endpoint
//!
//! ```json
//! {"data": {"records": [...], "workouts": [...], "sleep": [...]}}
//! ```
//!
//! Section choice and value extraction come from `TYPE_TABLE`, a static
//! dispatch table keyed by data type id. Types missing from the table are
//! sent as generic records carrying every value field.

use serde::Serialize;
use serde_json::Value;

use crate::models::{DataTypeId, Sample};

/// Top-level array a sample is placed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Records,
    Workouts,
    Sleep,
}

/// One `{type, value}` entry of a record's `values` array
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayloadValue {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: Value,
}

/// A single uploaded sample
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadRecord {
    pub uid: String,
    pub data_type: String,
    pub start_time: String,
    pub end_time: String,
    pub data_source: String,
    pub device: Option<String>,
    pub values: Vec<PayloadValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workout_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PayloadData {
    pub records: Vec<PayloadRecord>,
    pub workouts: Vec<PayloadRecord>,
    pub sleep: Vec<PayloadRecord>,
}

/// Request body of one upload
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncPayload {
    pub data: PayloadData,
}

impl SyncPayload {
    pub fn record_count(&self) -> usize {
        self.data.records.len() + self.data.workouts.len() + self.data.sleep.len()
    }

    pub fn to_json_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// How one data type is mapped onto the wire
struct TypeMapping {
    type_id: &'static str,
    section: Section,
    /// `dataType` value sent to the backend
    wire_name: &'static str,
    /// Value fields copied into `values`, in order
    value_keys: &'static [&'static str],
}

static TYPE_TABLE: &[TypeMapping] = &[
    TypeMapping {
        type_id: "steps",
        section: Section::Records,
        wire_name: "STEPS",
        value_keys: &["count", "value"],
    },
    TypeMapping {
        type_id: "heartRate",
        section: Section::Records,
        wire_name: "HEART_RATE",
        value_keys: &["bpm", "value"],
    },
    TypeMapping {
        type_id: "restingHeartRate",
        section: Section::Records,
        wire_name: "RESTING_HEART_RATE",
        value_keys: &["bpm", "value"],
    },
    TypeMapping {
        type_id: "heartRateVariability",
        section: Section::Records,
        wire_name: "HEART_RATE_VARIABILITY_SDNN",
        value_keys: &["sdnn", "value"],
    },
    TypeMapping {
        type_id: "activeEnergy",
        section: Section::Records,
        wire_name: "ACTIVE_ENERGY_BURNED",
        value_keys: &["kcal", "value"],
    },
    TypeMapping {
        type_id: "distance",
        section: Section::Records,
        wire_name: "DISTANCE_WALKING_RUNNING",
        value_keys: &["meters", "value"],
    },
    TypeMapping {
        type_id: "bloodOxygen",
        section: Section::Records,
        wire_name: "OXYGEN_SATURATION",
        value_keys: &["percent", "value"],
    },
    TypeMapping {
        type_id: "weight",
        section: Section::Records,
        wire_name: "BODY_MASS",
        value_keys: &["kg", "value"],
    },
    TypeMapping {
        type_id: "workout",
        section: Section::Workouts,
        wire_name: "WORKOUT",
        value_keys: &["duration", "energy", "distance"],
    },
    TypeMapping {
        type_id: "sleep",
        section: Section::Sleep,
        wire_name: "SLEEP_ANALYSIS",
        value_keys: &["duration", "value"],
    },
];

fn mapping_for(type_id: &DataTypeId) -> Option<&'static TypeMapping> {
    TYPE_TABLE.iter().find(|m| m.type_id == type_id.as_str())
}

/// Section a data type is uploaded in
pub fn section_for(type_id: &DataTypeId) -> Section {
    mapping_for(type_id).map_or(Section::Records, |m| m.section)
}

/// Ordered `{type, value}` entries for a sample
pub fn extract_values(sample: &Sample) -> Vec<PayloadValue> {
    let from_table: Vec<PayloadValue> = mapping_for(&sample.type_id)
        .map(|m| {
            m.value_keys
                .iter()
                .filter_map(|key| {
                    sample.value_fields.get(*key).map(|value| PayloadValue {
                        kind: key.to_string(),
                        value: value.clone(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    if !from_table.is_empty() {
        return from_table;
    }

    // Unknown type, or none of the expected keys present
    sample
        .value_fields
        .iter()
        .filter(|(key, _)| !matches!(key.as_str(), "workoutType" | "stage"))
        .map(|(key, value)| PayloadValue {
            kind: key.clone(),
            value: value.clone(),
        })
        .collect()
}

fn string_field(sample: &Sample, key: &str) -> Option<String> {
    sample.value_fields.get(key).map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

/// Convert one sample into its wire record
pub fn to_record(sample: &Sample) -> PayloadRecord {
    let mapping = mapping_for(&sample.type_id);
    let section = mapping.map_or(Section::Records, |m| m.section);

    PayloadRecord {
        uid: sample.id.clone(),
        data_type: mapping
            .map(|m| m.wire_name.to_string())
            .unwrap_or_else(|| sample.type_id.to_string()),
        start_time: sample.start_time.to_rfc3339(),
        end_time: sample.end_time.unwrap_or(sample.start_time).to_rfc3339(),
        data_source: sample
            .source
            .bundle_id
            .clone()
            .unwrap_or_else(|| sample.source.name.clone()),
        device: sample.source.device.clone(),
        values: extract_values(sample),
        workout_type: (section == Section::Workouts)
            .then(|| string_field(sample, "workoutType"))
            .flatten(),
        stage: (section == Section::Sleep)
            .then(|| string_field(sample, "stage"))
            .flatten(),
    }
}

/// Build the request body for a slice of samples
pub fn build_payload(samples: &[Sample]) -> SyncPayload {
    let mut data = PayloadData::default();
    for sample in samples {
        let record = to_record(sample);
        match section_for(&sample.type_id) {
            Section::Records => data.records.push(record),
            Section::Workouts => data.workouts.push(record),
            Section::Sleep => data.sleep.push(record),
        }
    }
    SyncPayload { data }
}
