//! Core domain model for device-data uploads, datums and deduplicator descriptors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dedup-core";

/// A schemaless stored document (one upload record or one datum).
pub type Document = Map<String, Value>;

/// Well-known document field names shared by the store and the engine.
pub mod fields {
    pub const ID: &str = "id";
    pub const TYPE: &str = "type";
    pub const TIME: &str = "time";
    pub const UPLOAD_ID: &str = "uploadId";
    pub const USER_ID: &str = "userId";
    pub const DEVICE_ID: &str = "deviceId";
    pub const DEVICE_MODEL: &str = "deviceModel";
    pub const CREATED_TIME: &str = "createdTime";
    pub const DATA_STATE: &str = "dataState";
    pub const DEDUPLICATOR: &str = "deduplicator";
    pub const ACTIVE: &str = "active";
    pub const FINGERPRINT: &str = "_deduplicator.hash";
}

/// Resolve a dotted path (`a.b.c`) inside a document.
pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Write `value` at a dotted path, creating (or replacing non-object) intermediates.
pub fn set_path(doc: &mut Document, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            doc.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let slot = doc
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !slot.is_object() {
                *slot = Value::Object(Map::new());
            }
            if let Value::Object(child) = slot {
                set_path(child, rest, value);
            }
        }
    }
}

/// Document-store equality: numbers compare by value, so `5` equals `5.0`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if x.is_f64() || y.is_f64() {
                x.as_f64() == y.as_f64()
            } else {
                x == y
            }
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(l, r)| values_equal(l, r))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(key, l)| y.get(key).is_some_and(|r| values_equal(l, r)))
        }
        _ => a == b,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataState {
    #[default]
    Open,
    Closed,
}

/// Deduplicator declaration carried on an upload.
///
/// Uploaders may declare only a name; `InitializeDataset` overwrites the
/// descriptor with the fully resolved parameters so finalization can replay them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeduplicatorDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(flatten)]
    pub parameters: Map<String, Value>,
}

impl DeduplicatorDescriptor {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            parameters: Map::new(),
        }
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.name == name
    }
}

/// One ingestion session's metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSetUpload {
    pub upload_id: String,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deduplicator: Option<DeduplicatorDescriptor>,
    pub created_time: DateTime<Utc>,
    #[serde(default)]
    pub data_state: DataState,
}

impl DataSetUpload {
    pub fn new(
        user_id: impl Into<String>,
        device_id: Option<String>,
        device_model: Option<String>,
        created_time: DateTime<Utc>,
    ) -> Self {
        Self {
            upload_id: Uuid::new_v4().simple().to_string(),
            user_id: user_id.into(),
            device_id,
            device_model,
            deduplicator: None,
            created_time,
            data_state: DataState::Open,
        }
    }

    pub fn with_deduplicator(mut self, descriptor: DeduplicatorDescriptor) -> Self {
        self.deduplicator = Some(descriptor);
        self
    }

    /// Name of the first required identity attribute that is empty, if any.
    pub fn missing_required_field(&self) -> Option<&'static str> {
        if self.upload_id.trim().is_empty() {
            Some(fields::UPLOAD_ID)
        } else if self.user_id.trim().is_empty() {
            Some(fields::USER_ID)
        } else {
            None
        }
    }

    /// Device/account group: uploads sharing this key are deduplicated against each other.
    pub fn group_key(&self) -> String {
        format!("{}:{}", self.user_id, self.device_id.as_deref().unwrap_or_default())
    }

    pub fn declared_deduplicator_name(&self) -> Option<&str> {
        self.deduplicator.as_ref().map(|d| d.name.as_str())
    }

    pub fn to_document(&self) -> serde_json::Result<Document> {
        match serde_json::to_value(self)? {
            Value::Object(doc) => Ok(doc),
            other => Err(<serde_json::Error as serde::ser::Error>::custom(format!(
                "upload serialized to a non-object: {other}"
            ))),
        }
    }

    pub fn from_document(doc: Document) -> serde_json::Result<Self> {
        serde_json::from_value(Value::Object(doc))
    }
}

/// One time-series data point, kept as a document so type-specific fields survive untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Datum(Document);

impl Datum {
    pub fn new(datum_type: impl Into<String>) -> Self {
        let mut doc = Document::new();
        doc.insert(fields::TYPE.to_string(), Value::String(datum_type.into()));
        Self(doc)
    }

    pub fn from_document(doc: Document) -> Self {
        Self(doc)
    }

    pub fn as_document(&self) -> &Document {
        &self.0
    }

    pub fn into_document(self) -> Document {
        self.0
    }

    /// Builder-style field assignment; dotted paths create nested objects.
    pub fn with(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.set(path, value.into());
        self
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup(&self.0, path)
    }

    pub fn str_field(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_some_and(|v| !v.is_null())
    }

    pub fn set(&mut self, path: &str, value: Value) {
        set_path(&mut self.0, path, value);
    }

    pub fn id(&self) -> Option<&str> {
        self.str_field(fields::ID)
    }

    pub fn datum_type(&self) -> Option<&str> {
        self.str_field(fields::TYPE)
    }

    pub fn upload_id(&self) -> Option<&str> {
        self.str_field(fields::UPLOAD_ID)
    }

    pub fn fingerprint(&self) -> Option<&str> {
        self.str_field(fields::FINGERPRINT)
    }

    pub fn is_active(&self) -> bool {
        self.get(fields::ACTIVE)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Assign a fresh identifier when the uploader did not supply one.
    pub fn ensure_id(&mut self) {
        if self.id().is_none() {
            self.set(fields::ID, Value::String(Uuid::new_v4().simple().to_string()));
        }
    }
}
