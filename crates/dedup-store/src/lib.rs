//! Document-store session contract plus in-memory and JSON-file backed stores.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use dedup_core::{fields, lookup, set_path, values_equal, Document};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dedup-store";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Uploads,
    Data,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploads => "uploads",
            Self::Data => "data",
        }
    }

    fn key_field(&self) -> &'static str {
        match self {
            Self::Uploads => fields::UPLOAD_ID,
            Self::Data => fields::ID,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    FindAll,
    Find,
    InsertAll,
    UpdateAll,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::FindAll => "find_all",
            Self::Find => "find",
            Self::InsertAll => "insert_all",
            Self::UpdateAll => "update_all",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{operation} exceeded deadline of {after:?}")]
    Timeout { operation: Operation, after: Duration },
    #[error("cursor iteration failed: {0}")]
    Cursor(String),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored document is corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Failures of the store itself rather than of the documents it holds.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Cursor(_) | Self::Backend(_) | Self::Io(_)
        )
    }
}

/// Structured document filter: equality, inequality, membership, existence and AND.
/// A missing field compares equal to `null`, and `Ne` matches documents lacking the field.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Ne(String, Value),
    In(String, Vec<Value>),
    Exists(String, bool),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self::Eq(field.to_string(), value.into())
    }

    pub fn ne(field: &str, value: impl Into<Value>) -> Self {
        Self::Ne(field.to_string(), value.into())
    }

    pub fn is_in<I, V>(field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::In(field.to_string(), values.into_iter().map(Into::into).collect())
    }

    pub fn exists(field: &str, present: bool) -> Self {
        Self::Exists(field.to_string(), present)
    }

    pub fn and(clauses: impl IntoIterator<Item = Filter>) -> Self {
        Self::And(clauses.into_iter().collect())
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::Eq(field, value) => values_equal(field_value(doc, field), value),
            Self::Ne(field, value) => !values_equal(field_value(doc, field), value),
            Self::In(field, values) => {
                let actual = field_value(doc, field);
                values.iter().any(|v| values_equal(v, actual))
            }
            Self::Exists(field, present) => lookup(doc, field).is_some() == *present,
            Self::And(clauses) => clauses.iter().all(|c| c.matches(doc)),
        }
    }
}

fn field_value<'a>(doc: &'a Document, field: &str) -> &'a Value {
    lookup(doc, field).unwrap_or(&Value::Null)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

impl SortKey {
    pub fn asc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn desc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            direction: SortDirection::Descending,
        }
    }
}

/// Cross-type ordering: missing/null < bool < number < string < array < object.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Object(_)) => 5,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Array(x)), Some(Value::Array(y))) => x
            .iter()
            .zip(y.iter())
            .map(|(l, r)| compare_values(Some(l), Some(r)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| x.len().cmp(&y.len())),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn compare_documents(a: &Document, b: &Document, sort: &[SortKey]) -> Ordering {
    for key in sort {
        let ordering = compare_values(lookup(a, &key.field), lookup(b, &key.field));
        let ordering = match key.direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    fields: Vec<String>,
}

impl Projection {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn of<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let fields = fields
            .into_iter()
            .map(Into::into)
            .filter(|f: &String| seen.insert(f.clone()))
            .collect();
        Self { fields }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn apply(&self, doc: &Document) -> Document {
        if self.fields.is_empty() {
            return doc.clone();
        }
        let mut out = Document::new();
        for field in std::iter::once(fields::ID).chain(self.fields.iter().map(String::as_str)) {
            if let Some(value) = lookup(doc, field) {
                set_path(&mut out, field, value.clone());
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Update {
    set: Vec<(String, Value)>,
}

impl Update {
    pub fn set(field: &str, value: impl Into<Value>) -> Self {
        Self::default().and_set(field, value)
    }

    pub fn and_set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.set.push((field.to_string(), value.into()));
        self
    }

    pub fn apply(&self, doc: &mut Document) {
        for (field, value) in &self.set {
            set_path(doc, field, value.clone());
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filter: Option<Filter>,
    pub sort: Vec<SortKey>,
    pub projection: Projection,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter: Some(filter),
            ..Self::default()
        }
    }

    pub fn sort(mut self, sort: Vec<SortKey>) -> Self {
        self.sort = sort;
        self
    }

    pub fn project(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, doc: &Document) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(doc))
    }
}

#[derive(Debug)]
pub struct Cursor {
    items: std::vec::IntoIter<Result<Document, StoreError>>,
}

impl Cursor {
    pub fn from_documents(docs: Vec<Document>) -> Self {
        Self::from_results(docs.into_iter().map(Ok).collect())
    }

    pub fn from_results(items: Vec<Result<Document, StoreError>>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }

    pub fn try_collect(self) -> Result<Vec<Document>, StoreError> {
        self.collect()
    }
}

impl Iterator for Cursor {
    type Item = Result<Document, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.items.next()
    }
}

/// Minimum contract the deduplication engine needs from a document store.
#[async_trait]
pub trait StoreSession: Send + Sync {
    async fn find_all(&self, collection: Collection, query: &Query) -> Result<Cursor, StoreError>;

    async fn find(
        &self,
        collection: Collection,
        query: &Query,
    ) -> Result<Option<Document>, StoreError>;

    async fn insert_all(
        &self,
        collection: Collection,
        documents: Vec<Document>,
    ) -> Result<(), StoreError>;

    /// Apply `update` to every document matching `filter`; returns the matched count.
    async fn update_all(
        &self,
        collection: Collection,
        filter: &Filter,
        update: &Update,
    ) -> Result<u64, StoreError>;
}

#[async_trait]
impl<S: StoreSession + ?Sized> StoreSession for Arc<S> {
    async fn find_all(&self, collection: Collection, query: &Query) -> Result<Cursor, StoreError> {
        (**self).find_all(collection, query).await
    }

    async fn find(
        &self,
        collection: Collection,
        query: &Query,
    ) -> Result<Option<Document>, StoreError> {
        (**self).find(collection, query).await
    }

    async fn insert_all(
        &self,
        collection: Collection,
        documents: Vec<Document>,
    ) -> Result<(), StoreError> {
        (**self).insert_all(collection, documents).await
    }

    async fn update_all(
        &self,
        collection: Collection,
        filter: &Filter,
        update: &Update,
    ) -> Result<u64, StoreError> {
        (**self).update_all(collection, filter, update).await
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    uploads: Vec<Document>,
    data: Vec<Document>,
    faults: HashMap<Operation, String>,
    cursor_fault: Option<CursorFault>,
}

#[derive(Debug, Clone, Copy)]
struct CursorFault {
    skip: usize,
    yielded: usize,
}

impl MemoryState {
    fn collection(&self, collection: Collection) -> &Vec<Document> {
        match collection {
            Collection::Uploads => &self.uploads,
            Collection::Data => &self.data,
        }
    }

    fn collection_mut(&mut self, collection: Collection) -> &mut Vec<Document> {
        match collection {
            Collection::Uploads => &mut self.uploads,
            Collection::Data => &mut self.data,
        }
    }

    fn take_fault(&mut self, operation: Operation) -> Result<(), StoreError> {
        match self.faults.remove(&operation) {
            Some(message) => Err(StoreError::Backend(message)),
            None => Ok(()),
        }
    }

    fn run_query(&self, collection: Collection, query: &Query) -> Vec<Document> {
        let mut matched: Vec<&Document> = self
            .collection(collection)
            .iter()
            .filter(|doc| query.matches(doc))
            .collect();
        if !query.sort.is_empty() {
            matched.sort_by(|a, b| compare_documents(a, b, &query.sort));
        }
        matched
            .into_iter()
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|doc| query.projection.apply(doc))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents(uploads: Vec<Document>, data: Vec<Document>) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                uploads,
                data,
                ..MemoryState::default()
            }),
        }
    }

    pub async fn fail_next(&self, operation: Operation, message: impl Into<String>) {
        self.state.lock().await.faults.insert(operation, message.into());
    }

    pub async fn fail_cursor_after(&self, yielded: usize) {
        self.fail_later_cursor(0, yielded).await;
    }

    /// Let `skip` cursors through untouched, then fail the following one after `yielded` documents.
    pub async fn fail_later_cursor(&self, skip: usize, yielded: usize) {
        self.state.lock().await.cursor_fault = Some(CursorFault { skip, yielded });
    }

    pub async fn documents(&self, collection: Collection) -> Vec<Document> {
        self.state.lock().await.collection(collection).clone()
    }

    pub async fn snapshot(&self) -> StoreSnapshot {
        let state = self.state.lock().await;
        StoreSnapshot {
            uploads: state.uploads.clone(),
            data: state.data.clone(),
        }
    }
}

#[async_trait]
impl StoreSession for MemoryStore {
    async fn find_all(&self, collection: Collection, query: &Query) -> Result<Cursor, StoreError> {
        let mut state = self.state.lock().await;
        state.take_fault(Operation::FindAll)?;
        let docs = state.run_query(collection, query);
        let fault = state.cursor_fault.take();
        match fault {
            Some(CursorFault { skip, yielded }) if skip > 0 => {
                state.cursor_fault = Some(CursorFault {
                    skip: skip - 1,
                    yielded,
                });
                Ok(Cursor::from_documents(docs))
            }
            Some(CursorFault { yielded, .. }) => {
                let mut items: Vec<_> = docs.into_iter().take(yielded).map(Ok).collect();
                items.push(Err(StoreError::Cursor(format!(
                    "{} cursor interrupted after {yielded} documents",
                    collection.as_str()
                ))));
                Ok(Cursor::from_results(items))
            }
            None => Ok(Cursor::from_documents(docs)),
        }
    }

    async fn find(
        &self,
        collection: Collection,
        query: &Query,
    ) -> Result<Option<Document>, StoreError> {
        let mut state = self.state.lock().await;
        state.take_fault(Operation::Find)?;
        let query = query.clone().limit(1);
        Ok(state.run_query(collection, &query).into_iter().next())
    }

    async fn insert_all(
        &self,
        collection: Collection,
        documents: Vec<Document>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.take_fault(Operation::InsertAll)?;

        let key_field = collection.key_field();
        let mut keys: HashSet<String> = state
            .collection(collection)
            .iter()
            .filter_map(|doc| lookup(doc, key_field).map(Value::to_string))
            .collect();
        for doc in &documents {
            if let Some(key) = lookup(doc, key_field) {
                if !keys.insert(key.to_string()) {
                    return Err(StoreError::Backend(format!(
                        "duplicate {key_field} {key} in {}",
                        collection.as_str()
                    )));
                }
            }
        }

        state.collection_mut(collection).extend(documents);
        Ok(())
    }

    async fn update_all(
        &self,
        collection: Collection,
        filter: &Filter,
        update: &Update,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        state.take_fault(Operation::UpdateAll)?;
        let mut matched = 0u64;
        for doc in state.collection_mut(collection).iter_mut() {
            if filter.matches(doc) {
                update.apply(doc);
                matched += 1;
            }
        }
        Ok(matched)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub uploads: Vec<Document>,
    #[serde(default)]
    pub data: Vec<Document>,
}

#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    inner: MemoryStore,
}

impl JsonFileStore {
    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let snapshot = if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking store file {}", path.display()))?
        {
            let text = fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading store file {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("parsing store file {}", path.display()))?
        } else {
            StoreSnapshot::default()
        };

        tracing::debug!(
            path = %path.display(),
            uploads = snapshot.uploads.len(),
            data = snapshot.data.len(),
            "opened json store"
        );
        Ok(Self {
            path,
            inner: MemoryStore::with_documents(snapshot.uploads, snapshot.data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.inner
    }

    pub async fn persist(&self) -> anyhow::Result<()> {
        let snapshot = self.inner.snapshot().await;
        let bytes = serde_json::to_vec_pretty(&snapshot).context("serializing store snapshot")?;

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating store directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp store file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp store file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp store file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp store {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StoreSession for JsonFileStore {
    async fn find_all(&self, collection: Collection, query: &Query) -> Result<Cursor, StoreError> {
        self.inner.find_all(collection, query).await
    }

    async fn find(
        &self,
        collection: Collection,
        query: &Query,
    ) -> Result<Option<Document>, StoreError> {
        self.inner.find(collection, query).await
    }

    async fn insert_all(
        &self,
        collection: Collection,
        documents: Vec<Document>,
    ) -> Result<(), StoreError> {
        self.inner.insert_all(collection, documents).await
    }

    async fn update_all(
        &self,
        collection: Collection,
        filter: &Filter,
        update: &Update,
    ) -> Result<u64, StoreError> {
        self.inner.update_all(collection, filter, update).await
    }
}

/// Bounds every call on the wrapped session by a fixed deadline.
#[derive(Debug, Clone)]
pub struct DeadlineSession<S> {
    inner: S,
    deadline: Duration,
}

impl<S: StoreSession> DeadlineSession<S> {
    pub fn new(inner: S, deadline: Duration) -> Self {
        Self { inner, deadline }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    async fn bounded<T>(
        &self,
        operation: Operation,
        call: impl Future<Output = Result<T, StoreError>> + Send,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.deadline, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                operation,
                after: self.deadline,
            }),
        }
    }
}

#[async_trait]
impl<S: StoreSession> StoreSession for DeadlineSession<S> {
    async fn find_all(&self, collection: Collection, query: &Query) -> Result<Cursor, StoreError> {
        self.bounded(Operation::FindAll, self.inner.find_all(collection, query))
            .await
    }

    async fn find(
        &self,
        collection: Collection,
        query: &Query,
    ) -> Result<Option<Document>, StoreError> {
        self.bounded(Operation::Find, self.inner.find(collection, query))
            .await
    }

    async fn insert_all(
        &self,
        collection: Collection,
        documents: Vec<Document>,
    ) -> Result<(), StoreError> {
        self.bounded(Operation::InsertAll, self.inner.insert_all(collection, documents))
            .await
    }

    async fn update_all(
        &self,
        collection: Collection,
        filter: &Filter,
        update: &Update,
    ) -> Result<u64, StoreError> {
        self.bounded(Operation::UpdateAll, self.inner.update_all(collection, filter, update))
            .await
    }
}
