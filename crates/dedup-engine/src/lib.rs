//! Deduplication engine: strategy registry, positional dataset alignment and
//! content-fingerprint deduplication for overlapping device-data uploads.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use dedup_core::{
    fields, lookup, values_equal, DataSetUpload, DataState, Datum, DeduplicatorDescriptor, Document,
};
use dedup_store::{
    Collection, Cursor, Filter, Projection, Query, SortKey, StoreError, StoreSession, Update,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "dedup-engine";

pub const ALIGNMENT_DEDUPLICATOR_NAME: &str = "org.tidepool.deduplicator.dataset.alignment";
pub const ALIGNMENT_DEDUPLICATOR_VERSION: &str = "1.0.0";
pub const HASH_DEDUPLICATOR_NAME: &str = "org.tidepool.deduplicator.device.deactivate.hash";
pub const HASH_DEDUPLICATOR_VERSION: &str = "1.1.0";
pub const NONE_DEDUPLICATOR_NAME: &str = "org.tidepool.deduplicator.none";
pub const NONE_DEDUPLICATOR_VERSION: &str = "1.0.0";

pub const CURRENT_HASH_VERSION: u32 = 1;

const MMOL_L_TO_MG_DL: f64 = 18.01559;
const FINGERPRINT_PRECISION: f64 = 100_000.0;

pub type SharedSession = Arc<dyn StoreSession>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initialize,
    AddData,
    LoadUpload,
    LocatePrevious,
    FetchProjection,
    ExistingFingerprints,
    Activate,
    Close,
    Backfill,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initialize => "initialize",
            Self::AddData => "add_data",
            Self::LoadUpload => "finalize:load_upload",
            Self::LocatePrevious => "finalize:locate_previous",
            Self::FetchProjection => "finalize:fetch_projection",
            Self::ExistingFingerprints => "finalize:existing_fingerprints",
            Self::Activate => "finalize:activate",
            Self::Close => "finalize:close",
            Self::Backfill => "backfill",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("{strategy} {phase} failed for upload {upload_id}: {source}")]
    Store {
        upload_id: String,
        strategy: &'static str,
        phase: Phase,
        #[source]
        source: StoreError,
    },
    #[error("datum {datum_id} cannot be fingerprinted: {field} {reason}")]
    HashCanonicalization {
        datum_id: String,
        field: &'static str,
        reason: String,
    },
}

impl DedupError {
    /// Transient store failures; corrupt stored documents and caller errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store { source, .. } if source.is_transient())
    }

    fn store(upload_id: &str, strategy: &'static str, phase: Phase, source: StoreError) -> Self {
        Self::Store {
            upload_id: upload_id.to_string(),
            strategy,
            phase,
            source,
        }
    }
}

fn default_alignment_version() -> String {
    ALIGNMENT_DEDUPLICATOR_VERSION.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentConfig {
    #[serde(default = "default_alignment_version")]
    pub version: String,
    pub sort: Vec<String>,
    #[serde(rename = "match")]
    pub match_fields: Vec<String>,
    #[serde(default)]
    pub unified: bool,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            version: default_alignment_version(),
            sort: vec![fields::TIME.to_string()],
            match_fields: [
                "time",
                "deviceTime",
                "value",
                "units",
                "subType",
                "deliveryType",
                "rate",
                "duration",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
            unified: false,
        }
    }
}

impl AlignmentConfig {
    pub fn validate(&self) -> Result<(), DedupError> {
        if self.sort.is_empty() {
            return Err(DedupError::InvalidArgument(
                "alignment configuration needs at least one sort field".into(),
            ));
        }
        if self.match_fields.is_empty() {
            return Err(DedupError::InvalidArgument(
                "alignment configuration needs at least one match field".into(),
            ));
        }
        if self
            .sort
            .iter()
            .chain(&self.match_fields)
            .any(|f| f.trim().is_empty())
        {
            return Err(DedupError::InvalidArgument(
                "alignment configuration contains an empty field name".into(),
            ));
        }
        Ok(())
    }

    fn resolve(
        defaults: &AlignmentConfig,
        declared: Option<&DeduplicatorDescriptor>,
    ) -> Result<Self, DedupError> {
        let mut config = defaults.clone();
        config.version = default_alignment_version();
        if let Some(descriptor) = declared.filter(|d| d.has_name(ALIGNMENT_DEDUPLICATOR_NAME)) {
            let params = &descriptor.parameters;
            if let Some(value) = params.get("sort") {
                config.sort = string_list("sort", value)?;
            }
            if let Some(value) = params.get("match") {
                config.match_fields = string_list("match", value)?;
            }
            if let Some(value) = params.get("unified") {
                config.unified = value.as_bool().ok_or_else(|| {
                    DedupError::InvalidArgument(format!("alignment parameter unified is not a bool: {value}"))
                })?;
            }
        }
        config.validate()?;
        Ok(config)
    }

    fn projection_fields(&self) -> Vec<String> {
        let mut out = vec![fields::TYPE.to_string()];
        out.extend(self.match_fields.iter().cloned());
        out.extend(self.sort.iter().cloned());
        out
    }
}

fn string_list(name: &str, value: &Value) -> Result<Vec<String>, DedupError> {
    let malformed =
        || DedupError::InvalidArgument(format!("alignment parameter {name} is not a list of strings: {value}"));
    value
        .as_array()
        .ok_or_else(malformed)?
        .iter()
        .map(|v| v.as_str().map(str::to_string).ok_or_else(malformed))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashConfig {
    pub version: String,
    #[serde(rename = "hashVersion")]
    pub hash_version: u32,
}

impl HashConfig {
    pub fn new(hash_version: u32) -> Result<Self, DedupError> {
        if hash_version != CURRENT_HASH_VERSION {
            return Err(DedupError::InvalidArgument(format!(
                "unsupported hash version {hash_version}"
            )));
        }
        Ok(Self {
            version: HASH_DEDUPLICATOR_VERSION.to_string(),
            hash_version,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeduplicatorConfig {
    Alignment(AlignmentConfig),
    Hash(HashConfig),
    None { version: String },
}

impl DeduplicatorConfig {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Alignment(_) => ALIGNMENT_DEDUPLICATOR_NAME,
            Self::Hash(_) => HASH_DEDUPLICATOR_NAME,
            Self::None { .. } => NONE_DEDUPLICATOR_NAME,
        }
    }

    pub fn to_descriptor(&self) -> DeduplicatorDescriptor {
        let mut parameters = Map::new();
        let version = match self {
            Self::Alignment(config) => {
                parameters.insert("sort".into(), Value::from(config.sort.clone()));
                parameters.insert("match".into(), Value::from(config.match_fields.clone()));
                parameters.insert("unified".into(), Value::Bool(config.unified));
                config.version.clone()
            }
            Self::Hash(config) => {
                parameters.insert("hashVersion".into(), Value::from(config.hash_version));
                config.version.clone()
            }
            Self::None { version } => version.clone(),
        };
        DeduplicatorDescriptor {
            name: self.name().to_string(),
            version: Some(version),
            parameters,
        }
    }

    /// Rebuild a persisted configuration. A descriptor without a version was never initialized.
    pub fn from_descriptor(descriptor: &DeduplicatorDescriptor) -> Result<Self, DedupError> {
        let Some(version) = descriptor.version.clone() else {
            return Err(DedupError::InvalidArgument(format!(
                "{} configuration has not been initialized",
                descriptor.name
            )));
        };
        let mut object = descriptor.parameters.clone();
        object.insert("version".into(), Value::String(version.clone()));
        let malformed = |err: serde_json::Error| {
            DedupError::InvalidArgument(format!(
                "malformed {} configuration: {err}",
                descriptor.name
            ))
        };

        match descriptor.name.as_str() {
            ALIGNMENT_DEDUPLICATOR_NAME => {
                let config: AlignmentConfig =
                    serde_json::from_value(Value::Object(object)).map_err(malformed)?;
                config.validate()?;
                Ok(Self::Alignment(config))
            }
            HASH_DEDUPLICATOR_NAME => {
                let config: HashConfig =
                    serde_json::from_value(Value::Object(object)).map_err(malformed)?;
                HashConfig::new(config.hash_version)?;
                Ok(Self::Hash(config))
            }
            NONE_DEDUPLICATOR_NAME => Ok(Self::None { version }),
            other => Err(DedupError::InvalidArgument(format!(
                "unknown deduplicator {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store_timeout_secs: u64,
    pub legacy_device_models: Vec<String>,
    pub alignment: AlignmentConfig,
    pub hash_version: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_timeout_secs: 30,
            legacy_device_models: ["Paradigm", "MiniMed", "Animas", "OmniPod"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            alignment: AlignmentConfig::default(),
            hash_version: CURRENT_HASH_VERSION,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = match get("DEDUP_CONFIG_FILE") {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        if let Some(secs) = get("DEDUP_STORE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            config.store_timeout_secs = secs;
        }
        if let Some(models) = get("DEDUP_LEGACY_DEVICE_MODELS") {
            config.legacy_device_models = models
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect();
        }
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config
            .alignment
            .validate()
            .with_context(|| format!("validating alignment defaults in {}", path.display()))?;
        Ok(config)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs.max(1))
    }

    pub fn is_legacy_device_model(&self, model: Option<&str>) -> bool {
        matches_legacy_model(&self.legacy_device_models, model)
    }
}

fn matches_legacy_model(prefixes: &[String], model: Option<&str>) -> bool {
    let Some(model) = model else {
        return false;
    };
    let model = model.to_ascii_lowercase();
    prefixes
        .iter()
        .any(|prefix| model.starts_with(&prefix.to_ascii_lowercase()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalizeReport {
    pub upload_id: String,
    pub strategy: &'static str,
    pub previous_upload_id: Option<String>,
    pub activated: u64,
}

#[async_trait]
pub trait Deduplicator: Send + Sync {
    fn name(&self) -> &'static str;

    fn upload(&self) -> &DataSetUpload;

    async fn initialize_dataset(&self) -> Result<(), DedupError>;

    async fn add_data_to_dataset(&self, datums: Vec<Datum>) -> Result<(), DedupError>;

    async fn finalize_dataset(&self) -> Result<FinalizeReport, DedupError>;
}

/// Decides from upload metadata alone whether a strategy applies, and builds it.
pub trait DeduplicatorFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn can_deduplicate_dataset(&self, upload: &DataSetUpload) -> Result<bool, DedupError>;

    fn new_deduplicator(
        &self,
        upload: &DataSetUpload,
        session: SharedSession,
    ) -> Result<Box<dyn Deduplicator>, DedupError>;
}

fn validate_upload(upload: &DataSetUpload) -> Result<(), DedupError> {
    match upload.missing_required_field() {
        Some(field) => Err(DedupError::InvalidArgument(format!(
            "upload is missing {field}"
        ))),
        None => Ok(()),
    }
}

fn unclaimed(factory: &str, upload: &DataSetUpload) -> DedupError {
    DedupError::InvalidArgument(format!(
        "{factory} cannot deduplicate upload {}",
        upload.upload_id
    ))
}

/// Ordered chain of factories; the first one that claims an upload wins.
pub struct DeduplicatorRegistry {
    factories: Vec<Box<dyn DeduplicatorFactory>>,
}

impl DeduplicatorRegistry {
    pub fn new(factories: Vec<Box<dyn DeduplicatorFactory>>) -> Self {
        Self { factories }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self, DedupError> {
        Ok(Self::new(vec![
            Box::new(AlignmentDeduplicatorFactory::new(
                config.alignment.clone(),
                config.legacy_device_models.clone(),
            )?),
            Box::new(HashDeduplicatorFactory::new(config.hash_version)?),
            Box::new(NoneDeduplicatorFactory),
        ]))
    }

    pub fn factory_names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|f| f.name()).collect()
    }

    fn claiming_factory(
        &self,
        upload: &DataSetUpload,
    ) -> Result<Option<&dyn DeduplicatorFactory>, DedupError> {
        validate_upload(upload)?;
        for factory in &self.factories {
            if factory.can_deduplicate_dataset(upload)? {
                return Ok(Some(factory.as_ref()));
            }
        }
        Ok(None)
    }
}

impl DeduplicatorFactory for DeduplicatorRegistry {
    fn name(&self) -> &'static str {
        "registry"
    }

    fn can_deduplicate_dataset(&self, upload: &DataSetUpload) -> Result<bool, DedupError> {
        Ok(self.claiming_factory(upload)?.is_some())
    }

    fn new_deduplicator(
        &self,
        upload: &DataSetUpload,
        session: SharedSession,
    ) -> Result<Box<dyn Deduplicator>, DedupError> {
        let Some(factory) = self.claiming_factory(upload)? else {
            return Err(DedupError::NotFound(format!(
                "no deduplicator claims upload {} (declared {:?})",
                upload.upload_id,
                upload.declared_deduplicator_name()
            )));
        };
        debug!(upload_id = %upload.upload_id, factory = factory.name(), "deduplicator selected");
        factory.new_deduplicator(upload, session)
    }
}

struct DatasetContext {
    upload: DataSetUpload,
    session: SharedSession,
    strategy: &'static str,
}

impl DatasetContext {
    fn new(upload: &DataSetUpload, session: SharedSession, strategy: &'static str) -> Self {
        Self {
            upload: upload.clone(),
            session,
            strategy,
        }
    }

    fn upload_id(&self) -> &str {
        &self.upload.upload_id
    }

    fn store_error(&self, phase: Phase) -> impl FnOnce(StoreError) -> DedupError + '_ {
        move |source| DedupError::store(self.upload_id(), self.strategy, phase, source)
    }

    fn corrupt(&self, phase: Phase, detail: String) -> DedupError {
        DedupError::store(self.upload_id(), self.strategy, phase, StoreError::Corrupt(detail))
    }

    async fn persist_config(&self, config: &DeduplicatorConfig) -> Result<(), DedupError> {
        let descriptor = serde_json::to_value(config.to_descriptor()).map_err(|err| {
            DedupError::InvalidArgument(format!("serializing {} configuration: {err}", self.strategy))
        })?;
        let matched = self
            .session
            .update_all(
                Collection::Uploads,
                &Filter::eq(fields::UPLOAD_ID, self.upload_id()),
                &Update::set(fields::DEDUPLICATOR, descriptor),
            )
            .await
            .map_err(self.store_error(Phase::Initialize))?;
        if matched == 0 {
            return Err(DedupError::InvalidArgument(format!(
                "upload {} is not stored",
                self.upload_id()
            )));
        }
        info!(upload_id = %self.upload_id(), strategy = self.strategy, "deduplicator configuration persisted");
        Ok(())
    }

    /// Finalization always replays the configuration written by `initialize_dataset`.
    async fn load_persisted_config(&self) -> Result<DeduplicatorConfig, DedupError> {
        let doc = self
            .session
            .find(
                Collection::Uploads,
                &Query::new(Filter::eq(fields::UPLOAD_ID, self.upload_id())),
            )
            .await
            .map_err(self.store_error(Phase::LoadUpload))?
            .ok_or_else(|| {
                DedupError::InvalidArgument(format!("upload {} is not stored", self.upload_id()))
            })?;
        let upload = DataSetUpload::from_document(doc)
            .map_err(|err| self.store_error(Phase::LoadUpload)(err.into()))?;
        let descriptor = upload.deduplicator.ok_or_else(|| {
            DedupError::InvalidArgument(format!(
                "upload {} has no persisted deduplicator configuration",
                self.upload_id()
            ))
        })?;
        if !descriptor.has_name(self.strategy) {
            return Err(DedupError::InvalidArgument(format!(
                "upload {} was initialized with {}, not {}",
                self.upload_id(),
                descriptor.name,
                self.strategy
            )));
        }
        DeduplicatorConfig::from_descriptor(&descriptor)
    }

    fn stamp(&self, mut datum: Datum) -> Datum {
        datum.ensure_id();
        datum.set(fields::UPLOAD_ID, Value::String(self.upload.upload_id.clone()));
        if !datum.contains(fields::USER_ID) {
            datum.set(fields::USER_ID, Value::String(self.upload.user_id.clone()));
        }
        if let Some(device_id) = &self.upload.device_id {
            if !datum.contains(fields::DEVICE_ID) {
                datum.set(fields::DEVICE_ID, Value::String(device_id.clone()));
            }
        }
        datum.set(fields::ACTIVE, Value::Bool(false));
        datum
    }

    async fn insert(&self, datums: Vec<Datum>) -> Result<(), DedupError> {
        if datums.is_empty() {
            return Ok(());
        }
        let count = datums.len();
        let documents = datums.into_iter().map(Datum::into_document).collect();
        self.session
            .insert_all(Collection::Data, documents)
            .await
            .map_err(self.store_error(Phase::AddData))?;
        debug!(upload_id = %self.upload_id(), count, "datums inserted inactive");
        Ok(())
    }

    async fn activate(&self, scope: Vec<Filter>) -> Result<u64, DedupError> {
        let mut clauses = vec![Filter::eq(fields::UPLOAD_ID, self.upload_id())];
        clauses.extend(scope);
        self.session
            .update_all(
                Collection::Data,
                &Filter::and(clauses),
                &Update::set(fields::ACTIVE, true),
            )
            .await
            .map_err(self.store_error(Phase::Activate))
    }

    fn report(&self) -> FinalizeReport {
        FinalizeReport {
            upload_id: self.upload.upload_id.clone(),
            strategy: self.strategy,
            previous_upload_id: None,
            activated: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    NoOverlap,
    Overlap(usize),
}

impl Alignment {
    pub fn overlap(&self) -> usize {
        match self {
            Self::NoOverlap => 0,
            Self::Overlap(n) => *n,
        }
    }
}

/// Greedy longest suffix/prefix alignment: overlaps are tried from the longest possible down.
pub fn align_by<T>(previous: &[T], new: &[T], same: impl Fn(&T, &T) -> bool) -> Alignment {
    let longest = previous.len().min(new.len());
    for overlap in (1..=longest).rev() {
        let tail = &previous[previous.len() - overlap..];
        let head = &new[..overlap];
        if tail.iter().zip(head).all(|(a, b)| same(a, b)) {
            return Alignment::Overlap(overlap);
        }
    }
    Alignment::NoOverlap
}

pub fn align<T: PartialEq>(previous: &[T], new: &[T]) -> Alignment {
    align_by(previous, new, |a, b| a == b)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedDatum {
    pub id: String,
    pub datum_type: Option<String>,
    /// `None` marks a missing field, which never equals a present one.
    pub key: Vec<Option<Value>>,
}

impl ProjectedDatum {
    pub fn same_key(&self, other: &Self) -> bool {
        self.key.len() == other.key.len()
            && self.key.iter().zip(&other.key).all(|pair| match pair {
                (Some(a), Some(b)) => values_equal(a, b),
                (None, None) => true,
                _ => false,
            })
    }

    fn from_document(doc: &Document, match_fields: &[String]) -> Option<Self> {
        let id = lookup(doc, fields::ID)?.as_str()?.to_string();
        Some(Self {
            id,
            datum_type: lookup(doc, fields::TYPE)
                .and_then(Value::as_str)
                .map(str::to_string),
            key: match_fields.iter().map(|f| lookup(doc, f).cloned()).collect(),
        })
    }
}

type TypePartition = BTreeMap<Option<String>, Vec<ProjectedDatum>>;

fn partition_by_type(items: Vec<ProjectedDatum>) -> TypePartition {
    let mut out = TypePartition::new();
    for item in items {
        out.entry(item.datum_type.clone()).or_default().push(item);
    }
    out
}

enum TypeScope {
    Unified,
    Type(Option<String>),
}

impl TypeScope {
    fn clauses(&self) -> Vec<Filter> {
        match self {
            Self::Unified => Vec::new(),
            Self::Type(datum_type) => vec![Filter::eq(
                fields::TYPE,
                datum_type.clone().map_or(Value::Null, Value::String),
            )],
        }
    }
}

pub struct AlignmentDeduplicatorFactory {
    defaults: AlignmentConfig,
    legacy_device_models: Vec<String>,
}

impl AlignmentDeduplicatorFactory {
    pub fn new(
        defaults: AlignmentConfig,
        legacy_device_models: Vec<String>,
    ) -> Result<Self, DedupError> {
        defaults.validate()?;
        Ok(Self {
            defaults,
            legacy_device_models,
        })
    }
}

impl DeduplicatorFactory for AlignmentDeduplicatorFactory {
    fn name(&self) -> &'static str {
        ALIGNMENT_DEDUPLICATOR_NAME
    }

    fn can_deduplicate_dataset(&self, upload: &DataSetUpload) -> Result<bool, DedupError> {
        validate_upload(upload)?;
        Ok(match upload.declared_deduplicator_name() {
            Some(name) => name == ALIGNMENT_DEDUPLICATOR_NAME,
            None => matches_legacy_model(&self.legacy_device_models, upload.device_model.as_deref()),
        })
    }

    fn new_deduplicator(
        &self,
        upload: &DataSetUpload,
        session: SharedSession,
    ) -> Result<Box<dyn Deduplicator>, DedupError> {
        if !self.can_deduplicate_dataset(upload)? {
            return Err(unclaimed(self.name(), upload));
        }
        let config = AlignmentConfig::resolve(&self.defaults, upload.deduplicator.as_ref())?;
        Ok(Box::new(AlignmentDeduplicator {
            ctx: DatasetContext::new(upload, session, ALIGNMENT_DEDUPLICATOR_NAME),
            config,
        }))
    }
}

pub struct AlignmentDeduplicator {
    ctx: DatasetContext,
    config: AlignmentConfig,
}

impl AlignmentDeduplicator {
    pub fn config(&self) -> &AlignmentConfig {
        &self.config
    }

    /// Ordered by `(createdTime, uploadId)` so equal timestamps still resolve deterministically.
    async fn locate_previous_upload(&self) -> Result<Option<String>, DedupError> {
        let upload = &self.ctx.upload;
        let filter = Filter::and([
            Filter::eq(fields::USER_ID, upload.user_id.as_str()),
            Filter::eq(
                fields::DEVICE_ID,
                upload.device_id.clone().map_or(Value::Null, Value::String),
            ),
            Filter::ne(fields::UPLOAD_ID, upload.upload_id.as_str()),
        ]);
        let query = Query::new(filter)
            .sort(vec![SortKey::desc(fields::CREATED_TIME)])
            .project(Projection::of([fields::UPLOAD_ID, fields::CREATED_TIME]));
        let candidates = self
            .ctx
            .session
            .find_all(Collection::Uploads, &query)
            .await
            .and_then(Cursor::try_collect)
            .map_err(self.ctx.store_error(Phase::LocatePrevious))?;

        let current = (upload.created_time, upload.upload_id.clone());
        let mut latest: Option<(DateTime<Utc>, String)> = None;
        for doc in candidates {
            let upload_id = lookup(&doc, fields::UPLOAD_ID)
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    self.ctx
                        .corrupt(Phase::LocatePrevious, "stored upload without uploadId".into())
                })?;
            let created = lookup(&doc, fields::CREATED_TIME)
                .and_then(Value::as_str)
                .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                .ok_or_else(|| {
                    self.ctx.corrupt(
                        Phase::LocatePrevious,
                        format!("upload {upload_id} has no valid createdTime"),
                    )
                })?
                .with_timezone(&Utc);
            let candidate = (created, upload_id.to_string());
            if candidate >= current {
                continue;
            }
            if latest.as_ref().map_or(true, |best| candidate > *best) {
                latest = Some(candidate);
            }
        }
        Ok(latest.map(|(_, upload_id)| upload_id))
    }

    async fn fetch_projection(
        &self,
        upload_id: &str,
        config: &AlignmentConfig,
    ) -> Result<Vec<ProjectedDatum>, DedupError> {
        let query = Query::new(Filter::eq(fields::UPLOAD_ID, upload_id))
            .sort(config.sort.iter().map(|f| SortKey::asc(f)).collect())
            .project(Projection::of(config.projection_fields()));
        let docs = self
            .ctx
            .session
            .find_all(Collection::Data, &query)
            .await
            .and_then(Cursor::try_collect)
            .map_err(self.ctx.store_error(Phase::FetchProjection))?;
        docs.iter()
            .map(|doc| {
                ProjectedDatum::from_document(doc, &config.match_fields).ok_or_else(|| {
                    self.ctx.corrupt(
                        Phase::FetchProjection,
                        format!("datum without string id in upload {upload_id}"),
                    )
                })
            })
            .collect()
    }

    async fn resolve_scope(
        &self,
        scope: TypeScope,
        previous: &[ProjectedDatum],
        new: &[ProjectedDatum],
    ) -> Result<u64, DedupError> {
        let mut clauses = scope.clauses();
        let scope_label = match &scope {
            TypeScope::Unified => "<unified>".to_string(),
            TypeScope::Type(t) => t.clone().unwrap_or_else(|| "<untyped>".to_string()),
        };

        if previous.is_empty() {
            let activated = self.ctx.activate(clauses).await?;
            debug!(scope = %scope_label, new = new.len(), activated, "no previous data for scope");
            return Ok(activated);
        }

        let alignment = align_by(previous, new, ProjectedDatum::same_key);
        let fresh: Vec<&str> = new[alignment.overlap()..]
            .iter()
            .map(|d| d.id.as_str())
            .collect();
        debug!(
            scope = %scope_label,
            previous = previous.len(),
            new = new.len(),
            overlap = alignment.overlap(),
            fresh = fresh.len(),
            "aligned"
        );
        if fresh.is_empty() {
            return Ok(0);
        }
        clauses.push(Filter::is_in(fields::ID, fresh));
        self.ctx.activate(clauses).await
    }

    async fn finalize(&self) -> Result<FinalizeReport, DedupError> {
        let DeduplicatorConfig::Alignment(config) = self.ctx.load_persisted_config().await? else {
            return Err(DedupError::InvalidArgument(
                "persisted configuration is not an alignment configuration".into(),
            ));
        };
        let mut report = self.ctx.report();

        let Some(previous_upload_id) = self.locate_previous_upload().await? else {
            report.activated = self.ctx.activate(Vec::new()).await?;
            info!(activated = report.activated, "first upload for group; activated all datums");
            return Ok(report);
        };

        let previous = self.fetch_projection(&previous_upload_id, &config).await?;
        let new = self.fetch_projection(self.ctx.upload_id(), &config).await?;
        report.previous_upload_id = Some(previous_upload_id);

        if config.unified {
            report.activated = self.resolve_scope(TypeScope::Unified, &previous, &new).await?;
        } else {
            let previous_by_type = partition_by_type(previous);
            for (datum_type, items) in partition_by_type(new) {
                let previous_items = previous_by_type
                    .get(&datum_type)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                report.activated += self
                    .resolve_scope(TypeScope::Type(datum_type), previous_items, &items)
                    .await?;
            }
        }

        info!(
            previous_upload_id = ?report.previous_upload_id,
            activated = report.activated,
            "alignment finalized"
        );
        Ok(report)
    }
}

#[async_trait]
impl Deduplicator for AlignmentDeduplicator {
    fn name(&self) -> &'static str {
        ALIGNMENT_DEDUPLICATOR_NAME
    }

    fn upload(&self) -> &DataSetUpload {
        &self.ctx.upload
    }

    async fn initialize_dataset(&self) -> Result<(), DedupError> {
        self.ctx
            .persist_config(&DeduplicatorConfig::Alignment(self.config.clone()))
            .await
    }

    async fn add_data_to_dataset(&self, datums: Vec<Datum>) -> Result<(), DedupError> {
        let datums = datums.into_iter().map(|d| self.ctx.stamp(d)).collect();
        self.ctx.insert(datums).await
    }

    async fn finalize_dataset(&self) -> Result<FinalizeReport, DedupError> {
        let span = info_span!("finalize_dataset", upload_id = %self.ctx.upload_id(), strategy = self.name());
        self.finalize().instrument(span).await
    }
}

fn canonical_error(datum: &Datum, field: &'static str, reason: impl Into<String>) -> DedupError {
    DedupError::HashCanonicalization {
        datum_id: datum.id().unwrap_or("<unassigned>").to_string(),
        field,
        reason: reason.into(),
    }
}

fn required_str<'a>(datum: &'a Datum, field: &'static str) -> Result<&'a str, DedupError> {
    match datum.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.as_str()),
        Some(Value::String(_)) => Err(canonical_error(datum, field, "is empty")),
        Some(other) => Err(canonical_error(datum, field, format!("is not a string: {other}"))),
        None => Err(canonical_error(datum, field, "is missing")),
    }
}

fn required_f64(datum: &Datum, field: &'static str) -> Result<f64, DedupError> {
    match datum.get(field).map(|v| (v, v.as_f64())) {
        Some((_, Some(n))) if n.is_finite() => Ok(n),
        Some((v, _)) => Err(canonical_error(datum, field, format!("is not a finite number: {v}"))),
        None => Err(canonical_error(datum, field, "is missing")),
    }
}

/// Fixed five-decimal rendering; `+ 0.0` folds negative zero into zero.
fn fixed_precision(value: f64) -> String {
    let rounded = (value * FINGERPRINT_PRECISION).round() / FINGERPRINT_PRECISION + 0.0;
    format!("{rounded:.5}")
}

fn normalized_blood_glucose(datum: &Datum) -> Result<[String; 2], DedupError> {
    let units = required_str(datum, "units")?;
    let value = required_f64(datum, "value")?;
    let mmol = match units.to_ascii_lowercase().as_str() {
        "mmol/l" => value,
        "mg/dl" => value / MMOL_L_TO_MG_DL,
        other => return Err(canonical_error(datum, "units", format!("unsupported units {other}"))),
    };
    Ok(["mmol/L".to_string(), fixed_precision(mmol)])
}

/// Values come from named fields, so upstream key order never matters; times are
/// rendered in UTC with millisecond precision and blood glucose in mmol/L at five decimals.
pub fn canonical_identity(datum: &Datum) -> Result<Vec<String>, DedupError> {
    let user_id = required_str(datum, fields::USER_ID)?;
    let device_id = required_str(datum, fields::DEVICE_ID)?;
    let raw_time = required_str(datum, fields::TIME)?;
    let time = DateTime::parse_from_rfc3339(raw_time)
        .map_err(|err| canonical_error(datum, fields::TIME, format!("is not RFC 3339: {err}")))?
        .with_timezone(&Utc)
        .to_rfc3339_opts(SecondsFormat::Millis, true);
    let datum_type = required_str(datum, fields::TYPE)?;

    let mut identity = vec![
        user_id.to_string(),
        device_id.to_string(),
        time,
        datum_type.to_string(),
    ];
    match datum_type {
        "cbg" | "smbg" => identity.extend(normalized_blood_glucose(datum)?),
        "basal" => {
            let delivery_type = required_str(datum, "deliveryType")?;
            identity.push(delivery_type.to_string());
            if delivery_type != "suspend" {
                identity.push(fixed_precision(required_f64(datum, "rate")?));
            }
        }
        "bolus" | "deviceEvent" => identity.push(required_str(datum, "subType")?.to_string()),
        _ => {}
    }
    Ok(identity)
}

pub fn fingerprint(datum: &Datum, hash_version: u32) -> Result<String, DedupError> {
    if hash_version != CURRENT_HASH_VERSION {
        return Err(DedupError::InvalidArgument(format!(
            "unsupported hash version {hash_version}"
        )));
    }
    let identity = canonical_identity(datum)?;
    let mut hasher = Sha256::new();
    hasher.update(identity.join("|").as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

pub struct HashDeduplicatorFactory {
    config: HashConfig,
}

impl HashDeduplicatorFactory {
    pub fn new(hash_version: u32) -> Result<Self, DedupError> {
        Ok(Self {
            config: HashConfig::new(hash_version)?,
        })
    }
}

impl DeduplicatorFactory for HashDeduplicatorFactory {
    fn name(&self) -> &'static str {
        HASH_DEDUPLICATOR_NAME
    }

    fn can_deduplicate_dataset(&self, upload: &DataSetUpload) -> Result<bool, DedupError> {
        validate_upload(upload)?;
        Ok(upload
            .declared_deduplicator_name()
            .map_or(true, |name| name == HASH_DEDUPLICATOR_NAME))
    }

    fn new_deduplicator(
        &self,
        upload: &DataSetUpload,
        session: SharedSession,
    ) -> Result<Box<dyn Deduplicator>, DedupError> {
        if !self.can_deduplicate_dataset(upload)? {
            return Err(unclaimed(self.name(), upload));
        }
        Ok(Box::new(HashDeduplicator {
            ctx: DatasetContext::new(upload, session, HASH_DEDUPLICATOR_NAME),
            config: self.config.clone(),
        }))
    }
}

pub struct HashDeduplicator {
    ctx: DatasetContext,
    config: HashConfig,
}

impl HashDeduplicator {
    async fn finalize(&self) -> Result<FinalizeReport, DedupError> {
        let DeduplicatorConfig::Hash(config) = self.ctx.load_persisted_config().await? else {
            return Err(DedupError::InvalidArgument(
                "persisted configuration is not a hash configuration".into(),
            ));
        };
        let mut report = self.ctx.report();

        let query = Query::new(Filter::eq(fields::UPLOAD_ID, self.ctx.upload_id()))
            .sort(vec![SortKey::asc(fields::TIME), SortKey::asc(fields::ID)])
            .project(Projection::of([fields::FINGERPRINT]));
        let docs = self
            .ctx
            .session
            .find_all(Collection::Data, &query)
            .await
            .and_then(Cursor::try_collect)
            .map_err(self.ctx.store_error(Phase::FetchProjection))?;

        let mut candidates = Vec::with_capacity(docs.len());
        for doc in &docs {
            let id = lookup(doc, fields::ID).and_then(Value::as_str);
            let hash = lookup(doc, fields::FINGERPRINT).and_then(Value::as_str);
            match (id, hash) {
                (Some(id), Some(hash)) => candidates.push((id, hash)),
                _ => {
                    return Err(self.ctx.corrupt(
                        Phase::FetchProjection,
                        format!(
                            "datum {} has no hash v{} fingerprint",
                            id.unwrap_or("<unknown>"),
                            config.hash_version
                        ),
                    ))
                }
            }
        }
        if candidates.is_empty() {
            return Ok(report);
        }

        let hashes: Vec<&str> = candidates
            .iter()
            .map(|(_, h)| *h)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let existing_query = Query::new(Filter::and([
            Filter::eq(fields::USER_ID, self.ctx.upload.user_id.as_str()),
            Filter::eq(fields::ACTIVE, true),
            Filter::ne(fields::UPLOAD_ID, self.ctx.upload_id()),
            Filter::is_in(fields::FINGERPRINT, hashes),
        ]))
        .project(Projection::of([fields::FINGERPRINT]));
        let existing: HashSet<String> = self
            .ctx
            .session
            .find_all(Collection::Data, &existing_query)
            .await
            .and_then(Cursor::try_collect)
            .map_err(self.ctx.store_error(Phase::ExistingFingerprints))?
            .iter()
            .filter_map(|doc| lookup(doc, fields::FINGERPRINT).and_then(Value::as_str))
            .map(str::to_string)
            .collect();

        let mut seen = HashSet::new();
        let fresh: Vec<&str> = candidates
            .iter()
            .filter(|(_, hash)| !existing.contains(*hash) && seen.insert(*hash))
            .map(|(id, _)| *id)
            .collect();
        debug!(
            candidates = candidates.len(),
            already_active = existing.len(),
            fresh = fresh.len(),
            "fingerprints resolved"
        );

        if !fresh.is_empty() {
            report.activated = self
                .ctx
                .activate(vec![Filter::is_in(fields::ID, fresh)])
                .await?;
        }
        info!(activated = report.activated, "hash finalized");
        Ok(report)
    }
}

#[async_trait]
impl Deduplicator for HashDeduplicator {
    fn name(&self) -> &'static str {
        HASH_DEDUPLICATOR_NAME
    }

    fn upload(&self) -> &DataSetUpload {
        &self.ctx.upload
    }

    async fn initialize_dataset(&self) -> Result<(), DedupError> {
        self.ctx
            .persist_config(&DeduplicatorConfig::Hash(self.config.clone()))
            .await
    }

    /// Fingerprints the whole batch before inserting anything; one bad datum rejects the batch.
    async fn add_data_to_dataset(&self, datums: Vec<Datum>) -> Result<(), DedupError> {
        let mut stamped = Vec::with_capacity(datums.len());
        for datum in datums {
            let mut datum = self.ctx.stamp(datum);
            let hash = fingerprint(&datum, self.config.hash_version)?;
            datum.set(fields::FINGERPRINT, Value::String(hash));
            stamped.push(datum);
        }
        self.ctx.insert(stamped).await
    }

    async fn finalize_dataset(&self) -> Result<FinalizeReport, DedupError> {
        let span = info_span!("finalize_dataset", upload_id = %self.ctx.upload_id(), strategy = self.name());
        self.finalize().instrument(span).await
    }
}

pub struct NoneDeduplicatorFactory;

impl DeduplicatorFactory for NoneDeduplicatorFactory {
    fn name(&self) -> &'static str {
        NONE_DEDUPLICATOR_NAME
    }

    fn can_deduplicate_dataset(&self, upload: &DataSetUpload) -> Result<bool, DedupError> {
        validate_upload(upload)?;
        Ok(upload.declared_deduplicator_name() == Some(NONE_DEDUPLICATOR_NAME))
    }

    fn new_deduplicator(
        &self,
        upload: &DataSetUpload,
        session: SharedSession,
    ) -> Result<Box<dyn Deduplicator>, DedupError> {
        if !self.can_deduplicate_dataset(upload)? {
            return Err(unclaimed(self.name(), upload));
        }
        Ok(Box::new(NoneDeduplicator {
            ctx: DatasetContext::new(upload, session, NONE_DEDUPLICATOR_NAME),
        }))
    }
}

pub struct NoneDeduplicator {
    ctx: DatasetContext,
}

#[async_trait]
impl Deduplicator for NoneDeduplicator {
    fn name(&self) -> &'static str {
        NONE_DEDUPLICATOR_NAME
    }

    fn upload(&self) -> &DataSetUpload {
        &self.ctx.upload
    }

    async fn initialize_dataset(&self) -> Result<(), DedupError> {
        self.ctx
            .persist_config(&DeduplicatorConfig::None {
                version: NONE_DEDUPLICATOR_VERSION.to_string(),
            })
            .await
    }

    async fn add_data_to_dataset(&self, datums: Vec<Datum>) -> Result<(), DedupError> {
        let datums = datums.into_iter().map(|d| self.ctx.stamp(d)).collect();
        self.ctx.insert(datums).await
    }

    async fn finalize_dataset(&self) -> Result<FinalizeReport, DedupError> {
        self.ctx.load_persisted_config().await?;
        let mut report = self.ctx.report();
        report.activated = self.ctx.activate(Vec::new()).await?;
        info!(upload_id = %self.ctx.upload_id(), activated = report.activated, "none finalized");
        Ok(report)
    }
}

pub struct FinalizeService {
    registry: Arc<DeduplicatorRegistry>,
    session: SharedSession,
    group_locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl FinalizeService {
    pub fn new(registry: Arc<DeduplicatorRegistry>, session: SharedSession) -> Self {
        Self {
            registry,
            session,
            group_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &DeduplicatorRegistry {
        &self.registry
    }

    async fn group_semaphore(&self, group_key: &str) -> Arc<Semaphore> {
        let mut map = self.group_locks.lock().await;
        map.entry(group_key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    async fn release_group(&self, group_key: &str, semaphore: Arc<Semaphore>) {
        let mut map = self.group_locks.lock().await;
        // One reference in the map, one here: nobody else cloned it while we held the map lock.
        if Arc::strong_count(&semaphore) == 2 {
            map.remove(group_key);
        }
    }

    pub async fn active_groups(&self) -> usize {
        self.group_locks.lock().await.len()
    }

    pub async fn open_upload(
        &self,
        upload: DataSetUpload,
    ) -> Result<Box<dyn Deduplicator>, DedupError> {
        let deduplicator = self
            .registry
            .new_deduplicator(&upload, Arc::clone(&self.session))?;
        let doc = upload.to_document().map_err(|err| {
            DedupError::InvalidArgument(format!("serializing upload {}: {err}", upload.upload_id))
        })?;
        self.session
            .insert_all(Collection::Uploads, vec![doc])
            .await
            .map_err(|err| {
                DedupError::store(&upload.upload_id, deduplicator.name(), Phase::Initialize, err)
            })?;
        deduplicator.initialize_dataset().await?;
        info!(upload_id = %upload.upload_id, strategy = deduplicator.name(), "upload opened");
        Ok(deduplicator)
    }

    pub async fn deduplicator_for(
        &self,
        upload_id: &str,
    ) -> Result<Box<dyn Deduplicator>, DedupError> {
        let doc = self
            .session
            .find(
                Collection::Uploads,
                &Query::new(Filter::eq(fields::UPLOAD_ID, upload_id)),
            )
            .await
            .map_err(|err| DedupError::store(upload_id, self.registry.name(), Phase::LoadUpload, err))?
            .ok_or_else(|| DedupError::InvalidArgument(format!("upload {upload_id} is not stored")))?;
        let upload = DataSetUpload::from_document(doc).map_err(|err| {
            DedupError::store(upload_id, self.registry.name(), Phase::LoadUpload, err.into())
        })?;
        self.registry
            .new_deduplicator(&upload, Arc::clone(&self.session))
    }

    pub async fn add_data(&self, upload_id: &str, datums: Vec<Datum>) -> Result<(), DedupError> {
        self.deduplicator_for(upload_id)
            .await?
            .add_data_to_dataset(datums)
            .await
    }

    pub async fn finalize_upload(&self, upload_id: &str) -> Result<FinalizeReport, DedupError> {
        let deduplicator = self.deduplicator_for(upload_id).await?;
        let group_key = deduplicator.upload().group_key();
        let semaphore = self.group_semaphore(&group_key).await;
        let outcome = match semaphore.acquire().await {
            Ok(_permit) => self.finalize_and_close(deduplicator.as_ref()).await,
            Err(_) => Err(DedupError::InvalidArgument("group lock closed".into())),
        };
        self.release_group(&group_key, semaphore).await;
        outcome
    }

    async fn finalize_and_close(
        &self,
        deduplicator: &dyn Deduplicator,
    ) -> Result<FinalizeReport, DedupError> {
        let upload_id = deduplicator.upload().upload_id.as_str();
        let report = deduplicator.finalize_dataset().await?;
        let state = serde_json::to_value(DataState::Closed).map_err(|err| {
            DedupError::InvalidArgument(format!("serializing data state: {err}"))
        })?;
        self.session
            .update_all(
                Collection::Uploads,
                &Filter::eq(fields::UPLOAD_ID, upload_id),
                &Update::set(fields::DATA_STATE, state),
            )
            .await
            .map_err(|err| DedupError::store(upload_id, deduplicator.name(), Phase::Close, err))?;
        Ok(report)
    }

    pub async fn ingest(
        &self,
        upload: DataSetUpload,
        datums: Vec<Datum>,
        batch_size: usize,
    ) -> Result<FinalizeReport, DedupError> {
        let upload_id = upload.upload_id.clone();
        let deduplicator = self.open_upload(upload).await?;
        let mut datums = datums.into_iter().peekable();
        while datums.peek().is_some() {
            let batch: Vec<Datum> = datums.by_ref().take(batch_size.max(1)).collect();
            deduplicator.add_data_to_dataset(batch).await?;
        }
        drop(deduplicator);
        self.finalize_upload(&upload_id).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillOptions {
    pub hash_version: u32,
    pub dry_run: bool,
}

impl Default for BackfillOptions {
    fn default() -> Self {
        Self {
            hash_version: CURRENT_HASH_VERSION,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub scanned: usize,
    pub hashed: usize,
    pub skipped: usize,
}

/// Migration: write fingerprints onto stored datums that lack one.
/// Missing `userId`/`deviceId` are taken from the owning upload for hashing only.
pub async fn backfill_hashes(
    session: &dyn StoreSession,
    options: BackfillOptions,
) -> Result<BackfillReport, DedupError> {
    HashConfig::new(options.hash_version)?;
    let backfill_error = |err: StoreError| DedupError::store("*", HASH_DEDUPLICATOR_NAME, Phase::Backfill, err);

    let cursor = session
        .find_all(
            Collection::Data,
            &Query::new(Filter::exists(fields::FINGERPRINT, false))
                .sort(vec![SortKey::asc(fields::ID)]),
        )
        .await
        .map_err(backfill_error)?;

    let mut uploads: HashMap<String, Option<DataSetUpload>> = HashMap::new();
    let mut report = BackfillReport::default();
    for item in cursor {
        let mut datum = Datum::from_document(item.map_err(backfill_error)?);
        report.scanned += 1;

        let Some(datum_id) = datum.id().map(str::to_string) else {
            warn!("skipping datum without id");
            report.skipped += 1;
            continue;
        };

        if let Some(upload_id) = datum.upload_id().map(str::to_string) {
            if !uploads.contains_key(&upload_id) {
                let owner = session
                    .find(
                        Collection::Uploads,
                        &Query::new(Filter::eq(fields::UPLOAD_ID, upload_id.as_str())),
                    )
                    .await
                    .map_err(backfill_error)?
                    .and_then(|doc| DataSetUpload::from_document(doc).ok());
                uploads.insert(upload_id.clone(), owner);
            }
            if let Some(Some(owner)) = uploads.get(&upload_id) {
                if !datum.contains(fields::USER_ID) {
                    datum.set(fields::USER_ID, Value::String(owner.user_id.clone()));
                }
                if let Some(device_id) = &owner.device_id {
                    if !datum.contains(fields::DEVICE_ID) {
                        datum.set(fields::DEVICE_ID, Value::String(device_id.clone()));
                    }
                }
            }
        }

        let hash = match fingerprint(&datum, options.hash_version) {
            Ok(hash) => hash,
            Err(err) => {
                warn!(datum_id = %datum_id, error = %err, "skipping datum that cannot be fingerprinted");
                report.skipped += 1;
                continue;
            }
        };

        if !options.dry_run {
            session
                .update_all(
                    Collection::Data,
                    &Filter::and([
                        Filter::eq(fields::ID, datum_id.as_str()),
                        Filter::exists(fields::FINGERPRINT, false),
                    ]),
                    &Update::set(fields::FINGERPRINT, hash),
                )
                .await
                .map_err(backfill_error)?;
        }
        report.hashed += 1;
    }

    info!(
        scanned = report.scanned,
        hashed = report.hashed,
        skipped = report.skipped,
        dry_run = options.dry_run,
        "hash backfill complete"
    );
    Ok(report)
}
