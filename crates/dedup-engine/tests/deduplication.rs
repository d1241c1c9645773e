use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dedup_core::{fields, DataSetUpload, Datum, DeduplicatorDescriptor, Document};
use dedup_engine::{
    backfill_hashes, fingerprint, AlignmentConfig, BackfillOptions, BackfillReport, DedupError,
    EngineConfig, DeduplicatorRegistry, FinalizeService, Phase, SharedSession,
    ALIGNMENT_DEDUPLICATOR_NAME, HASH_DEDUPLICATOR_NAME,
};
use dedup_store::{
    Collection, Cursor, DeadlineSession, Filter, MemoryStore, Operation, Query, StoreError,
    StoreSession, Update,
};
use serde_json::{json, Value};

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).single().unwrap()
}

fn service_with(store: &Arc<MemoryStore>, config: &EngineConfig) -> FinalizeService {
    let registry = Arc::new(DeduplicatorRegistry::from_config(config).expect("registry"));
    let session: SharedSession = store.clone();
    FinalizeService::new(registry, session)
}

fn service(store: &Arc<MemoryStore>) -> FinalizeService {
    service_with(store, &EngineConfig::default())
}

fn aligned_upload(minute: u32, params: Value) -> DataSetUpload {
    let mut descriptor = DeduplicatorDescriptor::named(ALIGNMENT_DEDUPLICATOR_NAME);
    if let Value::Object(map) = params {
        descriptor.parameters = map;
    }
    DataSetUpload::new("user-1", Some("pump-1".into()), Some("Dexcom G6".into()), at(minute))
        .with_deduplicator(descriptor)
}

fn by_t() -> Value {
    json!({"sort": ["t"], "match": ["t"]})
}

fn reading(datum_type: &str, t: &str, value: f64) -> Datum {
    Datum::new(datum_type).with("t", t).with("value", value)
}

fn hashed_upload(minute: u32) -> DataSetUpload {
    DataSetUpload::new("user-1", Some("cgm-1".into()), Some("Dexcom G6".into()), at(minute))
}

fn glucose(time: &str, value: f64, units: &str) -> Datum {
    Datum::new("cbg")
        .with("time", time)
        .with("value", value)
        .with("units", units)
}

fn field_in_docs(docs: &[Document], upload_id: &str, field: &str, active: bool) -> Vec<Value> {
    docs.iter()
        .filter(|d| d.get(fields::UPLOAD_ID) == Some(&json!(upload_id)))
        .filter(|d| d.get(fields::ACTIVE) == Some(&json!(active)))
        .filter_map(|d| d.get(field).cloned())
        .collect()
}

async fn active(store: &MemoryStore, upload_id: &str, field: &str) -> Vec<Value> {
    field_in_docs(&store.documents(Collection::Data).await, upload_id, field, true)
}

async fn inactive(store: &MemoryStore, upload_id: &str, field: &str) -> Vec<Value> {
    field_in_docs(&store.documents(Collection::Data).await, upload_id, field, false)
}

async fn data_state(store: &MemoryStore, upload_id: &str) -> Value {
    store
        .documents(Collection::Uploads)
        .await
        .into_iter()
        .find(|d| d.get(fields::UPLOAD_ID) == Some(&json!(upload_id)))
        .and_then(|d| d.get(fields::DATA_STATE).cloned())
        .unwrap_or(Value::Null)
}

#[tokio::test]
async fn first_upload_for_group_activates_everything() {
    let store = Arc::new(MemoryStore::new());
    let service = service(&store);
    let upload = aligned_upload(0, by_t());
    let upload_id = upload.upload_id.clone();

    let report = service
        .ingest(
            upload,
            vec![
                reading("cbg", "00:00", 5.0),
                reading("smbg", "00:01", 6.0),
                reading("cbg", "00:05", 5.2),
            ],
            2,
        )
        .await
        .expect("ingest");

    assert_eq!(report.previous_upload_id, None);
    assert_eq!(report.activated, 3);
    assert_eq!(active(&store, &upload_id, "t").await.len(), 3);
    assert_eq!(data_state(&store, &upload_id).await, json!("closed"));
}

#[tokio::test]
async fn reuploaded_prefix_stays_inactive() {
    let store = Arc::new(MemoryStore::new());
    let service = service(&store);

    let previous = aligned_upload(0, by_t());
    let previous_id = previous.upload_id.clone();
    service
        .ingest(
            previous,
            vec![
                reading("cbg", "2024-01-01T00:00", 5.0),
                reading("cbg", "2024-01-01T00:05", 5.2),
            ],
            10,
        )
        .await
        .expect("previous");

    let next = aligned_upload(10, by_t());
    let next_id = next.upload_id.clone();
    let report = service
        .ingest(
            next,
            vec![
                reading("cbg", "2024-01-01T00:00", 5.0),
                reading("cbg", "2024-01-01T00:05", 5.2),
                reading("cbg", "2024-01-01T00:10", 5.5),
            ],
            10,
        )
        .await
        .expect("next");

    assert_eq!(report.previous_upload_id.as_deref(), Some(previous_id.as_str()));
    assert_eq!(active(&store, &next_id, "t").await, vec![json!("2024-01-01T00:10")]);
    assert_eq!(inactive(&store, &next_id, "t").await.len(), 2);
    assert_eq!(active(&store, &previous_id, "t").await.len(), 2);
}

#[tokio::test]
async fn full_overlap_activates_only_the_tail() {
    let store = Arc::new(MemoryStore::new());
    let service = service(&store);
    let base = ["a", "b", "c"];

    service
        .ingest(
            aligned_upload(0, by_t()),
            base.iter().map(|t| reading("cbg", t, 1.0)).collect(),
            10,
        )
        .await
        .expect("previous");

    let next = aligned_upload(5, by_t());
    let next_id = next.upload_id.clone();
    let mut data: Vec<Datum> = base.iter().map(|t| reading("cbg", t, 1.0)).collect();
    data.push(reading("cbg", "d", 1.0));
    data.push(reading("cbg", "e", 1.0));
    service.ingest(next, data, 10).await.expect("next");

    assert_eq!(active(&store, &next_id, "t").await, vec![json!("d"), json!("e")]);
    assert_eq!(
        inactive(&store, &next_id, "t").await,
        vec![json!("a"), json!("b"), json!("c")]
    );
}

#[tokio::test]
async fn disjoint_upload_is_fully_activated() {
    let store = Arc::new(MemoryStore::new());
    let service = service(&store);
    service
        .ingest(
            aligned_upload(0, by_t()),
            vec![reading("cbg", "a", 1.0), reading("cbg", "b", 1.0)],
            10,
        )
        .await
        .expect("previous");

    let next = aligned_upload(5, by_t());
    let next_id = next.upload_id.clone();
    service
        .ingest(
            next,
            vec![reading("cbg", "c", 1.0), reading("cbg", "d", 1.0)],
            10,
        )
        .await
        .expect("next");

    assert_eq!(active(&store, &next_id, "t").await, vec![json!("c"), json!("d")]);
}

#[tokio::test]
async fn longest_matching_overlap_wins() {
    let store = Arc::new(MemoryStore::new());
    let service = service(&store);
    let params = json!({"sort": ["t"], "match": ["value"]});

    // Overlaps of 3 and 1 both match; 2 does not.
    service
        .ingest(
            aligned_upload(0, params.clone()),
            vec![
                reading("cbg", "01", 1.0),
                reading("cbg", "02", 2.0),
                reading("cbg", "03", 1.0),
            ],
            10,
        )
        .await
        .expect("previous");

    let next = aligned_upload(5, params);
    let next_id = next.upload_id.clone();
    service
        .ingest(
            next,
            vec![
                reading("cbg", "11", 1.0),
                reading("cbg", "12", 2.0),
                reading("cbg", "13", 1.0),
                reading("cbg", "14", 3.0),
            ],
            10,
        )
        .await
        .expect("next");

    assert_eq!(active(&store, &next_id, "t").await, vec![json!("14")]);
}

#[tokio::test]
async fn datum_types_align_independently() {
    let store = Arc::new(MemoryStore::new());
    let service = service(&store);
    service
        .ingest(
            aligned_upload(0, by_t()),
            vec![
                reading("cbg", "a", 1.0),
                reading("smbg", "p", 1.0),
                reading("cbg", "b", 1.0),
                reading("smbg", "q", 1.0),
            ],
            10,
        )
        .await
        .expect("previous");

    let next = aligned_upload(5, by_t());
    let next_id = next.upload_id.clone();
    service
        .ingest(
            next,
            vec![
                reading("cbg", "a", 1.0),
                reading("cbg", "b", 1.0),
                reading("cbg", "c", 1.0),
                reading("smbg", "r", 1.0),
                reading("smbg", "s", 1.0),
                reading("basal", "z", 1.0),
            ],
            10,
        )
        .await
        .expect("next");

    let mut activated = active(&store, &next_id, "t").await;
    activated.sort_by_key(|v| v.as_str().map(str::to_string));
    assert_eq!(
        activated,
        vec![json!("c"), json!("r"), json!("s"), json!("z")]
    );
}

#[tokio::test]
async fn unified_mode_aligns_across_types() {
    let store = Arc::new(MemoryStore::new());
    let service = service(&store);
    let params = json!({"sort": ["t"], "match": ["t"], "unified": true});
    service
        .ingest(
            aligned_upload(0, params.clone()),
            vec![reading("cbg", "1", 1.0), reading("smbg", "2", 1.0)],
            10,
        )
        .await
        .expect("previous");

    let next = aligned_upload(5, params);
    let next_id = next.upload_id.clone();
    service
        .ingest(
            next,
            vec![
                reading("cbg", "1", 1.0),
                reading("smbg", "2", 1.0),
                reading("cbg", "3", 1.0),
            ],
            10,
        )
        .await
        .expect("next");

    assert_eq!(active(&store, &next_id, "t").await, vec![json!("3")]);
}

#[tokio::test]
async fn finalize_twice_yields_the_same_active_set() {
    let store = Arc::new(MemoryStore::new());
    let service = service(&store);
    service
        .ingest(
            aligned_upload(0, by_t()),
            vec![reading("cbg", "a", 1.0), reading("cbg", "b", 1.0)],
            10,
        )
        .await
        .expect("previous");

    let next = aligned_upload(5, by_t());
    let next_id = next.upload_id.clone();
    service
        .ingest(
            next,
            vec![reading("cbg", "b", 1.0), reading("cbg", "c", 1.0)],
            10,
        )
        .await
        .expect("next");
    let once = active(&store, &next_id, "t").await;

    service.finalize_upload(&next_id).await.expect("second finalize");
    assert_eq!(active(&store, &next_id, "t").await, once);
    assert_eq!(once, vec![json!("c")]);
}

#[tokio::test]
async fn finalization_replays_the_persisted_configuration() {
    let store = Arc::new(MemoryStore::new());
    let mut at_init = EngineConfig::default();
    at_init.alignment = AlignmentConfig {
        sort: vec!["t".into()],
        match_fields: vec!["t".into()],
        ..AlignmentConfig::default()
    };
    let mut after_deploy = EngineConfig::default();
    after_deploy.alignment = AlignmentConfig {
        sort: vec!["t".into()],
        match_fields: vec!["value".into()],
        ..AlignmentConfig::default()
    };
    let before = service_with(&store, &at_init);
    let after = service_with(&store, &after_deploy);

    let legacy = |minute| {
        DataSetUpload::new("user-1", Some("pump-1".into()), Some("Paradigm 722".into()), at(minute))
    };
    let previous = legacy(0);
    let previous_id = previous.upload_id.clone();
    before
        .open_upload(previous)
        .await
        .expect("open previous")
        .add_data_to_dataset(vec![reading("basal", "1", 1.0), reading("basal", "2", 2.0)])
        .await
        .expect("add previous");
    after.finalize_upload(&previous_id).await.expect("finalize previous");

    let next = legacy(5);
    let next_id = next.upload_id.clone();
    before.open_upload(next).await.expect("open next");
    before
        .add_data(
            &next_id,
            vec![
                reading("basal", "1", 9.0),
                reading("basal", "2", 2.0),
                reading("basal", "3", 3.0),
            ],
        )
        .await
        .expect("add next");

    let report = after.finalize_upload(&next_id).await.expect("finalize next");
    assert_eq!(report.strategy, ALIGNMENT_DEDUPLICATOR_NAME);
    assert_eq!(active(&store, &next_id, "t").await, vec![json!("3")]);
}

#[tokio::test]
async fn store_failures_surface_and_leave_upload_retryable() {
    let store = Arc::new(MemoryStore::new());
    let service = service(&store);
    service
        .ingest(
            aligned_upload(0, by_t()),
            vec![reading("cbg", "a", 1.0)],
            10,
        )
        .await
        .expect("previous");

    let next = aligned_upload(5, by_t());
    let next_id = next.upload_id.clone();
    service
        .open_upload(next)
        .await
        .expect("open")
        .add_data_to_dataset(vec![reading("cbg", "a", 1.0), reading("cbg", "b", 1.0)])
        .await
        .expect("add");

    store.fail_cursor_after(0).await;
    let err = service.finalize_upload(&next_id).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(
        err,
        DedupError::Store {
            phase: Phase::LocatePrevious,
            ..
        }
    ));

    store.fail_next(Operation::UpdateAll, "primary stepped down").await;
    let err = service.finalize_upload(&next_id).await.unwrap_err();
    assert!(matches!(
        err,
        DedupError::Store {
            phase: Phase::Activate,
            ..
        }
    ));
    assert!(active(&store, &next_id, "t").await.is_empty());
    assert_eq!(data_state(&store, &next_id).await, json!("open"));

    service.finalize_upload(&next_id).await.expect("retry");
    assert_eq!(active(&store, &next_id, "t").await, vec![json!("b")]);
    assert_eq!(data_state(&store, &next_id).await, json!("closed"));
}

#[tokio::test]
async fn unclaimed_upload_is_not_found_and_not_stored() {
    let store = Arc::new(MemoryStore::new());
    let service = service(&store);
    let upload = hashed_upload(0).with_deduplicator(DeduplicatorDescriptor::named("org.example.unknown"));

    let err = service.open_upload(upload).await.err().expect("unclaimed");
    assert!(matches!(err, DedupError::NotFound(_)));
    assert!(store.documents(Collection::Uploads).await.is_empty());
}

#[tokio::test]
async fn hash_strategy_skips_fingerprints_already_active() {
    let store = Arc::new(MemoryStore::new());
    let service = service(&store);

    let first = hashed_upload(0);
    let first_id = first.upload_id.clone();
    let report = service
        .ingest(
            first,
            vec![
                glucose("2024-01-01T00:00:00Z", 5.0, "mmol/L"),
                glucose("2024-01-01T00:05:00Z", 5.2, "mmol/L"),
            ],
            10,
        )
        .await
        .expect("first");
    assert_eq!(report.strategy, HASH_DEDUPLICATOR_NAME);
    assert_eq!(active(&store, &first_id, "time").await.len(), 2);

    // Out of order, mixed units, and a duplicate within the upload itself.
    let second = hashed_upload(10);
    let second_id = second.upload_id.clone();
    service
        .ingest(
            second,
            vec![
                glucose("2024-01-01T00:10:00Z", 5.5, "mmol/L"),
                glucose("2024-01-01T01:05:00+01:00", 5.2 * 18.01559, "mg/dL"),
                glucose("2024-01-01T00:10:00.000Z", 5.5, "mmol/L"),
            ],
            1,
        )
        .await
        .expect("second");

    // Within the upload the first by (time, id) survives; ".000Z" sorts before "Z".
    assert_eq!(
        active(&store, &second_id, "time").await,
        vec![json!("2024-01-01T00:10:00.000Z")]
    );
    assert_eq!(inactive(&store, &second_id, "time").await.len(), 2);

    let active_before = active(&store, &second_id, "id").await;
    service.finalize_upload(&second_id).await.expect("refinalize");
    assert_eq!(active(&store, &second_id, "id").await, active_before);
}

#[tokio::test]
async fn hash_batch_with_uncanonical_datum_is_rejected_whole() {
    let store = Arc::new(MemoryStore::new());
    let service = service(&store);
    let deduplicator = service.open_upload(hashed_upload(0)).await.expect("open");

    let err = deduplicator
        .add_data_to_dataset(vec![
            glucose("2024-01-01T00:00:00Z", 5.0, "mmol/L"),
            Datum::new("cbg").with("value", 5.0).with("units", "mmol/L"),
        ])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        DedupError::HashCanonicalization { field: "time", .. }
    ));
    assert!(store.documents(Collection::Data).await.is_empty());
}

#[tokio::test]
async fn backfill_writes_fingerprints_matching_the_hash_strategy() {
    let store = Arc::new(MemoryStore::new());
    let mut legacy = hashed_upload(0);
    legacy.upload_id = "legacy-1".into();
    store
        .insert_all(Collection::Uploads, vec![legacy.to_document().unwrap()])
        .await
        .unwrap();

    // h1 carries its own identity; h2 relies on the owning upload; h3 has no time.
    let raw = |id: &str, time: Option<&str>, value: f64, owned: bool| {
        let mut datum = Datum::new("cbg")
            .with("id", id)
            .with("uploadId", "legacy-1")
            .with("units", "mg/dL")
            .with("value", value)
            .with("active", true);
        if let Some(time) = time {
            datum = datum.with("time", time);
        }
        if owned {
            datum = datum.with("userId", "user-1").with("deviceId", "cgm-1");
        }
        datum.into_document()
    };
    store
        .insert_all(
            Collection::Data,
            vec![
                raw("h1", Some("2024-01-01T00:00:00Z"), 90.0, true),
                raw("h2", Some("2024-01-01T00:05:00Z"), 100.0, false),
                raw("h3", None, 110.0, true),
            ],
        )
        .await
        .unwrap();

    let dry = backfill_hashes(
        store.as_ref(),
        BackfillOptions {
            dry_run: true,
            ..BackfillOptions::default()
        },
    )
    .await
    .expect("dry run");
    assert_eq!(dry, BackfillReport { scanned: 3, hashed: 2, skipped: 1 });
    assert!(store
        .documents(Collection::Data)
        .await
        .iter()
        .all(|d| !d.contains_key("_deduplicator")));

    let report = backfill_hashes(store.as_ref(), BackfillOptions::default())
        .await
        .expect("backfill");
    assert_eq!(report, BackfillReport { scanned: 3, hashed: 2, skipped: 1 });

    let expected = |doc: Document| fingerprint(&Datum::from_document(doc), 1).unwrap();
    let stored = store.documents(Collection::Data).await;
    assert_eq!(
        stored[0]["_deduplicator"]["hash"],
        json!(expected(raw("h1", Some("2024-01-01T00:00:00Z"), 90.0, true)))
    );
    assert_eq!(
        stored[1]["_deduplicator"]["hash"],
        json!(expected(raw("h2", Some("2024-01-01T00:05:00Z"), 100.0, true)))
    );
    assert!(!stored[1].contains_key("userId"));

    let again = backfill_hashes(store.as_ref(), BackfillOptions::default())
        .await
        .expect("rerun");
    assert_eq!(again, BackfillReport { scanned: 1, hashed: 0, skipped: 1 });

    let service = service(&store);
    let next = hashed_upload(10);
    let next_id = next.upload_id.clone();
    service
        .ingest(
            next,
            vec![
                glucose("2024-01-01T00:00:00Z", 4.99567, "mmol/L"),
                glucose("2024-01-01T00:10:00Z", 6.0, "mmol/L"),
            ],
            10,
        )
        .await
        .expect("ingest after backfill");
    assert_eq!(
        active(&store, &next_id, "time").await,
        vec![json!("2024-01-01T00:10:00Z")]
    );
}

/// Delays every `find_all` and records how many run at once.
struct InFlightTracker {
    inner: Arc<MemoryStore>,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlightTracker {
    fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl StoreSession for InFlightTracker {
    async fn find_all(&self, collection: Collection, query: &Query) -> Result<Cursor, StoreError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let result = self.inner.find_all(collection, query).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn find(&self, collection: Collection, query: &Query) -> Result<Option<Document>, StoreError> {
        self.inner.find(collection, query).await
    }

    async fn insert_all(&self, collection: Collection, documents: Vec<Document>) -> Result<(), StoreError> {
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

async fn open_with_data(service: &FinalizeService, upload: DataSetUpload, data: Vec<Datum>) -> String {
    let upload_id = upload.upload_id.clone();
    service
        .open_upload(upload)
        .await
        .expect("open")
        .add_data_to_dataset(data)
        .await
        .expect("add");
    upload_id
}

#[tokio::test]
async fn finalizes_serialize_within_a_group_only() {
    let store = Arc::new(MemoryStore::new());
    let tracker = Arc::new(InFlightTracker::new(store.clone()));
    let session: SharedSession = tracker.clone();
    let registry = Arc::new(DeduplicatorRegistry::from_config(&EngineConfig::default()).unwrap());
    let service = FinalizeService::new(registry, session);

    let first = open_with_data(&service, aligned_upload(0, by_t()), vec![reading("cbg", "a", 1.0)]).await;
    let second = open_with_data(
        &service,
        aligned_upload(5, by_t()),
        vec![reading("cbg", "a", 1.0), reading("cbg", "b", 1.0)],
    )
    .await;

    let (a, b) = tokio::join!(service.finalize_upload(&first), service.finalize_upload(&second));
    a.expect("first finalize");
    b.expect("second finalize");
    assert_eq!(tracker.peak.load(Ordering::SeqCst), 1);
    assert_eq!(data_state(&store, &first).await, json!("closed"));
    assert_eq!(data_state(&store, &second).await, json!("closed"));

    // Another device of the same account is a separate group and may run alongside.
    let mut other_device = aligned_upload(10, by_t());
    other_device.device_id = Some("pump-2".into());
    let third = open_with_data(&service, aligned_upload(10, by_t()), vec![reading("cbg", "c", 1.0)]).await;
    let fourth = open_with_data(&service, other_device, vec![reading("cbg", "z", 1.0)]).await;
    tracker.peak.store(0, Ordering::SeqCst);
    let (c, d) = tokio::join!(service.finalize_upload(&third), service.finalize_upload(&fourth));
    c.expect("third finalize");
    d.expect("fourth finalize");
    assert_eq!(tracker.peak.load(Ordering::SeqCst), 2);
    assert_eq!(service.active_groups().await, 0);
}

#[tokio::test]
async fn group_locks_are_released_after_finalize() {
    let store = Arc::new(MemoryStore::new());
    let service = service(&store);

    let upload_id = open_with_data(&service, aligned_upload(0, by_t()), vec![reading("cbg", "a", 1.0)]).await;
    service.finalize_upload(&upload_id).await.expect("finalize");
    assert_eq!(service.active_groups().await, 0);

    let failing = open_with_data(&service, aligned_upload(5, by_t()), vec![reading("cbg", "b", 1.0)]).await;
    store.fail_cursor_after(0).await;
    assert!(service.finalize_upload(&failing).await.is_err());
    assert_eq!(service.active_groups().await, 0);
}

#[tokio::test]
async fn projection_cursor_failure_aborts_alignment_finalize() {
    let store = Arc::new(MemoryStore::new());
    let service = service(&store);
    service
        .ingest(aligned_upload(0, by_t()), vec![reading("cbg", "a", 1.0)], 10)
        .await
        .expect("previous");
    let next_id = open_with_data(
        &service,
        aligned_upload(5, by_t()),
        vec![reading("cbg", "a", 1.0), reading("cbg", "b", 1.0)],
    )
    .await;

    // The upload lookup passes; the previous dataset's projection breaks mid-stream.
    store.fail_later_cursor(1, 0).await;
    let err = service.finalize_upload(&next_id).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(
        err,
        DedupError::Store {
            phase: Phase::FetchProjection,
            source: StoreError::Cursor(_),
            ..
        }
    ));
    assert!(active(&store, &next_id, "t").await.is_empty());
    assert_eq!(data_state(&store, &next_id).await, json!("open"));

    service.finalize_upload(&next_id).await.expect("retry");
    assert_eq!(active(&store, &next_id, "t").await, vec![json!("b")]);
}

#[tokio::test]
async fn existing_fingerprint_cursor_failure_aborts_hash_finalize() {
    let store = Arc::new(MemoryStore::new());
    let service = service(&store);
    service
        .ingest(hashed_upload(0), vec![glucose("2024-01-01T00:00:00Z", 5.0, "mmol/L")], 10)
        .await
        .expect("first");
    let next_id = open_with_data(
        &service,
        hashed_upload(5),
        vec![
            glucose("2024-01-01T00:00:00Z", 5.0, "mmol/L"),
            glucose("2024-01-01T00:05:00Z", 5.4, "mmol/L"),
        ],
    )
    .await;

    store.fail_later_cursor(1, 0).await;
    let err = service.finalize_upload(&next_id).await.unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(
        err,
        DedupError::Store {
            phase: Phase::ExistingFingerprints,
            ..
        }
    ));
    assert!(active(&store, &next_id, "time").await.is_empty());
    assert_eq!(data_state(&store, &next_id).await, json!("open"));

    service.finalize_upload(&next_id).await.expect("retry");
    assert_eq!(
        active(&store, &next_id, "time").await,
        vec![json!("2024-01-01T00:05:00Z")]
    );
}

#[tokio::test]
async fn corrupt_previous_upload_is_a_store_error_not_a_caller_error() {
    let store = Arc::new(MemoryStore::new());
    let service = service(&store);
    let mut broken = aligned_upload(0, by_t()).to_document().unwrap();
    broken.insert(fields::CREATED_TIME.into(), json!("yesterday"));
    store.insert_all(Collection::Uploads, vec![broken]).await.unwrap();

    let next_id = open_with_data(&service, aligned_upload(5, by_t()), vec![reading("cbg", "a", 1.0)]).await;
    let err = service.finalize_upload(&next_id).await.unwrap_err();
    assert!(!err.is_retryable());
    assert!(matches!(
        err,
        DedupError::Store {
            phase: Phase::LocatePrevious,
            source: StoreError::Corrupt(_),
            ..
        }
    ));
}

#[tokio::test]
async fn numeric_spelling_does_not_defeat_alignment() {
    let store = Arc::new(MemoryStore::new());
    let service = service(&store);
    let params = json!({"sort": ["t"], "match": ["t", "value"]});
    service
        .ingest(
            aligned_upload(0, params.clone()),
            vec![reading("cbg", "a", 5.0), reading("cbg", "b", 6.0)],
            10,
        )
        .await
        .expect("previous");

    let integral = |t: &str, value: i64| Datum::new("cbg").with("t", t).with("value", value);
    let next = aligned_upload(5, params);
    let next_id = next.upload_id.clone();
    service
        .ingest(next, vec![integral("a", 5), integral("b", 6), integral("c", 7)], 10)
        .await
        .expect("re-upload");

    assert_eq!(active(&store, &next_id, "t").await, vec![json!("c")]);
}

#[tokio::test]
async fn deadline_wrapped_session_serves_the_pipeline() {
    let store = Arc::new(MemoryStore::new());
    let session: SharedSession = Arc::new(DeadlineSession::new(store.clone(), Duration::from_secs(5)));
    let registry = Arc::new(DeduplicatorRegistry::from_config(&EngineConfig::default()).unwrap());
    let service = FinalizeService::new(registry, session);

    let upload = hashed_upload(0);
    let upload_id = upload.upload_id.clone();
    service
        .ingest(upload, vec![glucose("2024-01-01T00:00:00Z", 5.0, "mmol/L")], 10)
        .await
        .expect("ingest");
    assert_eq!(active(&store, &upload_id, "time").await.len(), 1);
}

#[tokio::test]
async fn refinalizing_an_older_upload_ignores_newer_ones() {
    let store = Arc::new(MemoryStore::new());
    let service = service(&store);

    let older = aligned_upload(0, by_t());
    let older_id = older.upload_id.clone();
    service
        .ingest(older, vec![reading("cbg", "a", 1.0), reading("cbg", "b", 1.0)], 10)
        .await
        .expect("older");
    service
        .ingest(
            aligned_upload(5, by_t()),
            vec![reading("cbg", "a", 1.0), reading("cbg", "b", 1.0)],
            10,
        )
        .await
        .expect("newer");

    let report = service.finalize_upload(&older_id).await.expect("refinalize");
    assert_eq!(report.previous_upload_id, None);
    assert_eq!(active(&store, &older_id, "t").await.len(), 2);
}
