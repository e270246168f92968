//! Scripted adapters, recording notifiers and instrumented stores shared by the
//! reconciliation and pipeline tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;
use yard_adapters::{
    AdapterContext, AdapterError, EnrichError, PartitionTarget, SkipReason, SourceAdapter, SourceShape,
};
use yard_core::{
    EnrichmentPatch, ImageRefs, ModelMatch, RawListing, RowListing, StoreMode, StoredVehicle, VehicleRecord,
};
use yard_storage::{FetchError, InMemoryVehicleStore, VehicleStore};

use crate::notify::{NotifyError, Notifier};
use crate::reconcile::FreshListing;

pub fn listing_record(partition: &str, stock_num: &str, year: i32, model: &str) -> VehicleRecord {
    VehicleRecord::new(partition, stock_num, year, model)
}

pub fn fresh(record: VehicleRecord) -> FreshListing {
    FreshListing {
        record,
        raw: RawListing::Row(RowListing::default()),
    }
}

/// Raw JSON listing understood by [`ScriptedAdapter::normalize`].
pub fn raw(stock: &str, year: &str, make: &str, model: &str) -> RawListing {
    RawListing::Json(json!({ "stock": stock, "year": year, "make": make, "model": model }))
}

/// In-process adapter whose listing, lookups and failures are set by the test.
#[derive(Clone, Default)]
pub struct ScriptedAdapter {
    listing: Vec<RawListing>,
    fetch_fails: bool,
    image: Option<String>,
    series: Option<String>,
    enrich_fails: bool,
    model_match: ModelMatch,
    store_mode: StoreMode,
}

impl ScriptedAdapter {
    pub fn with_listing(mut self, listing: Vec<RawListing>) -> Self {
        self.listing = listing;
        self
    }

    pub fn failing_fetch(mut self) -> Self {
        self.fetch_fails = true;
        self
    }

    pub fn with_image(mut self, url: &str) -> Self {
        self.image = Some(url.to_string());
        self
    }

    pub fn with_series(mut self, series: &str) -> Self {
        self.series = Some(series.to_string());
        self
    }

    pub fn failing_enrichment(mut self) -> Self {
        self.enrich_fails = true;
        self
    }

    pub fn matching(mut self, model_match: ModelMatch, store_mode: StoreMode) -> Self {
        self.model_match = model_match;
        self.store_mode = store_mode;
        self
    }
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    fn source_id(&self) -> &'static str {
        "scripted"
    }

    fn shape(&self) -> SourceShape {
        SourceShape::JsonListing
    }

    fn model_match(&self) -> ModelMatch {
        self.model_match
    }

    fn default_store_mode(&self) -> StoreMode {
        self.store_mode
    }

    async fn fetch_listing(
        &self,
        _ctx: &AdapterContext,
        _target: &PartitionTarget,
    ) -> Result<Vec<RawListing>, AdapterError> {
        if self.fetch_fails {
            return Err(FetchError::HttpStatus {
                status: 503,
                url: "https://yard.test/inventory".into(),
            }
            .into());
        }
        Ok(self.listing.clone())
    }

    fn normalize(&self, target: &PartitionTarget, raw: &RawListing) -> Result<VehicleRecord, SkipReason> {
        let RawListing::Json(value) = raw else {
            return Err(SkipReason::Malformed("expected json".into()));
        };
        let field = |key: &'static str| {
            value[key]
                .as_str()
                .map(str::to_string)
                .ok_or(SkipReason::MissingField(key))
        };
        let year_text = field("year")?;
        let year = year_text
            .parse()
            .map_err(|_| SkipReason::InvalidYear(year_text.clone()))?;
        let make = field("make")?;
        if !make.eq_ignore_ascii_case("mercedes-benz") {
            return Err(SkipReason::OutOfScope(make));
        }
        let mut record = VehicleRecord::new(&target.partition_id, field("stock")?, year, &field("model")?);
        record.make = Some(make.to_ascii_uppercase());
        Ok(record)
    }

    async fn enrich(
        &self,
        _ctx: &AdapterContext,
        _raw: &RawListing,
        _record: &VehicleRecord,
    ) -> Result<Option<EnrichmentPatch>, EnrichError> {
        if self.enrich_fails {
            return Err(EnrichError::Shape("detail endpoint returned nothing".into()));
        }
        Ok(self
            .series
            .clone()
            .map(|series| EnrichmentPatch::default().with_attribute("series", Some(series))))
    }

    async fn lookup_image(
        &self,
        _ctx: &AdapterContext,
        _raw: &RawListing,
    ) -> Result<Option<ImageRefs>, EnrichError> {
        Ok(self.image.clone().map(|image| ImageRefs {
            image,
            image_urls: Vec::new(),
        }))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<VehicleRecord>>,
    attempts: AtomicUsize,
    fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<VehicleRecord> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn stock_nums(&self) -> Vec<String> {
        self.records().into_iter().map(|r| r.stock_num).collect()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, record: &VehicleRecord) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(NotifyError::Delivery(FetchError::HttpStatus {
                status: 500,
                url: "https://ha.test/api/webhook/x".into(),
            }));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}

/// Shared log of store mutations in call order.
#[derive(Clone, Default)]
pub struct OpLog(Arc<Mutex<Vec<String>>>);

impl OpLog {
    pub fn wrap<S: VehicleStore>(&self, inner: S) -> RecordingStore<S> {
        RecordingStore {
            inner,
            log: self.clone(),
        }
    }

    pub fn ops(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn push(&self, op: String) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(op);
    }
}

pub struct RecordingStore<S> {
    inner: S,
    log: OpLog,
}

#[async_trait]
impl<S: VehicleStore> VehicleStore for RecordingStore<S> {
    async fn load_partition(&self, partition: &str) -> Result<Vec<StoredVehicle>> {
        self.inner.load_partition(partition).await
    }

    async fn insert(&self, record: &VehicleRecord) -> Result<StoredVehicle> {
        self.log.push(format!("insert {}/{}", record.source_partition, record.stock_num));
        self.inner.insert(record).await
    }

    async fn replace(&self, stored: &StoredVehicle) -> Result<()> {
        self.log.push(format!(
            "replace {}/{}",
            stored.record.source_partition, stored.record.stock_num
        ));
        self.inner.replace(stored).await
    }

    async fn delete(&self, partition: &str, stock_num: &str) -> Result<bool> {
        self.log.push(format!("delete {partition}/{stock_num}"));
        self.inner.delete(partition, stock_num).await
    }
}

/// In-memory store that rejects inserts of one stock number.
pub struct FailingInsertStore {
    inner: InMemoryVehicleStore,
    reject: String,
}

impl FailingInsertStore {
    pub fn new(reject: &str) -> Self {
        Self {
            inner: InMemoryVehicleStore::new(),
            reject: reject.to_string(),
        }
    }
}

#[async_trait]
impl VehicleStore for FailingInsertStore {
    async fn load_partition(&self, partition: &str) -> Result<Vec<StoredVehicle>> {
        self.inner.load_partition(partition).await
    }

    async fn insert(&self, record: &VehicleRecord) -> Result<StoredVehicle> {
        if record.stock_num == self.reject {
            bail!("write rejected for {}", record.stock_num);
        }
        self.inner.insert(record).await
    }

    async fn replace(&self, stored: &StoredVehicle) -> Result<()> {
        self.inner.replace(stored).await
    }

    async fn delete(&self, partition: &str, stock_num: &str) -> Result<bool> {
        self.inner.delete(partition, stock_num).await
    }
}

/// Store whose reads fail, for exercising the load-before-diff abort.
pub struct UnreadableStore;

#[async_trait]
impl VehicleStore for UnreadableStore {
    async fn load_partition(&self, partition: &str) -> Result<Vec<StoredVehicle>> {
        bail!("cannot read partition {partition}")
    }

    async fn insert(&self, record: &VehicleRecord) -> Result<StoredVehicle> {
        bail!("unexpected insert of {}", record.stock_num)
    }

    async fn replace(&self, stored: &StoredVehicle) -> Result<()> {
        bail!("unexpected replace of {}", stored.record.stock_num)
    }

    async fn delete(&self, partition: &str, stock_num: &str) -> Result<bool> {
        bail!("unexpected delete of {partition}/{stock_num}")
    }
}
