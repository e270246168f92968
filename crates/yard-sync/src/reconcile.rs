//! Snapshot reconciliation for one partition: the fresh fetch is the full
//! current inventory, and the persisted set is brought in line with it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use yard_adapters::{AdapterContext, SourceAdapter};
use yard_core::{Enrichment, ImageRefs, RawListing, StoredVehicle, VehicleRecord};
use yard_storage::{is_well_formed_url, VehicleStore};

use crate::health::HealthLatch;
use crate::notify::Notifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Fetching,
    Diffing,
    Applying,
    Done,
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunState::Fetching => "fetching",
            RunState::Diffing => "diffing",
            RunState::Applying => "applying",
            RunState::Done => "done",
            RunState::Aborted => "aborted",
        })
    }
}

/// A normalized, classified record together with the listing it came from, which
/// secondary lookups need for their own identifiers.
#[derive(Debug, Clone)]
pub struct FreshListing {
    pub record: VehicleRecord,
    pub raw: RawListing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileStats {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub duplicates: usize,
    pub foreign: usize,
    pub notified: usize,
    pub notify_failures: usize,
    pub enrichment_failures: usize,
    pub store_failures: usize,
}

pub struct Reconciler<'a> {
    pub store: &'a dyn VehicleStore,
    pub notifier: &'a dyn Notifier,
    pub adapter: &'a dyn SourceAdapter,
    pub ctx: &'a AdapterContext,
}

impl Reconciler<'_> {
    /// Apply `fresh` to `partition`. Only the initial load can fail; once mutations
    /// start, individual failures are counted and latched into `health`.
    pub async fn run(
        &self,
        partition: &str,
        fresh: Vec<FreshListing>,
        health: &mut HealthLatch,
    ) -> Result<ReconcileStats> {
        let persisted: BTreeMap<String, StoredVehicle> = self
            .store
            .load_partition(partition)
            .await
            .with_context(|| format!("loading persisted state for {partition}"))?
            .into_iter()
            .map(|doc| (doc.record.stock_num.clone(), doc))
            .collect();

        let mut stats = ReconcileStats::default();
        let mut seen = BTreeSet::new();
        let mut changes = Vec::with_capacity(fresh.len());
        for item in fresh {
            if item.record.source_partition != partition {
                error!(
                    partition,
                    record_partition = %item.record.source_partition,
                    stock_num = %item.record.stock_num,
                    "record belongs to another partition; rejected"
                );
                health.fail(format!(
                    "foreign record {}/{}",
                    item.record.source_partition, item.record.stock_num
                ));
                stats.foreign += 1;
                continue;
            }
            if seen.insert(item.record.stock_num.clone()) {
                changes.push(item);
            } else {
                warn!(partition, stock_num = %item.record.stock_num, "duplicate stock number in fetch; keeping first");
                stats.duplicates += 1;
            }
        }
        debug!(
            partition,
            fresh = changes.len(),
            persisted = persisted.len(),
            "diff inputs loaded"
        );

        for item in changes {
            match persisted.get(&item.record.stock_num) {
                None => self.insert(item, health, &mut stats).await,
                Some(existing) => self.fill_forward(existing, item, health, &mut stats).await,
            }
        }

        // Deletes only after every insert and update above has been applied.
        for stock_num in persisted.keys().filter(|k| !seen.contains(*k)) {
            match self.store.delete(partition, stock_num).await {
                Ok(true) => {
                    info!(partition, stock_num = %stock_num, "deleted departed listing");
                    stats.deleted += 1;
                }
                Ok(false) => debug!(partition, stock_num = %stock_num, "already gone"),
                Err(err) => {
                    error!(partition, stock_num = %stock_num, error = %format!("{err:#}"), "delete failed");
                    health.fail(format!("delete {stock_num}: {err}"));
                    stats.store_failures += 1;
                }
            }
        }
        Ok(stats)
    }

    async fn insert(&self, item: FreshListing, health: &mut HealthLatch, stats: &mut ReconcileStats) {
        let FreshListing { mut record, raw } = item;

        match self.adapter.enrich(self.ctx, &raw, &record).await {
            Ok(Some(patch)) => record.apply_enrichment(patch),
            Ok(None) => {}
            Err(err) => {
                warn!(stock_num = %record.stock_num, error = %err, "enrichment failed; marking unknown");
                record.enrichment = Enrichment::Unknown;
                health.fail(format!("enrich {}: {err}", record.stock_num));
                stats.enrichment_failures += 1;
            }
        }
        if !has_usable_image(&record) {
            if let Some(refs) = self.find_image(&raw, &record.stock_num, health).await {
                record.apply_images(refs);
            }
        }

        match self.store.insert(&record).await {
            Ok(_) => {
                info!(
                    stock_num = %record.stock_num,
                    year = record.year,
                    model = %record.model,
                    interest_level = record.interest_level,
                    "inserted new listing"
                );
                stats.inserted += 1;
                self.notify(&record, health, stats).await;
            }
            Err(err) => {
                error!(stock_num = %record.stock_num, error = %format!("{err:#}"), "insert failed");
                health.fail(format!("insert {}: {err}", record.stock_num));
                stats.store_failures += 1;
            }
        }
    }

    async fn fill_forward(
        &self,
        existing: &StoredVehicle,
        item: FreshListing,
        health: &mut HealthLatch,
        stats: &mut ReconcileStats,
    ) {
        if has_usable_image(&existing.record) {
            stats.unchanged += 1;
            return;
        }

        let fresh = item.record;
        let candidate = match fresh.image.as_deref().filter(|i| !i.trim().is_empty()) {
            Some(image) => Some(ImageRefs {
                image: image.to_string(),
                image_urls: fresh.image_urls.clone(),
            }),
            None => self.find_image(&item.raw, &fresh.stock_num, health).await,
        };
        let Some(refs) = candidate.filter(|r| existing.record.image.as_deref() != Some(r.image.as_str()))
        else {
            stats.unchanged += 1;
            return;
        };

        let mut merged = existing.clone();
        merged.record.image = Some(refs.image);
        if !refs.image_urls.is_empty() {
            merged.record.image_urls = refs.image_urls;
        }
        match self.store.replace(&merged).await {
            Ok(()) => {
                info!(stock_num = %merged.record.stock_num, "filled forward image reference");
                stats.updated += 1;
                self.notify(&merged.record, health, stats).await;
            }
            Err(err) => {
                error!(stock_num = %merged.record.stock_num, error = %format!("{err:#}"), "update failed");
                health.fail(format!("update {}: {err}", merged.record.stock_num));
                stats.store_failures += 1;
            }
        }
    }

    async fn find_image(&self, raw: &RawListing, stock_num: &str, health: &mut HealthLatch) -> Option<ImageRefs> {
        match self.adapter.lookup_image(self.ctx, raw).await {
            Ok(refs) => refs,
            Err(err) => {
                warn!(stock_num, error = %err, "image lookup failed");
                health.fail(format!("image lookup {stock_num}: {err}"));
                None
            }
        }
    }

    async fn notify(&self, record: &VehicleRecord, health: &mut HealthLatch, stats: &mut ReconcileStats) {
        match self.notifier.notify(record).await {
            Ok(()) => stats.notified += 1,
            Err(err) => {
                warn!(stock_num = %record.stock_num, error = %err, "notification failed; change stands");
                health.fail(format!("notify {}: {err}", record.stock_num));
                stats.notify_failures += 1;
            }
        }
    }
}

fn has_usable_image(record: &VehicleRecord) -> bool {
    record.image.as_deref().is_some_and(is_well_formed_url)
}
