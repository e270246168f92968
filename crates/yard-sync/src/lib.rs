//! Run orchestration: configuration, the source registry, and the per-partition
//! fetch → normalize → classify → reconcile → health pipeline.

mod health;
mod notify;
mod reconcile;
#[cfg(test)]
mod testing;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;
use yard_adapters::{adapter_for_source, AdapterContext, PartitionTarget, SourceAdapter};
use yard_core::{ModelMatch, RawListing, StoreMode};
use yard_storage::{
    open_store, path_slug, HealthFileStore, HttpClientConfig, HttpFetcher, InMemoryVehicleStore, RetryPolicy, Transport,
    VehicleStore,
};

pub use health::{HealthLatch, HealthReporter, HealthStatus};
pub use notify::{LogOnlyNotifier, Notifier, NotifyError, WebhookNotifier};
pub use reconcile::{FreshListing, ReconcileStats, Reconciler, RunState};

pub const CRATE_NAME: &str = "yard-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_url: String,
    pub webhook_url: Option<String>,
    pub health_dir: PathBuf,
    pub registry_path: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub retry: RetryPolicy,
    pub dry_run: bool,
    /// Restrict the run to these source ids; empty means every enabled source.
    pub only_sources: Vec<String>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str, default: u64| {
            var(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };
        let defaults = RetryPolicy::default();

        let webhook_url = var("YARD_WEBHOOK_URL").or_else(|| {
            let base = var("HOME_ASSISTANT_BASE_URL")?;
            let id = var("HOME_ASSISTANT_WEBHOOK_ID")?;
            Some(format!("{}/api/webhook/{}", base.trim_end_matches('/'), id.trim()))
        });

        Self {
            store_url: var("YARD_STORE_URL").unwrap_or_else(|| "file://./data".to_string()),
            webhook_url,
            health_dir: var("YARD_HEALTH_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp/yardwatch")),
            registry_path: var("YARD_REGISTRY")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sources.yaml")),
            user_agent: var("YARD_USER_AGENT").unwrap_or_else(|| "yardwatch/0.1".to_string()),
            http_timeout_secs: number("YARD_HTTP_TIMEOUT_SECS", 30),
            retry: RetryPolicy {
                max_attempts: number("YARD_RETRY_MAX_ATTEMPTS", defaults.max_attempts as u64).max(1) as usize,
                backoff: Duration::from_secs(number("YARD_RETRY_BACKOFF_SECS", defaults.backoff.as_secs())),
            },
            dry_run: false,
            only_sources: Vec::new(),
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.only_sources = sources;
        self
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Preset name; defaults to `source_id`.
    #[serde(default)]
    pub adapter: Option<String>,
    /// Overrides the adapter's own E-Class matching rule.
    #[serde(default)]
    pub model_match: Option<ModelMatch>,
    #[serde(default)]
    pub partitions: Vec<PartitionConfig>,
}

fn enabled_by_default() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PartitionConfig {
    pub partition_id: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub store_mode: Option<StoreMode>,
}

impl PartitionConfig {
    pub fn named(partition_id: impl Into<String>) -> Self {
        Self {
            partition_id: partition_id.into(),
            location: None,
            params: BTreeMap::new(),
            store_mode: None,
        }
    }

    pub fn target(&self) -> PartitionTarget {
        let mut target = PartitionTarget::new(&self.partition_id);
        if let Some(location) = &self.location {
            target = target.with_location(location);
        }
        for (name, value) in &self.params {
            target = target.with_param(name, value);
        }
        target
    }
}

impl SourceConfig {
    pub fn adapter_name(&self) -> &str {
        self.adapter.as_deref().unwrap_or(&self.source_id)
    }

    /// Configured partitions, or a single partition named after the source.
    pub fn effective_partitions(&self) -> Vec<PartitionConfig> {
        if self.partitions.is_empty() {
            vec![PartitionConfig::named(&self.source_id)]
        } else {
            self.partitions.clone()
        }
    }
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        registry.validate()?;
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Partition ids key health files and store scopes, so they must be unique
    /// across the whole registry, down to their filesystem slug.
    pub fn validate(&self) -> Result<()> {
        let mut sources = BTreeSet::new();
        let mut partitions = BTreeSet::new();
        let mut slugs = BTreeMap::new();
        for source in &self.sources {
            if source.source_id.trim().is_empty() {
                bail!("source with empty source_id");
            }
            if !sources.insert(source.source_id.as_str()) {
                bail!("duplicate source_id {}", source.source_id);
            }
            for partition in source.effective_partitions() {
                if partition.partition_id.trim().is_empty() {
                    bail!("source {} has a partition with empty partition_id", source.source_id);
                }
                if !partitions.insert(partition.partition_id.clone()) {
                    bail!("duplicate partition_id {}", partition.partition_id);
                }
                let slug = path_slug(&partition.partition_id);
                if let Some(existing) = slugs.insert(slug.clone(), partition.partition_id.clone()) {
                    bail!(
                        "partition_ids {existing} and {} both map to file name {slug}",
                        partition.partition_id
                    );
                }
            }
        }
        Ok(())
    }

    pub fn source(&self, source_id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn partition_ids(&self) -> Vec<String> {
        self.sources
            .iter()
            .flat_map(|s| s.effective_partitions())
            .map(|p| p.partition_id)
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PartitionSummary {
    pub source_id: String,
    pub partition_id: String,
    pub state: RunState,
    /// Every state the run passed through, ending with `state`.
    pub transitions: Vec<RunState>,
    pub fetched: usize,
    pub skipped: usize,
    pub out_of_scope: usize,
    pub filtered: usize,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub notify_failures: usize,
    pub health: HealthStatus,
    pub health_path: Option<PathBuf>,
}

impl PartitionSummary {
    fn new(source_id: &str, partition_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            partition_id: partition_id.to_string(),
            state: RunState::Fetching,
            transitions: vec![RunState::Fetching],
            fetched: 0,
            skipped: 0,
            out_of_scope: 0,
            filtered: 0,
            inserted: 0,
            updated: 0,
            deleted: 0,
            unchanged: 0,
            notify_failures: 0,
            health: HealthStatus::Healthy,
            health_path: None,
        }
    }

    fn enter(&mut self, state: RunState) {
        debug!(from = %self.state, to = %state, "partition state change");
        self.state = state;
        self.transitions.push(state);
    }

    fn absorb(&mut self, stats: ReconcileStats) {
        self.inserted = stats.inserted;
        self.updated = stats.updated;
        self.deleted = stats.deleted;
        self.unchanged = stats.unchanged;
        self.notify_failures = stats.notify_failures;
    }
}

impl fmt::Display for PartitionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}: {} fetched={} skipped={} inserted={} updated={} deleted={} notify_failures={} health={}",
            self.source_id,
            self.partition_id,
            self.state,
            self.fetched,
            self.skipped,
            self.inserted,
            self.updated,
            self.deleted,
            self.notify_failures,
            self.health
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub partitions: Vec<PartitionSummary>,
}

impl SyncRunSummary {
    pub fn all_healthy(&self) -> bool {
        self.partitions.iter().all(|p| p.health == HealthStatus::Healthy)
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: SourceRegistry,
    store: Arc<dyn VehicleStore>,
    notifier: Arc<dyn Notifier>,
    transport: Arc<dyn Transport>,
    health: HealthReporter,
    adapters: BTreeMap<String, Arc<dyn SourceAdapter>>,
}

impl SyncPipeline {
    pub async fn new(config: SyncConfig) -> Result<Self> {
        let registry = SourceRegistry::load(&config.registry_path).await?;
        let transport: Arc<dyn Transport> = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
        })?);

        let store: Arc<dyn VehicleStore> = if config.dry_run {
            Arc::new(InMemoryVehicleStore::new())
        } else {
            Arc::from(
                open_store(&config.store_url)
                    .await
                    .with_context(|| format!("opening store {}", config.store_url))?,
            )
        };
        let notifier: Arc<dyn Notifier> = match (&config.webhook_url, config.dry_run) {
            (Some(url), false) => Arc::new(WebhookNotifier::new(url, transport.clone())),
            _ => Arc::new(LogOnlyNotifier),
        };

        Ok(Self::from_parts(config, registry, store, notifier, transport))
    }

    pub fn from_parts(
        config: SyncConfig,
        registry: SourceRegistry,
        store: Arc<dyn VehicleStore>,
        notifier: Arc<dyn Notifier>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let health = HealthReporter::new(HealthFileStore::new(config.health_dir.clone()));
        Self {
            config,
            registry,
            store,
            notifier,
            transport,
            health,
            adapters: BTreeMap::new(),
        }
    }

    /// Register an adapter under `name`, taking precedence over the built-in presets.
    pub fn with_adapter(mut self, name: &str, adapter: impl SourceAdapter + 'static) -> Self {
        self.adapters.insert(name.to_string(), Arc::new(adapter));
        self
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    fn adapter_for(&self, source: &SourceConfig) -> Result<Arc<dyn SourceAdapter>> {
        let name = source.adapter_name();
        if let Some(adapter) = self.adapters.get(name) {
            return Ok(adapter.clone());
        }
        adapter_for_source(name)
            .map(Arc::from)
            .with_context(|| format!("no adapter registered for {name} (source {})", source.source_id))
    }

    /// Sources selected for this run with their adapters resolved. Unknown names are
    /// configuration errors and stop the run before any partition is touched.
    fn selected_sources(&self) -> Result<Vec<(&SourceConfig, Arc<dyn SourceAdapter>)>> {
        for name in &self.config.only_sources {
            if self.registry.source(name).is_none() {
                bail!("unknown source {name}; not present in the registry");
            }
        }
        self.registry
            .sources
            .iter()
            .filter(|s| {
                if self.config.only_sources.is_empty() {
                    s.enabled
                } else {
                    self.config.only_sources.contains(&s.source_id)
                }
            })
            .map(|s| self.adapter_for(s).map(|adapter| (s, adapter)))
            .collect()
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let selected = self.selected_sources()?;
        let ctx = AdapterContext::new(self.transport.clone(), self.config.retry);
        info!(run_id = %ctx.run_id, sources = selected.len(), dry_run = self.config.dry_run, "sync run starting");

        let mut partitions = Vec::new();
        for (source, adapter) in selected {
            for partition in source.effective_partitions() {
                let span = info_span!(
                    "partition_run",
                    run_id = %ctx.run_id,
                    source_id = %source.source_id,
                    partition = %partition.partition_id
                );
                let summary = self
                    .run_partition(&ctx, source, &partition, adapter.as_ref())
                    .instrument(span)
                    .await;
                partitions.push(summary);
            }
        }

        let summary = SyncRunSummary {
            run_id: ctx.run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run: self.config.dry_run,
            partitions,
        };
        info!(
            run_id = %summary.run_id,
            partitions = summary.partitions.len(),
            healthy = summary.all_healthy(),
            "sync run finished"
        );
        Ok(summary)
    }

    async fn run_partition(
        &self,
        ctx: &AdapterContext,
        source: &SourceConfig,
        partition: &PartitionConfig,
        adapter: &dyn SourceAdapter,
    ) -> PartitionSummary {
        let target = partition.target();
        let mut health = HealthLatch::default();
        let mut summary = PartitionSummary::new(&source.source_id, &partition.partition_id);

        let state = match adapter.fetch_listing(ctx, &target).await {
            Ok(listing) => {
                summary.fetched = listing.len();
                summary.enter(RunState::Diffing);
                let rule = source.model_match.unwrap_or_else(|| adapter.model_match());
                let mode = partition
                    .store_mode
                    .unwrap_or_else(|| adapter.default_store_mode());
                let fresh = prepare_snapshot(adapter, &target, rule, mode, listing, &mut health, &mut summary);
                summary.enter(RunState::Applying);
                self.apply(ctx, adapter, &partition.partition_id, fresh, &mut health, &mut summary)
                    .await
            }
            Err(err) => {
                error!(error = %err, "base listing fetch failed; partition left untouched");
                health.fail(format!("fetch: {err}"));
                RunState::Aborted
            }
        };
        summary.enter(state);

        summary.health = health.status();
        if self.config.dry_run {
            debug!("dry run; health file not written");
        } else {
            match self.health.persist(&partition.partition_id, &health).await {
                Ok(path) => summary.health_path = Some(path),
                Err(err) => error!(error = %format!("{err:#}"), "writing health file failed"),
            }
        }
        info!(%summary, "partition run complete");
        summary
    }

    async fn apply(
        &self,
        ctx: &AdapterContext,
        adapter: &dyn SourceAdapter,
        partition_id: &str,
        fresh: Vec<FreshListing>,
        health: &mut HealthLatch,
        summary: &mut PartitionSummary,
    ) -> RunState {
        let reconciler = Reconciler {
            store: self.store.as_ref(),
            notifier: self.notifier.as_ref(),
            adapter,
            ctx,
        };
        match reconciler.run(partition_id, fresh, health).await {
            Ok(stats) => {
                summary.absorb(stats);
                RunState::Done
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "reconciliation aborted before any change");
                health.fail(format!("load: {err}"));
                RunState::Aborted
            }
        }
    }
}

/// Normalize, classify and filter one fetched listing into the fresh snapshot.
fn prepare_snapshot(
    adapter: &dyn SourceAdapter,
    target: &PartitionTarget,
    rule: ModelMatch,
    mode: StoreMode,
    listing: Vec<RawListing>,
    health: &mut HealthLatch,
    summary: &mut PartitionSummary,
) -> Vec<FreshListing> {
    let mut fresh = Vec::with_capacity(listing.len());
    for raw in listing {
        match adapter.normalize(target, &raw) {
            Ok(mut record) => {
                record.classify(rule);
                if mode.admits(record.interest_level) {
                    fresh.push(FreshListing { record, raw });
                } else {
                    summary.filtered += 1;
                }
            }
            Err(reason) if reason.is_failure() => {
                warn!(reason = %reason, listing = %raw.describe(), "skipping listing");
                health.fail(format!("skip: {reason}"));
                summary.skipped += 1;
            }
            Err(reason) => {
                debug!(reason = %reason, "listing out of scope");
                summary.out_of_scope += 1;
            }
        }
    }
    fresh
}

/// Health tokens last written for each partition in the registry, in registry order.
pub async fn read_health(config: &SyncConfig, registry: &SourceRegistry) -> Result<Vec<(String, Option<String>)>> {
    let reporter = HealthReporter::new(HealthFileStore::new(config.health_dir.clone()));
    let mut tokens = Vec::new();
    for partition in registry.partition_ids() {
        let token = reporter.read(&partition).await?;
        tokens.push((partition, token));
    }
    Ok(tokens)
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    SyncPipeline::new(config).await?.run_once().await
}
