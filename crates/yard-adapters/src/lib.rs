//! Source adapter contracts, configuration-driven adapter shapes and the built-in
//! salvage-yard presets.

mod enrich;
mod html;
mod json;
mod presets;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;
use yard_core::{EnrichmentPatch, ImageRefs, ModelMatch, RawListing, StoreMode, VehicleRecord};
use yard_storage::{
    execute_with_retry, FetchError, FetchedResponse, HttpMethod, HttpRequest, RetryPolicy,
    Transport,
};

pub use enrich::{
    ImageLookup, NhtsaVinDecoder, PicknpullDetailLookup, PullapartDetailLookup,
    PullapartImageLookup, RecordEnricher,
};
pub use html::{HtmlTableAdapter, HtmlTableLayout, PagedHtmlAdapter, ResultRowLayout, RowImage, StockKey};
pub use json::{JsonFieldMap, JsonImage, JsonListingAdapter, ListingPath, PaginatedJsonAdapter};
pub use presets::{
    adapter_for_source, jacks_adapter, lkq_adapter, picknpull_adapter, pullapart_adapter,
    pullnsave_adapter, tearapart_adapter, upullandsave_adapter, utpap_adapter, PRESET_NAMES,
};

pub const CRATE_NAME: &str = "yard-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceShape {
    HtmlTable,
    JsonListing,
    PaginatedJson,
    PagedHtml,
}

/// One independently reconciled slice of a source: a yard, store or location.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTarget {
    pub partition_id: String,
    #[serde(default)]
    pub location: Option<String>,
    /// Values substituted into request templates as `{name}`.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

impl PartitionTarget {
    pub fn new(partition_id: impl Into<String>) -> Self {
        Self {
            partition_id: partition_id.into(),
            ..Self::default()
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_param(mut self, name: &str, value: impl Into<String>) -> Self {
        self.params.insert(name.to_string(), value.into());
        self
    }

    fn template_vars(&self) -> Vec<(String, String)> {
        let mut vars: Vec<(String, String)> = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(location) = &self.location {
            vars.push(("location".to_string(), location.clone()));
        }
        vars
    }
}

/// Handles shared by every adapter call within one run.
#[derive(Clone)]
pub struct AdapterContext {
    pub run_id: Uuid,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl AdapterContext {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            transport,
            retry,
        }
    }

    /// Base listing fetch: subject to the run's retry policy.
    pub async fn fetch_base(&self, request: &HttpRequest) -> Result<FetchedResponse, AdapterError> {
        Ok(execute_with_retry(self.transport.as_ref(), request, &self.retry).await?)
    }

    /// Per-record secondary call: single attempt, never retried.
    pub async fn fetch_secondary(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
        self.transport.execute(request).await
    }
}

/// Failure producing the base listing set. Always fatal for the partition run.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected response shape from {url}: {detail}")]
    Shape { url: String, detail: String },
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    pub fn shape(url: &str, detail: impl Into<String>) -> Self {
        AdapterError::Shape {
            url: url.to_string(),
            detail: detail.into(),
        }
    }
}

/// Why one raw listing did not become a record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SkipReason {
    #[error("invalid year {0:?}")]
    InvalidYear(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("malformed listing: {0}")]
    Malformed(String),
    #[error("out of scope: {0}")]
    OutOfScope(String),
}

impl SkipReason {
    /// Out-of-scope rows (another make, say) are expected and leave health alone.
    pub fn is_failure(&self) -> bool {
        !matches!(self, SkipReason::OutOfScope(_))
    }
}

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected lookup response: {0}")]
    Shape(String),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn shape(&self) -> SourceShape;

    /// How this source's model field is matched against the E-Class rule.
    fn model_match(&self) -> ModelMatch {
        ModelMatch::Exact
    }

    fn default_store_mode(&self) -> StoreMode {
        StoreMode::StoreAll
    }

    /// Fetch the complete current listing for one partition.
    async fn fetch_listing(
        &self,
        ctx: &AdapterContext,
        target: &PartitionTarget,
    ) -> Result<Vec<RawListing>, AdapterError>;

    fn normalize(
        &self,
        target: &PartitionTarget,
        raw: &RawListing,
    ) -> Result<VehicleRecord, SkipReason>;

    /// Secondary detail lookup for a record about to be inserted. `Ok(None)` means the
    /// source has nothing to look up for it.
    async fn enrich(
        &self,
        _ctx: &AdapterContext,
        _raw: &RawListing,
        _record: &VehicleRecord,
    ) -> Result<Option<EnrichmentPatch>, EnrichError> {
        Ok(None)
    }

    async fn lookup_image(
        &self,
        _ctx: &AdapterContext,
        _raw: &RawListing,
    ) -> Result<Option<ImageRefs>, EnrichError> {
        Ok(None)
    }
}

/// Per-source settings shared by every adapter shape: identity, interest rule,
/// default store mode and optional secondary lookups.
#[derive(Clone)]
pub struct SourceProfile {
    pub source_id: &'static str,
    pub model_match: ModelMatch,
    pub store_mode: StoreMode,
    enricher: Option<Arc<dyn RecordEnricher>>,
    images: Option<Arc<dyn ImageLookup>>,
}

impl SourceProfile {
    pub fn new(source_id: &'static str) -> Self {
        Self {
            source_id,
            model_match: ModelMatch::Exact,
            store_mode: StoreMode::StoreAll,
            enricher: None,
            images: None,
        }
    }

    pub fn model_match(mut self, model_match: ModelMatch) -> Self {
        self.model_match = model_match;
        self
    }

    pub fn store_mode(mut self, store_mode: StoreMode) -> Self {
        self.store_mode = store_mode;
        self
    }

    pub fn enricher(mut self, enricher: impl RecordEnricher + 'static) -> Self {
        self.enricher = Some(Arc::new(enricher));
        self
    }

    pub fn image_lookup(mut self, images: impl ImageLookup + 'static) -> Self {
        self.images = Some(Arc::new(images));
        self
    }

    async fn enrich(
        &self,
        ctx: &AdapterContext,
        raw: &RawListing,
        record: &VehicleRecord,
    ) -> Result<Option<EnrichmentPatch>, EnrichError> {
        match &self.enricher {
            Some(enricher) => enricher.enrich(ctx, raw, record).await,
            None => Ok(None),
        }
    }

    async fn lookup_image(
        &self,
        ctx: &AdapterContext,
        raw: &RawListing,
    ) -> Result<Option<ImageRefs>, EnrichError> {
        match &self.images {
            Some(images) => images.lookup(ctx, raw).await,
            None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateBody {
    Empty,
    Form(&'static str),
    Json(&'static str),
}

/// Request shape for a source, with `{name}` placeholders filled from the partition
/// and, for paginated shapes, the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTemplate {
    pub method: HttpMethod,
    pub url: &'static str,
    pub body: TemplateBody,
    pub headers: &'static [(&'static str, &'static str)],
}

impl RequestTemplate {
    pub const fn get(url: &'static str) -> Self {
        Self {
            method: HttpMethod::Get,
            url,
            body: TemplateBody::Empty,
            headers: &[],
        }
    }

    pub const fn post(url: &'static str, body: TemplateBody) -> Self {
        Self {
            method: HttpMethod::Post,
            url,
            body,
            headers: &[],
        }
    }

    pub const fn with_headers(mut self, headers: &'static [(&'static str, &'static str)]) -> Self {
        self.headers = headers;
        self
    }

    pub fn render(&self, vars: &[(String, String)]) -> Result<HttpRequest, AdapterError> {
        let url = fill_template(self.url, vars);
        let mut request = match self.body {
            TemplateBody::Empty => HttpRequest::get(url),
            TemplateBody::Form(body) => HttpRequest::post_form(url, fill_template(body, vars)),
            TemplateBody::Json(body) => {
                let body: JsonValue = serde_json::from_str(&fill_template(body, vars))
                    .map_err(|e| AdapterError::Message(format!("request body template: {e}")))?;
                HttpRequest::post_json(url, body)
            }
        };
        request.method = self.method;
        for (name, value) in self.headers {
            request = request.header(name, fill_template(value, vars));
        }
        Ok(request)
    }
}

fn fill_template(template: &str, vars: &[(String, String)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{name}}}"), value)
    })
}

// Normalizer helpers shared by every shape.

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Message(format!("selector {css:?}: {e}")))
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn text_or_none(value: impl AsRef<str>) -> Option<String> {
    let trimmed = value.as_ref().trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn coerce_year(value: Option<&str>) -> Result<i32, SkipReason> {
    let text = value.unwrap_or_default().trim();
    text.parse::<i32>()
        .map_err(|_| SkipReason::InvalidYear(text.to_string()))
}

/// Key for sources without a stable identifier: the raw display columns concatenated.
/// Any upstream formatting change to one of them shows up as a delete plus an insert.
fn synthesize_stock_num<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts.into_iter().map(str::trim).collect()
}

fn json_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = match segment.parse::<usize>() {
            Ok(index) if cur.is_array() => cur.get(index)?,
            _ => cur.get(*segment)?,
        };
    }
    Some(cur)
}

/// String form of a scalar JSON field; numbers are rendered, null and blanks are `None`.
fn json_scalar(value: &JsonValue, key: &str) -> Option<String> {
    match value.get(key)? {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_template_fills_partition_params() {
        let template = RequestTemplate::post(
            "https://yard.test/search?store={store_id}",
            TemplateBody::Form("store={store_id}&yard={location}"),
        )
        .with_headers(&[("referer", "https://yard.test/{location}-{store_id}")]);
        let target = PartitionTarget::new("yard-dayton")
            .with_location("dayton")
            .with_param("store_id", "1257");

        let request = template.render(&target.template_vars()).unwrap();
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.url, "https://yard.test/search?store=1257");
        assert_eq!(
            request.body,
            yard_storage::RequestBody::Form("store=1257&yard=dayton".into())
        );
        assert_eq!(
            request.headers,
            vec![("referer".to_string(), "https://yard.test/dayton-1257".to_string())]
        );
    }

    #[test]
    fn json_body_template_must_parse() {
        let ok = RequestTemplate::post("https://a.test", TemplateBody::Json(r#"{"MakeID": {make}}"#));
        let vars = vec![("make".to_string(), "37".to_string())];
        let request = ok.render(&vars).unwrap();
        assert_eq!(request.body, yard_storage::RequestBody::Json(json!({"MakeID": 37})));
        assert!(ok.render(&[]).is_err());
    }

    #[test]
    fn year_coercion_and_key_synthesis() {
        assert_eq!(coerce_year(Some(" 1984 ")), Ok(1984));
        assert_eq!(
            coerce_year(Some("19X4")),
            Err(SkipReason::InvalidYear("19X4".into()))
        );
        assert!(coerce_year(None).is_err());
        assert_eq!(
            synthesize_stock_num(["1984", " MERCEDES-BENZ ", "300D"]),
            "1984MERCEDES-BENZ300D"
        );
    }

    #[test]
    fn json_helpers_accept_numbers_and_index_paths() {
        let value = json!([{ "vehicles": [{ "year": 1999, "vin": "  ", "row": "12" }] }]);
        let vehicle = json_path(&value, &["0", "vehicles", "0"]).unwrap();
        assert_eq!(json_scalar(vehicle, "year").as_deref(), Some("1999"));
        assert_eq!(json_scalar(vehicle, "vin"), None);
        assert_eq!(json_scalar(vehicle, "row").as_deref(), Some("12"));
        assert!(json_path(&value, &["1"]).is_none());
    }

    #[test]
    fn out_of_scope_skips_are_not_failures() {
        assert!(!SkipReason::OutOfScope("make FORD".into()).is_failure());
        assert!(SkipReason::MissingField("stock_num").is_failure());
        assert!(SkipReason::InvalidYear("".into()).is_failure());
    }
}
