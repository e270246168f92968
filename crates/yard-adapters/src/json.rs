//! JSON listing shapes: one response holding the whole listing, and a
//! DataTables-style offset/length listing that reports its total.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::{debug, info};
use yard_core::{EnrichmentPatch, ImageRefs, ModelMatch, RawListing, StoreMode, VehicleRecord};

use crate::{
    coerce_year, json_scalar, text_or_none, AdapterContext, AdapterError, EnrichError,
    PartitionTarget, RequestTemplate, SkipReason, SourceAdapter, SourceProfile, SourceShape,
};

/// Where the listing objects live in a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingPath {
    /// `body[key]`
    Key(&'static str),
    /// `body[0][key]`
    FirstThenKey(&'static str),
    /// `body[*][key]`, concatenated; every entry must carry the key.
    EachThenKey(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonImage {
    None,
    Field(&'static str),
    /// Field holds an HTML snippet; the URL is its first quoted attribute value.
    EmbeddedHtmlAttr(&'static str),
    /// Array of objects; the first URL is the primary image.
    UrlList {
        key: &'static str,
        url_key: &'static str,
    },
}

/// Source field names for each canonical field.
#[derive(Debug, Clone, Copy)]
pub struct JsonFieldMap {
    pub year: &'static str,
    /// Tried in order; the first non-empty value wins.
    pub model: &'static [&'static str],
    pub make: Option<&'static str>,
    pub stock_num: &'static str,
    pub vin: Option<&'static str>,
    pub color: Option<&'static str>,
    pub row: Option<&'static str>,
    pub date_listed: Option<&'static str>,
    pub location: Option<&'static str>,
    pub details: &'static [(&'static str, &'static str)],
    pub image: JsonImage,
}

impl JsonFieldMap {
    pub const fn new(year: &'static str, model: &'static [&'static str], stock_num: &'static str) -> Self {
        Self {
            year,
            model,
            make: None,
            stock_num,
            vin: None,
            color: None,
            row: None,
            date_listed: None,
            location: None,
            details: &[],
            image: JsonImage::None,
        }
    }
}

fn extract_listings(
    body: &JsonValue,
    path: ListingPath,
    url: &str,
) -> Result<Vec<RawListing>, AdapterError> {
    let missing = |detail: String| AdapterError::shape(url, detail);
    let listings: Vec<JsonValue> = match path {
        ListingPath::Key(key) => body
            .get(key)
            .and_then(JsonValue::as_array)
            .ok_or_else(|| missing(format!("no `{key}` array")))?
            .clone(),
        ListingPath::FirstThenKey(key) => body
            .get(0)
            .and_then(|first| first.get(key))
            .and_then(JsonValue::as_array)
            .ok_or_else(|| missing(format!("no `[0].{key}` array")))?
            .clone(),
        ListingPath::EachThenKey(key) => {
            let entries = body
                .as_array()
                .ok_or_else(|| missing("expected a top-level array".to_string()))?;
            let mut all = Vec::new();
            for (index, entry) in entries.iter().enumerate() {
                let items = entry
                    .get(key)
                    .and_then(JsonValue::as_array)
                    .ok_or_else(|| missing(format!("entry {index} has no `{key}` array")))?;
                all.extend(items.iter().cloned());
            }
            all
        }
    };
    Ok(listings.into_iter().map(RawListing::Json).collect())
}

fn parse_body(text: &[u8], url: &str) -> Result<JsonValue, AdapterError> {
    serde_json::from_slice(text).map_err(|e| AdapterError::shape(url, format!("invalid json: {e}")))
}

fn normalize_object(
    fields: &JsonFieldMap,
    target: &PartitionTarget,
    value: &JsonValue,
) -> Result<VehicleRecord, SkipReason> {
    if !value.is_object() {
        return Err(SkipReason::Malformed("listing is not an object".into()));
    }
    let field = |key: Option<&str>| key.and_then(|k| json_scalar(value, k));

    let year = coerce_year(json_scalar(value, fields.year).as_deref())?;
    let model = fields
        .model
        .iter()
        .find_map(|key| json_scalar(value, key))
        .ok_or(SkipReason::MissingField("model"))?;
    let stock_num =
        json_scalar(value, fields.stock_num).ok_or(SkipReason::MissingField("stock_num"))?;

    let mut record = VehicleRecord::new(&target.partition_id, stock_num, year, &model);
    record.make = field(fields.make).map(|m| m.to_ascii_uppercase());
    record.vin = field(fields.vin);
    record.color = field(fields.color);
    record.row = field(fields.row);
    record.date_listed = field(fields.date_listed);
    record.location = field(fields.location).or_else(|| target.location.clone());
    for (name, key) in fields.details {
        if let Some(detail) = json_scalar(value, key) {
            record.details.insert(name.to_string(), detail);
        }
    }

    match fields.image {
        JsonImage::None => {}
        JsonImage::Field(key) => record.image = json_scalar(value, key),
        JsonImage::EmbeddedHtmlAttr(key) => {
            record.image = json_scalar(value, key)
                .and_then(|html| html.split('"').nth(1).and_then(text_or_none));
        }
        JsonImage::UrlList { key, url_key } => {
            let urls: Vec<String> = value
                .get(key)
                .and_then(JsonValue::as_array)
                .map(|items| items.iter().filter_map(|i| json_scalar(i, url_key)).collect())
                .unwrap_or_default();
            record.image = urls.first().cloned();
            record.image_urls = urls;
        }
    }
    Ok(record)
}

fn normalize_json(
    fields: &JsonFieldMap,
    target: &PartitionTarget,
    raw: &RawListing,
) -> Result<VehicleRecord, SkipReason> {
    match raw {
        RawListing::Json(value) => normalize_object(fields, target, value),
        RawListing::Row(_) => Err(SkipReason::Malformed("expected a json listing".into())),
    }
}

/// One request whose response embeds every listing for the partition.
pub struct JsonListingAdapter {
    profile: SourceProfile,
    request: RequestTemplate,
    path: ListingPath,
    fields: JsonFieldMap,
}

impl JsonListingAdapter {
    pub fn new(
        profile: SourceProfile,
        request: RequestTemplate,
        path: ListingPath,
        fields: JsonFieldMap,
    ) -> Self {
        Self {
            profile,
            request,
            path,
            fields,
        }
    }
}

#[async_trait]
impl SourceAdapter for JsonListingAdapter {
    fn source_id(&self) -> &'static str {
        self.profile.source_id
    }

    fn shape(&self) -> SourceShape {
        SourceShape::JsonListing
    }

    fn model_match(&self) -> ModelMatch {
        self.profile.model_match
    }

    fn default_store_mode(&self) -> StoreMode {
        self.profile.store_mode
    }

    async fn fetch_listing(
        &self,
        ctx: &AdapterContext,
        target: &PartitionTarget,
    ) -> Result<Vec<RawListing>, AdapterError> {
        let request = self.request.render(&target.template_vars())?;
        let response = ctx.fetch_base(&request).await?;
        let body = parse_body(&response.body, &response.final_url)?;
        let listings = extract_listings(&body, self.path, &response.final_url)?;
        info!(
            source_id = self.profile.source_id,
            partition = %target.partition_id,
            rows = listings.len(),
            "fetched json listing"
        );
        Ok(listings)
    }

    fn normalize(&self, target: &PartitionTarget, raw: &RawListing) -> Result<VehicleRecord, SkipReason> {
        normalize_json(&self.fields, target, raw)
    }

    async fn enrich(
        &self,
        ctx: &AdapterContext,
        raw: &RawListing,
        record: &VehicleRecord,
    ) -> Result<Option<EnrichmentPatch>, EnrichError> {
        self.profile.enrich(ctx, raw, record).await
    }

    async fn lookup_image(
        &self,
        ctx: &AdapterContext,
        raw: &RawListing,
    ) -> Result<Option<ImageRefs>, EnrichError> {
        self.profile.lookup_image(ctx, raw).await
    }
}

/// Offset/length paging: a small first page reports the total, then follow-up
/// requests fetch the remainder. The request template sees `{start}` and `{length}`.
pub struct PaginatedJsonAdapter {
    profile: SourceProfile,
    request: RequestTemplate,
    data_key: &'static str,
    total_key: &'static str,
    first_page_length: usize,
    max_requests: usize,
    fields: JsonFieldMap,
}

impl PaginatedJsonAdapter {
    pub fn new(profile: SourceProfile, request: RequestTemplate, fields: JsonFieldMap) -> Self {
        Self {
            profile,
            request,
            data_key: "data",
            total_key: "recordsTotal",
            first_page_length: 10,
            max_requests: 20,
            fields,
        }
    }

    pub fn with_keys(mut self, data_key: &'static str, total_key: &'static str) -> Self {
        self.data_key = data_key;
        self.total_key = total_key;
        self
    }

    pub fn with_first_page_length(mut self, length: usize) -> Self {
        self.first_page_length = length.max(1);
        self
    }
}

/// Without a reported total, a short first page is the whole listing; a full one
/// may be truncated and cannot stand in for the snapshot.
fn first_page_total(
    reported: Option<usize>,
    received: usize,
    requested: usize,
    url: &str,
) -> Result<usize, AdapterError> {
    match reported {
        Some(total) => Ok(total),
        None if received < requested => Ok(received),
        None => Err(AdapterError::shape(
            url,
            format!("no total reported and the first page is full ({received} rows)"),
        )),
    }
}

fn reported_total(body: &JsonValue, key: &str) -> Option<usize> {
    let value = body.get(key)?;
    value
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

#[async_trait]
impl SourceAdapter for PaginatedJsonAdapter {
    fn source_id(&self) -> &'static str {
        self.profile.source_id
    }

    fn shape(&self) -> SourceShape {
        SourceShape::PaginatedJson
    }

    fn model_match(&self) -> ModelMatch {
        self.profile.model_match
    }

    fn default_store_mode(&self) -> StoreMode {
        self.profile.store_mode
    }

    async fn fetch_listing(
        &self,
        ctx: &AdapterContext,
        target: &PartitionTarget,
    ) -> Result<Vec<RawListing>, AdapterError> {
        let mut listings = Vec::new();
        let mut start = 0;
        let mut length = self.first_page_length;
        let mut known_total = None;

        for request_no in 1..=self.max_requests {
            let mut vars = target.template_vars();
            vars.push(("start".to_string(), start.to_string()));
            vars.push(("length".to_string(), length.to_string()));
            let request = self.request.render(&vars)?;
            let response = ctx.fetch_base(&request).await?;
            let url = response.final_url.as_str();
            let body = parse_body(&response.body, url)?;

            let page = body
                .get(self.data_key)
                .and_then(JsonValue::as_array)
                .ok_or_else(|| AdapterError::shape(url, format!("no `{}` array", self.data_key)))?;
            let received = page.len();
            let total = match known_total {
                Some(total) => total,
                None => *known_total.insert(first_page_total(
                    reported_total(&body, self.total_key),
                    received,
                    length,
                    url,
                )?),
            };
            listings.extend(page.iter().cloned().map(RawListing::Json));
            debug!(
                source_id = self.profile.source_id,
                partition = %target.partition_id,
                request_no,
                start,
                received,
                total,
                "fetched listing page"
            );

            let next = start + received;
            if next >= total {
                info!(
                    source_id = self.profile.source_id,
                    partition = %target.partition_id,
                    rows = listings.len(),
                    requests = request_no,
                    "fetched paginated listing"
                );
                return Ok(listings);
            }
            if received == 0 {
                return Err(AdapterError::shape(
                    url,
                    format!("empty page at offset {start} of {total}"),
                ));
            }
            start = next;
            length = total - next;
        }
        Err(AdapterError::Message(format!(
            "listing incomplete after {} requests",
            self.max_requests
        )))
    }

    fn normalize(&self, target: &PartitionTarget, raw: &RawListing) -> Result<VehicleRecord, SkipReason> {
        normalize_json(&self.fields, target, raw)
    }

    async fn enrich(
        &self,
        ctx: &AdapterContext,
        raw: &RawListing,
        record: &VehicleRecord,
    ) -> Result<Option<EnrichmentPatch>, EnrichError> {
        self.profile.enrich(ctx, raw, record).await
    }

    async fn lookup_image(
        &self,
        ctx: &AdapterContext,
        raw: &RawListing,
    ) -> Result<Option<ImageRefs>, EnrichError> {
        self.profile.lookup_image(ctx, raw).await
    }
}
