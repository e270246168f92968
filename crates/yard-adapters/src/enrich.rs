//! Secondary per-record lookups: detail enrichment and image references.
//!
//! These run once per newly seen record, single attempt, and their failures
//! never abort a partition run.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::debug;
use yard_core::{EnrichmentPatch, ImageRefs, RawListing, VehicleRecord};
use yard_storage::HttpRequest;

use crate::{json_path, json_scalar, AdapterContext, EnrichError};

#[async_trait]
pub trait RecordEnricher: Send + Sync {
    async fn enrich(
        &self,
        ctx: &AdapterContext,
        raw: &RawListing,
        record: &VehicleRecord,
    ) -> Result<Option<EnrichmentPatch>, EnrichError>;
}

#[async_trait]
pub trait ImageLookup: Send + Sync {
    async fn lookup(&self, ctx: &AdapterContext, raw: &RawListing) -> Result<Option<ImageRefs>, EnrichError>;
}

async fn get_json(ctx: &AdapterContext, url: String) -> Result<JsonValue, EnrichError> {
    let response = ctx.fetch_secondary(&HttpRequest::get(url)).await?;
    response
        .json()
        .map_err(|e| EnrichError::Shape(format!("invalid json from {}: {e}", response.final_url)))
}

/// Decodes the vehicle series from a 17-character VIN through the public vPIC API.
#[derive(Debug, Clone)]
pub struct NhtsaVinDecoder {
    base_url: String,
}

impl Default for NhtsaVinDecoder {
    fn default() -> Self {
        Self::new("https://vpic.nhtsa.dot.gov/api/vehicles/decodevinvalues")
    }
}

impl NhtsaVinDecoder {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RecordEnricher for NhtsaVinDecoder {
    async fn enrich(
        &self,
        ctx: &AdapterContext,
        _raw: &RawListing,
        record: &VehicleRecord,
    ) -> Result<Option<EnrichmentPatch>, EnrichError> {
        let Some(vin) = record.vin.as_deref().filter(|v| v.len() == 17) else {
            return Ok(None);
        };
        let body = get_json(ctx, format!("{}/{vin}?format=json", self.base_url)).await?;
        let result = json_path(&body, &["Results", "0"])
            .ok_or_else(|| EnrichError::Shape("vPIC response has no Results".into()))?;
        debug!(vin, "decoded vin");
        Ok(Some(
            EnrichmentPatch::default().with_attribute("series", json_scalar(result, "Series")),
        ))
    }
}

/// Pick-n-Pull per-VIN detail: trim, engine, transmission and color.
#[derive(Debug, Clone)]
pub struct PicknpullDetailLookup {
    base_url: String,
}

impl Default for PicknpullDetailLookup {
    fn default() -> Self {
        Self::new("https://www.picknpull.com/api/vehicle")
    }
}

impl PicknpullDetailLookup {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl RecordEnricher for PicknpullDetailLookup {
    async fn enrich(
        &self,
        ctx: &AdapterContext,
        _raw: &RawListing,
        record: &VehicleRecord,
    ) -> Result<Option<EnrichmentPatch>, EnrichError> {
        let Some(vin) = record.vin.as_deref() else {
            return Ok(None);
        };
        let body = get_json(ctx, format!("{}/{vin}", self.base_url)).await?;
        let vehicle = body
            .get("vehicle")
            .ok_or_else(|| EnrichError::Shape("detail response has no `vehicle`".into()))?;
        let mut patch = EnrichmentPatch::default()
            .with_attribute("trim", json_scalar(vehicle, "trim"))
            .with_attribute("engine", json_scalar(vehicle, "engine"))
            .with_attribute("transmission", json_scalar(vehicle, "transmission"));
        patch.color = json_scalar(vehicle, "color");
        Ok(Some(patch))
    }
}

/// `(locID, ticketID, lineID)` of a Pull-a-Part listing.
fn pullapart_ids(raw: &RawListing) -> Option<(String, String, String)> {
    let RawListing::Json(value) = raw else {
        return None;
    };
    Some((
        json_scalar(value, "locID")?,
        json_scalar(value, "ticketID")?,
        json_scalar(value, "lineID")?,
    ))
}

/// Pull-a-Part extended vehicle info keyed by ticket identifiers.
#[derive(Debug, Clone)]
pub struct PullapartDetailLookup {
    base_url: String,
}

impl Default for PullapartDetailLookup {
    fn default() -> Self {
        Self::new("https://inventoryservice.pullapart.com/VehicleExtendedInfo")
    }
}

impl PullapartDetailLookup {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

fn join_present(parts: &[Option<String>], separator: &str) -> String {
    parts
        .iter()
        .flatten()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(separator)
}

#[async_trait]
impl RecordEnricher for PullapartDetailLookup {
    async fn enrich(
        &self,
        ctx: &AdapterContext,
        raw: &RawListing,
        _record: &VehicleRecord,
    ) -> Result<Option<EnrichmentPatch>, EnrichError> {
        let Some((loc, ticket, line)) = pullapart_ids(raw) else {
            return Ok(None);
        };
        let info = get_json(ctx, format!("{}/{loc}/{ticket}/{line}", self.base_url)).await?;
        if !info.is_object() {
            return Err(EnrichError::Shape("extended info is not an object".into()));
        }
        let field = |key: &str| json_scalar(&info, key);

        // Engine and transmission are only meaningful when their type is present.
        let engine = field("engineBlock").map(|block| {
            let cylinders = field("engineCylinders").unwrap_or_default();
            let size = field("engineSize").map(|s| format!("{s}L"));
            join_present(&[size, Some(format!("{block}{cylinders}"))], " ")
        });
        let transmission = field("transType").map(|kind| {
            let speeds = field("transSpeeds").map(|s| format!("{s} speed"));
            join_present(&[speeds, Some(kind)], " ")
        });

        let mut patch = EnrichmentPatch::default()
            .with_attribute("trim", field("trim"))
            .with_attribute("engine", engine)
            .with_attribute("transmission", transmission)
            .with_attribute("style", field("style"));
        patch.color = field("color");
        Ok(Some(patch))
    }
}

/// Pull-a-Part primary image service.
#[derive(Debug, Clone)]
pub struct PullapartImageLookup {
    base_url: String,
    program_id: u32,
}

impl Default for PullapartImageLookup {
    fn default() -> Self {
        Self {
            base_url: "https://imageservice.pullapart.com/img/retrieveimage/".to_string(),
            program_id: 35,
        }
    }
}

impl PullapartImageLookup {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl ImageLookup for PullapartImageLookup {
    async fn lookup(&self, ctx: &AdapterContext, raw: &RawListing) -> Result<Option<ImageRefs>, EnrichError> {
        let Some((loc, ticket, line)) = pullapart_ids(raw) else {
            return Ok(None);
        };
        let url = format!(
            "{}?locID={loc}&ticketID={ticket}&lineID={line}&programID={}&imageIndex=1",
            self.base_url, self.program_id
        );
        let body = get_json(ctx, url).await?;
        Ok(json_scalar(&body, "webPath").map(|image| ImageRefs {
            image,
            image_urls: Vec::new(),
        }))
    }
}
