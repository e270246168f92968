//! Core domain model and interest rules for yardwatch.

use std::collections::BTreeMap;
use std::ops::RangeInclusive;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "yard-core";

pub const CLASSIC_YEARS: RangeInclusive<i32> = 1976..=1985;
pub const E_CLASS_YEARS: RangeInclusive<i32> = 1996..=2002;
pub const E_CLASS_MODEL: &str = "E-CLASS";

/// How a source's model field is checked for an E-Class variant.
///
/// Sources disagree: some publish the class name (`E-CLASS`), some embed it in a
/// longer string, and some only publish the trim token (`E320`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelMatch {
    #[default]
    Exact,
    Contains,
    Prefix,
}

impl ModelMatch {
    pub fn is_e_class(self, model: &str) -> bool {
        let model = model.trim().to_ascii_uppercase();
        match self {
            ModelMatch::Exact => model == E_CLASS_MODEL,
            ModelMatch::Contains => model.contains(E_CLASS_MODEL),
            ModelMatch::Prefix => model.starts_with('E'),
        }
    }
}

/// Interest level for a listing: 1 for classic-era cars of any model and for
/// late-nineties E-Class variants, 0 otherwise.
pub fn classify(year: i32, model: &str, rule: ModelMatch) -> u8 {
    if CLASSIC_YEARS.contains(&year) || (E_CLASS_YEARS.contains(&year) && rule.is_e_class(model)) {
        1
    } else {
        0
    }
}

/// Whether a partition keeps every fetched listing or only the interesting ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreMode {
    #[default]
    StoreAll,
    StoreMatchesOnly,
}

impl StoreMode {
    pub fn admits(self, interest_level: u8) -> bool {
        match self {
            StoreMode::StoreAll => true,
            StoreMode::StoreMatchesOnly => interest_level > 0,
        }
    }
}

/// Secondary-lookup state for a record.
///
/// `NotRequested` means no lookup applies (or the record was not new), `Unknown`
/// means a lookup was attempted and failed, `Resolved` carries whatever the lookup
/// returned, which may legitimately be empty.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Enrichment {
    #[default]
    NotRequested,
    Unknown,
    Resolved { attributes: BTreeMap<String, String> },
}

impl Enrichment {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        match self {
            Enrichment::Resolved { attributes } => attributes.get(key).map(String::as_str),
            _ => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Enrichment::Unknown)
    }
}

/// Successful output of an enrichment lookup.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnrichmentPatch {
    pub attributes: BTreeMap<String, String>,
    pub color: Option<String>,
}

impl EnrichmentPatch {
    pub fn with_attribute(mut self, key: &str, value: Option<String>) -> Self {
        if let Some(value) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) {
            self.attributes.insert(key.to_string(), value);
        }
        self
    }
}

/// Primary and secondary image references for a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRefs {
    pub image: String,
    #[serde(default)]
    pub image_urls: Vec<String>,
}

/// Canonical vehicle listing; the unit of reconciliation within a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub source_partition: String,
    pub stock_num: String,
    pub year: i32,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub make: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_listed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_urls: Vec<String>,
    /// Site-specific descriptive columns that arrive with the base listing.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,
    #[serde(default)]
    pub interest_level: u8,
    #[serde(default)]
    pub enrichment: Enrichment,
}

impl VehicleRecord {
    pub fn new(
        source_partition: impl Into<String>,
        stock_num: impl Into<String>,
        year: i32,
        model: &str,
    ) -> Self {
        Self {
            source_partition: source_partition.into(),
            stock_num: stock_num.into(),
            year,
            model: model.trim().to_ascii_uppercase(),
            make: None,
            color: None,
            vin: None,
            row: None,
            date_listed: None,
            location: None,
            image: None,
            image_urls: Vec::new(),
            details: BTreeMap::new(),
            interest_level: 0,
            enrichment: Enrichment::NotRequested,
        }
    }

    pub fn classify(&mut self, rule: ModelMatch) -> u8 {
        self.interest_level = classify(self.year, &self.model, rule);
        self.interest_level
    }

    pub fn apply_enrichment(&mut self, patch: EnrichmentPatch) {
        if patch.color.is_some() {
            self.color = patch.color;
        }
        self.enrichment = Enrichment::Resolved {
            attributes: patch.attributes,
        };
    }

    pub fn apply_images(&mut self, refs: ImageRefs) {
        self.image = Some(refs.image);
        self.image_urls = refs.image_urls;
    }
}

/// A record as held by the persisted store. `row_id` is store-internal and never
/// leaves the process; notifications carry only `record`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredVehicle {
    pub row_id: Uuid,
    pub first_seen_at: DateTime<Utc>,
    pub record: VehicleRecord,
}

impl StoredVehicle {
    pub fn new(record: VehicleRecord) -> Self {
        Self {
            row_id: Uuid::new_v4(),
            first_seen_at: Utc::now(),
            record,
        }
    }
}

/// One scraped row from an HTML source: visible cell texts plus labelled detail
/// values and any image links found alongside.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RowListing {
    pub cells: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub image_urls: Vec<String>,
}

impl RowListing {
    pub fn cell(&self, index: usize) -> Option<&str> {
        self.cells.get(index).map(String::as_str)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Adapter output before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum RawListing {
    Row(RowListing),
    Json(JsonValue),
}

impl RawListing {
    /// Short single-line rendering for log lines.
    pub fn describe(&self) -> String {
        let text = match self {
            RawListing::Row(row) => row.cells.join(" | "),
            RawListing::Json(value) => value.to_string(),
        };
        if text.chars().count() > 160 {
            let cut: String = text.chars().take(157).collect();
            format!("{cut}...")
        } else {
            text
        }
    }
}
