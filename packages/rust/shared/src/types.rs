//! Core domain types for the catalog ingestion pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{CatalogError, Result};

// ---------------------------------------------------------------------------
// DocumentStatus
// ---------------------------------------------------------------------------

/// Position of a document in the ingestion state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    /// Persisted, waiting to be claimed by the fetcher.
    New,
    /// Claimed by the fetcher; in flight through transform and delivery.
    Queued,
    /// Rejected by transform. Terminal until resubmitted.
    Errored,
    /// Delivered to the search index. Terminal until resubmitted.
    Indexed,
}

impl DocumentStatus {
    /// All status values, in lifecycle order.
    pub const ALL: [DocumentStatus; 4] = [Self::New, Self::Queued, Self::Errored, Self::Indexed];

    /// The value stored in the database and shown to operators.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Queued => "QUEUED",
            Self::Errored => "ERRORED",
            Self::Indexed => "INDEXED",
        }
    }

    /// Terminal statuses are never re-selected by the fetcher.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Errored | Self::Indexed)
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEW" => Ok(Self::New),
            "QUEUED" => Ok(Self::Queued),
            "ERRORED" => Ok(Self::Errored),
            "INDEXED" => Ok(Self::Indexed),
            other => Err(CatalogError::validation(format!(
                "unknown document status '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// CollectionType
// ---------------------------------------------------------------------------

/// Catalog vertical a record belongs to. Each maps to its own index core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionType {
    Grocery,
    Fnb,
    Electronics,
}

impl CollectionType {
    pub const ALL: [CollectionType; 3] = [Self::Grocery, Self::Fnb, Self::Electronics];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grocery => "grocery",
            Self::Fnb => "fnb",
            Self::Electronics => "electronics",
        }
    }
}

impl fmt::Display for CollectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionType {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "grocery" => Ok(Self::Grocery),
            "fnb" => Ok(Self::Fnb),
            "electronics" => Ok(Self::Electronics),
            other => Err(CatalogError::validation(format!(
                "unknown collection type '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// ProductRecord
// ---------------------------------------------------------------------------

/// The raw product/provider payload submitted by producers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: String,
    pub code: String,
    pub domain: String,
    pub bpp_id: String,
    pub bpp_name: String,
    pub bpp_uri: String,
    pub city: String,
    pub item_id: String,
    #[serde(default)]
    pub item_offers: Vec<String>,
    #[serde(default)]
    pub parent_item_id: Option<String>,
    pub item_category_id: String,
    pub item_currency: String,
    pub item_measure_quantity: String,
    pub item_measure_value: f64,
    pub item_name: String,
    #[serde(default)]
    pub item_short_description: Option<String>,
    #[serde(default)]
    pub item_long_description: Option<String>,
    pub item_selling_price: f64,
    pub item_mrp_price: f64,
    #[serde(default)]
    pub item_discount_percentage: f64,
    pub item_status: String,
    pub item_timestamp: String,
    pub provider_timestamp: String,
    pub item_symbol: String,
    pub provider_symbol: String,
    #[serde(default)]
    pub item_veg: Option<String>,
    #[serde(default)]
    pub item_nonveg: Option<String>,
    #[serde(default)]
    pub item_available_count: u32,
    #[serde(default)]
    pub item_maximum_count: u32,
    #[serde(default)]
    pub item_cancellable_status: Option<String>,
    #[serde(default)]
    pub item_returnable_status: Option<String>,
    pub provider_name: String,
    #[serde(default)]
    pub provider_status: Option<String>,
    pub provider_geo_latitude: f64,
    pub provider_geo_longitude: f64,
    pub provider_id: String,
    pub provider_location_id: String,
    pub provider_location_city: String,
    pub provider_location_area_code: String,
    #[serde(default)]
    pub provider_location_street: Option<String>,
    pub provider_min_order_value: f64,
    pub provider_start_time_day: u16,
    pub provider_end_time_day: u16,
    pub provider_days: Vec<u8>,
    #[serde(default)]
    pub provider_service_location_distance: f64,
    pub provider_service_type: u8,
}

impl ProductRecord {
    /// Check the record against the submission contract.
    ///
    /// Returns the first violation found; callers answer NACK with it.
    pub fn validate(&self) -> Result<()> {
        Uuid::parse_str(&self.id)
            .map_err(|_| CatalogError::validation(format!("invalid UUID: {}", self.id)))?;

        for (field, value) in [
            ("bpp_uri", &self.bpp_uri),
            ("item_symbol", &self.item_symbol),
            ("provider_symbol", &self.provider_symbol),
        ] {
            Url::parse(value)
                .map_err(|e| CatalogError::validation(format!("{field}: invalid URL '{value}': {e}")))?;
        }

        for (field, value) in [
            ("item_timestamp", &self.item_timestamp),
            ("provider_timestamp", &self.provider_timestamp),
        ] {
            if parse_iso_timestamp(value).is_none() {
                return Err(CatalogError::validation(format!(
                    "{field}: invalid datetime '{value}'"
                )));
            }
        }

        require_len("item_name", &self.item_name, 1, 100_000)?;
        require_len("provider_name", &self.provider_name, 1, 100)?;
        require_len("provider_id", &self.provider_id, 1, 50)?;
        require_len("provider_location_id", &self.provider_location_id, 1, 50)?;
        require_len("provider_location_city", &self.provider_location_city, 1, 50)?;
        require_len(
            "provider_location_area_code",
            &self.provider_location_area_code,
            6,
            6,
        )?;
        if let Some(street) = &self.provider_location_street {
            require_len("provider_location_street", street, 1, 1000)?;
        }

        for (field, value) in [
            ("item_measure_value", self.item_measure_value),
            ("item_selling_price", self.item_selling_price),
            ("item_mrp_price", self.item_mrp_price),
            ("item_discount_percentage", self.item_discount_percentage),
            ("provider_geo_latitude", self.provider_geo_latitude),
            ("provider_geo_longitude", self.provider_geo_longitude),
            ("provider_min_order_value", self.provider_min_order_value),
            (
                "provider_service_location_distance",
                self.provider_service_location_distance,
            ),
        ] {
            if !value.is_finite() {
                return Err(CatalogError::validation(format!(
                    "{field} must be a finite number"
                )));
            }
        }

        if self.item_measure_value < 0.0 {
            return Err(CatalogError::validation("item_measure_value must be >= 0"));
        }
        if self.item_selling_price <= 0.0 {
            return Err(CatalogError::validation("item_selling_price must be > 0"));
        }
        if self.item_mrp_price < 0.0 {
            return Err(CatalogError::validation("item_mrp_price must be >= 0"));
        }
        if !(0.0..=100.0).contains(&self.item_discount_percentage) {
            return Err(CatalogError::validation(
                "item_discount_percentage must be between 0 and 100",
            ));
        }
        if !(-90.0..=90.0).contains(&self.provider_geo_latitude) {
            return Err(CatalogError::validation(
                "provider_geo_latitude must be between -90 and 90",
            ));
        }
        if !(-180.0..=180.0).contains(&self.provider_geo_longitude) {
            return Err(CatalogError::validation(
                "provider_geo_longitude must be between -180 and 180",
            ));
        }
        if self.provider_start_time_day > 2359 || self.provider_end_time_day > 2359 {
            return Err(CatalogError::validation(
                "provider start/end time must be between 0 and 2359",
            ));
        }
        if !self.provider_days.iter().all(|d| (1..=7).contains(d)) {
            return Err(CatalogError::validation(format!(
                "all provider_days must be between 1 and 7, got {:?}",
                self.provider_days
            )));
        }
        if !(10..=13).contains(&self.provider_service_type) {
            return Err(CatalogError::validation(
                "provider_service_type must be between 10 and 13",
            ));
        }

        Ok(())
    }

    /// Provider coordinates in the `"lat,lon"` form the index expects.
    pub fn provider_geo(&self) -> String {
        format!(
            "{},{}",
            self.provider_geo_latitude, self.provider_geo_longitude
        )
    }
}

fn require_len(field: &str, value: &str, min: usize, max: usize) -> Result<()> {
    let len = value.chars().count();
    if len < min || len > max {
        return Err(CatalogError::validation(format!(
            "{field} length must be between {min} and {max}, got {len}"
        )));
    }
    Ok(())
}

/// Parse an ISO-8601 timestamp, with or without an offset.
pub fn parse_iso_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

// ---------------------------------------------------------------------------
// Submission and stored documents
// ---------------------------------------------------------------------------

/// A record as it arrives at `submit`: payload plus its target collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRecord {
    pub collection_type: CollectionType,
    #[serde(flatten)]
    pub record: ProductRecord,
}

impl IngestRecord {
    pub fn id(&self) -> &str {
        &self.record.id
    }
}

/// Embeddings derived by the transform stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentVectors {
    pub item_name: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_short_desc: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_long_desc: Option<Vec<f32>>,
    pub provider_name: Vec<f32>,
}

/// A document as persisted in the status store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    pub collection_type: CollectionType,
    pub record: ProductRecord,
    pub status: DocumentStatus,
    /// Rejection reason; present only while `status` is `ERRORED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Only populated when read with [`Projection::WithVectors`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vectors: Option<DocumentVectors>,
}

/// Which columns a store read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Projection {
    /// Payload and status columns only.
    #[default]
    Summary,
    /// Also decode the stored embedding vectors.
    WithVectors,
}

/// Number of documents in one status for one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusCount {
    pub status: DocumentStatus,
    pub collection_type: CollectionType,
    pub count: u64,
}

/// Optional inclusive `createdAt` bounds for audit/export reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// IndexDocument
// ---------------------------------------------------------------------------

/// The flattened document published to the search index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    pub id: String,
    pub code: String,
    pub domain: String,
    pub bpp_id: String,
    pub bpp_name: String,
    pub bpp_uri: String,
    pub city: String,
    pub item_id: String,
    pub item_offers: Vec<String>,
    pub parent_item_id: Option<String>,
    pub item_category_id: String,
    pub item_currency: String,
    pub item_measure_quantity: String,
    pub item_measure_value: f64,
    pub item_name: String,
    pub item_name_vector: Vec<f32>,
    pub item_short_desc: Option<String>,
    pub item_short_desc_vector: Option<Vec<f32>>,
    pub item_long_desc: Option<String>,
    pub item_long_desc_vector: Option<Vec<f32>>,
    pub item_name_suggester_payload: String,
    pub item_selling_price: f64,
    pub item_mrp_price: f64,
    pub item_discount_percentage: f64,
    pub item_status: String,
    pub item_timestamp: String,
    pub provider_timestamp: String,
    pub item_symbol: String,
    pub item_veg: Option<String>,
    pub item_nonveg: Option<String>,
    pub item_available_count: u32,
    pub item_maximum_count: u32,
    pub item_cancellable_status: Option<String>,
    pub item_returnable_status: Option<String>,
    pub provider_name: String,
    pub provider_name_suggester_payload: String,
    pub provider_name_vector: Vec<f32>,
    pub provider_symbol: String,
    pub provider_status: Option<String>,
    pub provider_geo: String,
    pub provider_id: String,
    pub provider_location_id: String,
    pub provider_location_city: String,
    pub provider_location_area_code: String,
    pub provider_location_street: Option<String>,
    pub provider_min_order_value: f64,
    pub provider_start_time_day: u16,
    pub provider_end_time_day: u16,
    pub provider_days: Vec<u8>,
    pub provider_service_location_distance: f64,
    pub provider_service_type: u8,
}

impl IndexDocument {
    /// The embeddings carried by this document, for persisting after indexing.
    pub fn vectors(&self) -> DocumentVectors {
        DocumentVectors {
            item_name: self.item_name_vector.clone(),
            item_short_desc: self.item_short_desc_vector.clone(),
            item_long_desc: self.item_long_desc_vector.clone(),
            provider_name: self.provider_name_vector.clone(),
        }
    }
}

/// A transformed document on its way to the index core for its collection.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedDocument {
    pub collection_type: CollectionType,
    pub doc: IndexDocument,
}

impl EnrichedDocument {
    pub fn id(&self) -> &str {
        &self.doc.id
    }
}

/// A record that passes validation. Exposed through `crate::testing`.
pub(crate) fn sample_record_base() -> ProductRecord {
    ProductRecord {
        id: "0b6c1a52-8f1e-4f39-9a0e-5d2f5c3b7e11".into(),
        code: "SKU-1".into(),
        domain: "ONDC:RET10".into(),
        bpp_id: "seller.example.com".into(),
        bpp_name: "Example Seller".into(),
        bpp_uri: "https://seller.example.com/bpp".into(),
        city: "std:080".into(),
        item_id: "item-1".into(),
        item_offers: vec![],
        parent_item_id: None,
        item_category_id: "Fruits and Vegetables".into(),
        item_currency: "INR".into(),
        item_measure_quantity: "unit".into(),
        item_measure_value: 1.0,
        item_name: "Alphonso Mango".into(),
        item_short_description: Some("Sweet mango".into()),
        item_long_description: None,
        item_selling_price: 120.0,
        item_mrp_price: 150.0,
        item_discount_percentage: 20.0,
        item_status: "enable".into(),
        item_timestamp: "2024-05-01T10:00:00Z".into(),
        provider_timestamp: "2024-05-01T10:00:00".into(),
        item_symbol: "https://cdn.example.com/mango.png".into(),
        provider_symbol: "https://cdn.example.com/store.png".into(),
        item_veg: Some("yes".into()),
        item_nonveg: None,
        item_available_count: 10,
        item_maximum_count: 5,
        item_cancellable_status: None,
        item_returnable_status: None,
        provider_name: "Fresh Farms".into(),
        provider_status: Some("enable".into()),
        provider_geo_latitude: 12.9716,
        provider_geo_longitude: 77.5946,
        provider_id: "prov-1".into(),
        provider_location_id: "loc-1".into(),
        provider_location_city: "Bengaluru".into(),
        provider_location_area_code: "560001".into(),
        provider_location_street: None,
        provider_min_order_value: 0.0,
        provider_start_time_day: 900,
        provider_end_time_day: 2100,
        provider_days: vec![1, 2, 3, 4, 5],
        provider_service_location_distance: 5.0,
        provider_service_type: 10,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> ProductRecord {
        sample_record_base()
    }

    #[test]
    fn status_roundtrip() {
        for status in DocumentStatus::ALL {
            let parsed: DocumentStatus = status.as_str().parse().expect("parse status");
            assert_eq!(parsed, status);
        }
        assert_eq!(
            serde_json::to_string(&DocumentStatus::Queued).unwrap(),
            "\"QUEUED\""
        );
        assert!("PENDING".parse::<DocumentStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(DocumentStatus::Indexed.is_terminal());
        assert!(DocumentStatus::Errored.is_terminal());
        assert!(!DocumentStatus::New.is_terminal());
        assert!(!DocumentStatus::Queued.is_terminal());
    }

    #[test]
    fn valid_record_passes() {
        sample_record().validate().expect("sample record is valid");
    }

    #[test]
    fn rejects_bad_uuid_and_url() {
        let mut record = sample_record();
        record.id = "not-a-uuid".into();
        assert!(record.validate().unwrap_err().to_string().contains("UUID"));

        let mut record = sample_record();
        record.item_symbol = "cdn/mango.png".into();
        assert!(record.validate().unwrap_err().to_string().contains("item_symbol"));
    }

    #[test]
    fn rejects_out_of_range_fields() {
        let mut record = sample_record();
        record.provider_days = vec![0, 8];
        assert!(record.validate().is_err());

        let mut record = sample_record();
        record.provider_location_area_code = "5600".into();
        assert!(record.validate().is_err());

        let mut record = sample_record();
        record.item_selling_price = 0.0;
        assert!(record.validate().is_err());

        let mut record = sample_record();
        record.provider_service_type = 9;
        assert!(record.validate().is_err());
    }

    #[test]
    fn rejects_non_finite_numbers() {
        let mut record = sample_record();
        record.item_selling_price = f64::NAN;
        let err = record.validate().unwrap_err().to_string();
        assert!(err.contains("item_selling_price"), "{err}");

        let mut record = sample_record();
        record.item_mrp_price = f64::INFINITY;
        assert!(record.validate().is_err());

        let mut record = sample_record();
        record.item_measure_value = f64::NAN;
        assert!(record.validate().is_err());

        let mut record = sample_record();
        record.provider_min_order_value = f64::NEG_INFINITY;
        assert!(record.validate().is_err());

        let mut record = sample_record();
        record.provider_service_location_distance = f64::NAN;
        assert!(record.validate().is_err());
    }

    #[test]
    fn parses_naive_and_offset_timestamps() {
        assert!(parse_iso_timestamp("2024-05-01T10:00:00Z").is_some());
        assert!(parse_iso_timestamp("2024-05-01T10:00:00.123").is_some());
        assert!(parse_iso_timestamp("yesterday").is_none());
    }

    #[test]
    fn ingest_record_flattens_payload() {
        let json = serde_json::json!({
            "collection_type": "grocery",
            "id": "0b6c1a52-8f1e-4f39-9a0e-5d2f5c3b7e11",
        });
        // Missing required payload fields must fail decoding.
        assert!(serde_json::from_value::<IngestRecord>(json).is_err());

        let ingest = IngestRecord {
            collection_type: CollectionType::Grocery,
            record: sample_record(),
        };
        let value = serde_json::to_value(&ingest).unwrap();
        assert_eq!(value["collection_type"], "grocery");
        assert_eq!(value["item_name"], "Alphonso Mango");
        let back: IngestRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, ingest);
    }

    #[test]
    fn provider_geo_format() {
        assert_eq!(sample_record().provider_geo(), "12.9716,77.5946");
    }
}
