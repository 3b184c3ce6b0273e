//! Operator reports: per-status counts and CSV export.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, instrument};

use catalogsync_shared::{
    CatalogError, DocumentStatus, Result, StatusCount, StoredDocument, TimeRange,
};
use catalogsync_storage::Storage;

// ---------------------------------------------------------------------------
// Status report
// ---------------------------------------------------------------------------

/// Backlog and outcome counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// One entry per status, in lifecycle order, zeros included.
    pub totals: Vec<(DocumentStatus, u64)>,
    pub by_collection: Vec<StatusCount>,
}

impl StatusReport {
    pub fn total(&self, status: DocumentStatus) -> u64 {
        self.totals
            .iter()
            .find(|(s, _)| *s == status)
            .map_or(0, |(_, n)| *n)
    }
}

pub async fn status_report(storage: &Storage) -> Result<StatusReport> {
    let by_collection = storage.status_counts().await?;
    let totals = DocumentStatus::ALL
        .iter()
        .map(|status| {
            let n = by_collection
                .iter()
                .filter(|c| c.status == *status)
                .map(|c| c.count)
                .sum();
            (*status, n)
        })
        .collect();

    Ok(StatusReport {
        totals,
        by_collection,
    })
}

// ---------------------------------------------------------------------------
// CSV export
// ---------------------------------------------------------------------------

/// Columns describing the document itself, written before the payload.
const DOCUMENT_COLUMNS: &[&str] = &[
    "id",
    "collection_type",
    "status",
    "error",
    "created_at",
    "updated_at",
];

/// Payload fields, in record order. `id` is already a document column.
const PAYLOAD_COLUMNS: &[&str] = &[
    "code",
    "domain",
    "bpp_id",
    "bpp_name",
    "bpp_uri",
    "city",
    "item_id",
    "item_offers",
    "parent_item_id",
    "item_category_id",
    "item_currency",
    "item_measure_quantity",
    "item_measure_value",
    "item_name",
    "item_short_description",
    "item_long_description",
    "item_selling_price",
    "item_mrp_price",
    "item_discount_percentage",
    "item_status",
    "item_timestamp",
    "provider_timestamp",
    "item_symbol",
    "provider_symbol",
    "item_veg",
    "item_nonveg",
    "item_available_count",
    "item_maximum_count",
    "item_cancellable_status",
    "item_returnable_status",
    "provider_name",
    "provider_status",
    "provider_geo_latitude",
    "provider_geo_longitude",
    "provider_id",
    "provider_location_id",
    "provider_location_city",
    "provider_location_area_code",
    "provider_location_street",
    "provider_min_order_value",
    "provider_start_time_day",
    "provider_end_time_day",
    "provider_days",
    "provider_service_location_distance",
    "provider_service_type",
];

/// Rows fetched from the store per page.
pub const EXPORT_PAGE_SIZE: usize = 1000;

/// Write every document in `status` created within `range` as CSV, one page
/// at a time. Returns the number of data rows written.
#[instrument(skip(storage, out))]
pub async fn export_csv<W>(
    storage: &Storage,
    status: DocumentStatus,
    range: TimeRange,
    out: &mut W,
) -> Result<u64>
where
    W: AsyncWrite + Unpin,
{
    let header = DOCUMENT_COLUMNS
        .iter()
        .chain(PAYLOAD_COLUMNS)
        .map(|c| c.to_string())
        .collect::<Vec<_>>();
    write_line(out, &header).await?;

    let mut written = 0u64;
    let mut offset = 0usize;
    loop {
        let page = storage
            .fetch_range_page(status, range, EXPORT_PAGE_SIZE, offset)
            .await?;
        if page.is_empty() {
            break;
        }
        for doc in &page {
            write_line(out, &csv_row(doc)?).await?;
            written += 1;
        }
        debug!(offset, rows = page.len(), "exported page");
        // Undecodable rows are skipped by the store, so a short page does
        // not mean the range is exhausted.
        offset += EXPORT_PAGE_SIZE;
    }

    out.flush().await.map_err(|e| CatalogError::io("<export>", e))?;
    info!(rows = written, %status, "export complete");
    Ok(written)
}

fn csv_row(doc: &StoredDocument) -> Result<Vec<String>> {
    let payload = serde_json::to_value(&doc.record)?;
    let mut row = vec![
        doc.id.clone(),
        doc.collection_type.to_string(),
        doc.status.to_string(),
        doc.error.clone().unwrap_or_default(),
        iso(doc.created_at),
        iso(doc.updated_at),
    ];
    row.extend(
        PAYLOAD_COLUMNS
            .iter()
            .map(|column| cell(payload.get(*column).unwrap_or(&Value::Null))),
    );
    Ok(row)
}

fn iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Quote a field when it contains a delimiter, quote or line break.
fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

async fn write_line<W>(out: &mut W, fields: &[String]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = fields.iter().map(|f| escape(f)).collect::<Vec<_>>().join(",");
    line.push_str("\r\n");
    out.write_all(line.as_bytes())
        .await
        .map_err(|e| CatalogError::io("<export>", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ingest, test_storage};
    use catalogsync_shared::CollectionType;
    use catalogsync_shared::testing::sample_record;

    #[test]
    fn payload_columns_cover_every_record_field() {
        let value = serde_json::to_value(sample_record("x")).unwrap();
        let keys: Vec<&String> = value.as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), PAYLOAD_COLUMNS.len() + 1);
        for key in keys.iter().filter(|k| k.as_str() != "id") {
            assert!(PAYLOAD_COLUMNS.contains(&key.as_str()), "missing column {key}");
        }
    }

    #[test]
    fn escape_quotes_only_when_needed() {
        assert_eq!(escape("plain"), "plain");
        assert_eq!(escape("a,b"), "\"a,b\"");
        assert_eq!(escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape("two\nlines"), "\"two\nlines\"");
    }

    #[tokio::test]
    async fn report_counts_every_status() {
        let storage = test_storage().await;
        let records = vec![
            ingest(CollectionType::Grocery),
            ingest(CollectionType::Grocery),
            ingest(CollectionType::Fnb),
        ];
        storage.upsert_many(&records).await.unwrap();
        storage
            .set_status(&[records[2].id().to_string()], DocumentStatus::Errored, Some("bad"))
            .await
            .unwrap();

        let report = status_report(&storage).await.unwrap();
        assert_eq!(report.total(DocumentStatus::New), 2);
        assert_eq!(report.total(DocumentStatus::Errored), 1);
        assert_eq!(report.total(DocumentStatus::Indexed), 0);
        assert_eq!(report.totals.len(), 4);
        assert_eq!(report.by_collection.len(), 2);
    }

    #[tokio::test]
    async fn export_writes_errored_documents_with_reason() {
        let storage = test_storage().await;
        let records = vec![ingest(CollectionType::Grocery), ingest(CollectionType::Electronics)];
        storage.upsert_many(&records).await.unwrap();
        storage
            .set_status(
                &[records[1].id().to_string()],
                DocumentStatus::Errored,
                Some("invalid item_symbol, provider_symbol"),
            )
            .await
            .unwrap();

        let mut out = Vec::new();
        let rows = export_csv(&storage, DocumentStatus::Errored, TimeRange::default(), &mut out)
            .await
            .unwrap();
        assert_eq!(rows, 1);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("id,collection_type,status,error,created_at,updated_at,code"));
        assert!(lines[1].starts_with(&format!("{},electronics,ERRORED,", records[1].id())));
        assert!(lines[1].contains("\"invalid item_symbol, provider_symbol\""));
        // ISO-8601 UTC timestamps.
        assert!(lines[1].contains("Z,"));
    }

    #[tokio::test]
    async fn export_respects_time_range() {
        let storage = test_storage().await;
        storage.upsert_many(&[ingest(CollectionType::Fnb)]).await.unwrap();

        let range = TimeRange {
            from: Some(Utc::now() + chrono::Duration::hours(1)),
            to: None,
        };
        let mut out = Vec::new();
        let rows = export_csv(&storage, DocumentStatus::New, range, &mut out)
            .await
            .unwrap();
        assert_eq!(rows, 0);
        // Header only.
        assert_eq!(String::from_utf8(out).unwrap().matches("\r\n").count(), 1);
    }
}
