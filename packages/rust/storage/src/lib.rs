//! Turso Embedded / libSQL status store.
//!
//! The [`Storage`] struct wraps a libSQL database holding every submitted
//! document, its payload, its position in the status state machine and,
//! once indexed, its embedding vectors.
//!
//! **Access rules:**
//! - The pipeline (`catalogsync run`, `submit`): read-write via [`Storage::open`]
//! - Operator commands (`list`, `status`, `export`): read-only via [`Storage::open_readonly`]
//!
//! Every write goes through a single writer lock, so multi-statement writes
//! never interleave on the shared connection.

mod migrations;

use std::path::Path;

use catalogsync_shared::{
    CatalogError, CollectionType, DocumentStatus, DocumentVectors, IngestRecord, Projection,
    Result, StatusCount, StoredDocument, TimeRange,
};
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database, Value, params};
use tokio::sync::Mutex;

/// Maximum ids bound into a single `IN (...)` clause.
const ID_CHUNK: usize = 500;

const SUMMARY_COLUMNS: &str =
    "id, collection_type, payload_json, status, error, created_at, updated_at";
const VECTOR_COLUMNS: &str =
    "id, collection_type, payload_json, status, error, created_at, updated_at, vectors_json";

/// `updated_at` never moves backwards, even if the caller's clock does.
const ADVANCE_UPDATED_AT: &str =
    "updated_at = CASE WHEN ?1 > updated_at THEN ?1 ELSE updated_at END";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    write_lock: Mutex<()>,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CatalogError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| CatalogError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| CatalogError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            write_lock: Mutex::new(()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (operator commands).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CatalogError::Storage(format!(
                "database {} does not exist",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| CatalogError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| CatalogError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            write_lock: Mutex::new(()),
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        CatalogError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(CatalogError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Get one document by id.
    pub async fn get(&self, id: &str, projection: Projection) -> Result<Option<StoredDocument>> {
        let sql = format!(
            "SELECT {} FROM documents WHERE id = ?1",
            columns(projection)
        );
        let mut rows = self
            .conn
            .query(&sql, params![id])
            .await
            .map_err(CatalogError::storage)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_document(&row, projection)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(CatalogError::storage(e)),
        }
    }

    /// Up to `limit` documents in `status`, oldest first.
    pub async fn fetch_by_status(
        &self,
        status: DocumentStatus,
        limit: usize,
        projection: Projection,
    ) -> Result<Vec<StoredDocument>> {
        self.fetch_page(status, limit, 0, projection).await
    }

    /// A page of documents in `status`, ordered by `created_at` then id.
    /// Does not change any status.
    pub async fn fetch_page(
        &self,
        status: DocumentStatus,
        limit: usize,
        offset: usize,
        projection: Projection,
    ) -> Result<Vec<StoredDocument>> {
        let sql = format!(
            "SELECT {} FROM documents WHERE status = ?1
             ORDER BY created_at, id LIMIT ?2 OFFSET ?3",
            columns(projection)
        );
        let rows = self
            .conn
            .query(
                &sql,
                params![status.as_str(), limit as i64, offset as i64],
            )
            .await
            .map_err(CatalogError::storage)?;

        collect_documents(rows, projection).await
    }

    /// Every document in `status` created within `range` (inclusive bounds).
    pub async fn fetch_by_status_and_time_range(
        &self,
        status: DocumentStatus,
        range: TimeRange,
    ) -> Result<Vec<StoredDocument>> {
        self.fetch_range_page(status, range, i64::MAX as usize, 0)
            .await
    }

    /// Paged form of [`Storage::fetch_by_status_and_time_range`], for streaming exports.
    pub async fn fetch_range_page(
        &self,
        status: DocumentStatus,
        range: TimeRange,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredDocument>> {
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM documents
             WHERE status = ?1
               AND (?2 IS NULL OR created_at >= ?2)
               AND (?3 IS NULL OR created_at <= ?3)
             ORDER BY created_at, id LIMIT ?4 OFFSET ?5"
        );
        let rows = self
            .conn
            .query(
                &sql,
                params![
                    status.as_str(),
                    range.from.map(format_ts),
                    range.to.map(format_ts),
                    limit.min(i64::MAX as usize) as i64,
                    offset as i64,
                ],
            )
            .await
            .map_err(CatalogError::storage)?;

        collect_documents(rows, Projection::Summary).await
    }

    /// Number of documents currently in `status`.
    pub async fn count_by_status(&self, status: DocumentStatus) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM documents WHERE status = ?1",
                params![status.as_str()],
            )
            .await
            .map_err(CatalogError::storage)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).map_err(CatalogError::storage)? as u64),
            Ok(None) => Ok(0),
            Err(e) => Err(CatalogError::storage(e)),
        }
    }

    /// Document counts grouped by status and collection. Empty groups are omitted.
    pub async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        let mut rows = self
            .conn
            .query(
                "SELECT status, collection_type, COUNT(*) FROM documents
                 GROUP BY status, collection_type
                 ORDER BY status, collection_type",
                params![],
            )
            .await
            .map_err(CatalogError::storage)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(CatalogError::storage)? {
            let status: String = row.get(0).map_err(CatalogError::storage)?;
            let collection: String = row.get(1).map_err(CatalogError::storage)?;
            results.push(StatusCount {
                status: status.parse()?,
                collection_type: collection.parse()?,
                count: row.get::<i64>(2).map_err(CatalogError::storage)? as u64,
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Insert or replace documents as `NEW`.
    ///
    /// `created_at` is written only on first insert. Resubmitting an existing
    /// id replaces its payload, clears its error and vectors, and returns it
    /// to `NEW`. Returns the number of rows written.
    pub async fn upsert_many(&self, records: &[IngestRecord]) -> Result<u64> {
        self.check_writable()?;
        if records.is_empty() {
            return Ok(0);
        }
        let _guard = self.write_lock.lock().await;

        let tx = self
            .conn
            .transaction()
            .await
            .map_err(CatalogError::storage)?;

        let now = now_ts();
        let mut written = 0u64;
        for record in records {
            let payload = serde_json::to_string(&record.record)?;
            written += tx
                .execute(
                    "INSERT INTO documents
                       (id, collection_type, payload_json, status, error, created_at, updated_at, vectors_json)
                     VALUES (?2, ?3, ?4, 'NEW', NULL, ?1, ?1, NULL)
                     ON CONFLICT(id) DO UPDATE SET
                       collection_type = excluded.collection_type,
                       payload_json = excluded.payload_json,
                       status = 'NEW',
                       error = NULL,
                       vectors_json = NULL,
                       updated_at = CASE WHEN ?1 > documents.updated_at
                                    THEN ?1 ELSE documents.updated_at END",
                    params![
                        now.as_str(),
                        record.id(),
                        record.collection_type.as_str(),
                        payload,
                    ],
                )
                .await
                .map_err(CatalogError::storage)?;
        }

        tx.commit().await.map_err(CatalogError::storage)?;
        tracing::debug!(count = written, "upserted documents as NEW");
        Ok(written)
    }

    /// Atomically move up to `limit` of the oldest `NEW` documents to `QUEUED`
    /// and return them.
    ///
    /// Selection and update happen in one statement, so concurrent callers
    /// never claim the same document. A claimed row whose payload no longer
    /// decodes is moved to `ERRORED` with the decode error as its reason and
    /// left out of the result.
    pub async fn claim_new(&self, limit: usize) -> Result<Vec<StoredDocument>> {
        self.check_writable()?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let _guard = self.write_lock.lock().await;

        let sql = format!(
            "UPDATE documents SET status = 'QUEUED', error = NULL, {ADVANCE_UPDATED_AT}
             WHERE status = 'NEW' AND id IN (
               SELECT id FROM documents WHERE status = 'NEW'
               ORDER BY created_at, id LIMIT ?2
             )
             RETURNING {SUMMARY_COLUMNS}"
        );
        let rows = self
            .conn
            .query(&sql, params![now_ts(), limit as i64])
            .await
            .map_err(CatalogError::storage)?;

        let (mut claimed, undecodable) = decode_rows(rows, Projection::Summary).await?;
        let now = now_ts();
        for (id, reason) in &undecodable {
            let sql = format!(
                "UPDATE documents SET status = 'ERRORED', error = ?2, {ADVANCE_UPDATED_AT}
                 WHERE id = ?3"
            );
            self.conn
                .execute(&sql, params![now.as_str(), reason.as_str(), id.as_str()])
                .await
                .map_err(CatalogError::storage)?;
            tracing::warn!(%id, %reason, "claimed document has an undecodable payload, marked ERRORED");
        }
        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(claimed)
    }

    /// Move the given documents to `status`.
    ///
    /// `reason` is recorded only for `ERRORED`; any other status clears the
    /// error. Ids that do not exist are ignored. Returns the number of rows
    /// updated.
    pub async fn set_status(
        &self,
        ids: &[String],
        status: DocumentStatus,
        reason: Option<&str>,
    ) -> Result<u64> {
        self.check_writable()?;
        if ids.is_empty() {
            return Ok(0);
        }
        let _guard = self.write_lock.lock().await;

        let error_expr = if status == DocumentStatus::Errored {
            "COALESCE(?3, error)"
        } else {
            "NULL"
        };
        let now = now_ts();
        let mut updated = 0u64;

        for chunk in ids.chunks(ID_CHUNK) {
            let placeholders = placeholders(4, chunk.len());
            let sql = format!(
                "UPDATE documents SET status = ?2, error = {error_expr}, {ADVANCE_UPDATED_AT}
                 WHERE id IN ({placeholders})"
            );
            let mut values: Vec<Value> = vec![
                Value::from(now.clone()),
                Value::from(status.as_str().to_string()),
                reason.map_or(Value::Null, |r| Value::from(r.to_string())),
            ];
            values.extend(chunk.iter().map(|id| Value::from(id.clone())));

            updated += self
                .conn
                .execute(&sql, values)
                .await
                .map_err(CatalogError::storage)?;
        }

        tracing::debug!(count = updated, %status, "updated document status");
        Ok(updated)
    }

    /// Startup recovery: return every `QUEUED` document to `NEW`.
    ///
    /// Payload, `created_at` and error are left untouched. Returns the number
    /// of documents recovered.
    pub async fn reset_queued_to_new(&self) -> Result<u64> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;

        let sql =
            format!("UPDATE documents SET status = 'NEW', {ADVANCE_UPDATED_AT} WHERE status = 'QUEUED'");
        let recovered = self
            .conn
            .execute(&sql, params![now_ts()])
            .await
            .map_err(CatalogError::storage)?;

        if recovered > 0 {
            tracing::info!(count = recovered, "recovered in-flight documents to NEW");
        }
        Ok(recovered)
    }

    /// Persist the embeddings of an indexed document.
    pub async fn save_vectors(&self, id: &str, vectors: &DocumentVectors) -> Result<()> {
        self.check_writable()?;
        let json = serde_json::to_string(vectors)?;
        let _guard = self.write_lock.lock().await;

        self.conn
            .execute(
                "UPDATE documents SET vectors_json = ?1 WHERE id = ?2",
                params![json, id],
            )
            .await
            .map_err(CatalogError::storage)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn columns(projection: Projection) -> &'static str {
    match projection {
        Projection::Summary => SUMMARY_COLUMNS,
        Projection::WithVectors => VECTOR_COLUMNS,
    }
}

/// `?start, ?start+1, ...` for `count` positional parameters.
fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_ts() -> String {
    format_ts(Utc::now())
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CatalogError::Storage(format!("invalid date '{s}': {e}")))
}

/// Decode every row, skipping those whose payload no longer decodes.
async fn collect_documents(rows: libsql::Rows, projection: Projection) -> Result<Vec<StoredDocument>> {
    let (docs, undecodable) = decode_rows(rows, projection).await?;
    for (id, reason) in &undecodable {
        tracing::warn!(%id, %reason, "skipping undecodable document");
    }
    Ok(docs)
}

/// Decode rows into documents. A row whose payload or vectors fail to
/// deserialize is returned as `(id, reason)` instead of failing the batch.
async fn decode_rows(
    mut rows: libsql::Rows,
    projection: Projection,
) -> Result<(Vec<StoredDocument>, Vec<(String, String)>)> {
    let mut docs = Vec::new();
    let mut undecodable = Vec::new();
    while let Some(row) = rows.next().await.map_err(CatalogError::storage)? {
        match row_to_document(&row, projection) {
            Ok(doc) => docs.push(doc),
            Err(CatalogError::Serialization(reason)) => {
                let id: String = row.get(0).map_err(CatalogError::storage)?;
                undecodable.push((id, reason));
            }
            Err(e) => return Err(e),
        }
    }
    Ok((docs, undecodable))
}

/// Convert a database row to a [`StoredDocument`].
fn row_to_document(row: &libsql::Row, projection: Projection) -> Result<StoredDocument> {
    let collection: String = row.get(1).map_err(CatalogError::storage)?;
    let payload: String = row.get(2).map_err(CatalogError::storage)?;
    let status: String = row.get(3).map_err(CatalogError::storage)?;
    let created_at: String = row.get(5).map_err(CatalogError::storage)?;
    let updated_at: String = row.get(6).map_err(CatalogError::storage)?;

    let vectors = match projection {
        Projection::Summary => None,
        Projection::WithVectors => match row.get::<String>(7).ok() {
            Some(json) => Some(serde_json::from_str::<DocumentVectors>(&json)?),
            None => None,
        },
    };

    Ok(StoredDocument {
        id: row.get::<String>(0).map_err(CatalogError::storage)?,
        collection_type: collection.parse::<CollectionType>()?,
        record: serde_json::from_str(&payload)?,
        status: status.parse()?,
        error: row.get::<String>(4).ok(),
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        vectors,
    })
}
