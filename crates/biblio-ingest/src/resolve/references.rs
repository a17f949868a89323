//! Citation edges between documents.
//!
//! An edge whose target is not stored yet is kept as a stub carrying the
//! target's identifiers; [`ReferenceResolver::backfill`] links stubs once the
//! target document appears. Either arrival order ends in the same edge set.

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{debug, instrument, warn};

use super::DocumentId;
use crate::db::StorageRetry;
use crate::error::IngestResult;
use crate::mapping::{normalize_doi, ReferenceEntry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct ReferenceEdge {
    pub citing_document_id: DocumentId,
    pub ord: i64,
    pub cited_document_id: Option<DocumentId>,
    pub cited_external_id: Option<String>,
    pub cited_secondary_id: Option<String>,
    pub raw_citation_text: Option<String>,
}

impl ReferenceEdge {
    pub fn is_stub(&self) -> bool {
        self.cited_document_id.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReferenceWriteSummary {
    pub resolved: u64,
    pub stubs: u64,
    /// Entries with nothing to link or display
    pub dropped: u64,
}

fn clean(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub struct ReferenceResolver {
    pool: SqlitePool,
    storage: StorageRetry,
}

impl ReferenceResolver {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            storage: StorageRetry::default(),
        }
    }

    pub fn with_storage_retry(mut self, storage: StorageRetry) -> Self {
        self.storage = storage;
        self
    }

    /// Replace the outgoing edges of `citing` with `entries`.
    ///
    /// Targets already stored are linked directly; the rest become stubs.
    #[instrument(skip(self, entries), fields(citing = %citing, entries = entries.len()))]
    pub async fn write_references(
        &self,
        citing: DocumentId,
        entries: &[ReferenceEntry],
    ) -> IngestResult<ReferenceWriteSummary> {
        let mut kept = Vec::with_capacity(entries.len());
        let mut dropped = 0u64;
        for entry in entries {
            if entry.is_empty() {
                warn!(citing = %citing, order = entry.order, "Dropping empty reference entry");
                dropped += 1;
                continue;
            }
            kept.push((
                entry.order as i64,
                entry.target_external_id.as_deref().and_then(normalize_doi),
                clean(&entry.target_secondary_id),
                clean(&entry.raw_citation_text),
            ));
        }

        let pool = &self.pool;
        let kept = &kept;
        let (resolved, stubs) = self
            .storage
            .run("write_references", move || async move {
                let mut tx = pool.begin().await?;

                sqlx::query("DELETE FROM document_references WHERE citing_document_id = ?")
                    .bind(citing)
                    .execute(&mut *tx)
                    .await?;

                let (mut resolved, mut stubs) = (0u64, 0u64);
                for (ord, doi, secondary, citation) in kept {
                    let target: Option<DocumentId> = if doi.is_some() || secondary.is_some() {
                        sqlx::query_scalar(
                            "SELECT id FROM documents WHERE external_id = ? OR secondary_id = ? \
                             ORDER BY CASE WHEN external_id = ? THEN 0 ELSE 1 END, id LIMIT 1",
                        )
                        .bind(doi)
                        .bind(secondary)
                        .bind(doi)
                        .fetch_optional(&mut *tx)
                        .await?
                    } else {
                        None
                    };

                    sqlx::query(
                        "INSERT OR REPLACE INTO document_references \
                            (citing_document_id, ord, cited_document_id, cited_external_id, cited_secondary_id, raw_citation_text) \
                         VALUES (?, ?, ?, ?, ?, ?)",
                    )
                    .bind(citing)
                    .bind(*ord)
                    .bind(target)
                    .bind(doi)
                    .bind(secondary)
                    .bind(citation)
                    .execute(&mut *tx)
                    .await?;

                    if target.is_some() {
                        resolved += 1;
                    } else {
                        stubs += 1;
                    }
                }

                tx.commit().await?;
                Ok((resolved, stubs))
            })
            .await?;

        debug!(resolved, stubs, dropped, "Wrote references");
        Ok(ReferenceWriteSummary {
            resolved,
            stubs,
            dropped,
        })
    }

    /// Point every stub naming `external_id` or `secondary_id` at `document`.
    /// Returns the number of stubs resolved.
    #[instrument(skip(self))]
    pub async fn backfill(
        &self,
        document: DocumentId,
        external_id: Option<&str>,
        secondary_id: Option<&str>,
    ) -> IngestResult<u64> {
        if external_id.is_none() && secondary_id.is_none() {
            return Ok(0);
        }

        let pool = &self.pool;
        let linked = self
            .storage
            .run("backfill_references", move || async move {
                sqlx::query(
                    "UPDATE document_references SET cited_document_id = ? \
                     WHERE cited_document_id IS NULL AND (cited_external_id = ? OR cited_secondary_id = ?)",
                )
                .bind(document)
                .bind(external_id)
                .bind(secondary_id)
                .execute(pool)
                .await
            })
            .await?
            .rows_affected();

        if linked > 0 {
            debug!(document = %document, linked, "Backfilled reference stubs");
        }
        Ok(linked)
    }

    pub async fn references_of(&self, citing: DocumentId) -> IngestResult<Vec<ReferenceEdge>> {
        let pool = &self.pool;
        self.storage
            .run("references_of", move || async move {
                sqlx::query_as(
                    "SELECT citing_document_id, ord, cited_document_id, cited_external_id, cited_secondary_id, raw_citation_text \
                     FROM document_references WHERE citing_document_id = ? ORDER BY ord",
                )
                .bind(citing)
                .fetch_all(pool)
                .await
            })
            .await
    }
}
