//! Create-or-reuse resolution of canonical entities.
//!
//! Every lookup-or-create runs under a [`KeyedGate`] slot for the entity's
//! natural key, so concurrent workers never create the same entity twice. The
//! unique constraints in the schema stay in place as a backstop. Gates are
//! always taken before a pooled connection is acquired.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, Ordering};

use sqlx::SqlitePool;
use tracing::{debug, instrument, warn};

use super::gate::KeyedGate;
use super::{
    AffiliationId, AuthorDraft, AuthorId, AuthorLink, CanonicalHandle, DocumentDraft, DocumentId,
    DocumentUpsert, EntityDraft, JournalDraft, JournalId,
};
use crate::db::StorageRetry;
use crate::error::{EntityKind, IngestError, IngestResult};
use crate::normalize::{name_similarity, similarity, NormalizedAffiliation};

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.85;
pub const DEFAULT_NAME_TOLERANCE: f64 = 0.80;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolutionSettings {
    /// Minimum score for merging an affiliation into an existing entity
    pub similarity_threshold: f64,
    /// Minimum name/title similarity before a shared ORCID or ISSN is a conflict
    pub name_tolerance: f64,
}

impl Default for ResolutionSettings {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            name_tolerance: DEFAULT_NAME_TOLERANCE,
        }
    }
}

/// Existing affiliation considered for a fuzzy merge.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct AffiliationCandidate {
    pub id: AffiliationId,
    pub normalized_name: String,
    pub observation_count: i64,
}

/// Highest score at or above `threshold`; ties go to the most observed, then
/// the oldest entity.
pub fn pick_best_match(
    normalized_name: &str,
    candidates: &[AffiliationCandidate],
    threshold: f64,
) -> Option<(AffiliationId, f64)> {
    candidates
        .iter()
        .map(|c| (similarity(normalized_name, &c.normalized_name), c))
        .filter(|(score, _)| *score >= threshold)
        .max_by(|(score_a, a), (score_b, b)| {
            score_a
                .partial_cmp(score_b)
                .unwrap_or(CmpOrdering::Equal)
                .then(a.observation_count.cmp(&b.observation_count))
                .then(b.id.cmp(&a.id))
        })
        .map(|(score, c)| (c.id, score))
}

type DocumentRow = (i64, Option<String>, Option<String>);

pub struct EntityUpsertCoordinator {
    pool: SqlitePool,
    gate: KeyedGate,
    storage: StorageRetry,
    settings: ResolutionSettings,
    conflicts: AtomicU64,
}

impl EntityUpsertCoordinator {
    pub fn new(pool: SqlitePool, settings: ResolutionSettings) -> Self {
        Self {
            pool,
            gate: KeyedGate::new(),
            storage: StorageRetry::default(),
            settings,
            conflicts: AtomicU64::new(0),
        }
    }

    pub fn with_storage_retry(mut self, storage: StorageRetry) -> Self {
        self.storage = storage;
        self
    }

    pub fn settings(&self) -> ResolutionSettings {
        self.settings
    }

    /// Conflicts recorded by this coordinator since construction.
    pub fn conflict_count(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    pub async fn resolve(&self, draft: &EntityDraft) -> IngestResult<CanonicalHandle> {
        Ok(match draft {
            EntityDraft::Affiliation(a) => CanonicalHandle::Affiliation(self.resolve_affiliation(a).await?),
            EntityDraft::Author(a) => CanonicalHandle::Author(self.resolve_author(a).await?),
            EntityDraft::Journal(j) => CanonicalHandle::Journal(self.resolve_journal(j).await?),
            EntityDraft::Document(d) => CanonicalHandle::Document(self.upsert_document(d).await?.id),
        })
    }

    // ========================================================================
    // Affiliations
    // ========================================================================

    /// Resolve under the country bucket gate: fuzzy matching can merge drafts
    /// with different canonical keys, so the whole bucket is serialized.
    #[instrument(skip(self, draft), fields(key = %draft.canonical_key))]
    pub async fn resolve_affiliation(&self, draft: &NormalizedAffiliation) -> IngestResult<AffiliationId> {
        let _guard = self.gate.lock(format!("affiliation:{}", draft.country_slug())).await;

        if let Some(id) = self.find_affiliation_by_variant(&draft.raw).await? {
            debug!(affiliation_id = %id, "Raw variant already known");
            return Ok(id);
        }

        let target = match self.find_affiliation_by_key(&draft.canonical_key).await? {
            Some(id) => Some(id),
            None if draft.is_structured() => self.best_fuzzy_match(draft).await?,
            None => None,
        };

        match target {
            Some(id) => {
                self.merge_affiliation(id, draft).await?;
                debug!(affiliation_id = %id, "Merged affiliation variant");
                Ok(id)
            }
            None => self.create_affiliation(draft).await,
        }
    }

    async fn find_affiliation_by_variant(&self, raw: &str) -> IngestResult<Option<AffiliationId>> {
        let pool = &self.pool;
        self.storage
            .run("find_affiliation_by_variant", move || async move {
                sqlx::query_scalar::<_, AffiliationId>(
                    "SELECT affiliation_id FROM affiliation_variants WHERE raw_text = ? ORDER BY affiliation_id LIMIT 1",
                )
                .bind(raw)
                .fetch_optional(pool)
                .await
            })
            .await
    }

    async fn find_affiliation_by_key(&self, key: &str) -> IngestResult<Option<AffiliationId>> {
        let pool = &self.pool;
        self.storage
            .run("find_affiliation_by_key", move || async move {
                sqlx::query_scalar::<_, AffiliationId>("SELECT id FROM affiliations WHERE canonical_key = ?")
                    .bind(key)
                    .fetch_optional(pool)
                    .await
            })
            .await
    }

    async fn best_fuzzy_match(&self, draft: &NormalizedAffiliation) -> IngestResult<Option<AffiliationId>> {
        let pool = &self.pool;
        let country = draft.country.as_deref();
        let candidates: Vec<AffiliationCandidate> = self
            .storage
            .run("affiliation_candidates", move || async move {
                sqlx::query_as(
                    "SELECT id, normalized_name, observation_count FROM affiliations \
                     WHERE country IS ? AND institution IS NOT NULL ORDER BY id",
                )
                .bind(country)
                .fetch_all(pool)
                .await
            })
            .await?;

        let best = pick_best_match(&draft.normalized_name, &candidates, self.settings.similarity_threshold);
        if let Some((id, score)) = best {
            debug!(affiliation_id = %id, score, "Fuzzy affiliation match");
        }
        Ok(best.map(|(id, _)| id))
    }

    async fn merge_affiliation(&self, id: AffiliationId, draft: &NormalizedAffiliation) -> IngestResult<()> {
        let pool = &self.pool;
        self.storage
            .run("merge_affiliation", move || async move {
                let mut tx = pool.begin().await?;

                let added = sqlx::query("INSERT OR IGNORE INTO affiliation_variants (affiliation_id, raw_text) VALUES (?, ?)")
                    .bind(id)
                    .bind(&draft.raw)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();

                sqlx::query(
                    "UPDATE affiliations SET \
                        observation_count = observation_count + ?, \
                        department = COALESCE(department, ?), \
                        city = COALESCE(city, ?), \
                        state = COALESCE(state, ?), \
                        postal_code = COALESCE(postal_code, ?), \
                        email = COALESCE(email, ?), \
                        updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') \
                     WHERE id = ?",
                )
                .bind(added as i64)
                .bind(&draft.department)
                .bind(&draft.city)
                .bind(&draft.state)
                .bind(&draft.postal_code)
                .bind(&draft.email)
                .bind(id)
                .execute(&mut *tx)
                .await?;

                tx.commit().await
            })
            .await
    }

    async fn create_affiliation(&self, draft: &NormalizedAffiliation) -> IngestResult<AffiliationId> {
        let pool = &self.pool;
        let id = self
            .storage
            .run("create_affiliation", move || async move {
                let mut tx = pool.begin().await?;

                let inserted = sqlx::query(
                    "INSERT INTO affiliations \
                        (canonical_key, normalized_name, institution, department, city, state, country, postal_code, email) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
                     ON CONFLICT(canonical_key) DO NOTHING",
                )
                .bind(&draft.canonical_key)
                .bind(&draft.normalized_name)
                .bind(&draft.institution)
                .bind(&draft.department)
                .bind(&draft.city)
                .bind(&draft.state)
                .bind(&draft.country)
                .bind(&draft.postal_code)
                .bind(&draft.email)
                .execute(&mut *tx)
                .await?
                .rows_affected();

                let id: AffiliationId = sqlx::query_scalar("SELECT id FROM affiliations WHERE canonical_key = ?")
                    .bind(&draft.canonical_key)
                    .fetch_one(&mut *tx)
                    .await?;

                let added = sqlx::query("INSERT OR IGNORE INTO affiliation_variants (affiliation_id, raw_text) VALUES (?, ?)")
                    .bind(id)
                    .bind(&draft.raw)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();

                if inserted == 0 && added == 1 {
                    sqlx::query("UPDATE affiliations SET observation_count = observation_count + 1 WHERE id = ?")
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }

                tx.commit().await?;
                Ok(id)
            })
            .await?;

        debug!(affiliation_id = %id, "Created affiliation");
        Ok(id)
    }

    // ========================================================================
    // Authors and journals
    // ========================================================================

    #[instrument(skip(self, draft))]
    pub async fn resolve_author(&self, draft: &AuthorDraft) -> IngestResult<AuthorId> {
        let key = draft.natural_key().ok_or_else(|| IngestError::InvalidDraft {
            entity: EntityKind::Author,
            reason: "author has neither ORCID nor name".to_string(),
        })?;
        let _guard = self.gate.lock(format!("author:{}", key)).await;

        let pool = &self.pool;
        let key_ref = key.as_str();
        let existing: Option<(AuthorId, Option<String>, Option<String>, Option<String>)> = self
            .storage
            .run("find_author", move || async move {
                sqlx::query_as("SELECT id, last_name, fore_name, collective_name FROM authors WHERE natural_key = ?")
                    .bind(key_ref)
                    .fetch_optional(pool)
                    .await
            })
            .await?;

        if let Some((id, last_name, fore_name, collective_name)) = existing {
            if draft.orcid.is_some() {
                let stored = AuthorDraft {
                    last_name,
                    fore_name,
                    collective_name,
                    ..AuthorDraft::default()
                };
                let kept = stored.display_name();
                let seen = draft.display_name();
                if !kept.is_empty() && !seen.is_empty() && name_similarity(&kept, &seen) < self.settings.name_tolerance {
                    self.record_conflict(EntityKind::Author, &key, "name", Some(&kept), Some(&seen))
                        .await?;
                }
            }
            return Ok(id);
        }

        let orcid = draft.orcid.as_deref().map(|o| o.trim().to_uppercase());
        let orcid_ref = orcid.as_deref();
        let id = self
            .storage
            .run("create_author", move || async move {
                let mut tx = pool.begin().await?;
                sqlx::query(
                    "INSERT INTO authors (natural_key, orcid, last_name, fore_name, initials, collective_name) \
                     VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT(natural_key) DO NOTHING",
                )
                .bind(key_ref)
                .bind(orcid_ref)
                .bind(&draft.last_name)
                .bind(&draft.fore_name)
                .bind(&draft.initials)
                .bind(&draft.collective_name)
                .execute(&mut *tx)
                .await?;

                let id: AuthorId = sqlx::query_scalar("SELECT id FROM authors WHERE natural_key = ?")
                    .bind(key_ref)
                    .fetch_one(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(id)
            })
            .await?;

        debug!(author_id = %id, key = %key, "Created author");
        Ok(id)
    }

    #[instrument(skip(self, draft))]
    pub async fn resolve_journal(&self, draft: &JournalDraft) -> IngestResult<JournalId> {
        let key = draft.natural_key().ok_or_else(|| IngestError::InvalidDraft {
            entity: EntityKind::Journal,
            reason: "journal has neither ISSN nor title".to_string(),
        })?;
        let _guard = self.gate.lock(format!("journal:{}", key)).await;

        let pool = &self.pool;
        let key_ref = key.as_str();
        let existing: Option<(JournalId, Option<String>)> = self
            .storage
            .run("find_journal", move || async move {
                sqlx::query_as("SELECT id, title FROM journals WHERE natural_key = ?")
                    .bind(key_ref)
                    .fetch_optional(pool)
                    .await
            })
            .await?;

        if let Some((id, stored_title)) = existing {
            if let (Some(kept), Some(seen)) = (stored_title.as_deref(), draft.title.as_deref()) {
                if draft.issn.is_some() && name_similarity(kept, seen) < self.settings.name_tolerance {
                    self.record_conflict(EntityKind::Journal, &key, "title", Some(kept), Some(seen))
                        .await?;
                }
            }

            self.storage
                .run("refine_journal", move || async move {
                    sqlx::query(
                        "UPDATE journals SET title = COALESCE(title, ?), iso_abbreviation = COALESCE(iso_abbreviation, ?) \
                         WHERE id = ?",
                    )
                    .bind(&draft.title)
                    .bind(&draft.iso_abbreviation)
                    .bind(id)
                    .execute(pool)
                    .await
                })
                .await?;
            return Ok(id);
        }

        let issn = draft.issn.as_deref().map(|i| i.trim().to_uppercase());
        let issn_ref = issn.as_deref();
        let id = self
            .storage
            .run("create_journal", move || async move {
                let mut tx = pool.begin().await?;
                sqlx::query(
                    "INSERT INTO journals (natural_key, issn, title, iso_abbreviation) VALUES (?, ?, ?, ?) \
                     ON CONFLICT(natural_key) DO NOTHING",
                )
                .bind(key_ref)
                .bind(issn_ref)
                .bind(&draft.title)
                .bind(&draft.iso_abbreviation)
                .execute(&mut *tx)
                .await?;

                let id: JournalId = sqlx::query_scalar("SELECT id FROM journals WHERE natural_key = ?")
                    .bind(key_ref)
                    .fetch_one(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(id)
            })
            .await?;

        debug!(journal_id = %id, key = %key, "Created journal");
        Ok(id)
    }

    // ========================================================================
    // Documents
    // ========================================================================

    /// Create or update a document by DOI, falling back to the secondary id.
    /// A missing identifier on an existing row is filled in.
    #[instrument(skip(self, draft), fields(doi = ?draft.external_id, secondary = ?draft.secondary_id))]
    pub async fn upsert_document(&self, draft: &DocumentDraft) -> IngestResult<DocumentUpsert> {
        let keys = draft.gate_keys();
        if keys.is_empty() {
            return Err(IngestError::InvalidDraft {
                entity: EntityKind::Document,
                reason: "document has neither DOI nor secondary id".to_string(),
            });
        }
        let _guards = self.gate.lock_many(keys).await;

        let doi = draft.external_id.as_deref().map(str::trim).filter(|v| !v.is_empty());
        let secondary = draft.secondary_id.as_deref().map(str::trim).filter(|v| !v.is_empty());

        let by_doi = match doi {
            Some(doi) => self.find_document_by_doi(doi).await?,
            None => None,
        };
        let by_secondary = match secondary {
            Some(secondary) => self.find_document_by_secondary(secondary).await?,
            None => None,
        };

        let (target, fill_doi, fill_secondary) = match (by_doi, by_secondary) {
            (Some(a), Some(b)) if a.0 != b.0 => {
                let key = format!("doi:{}", doi.unwrap_or_default());
                let kept = format!("{} -> document {}", secondary.unwrap_or_default(), b.0);
                let rejected = format!("{} -> document {}", secondary.unwrap_or_default(), a.0);
                self.record_conflict(EntityKind::Document, &key, "secondary_id", Some(&kept), Some(&rejected))
                    .await?;
                (Some(a.0), None, None)
            }
            (Some(a), Some(_)) => (Some(a.0), None, None),
            (Some((id, _, stored_secondary)), None) => {
                let fill = match (stored_secondary.as_deref(), secondary) {
                    (None, Some(s)) => Some(s),
                    (Some(kept), Some(seen)) => {
                        let key = format!("doi:{}", doi.unwrap_or_default());
                        self.record_conflict(EntityKind::Document, &key, "secondary_id", Some(kept), Some(seen))
                            .await?;
                        None
                    }
                    _ => None,
                };
                (Some(id), None, fill)
            }
            (None, Some((id, stored_doi, _))) => {
                let fill = match (stored_doi.as_deref(), doi) {
                    (None, Some(d)) => Some(d),
                    (Some(kept), Some(seen)) => {
                        let key = format!("secondary:{}", secondary.unwrap_or_default());
                        self.record_conflict(EntityKind::Document, &key, "external_id", Some(kept), Some(seen))
                            .await?;
                        None
                    }
                    _ => None,
                };
                (Some(id), fill, None)
            }
            (None, None) => (None, None, None),
        };

        let pool = &self.pool;
        let metadata = draft.metadata.to_string();
        let metadata_ref = metadata.as_str();
        let journal_id = draft.journal_id;
        let title = draft.title.as_deref();

        let upsert = match target {
            Some(id) => {
                self.storage
                    .run("update_document", move || async move {
                        sqlx::query(
                            "UPDATE documents SET \
                                title = COALESCE(?, title), \
                                journal_id = COALESCE(?, journal_id), \
                                metadata = ?, \
                                external_id = COALESCE(external_id, ?), \
                                secondary_id = COALESCE(secondary_id, ?), \
                                last_processed_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') \
                             WHERE id = ?",
                        )
                        .bind(title)
                        .bind(journal_id)
                        .bind(metadata_ref)
                        .bind(fill_doi)
                        .bind(fill_secondary)
                        .bind(id)
                        .execute(pool)
                        .await
                    })
                    .await?;
                DocumentUpsert {
                    id: DocumentId(id),
                    created: false,
                }
            }
            None => {
                let id: DocumentId = self
                    .storage
                    .run("create_document", move || async move {
                        sqlx::query_scalar(
                            "INSERT INTO documents (external_id, secondary_id, title, journal_id, metadata) \
                             VALUES (?, ?, ?, ?, ?) RETURNING id",
                        )
                        .bind(doi)
                        .bind(secondary)
                        .bind(title)
                        .bind(journal_id)
                        .bind(metadata_ref)
                        .fetch_one(pool)
                        .await
                    })
                    .await?;
                DocumentUpsert { id, created: true }
            }
        };

        debug!(document_id = %upsert.id, created = upsert.created, "Upserted document");
        Ok(upsert)
    }

    async fn find_document_by_doi(&self, doi: &str) -> IngestResult<Option<DocumentRow>> {
        let pool = &self.pool;
        self.storage
            .run("find_document_by_doi", move || async move {
                sqlx::query_as("SELECT id, external_id, secondary_id FROM documents WHERE external_id = ?")
                    .bind(doi)
                    .fetch_optional(pool)
                    .await
            })
            .await
    }

    async fn find_document_by_secondary(&self, secondary: &str) -> IngestResult<Option<DocumentRow>> {
        let pool = &self.pool;
        self.storage
            .run("find_document_by_secondary", move || async move {
                sqlx::query_as("SELECT id, external_id, secondary_id FROM documents WHERE secondary_id = ?")
                    .bind(secondary)
                    .fetch_optional(pool)
                    .await
            })
            .await
    }

    /// Replace a document's author slots and their affiliations as one unit.
    pub async fn link_authors(&self, document_id: DocumentId, links: &[AuthorLink]) -> IngestResult<()> {
        let pool = &self.pool;
        self.storage
            .run("link_authors", move || async move {
                let mut tx = pool.begin().await?;

                sqlx::query("DELETE FROM document_author_affiliations WHERE document_id = ?")
                    .bind(document_id)
                    .execute(&mut *tx)
                    .await?;
                sqlx::query("DELETE FROM document_authors WHERE document_id = ?")
                    .bind(document_id)
                    .execute(&mut *tx)
                    .await?;

                for link in links {
                    sqlx::query("INSERT INTO document_authors (document_id, position, author_id) VALUES (?, ?, ?)")
                        .bind(document_id)
                        .bind(link.position as i64)
                        .bind(link.author_id)
                        .execute(&mut *tx)
                        .await?;

                    for affiliation_id in &link.affiliation_ids {
                        sqlx::query(
                            "INSERT OR IGNORE INTO document_author_affiliations (document_id, position, affiliation_id) \
                             VALUES (?, ?, ?)",
                        )
                        .bind(document_id)
                        .bind(link.position as i64)
                        .bind(*affiliation_id)
                        .execute(&mut *tx)
                        .await?;
                    }
                }

                tx.commit().await
            })
            .await
    }

    pub async fn store_fulltext(&self, document_id: DocumentId, pmc_id: &str, content: &str) -> IngestResult<()> {
        let pool = &self.pool;
        self.storage
            .run("store_fulltext", move || async move {
                sqlx::query(
                    "INSERT INTO document_fulltext (document_id, pmc_id, content) VALUES (?, ?, ?) \
                     ON CONFLICT(document_id) DO UPDATE SET pmc_id = excluded.pmc_id, content = excluded.content, \
                        fetched_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
                )
                .bind(document_id)
                .bind(pmc_id)
                .bind(content)
                .execute(pool)
                .await
            })
            .await?;
        debug!(document_id = %document_id, pmc_id, bytes = content.len(), "Stored full text");
        Ok(())
    }

    // ========================================================================
    // Conflicts
    // ========================================================================

    async fn record_conflict(
        &self,
        entity: EntityKind,
        natural_key: &str,
        field: &str,
        kept: Option<&str>,
        rejected: Option<&str>,
    ) -> IngestResult<()> {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
        warn!(
            entity = %entity,
            natural_key,
            field,
            kept = ?kept,
            rejected = ?rejected,
            "Resolution conflict, keeping earliest value"
        );

        let pool = &self.pool;
        self.storage
            .run("record_conflict", move || async move {
                sqlx::query(
                    "INSERT INTO resolution_conflicts (entity_kind, natural_key, field, kept_value, rejected_value) \
                     VALUES (?, ?, ?, ?, ?)",
                )
                .bind(entity.as_str())
                .bind(natural_key)
                .bind(field)
                .bind(kept)
                .bind(rejected)
                .execute(pool)
                .await
            })
            .await?;
        Ok(())
    }
}
