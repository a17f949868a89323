//! Crawl driver: seed, then batch → fetch → map → resolve → persist → checkpoint.
//!
//! Identifiers within a batch run concurrently up to `workers`; batches run one
//! after another so cancellation is observed between them. An identifier is
//! checkpointed `completed` only after all of its writes committed.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use biblio_common::BiblioError;

use crate::config::{DEFAULT_BATCH_SIZE, DEFAULT_SEARCH_PAGE_SIZE, DEFAULT_WORKERS};
use crate::error::{IngestError, IngestResult};
use crate::events::{FulltextOutcome, IngestEvent, RunStats};
use crate::fetch::RateLimitedFetchClient;
use crate::mapping::{normalize_doi, pmid_secondary_id, MappedRecord, RecordMapper, ReferenceEntry};
use crate::normalize::AffiliationNormalizer;
use crate::progress::ProgressTracker;
use crate::resolve::{
    AuthorDraft, AuthorLink, DocumentDraft, DocumentId, EntityUpsertCoordinator, JournalDraft, ReferenceResolver,
    ReferenceWriteSummary, ResolutionSettings,
};
use crate::search::SearchQuery;

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub workers: usize,
    pub batch_size: u32,
    pub search_page_size: u32,
    pub max_results: Option<u64>,
    /// Ask the source for citation links when a record has no reference list
    pub fetch_references: bool,
    /// Download PubMed Central full text for records that carry a PMC id
    pub fetch_fulltext: bool,
    /// Requeue identifiers that failed in earlier runs
    pub retry_failed: bool,
    /// Ignore saved progress: reset the search cursor and reprocess seeded identifiers
    pub restart: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            search_page_size: DEFAULT_SEARCH_PAGE_SIZE,
            max_results: None,
            fetch_references: true,
            fetch_fulltext: false,
            retry_failed: false,
            restart: false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum CrawlSeed {
    Query(SearchQuery),
    Identifiers(Vec<String>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeedSummary {
    pub query_key: Option<String>,
    pub total_found: Option<u64>,
    pub pages: u64,
    /// Identifiers returned by the source or supplied directly
    pub offered: u64,
    /// Identifiers newly queued (or requeued on restart)
    pub enqueued: u64,
    /// Offered identifiers that were already completed; reported as skipped by the next run
    pub already_completed: u64,
    /// Search offset where seeding resumed
    pub resumed_from: u64,
    /// The saved cursor had already paged through every hit, so no search was made
    pub exhausted: bool,
}

/// Result of persisting one mapped record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PersistOutcome {
    pub document_id: DocumentId,
    pub created: bool,
    pub references: ReferenceWriteSummary,
    pub stubs_backfilled: u64,
    pub fulltext: FulltextOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed(PersistOutcome),
    /// Completed in an earlier run
    Skipped,
}

pub struct IngestionOrchestrator {
    client: RateLimitedFetchClient,
    mapper: Arc<dyn RecordMapper>,
    normalizer: AffiliationNormalizer,
    coordinator: EntityUpsertCoordinator,
    references: ReferenceResolver,
    tracker: ProgressTracker,
    config: OrchestratorConfig,
    cancel: CancellationToken,
    events: Option<UnboundedSender<IngestEvent>>,
    active_queries: Vec<String>,
    /// Completed identifiers offered again by seeding, drained by the next run
    reoffered: Mutex<Vec<String>>,
}

impl IngestionOrchestrator {
    pub fn new(
        pool: SqlitePool,
        client: RateLimitedFetchClient,
        mapper: Arc<dyn RecordMapper>,
        settings: ResolutionSettings,
        config: OrchestratorConfig,
    ) -> IngestResult<Self> {
        let normalizer = AffiliationNormalizer::new()
            .map_err(|e| BiblioError::config(format!("Invalid affiliation pattern: {}", e)))?;

        Ok(Self {
            client,
            mapper,
            normalizer,
            coordinator: EntityUpsertCoordinator::new(pool.clone(), settings),
            references: ReferenceResolver::new(pool.clone()),
            tracker: ProgressTracker::new(pool),
            config,
            cancel: CancellationToken::new(),
            events: None,
            active_queries: Vec::new(),
            reoffered: Mutex::new(Vec::new()),
        })
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_events(mut self, sender: UnboundedSender<IngestEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub fn coordinator(&self) -> &EntityUpsertCoordinator {
        &self.coordinator
    }

    pub fn references(&self) -> &ReferenceResolver {
        &self.references
    }

    fn emit(&self, event: IngestEvent) {
        if let Some(sender) = &self.events {
            // A dropped receiver only means nobody is listening
            let _ = sender.send(event);
        }
    }

    // ========================================================================
    // Seeding
    // ========================================================================

    /// Requeue identifiers completed more than `max_age` ago so the next run
    /// fetches them again.
    pub async fn refresh_stale(&self, max_age: chrono::Duration) -> IngestResult<u64> {
        self.tracker.refresh_stale(max_age).await
    }

    pub async fn seed(&mut self, seed: &CrawlSeed) -> IngestResult<SeedSummary> {
        match seed {
            CrawlSeed::Query(query) => self.seed_query(query).await,
            CrawlSeed::Identifiers(identifiers) => self.seed_identifiers(identifiers).await,
        }
    }

    async fn seed_identifiers(&mut self, identifiers: &[String]) -> IngestResult<SeedSummary> {
        let mut cleaned: Vec<String> = Vec::with_capacity(identifiers.len());
        for identifier in identifiers.iter().map(|i| i.trim()).filter(|i| !i.is_empty()) {
            if !cleaned.iter().any(|c| c == identifier) {
                cleaned.push(identifier.to_string());
            }
        }

        let (enqueued, already_completed) = self.offer(&cleaned).await?;

        info!(offered = cleaned.len(), enqueued, already_completed, "Seeded explicit identifiers");
        Ok(SeedSummary {
            offered: cleaned.len() as u64,
            enqueued,
            already_completed,
            ..SeedSummary::default()
        })
    }

    /// Queue offered identifiers. Completed ones are remembered for the run
    /// report unless this is a restart, which requeues them instead.
    async fn offer(&mut self, identifiers: &[String]) -> IngestResult<(u64, u64)> {
        if self.config.restart {
            return Ok((self.tracker.force_refresh(identifiers).await?, 0));
        }

        let completed = self.tracker.completed_among(identifiers).await?;
        let enqueued = self.tracker.enqueue(identifiers).await?;

        let reoffered = self.reoffered.get_mut();
        let mut added = 0u64;
        for identifier in completed {
            if !reoffered.contains(&identifier) {
                reoffered.push(identifier);
                added += 1;
            }
        }
        Ok((enqueued, added))
    }

    /// Page the search from the saved cursor, enqueueing each page before the
    /// cursor moves past it.
    #[instrument(skip(self, query), fields(term = %query.to_term()))]
    async fn seed_query(&mut self, query: &SearchQuery) -> IngestResult<SeedSummary> {
        let term = query.to_term();
        if term.is_empty() {
            return Err(BiblioError::config("search query is empty").into());
        }
        let key = query.query_key();

        if self.config.restart {
            self.tracker.reset_cursor(&key).await?;
        }
        let cursor = self.tracker.load_cursor(&key).await?;
        let start = cursor.as_ref().map_or(0, |c| c.cursor_offset.max(0) as u64);

        let mut summary = SeedSummary {
            query_key: Some(key.clone()),
            resumed_from: start,
            ..SeedSummary::default()
        };
        if !self.active_queries.contains(&key) {
            self.active_queries.push(key.clone());
        }

        if let Some(total) = cursor.and_then(|c| c.total_found) {
            if start >= total.max(0) as u64 {
                info!(offset = start, total, "Search already paged to the end, use restart to search again");
                summary.total_found = Some(total.max(0) as u64);
                summary.exhausted = true;
                return Ok(summary);
            }
        }
        if start > 0 {
            info!(offset = start, "Resuming search from saved cursor");
        }

        let mut offset = start;
        loop {
            if self.cancel.is_cancelled() {
                warn!(offset, "Seeding cancelled");
                break;
            }

            let remaining = match self.config.max_results {
                Some(cap) if offset >= cap => break,
                Some(cap) => cap - offset,
                None => u64::MAX,
            };
            let limit = remaining.min(self.config.search_page_size as u64) as u32;

            let page = self.client.search(&term, offset, limit).await?;
            summary.total_found = Some(page.total);
            if page.identifiers.is_empty() {
                break;
            }

            let returned = page.identifiers.len() as u64;
            let (enqueued, already_completed) = self.offer(&page.identifiers).await?;
            summary.enqueued += enqueued;
            summary.already_completed += already_completed;
            summary.offered += returned;
            summary.pages += 1;
            offset += returned;
            self.tracker.save_cursor(&key, offset, Some(page.total)).await?;

            debug!(offset, total = page.total, "Seeded search page");
            if offset >= page.total {
                break;
            }
        }

        info!(
            total_found = ?summary.total_found,
            offered = summary.offered,
            enqueued = summary.enqueued,
            already_completed = summary.already_completed,
            "Seeded search"
        );
        Ok(summary)
    }

    // ========================================================================
    // Run loop
    // ========================================================================

    /// Drain the queue. Returns `StorageUnavailable` only when every identifier
    /// of a batch failed on storage.
    pub async fn run(&self) -> IngestResult<RunStats> {
        let mut stats = RunStats::start();
        info!(
            run_id = %stats.run_id,
            workers = self.config.workers,
            batch_size = self.config.batch_size,
            "Starting ingestion run"
        );

        stats.recovered = self.tracker.recover(self.config.retry_failed).await?.total();
        let conflicts_before = self.coordinator.conflict_count();

        let reoffered = std::mem::take(&mut *self.reoffered.lock().await);
        if !reoffered.is_empty() {
            info!(count = reoffered.len(), "Skipping identifiers completed in earlier runs");
        }
        for identifier in reoffered {
            stats.skipped += 1;
            self.emit(IngestEvent::Skipped { identifier });
        }

        loop {
            if self.cancel.is_cancelled() {
                warn!(run_id = %stats.run_id, "Cancellation requested, stopping between batches");
                stats.cancelled = true;
                break;
            }

            let batch = self.tracker.next_batch(self.config.batch_size).await?;
            if batch.is_empty() {
                break;
            }
            stats.batches += 1;

            let outcomes: Vec<(String, IngestResult<ProcessOutcome>)> = stream::iter(batch.iter().cloned())
                .map(|identifier| async move {
                    let outcome = self.process_identifier(&identifier).await;
                    (identifier, outcome)
                })
                .buffer_unordered(self.config.workers.max(1))
                .collect()
                .await;

            let (mut completed, mut failed, mut storage_failures) = (0u64, 0u64, 0usize);
            for (identifier, outcome) in outcomes {
                match outcome {
                    Ok(ProcessOutcome::Completed(done)) => {
                        completed += 1;
                        stats.processed += 1;
                        stats.completed += 1;
                        stats.references_resolved += done.references.resolved;
                        stats.reference_stubs += done.references.stubs;
                        stats.stubs_backfilled += done.stubs_backfilled;
                        stats.record_fulltext(done.fulltext);
                        self.emit(IngestEvent::Completed {
                            identifier,
                            document_id: done.document_id.0,
                            created: done.created,
                            references_resolved: done.references.resolved,
                            reference_stubs: done.references.stubs,
                            stubs_backfilled: done.stubs_backfilled,
                            fulltext: done.fulltext,
                        });
                    }
                    Ok(ProcessOutcome::Skipped) => {
                        stats.skipped += 1;
                        self.emit(IngestEvent::Skipped { identifier });
                    }
                    Err(err) => {
                        failed += 1;
                        if err.is_storage() {
                            storage_failures += 1;
                        }
                        stats.record_failure(err.kind());
                        self.emit(IngestEvent::Failed {
                            identifier,
                            kind: err.kind(),
                            error: err.to_string(),
                        });
                    }
                }
            }

            if storage_failures == batch.len() {
                error!(batch = stats.batches, size = batch.len(), "Every identifier in the batch failed on storage");
                return Err(IngestError::StorageUnavailable(format!(
                    "all {} identifiers in batch {} failed on storage",
                    batch.len(),
                    stats.batches
                )));
            }

            for key in &self.active_queries {
                self.tracker.touch_last_success(key).await?;
            }
            info!(batch = stats.batches, size = batch.len(), completed, failed, "Batch committed");
            self.emit(IngestEvent::BatchCommitted {
                batch: stats.batches,
                size: batch.len(),
                completed,
                failed,
            });
        }

        stats.conflicts = self.coordinator.conflict_count().saturating_sub(conflicts_before);
        stats.finish();
        info!(
            run_id = %stats.run_id,
            processed = stats.processed,
            completed = stats.completed,
            failed = stats.failed,
            skipped = stats.skipped,
            stubs = stats.reference_stubs,
            fulltext = stats.fulltext_stored,
            backfilled = stats.stubs_backfilled,
            cancelled = stats.cancelled,
            "Ingestion run finished"
        );
        self.emit(IngestEvent::RunFinished { stats: stats.clone() });
        Ok(stats)
    }

    /// Checkpointed pipeline for one identifier.
    #[instrument(skip(self))]
    pub async fn process_identifier(&self, identifier: &str) -> IngestResult<ProcessOutcome> {
        if !self.tracker.begin(identifier).await? {
            debug!("Already completed, skipping");
            return Ok(ProcessOutcome::Skipped);
        }

        match self.ingest_identifier(identifier).await {
            Ok(done) => {
                self.tracker.complete(identifier).await?;
                Ok(ProcessOutcome::Completed(done))
            }
            Err(err) => {
                warn!(kind = err.kind().as_str(), error = %err, "Identifier failed");
                if let Err(mark_err) = self.tracker.fail(identifier, &err.to_string()).await {
                    error!(error = %mark_err, "Could not record failure");
                }
                Err(err)
            }
        }
    }

    /// Fetch, map and persist without touching checkpoints. Full text is
    /// fetched last and its failure does not fail the record.
    pub async fn ingest_identifier(&self, identifier: &str) -> IngestResult<PersistOutcome> {
        let raw = self.client.fetch(identifier).await?;
        let mut record = self.mapper.map(&raw)?;

        if self.config.fetch_references && record.references.is_empty() {
            let cited = self.client.fetch_reference_ids(identifier).await?;
            debug!(count = cited.len(), "Fetched citation links");
            record.references = cited
                .iter()
                .enumerate()
                .map(|(order, id)| ReferenceEntry {
                    order: order as u32,
                    target_secondary_id: Some(pmid_secondary_id(id)),
                    ..ReferenceEntry::default()
                })
                .collect();
        }

        let mut outcome = self.persist_record(identifier, &record).await?;
        if self.config.fetch_fulltext {
            if let Some(pmc_id) = record.pmc_id() {
                outcome.fulltext = self.ingest_fulltext(outcome.document_id, pmc_id).await;
            }
        }
        Ok(outcome)
    }

    async fn ingest_fulltext(&self, document_id: DocumentId, pmc_id: &str) -> FulltextOutcome {
        let stored = match self.client.fetch_fulltext(pmc_id).await {
            Ok(raw) => {
                self.coordinator
                    .store_fulltext(document_id, &raw.identifier, &raw.payload)
                    .await
            }
            Err(err) => Err(err),
        };

        match stored {
            Ok(()) => FulltextOutcome::Stored,
            Err(err) => {
                warn!(pmc_id, kind = err.kind().as_str(), error = %err, "Full text unavailable");
                FulltextOutcome::Failed
            }
        }
    }

    /// Resolve and write one mapped record: journal, authors and affiliations,
    /// the document, its author links, its references, then stub back-fill.
    pub async fn persist_record(&self, identifier: &str, record: &MappedRecord) -> IngestResult<PersistOutcome> {
        let doc = &record.document;
        let metadata = serde_json::to_value(record.metadata()).map_err(BiblioError::from)?;
        let mut draft = DocumentDraft {
            external_id: doc.external_id.as_deref().and_then(normalize_doi),
            secondary_id: doc
                .secondary_id
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(pmid_secondary_id),
            title: doc.title.clone(),
            journal_id: None,
            metadata,
        };
        draft.validate(identifier)?;

        if let Some(journal) = &record.journal {
            let journal = JournalDraft::from(journal);
            if journal.natural_key().is_some() {
                draft.journal_id = Some(self.coordinator.resolve_journal(&journal).await?);
            }
        }

        let mut links = Vec::with_capacity(record.authors.len());
        for (position, author) in record.authors.iter().enumerate() {
            let author_draft = AuthorDraft::from(author);
            if author_draft.natural_key().is_none() {
                warn!(identifier, position, "Skipping author with neither name nor ORCID");
                continue;
            }
            let author_id = self.coordinator.resolve_author(&author_draft).await?;

            let mut affiliation_ids = Vec::new();
            for raw in author.affiliations.iter().filter(|a| !a.trim().is_empty()) {
                let normalized = self.normalizer.normalize(raw);
                let id = self.coordinator.resolve_affiliation(&normalized).await?;
                if !affiliation_ids.contains(&id) {
                    affiliation_ids.push(id);
                }
            }

            links.push(AuthorLink {
                position: position as u32,
                author_id,
                affiliation_ids,
            });
        }

        let upsert = self.coordinator.upsert_document(&draft).await?;
        self.coordinator.link_authors(upsert.id, &links).await?;
        let references = self.references.write_references(upsert.id, &record.references).await?;
        let stubs_backfilled = self
            .references
            .backfill(upsert.id, draft.external_id.as_deref(), draft.secondary_id.as_deref())
            .await?;

        Ok(PersistOutcome {
            document_id: upsert.id,
            created: upsert.created,
            references,
            stubs_backfilled,
            fulltext: FulltextOutcome::NotAttempted,
        })
    }
}
