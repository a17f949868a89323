//! Shared fixtures for biblio-ingest integration tests
//!
//! - in-memory and file-backed SQLite pools with migrations applied
//! - [`StaticSource`], an in-process [`RecordSource`] serving JSON-encoded records
//! - [`JsonMapper`], the matching [`RecordMapper`]

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::{HashMap, HashSet};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::SqlitePool;
use tempfile::TempDir;

use biblio_ingest::db::{connect, memory_pool, DbConfig};
use biblio_ingest::fetch::{FetchError, RateLimitedFetchClient, RawRecord, RecordSource, RetryPolicy, SearchPage};
use biblio_ingest::mapping::{
    AuthorFields, DocumentFields, MappedRecord, MappingError, RecordMapper, ReferenceEntry,
};
use biblio_ingest::orchestrator::{IngestionOrchestrator, OrchestratorConfig};
use biblio_ingest::resolve::ResolutionSettings;

// ============================================================================
// Databases
// ============================================================================

pub async fn test_pool() -> SqlitePool {
    memory_pool().await.expect("Failed to open in-memory database")
}

/// File-backed pool with several connections, for tests that need real
/// concurrent writers. Keep the `TempDir` alive for the test's duration.
pub async fn file_pool(connections: u32) -> (TempDir, SqlitePool) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("biblio-test.db");
    let pool = connect(&DbConfig {
        url: format!("sqlite://{}", path.display()),
        max_connections: connections,
        busy_timeout_ms: 10_000,
    })
    .await
    .expect("Failed to open file database");
    (dir, pool)
}

pub async fn count(pool: &SqlitePool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .expect("count query failed")
}

// ============================================================================
// Records
// ============================================================================

pub fn record(pmid: &str, doi: Option<&str>, title: &str) -> MappedRecord {
    MappedRecord {
        document: DocumentFields {
            external_id: doi.map(str::to_string),
            secondary_id: Some(format!("PMID:{}", pmid)),
            title: Some(title.to_string()),
            ..DocumentFields::default()
        },
        ..MappedRecord::default()
    }
}

pub fn with_pmc(mut record: MappedRecord, pmc: &str) -> MappedRecord {
    record.document.other_ids.insert("pmc".to_string(), pmc.to_string());
    record
}

pub fn author(last: &str, fore: &str, affiliations: &[&str]) -> AuthorFields {
    AuthorFields {
        last_name: Some(last.to_string()),
        fore_name: Some(fore.to_string()),
        affiliations: affiliations.iter().map(|a| a.to_string()).collect(),
        ..AuthorFields::default()
    }
}

pub fn cites_pmid(order: u32, pmid: &str) -> ReferenceEntry {
    ReferenceEntry {
        order,
        target_secondary_id: Some(format!("PMID:{}", pmid)),
        ..ReferenceEntry::default()
    }
}

pub fn cites_doi(order: u32, doi: &str) -> ReferenceEntry {
    ReferenceEntry {
        order,
        target_external_id: Some(doi.to_string()),
        ..ReferenceEntry::default()
    }
}

// ============================================================================
// Source and mapper
// ============================================================================

/// Serves records from memory. Search returns the ids registered for the
/// term, or `search_ids` in order when the term has none.
#[derive(Default)]
pub struct StaticSource {
    records: Mutex<HashMap<String, MappedRecord>>,
    search_ids: Mutex<Vec<String>>,
    term_ids: Mutex<HashMap<String, Vec<String>>>,
    citation_links: Mutex<HashMap<String, Vec<String>>>,
    fulltext: Mutex<HashMap<String, String>>,
    failing: Mutex<HashSet<String>>,
    fetches: Mutex<HashMap<String, u32>>,
    searches: Mutex<Vec<(String, u64, u32)>>,
}

impl StaticSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, pmid: &str, record: MappedRecord) {
        self.records.lock().unwrap().insert(pmid.to_string(), record);
    }

    pub fn set_search_results(&self, ids: &[&str]) {
        *self.search_ids.lock().unwrap() = ids.iter().map(|i| i.to_string()).collect();
    }

    pub fn set_search_results_for(&self, term: &str, ids: &[&str]) {
        self.term_ids
            .lock()
            .unwrap()
            .insert(term.to_string(), ids.iter().map(|i| i.to_string()).collect());
    }

    /// Full-text payload served for `pmc` (with its `PMC` prefix).
    pub fn add_fulltext(&self, pmc: &str, payload: &str) {
        self.fulltext.lock().unwrap().insert(pmc.to_string(), payload.to_string());
    }

    pub fn set_citation_links(&self, pmid: &str, cited: &[&str]) {
        self.citation_links
            .lock()
            .unwrap()
            .insert(pmid.to_string(), cited.iter().map(|c| c.to_string()).collect());
    }

    /// Fetches of `pmid` fail with a 503 until [`StaticSource::heal`] is called.
    pub fn fail(&self, pmid: &str) {
        self.failing.lock().unwrap().insert(pmid.to_string());
    }

    pub fn heal(&self, pmid: &str) {
        self.failing.lock().unwrap().remove(pmid);
    }

    pub fn fetch_count(&self, pmid: &str) -> u32 {
        self.fetches.lock().unwrap().get(pmid).copied().unwrap_or(0)
    }

    pub fn searches(&self) -> Vec<(u64, u32)> {
        self.searches
            .lock()
            .unwrap()
            .iter()
            .map(|(_, offset, limit)| (*offset, *limit))
            .collect()
    }

    pub fn searches_for(&self, term: &str) -> Vec<(u64, u32)> {
        self.searches
            .lock()
            .unwrap()
            .iter()
            .filter(|(searched, _, _)| searched == term)
            .map(|(_, offset, limit)| (*offset, *limit))
            .collect()
    }
}

#[async_trait]
impl RecordSource for StaticSource {
    async fn search(&self, term: &str, offset: u64, limit: u32) -> Result<SearchPage, FetchError> {
        self.searches.lock().unwrap().push((term.to_string(), offset, limit));
        let ids = match self.term_ids.lock().unwrap().get(term) {
            Some(ids) => ids.clone(),
            None => self.search_ids.lock().unwrap().clone(),
        };
        let identifiers = ids
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();
        Ok(SearchPage {
            total: ids.len() as u64,
            identifiers,
        })
    }

    async fn fetch_record(&self, identifier: &str) -> Result<RawRecord, FetchError> {
        *self.fetches.lock().unwrap().entry(identifier.to_string()).or_insert(0) += 1;

        if self.failing.lock().unwrap().contains(identifier) {
            return Err(FetchError::Status {
                status: 503,
                message: "unavailable".to_string(),
            });
        }

        let record = self
            .records
            .lock()
            .unwrap()
            .get(identifier)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(identifier.to_string()))?;

        Ok(RawRecord {
            identifier: identifier.to_string(),
            payload: serde_json::to_string(&record).unwrap(),
        })
    }

    async fn fetch_reference_ids(&self, identifier: &str) -> Result<Vec<String>, FetchError> {
        Ok(self
            .citation_links
            .lock()
            .unwrap()
            .get(identifier)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_fulltext(&self, pmc_id: &str) -> Result<RawRecord, FetchError> {
        let payload = self
            .fulltext
            .lock()
            .unwrap()
            .get(pmc_id)
            .cloned()
            .ok_or_else(|| FetchError::NotFound(pmc_id.to_string()))?;
        Ok(RawRecord {
            identifier: pmc_id.to_string(),
            payload,
        })
    }
}

pub struct JsonMapper;

impl RecordMapper for JsonMapper {
    fn map(&self, raw: &RawRecord) -> Result<MappedRecord, MappingError> {
        serde_json::from_str(&raw.payload).map_err(|e| MappingError::Invalid(e.to_string()))
    }
}

pub fn client(source: Arc<StaticSource>) -> RateLimitedFetchClient {
    RateLimitedFetchClient::new(source, NonZeroU32::new(10_000).unwrap(), RetryPolicy::no_retry())
}

pub fn orchestrator(pool: SqlitePool, source: Arc<StaticSource>, config: OrchestratorConfig) -> IngestionOrchestrator {
    IngestionOrchestrator::new(
        pool,
        client(source),
        Arc::new(JsonMapper),
        ResolutionSettings::default(),
        config,
    )
    .unwrap()
}
