//! Ingestion configuration
//!
//! Everything is read from the environment (a `.env` file is honored by the
//! binary) and may be overridden on the command line.

use std::path::PathBuf;
use std::time::Duration;

use biblio_common::BiblioError;

use crate::db::DbConfig;
use crate::fetch::{EutilsConfig, RetryPolicy, ANONYMOUS_REQUESTS_PER_SECOND, KEYED_REQUESTS_PER_SECOND};
use crate::fetch::retry::{DEFAULT_BASE_DELAY_MS, DEFAULT_JITTER, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_MS};
use crate::orchestrator::OrchestratorConfig;
use crate::resolve::coordinator::{DEFAULT_NAME_TOLERANCE, DEFAULT_SIMILARITY_THRESHOLD};
use crate::resolve::ResolutionSettings;

pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_BATCH_SIZE: u32 = 50;
/// esearch `retmax` per page
pub const DEFAULT_SEARCH_PAGE_SIZE: u32 = 500;
pub const DEFAULT_OUTPUT_DIR: &str = "./output";

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub eutils: EutilsConfig,
    pub db: DbConfig,
    /// Request budget shared by every worker
    pub requests_per_second: u32,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub workers: usize,
    pub batch_size: u32,
    pub search_page_size: u32,
    /// Stop seeding after this many search hits
    pub max_results: Option<u64>,
    pub similarity_threshold: f64,
    pub name_tolerance: f64,
    pub fetch_references: bool,
    /// Recorded as requested in document metadata; nothing is downloaded
    pub fetch_fulltext: bool,
    pub retry_failed: bool,
    /// Requeue records completed more than this many days ago
    pub refresh_older_than_days: Option<u32>,
    pub output_dir: PathBuf,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            eutils: EutilsConfig::default(),
            db: DbConfig::default(),
            requests_per_second: ANONYMOUS_REQUESTS_PER_SECOND,
            retry_max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay_ms: DEFAULT_BASE_DELAY_MS,
            retry_max_delay_ms: DEFAULT_MAX_DELAY_MS,
            workers: DEFAULT_WORKERS,
            batch_size: DEFAULT_BATCH_SIZE,
            search_page_size: DEFAULT_SEARCH_PAGE_SIZE,
            max_results: None,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            name_tolerance: DEFAULT_NAME_TOLERANCE,
            fetch_references: true,
            fetch_fulltext: false,
            retry_failed: false,
            refresh_older_than_days: None,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
        }
    }
}

impl IngestConfig {
    /// Load configuration from `BIBLIO_*`, `NCBI_*` and database variables
    pub fn from_env() -> Result<Self, BiblioError> {
        let eutils = EutilsConfig::from_env();
        let default_rate = if eutils.api_key.is_some() {
            KEYED_REQUESTS_PER_SECOND
        } else {
            ANONYMOUS_REQUESTS_PER_SECOND
        };
        let defaults = Self::default();

        let config = Self {
            requests_per_second: env_parse("BIBLIO_REQUESTS_PER_SECOND").unwrap_or(default_rate),
            retry_max_attempts: env_parse("BIBLIO_RETRY_MAX_ATTEMPTS").unwrap_or(defaults.retry_max_attempts),
            retry_base_delay_ms: env_parse("BIBLIO_RETRY_BASE_DELAY_MS").unwrap_or(defaults.retry_base_delay_ms),
            retry_max_delay_ms: env_parse("BIBLIO_RETRY_MAX_DELAY_MS").unwrap_or(defaults.retry_max_delay_ms),
            workers: env_parse("BIBLIO_WORKERS").unwrap_or(defaults.workers),
            batch_size: env_parse("BIBLIO_BATCH_SIZE").unwrap_or(defaults.batch_size),
            search_page_size: env_parse("BIBLIO_SEARCH_PAGE_SIZE").unwrap_or(defaults.search_page_size),
            max_results: env_parse("BIBLIO_MAX_RESULTS"),
            similarity_threshold: env_parse("BIBLIO_SIMILARITY_THRESHOLD").unwrap_or(defaults.similarity_threshold),
            name_tolerance: env_parse("BIBLIO_NAME_TOLERANCE").unwrap_or(defaults.name_tolerance),
            fetch_references: env_parse("BIBLIO_FETCH_REFERENCES").unwrap_or(defaults.fetch_references),
            fetch_fulltext: env_parse("BIBLIO_FETCH_FULLTEXT").unwrap_or(defaults.fetch_fulltext),
            retry_failed: env_parse("BIBLIO_RETRY_FAILED").unwrap_or(defaults.retry_failed),
            refresh_older_than_days: env_parse("BIBLIO_REFRESH_OLDER_THAN_DAYS"),
            output_dir: std::env::var("BIBLIO_OUTPUT_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            db: DbConfig::from_env(),
            eutils,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), BiblioError> {
        if self.requests_per_second == 0 {
            return Err(BiblioError::config("BIBLIO_REQUESTS_PER_SECOND must be greater than 0"));
        }
        if self.workers == 0 {
            return Err(BiblioError::config("BIBLIO_WORKERS must be greater than 0"));
        }
        if self.batch_size == 0 {
            return Err(BiblioError::config("BIBLIO_BATCH_SIZE must be greater than 0"));
        }
        if self.search_page_size == 0 {
            return Err(BiblioError::config("BIBLIO_SEARCH_PAGE_SIZE must be greater than 0"));
        }
        if self.retry_max_attempts == 0 {
            return Err(BiblioError::config("BIBLIO_RETRY_MAX_ATTEMPTS must be greater than 0"));
        }
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(BiblioError::config(
                "BIBLIO_RETRY_BASE_DELAY_MS must not exceed BIBLIO_RETRY_MAX_DELAY_MS",
            ));
        }
        for (name, value) in [
            ("BIBLIO_SIMILARITY_THRESHOLD", self.similarity_threshold),
            ("BIBLIO_NAME_TOLERANCE", self.name_tolerance),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(BiblioError::config(format!("{} must be within 0.0..=1.0", name)));
            }
        }
        if self.refresh_older_than_days == Some(0) {
            return Err(BiblioError::config("BIBLIO_REFRESH_OLDER_THAN_DAYS must be greater than 0"));
        }
        if self.db.max_connections == 0 {
            return Err(BiblioError::config("DB_MAX_CONNECTIONS must be greater than 0"));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.retry_max_delay_ms),
        )
        .with_jitter(DEFAULT_JITTER)
    }

    pub fn resolution_settings(&self) -> ResolutionSettings {
        ResolutionSettings {
            similarity_threshold: self.similarity_threshold,
            name_tolerance: self.name_tolerance,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            workers: self.workers,
            batch_size: self.batch_size,
            search_page_size: self.search_page_size,
            max_results: self.max_results,
            fetch_references: self.fetch_references,
            fetch_fulltext: self.fetch_fulltext,
            retry_failed: self.retry_failed,
            restart: false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = IngestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.requests_per_second, 3);
        assert!(config.fetch_references);
        assert!(!config.fetch_fulltext);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = IngestConfig {
            workers: 0,
            ..IngestConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("BIBLIO_WORKERS"));

        let config = IngestConfig {
            similarity_threshold: 1.5,
            ..IngestConfig::default()
        };
        assert!(config.validate().is_err());

        let config = IngestConfig {
            refresh_older_than_days: Some(0),
            ..IngestConfig::default()
        };
        assert!(config.validate().is_err());

        let config = IngestConfig {
            retry_base_delay_ms: 10_000,
            retry_max_delay_ms: 100,
            ..IngestConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_derived_settings() {
        let config = IngestConfig {
            retry_max_attempts: 2,
            workers: 8,
            ..IngestConfig::default()
        };
        assert_eq!(config.retry_policy().max_attempts, 2);
        assert_eq!(config.resolution_settings(), ResolutionSettings::default());

        let orchestrator = config.orchestrator_config();
        assert_eq!(orchestrator.workers, 8);
        assert!(!orchestrator.restart);
    }
}
