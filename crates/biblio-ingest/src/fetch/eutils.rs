//! NCBI E-utilities transport (esearch, efetch, elink)

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response};
use serde::Deserialize;

use super::{FetchError, RawRecord, RecordSource, SearchPage};
use biblio_common::BiblioError;

// ============================================================================
// E-utilities Constants
// ============================================================================

pub const DEFAULT_EUTILS_BASE_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";

/// Tool name reported to NCBI with every request.
pub const DEFAULT_TOOL: &str = "biblio-ingest";

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

const DATABASE: &str = "pubmed";
const FULLTEXT_DATABASE: &str = "pmc";
const REFERENCES_LINKNAME: &str = "pubmed_pubmed_refs";

#[derive(Debug, Clone)]
pub struct EutilsConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub email: Option<String>,
    pub tool: String,
    pub timeout_secs: u64,
}

impl Default for EutilsConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_EUTILS_BASE_URL.to_string(),
            api_key: None,
            email: None,
            tool: DEFAULT_TOOL.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl EutilsConfig {
    pub fn from_env() -> Self {
        let non_empty = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

        Self {
            base_url: non_empty("NCBI_EUTILS_URL").unwrap_or_else(|| DEFAULT_EUTILS_BASE_URL.to_string()),
            api_key: non_empty("NCBI_API_KEY"),
            email: non_empty("NCBI_EMAIL"),
            tool: non_empty("NCBI_TOOL").unwrap_or_else(|| DEFAULT_TOOL.to_string()),
            timeout_secs: std::env::var("NCBI_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        }
    }
}

// ============================================================================
// Response payloads
// ============================================================================

#[derive(Debug, Deserialize)]
struct EsearchResponse {
    esearchresult: EsearchResult,
}

#[derive(Debug, Deserialize)]
struct EsearchResult {
    #[serde(default)]
    count: Option<String>,
    #[serde(default)]
    idlist: Vec<String>,
    #[serde(rename = "ERROR", default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ElinkResponse {
    #[serde(default)]
    linksets: Vec<Linkset>,
}

#[derive(Debug, Deserialize)]
struct Linkset {
    #[serde(default)]
    linksetdbs: Vec<LinksetDb>,
}

#[derive(Debug, Deserialize)]
struct LinksetDb {
    linkname: String,
    #[serde(default)]
    links: Vec<serde_json::Value>,
}

/// PubMed over E-utilities.
pub struct EutilsSource {
    client: Client,
    config: EutilsConfig,
}

impl EutilsSource {
    pub fn new(config: EutilsConfig) -> Result<Self, BiblioError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BiblioError::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn has_api_key(&self) -> bool {
        self.config.api_key.is_some()
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), endpoint)
    }

    fn common_params(&self, database: &str) -> Vec<(&'static str, String)> {
        let mut params = vec![("db", database.to_string()), ("tool", self.config.tool.clone())];
        if let Some(email) = &self.config.email {
            params.push(("email", email.clone()));
        }
        if let Some(key) = &self.config.api_key {
            params.push(("api_key", key.clone()));
        }
        params
    }

    async fn get(&self, endpoint: &str, params: Vec<(&'static str, String)>) -> Result<Response, FetchError> {
        self.get_from(DATABASE, endpoint, params).await
    }

    async fn get_from(
        &self,
        database: &str,
        endpoint: &str,
        params: Vec<(&'static str, String)>,
    ) -> Result<Response, FetchError> {
        let mut query = self.common_params(database);
        query.extend(params);

        let response = self
            .client
            .get(self.url(endpoint))
            .query(&query)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        match FetchError::from_status(status, endpoint, retry_after) {
            None => Ok(response),
            Some(error) => Err(error),
        }
    }
}

/// PubMed identifiers are plain digits; a `PMID:` prefix is accepted.
pub fn validate_pmid(identifier: &str) -> Result<&str, FetchError> {
    let trimmed = identifier.trim();
    let digits = trimmed.strip_prefix("PMID:").unwrap_or(trimmed);
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        Ok(digits)
    } else {
        Err(FetchError::InvalidIdentifier(identifier.to_string()))
    }
}

/// PubMed Central ids are `PMC` followed by digits; bare digits are accepted.
pub fn validate_pmcid(identifier: &str) -> Result<&str, FetchError> {
    let trimmed = identifier.trim();
    let digits = trimmed
        .strip_prefix("PMC")
        .or_else(|| trimmed.strip_prefix("pmc"))
        .unwrap_or(trimmed);
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        Ok(digits)
    } else {
        Err(FetchError::InvalidIdentifier(identifier.to_string()))
    }
}

/// efetch answers an unknown id with an empty `<PubmedArticleSet>`.
fn contains_article(payload: &str) -> bool {
    ["<PubmedArticle>", "<PubmedArticle ", "<PubmedBookArticle>", "<PubmedBookArticle "]
        .iter()
        .any(|tag| payload.contains(tag))
}

fn classify_transport(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else if err.is_connect() || err.is_request() {
        FetchError::Connect(err.to_string())
    } else if err.is_decode() || err.is_body() {
        FetchError::Decode(err.to_string())
    } else {
        FetchError::Connect(err.to_string())
    }
}

#[async_trait]
impl RecordSource for EutilsSource {
    async fn search(&self, term: &str, offset: u64, limit: u32) -> Result<SearchPage, FetchError> {
        let response = self
            .get(
                "esearch.fcgi",
                vec![
                    ("term", term.to_string()),
                    ("retstart", offset.to_string()),
                    ("retmax", limit.to_string()),
                    ("retmode", "json".to_string()),
                ],
            )
            .await?;

        let body: EsearchResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;
        let result = body.esearchresult;

        if let Some(error) = result.error {
            return Err(FetchError::Status {
                status: 400,
                message: error,
            });
        }

        let total = match result.count {
            Some(count) => count
                .parse()
                .map_err(|_| FetchError::Decode(format!("invalid esearch count '{}'", count)))?,
            None => 0,
        };

        Ok(SearchPage {
            total,
            identifiers: result.idlist,
        })
    }

    async fn fetch_record(&self, identifier: &str) -> Result<RawRecord, FetchError> {
        let pmid = validate_pmid(identifier)?;

        let response = self
            .get(
                "efetch.fcgi",
                vec![
                    ("id", pmid.to_string()),
                    ("retmode", "xml".to_string()),
                    ("rettype", "abstract".to_string()),
                ],
            )
            .await?;

        let payload = response.text().await.map_err(classify_transport)?;
        if !contains_article(&payload) {
            return Err(FetchError::NotFound(identifier.to_string()));
        }

        Ok(RawRecord {
            identifier: pmid.to_string(),
            payload,
        })
    }

    async fn fetch_reference_ids(&self, identifier: &str) -> Result<Vec<String>, FetchError> {
        let pmid = validate_pmid(identifier)?;

        let response = self
            .get(
                "elink.fcgi",
                vec![
                    ("dbfrom", DATABASE.to_string()),
                    ("id", pmid.to_string()),
                    ("linkname", REFERENCES_LINKNAME.to_string()),
                    ("retmode", "json".to_string()),
                ],
            )
            .await?;

        let body: ElinkResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;

        let ids = body
            .linksets
            .into_iter()
            .flat_map(|set| set.linksetdbs)
            .filter(|db| db.linkname == REFERENCES_LINKNAME)
            .flat_map(|db| db.links)
            .filter_map(|link| match link {
                serde_json::Value::String(s) => Some(s),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect();

        Ok(ids)
    }

    async fn fetch_fulltext(&self, pmc_id: &str) -> Result<RawRecord, FetchError> {
        let digits = validate_pmcid(pmc_id)?;

        let response = self
            .get_from(
                FULLTEXT_DATABASE,
                "efetch.fcgi",
                vec![("id", digits.to_string()), ("retmode", "xml".to_string())],
            )
            .await?;

        let payload = response.text().await.map_err(classify_transport)?;
        // Unknown or embargoed ids come back as an articleset holding only <error>
        if !payload.contains("<article ") && !payload.contains("<article>") {
            return Err(FetchError::NotFound(pmc_id.to_string()));
        }

        Ok(RawRecord {
            identifier: format!("PMC{}", digits),
            payload,
        })
    }
}
