//! Translation of fetched source payloads into [`MappedRecord`]s.

pub mod pubmed_xml;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fetch::RawRecord;

pub use pubmed_xml::PubmedXmlMapper;

#[derive(Error, Debug)]
pub enum MappingError {
    #[error("XML error at byte {position}: {message}")]
    Xml { position: u64, message: String },

    #[error("Payload contains no article")]
    NoArticle,

    #[error("Invalid payload: {0}")]
    Invalid(String),
}

/// Turns a raw payload into structured fields. Implementations are pure.
pub trait RecordMapper: Send + Sync {
    fn map(&self, raw: &RawRecord) -> Result<MappedRecord, MappingError>;
}

/// Secondary identifier for a PubMed id: `PMID:<n>`.
pub fn pmid_secondary_id(pmid: &str) -> String {
    let pmid = pmid.trim();
    let digits = pmid
        .strip_prefix("PMID:")
        .or_else(|| pmid.strip_prefix("pmid:"))
        .unwrap_or(pmid)
        .trim();
    format!("PMID:{}", digits)
}

/// DOIs compare case-insensitively; store them lowercased without a resolver prefix.
pub fn normalize_doi(doi: &str) -> Option<String> {
    let doi = doi.trim();
    let lower = doi.to_lowercase();
    let stripped = ["https://doi.org/", "http://doi.org/", "http://dx.doi.org/", "https://dx.doi.org/", "doi:"]
        .iter()
        .find_map(|prefix| lower.strip_prefix(prefix))
        .unwrap_or(&lower)
        .trim()
        .to_string();

    if stripped.is_empty() {
        None
    } else {
        Some(stripped)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappedRecord {
    pub document: DocumentFields,
    pub journal: Option<JournalFields>,
    pub authors: Vec<AuthorFields>,
    pub references: Vec<ReferenceEntry>,
    pub mesh_terms: Vec<MeshTerm>,
    pub keywords: Vec<String>,
    pub chemicals: Vec<Chemical>,
    pub grants: Vec<Grant>,
    pub publication_types: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentFields {
    /// DOI
    pub external_id: Option<String>,
    /// `PMID:<n>`
    pub secondary_id: Option<String>,
    pub title: Option<String>,
    pub abstract_text: Option<String>,
    pub language: Option<String>,
    pub publication_date: Option<String>,
    pub volume: Option<String>,
    pub issue: Option<String>,
    pub pagination: Option<String>,
    /// Other article ids keyed by id type (pmc, pii, ...)
    #[serde(default)]
    pub other_ids: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JournalFields {
    pub issn: Option<String>,
    pub title: Option<String>,
    pub iso_abbreviation: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthorFields {
    pub last_name: Option<String>,
    pub fore_name: Option<String>,
    pub initials: Option<String>,
    pub collective_name: Option<String>,
    pub orcid: Option<String>,
    #[serde(default)]
    pub affiliations: Vec<String>,
    #[serde(default)]
    pub equal_contrib: bool,
}

/// One outgoing citation, in source order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceEntry {
    /// 0-based position in the citing record's reference list
    pub order: u32,
    pub target_external_id: Option<String>,
    pub target_secondary_id: Option<String>,
    pub raw_citation_text: Option<String>,
}

impl ReferenceEntry {
    /// True when the entry carries nothing to link or display.
    pub fn is_empty(&self) -> bool {
        let blank = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
        blank(&self.target_external_id) && blank(&self.target_secondary_id) && blank(&self.raw_citation_text)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshTerm {
    pub descriptor: String,
    pub descriptor_ui: Option<String>,
    pub major_topic: bool,
    #[serde(default)]
    pub qualifiers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chemical {
    pub name: String,
    pub registry_number: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    pub grant_id: Option<String>,
    pub acronym: Option<String>,
    pub agency: Option<String>,
    pub country: Option<String>,
}

/// Everything about a document that is kept as JSON rather than columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub abstract_text: Option<String>,
    pub language: Option<String>,
    pub publication_date: Option<String>,
    pub volume: Option<String>,
    pub issue: Option<String>,
    pub pagination: Option<String>,
    pub other_ids: BTreeMap<String, String>,
    pub mesh_terms: Vec<MeshTerm>,
    pub keywords: Vec<String>,
    pub chemicals: Vec<Chemical>,
    pub grants: Vec<Grant>,
    pub publication_types: Vec<String>,
}

impl MappedRecord {
    /// PubMed Central id (`PMC…`), when the article has one.
    pub fn pmc_id(&self) -> Option<&str> {
        self.document
            .other_ids
            .get("pmc")
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
    }

    pub fn metadata(&self) -> DocumentMetadata {
        let doc = &self.document;
        DocumentMetadata {
            abstract_text: doc.abstract_text.clone(),
            language: doc.language.clone(),
            publication_date: doc.publication_date.clone(),
            volume: doc.volume.clone(),
            issue: doc.issue.clone(),
            pagination: doc.pagination.clone(),
            other_ids: doc.other_ids.clone(),
            mesh_terms: self.mesh_terms.clone(),
            keywords: self.keywords.clone(),
            chemicals: self.chemicals.clone(),
            grants: self.grants.clone(),
            publication_types: self.publication_types.clone(),
        }
    }
}
