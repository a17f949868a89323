//! Identity resolution: canonical entities, documents and citation edges.

pub mod coordinator;
pub mod gate;
pub mod references;

use serde::{Deserialize, Serialize};

use crate::error::{EntityKind, IngestError, IngestResult};
use crate::mapping::{AuthorFields, JournalFields};
use crate::normalize::{normalize_text, NormalizedAffiliation};

pub use coordinator::{EntityUpsertCoordinator, ResolutionSettings};
pub use gate::KeyedGate;
pub use references::{ReferenceEdge, ReferenceResolver, ReferenceWriteSummary};

macro_rules! entity_id {
    ($($name:ident),+ $(,)?) => {
        $(
            #[derive(
                Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
            )]
            #[sqlx(transparent)]
            #[serde(transparent)]
            pub struct $name(pub i64);

            impl std::fmt::Display for $name {
                fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                    write!(f, "{}", self.0)
                }
            }
        )+
    };
}

entity_id!(AffiliationId, AuthorId, JournalId, DocumentId);

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Lowercase and collapse whitespace.
fn key_part(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorDraft {
    pub last_name: Option<String>,
    pub fore_name: Option<String>,
    pub initials: Option<String>,
    pub collective_name: Option<String>,
    pub orcid: Option<String>,
}

impl AuthorDraft {
    /// `orcid:<ORCID>`, `collective:<name>` or `name:<last>|<fore>`;
    /// `None` for an author with neither identifier nor name.
    pub fn natural_key(&self) -> Option<String> {
        if let Some(orcid) = non_blank(&self.orcid) {
            return Some(format!("orcid:{}", orcid.to_uppercase()));
        }
        if let Some(collective) = non_blank(&self.collective_name) {
            return Some(format!("collective:{}", key_part(collective)));
        }
        let last = non_blank(&self.last_name);
        let fore = non_blank(&self.fore_name);
        if last.is_none() && fore.is_none() {
            return None;
        }
        Some(format!(
            "name:{}|{}",
            key_part(last.unwrap_or_default()),
            key_part(fore.unwrap_or_default())
        ))
    }

    pub fn display_name(&self) -> String {
        if let Some(collective) = non_blank(&self.collective_name) {
            return collective.to_string();
        }
        [non_blank(&self.fore_name), non_blank(&self.last_name)]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl From<&AuthorFields> for AuthorDraft {
    fn from(fields: &AuthorFields) -> Self {
        Self {
            last_name: fields.last_name.clone(),
            fore_name: fields.fore_name.clone(),
            initials: fields.initials.clone(),
            collective_name: fields.collective_name.clone(),
            orcid: fields.orcid.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalDraft {
    pub issn: Option<String>,
    pub title: Option<String>,
    pub iso_abbreviation: Option<String>,
}

impl JournalDraft {
    /// `issn:<ISSN>` or `title:<normalized title>`.
    pub fn natural_key(&self) -> Option<String> {
        if let Some(issn) = non_blank(&self.issn) {
            return Some(format!("issn:{}", issn.to_uppercase()));
        }
        non_blank(&self.title)
            .map(normalize_text)
            .filter(|t| !t.is_empty())
            .map(|t| format!("title:{}", t))
    }
}

impl From<&JournalFields> for JournalDraft {
    fn from(fields: &JournalFields) -> Self {
        Self {
            issn: fields.issn.clone(),
            title: fields.title.clone(),
            iso_abbreviation: fields.iso_abbreviation.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentDraft {
    /// DOI, lowercased
    pub external_id: Option<String>,
    /// `PMID:<n>`
    pub secondary_id: Option<String>,
    pub title: Option<String>,
    pub journal_id: Option<JournalId>,
    pub metadata: serde_json::Value,
}

impl DocumentDraft {
    /// Reject drafts with no identity.
    pub fn validate(&self, identifier: &str) -> IngestResult<()> {
        if non_blank(&self.external_id).is_none() && non_blank(&self.secondary_id).is_none() {
            return Err(IngestError::MalformedRecord {
                identifier: identifier.to_string(),
                reason: "record has neither DOI nor PubMed id".to_string(),
            });
        }
        Ok(())
    }

    /// Gate keys for every identifier the draft carries.
    pub fn gate_keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(2);
        if let Some(doi) = non_blank(&self.external_id) {
            keys.push(format!("document:ext:{}", doi));
        }
        if let Some(secondary) = non_blank(&self.secondary_id) {
            keys.push(format!("document:sec:{}", secondary));
        }
        keys
    }
}

/// Any draft accepted by [`EntityUpsertCoordinator::resolve`].
#[derive(Debug, Clone)]
pub enum EntityDraft {
    Affiliation(NormalizedAffiliation),
    Author(AuthorDraft),
    Journal(JournalDraft),
    Document(DocumentDraft),
}

impl EntityDraft {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityDraft::Affiliation(_) => EntityKind::Affiliation,
            EntityDraft::Author(_) => EntityKind::Author,
            EntityDraft::Journal(_) => EntityKind::Journal,
            EntityDraft::Document(_) => EntityKind::Document,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum CanonicalHandle {
    Affiliation(AffiliationId),
    Author(AuthorId),
    Journal(JournalId),
    Document(DocumentId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DocumentUpsert {
    pub id: DocumentId,
    pub created: bool,
}

/// One author slot on a document with its resolved affiliations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorLink {
    pub position: u32,
    pub author_id: AuthorId,
    pub affiliation_ids: Vec<AffiliationId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_author_natural_keys() {
        let orcid = AuthorDraft {
            orcid: Some("0000-0002-1825-009x".into()),
            last_name: Some("Doe".into()),
            ..Default::default()
        };
        assert_eq!(orcid.natural_key().as_deref(), Some("orcid:0000-0002-1825-009X"));

        let group = AuthorDraft {
            collective_name: Some("Microbe  Consortium".into()),
            ..Default::default()
        };
        assert_eq!(group.natural_key().as_deref(), Some("collective:microbe consortium"));

        let named = AuthorDraft {
            last_name: Some("van  der Berg".into()),
            fore_name: Some("Anna".into()),
            ..Default::default()
        };
        assert_eq!(named.natural_key().as_deref(), Some("name:van der berg|anna"));
        assert_eq!(named.display_name(), "Anna van  der Berg");

        assert_eq!(AuthorDraft::default().natural_key(), None);
    }

    #[test]
    fn test_journal_natural_keys() {
        let by_issn = JournalDraft {
            issn: Some("1476-468x".into()),
            title: Some("Nature".into()),
            ..Default::default()
        };
        assert_eq!(by_issn.natural_key().as_deref(), Some("issn:1476-468X"));

        let by_title = JournalDraft {
            title: Some("The Lancet.".into()),
            ..Default::default()
        };
        assert_eq!(by_title.natural_key().as_deref(), Some("title:the lancet"));
    }

    #[test]
    fn test_document_validation() {
        let draft = DocumentDraft {
            external_id: None,
            secondary_id: Some(" ".into()),
            title: None,
            journal_id: None,
            metadata: serde_json::json!({}),
        };
        assert!(matches!(draft.validate("x"), Err(IngestError::MalformedRecord { .. })));
        assert!(draft.gate_keys().is_empty());

        let draft = DocumentDraft {
            external_id: Some("10.1/abc".into()),
            secondary_id: Some("PMID:1".into()),
            ..draft
        };
        assert!(draft.validate("x").is_ok());
        assert_eq!(draft.gate_keys(), vec!["document:ext:10.1/abc", "document:sec:PMID:1"]);
    }
}
