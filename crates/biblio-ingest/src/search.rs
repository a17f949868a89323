//! Keyword searches with PubMed field filters, rendered to an E-utilities term.

use serde::{Deserialize, Serialize};

/// Lower bound used when only `date_to` is given
pub const OPEN_DATE_FROM: &str = "1900/01/01";
/// Upper bound used when only `date_from` is given; fixed so the cursor key stays stable
pub const OPEN_DATE_TO: &str = "3000";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub keyword: String,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub publication_types: Vec<String>,
    #[serde(default)]
    pub journals: Vec<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub mesh_terms: Vec<String>,
}

fn field_filter(values: &[String], tag: &str) -> Option<String> {
    let terms: Vec<String> = values
        .iter()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| format!("\"{}\"[{}]", v.replace('"', ""), tag))
        .collect();

    match terms.len() {
        0 => None,
        1 => terms.into_iter().next(),
        _ => Some(format!("({})", terms.join(" OR "))),
    }
}

impl SearchQuery {
    pub fn keyword(keyword: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            ..Self::default()
        }
    }

    /// The same filters around a different keyword.
    pub fn with_keyword(&self, keyword: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
            ..self.clone()
        }
    }

    /// Full E-utilities term: the keyword and each filter joined with `AND`.
    pub fn to_term(&self) -> String {
        let mut parts = Vec::new();

        let keyword = self.keyword.trim();
        if !keyword.is_empty() {
            parts.push(keyword.to_string());
        }

        let from = self.date_from.as_deref().map(str::trim).filter(|d| !d.is_empty());
        let to = self.date_to.as_deref().map(str::trim).filter(|d| !d.is_empty());
        match (from, to) {
            (None, None) => {}
            (from, to) => parts.push(format!(
                "{}:{}[dp]",
                from.unwrap_or(OPEN_DATE_FROM),
                to.unwrap_or(OPEN_DATE_TO)
            )),
        }

        parts.extend(
            [
                field_filter(&self.publication_types, "pt"),
                field_filter(&self.languages, "la"),
                field_filter(&self.journals, "ta"),
                field_filter(&self.authors, "au"),
                field_filter(&self.mesh_terms, "mh"),
            ]
            .into_iter()
            .flatten(),
        );

        parts.join(" AND ")
    }

    /// Cursor key under which paging progress for this query is stored.
    pub fn query_key(&self) -> String {
        format!("search:{}", self.to_term())
    }

    pub fn is_empty(&self) -> bool {
        self.to_term().is_empty()
    }
}

/// Keywords from a keyword file: one per line, blank lines and `#` comments
/// ignored, duplicates dropped in first-seen order.
pub fn parse_keyword_list(text: &str) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if !keywords.iter().any(|k| k == line) {
            keywords.push(line.to_string());
        }
    }
    keywords
}
