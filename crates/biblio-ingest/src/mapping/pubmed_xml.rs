//! PubMed `efetch` XML (`PubmedArticleSet`) mapping.
//!
//! Uses the streaming event reader rather than serde deserialization because
//! titles and abstracts carry inline markup (`<i>`, `<sup>`, MathML) that has
//! to be flattened into plain text.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::{
    normalize_doi, pmid_secondary_id, AuthorFields, Chemical, Grant, JournalFields, MappedRecord,
    MappingError, MeshTerm, RecordMapper, ReferenceEntry,
};
use crate::fetch::RawRecord;

/// Elements whose whole subtree is collected as one text value.
const TEXT_FIELDS: &[&str] = &[
    "ArticleTitle",
    "VernacularTitle",
    "AbstractText",
    "Citation",
    "Affiliation",
    "Keyword",
    "Title",
    "DescriptorName",
    "QualifierName",
    "NameOfSubstance",
    "LastName",
    "ForeName",
    "CollectiveName",
];

#[derive(Debug, Clone, Copy, Default)]
pub struct PubmedXmlMapper;

impl RecordMapper for PubmedXmlMapper {
    fn map(&self, raw: &RawRecord) -> Result<MappedRecord, MappingError> {
        parse_article(&raw.payload)
    }
}

/// Map the first `PubmedArticle` in an efetch payload.
pub fn parse_article(xml: &str) -> Result<MappedRecord, MappingError> {
    let mut reader = Reader::from_str(xml);
    let mut parser = ArticleParser::default();

    loop {
        let event = reader.read_event().map_err(|e| MappingError::Xml {
            position: reader.buffer_position() as u64,
            message: e.to_string(),
        })?;

        match event {
            Event::Start(e) => parser.start(&e),
            Event::Empty(e) => {
                parser.start(&e);
                parser.end();
            }
            Event::End(_) => parser.end(),
            Event::Text(t) => match t.unescape() {
                Ok(text) => parser.text.push_str(&text),
                Err(_) => parser.text.push_str(&String::from_utf8_lossy(&t)),
            },
            Event::CData(c) => parser.text.push_str(&String::from_utf8_lossy(&c)),
            Event::Eof => break,
            _ => {}
        }

        if parser.done {
            break;
        }
    }

    parser.finish()
}

#[derive(Debug, Default)]
struct PubDate {
    year: Option<String>,
    month: Option<String>,
    day: Option<String>,
    medline: Option<String>,
}

impl PubDate {
    fn render(self) -> Option<String> {
        let parts: Vec<String> = [self.year, self.month, self.day].into_iter().flatten().collect();
        if parts.is_empty() {
            self.medline
        } else {
            Some(parts.join(" "))
        }
    }
}

#[derive(Debug, Default)]
struct ArticleParser {
    path: Vec<String>,
    attrs: Vec<Vec<(String, String)>>,
    text: String,
    record: MappedRecord,
    journal: JournalFields,
    issn_linking: Option<String>,
    pub_date: PubDate,
    pmid: Option<String>,
    doi: Option<String>,
    abstract_parts: Vec<String>,
    author: Option<AuthorFields>,
    grant: Option<Grant>,
    chemical: Option<Chemical>,
    mesh: Option<MeshTerm>,
    reference: Option<ReferenceEntry>,
    seen_article: bool,
    done: bool,
}

fn clean(text: &str) -> Option<String> {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn normalize_orcid(value: &str) -> String {
    let value = value.trim();
    let bare = value
        .strip_prefix("https://orcid.org/")
        .or_else(|| value.strip_prefix("http://orcid.org/"))
        .unwrap_or(value);
    bare.to_uppercase()
}

impl ArticleParser {
    fn in_text_field(&self) -> bool {
        self.path.iter().any(|p| TEXT_FIELDS.contains(&p.as_str()))
    }

    fn parent(&self) -> Option<&str> {
        self.path.last().map(String::as_str)
    }

    fn within(&self, element: &str) -> bool {
        self.path.iter().any(|p| p == element)
    }

    fn start(&mut self, e: &BytesStart<'_>) {
        let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
        let attrs: Vec<(String, String)> = e
            .attributes()
            .flatten()
            .map(|a| {
                let key = String::from_utf8_lossy(a.key.local_name().as_ref()).into_owned();
                let value = match a.unescape_value() {
                    Ok(v) => v.into_owned(),
                    Err(_) => String::from_utf8_lossy(&a.value).into_owned(),
                };
                (key, value)
            })
            .collect();

        // Markup inside a text field only contributes its text.
        if !self.in_text_field() {
            self.text.clear();
            match name.as_str() {
                "PubmedArticle" | "PubmedBookArticle" => self.seen_article = true,
                "Author" if self.parent() == Some("AuthorList") => {
                    self.author = Some(AuthorFields {
                        equal_contrib: attr(&attrs, "EqualContrib") == Some("Y"),
                        ..Default::default()
                    });
                }
                "Grant" => self.grant = Some(Grant::default()),
                "Chemical" => self.chemical = Some(Chemical::default()),
                "MeshHeading" => self.mesh = Some(MeshTerm::default()),
                "Reference" => self.reference = Some(ReferenceEntry::default()),
                _ => {}
            }
        }

        self.path.push(name);
        self.attrs.push(attrs);
    }

    fn end(&mut self) {
        let Some(name) = self.path.pop() else {
            return;
        };
        let attrs = self.attrs.pop().unwrap_or_default();

        if self.in_text_field() {
            return;
        }

        let value = clean(&self.text);
        self.text.clear();

        if self.reference.is_some() {
            self.end_reference(&name, &attrs, value);
            return;
        }

        let parent = self.parent().unwrap_or_default().to_string();
        match (name.as_str(), parent.as_str()) {
            ("PMID", "MedlineCitation") => {
                if self.pmid.is_none() {
                    self.pmid = value;
                }
            }
            ("ArticleTitle", _) => self.record.document.title = value,
            ("AbstractText", _) => {
                if let Some(text) = value {
                    let part = match attr(&attrs, "Label") {
                        Some(label) if !label.is_empty() => format!("{}: {}", label, text),
                        _ => text,
                    };
                    self.abstract_parts.push(part);
                }
            }
            ("ELocationID", _) => {
                let is_doi = attr(&attrs, "EIdType") == Some("doi");
                let valid = attr(&attrs, "ValidYN") != Some("N");
                if is_doi && valid && self.doi.is_none() {
                    self.doi = value.as_deref().and_then(normalize_doi);
                }
            }
            ("ISSN", "Journal") => self.journal.issn = value,
            ("ISSNLinking", _) => self.issn_linking = value,
            ("Title", "Journal") => self.journal.title = value,
            ("ISOAbbreviation", "Journal") => self.journal.iso_abbreviation = value,
            ("Volume", "JournalIssue") => self.record.document.volume = value,
            ("Issue", "JournalIssue") => self.record.document.issue = value,
            ("Year", "PubDate") => self.pub_date.year = value,
            ("Month", "PubDate") => self.pub_date.month = value,
            ("Day", "PubDate") => self.pub_date.day = value,
            ("MedlineDate", "PubDate") => self.pub_date.medline = value,
            ("MedlinePgn", _) => self.record.document.pagination = value,
            ("Language", _) => {
                if self.record.document.language.is_none() {
                    self.record.document.language = value;
                }
            }
            ("PublicationType", _) => {
                if let Some(v) = value {
                    self.record.publication_types.push(v);
                }
            }
            ("Keyword", _) => {
                if let Some(v) = value {
                    self.record.keywords.push(v);
                }
            }
            ("ArticleId", "ArticleIdList") if self.within("PubmedData") => {
                if let (Some(id_type), Some(v)) = (attr(&attrs, "IdType"), value) {
                    match id_type {
                        "doi" if self.doi.is_none() => self.doi = normalize_doi(&v),
                        "pubmed" if self.pmid.is_none() => self.pmid = Some(v.clone()),
                        _ => {}
                    }
                    self.record.document.other_ids.insert(id_type.to_string(), v);
                }
            }
            ("PubmedArticle", _) | ("PubmedBookArticle", _) => self.done = true,
            _ => {
                self.end_author(&name, &attrs, value.clone());
                self.end_grant(&name, value.clone());
                self.end_chemical(&name, value.clone());
                self.end_mesh(&name, &attrs, value);
            }
        }
    }

    fn end_author(&mut self, name: &str, attrs: &[(String, String)], value: Option<String>) {
        let Some(author) = self.author.as_mut() else {
            return;
        };
        match name {
            "LastName" => author.last_name = value,
            "ForeName" => author.fore_name = value,
            "Initials" => author.initials = value,
            "CollectiveName" => author.collective_name = value,
            "Identifier" if attr(attrs, "Source") == Some("ORCID") => {
                author.orcid = value.as_deref().map(normalize_orcid);
            }
            "Affiliation" => {
                if let Some(v) = value {
                    author.affiliations.push(v);
                }
            }
            "Author" => {
                if let Some(author) = self.author.take() {
                    self.record.authors.push(author);
                }
            }
            _ => {}
        }
    }

    fn end_grant(&mut self, name: &str, value: Option<String>) {
        let Some(grant) = self.grant.as_mut() else {
            return;
        };
        match name {
            "GrantID" => grant.grant_id = value,
            "Acronym" => grant.acronym = value,
            "Agency" => grant.agency = value,
            "Country" => grant.country = value,
            "Grant" => {
                if let Some(grant) = self.grant.take() {
                    self.record.grants.push(grant);
                }
            }
            _ => {}
        }
    }

    fn end_chemical(&mut self, name: &str, value: Option<String>) {
        let Some(chemical) = self.chemical.as_mut() else {
            return;
        };
        match name {
            // "0" is PubMed's placeholder for no registry number
            "RegistryNumber" => chemical.registry_number = value.filter(|v| v != "0"),
            "NameOfSubstance" => chemical.name = value.unwrap_or_default(),
            "Chemical" => {
                if let Some(chemical) = self.chemical.take().filter(|c| !c.name.is_empty()) {
                    self.record.chemicals.push(chemical);
                }
            }
            _ => {}
        }
    }

    fn end_mesh(&mut self, name: &str, attrs: &[(String, String)], value: Option<String>) {
        let Some(mesh) = self.mesh.as_mut() else {
            return;
        };
        match name {
            "DescriptorName" => {
                mesh.descriptor = value.unwrap_or_default();
                mesh.descriptor_ui = attr(attrs, "UI").map(str::to_string);
                mesh.major_topic = attr(attrs, "MajorTopicYN") == Some("Y");
            }
            "QualifierName" => {
                if let Some(v) = value {
                    mesh.qualifiers.push(v);
                }
            }
            "MeshHeading" => {
                if let Some(mesh) = self.mesh.take().filter(|m| !m.descriptor.is_empty()) {
                    self.record.mesh_terms.push(mesh);
                }
            }
            _ => {}
        }
    }

    fn end_reference(&mut self, name: &str, attrs: &[(String, String)], value: Option<String>) {
        match name {
            "Citation" => {
                if let Some(reference) = self.reference.as_mut() {
                    reference.raw_citation_text = value;
                }
            }
            "ArticleId" => {
                if let (Some(reference), Some(v)) = (self.reference.as_mut(), value) {
                    match attr(attrs, "IdType") {
                        Some("pubmed") => reference.target_secondary_id = Some(pmid_secondary_id(&v)),
                        Some("doi") => reference.target_external_id = normalize_doi(&v),
                        _ => {}
                    }
                }
            }
            "Reference" => {
                if let Some(mut reference) = self.reference.take() {
                    reference.order = self.record.references.len() as u32;
                    self.record.references.push(reference);
                }
            }
            _ => {}
        }
    }

    fn finish(mut self) -> Result<MappedRecord, MappingError> {
        if !self.seen_article {
            return Err(MappingError::NoArticle);
        }

        let doc = &mut self.record.document;
        doc.secondary_id = self.pmid.as_deref().map(pmid_secondary_id);
        doc.external_id = self.doi;
        if !self.abstract_parts.is_empty() {
            doc.abstract_text = Some(self.abstract_parts.join(" "));
        }
        doc.publication_date = self.pub_date.render();

        if self.journal.issn.is_none() {
            self.journal.issn = self.issn_linking;
        }
        let journal = self.journal;
        if journal.issn.is_some() || journal.title.is_some() {
            self.record.journal = Some(journal);
        }

        Ok(self.record)
    }
}
