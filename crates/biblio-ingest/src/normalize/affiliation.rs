//! Free-text affiliation parsing.
//!
//! A raw PubMed affiliation such as
//! `"Dept. of Medicine, Harvard Univ., Boston, MA 02115, USA. jdoe@hms.edu"`
//! is segmented, each segment classified against the gazetteers and keyword
//! tables, and the result reduced to a [`NormalizedAffiliation`] whose
//! `canonical_key` is stable across spelling variants.

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::gazetteer;
use super::similarity::{normalize_text, similarity};

const ABBREVIATIONS: &[(&str, &str)] = &[
    ("univ", "university"),
    ("dept", "department"),
    ("dep", "department"),
    ("inst", "institute"),
    ("hosp", "hospital"),
    ("ctr", "center"),
    ("cntr", "center"),
    ("natl", "national"),
    ("nat", "national"),
    ("intl", "international"),
    ("lab", "laboratory"),
    ("labs", "laboratories"),
    ("sch", "school"),
    ("coll", "college"),
    ("med", "medical"),
    ("sci", "science"),
    ("technol", "technology"),
    ("res", "research"),
    ("div", "division"),
    ("fac", "faculty"),
    ("acad", "academy"),
    ("assoc", "association"),
    ("mem", "memorial"),
    ("gen", "general"),
];

/// Segment prefixes that mark a sub-unit of an institution.
const DEPARTMENT_PREFIXES: &[&str] = &[
    "department",
    "division",
    "laboratory of",
    "section",
    "unit",
    "program",
    "programme",
    "faculty",
    "graduate program",
];

const STRONG_INSTITUTION_KEYWORDS: &[&str] = &[
    "university",
    "universite",
    "universitat",
    "universidad",
    "universita",
    "universiteit",
    "college",
    "hospital",
    "institute",
    "institut",
    "instituto",
    "istituto",
    "clinic",
    "klinikum",
    "academy",
    "foundation",
    "inc",
    "ltd",
    "corporation",
    "company",
    "council",
    "ministry",
    "agency",
];

const WEAK_INSTITUTION_KEYWORDS: &[&str] = &[
    "center",
    "centre",
    "school",
    "laboratory",
    "laboratories",
    "observatory",
];

/// Structured view of one raw affiliation string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedAffiliation {
    pub raw: String,
    pub normalized_name: String,
    pub institution: Option<String>,
    pub department: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub postal_code: Option<String>,
    pub email: Option<String>,
    pub canonical_key: String,
}

impl NormalizedAffiliation {
    /// False for input that was keyed on its raw text.
    pub fn is_structured(&self) -> bool {
        self.institution.is_some()
    }

    pub fn country_slug(&self) -> String {
        gazetteer::country_slug(self.country.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum InstitutionStrength {
    Unclassified,
    Weak,
    Strong,
}

#[derive(Debug)]
enum Segment {
    Department(String),
    Institution(String, InstitutionStrength),
    Location,
}

#[derive(Debug, Default)]
struct Fields {
    city: Option<String>,
    city_country: Option<&'static str>,
    state: Option<String>,
    state_country: Option<&'static str>,
    country: Option<String>,
    postal_code: Option<String>,
}

pub struct AffiliationNormalizer {
    email: Regex,
    electronic_address: Regex,
    postal_code: Regex,
}

impl AffiliationNormalizer {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            email: Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}")?,
            electronic_address: Regex::new(r"(?i)electronic\s+address\s*:?")?,
            postal_code: Regex::new(
                r"\b(?:\d{5}(?:-\d{4})?|\d{6}|[A-Z]{1,2}\d[A-Z\d]?\s+\d[A-Z]{2})\b",
            )?,
        })
    }

    /// Scoring function used for fuzzy matching of normalized names.
    pub fn score(&self, a: &str, b: &str) -> f64 {
        similarity(a, b)
    }

    /// Parse a raw affiliation. Never fails; input without a usable
    /// institution segment is keyed on its own normalized text.
    pub fn normalize(&self, raw: &str) -> NormalizedAffiliation {
        let raw = raw.trim();

        let email = self
            .email
            .find(raw)
            .map(|m| m.as_str().trim_end_matches('.').to_lowercase());
        let without_email = self.email.replace_all(raw, " ");
        let text = self.electronic_address.replace_all(&without_email, " ");

        let mut fields = Fields::default();
        let mut segments = Vec::new();

        for piece in text.split([',', ';', '|']) {
            let piece = piece.trim_matches(|c: char| c.is_whitespace() || c == '.');
            if piece.is_empty() {
                continue;
            }
            segments.push(self.classify(piece, &mut fields));
        }

        let (institution, department) = pick_institution(&segments);

        // Short unclassified segment after the institution reads as a city.
        if fields.city.is_none() {
            if let Some(inst_pos) = segments
                .iter()
                .position(|s| matches!(s, Segment::Institution(name, _) if Some(name) == institution.as_ref()))
            {
                fields.city = segments[inst_pos + 1..].iter().find_map(|s| match s {
                    Segment::Institution(name, InstitutionStrength::Unclassified)
                        if name.split_whitespace().count() <= 3
                            && !name.chars().any(|c| c.is_ascii_digit()) =>
                    {
                        Some(name.clone())
                    }
                    _ => None,
                });
            }
        }

        let country = fields
            .country
            .clone()
            .or_else(|| fields.state_country.map(str::to_string))
            .or_else(|| fields.city_country.map(str::to_string))
            .or_else(|| {
                email
                    .as_deref()
                    .and_then(gazetteer::country_from_email)
                    .map(str::to_string)
            });

        let institution = institution.map(|name| expand_display(&name));
        let department = department.map(|name| expand_display(&name));

        let (normalized_name, canonical_key) = match &institution {
            Some(name) => {
                let normalized = expand_normalized(&normalize_text(name));
                let key = format!("{}|{}", normalized, gazetteer::country_slug(country.as_deref()));
                (normalized, key)
            }
            None => {
                let normalized = normalize_text(raw);
                let key = format!("raw:{}", normalized);
                (normalized, key)
            }
        };

        NormalizedAffiliation {
            raw: raw.to_string(),
            normalized_name,
            institution,
            department,
            city: fields.city,
            state: fields.state,
            country,
            postal_code: fields.postal_code,
            email,
            canonical_key,
        }
    }

    fn classify(&self, piece: &str, fields: &mut Fields) -> Segment {
        let mut rest = piece.to_string();

        if let Some(m) = self.postal_code.find(&rest) {
            if fields.postal_code.is_none() {
                fields.postal_code = Some(m.as_str().to_string());
            }
            rest = format!("{} {}", &rest[..m.start()], &rest[m.end()..]);
            rest = rest.split_whitespace().collect::<Vec<_>>().join(" ");
        }

        // "Boston MA" / "MA" trailing state code
        if let Some((head, last)) = split_last_token(&rest) {
            if let Some(region) = gazetteer::region(last, &normalize_text(last)) {
                if last.len() == 2 {
                    set_region(fields, region);
                    rest = head.to_string();
                }
            }
        }

        if rest.is_empty() {
            return Segment::Location;
        }

        let normalized = normalize_text(&rest);
        if normalized.is_empty() {
            return Segment::Location;
        }

        if let Some(country) = gazetteer::country(&normalized) {
            if fields.country.is_none() {
                fields.country = Some(country.to_string());
            }
            return Segment::Location;
        }
        if let Some(region) = gazetteer::region(&rest, &normalized) {
            set_region(fields, region);
            return Segment::Location;
        }
        if let Some(city) = gazetteer::city(&normalized) {
            if fields.city.is_none() {
                fields.city = Some(city.name.to_string());
                fields.city_country = Some(city.country);
            }
            return Segment::Location;
        }

        let expanded = expand_normalized(&normalized);
        if DEPARTMENT_PREFIXES.iter().any(|p| expanded.starts_with(p)) {
            return Segment::Department(rest);
        }

        let has_keyword = |keywords: &[&str]| {
            expanded
                .split_whitespace()
                .any(|token| keywords.contains(&token))
        };
        let strength = if has_keyword(STRONG_INSTITUTION_KEYWORDS) {
            InstitutionStrength::Strong
        } else if has_keyword(WEAK_INSTITUTION_KEYWORDS) {
            InstitutionStrength::Weak
        } else {
            InstitutionStrength::Unclassified
        };

        Segment::Institution(rest, strength)
    }
}

fn set_region(fields: &mut Fields, region: gazetteer::Region) {
    if fields.state.is_none() {
        fields.state = Some(region.name.to_string());
        fields.state_country = Some(region.country);
    }
}

fn split_last_token(text: &str) -> Option<(&str, &str)> {
    match text.rsplit_once(' ') {
        Some((head, last)) => Some((head.trim(), last)),
        None if !text.is_empty() => Some(("", text)),
        None => None,
    }
}

/// Choose the institution segment (strongest, earliest) and the department.
fn pick_institution(segments: &[Segment]) -> (Option<String>, Option<String>) {
    let mut best: Option<(&String, InstitutionStrength)> = None;
    for segment in segments {
        if let Segment::Institution(name, strength) = segment {
            if best.map_or(true, |(_, current)| *strength > current) {
                best = Some((name, *strength));
            }
        }
    }

    let department = segments.iter().find_map(|s| match s {
        Segment::Department(name) => Some(name.clone()),
        _ => None,
    });

    let Some((institution, strength)) = best else {
        return (None, department);
    };

    // "School of Medicine, Harvard University": the weaker unit before a
    // strong institution is its department.
    let department = department.or_else(|| {
        if strength != InstitutionStrength::Strong {
            return None;
        }
        segments.iter().find_map(|s| match s {
            Segment::Institution(name, InstitutionStrength::Weak) if name != institution => {
                Some(name.clone())
            }
            _ => None,
        })
    });

    (Some(institution.clone()), department)
}

fn expansion(token: &str) -> Option<&'static str> {
    let lower = token.to_lowercase();
    ABBREVIATIONS
        .iter()
        .find(|(abbr, _)| *abbr == lower)
        .map(|(_, full)| *full)
}

/// Expand abbreviations in a normalized (lowercase, space separated) name.
pub fn expand_normalized(normalized: &str) -> String {
    normalized
        .split_whitespace()
        .map(|token| expansion(token).unwrap_or(token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Expand abbreviations keeping the original casing: `Harvard Univ.` becomes
/// `Harvard University`.
pub fn expand_display(name: &str) -> String {
    name.split_whitespace()
        .map(|token| {
            let core = token.trim_end_matches('.');
            match expansion(core) {
                Some(full) if core.chars().next().is_some_and(char::is_uppercase) => {
                    let mut chars = full.chars();
                    match chars.next() {
                        Some(first) => first.to_uppercase().chain(chars).collect(),
                        None => String::new(),
                    }
                }
                Some(full) => full.to_string(),
                None => token.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn normalizer() -> AffiliationNormalizer {
        AffiliationNormalizer::new().unwrap()
    }

    #[test]
    fn test_abbreviated_and_spelled_out_variants_share_key() {
        let n = normalizer();
        let short = n.normalize("Harvard Univ., Boston, MA");
        let long = n.normalize("Harvard University, Boston, Massachusetts");

        assert_eq!(short.institution.as_deref(), Some("Harvard University"));
        assert_eq!(short.country.as_deref(), Some("USA"));
        assert_eq!(short.state.as_deref(), Some("Massachusetts"));
        assert_eq!(short.city.as_deref(), Some("Boston"));
        assert_eq!(short.canonical_key, "harvard university|usa");
        assert_eq!(short.canonical_key, long.canonical_key);
    }

    #[test]
    fn test_full_pubmed_affiliation() {
        let n = normalizer();
        let aff = n.normalize(
            "Department of Medicine, Massachusetts General Hospital, Boston, MA 02114, USA. Electronic address: jdoe@mgh.harvard.edu.",
        );

        assert_eq!(aff.department.as_deref(), Some("Department of Medicine"));
        assert_eq!(aff.institution.as_deref(), Some("Massachusetts General Hospital"));
        assert_eq!(aff.postal_code.as_deref(), Some("02114"));
        assert_eq!(aff.state.as_deref(), Some("Massachusetts"));
        assert_eq!(aff.country.as_deref(), Some("USA"));
        assert_eq!(aff.email.as_deref(), Some("jdoe@mgh.harvard.edu"));
        assert_eq!(aff.canonical_key, "massachusetts general hospital|usa");
    }

    #[test]
    fn test_school_before_university_becomes_department() {
        let n = normalizer();
        let aff = n.normalize("School of Medicine, Stanford University, Stanford, CA 94305, USA");

        assert_eq!(aff.institution.as_deref(), Some("Stanford University"));
        assert_eq!(aff.department.as_deref(), Some("School of Medicine"));
        assert_eq!(aff.city.as_deref(), Some("Stanford"));
    }

    #[test]
    fn test_country_inferred_from_email_tld() {
        let n = normalizer();
        let aff = n.normalize("Nuffield Department of Medicine, University of Oxenford. a.b@ndm.ox.ac.uk");

        assert_eq!(aff.institution.as_deref(), Some("University of Oxenford"));
        assert_eq!(aff.country.as_deref(), Some("United Kingdom"));
        assert!(aff.canonical_key.ends_with("|united-kingdom"));
    }

    #[test]
    fn test_uk_postcode_and_six_digit_postal() {
        let n = normalizer();
        let uk = n.normalize("Wellcome Sanger Institute, Hinxton CB10 1SA, UK");
        assert_eq!(uk.postal_code.as_deref(), Some("CB10 1SA"));
        assert_eq!(uk.country.as_deref(), Some("United Kingdom"));

        let cn = n.normalize("Tsinghua University, Beijing 100084, China");
        assert_eq!(cn.postal_code.as_deref(), Some("100084"));
        assert_eq!(cn.city.as_deref(), Some("Beijing"));
        assert_eq!(cn.canonical_key, "tsinghua university|china");
    }

    #[test]
    fn test_unparseable_input_is_keyed_on_raw_text() {
        let n = normalizer();
        let aff = n.normalize("Boston, USA");

        assert!(!aff.is_structured());
        assert_eq!(aff.canonical_key, "raw:boston usa");
        assert_eq!(aff.country.as_deref(), Some("USA"));

        let empty = n.normalize("  ");
        assert_eq!(empty.canonical_key, "raw:");
    }

    #[test]
    fn test_expand_display() {
        assert_eq!(expand_display("Dept. of Medicine"), "Department of Medicine");
        assert_eq!(expand_display("Natl Inst of Health"), "National Institute of Health");
        assert_eq!(expand_normalized("harvard univ"), "harvard university");
    }
}
