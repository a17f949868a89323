//! Static place-name tables used to classify affiliation segments.
//!
//! Keys are normalized (see [`normalize_text`](super::similarity::normalize_text)).

/// Country aliases, normalized alias to canonical display name.
const COUNTRY_ALIASES: &[(&str, &str)] = &[
    ("usa", "USA"),
    ("us", "USA"),
    ("u s a", "USA"),
    ("u s", "USA"),
    ("united states", "USA"),
    ("united states of america", "USA"),
    ("uk", "United Kingdom"),
    ("u k", "United Kingdom"),
    ("united kingdom", "United Kingdom"),
    ("great britain", "United Kingdom"),
    ("england", "United Kingdom"),
    ("scotland", "United Kingdom"),
    ("wales", "United Kingdom"),
    ("northern ireland", "United Kingdom"),
    ("china", "China"),
    ("pr china", "China"),
    ("p r china", "China"),
    ("peoples r china", "China"),
    ("people s republic of china", "China"),
    ("peoples republic of china", "China"),
    ("hong kong", "Hong Kong"),
    ("taiwan", "Taiwan"),
    ("japan", "Japan"),
    ("south korea", "South Korea"),
    ("korea", "South Korea"),
    ("republic of korea", "South Korea"),
    ("germany", "Germany"),
    ("deutschland", "Germany"),
    ("france", "France"),
    ("italy", "Italy"),
    ("spain", "Spain"),
    ("portugal", "Portugal"),
    ("netherlands", "Netherlands"),
    ("the netherlands", "Netherlands"),
    ("belgium", "Belgium"),
    ("switzerland", "Switzerland"),
    ("austria", "Austria"),
    ("sweden", "Sweden"),
    ("norway", "Norway"),
    ("denmark", "Denmark"),
    ("finland", "Finland"),
    ("ireland", "Ireland"),
    ("poland", "Poland"),
    ("greece", "Greece"),
    ("russia", "Russia"),
    ("russian federation", "Russia"),
    ("turkey", "Turkey"),
    ("israel", "Israel"),
    ("iran", "Iran"),
    ("saudi arabia", "Saudi Arabia"),
    ("egypt", "Egypt"),
    ("south africa", "South Africa"),
    ("india", "India"),
    ("singapore", "Singapore"),
    ("australia", "Australia"),
    ("new zealand", "New Zealand"),
    ("canada", "Canada"),
    ("mexico", "Mexico"),
    ("brazil", "Brazil"),
    ("argentina", "Argentina"),
    ("chile", "Chile"),
];

/// US states and DC, two-letter code and full name.
const US_STATES: &[(&str, &str)] = &[
    ("AL", "Alabama"),
    ("AK", "Alaska"),
    ("AZ", "Arizona"),
    ("AR", "Arkansas"),
    ("CA", "California"),
    ("CO", "Colorado"),
    ("CT", "Connecticut"),
    ("DE", "Delaware"),
    ("DC", "District of Columbia"),
    ("FL", "Florida"),
    ("GA", "Georgia"),
    ("HI", "Hawaii"),
    ("ID", "Idaho"),
    ("IL", "Illinois"),
    ("IN", "Indiana"),
    ("IA", "Iowa"),
    ("KS", "Kansas"),
    ("KY", "Kentucky"),
    ("LA", "Louisiana"),
    ("ME", "Maine"),
    ("MD", "Maryland"),
    ("MA", "Massachusetts"),
    ("MI", "Michigan"),
    ("MN", "Minnesota"),
    ("MS", "Mississippi"),
    ("MO", "Missouri"),
    ("MT", "Montana"),
    ("NE", "Nebraska"),
    ("NV", "Nevada"),
    ("NH", "New Hampshire"),
    ("NJ", "New Jersey"),
    ("NM", "New Mexico"),
    ("NY", "New York"),
    ("NC", "North Carolina"),
    ("ND", "North Dakota"),
    ("OH", "Ohio"),
    ("OK", "Oklahoma"),
    ("OR", "Oregon"),
    ("PA", "Pennsylvania"),
    ("RI", "Rhode Island"),
    ("SC", "South Carolina"),
    ("SD", "South Dakota"),
    ("TN", "Tennessee"),
    ("TX", "Texas"),
    ("UT", "Utah"),
    ("VT", "Vermont"),
    ("VA", "Virginia"),
    ("WA", "Washington"),
    ("WV", "West Virginia"),
    ("WI", "Wisconsin"),
    ("WY", "Wyoming"),
];

const CA_PROVINCES: &[(&str, &str)] = &[
    ("AB", "Alberta"),
    ("BC", "British Columbia"),
    ("MB", "Manitoba"),
    ("NB", "New Brunswick"),
    ("NL", "Newfoundland and Labrador"),
    ("NS", "Nova Scotia"),
    ("ON", "Ontario"),
    ("PE", "Prince Edward Island"),
    ("QC", "Quebec"),
    ("SK", "Saskatchewan"),
];

/// Unambiguous major research cities.
const CITIES: &[(&str, &str, &str)] = &[
    ("boston", "Boston", "USA"),
    ("new york", "New York", "USA"),
    ("baltimore", "Baltimore", "USA"),
    ("bethesda", "Bethesda", "USA"),
    ("chicago", "Chicago", "USA"),
    ("los angeles", "Los Angeles", "USA"),
    ("san francisco", "San Francisco", "USA"),
    ("san diego", "San Diego", "USA"),
    ("houston", "Houston", "USA"),
    ("philadelphia", "Philadelphia", "USA"),
    ("pittsburgh", "Pittsburgh", "USA"),
    ("seattle", "Seattle", "USA"),
    ("stanford", "Stanford", "USA"),
    ("new haven", "New Haven", "USA"),
    ("ann arbor", "Ann Arbor", "USA"),
    ("atlanta", "Atlanta", "USA"),
    ("nashville", "Nashville", "USA"),
    ("rochester", "Rochester", "USA"),
    ("london", "London", "United Kingdom"),
    ("oxford", "Oxford", "United Kingdom"),
    ("edinburgh", "Edinburgh", "United Kingdom"),
    ("manchester", "Manchester", "United Kingdom"),
    ("glasgow", "Glasgow", "United Kingdom"),
    ("beijing", "Beijing", "China"),
    ("shanghai", "Shanghai", "China"),
    ("wuhan", "Wuhan", "China"),
    ("guangzhou", "Guangzhou", "China"),
    ("shenzhen", "Shenzhen", "China"),
    ("hangzhou", "Hangzhou", "China"),
    ("nanjing", "Nanjing", "China"),
    ("chengdu", "Chengdu", "China"),
    ("tokyo", "Tokyo", "Japan"),
    ("osaka", "Osaka", "Japan"),
    ("kyoto", "Kyoto", "Japan"),
    ("seoul", "Seoul", "South Korea"),
    ("paris", "Paris", "France"),
    ("lyon", "Lyon", "France"),
    ("berlin", "Berlin", "Germany"),
    ("munich", "Munich", "Germany"),
    ("munchen", "Munich", "Germany"),
    ("heidelberg", "Heidelberg", "Germany"),
    ("hamburg", "Hamburg", "Germany"),
    ("madrid", "Madrid", "Spain"),
    ("barcelona", "Barcelona", "Spain"),
    ("rome", "Rome", "Italy"),
    ("milan", "Milan", "Italy"),
    ("amsterdam", "Amsterdam", "Netherlands"),
    ("zurich", "Zurich", "Switzerland"),
    ("geneva", "Geneva", "Switzerland"),
    ("vienna", "Vienna", "Austria"),
    ("stockholm", "Stockholm", "Sweden"),
    ("copenhagen", "Copenhagen", "Denmark"),
    ("oslo", "Oslo", "Norway"),
    ("helsinki", "Helsinki", "Finland"),
    ("dublin", "Dublin", "Ireland"),
    ("toronto", "Toronto", "Canada"),
    ("montreal", "Montreal", "Canada"),
    ("vancouver", "Vancouver", "Canada"),
    ("sydney", "Sydney", "Australia"),
    ("melbourne", "Melbourne", "Australia"),
    ("new delhi", "New Delhi", "India"),
    ("mumbai", "Mumbai", "India"),
    ("sao paulo", "Sao Paulo", "Brazil"),
];

/// Country-code top level domains for the e-mail fallback.
const EMAIL_TLDS: &[(&str, &str)] = &[
    ("uk", "United Kingdom"),
    ("cn", "China"),
    ("jp", "Japan"),
    ("kr", "South Korea"),
    ("tw", "Taiwan"),
    ("hk", "Hong Kong"),
    ("de", "Germany"),
    ("fr", "France"),
    ("it", "Italy"),
    ("es", "Spain"),
    ("pt", "Portugal"),
    ("nl", "Netherlands"),
    ("be", "Belgium"),
    ("ch", "Switzerland"),
    ("at", "Austria"),
    ("se", "Sweden"),
    ("no", "Norway"),
    ("dk", "Denmark"),
    ("fi", "Finland"),
    ("ie", "Ireland"),
    ("pl", "Poland"),
    ("gr", "Greece"),
    ("ru", "Russia"),
    ("tr", "Turkey"),
    ("il", "Israel"),
    ("ir", "Iran"),
    ("in", "India"),
    ("sg", "Singapore"),
    ("au", "Australia"),
    ("nz", "New Zealand"),
    ("ca", "Canada"),
    ("mx", "Mexico"),
    ("br", "Brazil"),
    ("ar", "Argentina"),
    ("za", "South Africa"),
];

/// A state or province with the country it implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub name: &'static str,
    pub country: &'static str,
}

/// A gazetteer city with the country it implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct City {
    pub name: &'static str,
    pub country: &'static str,
}

pub fn country(normalized: &str) -> Option<&'static str> {
    COUNTRY_ALIASES
        .iter()
        .find(|(alias, _)| *alias == normalized)
        .map(|(_, canonical)| *canonical)
}

/// Look up a region by full name (normalized) or by upper-case postal code.
///
/// Codes only match when written in capitals so that segments such as "in"
/// or "or" are not mistaken for Indiana or Oregon.
pub fn region(segment: &str, normalized: &str) -> Option<Region> {
    let code = segment.trim();
    let is_code = code.len() == 2 && code.chars().all(|c| c.is_ascii_uppercase());

    let lookup = |table: &'static [(&'static str, &'static str)], country: &'static str| {
        table
            .iter()
            .find(|(abbr, name)| (is_code && *abbr == code) || name.to_lowercase() == normalized)
            .map(|&(_, name)| Region { name, country })
    };

    lookup(US_STATES, "USA").or_else(|| lookup(CA_PROVINCES, "Canada"))
}

pub fn city(normalized: &str) -> Option<City> {
    CITIES
        .iter()
        .find(|(key, _, _)| *key == normalized)
        .map(|&(_, name, country)| City { name, country })
}

pub fn country_from_email(email: &str) -> Option<&'static str> {
    let tld = email.rsplit('.').next()?.to_ascii_lowercase();
    EMAIL_TLDS
        .iter()
        .find(|(code, _)| *code == tld)
        .map(|(_, country)| *country)
}

/// Stable key fragment for a country; `unknown` when none was found.
pub fn country_slug(country: Option<&str>) -> String {
    match country {
        Some(name) => name
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("-"),
        None => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_country_aliases() {
        assert_eq!(country("usa"), Some("USA"));
        assert_eq!(country("united states of america"), Some("USA"));
        assert_eq!(country("peoples r china"), Some("China"));
        assert_eq!(country("boston"), None);
    }

    #[test]
    fn test_region_codes_require_capitals() {
        let ma = region("MA", "ma").map(|r| r.name);
        assert_eq!(ma, Some("Massachusetts"));
        assert_eq!(region("in", "in"), None);
        assert_eq!(region("Ontario", "ontario").map(|r| r.country), Some("Canada"));
        assert_eq!(region("Massachusetts", "massachusetts").map(|r| r.country), Some("USA"));
    }

    #[test]
    fn test_city_and_email() {
        assert_eq!(city("boston").map(|c| c.country), Some("USA"));
        assert_eq!(country_from_email("jane@ox.ac.uk"), Some("United Kingdom"));
        assert_eq!(country_from_email("jane@example.com"), None);
    }

    #[test]
    fn test_country_slug() {
        assert_eq!(country_slug(Some("United Kingdom")), "united-kingdom");
        assert_eq!(country_slug(None), "unknown");
    }
}
