//! Text folding and name similarity scoring

use strsim::normalized_levenshtein;

/// Lowercase, fold common Latin diacritics, replace punctuation with spaces
/// and collapse whitespace.
pub fn normalize_text(input: &str) -> String {
    let mut folded = String::with_capacity(input.len());
    for c in input.chars() {
        match fold_char(c) {
            Folded::One(f) => folded.push(f),
            Folded::Two(a, b) => {
                folded.push(a);
                folded.push(b);
            }
        }
    }

    folded
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

enum Folded {
    One(char),
    Two(char, char),
}

fn fold_char(c: char) -> Folded {
    let lower = c.to_lowercase().next().unwrap_or(c);
    let base = match lower {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => 'a',
        'ç' | 'ć' | 'č' => 'c',
        'ď' | 'đ' => 'd',
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' | 'ě' => 'e',
        'ğ' => 'g',
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'ı' => 'i',
        'ł' | 'ľ' => 'l',
        'ñ' | 'ń' | 'ň' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => 'o',
        'ř' => 'r',
        'ś' | 'š' | 'ş' => 's',
        'ť' | 'ţ' => 't',
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' => 'u',
        'ý' | 'ÿ' => 'y',
        'ź' | 'ż' | 'ž' => 'z',
        'ß' => return Folded::Two('s', 's'),
        'æ' => return Folded::Two('a', 'e'),
        'œ' => return Folded::Two('o', 'e'),
        other => other,
    };
    Folded::One(base)
}

fn sorted_tokens(text: &str) -> String {
    let mut tokens: Vec<&str> = text.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// Similarity in `[0, 1]` of two already-normalized names.
///
/// Maximum of the plain normalized Levenshtein score and the score of the
/// sorted-token forms, so "medical school harvard" still matches
/// "harvard medical school".
pub fn similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }

    let direct = normalized_levenshtein(a, b);
    let reordered = normalized_levenshtein(&sorted_tokens(a), &sorted_tokens(b));
    direct.max(reordered)
}

/// Similarity of two display names after normalization.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    similarity(&normalize_text(a), &normalize_text(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Harvard   Univ. "), "harvard univ");
        assert_eq!(normalize_text("Université de Montréal"), "universite de montreal");
        assert_eq!(normalize_text("Ludwig-Maximilians-Universität München"), "ludwig maximilians universitat munchen");
        assert_eq!(normalize_text("Straße"), "strasse");
        assert_eq!(normalize_text("..."), "");
    }

    #[test]
    fn test_similarity_identity_and_empty() {
        assert_eq!(similarity("harvard university", "harvard university"), 1.0);
        assert_eq!(similarity("", "harvard"), 0.0);
    }

    #[test]
    fn test_similarity_token_order() {
        let score = similarity("harvard medical school", "medical school harvard");
        assert!((score - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_similarity_close_spellings() {
        assert!(similarity("massachusetts general hospital", "massachussets general hospital") > 0.9);
        assert!(similarity("harvard university", "stanford university") < 0.85);
    }

    #[test]
    fn test_name_similarity_folds_case_and_accents() {
        assert!(name_similarity("José García", "jose garcia") > 0.99);
    }
}
