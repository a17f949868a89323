//! Affiliation normalization and name similarity

pub mod affiliation;
pub mod gazetteer;
pub mod similarity;

pub use affiliation::{AffiliationNormalizer, NormalizedAffiliation};
pub use similarity::{name_similarity, normalize_text, similarity};
