//! Compiled regex patterns and keyword lexicons used by discovery,
//! classification and extraction.
//!
//! Patterns are compiled once via `LazyLock`. The French-language defaults
//! (listing keywords, department names) live here so every module shares one
//! copy.

#![allow(clippy::expect_used)]

use std::sync::LazyLock;

use regex::Regex;

/// Link text / URL keywords that suggest a business-sale listing page.
pub static LISTING_LEXICON: &[&str] = &[
    "annonce",
    "annonces",
    "vente",
    "ventes",
    "cession",
    "cessions",
    "liquidation",
    "offre",
    "offres",
    "entreprise à céder",
    "entreprises à céder",
    "fonds de commerce",
    "actif",
    "actifs",
    "enchère",
    "enchères",
    "reprise",
];

/// Anchor text that marks a "next page" pagination link.
pub static NEXT_LINK_LEXICON: &[&str] = &[
    "suivant",
    "suivante",
    "page suivante",
    "next",
    "»",
    "›",
    "suite",
];

/// Text that looks like a money amount ("150 000 €", "Prix : 80000").
pub static PRICE_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\d[\d \u{00a0}.,]*\s*(?:€|euros?\b)|(?:prix|montant)\s*:")
        .expect("PRICE_HINT regex")
});

/// Digit run with optional French thousands separators (space, nbsp, dot).
/// A comma stops the match, which drops decimal cents on parsing.
pub static NUMBER_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d{1,3}(?:[ \u{00a0}.]\d{3})+|\d+").expect("NUMBER_RUN regex"));

/// French 5-digit postal code.
pub static POSTAL_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{5})\b").expect("POSTAL_CODE regex"));

/// Numeric dates: 12/01/2024, 12-1-24.
pub static DATE_NUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,2}[/-]\d{1,2}[/-]\d{2,4}\b").expect("DATE_NUMERIC regex"));

/// Textual French dates: "12 janvier 2024", "1er mars 2023".
pub static DATE_TEXTUAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(\d{1,2})(?:er)?\s+(janvier|février|mars|avril|mai|juin|juillet|août|septembre|octobre|novembre|décembre)\s+(\d{4})\b",
    )
    .expect("DATE_TEXTUAL regex")
});

pub static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").expect("EMAIL regex")
});

/// French phone number written as five digit pairs.
pub static PHONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b0\d(?:[ .]?\d{2}){4}\b").expect("PHONE regex"));

/// Labelled reference: "Réf : AJ-2024-117", "Reference: X12".
pub static REFERENCE_LABELLED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)r[ée]f(?:[ée]rence)?\s*\.?\s*:?\s*([A-Z0-9][A-Z0-9/-]{2,})")
        .expect("REFERENCE_LABELLED regex")
});

/// Bare alphanumeric code: "AJ-2024", "LOT/17".
pub static REFERENCE_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Z]{2,}[-/]?\d{2,}[A-Z0-9/-]*\b").expect("REFERENCE_CODE regex")
});

/// Department number to name, used as the region-name fallback when a record
/// carries no parseable postal code. Covers Île-de-France plus the largest
/// metropolitan departments.
pub static DEPARTMENT_NAMES: &[(&str, &str)] = &[
    ("75", "paris"),
    ("77", "seine-et-marne"),
    ("78", "yvelines"),
    ("91", "essonne"),
    ("92", "hauts-de-seine"),
    ("93", "seine-saint-denis"),
    ("94", "val-de-marne"),
    ("95", "val-d'oise"),
    ("13", "bouches-du-rhône"),
    ("31", "haute-garonne"),
    ("33", "gironde"),
    ("59", "nord"),
    ("69", "rhône"),
];

pub fn department_name(code: &str) -> Option<&'static str> {
    DEPARTMENT_NAMES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| *name)
}

/// Month name to number for textual date parsing.
pub fn french_month(name: &str) -> Option<u32> {
    let months = [
        "janvier",
        "février",
        "mars",
        "avril",
        "mai",
        "juin",
        "juillet",
        "août",
        "septembre",
        "octobre",
        "novembre",
        "décembre",
    ];
    let lower = name.to_lowercase();
    months
        .iter()
        .position(|m| *m == lower)
        .map(|i| i as u32 + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_hint_matches_amounts_and_labels() {
        assert!(PRICE_HINT.is_match("150 000 €"));
        assert!(PRICE_HINT.is_match("Prix : 80000"));
        assert!(PRICE_HINT.is_match("12 euros"));
        assert!(!PRICE_HINT.is_match("Boulangerie à Lyon"));
    }

    #[test]
    fn number_run_stops_at_decimal_comma() {
        let m = NUMBER_RUN.find("150 000,00 €").map(|m| m.as_str());
        assert_eq!(m, Some("150 000"));
    }

    #[test]
    fn phone_matches_dotted_and_spaced_pairs() {
        assert!(PHONE.is_match("contact au 01 42 68 53 00"));
        assert!(PHONE.is_match("06.12.34.56.78"));
        assert!(!PHONE.is_match("75008"));
    }

    #[test]
    fn labelled_reference_captures_code() {
        let caps = REFERENCE_LABELLED
            .captures("Référence : AJ-2024-117")
            .unwrap();
        assert_eq!(&caps[1], "AJ-2024-117");
    }

    #[test]
    fn french_month_lookup() {
        assert_eq!(french_month("janvier"), Some(1));
        assert_eq!(french_month("Décembre"), Some(12));
        assert_eq!(french_month("month"), None);
    }
}
