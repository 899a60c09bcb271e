//! Multi-predicate filtering of extracted listings.
//!
//! Predicate composition is logical AND across the enabled categories and
//! logical OR across keywords within a category. Filtering is a pure function
//! of (records, criteria): idempotent and order-preserving.

use crate::formats::{
    FilterCriteria, FilterResult, FilterStats, ListingRecord, MatchExplanation, PredicateKind,
};
use crate::patterns;

#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("min price {min} exceeds max price {max}")]
    PriceBounds { min: u64, max: u64 },
}

/// Validate criteria before any filtering happens. Invalid criteria abort
/// this invocation only, never the surrounding run.
pub fn validate(criteria: &FilterCriteria) -> Result<(), FilterError> {
    if let (Some(min), Some(max)) = (criteria.min_price, criteria.max_price) {
        if min > max {
            return Err(FilterError::PriceBounds { min, max });
        }
    }
    Ok(())
}

pub fn apply(records: &[ListingRecord], criteria: &FilterCriteria) -> Result<FilterResult, FilterError> {
    validate(criteria)?;

    let price_enabled = criteria.min_price.is_some() || criteria.max_price.is_some();

    let mut surviving = Vec::new();
    let mut explanations = Vec::new();
    for record in records {
        let mut matched = Vec::new();

        if !criteria.sectors.is_empty() {
            if sector_match(record, &criteria.sectors).is_none() {
                continue;
            }
            matched.push(PredicateKind::Sector);
        }
        if !criteria.departments.is_empty() {
            if !region_match(record, &criteria.departments) {
                continue;
            }
            matched.push(PredicateKind::Region);
        }
        if price_enabled {
            if !price_match(record, criteria.min_price, criteria.max_price) {
                continue;
            }
            matched.push(PredicateKind::Price);
        }
        if !criteria.include_keywords.is_empty() {
            if !keyword_match(record, &criteria.include_keywords) {
                continue;
            }
            matched.push(PredicateKind::Include);
        }
        if !criteria.exclude_keywords.is_empty() {
            // Exclusion wins over inclusion.
            if keyword_match(record, &criteria.exclude_keywords) {
                continue;
            }
            matched.push(PredicateKind::Exclude);
        }

        surviving.push(record.clone());
        explanations.push(MatchExplanation {
            record_id: record.id.clone(),
            matched,
        });
    }

    let stats = statistics(&surviving, criteria);
    Ok(FilterResult {
        records: surviving,
        explanations,
        stats,
    })
}

fn search_text(record: &ListingRecord) -> String {
    format!(
        "{} {} {}",
        record.title,
        record.description,
        record.sector.as_deref().unwrap_or_default()
    )
    .to_lowercase()
}

/// First sector keyword appearing in title, description or sector tag.
fn sector_match<'a>(record: &ListingRecord, sectors: &'a [String]) -> Option<&'a str> {
    let text = search_text(record);
    sectors
        .iter()
        .find(|sector| text.contains(sector.to_lowercase().as_str()))
        .map(String::as_str)
}

/// Department code membership, with a fallback on region/department names in
/// the raw location text for records without a parseable postal code.
fn region_match(record: &ListingRecord, departments: &[String]) -> bool {
    if let Some(department) = record.department.as_deref() {
        if departments.iter().any(|target| target == department) {
            return true;
        }
    }

    let location = record.location_raw.to_lowercase();
    if location.is_empty() {
        return false;
    }
    departments.iter().any(|target| {
        let name = if target.len() == 2 && target.chars().all(|c| c.is_ascii_digit()) {
            patterns::department_name(target)
        } else {
            Some(target.as_str())
        };
        name.is_some_and(|name| location.contains(name.to_lowercase().as_str()))
    })
}

/// An absent price is non-exclusionary; a parsed one must lie in bounds.
fn price_match(record: &ListingRecord, min: Option<u64>, max: Option<u64>) -> bool {
    let Some(price) = record.price else {
        return true;
    };
    if min.is_some_and(|min| price < min) {
        return false;
    }
    !max.is_some_and(|max| price > max)
}

fn keyword_match(record: &ListingRecord, keywords: &[String]) -> bool {
    let text = format!("{} {}", record.title, record.description).to_lowercase();
    keywords
        .iter()
        .any(|keyword| text.contains(keyword.to_lowercase().as_str()))
}

fn statistics(records: &[ListingRecord], criteria: &FilterCriteria) -> FilterStats {
    let mut stats = FilterStats {
        total: records.len(),
        ..FilterStats::default()
    };

    for record in records {
        if record.price.is_some() {
            stats.with_price += 1;
        }
        if !record.location_raw.is_empty() {
            stats.with_location += 1;
        }
        if record.contact.is_some() {
            stats.with_contact += 1;
        }
        if let Some(sector) = sector_match(record, &criteria.sectors) {
            *stats.by_sector.entry(sector.to_owned()).or_default() += 1;
        }
        if let Some(department) = record.department.as_deref() {
            *stats.by_department.entry(department.to_owned()).or_default() += 1;
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(title: &str, description: &str, location: &str, price: Option<u64>) -> ListingRecord {
        let id = crate::extract::identity_hash(title, location, "");
        ListingRecord {
            id,
            title: title.to_owned(),
            description: description.to_owned(),
            sector: None,
            location_raw: location.to_owned(),
            postal_code: patterns::POSTAL_CODE
                .find(location)
                .map(|m| m.as_str().to_owned()),
            department: patterns::POSTAL_CODE
                .find(location)
                .map(|m| m.as_str()[..2].to_owned()),
            price_raw: price.map(|p| format!("{p} €")),
            price,
            date_raw: None,
            date: None,
            reference: "ref-test".to_owned(),
            detail_url: None,
            contact: None,
            source_url: "http://site.test/annonces".to_owned(),
            confidence: 0.5,
        }
    }

    fn tech_idf_criteria() -> FilterCriteria {
        FilterCriteria {
            sectors: vec!["informatique".to_owned()],
            departments: vec!["75".to_owned(), "92".to_owned()],
            min_price: Some(50_000),
            max_price: Some(500_000),
            include_keywords: Vec::new(),
            exclude_keywords: Vec::new(),
        }
    }

    fn sample_records() -> Vec<ListingRecord> {
        vec![
            record(
                "Société de services informatique",
                "ESN parisienne, 12 salariés",
                "75008 Paris",
                Some(200_000),
            ),
            record(
                "Conseil informatique et data",
                "Cabinet en croissance",
                "92100 Boulogne-Billancourt",
                Some(300_000),
            ),
            record(
                "Développement informatique",
                "Studio logiciel",
                "13001 Marseille",
                Some(100_000),
            ),
            record(
                "Boulangerie artisanale",
                "Clientèle fidèle",
                "75011 Paris",
                Some(120_000),
            ),
            record("Garage automobile", "Atelier équipé", "69003 Lyon", Some(80_000)),
        ]
    }

    #[test]
    fn and_across_categories_or_within() {
        let result = apply(&sample_records(), &tech_idf_criteria()).unwrap();

        assert_eq!(result.records.len(), 2);
        assert_eq!(result.records[0].department.as_deref(), Some("75"));
        assert_eq!(result.records[1].department.as_deref(), Some("92"));
        assert_eq!(result.stats.by_department.get("75"), Some(&1));
        assert_eq!(result.stats.by_department.get("92"), Some(&1));
        assert_eq!(result.stats.total, 2);

        for explanation in &result.explanations {
            assert!(explanation.matched.contains(&PredicateKind::Sector));
            assert!(explanation.matched.contains(&PredicateKind::Region));
            assert!(explanation.matched.contains(&PredicateKind::Price));
        }
    }

    #[test]
    fn apply_is_idempotent_and_order_preserving() {
        let records = sample_records();
        let criteria = tech_idf_criteria();
        let once = apply(&records, &criteria).unwrap();
        let twice = apply(&once.records, &criteria).unwrap();

        let ids_once: Vec<&str> = once.records.iter().map(|r| r.id.as_str()).collect();
        let ids_twice: Vec<&str> = twice.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids_once, ids_twice);

        // Output is a subsequence of the input.
        let input_ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let mut cursor = 0;
        for id in &ids_once {
            let found = input_ids[cursor..]
                .iter()
                .position(|candidate| candidate == id)
                .expect("output record present in input");
            cursor += found + 1;
        }
    }

    #[test]
    fn absent_price_is_not_exclusionary() {
        let records = vec![record(
            "Agence informatique",
            "Prix non communiqué",
            "75002 Paris",
            None,
        )];
        let result = apply(&records, &tech_idf_criteria()).unwrap();
        assert_eq!(result.records.len(), 1);
    }

    #[test]
    fn region_name_fallback_without_postal_code() {
        let records = vec![record(
            "Cabinet informatique",
            "Conseil",
            "Hauts-de-Seine",
            Some(100_000),
        )];
        let result = apply(&records, &tech_idf_criteria()).unwrap();
        assert_eq!(result.records.len(), 1);
    }

    #[test]
    fn missing_location_fails_an_enabled_region_predicate() {
        let records = vec![record("Studio informatique", "SaaS", "", Some(100_000))];
        let result = apply(&records, &tech_idf_criteria()).unwrap();
        assert!(result.records.is_empty());
    }

    #[test]
    fn exclude_wins_over_include() {
        let criteria = FilterCriteria {
            sectors: Vec::new(),
            departments: Vec::new(),
            min_price: None,
            max_price: None,
            include_keywords: vec!["logiciel".to_owned()],
            exclude_keywords: vec!["liquidation".to_owned()],
        };
        let records = vec![
            record("Éditeur logiciel", "Rentable", "75001", Some(1)),
            record("Éditeur logiciel", "En liquidation", "75002", Some(1)),
        ];
        let result = apply(&records, &criteria).unwrap();
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].description, "Rentable");
    }

    #[test]
    fn disabled_categories_are_vacuously_true() {
        let criteria = FilterCriteria {
            sectors: Vec::new(),
            departments: Vec::new(),
            min_price: None,
            max_price: None,
            include_keywords: Vec::new(),
            exclude_keywords: Vec::new(),
        };
        let records = sample_records();
        let result = apply(&records, &criteria).unwrap();
        assert_eq!(result.records.len(), records.len());
    }

    #[test]
    fn inverted_price_bounds_are_rejected_upfront() {
        let criteria = FilterCriteria {
            min_price: Some(500_000),
            max_price: Some(50_000),
            ..FilterCriteria::default()
        };
        assert!(matches!(
            apply(&sample_records(), &criteria),
            Err(FilterError::PriceBounds { .. })
        ));
    }
}
