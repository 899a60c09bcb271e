//! Adaptive extraction: walk a page and its paginated successors per the
//! inferred structure descriptor and produce normalized listing records.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::NaiveDate;
use scraper::{ElementRef, Html};
use sha2::Digest as _;
use url::Url;

use crate::classify;
use crate::fetch::{FetchError, FetchSession, normalize_url};
use crate::formats::{FieldLocators, ListingRecord, Pagination, StructureDescriptor};
use crate::patterns;

/// Walk `page_url` and its paginated successors, bounded by `max_pages`, and
/// extract one record per repeating item. The walk is eagerly materialized
/// into the returned `Vec` before this resolves; `max_pages` caps how many
/// pages it drains. The first page failing to fetch is an error; a mid-walk
/// failure keeps what was already extracted. Records are NOT deduplicated
/// here; callers run [`dedup`] once per site.
pub async fn extract(
    page_url: &Url,
    descriptor: &StructureDescriptor,
    session: &FetchSession,
    max_pages: usize,
) -> Result<Vec<ListingRecord>, FetchError> {
    if descriptor.confidence == 0.0 || descriptor.container.is_none() {
        return Ok(Vec::new());
    }

    let mut queue: VecDeque<Url> = VecDeque::new();
    queue.push_back(page_url.clone());
    if let Pagination::PageIndex { template, min, max } = &descriptor.pagination {
        for index in *min..=*max {
            if let Ok(url) = Url::parse(&template.replace("{page}", &index.to_string())) {
                queue.push_back(url);
            }
        }
    }

    let mut visited: HashSet<String> = HashSet::new();
    let mut records = Vec::new();
    let mut position = 0usize;
    let mut pages_fetched = 0usize;

    while let Some(url) = queue.pop_front() {
        if pages_fetched >= max_pages {
            tracing::debug!(%page_url, max_pages, "pagination cap reached");
            break;
        }
        if !visited.insert(normalize_url(&url).to_string()) {
            continue;
        }

        let response = match session.get(&url).await {
            Ok(response) => response,
            Err(err) if pages_fetched == 0 => return Err(err),
            Err(err) => {
                tracing::warn!(%url, %err, "pagination fetch failed; keeping earlier pages");
                break;
            }
        };
        pages_fetched += 1;

        records.extend(extract_from_html(
            &response.body,
            &response.final_url,
            descriptor,
            &mut position,
        ));

        if matches!(descriptor.pagination, Pagination::NextLink { .. }) {
            if let Some(next) = classify::find_next_link(&response.body, &response.final_url) {
                queue.push_back(next);
            }
        }
    }

    Ok(records)
}

/// Extract records from one already-fetched page. `position` numbers items
/// across the whole pagination walk so synthesized references stay stable.
pub fn extract_from_html(
    html: &str,
    base_url: &Url,
    descriptor: &StructureDescriptor,
    position: &mut usize,
) -> Vec<ListingRecord> {
    let Some(locator) = &descriptor.container else {
        return Vec::new();
    };

    let doc = Html::parse_document(html);
    let root = doc.root_element();
    // Markup may have changed since classification; a missing container
    // yields zero records, not an error.
    let Some(container) = classify::resolve_path(root, &locator.path) else {
        tracing::debug!(%base_url, "descriptor container not found in page");
        return Vec::new();
    };

    let mut records = Vec::new();
    for item in classify::container_items(container, locator) {
        let index = *position;
        *position += 1;
        if let Some(record) =
            build_record(item, base_url, &descriptor.fields, descriptor.confidence, index)
        {
            records.push(record);
        }
    }
    records
}

fn build_record(
    item: ElementRef<'_>,
    base_url: &Url,
    fields: &FieldLocators,
    descriptor_confidence: f64,
    position: usize,
) -> Option<ListingRecord> {
    let field_text = |path: &Option<Vec<usize>>| -> String {
        path.as_deref()
            .and_then(|p| classify::resolve_path(item, p))
            .map(classify::element_text)
            .unwrap_or_default()
    };

    let title = field_text(&fields.title);
    let description = field_text(&fields.description);
    let price_text = field_text(&fields.price);
    let location_raw = field_text(&fields.location);
    let date_text = field_text(&fields.date);
    let reference_text = field_text(&fields.reference);

    let detail_url = fields
        .detail_link
        .as_deref()
        .and_then(|p| classify::resolve_path(item, p))
        .and_then(|el| el.value().attr("href"))
        .and_then(|href| base_url.join(href).ok())
        .map(|url| url.to_string());

    let contact = extract_contact(item, fields);

    let populated = [
        !title.is_empty(),
        !description.is_empty(),
        !price_text.is_empty(),
        !location_raw.is_empty(),
        !date_text.is_empty(),
        !reference_text.is_empty(),
        contact.is_some(),
        detail_url.is_some(),
    ]
    .into_iter()
    .filter(|present| *present)
    .count();
    if populated == 0 {
        return None;
    }

    let price = parse_price(&price_text);
    let price_raw = (!price_text.is_empty()).then_some(price_text);
    let date = parse_date(&date_text);
    let date_raw = (!date_text.is_empty()).then_some(date_text);

    let postal_code = patterns::POSTAL_CODE
        .find(&location_raw)
        .map(|m| m.as_str().to_owned());
    let department = postal_code.as_deref().map(|code| code[..2].to_owned());

    let reference = extract_reference(&reference_text)
        .unwrap_or_else(|| synthesized_reference(base_url, position));

    let confidence =
        descriptor_confidence * populated as f64 / FieldLocators::FIELD_COUNT as f64;

    let id = identity_hash(&title, &location_raw, price_raw.as_deref().unwrap_or_default());

    Some(ListingRecord {
        id,
        title,
        description,
        sector: None,
        location_raw,
        postal_code,
        department,
        price_raw,
        price,
        date_raw,
        date,
        reference,
        detail_url,
        contact,
        source_url: base_url.to_string(),
        confidence,
    })
}

fn extract_contact(item: ElementRef<'_>, fields: &FieldLocators) -> Option<String> {
    let el = fields
        .contact
        .as_deref()
        .and_then(|p| classify::resolve_path(item, p))?;

    if let Some(href) = el.value().attr("href") {
        if let Some(email) = href.strip_prefix("mailto:") {
            return Some(email.to_owned());
        }
    }
    let text = classify::element_text(el);
    if let Some(email) = patterns::EMAIL.find(&text) {
        return Some(email.as_str().to_owned());
    }
    patterns::PHONE.find(&text).map(|m| m.as_str().to_owned())
}

fn extract_reference(text: &str) -> Option<String> {
    if let Some(caps) = patterns::REFERENCE_LABELLED.captures(text) {
        return Some(caps[1].to_owned());
    }
    patterns::REFERENCE_CODE
        .find(text)
        .map(|m| m.as_str().to_owned())
}

/// Stable across re-runs of the same page, not globally unique across sites.
fn synthesized_reference(base_url: &Url, position: usize) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(base_url.as_str().as_bytes());
    hasher.update(position.to_le_bytes());
    let digest = hasher.finalize();
    format!("ref-{}", &hex::encode(digest)[..12])
}

/// Derived listing identity: hash of normalized title + location + raw price.
pub fn identity_hash(title: &str, location: &str, price_raw: &str) -> String {
    let normalized = format!(
        "{}\n{}\n{}",
        classify::collapse_ws(title).to_lowercase(),
        classify::collapse_ws(location).to_lowercase(),
        classify::collapse_ws(price_raw).to_lowercase(),
    );
    let mut hasher = sha2::Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

/// Parse a money amount out of raw text by taking the first digit run and
/// stripping separators. Unparseable text leaves the price numeric absent.
pub fn parse_price(text: &str) -> Option<u64> {
    let run = patterns::NUMBER_RUN.find(text)?;
    let digits: String = run.as_str().chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() || digits.len() > 12 {
        return None;
    }
    digits.parse().ok()
}

const NUMERIC_DATE_FORMATS: &[&str] = &["%d/%m/%Y", "%d-%m-%Y", "%d/%m/%y", "%Y-%m-%d"];

/// Parse a date against the known formats in order; first match wins.
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    if let Some(m) = patterns::DATE_NUMERIC.find(text) {
        for format in NUMERIC_DATE_FORMATS {
            if let Ok(date) = NaiveDate::parse_from_str(m.as_str(), format) {
                return Some(date);
            }
        }
    }
    let caps = patterns::DATE_TEXTUAL.captures(text)?;
    let day: u32 = caps[1].parse().ok()?;
    let month = patterns::french_month(&caps[2])?;
    let year: i32 = caps[3].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Deduplicate by identity hash, keeping the highest-confidence copy of each
/// listing in the slot of its first occurrence. Input order is preserved.
pub fn dedup(records: Vec<ListingRecord>) -> Vec<ListingRecord> {
    let mut first_index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<ListingRecord> = Vec::new();

    for record in records {
        match first_index.get(&record.id) {
            None => {
                first_index.insert(record.id.clone(), out.len());
                out.push(record);
            }
            Some(&index) => {
                if record.confidence > out[index].confidence {
                    out[index] = record;
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::classify;

    fn record(id: &str, confidence: f64) -> ListingRecord {
        ListingRecord {
            id: id.to_owned(),
            title: format!("titre {id}"),
            description: String::new(),
            sector: None,
            location_raw: String::new(),
            postal_code: None,
            department: None,
            price_raw: None,
            price: None,
            date_raw: None,
            date: None,
            reference: "ref-0".to_owned(),
            detail_url: None,
            contact: None,
            source_url: "http://site.test/".to_owned(),
            confidence,
        }
    }

    #[test]
    fn parse_price_handles_french_separators() {
        assert_eq!(parse_price("150 000 €"), Some(150_000));
        assert_eq!(parse_price("Prix : 80.000 euros"), Some(80_000));
        assert_eq!(parse_price("1 250 000,00 €"), Some(1_250_000));
        assert_eq!(parse_price("nous consulter"), None);
        assert_eq!(parse_price(""), None);
    }

    #[test]
    fn parse_date_first_matching_format_wins() {
        assert_eq!(
            parse_date("publié le 12/01/2024"),
            NaiveDate::from_ymd_opt(2024, 1, 12)
        );
        assert_eq!(
            parse_date("15-03-2023"),
            NaiveDate::from_ymd_opt(2023, 3, 15)
        );
        assert_eq!(
            parse_date("1er mars 2023"),
            NaiveDate::from_ymd_opt(2023, 3, 1)
        );
        assert_eq!(parse_date("bientôt"), None);
    }

    #[test]
    fn dedup_keeps_highest_confidence_copy() {
        let records = vec![record("a", 0.4), record("b", 0.9), record("a", 0.8)];
        let deduped = dedup(records);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].id, "a");
        assert_eq!(deduped[0].confidence, 0.8);
        assert_eq!(deduped[1].id, "b");
    }

    #[test]
    fn dedup_never_drops_the_only_copy() {
        let deduped = dedup(vec![record("only", 0.0)]);
        assert_eq!(deduped.len(), 1);
    }

    #[test]
    fn table_page_yields_normalized_records() {
        let html = r#"<html><body><table>
          <tr><th>Titre</th><th>Prix</th><th>Localisation</th><th>Date</th></tr>
          <tr><td>Agence web</td><td>150 000 €</td><td>75008 Paris</td><td>12/01/2024</td></tr>
          <tr><td>Cabinet conseil</td><td>250 000 €</td><td>92100 Boulogne</td><td>15/02/2024</td></tr>
          <tr><td>Studio data</td><td>90 000 €</td><td>69001 Lyon</td><td>01/03/2024</td></tr>
        </table></body></html>"#;
        let url = Url::parse("http://site.test/annonces").unwrap();
        let descriptor = classify(html, &url, 3);
        let mut position = 0;
        let records = extract_from_html(html, &url, &descriptor, &mut position);

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].title, "Agence web");
        assert_eq!(records[0].price, Some(150_000));
        assert_eq!(records[0].postal_code.as_deref(), Some("75008"));
        assert_eq!(records[0].department.as_deref(), Some("75"));
        assert_eq!(
            records[0].date,
            NaiveDate::from_ymd_opt(2024, 1, 12)
        );
        assert_eq!(records[1].department.as_deref(), Some("92"));
        assert!(records.iter().all(|r| r.reference.starts_with("ref-")));
        assert!(records.iter().all(|r| r.confidence > 0.0));
    }

    #[test]
    fn zero_confidence_descriptor_extracts_nothing() {
        let descriptor = StructureDescriptor::empty();
        let url = Url::parse("http://site.test/").unwrap();
        let mut position = 0;
        let records = extract_from_html("<html><body></body></html>", &url, &descriptor, &mut position);
        assert!(records.is_empty());
    }
}
