//! Heuristic, per-page structure inference.
//!
//! Instead of fixed per-site adapters, each page is inspected for its largest
//! repeating sibling structure (table rows, list items or card blocks) and a
//! locator is scored for every logical field inside a representative item.
//! Classification is re-run every time a page is processed; descriptors are
//! never cached across content versions.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::formats::{
    ContainerKind, ContainerLocator, FieldLocators, Pagination, StructureDescriptor,
};
use crate::patterns;

static ANCHOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("anchor selector"));
static TABLE_ROW: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("tr").expect("tr selector"));

/// Tags considered for card-block grouping.
const CARD_TAGS: &[&str] = &["div", "article", "section"];

/// Tags whose short text can carry a title.
const HEADING_TAGS: &[&str] = &["h1", "h2", "h3", "h4", "strong", "b"];

/// Tags whose long text can carry a description.
const TEXT_BLOCK_TAGS: &[&str] = &["p", "div", "td", "span", "li"];

#[derive(Debug, Clone)]
struct ContainerCandidate {
    kind: ContainerKind,
    path: Vec<usize>,
    count: usize,
    item_tag: String,
    item_class: Option<String>,
}

impl ContainerCandidate {
    fn kind_rank(&self) -> u8 {
        match self.kind {
            ContainerKind::Table => 0,
            ContainerKind::List => 1,
            ContainerKind::Card => 2,
        }
    }
}

/// Infer a structure descriptor for a page. Pages without a repeating sibling
/// structure of at least `min_items` items get an empty descriptor with
/// confidence 0.
pub fn classify(html: &str, page_url: &Url, min_items: usize) -> StructureDescriptor {
    let doc = Html::parse_document(html);
    let root = doc.root_element();

    let Some(best) = find_repeating_container(root, min_items) else {
        return StructureDescriptor::empty();
    };

    let locator = ContainerLocator {
        kind: best.kind,
        path: best.path.clone(),
        item_tag: best.item_tag.clone(),
        item_class: best.item_class.clone(),
    };
    let Some(container) = resolve_path(root, &locator.path) else {
        return StructureDescriptor::empty();
    };

    let items = container_items(container, &locator);
    let fields = infer_field_locators(&items);

    // Tables and lists are strong listing evidence; anonymous card groups
    // (no shared class) are weak.
    let listing_like = match best.kind {
        ContainerKind::Table | ContainerKind::List => true,
        ContainerKind::Card => best.item_class.is_some(),
    };
    let located_fraction = fields.located_count() as f64 / FieldLocators::FIELD_COUNT as f64;
    let confidence = located_fraction * if listing_like { 1.0 } else { 0.3 };

    StructureDescriptor {
        container: Some(locator),
        item_count: best.count,
        fields,
        pagination: detect_pagination(&doc, page_url),
        confidence,
    }
}

/// Cheap check used by the crawl discovery strategy: does the page hold a
/// repeating block pattern whose text carries prices or postal codes?
pub fn looks_like_listing(html: &str, min_items: usize) -> bool {
    let doc = Html::parse_document(html);
    let root = doc.root_element();
    let Some(best) = find_repeating_container(root, min_items) else {
        return false;
    };
    let locator = ContainerLocator {
        kind: best.kind,
        path: best.path,
        item_tag: best.item_tag,
        item_class: best.item_class,
    };
    let Some(container) = resolve_path(root, &locator.path) else {
        return false;
    };
    container_items(container, &locator)
        .iter()
        .take(5)
        .any(|item| {
            let text = element_text(*item);
            patterns::PRICE_HINT.is_match(&text) || patterns::POSTAL_CODE.is_match(&text)
        })
}

/// Re-detect the "next" pagination link on a fetched successor page.
pub fn find_next_link(html: &str, page_url: &Url) -> Option<Url> {
    let doc = Html::parse_document(html);
    find_next_href(&doc, page_url)
}

fn find_repeating_container(root: ElementRef<'_>, min_items: usize) -> Option<ContainerCandidate> {
    let mut elements = Vec::new();
    let mut path = Vec::new();
    walk_with_paths(root, &mut path, &mut elements);
    // The root element itself can host card groups (rarely, but cheap to
    // include).
    elements.insert(0, (Vec::new(), root));

    let mut best: Option<ContainerCandidate> = None;
    for (path, el) in &elements {
        for candidate in container_candidates(*el, path) {
            if candidate.count < min_items {
                continue;
            }
            let better = match &best {
                None => true,
                Some(current) => {
                    candidate.count > current.count
                        || (candidate.count == current.count
                            && candidate.kind_rank() < current.kind_rank())
                }
            };
            if better {
                best = Some(candidate);
            }
        }
    }
    best
}

fn container_candidates(el: ElementRef<'_>, path: &[usize]) -> Vec<ContainerCandidate> {
    let mut out = Vec::new();
    let tag = el.value().name();

    if tag == "table" {
        let rows = el.select(&TABLE_ROW).filter(|row| is_data_row(*row)).count();
        out.push(ContainerCandidate {
            kind: ContainerKind::Table,
            path: path.to_vec(),
            count: rows,
            item_tag: "tr".to_owned(),
            item_class: None,
        });
    }

    if tag == "ul" || tag == "ol" {
        let items = child_elements(el)
            .filter(|child| child.value().name() == "li")
            .count();
        out.push(ContainerCandidate {
            kind: ContainerKind::List,
            path: path.to_vec(),
            count: items,
            item_tag: "li".to_owned(),
            item_class: None,
        });
    }

    // Card blocks: sibling div/article/section children sharing a tag/class
    // signature under this common ancestor.
    let mut groups: BTreeMap<(String, Option<String>), usize> = BTreeMap::new();
    for child in child_elements(el) {
        let child_tag = child.value().name();
        if !CARD_TAGS.contains(&child_tag) {
            continue;
        }
        let class = child.value().classes().next().map(str::to_owned);
        *groups.entry((child_tag.to_owned(), class)).or_default() += 1;
    }
    for ((item_tag, item_class), count) in groups {
        out.push(ContainerCandidate {
            kind: ContainerKind::Card,
            path: path.to_vec(),
            count,
            item_tag,
            item_class,
        });
    }

    out
}

/// The repeating items under a resolved container.
pub fn container_items<'a>(
    container: ElementRef<'a>,
    locator: &ContainerLocator,
) -> Vec<ElementRef<'a>> {
    match locator.kind {
        ContainerKind::Table => container
            .select(&TABLE_ROW)
            .filter(|row| is_data_row(*row))
            .collect(),
        ContainerKind::List => child_elements(container)
            .filter(|child| child.value().name() == "li")
            .collect(),
        ContainerKind::Card => child_elements(container)
            .filter(|child| {
                child.value().name() == locator.item_tag
                    && child.value().classes().next().map(str::to_owned) == locator.item_class
            })
            .collect(),
    }
}

/// A table row qualifies as an item when it has data cells and no header
/// cells.
fn is_data_row(row: ElementRef<'_>) -> bool {
    let mut has_td = false;
    for cell in child_elements(row) {
        match cell.value().name() {
            "th" => return false,
            "td" => has_td = true,
            _ => {}
        }
    }
    has_td
}

#[derive(Default)]
struct FieldBest {
    title: Option<(f64, Vec<usize>)>,
    description: Option<(f64, Vec<usize>)>,
    price: Option<(f64, Vec<usize>)>,
    location: Option<(f64, Vec<usize>)>,
    date: Option<(f64, Vec<usize>)>,
    reference: Option<(f64, Vec<usize>)>,
    contact: Option<(f64, Vec<usize>)>,
    detail_link: Option<(f64, Vec<usize>)>,
}

fn consider(slot: &mut Option<(f64, Vec<usize>)>, score: f64, path: &[usize]) {
    let better = match slot {
        None => true,
        Some((current, _)) => score > *current,
    };
    if better {
        *slot = Some((score, path.to_vec()));
    }
}

/// Score candidate sub-elements across up to three representative items and
/// keep the best-scoring position per field.
fn infer_field_locators(items: &[ElementRef<'_>]) -> FieldLocators {
    let mut best = FieldBest::default();

    for item in items.iter().take(3) {
        let mut descendants = vec![(Vec::new(), *item)];
        let mut path = Vec::new();
        walk_with_paths(*item, &mut path, &mut descendants);

        for (order, (path, el)) in descendants.iter().enumerate() {
            score_element(&mut best, path, *el, order);
        }
    }

    FieldLocators {
        title: best.title.map(|(_, path)| path),
        description: best.description.map(|(_, path)| path),
        price: best.price.map(|(_, path)| path),
        location: best.location.map(|(_, path)| path),
        date: best.date.map(|(_, path)| path),
        reference: best.reference.map(|(_, path)| path),
        contact: best.contact.map(|(_, path)| path),
        detail_link: best.detail_link.map(|(_, path)| path),
    }
}

fn score_element(best: &mut FieldBest, path: &[usize], el: ElementRef<'_>, order: usize) {
    let tag = el.value().name();

    if tag == "a" {
        if let Some(href) = el.value().attr("href") {
            if href.starts_with("mailto:") {
                consider(&mut best.contact, 150.0, path);
            } else if !href.is_empty() && !href.starts_with('#') {
                consider(&mut best.detail_link, 1000.0 - order as f64, path);
            }
        }
    }

    let text = own_text(el);
    if text.is_empty() {
        return;
    }
    let len = text.chars().count() as f64;

    let price_like = patterns::PRICE_HINT.is_match(&text);
    let postal_like = patterns::POSTAL_CODE.is_match(&text);
    let date_like =
        patterns::DATE_NUMERIC.is_match(&text) || patterns::DATE_TEXTUAL.is_match(&text);

    // Title: the shortest prominent heading-like or link-text element, with a
    // weak fallback on plain cells that do not look like another field.
    if len >= 3.0 && len <= 200.0 {
        if HEADING_TAGS.contains(&tag) {
            consider(&mut best.title, 200.0 / len, path);
        } else if tag == "a" {
            consider(&mut best.title, 120.0 / len, path);
        } else if !price_like && !postal_like && !date_like {
            consider(&mut best.title, 10.0 / len, path);
        }
    }

    // Description: the longest plain-text block.
    if len >= 30.0 && TEXT_BLOCK_TAGS.contains(&tag) {
        consider(&mut best.description, len, path);
    }

    if price_like && len <= 60.0 {
        consider(&mut best.price, 100.0 / len, path);
    }
    if postal_like && len <= 100.0 {
        consider(&mut best.location, 100.0 / len, path);
    }
    if date_like && len <= 60.0 {
        consider(&mut best.date, 100.0 / len, path);
    }

    if patterns::REFERENCE_LABELLED.is_match(&text) && len <= 80.0 {
        consider(&mut best.reference, 200.0 / len, path);
    } else if patterns::REFERENCE_CODE.is_match(&text) && len <= 40.0 {
        consider(&mut best.reference, 60.0 / len, path);
    }

    if (patterns::EMAIL.is_match(&text) || patterns::PHONE.is_match(&text)) && len <= 100.0 {
        consider(&mut best.contact, 100.0 / len, path);
    }
}

fn detect_pagination(doc: &Html, page_url: &Url) -> Pagination {
    if let Some(next) = find_next_href(doc, page_url) {
        return Pagination::NextLink {
            url: next.to_string(),
        };
    }

    // Numbered page links: anchors with integer text whose URLs share one
    // template once the number is substituted out.
    let mut by_template: BTreeMap<String, Vec<u32>> = BTreeMap::new();
    for anchor in doc.select(&ANCHOR) {
        let text = element_text(anchor);
        let Ok(page) = text.parse::<u32>() else {
            continue;
        };
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Ok(absolute) = page_url.join(href) else {
            continue;
        };
        let absolute = absolute.to_string();
        let digits = page.to_string();
        let Some(pos) = absolute.rfind(&digits) else {
            continue;
        };
        let template = format!(
            "{}{{page}}{}",
            &absolute[..pos],
            &absolute[pos + digits.len()..]
        );
        by_template.entry(template).or_default().push(page);
    }

    let numbered = by_template
        .into_iter()
        .filter(|(_, pages)| pages.len() >= 2)
        .max_by_key(|(_, pages)| pages.len());
    if let Some((template, pages)) = numbered {
        let min = pages.iter().copied().min().unwrap_or(1);
        let max = pages.iter().copied().max().unwrap_or(1);
        return Pagination::PageIndex { template, min, max };
    }

    Pagination::SinglePage
}

fn find_next_href(doc: &Html, page_url: &Url) -> Option<Url> {
    for anchor in doc.select(&ANCHOR) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
            continue;
        }

        let rel_next = anchor
            .value()
            .attr("rel")
            .is_some_and(|rel| rel.to_ascii_lowercase().contains("next"));
        let class_next = anchor
            .value()
            .classes()
            .any(|class| class.to_ascii_lowercase().contains("next"));
        let text = element_text(anchor).to_lowercase();
        let text_next = patterns::NEXT_LINK_LEXICON
            .iter()
            .any(|word| text == *word || text.starts_with(&format!("{word} ")));

        if rel_next || class_next || text_next {
            if let Ok(absolute) = page_url.join(href) {
                return Some(absolute);
            }
        }
    }
    None
}

pub fn child_elements<'a>(el: ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> {
    el.children().filter_map(ElementRef::wrap)
}

/// Follow a child-element index path down from `root`.
pub fn resolve_path<'a>(root: ElementRef<'a>, path: &[usize]) -> Option<ElementRef<'a>> {
    let mut current = root;
    for &index in path {
        current = child_elements(current).nth(index)?;
    }
    Some(current)
}

fn walk_with_paths<'a>(
    root: ElementRef<'a>,
    path: &mut Vec<usize>,
    out: &mut Vec<(Vec<usize>, ElementRef<'a>)>,
) {
    for (index, child) in child_elements(root).enumerate() {
        path.push(index);
        out.push((path.clone(), child));
        walk_with_paths(child, path, out);
        path.pop();
    }
}

/// Text directly inside an element, excluding descendant elements, collapsed.
fn own_text(el: ElementRef<'_>) -> String {
    let mut out = String::new();
    for child in el.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
        }
    }
    collapse_ws(&out)
}

/// Full subtree text of an element, collapsed.
pub fn element_text(el: ElementRef<'_>) -> String {
    collapse_ws(&el.text().collect::<String>())
}

pub fn collapse_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
