use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One input site, as produced by the directory-lookup collaborator or a
/// hand-written seeds file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteSeed {
    pub name: String,
    pub site_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department_code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteStatus {
    Reachable,
    Blocked,
    Error,
    NoListingPage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryStrategy {
    Nav,
    Keyword,
    Crawl,
}

/// A page suspected, not confirmed, to contain listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub url: String,
    pub score: f64,
    pub strategies: Vec<DiscoveryStrategy>,
}

/// Discovery output for one site, one line of `sites.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteReport {
    pub seed: SiteSeed,
    pub status: SiteStatus,
    pub candidates: Vec<Candidate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerKind {
    Table,
    List,
    Card,
}

/// Where the repeating items live inside a classified page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerLocator {
    pub kind: ContainerKind,
    /// Child-element index path from the document root element.
    pub path: Vec<usize>,
    pub item_tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_class: Option<String>,
}

/// Child-element index paths from the item root, one per logical field.
/// `None` means no locator was inferred; extraction then leaves the field
/// empty rather than rejecting the record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldLocators {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<Vec<usize>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<Vec<usize>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<Vec<usize>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Vec<usize>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<Vec<usize>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<Vec<usize>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<Vec<usize>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail_link: Option<Vec<usize>>,
}

impl FieldLocators {
    pub const FIELD_COUNT: usize = 8;

    pub fn located_count(&self) -> usize {
        [
            self.title.is_some(),
            self.description.is_some(),
            self.price.is_some(),
            self.location.is_some(),
            self.date.is_some(),
            self.reference.is_some(),
            self.contact.is_some(),
            self.detail_link.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Pagination {
    SinglePage,
    /// A "next" link was found; successor pages re-detect their own.
    NextLink { url: String },
    /// Numbered page links sharing one URL template.
    PageIndex { template: String, min: u32, max: u32 },
}

/// Inferred schema for locating fields within a page's repeating blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructureDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerLocator>,
    pub item_count: usize,
    pub fields: FieldLocators,
    pub pagination: Pagination,
    pub confidence: f64,
}

impl StructureDescriptor {
    /// Descriptor for a page with no repeating structure.
    pub fn empty() -> Self {
        Self {
            container: None,
            item_count: 0,
            fields: FieldLocators::default(),
            pagination: Pagination::SinglePage,
            confidence: 0.0,
        }
    }
}

/// Classification output for one candidate page, one line of
/// `descriptors.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageDescriptor {
    pub site_url: String,
    pub page_url: String,
    pub descriptor: StructureDescriptor,
}

/// One normalized business-sale announcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingRecord {
    /// Stable hash of normalized title + location + price. Two records with
    /// the same id are the same listing.
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
    pub location_raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_raw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date_raw: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
    pub reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    pub source_url: String,
    pub confidence: f64,
}

/// Immutable per-invocation filter configuration, loadable from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterCriteria {
    pub sectors: Vec<String>,
    pub departments: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_price: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_price: Option<u64>,
    pub include_keywords: Vec<String>,
    pub exclude_keywords: Vec<String>,
}

impl Default for FilterCriteria {
    /// The original target profile: technology-sector businesses in
    /// Île-de-France, no price bounds.
    fn default() -> Self {
        Self {
            sectors: [
                "informatique",
                "data",
                "conseil",
                "numérique",
                "digital",
                "technologie",
                "software",
                "logiciel",
                "saas",
                "cloud",
                "cybersécurité",
                "intelligence artificielle",
                "machine learning",
                "développement",
                "web",
                "consulting",
            ]
            .into_iter()
            .map(str::to_owned)
            .collect(),
            departments: ["75", "77", "78", "91", "92", "93", "94", "95"]
                .into_iter()
                .map(str::to_owned)
                .collect(),
            min_price: None,
            max_price: None,
            include_keywords: Vec::new(),
            exclude_keywords: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredicateKind {
    Sector,
    Region,
    Price,
    Include,
    Exclude,
}

/// Which enabled predicate categories a surviving record matched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchExplanation {
    pub record_id: String,
    pub matched: Vec<PredicateKind>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterStats {
    pub total: usize,
    pub with_price: usize,
    pub with_location: usize,
    pub with_contact: usize,
    pub by_sector: BTreeMap<String, usize>,
    pub by_department: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterResult {
    pub records: Vec<ListingRecord>,
    pub explanations: Vec<MatchExplanation>,
    pub stats: FilterStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Discover,
    Classify,
    Extract,
    Filter,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Discover => "discover",
            Phase::Classify => "classify",
            Phase::Extract => "extract",
            Phase::Filter => "filter",
        }
    }
}

/// Which phases of a run have completed, and where their artifacts live.
/// Enables `--skip-discover` / `--skip-classify` resumption.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseState {
    pub completed: Vec<Phase>,
    pub artifacts: BTreeMap<Phase, String>,
}

impl PhaseState {
    pub fn is_completed(&self, phase: Phase) -> bool {
        self.completed.contains(&phase)
    }

    pub fn mark_completed(&mut self, phase: Phase, artifact: String) {
        if !self.is_completed(phase) {
            self.completed.push(phase);
        }
        self.artifacts.insert(phase, artifact);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteOutcome {
    Ok,
    NoListingPage,
    Failed,
}

/// Per-site line of the final run report, so "no listings exist" can be told
/// apart from "site was not analyzable".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteRunSummary {
    pub name: String,
    pub site_url: String,
    pub outcome: SiteOutcome,
    pub candidate_pages: usize,
    pub records: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub sites: Vec<SiteRunSummary>,
    pub raw_records: usize,
    pub filtered_records: usize,
}
