//! Four-phase orchestration: DISCOVER → CLASSIFY → EXTRACT → FILTER.
//!
//! Each phase persists its artifact before the next starts, so a run can
//! resume with `--skip-discover` / `--skip-classify`. No error on one site
//! aborts the others; only configuration errors (unreadable seeds, invalid
//! criteria) are fatal to the whole run.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use url::Url;

use crate::discover::{self, DiscoverConfig};
use crate::fetch::{self, FetchSession, Fetcher, RetryPolicy};
use crate::filter;
use crate::formats::{
    ListingRecord, PageDescriptor, Phase, RunReport, SiteOutcome, SiteReport, SiteRunSummary,
    SiteStatus,
};
use crate::store::{self, Workspace};
use crate::{classify, extract};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub seeds: PathBuf,
    pub out: PathBuf,
    pub criteria: Option<PathBuf>,
    pub skip_discover: bool,
    /// Skips both CLASSIFY and EXTRACT, reloading persisted records.
    pub skip_classify: bool,
    /// Distinct sites processed in parallel; same-host requests still
    /// serialize through the per-host gate.
    pub parallel_sites: usize,
    pub request_delay: Duration,
    pub request_timeout: Duration,
    pub site_timeout: Duration,
    pub retry: RetryPolicy,
    pub discover: DiscoverConfig,
    /// Candidate pages classified per site, best-ranked first.
    pub max_candidates: usize,
    /// Descriptors below this confidence are logged and skipped.
    pub min_confidence: f64,
    /// Pagination cap per candidate page.
    pub max_pages: usize,
}

impl PipelineConfig {
    pub fn session(&self, fetcher: Arc<dyn Fetcher>) -> Arc<FetchSession> {
        Arc::new(FetchSession::new(
            fetcher,
            self.request_delay,
            self.retry,
            self.request_timeout,
        ))
    }
}

/// Run the full pipeline. Returns the final run report, which is also
/// persisted to the workspace.
pub async fn run(cfg: &PipelineConfig, fetcher: Arc<dyn Fetcher>) -> anyhow::Result<RunReport> {
    let workspace = Workspace::create(&cfg.out)?;
    let mut state = workspace.load_state()?;
    let session = cfg.session(fetcher);

    let reports: Vec<SiteReport> = if cfg.skip_discover {
        if !state.is_completed(Phase::Discover) {
            anyhow::bail!("no completed discovery to resume from; run without --skip-discover");
        }
        store::read_jsonl(&workspace.sites_path()).context("load persisted discovery")?
    } else {
        let reports = discover_phase(cfg, &session).await?;
        store::write_jsonl(&workspace.sites_path(), &reports)?;
        state.mark_completed(
            Phase::Discover,
            workspace.sites_path().to_string_lossy().to_string(),
        );
        workspace.save_state(&state)?;
        reports
    };

    let (records, site_counts): (Vec<ListingRecord>, BTreeMap<String, usize>) =
        if cfg.skip_classify {
            if !state.is_completed(Phase::Extract) {
                anyhow::bail!("no completed extraction to resume from; run without --skip-classify");
            }
            let records =
                store::read_jsonl(&workspace.records_path()).context("load persisted records")?;
            let site_counts = resumed_site_counts(&workspace, &reports, &records);
            (records, site_counts)
        } else {
            let descriptors = classify_phase(cfg, &session, &reports).await?;
            store::write_jsonl(&workspace.descriptors_path(), &descriptors)?;
            state.mark_completed(
                Phase::Classify,
                workspace.descriptors_path().to_string_lossy().to_string(),
            );
            workspace.save_state(&state)?;

            let (records, site_counts) =
                extract_phase(cfg, &session, &descriptors, &workspace).await?;
            state.mark_completed(
                Phase::Extract,
                workspace.records_path().to_string_lossy().to_string(),
            );
            workspace.save_state(&state)?;
            (records, site_counts)
        };

    let criteria = store::load_criteria(cfg.criteria.as_deref())?;
    let result = filter::apply(&records, &criteria).context("apply filter criteria")?;
    store::write_json_pretty(&workspace.filtered_path(), &result)?;
    state.mark_completed(
        Phase::Filter,
        workspace.filtered_path().to_string_lossy().to_string(),
    );
    workspace.save_state(&state)?;

    let report = build_report(&reports, &records, &site_counts, result.records.len());
    store::write_json_pretty(&workspace.report_path(), &report)?;
    tracing::info!(
        sites = report.sites.len(),
        raw = report.raw_records,
        filtered = report.filtered_records,
        "run complete"
    );
    Ok(report)
}

/// Standalone DISCOVER: seeds in, `sites.jsonl` out.
pub async fn run_discover(cfg: &PipelineConfig, fetcher: Arc<dyn Fetcher>) -> anyhow::Result<()> {
    let workspace = Workspace::create(&cfg.out)?;
    let mut state = workspace.load_state()?;
    let session = cfg.session(fetcher);
    let reports = discover_phase(cfg, &session).await?;
    store::write_jsonl(&workspace.sites_path(), &reports)?;
    state.mark_completed(
        Phase::Discover,
        workspace.sites_path().to_string_lossy().to_string(),
    );
    workspace.save_state(&state)
}

/// Standalone CLASSIFY: `sites.jsonl` in, `descriptors.jsonl` out.
pub async fn run_classify(cfg: &PipelineConfig, fetcher: Arc<dyn Fetcher>) -> anyhow::Result<()> {
    let workspace = Workspace::create(&cfg.out)?;
    let mut state = workspace.load_state()?;
    let reports: Vec<SiteReport> =
        store::read_jsonl(&workspace.sites_path()).context("load discovery artifact")?;
    let session = cfg.session(fetcher);
    let descriptors = classify_phase(cfg, &session, &reports).await?;
    store::write_jsonl(&workspace.descriptors_path(), &descriptors)?;
    state.mark_completed(
        Phase::Classify,
        workspace.descriptors_path().to_string_lossy().to_string(),
    );
    workspace.save_state(&state)
}

/// Standalone EXTRACT: `descriptors.jsonl` in, `records.jsonl` out.
pub async fn run_extract(cfg: &PipelineConfig, fetcher: Arc<dyn Fetcher>) -> anyhow::Result<()> {
    let workspace = Workspace::create(&cfg.out)?;
    let mut state = workspace.load_state()?;
    let descriptors: Vec<PageDescriptor> =
        store::read_jsonl(&workspace.descriptors_path()).context("load structure artifact")?;
    let session = cfg.session(fetcher);
    extract_phase(cfg, &session, &descriptors, &workspace).await?;
    state.mark_completed(
        Phase::Extract,
        workspace.records_path().to_string_lossy().to_string(),
    );
    workspace.save_state(&state)
}

/// Standalone FILTER: `records.jsonl` in, `filtered.json` out. Cheap enough
/// to re-run with different criteria against the same extraction.
pub async fn run_filter(cfg: &PipelineConfig) -> anyhow::Result<()> {
    let workspace = Workspace::create(&cfg.out)?;
    let mut state = workspace.load_state()?;
    let records: Vec<ListingRecord> =
        store::read_jsonl(&workspace.records_path()).context("load records artifact")?;
    let criteria = store::load_criteria(cfg.criteria.as_deref())?;
    let result = filter::apply(&records, &criteria).context("apply filter criteria")?;
    tracing::info!(
        total = records.len(),
        kept = result.records.len(),
        "filter complete"
    );
    store::write_json_pretty(&workspace.filtered_path(), &result)?;
    state.mark_completed(
        Phase::Filter,
        workspace.filtered_path().to_string_lossy().to_string(),
    );
    workspace.save_state(&state)
}

/// DISCOVER: find candidate listing pages per seed site.
pub async fn discover_phase(
    cfg: &PipelineConfig,
    session: &Arc<FetchSession>,
) -> anyhow::Result<Vec<SiteReport>> {
    let seeds = store::load_seeds(&cfg.seeds)?;
    let semaphore = Arc::new(Semaphore::new(cfg.parallel_sites.max(1)));
    let mut tasks = JoinSet::new();

    for (index, seed) in seeds.into_iter().enumerate() {
        let session = Arc::clone(session);
        let semaphore = Arc::clone(&semaphore);
        let discover_cfg = cfg.discover.clone();
        let site_timeout = cfg.site_timeout;

        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let report = match Url::parse(&seed.site_url) {
                Err(err) => SiteReport {
                    status: SiteStatus::Error,
                    candidates: Vec::new(),
                    error: Some(format!("invalid site url: {err}")),
                    seed,
                },
                Ok(url) => {
                    let outcome = tokio::time::timeout(
                        site_timeout,
                        discover::discover(&url, &session, &discover_cfg),
                    )
                    .await;
                    match outcome {
                        Ok(discovery) => {
                            tracing::info!(
                                site = %seed.site_url,
                                status = ?discovery.status,
                                candidates = discovery.candidates.len(),
                                "discovery finished"
                            );
                            SiteReport {
                                status: discovery.status,
                                candidates: discovery.candidates,
                                error: discovery.error,
                                seed,
                            }
                        }
                        Err(_) => {
                            tracing::warn!(site = %seed.site_url, "discovery timed out");
                            SiteReport {
                                status: SiteStatus::Error,
                                candidates: Vec::new(),
                                error: Some("site timed out".to_owned()),
                                seed,
                            }
                        }
                    }
                }
            };
            (index, report)
        });
    }

    let mut indexed = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        indexed.push(joined.context("discovery task panicked")?);
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, report)| report).collect())
}

/// CLASSIFY: infer a structure descriptor for each candidate page.
pub async fn classify_phase(
    cfg: &PipelineConfig,
    session: &Arc<FetchSession>,
    reports: &[SiteReport],
) -> anyhow::Result<Vec<PageDescriptor>> {
    let semaphore = Arc::new(Semaphore::new(cfg.parallel_sites.max(1)));
    let mut tasks = JoinSet::new();

    for (index, report) in reports.iter().enumerate() {
        if report.status != SiteStatus::Reachable {
            continue;
        }
        let session = Arc::clone(session);
        let semaphore = Arc::clone(&semaphore);
        let site_url = report.seed.site_url.clone();
        let candidates: Vec<String> = report
            .candidates
            .iter()
            .take(cfg.max_candidates)
            .map(|c| c.url.clone())
            .collect();
        let min_items = cfg.discover.min_items;
        let min_confidence = cfg.min_confidence;

        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let mut descriptors = Vec::new();
            for candidate in candidates {
                let Ok(url) = Url::parse(&candidate) else {
                    continue;
                };
                let response = match session.get(&url).await {
                    Ok(response) => response,
                    Err(err) => {
                        tracing::warn!(page = %candidate, %err, "candidate page fetch failed");
                        continue;
                    }
                };
                let descriptor =
                    classify::classify(&response.body, &response.final_url, min_items);
                if descriptor.confidence < min_confidence {
                    tracing::info!(
                        page = %candidate,
                        confidence = descriptor.confidence,
                        "low-confidence classification"
                    );
                }
                descriptors.push(PageDescriptor {
                    site_url: site_url.clone(),
                    page_url: response.final_url.to_string(),
                    descriptor,
                });
            }
            (index, descriptors)
        });
    }

    let mut indexed = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        indexed.push(joined.context("classify task panicked")?);
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed
        .into_iter()
        .flat_map(|(_, descriptors)| descriptors)
        .collect())
}

/// EXTRACT: walk each confidently classified page, dedup per site, and append
/// each site's records to the artifact as soon as the site completes, so a
/// crash loses at most the in-flight site.
pub async fn extract_phase(
    cfg: &PipelineConfig,
    session: &Arc<FetchSession>,
    descriptors: &[PageDescriptor],
    workspace: &Workspace,
) -> anyhow::Result<(Vec<ListingRecord>, BTreeMap<String, usize>)> {
    let records_path = workspace.records_path();
    if records_path.exists() {
        std::fs::remove_file(&records_path)
            .with_context(|| format!("reset records artifact: {}", records_path.display()))?;
    }

    // Group pages by site, preserving first-appearance order.
    let mut site_order: Vec<String> = Vec::new();
    let mut by_site: HashMap<String, Vec<PageDescriptor>> = HashMap::new();
    for descriptor in descriptors {
        if !by_site.contains_key(&descriptor.site_url) {
            site_order.push(descriptor.site_url.clone());
        }
        by_site
            .entry(descriptor.site_url.clone())
            .or_default()
            .push(descriptor.clone());
    }

    let semaphore = Arc::new(Semaphore::new(cfg.parallel_sites.max(1)));
    let mut tasks = JoinSet::new();
    for site_url in site_order {
        let pages = by_site.remove(&site_url).unwrap_or_default();
        let session = Arc::clone(session);
        let semaphore = Arc::clone(&semaphore);
        let min_confidence = cfg.min_confidence;
        let max_pages = cfg.max_pages;
        let site_timeout = cfg.site_timeout;

        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let mut site_records = Vec::new();
            for page in pages {
                if page.descriptor.confidence < min_confidence {
                    tracing::info!(
                        page = %page.page_url,
                        confidence = page.descriptor.confidence,
                        "skipping low-confidence page"
                    );
                    continue;
                }
                let Ok(url) = Url::parse(&page.page_url) else {
                    continue;
                };
                let extracted = tokio::time::timeout(
                    site_timeout,
                    extract::extract(&url, &page.descriptor, &session, max_pages),
                )
                .await;
                match extracted {
                    Ok(Ok(records)) => site_records.extend(records),
                    Ok(Err(err)) => {
                        tracing::warn!(page = %page.page_url, %err, "extraction fetch failed");
                    }
                    Err(_) => {
                        tracing::warn!(page = %page.page_url, "extraction timed out");
                    }
                }
            }
            (site_url, extract::dedup(site_records))
        });
    }

    // Single-writer incremental save, in site completion order.
    let mut all_records = Vec::new();
    let mut site_counts: BTreeMap<String, usize> = BTreeMap::new();
    while let Some(joined) = tasks.join_next().await {
        let (site_url, records) = joined.context("extract task panicked")?;
        tracing::info!(site = %site_url, records = records.len(), "site extracted");
        store::append_jsonl(&records_path, &records)?;
        site_counts.insert(site_url, records.len());
        all_records.extend(records);
    }
    Ok((all_records, site_counts))
}

/// Rebuild per-site record attribution from the persisted descriptors when a
/// run resumes past extraction. Pagination successors are not listed in the
/// descriptors artifact, so records on unknown pages fall back to host match.
fn resumed_site_counts(
    workspace: &Workspace,
    reports: &[SiteReport],
    records: &[ListingRecord],
) -> BTreeMap<String, usize> {
    let descriptors: Vec<PageDescriptor> = if workspace.descriptors_path().exists() {
        store::read_jsonl(&workspace.descriptors_path()).unwrap_or_default()
    } else {
        Vec::new()
    };

    let mut page_to_site: HashMap<String, String> = HashMap::new();
    for descriptor in &descriptors {
        if let Ok(url) = Url::parse(&descriptor.page_url) {
            page_to_site.insert(
                fetch::normalize_url(&url).to_string(),
                descriptor.site_url.clone(),
            );
        }
    }
    let mut host_to_site: HashMap<String, String> = HashMap::new();
    for report in reports {
        if let Ok(url) = Url::parse(&report.seed.site_url) {
            if let Some(host) = url.host_str() {
                host_to_site
                    .entry(host.to_owned())
                    .or_insert_with(|| report.seed.site_url.clone());
            }
        }
    }

    let mut counts = BTreeMap::new();
    for record in records {
        let Ok(url) = Url::parse(&record.source_url) else {
            continue;
        };
        let site = page_to_site
            .get(fetch::normalize_url(&url).as_str())
            .cloned()
            .or_else(|| url.host_str().and_then(|host| host_to_site.get(host).cloned()));
        if let Some(site) = site {
            *counts.entry(site).or_insert(0) += 1;
        }
    }
    counts
}

/// Per-site record counts are keyed by the seed's site URL, never by host.
/// Two seeds sharing a host must not each claim the other's records.
fn build_report(
    reports: &[SiteReport],
    records: &[ListingRecord],
    site_counts: &BTreeMap<String, usize>,
    filtered_count: usize,
) -> RunReport {
    let sites = reports
        .iter()
        .map(|report| {
            let record_count = site_counts
                .get(&report.seed.site_url)
                .copied()
                .unwrap_or(0);
            let outcome = match report.status {
                SiteStatus::Reachable => SiteOutcome::Ok,
                SiteStatus::NoListingPage => SiteOutcome::NoListingPage,
                SiteStatus::Blocked | SiteStatus::Error => SiteOutcome::Failed,
            };
            SiteRunSummary {
                name: report.seed.name.clone(),
                site_url: report.seed.site_url.clone(),
                outcome,
                candidate_pages: report.candidates.len(),
                records: record_count,
                error: report.error.clone(),
            }
        })
        .collect();

    RunReport {
        sites,
        raw_records: records.len(),
        filtered_records: filtered_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::{SiteSeed, StructureDescriptor};

    fn reachable(name: &str, site_url: &str) -> SiteReport {
        SiteReport {
            seed: SiteSeed {
                name: name.to_owned(),
                site_url: site_url.to_owned(),
                department_code: None,
            },
            status: SiteStatus::Reachable,
            candidates: Vec::new(),
            error: None,
        }
    }

    fn record_from(source_url: &str) -> ListingRecord {
        ListingRecord {
            id: "0".repeat(64),
            title: "Cession de fonds".to_owned(),
            description: String::new(),
            sector: None,
            location_raw: "Paris".to_owned(),
            postal_code: None,
            department: None,
            price_raw: None,
            price: None,
            date_raw: None,
            date: None,
            reference: "ref-0".to_owned(),
            detail_url: None,
            contact: None,
            source_url: source_url.to_owned(),
            confidence: 1.0,
        }
    }

    #[test]
    fn report_counts_records_per_site_not_per_host() {
        let reports = vec![
            reachable("ventes", "http://shared.test/ventes"),
            reachable("cessions", "http://shared.test/cessions"),
        ];
        let records = vec![
            record_from("http://shared.test/ventes/annonces"),
            record_from("http://shared.test/ventes/annonces?page=2"),
        ];
        let site_counts = BTreeMap::from([("http://shared.test/ventes".to_owned(), 2)]);

        let report = build_report(&reports, &records, &site_counts, 1);
        assert_eq!(report.sites[0].records, 2);
        assert_eq!(report.sites[1].records, 0);
        assert_eq!(report.raw_records, 2);
        assert_eq!(report.filtered_records, 1);
    }

    #[test]
    fn resumed_counts_follow_descriptor_attribution() {
        let temp = tempfile::TempDir::new().unwrap();
        let workspace = Workspace::create(temp.path().join("ws")).unwrap();
        let descriptors = vec![PageDescriptor {
            site_url: "http://shared.test/ventes".to_owned(),
            page_url: "http://shared.test/annonces".to_owned(),
            descriptor: StructureDescriptor::empty(),
        }];
        store::write_jsonl(&workspace.descriptors_path(), &descriptors).unwrap();

        let reports = vec![
            reachable("ventes", "http://shared.test/ventes"),
            reachable("cessions", "http://shared.test/cessions"),
        ];
        let records = vec![record_from("http://shared.test/annonces")];

        let counts = resumed_site_counts(&workspace, &reports, &records);
        assert_eq!(counts.get("http://shared.test/ventes"), Some(&1));
        assert_eq!(counts.get("http://shared.test/cessions"), None);
    }
}
