//! Candidate listing-page discovery.
//!
//! Three independent strategies run against a site and their results are
//! merged: a navigation scan, a keyword-density scan of the home page and its
//! one-hop neighbours, and a bounded same-domain crawl. A strategy whose
//! fetches all fail contributes zero candidates without aborting the others.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::LazyLock;

use scraper::{Html, Selector};
use url::Url;

use crate::classify;
use crate::fetch::{FetchSession, normalize_url};
use crate::formats::{Candidate, DiscoveryStrategy, SiteStatus};
use crate::patterns;

static NAV_ANCHORS: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"nav a[href], header a[href], [class*="nav"] a[href], [class*="menu"] a[href]"#)
        .expect("nav anchor selector")
});
static ANCHORS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("anchor selector"));

#[derive(Debug, Clone)]
pub struct DiscoverConfig {
    /// Lowercased listing-intent keywords, merged with configured synonyms.
    pub lexicon: Vec<String>,
    /// Minimum keyword density for the keyword-scan strategy.
    pub keyword_threshold: f64,
    /// One-hop pages examined by the keyword scan.
    pub keyword_scan_pages: usize,
    pub crawl_depth: u32,
    pub crawl_max_pages: usize,
    /// Repeating-sibling threshold forwarded to the listing-shape check.
    pub min_items: usize,
}

impl Default for DiscoverConfig {
    fn default() -> Self {
        Self {
            lexicon: patterns::LISTING_LEXICON
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
            keyword_threshold: 0.01,
            keyword_scan_pages: 10,
            crawl_depth: 3,
            crawl_max_pages: 20,
            min_items: 3,
        }
    }
}

#[derive(Debug)]
pub struct Discovery {
    pub status: SiteStatus,
    pub candidates: Vec<Candidate>,
    pub error: Option<String>,
}

/// Discover candidate listing pages on one site. An unreachable home page
/// marks the site blocked or errored; an empty merged result marks it
/// "no listing page found" rather than an error.
pub async fn discover(site_url: &Url, session: &FetchSession, cfg: &DiscoverConfig) -> Discovery {
    let home = match session.get(site_url).await {
        Ok(response) => response,
        Err(err) => {
            let status = if err.is_blocked() {
                SiteStatus::Blocked
            } else {
                SiteStatus::Error
            };
            return Discovery {
                status,
                candidates: Vec::new(),
                error: Some(err.to_string()),
            };
        }
    };
    let base = home.final_url.clone();

    // Pages fetched once and shared between the keyword scan and the crawl.
    // `None` records a fetch failure so it is not retried by the other
    // strategy.
    let mut cache: HashMap<String, Option<(Url, String)>> = HashMap::new();
    cache.insert(
        normalize_url(&base).to_string(),
        Some((base.clone(), home.body.clone())),
    );

    let mut merged: BTreeMap<String, Candidate> = BTreeMap::new();

    for (url, score) in nav_scan(&home.body, &base, &cfg.lexicon) {
        merge(&mut merged, &url, DiscoveryStrategy::Nav, score);
    }
    for (url, score) in keyword_scan(&home.body, &base, session, &mut cache, cfg).await {
        merge(&mut merged, &url, DiscoveryStrategy::Keyword, score);
    }
    for (url, score) in crawl_scan(&home.body, &base, session, &mut cache, cfg).await {
        merge(&mut merged, &url, DiscoveryStrategy::Crawl, score);
    }

    let mut candidates: Vec<Candidate> = merged.into_values().collect();
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.strategies.cmp(&b.strategies))
            .then_with(|| a.url.cmp(&b.url))
    });

    let status = if candidates.is_empty() {
        SiteStatus::NoListingPage
    } else {
        SiteStatus::Reachable
    };
    Discovery {
        status,
        candidates,
        error: None,
    }
}

fn merge(merged: &mut BTreeMap<String, Candidate>, url: &Url, strategy: DiscoveryStrategy, score: f64) {
    let key = normalize_url(url).to_string();
    let candidate = merged.entry(key.clone()).or_insert_with(|| Candidate {
        url: key,
        score,
        strategies: Vec::new(),
    });
    if score > candidate.score {
        candidate.score = score;
    }
    if !candidate.strategies.contains(&strategy) {
        candidate.strategies.push(strategy);
        candidate.strategies.sort();
    }
}

/// Strategy 1: links in navigation/menu areas whose text or URL path matches
/// the listing lexicon. Rank is the position in navigation, earlier higher.
fn nav_scan(html: &str, base: &Url, lexicon: &[String]) -> Vec<(Url, f64)> {
    let doc = Html::parse_document(html);
    let mut seen = Vec::new();
    let mut anchors = Vec::new();

    for anchor in doc.select(&NAV_ANCHORS) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Ok(url) = base.join(href) else {
            continue;
        };
        if url.scheme() != "http" && url.scheme() != "https" {
            continue;
        }
        let key = normalize_url(&url).to_string();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        anchors.push((url, classify::element_text(anchor).to_lowercase()));
    }

    let total = anchors.len().max(1) as f64;
    anchors
        .into_iter()
        .enumerate()
        .filter(|(_, (url, text))| {
            let path = url.path().to_lowercase();
            lexicon
                .iter()
                .any(|word| text.contains(word.as_str()) || path.contains(word.as_str()))
        })
        .map(|(position, (url, _))| (url, 1.0 - position as f64 / total))
        .collect()
}

/// Strategy 2: keyword density over the home page body and its one-hop
/// same-host neighbours. Rank is the density itself, capped at 1.
async fn keyword_scan(
    home_body: &str,
    base: &Url,
    session: &FetchSession,
    cache: &mut HashMap<String, Option<(Url, String)>>,
    cfg: &DiscoverConfig,
) -> Vec<(Url, f64)> {
    let mut pages = vec![(base.clone(), home_body.to_owned())];

    let one_hop: Vec<Url> = page_links(home_body, base, true)
        .into_iter()
        .take(cfg.keyword_scan_pages)
        .collect();
    for url in one_hop {
        if let Some((final_url, body)) = fetch_cached(session, cache, &url).await {
            pages.push((final_url, body));
        }
    }

    let mut out = Vec::new();
    for (url, body) in pages {
        let density = keyword_density(&body, &cfg.lexicon);
        if density >= cfg.keyword_threshold {
            out.push((url, density.min(1.0)));
        }
    }
    out
}

/// Strategy 3: breadth-first same-domain crawl, depth- and page-capped, that
/// nominates pages with repeating blocks carrying prices or postal codes.
/// Rank is the inverse crawl depth.
async fn crawl_scan(
    home_body: &str,
    base: &Url,
    session: &FetchSession,
    cache: &mut HashMap<String, Option<(Url, String)>>,
    cfg: &DiscoverConfig,
) -> Vec<(Url, f64)> {
    let mut out = Vec::new();
    let mut examined = vec![normalize_url(base).to_string()];
    let mut queue: VecDeque<(Url, u32)> = VecDeque::new();
    let mut pages = 1usize;

    if classify::looks_like_listing(home_body, cfg.min_items) {
        out.push((base.clone(), 1.0));
    }
    for url in page_links(home_body, base, true) {
        queue.push_back((url, 1));
    }

    while let Some((url, depth)) = queue.pop_front() {
        if pages >= cfg.crawl_max_pages || depth > cfg.crawl_depth {
            break;
        }
        let key = normalize_url(&url).to_string();
        if examined.contains(&key) {
            continue;
        }
        examined.push(key);

        let Some((final_url, body)) = fetch_cached(session, cache, &url).await else {
            continue;
        };
        pages += 1;

        if classify::looks_like_listing(&body, cfg.min_items) {
            out.push((final_url.clone(), 1.0 / (depth + 1) as f64));
        }
        if depth < cfg.crawl_depth {
            for link in page_links(&body, &final_url, true) {
                queue.push_back((link, depth + 1));
            }
        }
    }

    out
}

async fn fetch_cached(
    session: &FetchSession,
    cache: &mut HashMap<String, Option<(Url, String)>>,
    url: &Url,
) -> Option<(Url, String)> {
    let key = normalize_url(url).to_string();
    if let Some(cached) = cache.get(&key) {
        return cached.clone();
    }
    let entry = match session.get(url).await {
        Ok(response) => Some((response.final_url, response.body)),
        Err(err) => {
            tracing::debug!(%url, %err, "discovery fetch failed");
            None
        }
    };
    cache.insert(key, entry.clone());
    entry
}

/// Unique normalized http(s) links of a page, in document order.
fn page_links(html: &str, base: &Url, same_host_only: bool) -> Vec<Url> {
    let doc = Html::parse_document(html);
    let mut seen = Vec::new();
    let mut out = Vec::new();

    for anchor in doc.select(&ANCHORS) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        if href.starts_with('#') || href.starts_with("mailto:") || href.starts_with("javascript:") {
            continue;
        }
        let Ok(url) = base.join(href) else {
            continue;
        };
        if url.scheme() != "http" && url.scheme() != "https" {
            continue;
        }
        if same_host_only && url.host_str() != base.host_str() {
            continue;
        }
        let key = normalize_url(&url).to_string();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        out.push(url);
    }
    out
}

fn keyword_density(html: &str, lexicon: &[String]) -> f64 {
    let doc = Html::parse_document(html);
    let text = doc
        .root_element()
        .text()
        .collect::<String>()
        .to_lowercase();
    let words = text.split_whitespace().count().max(1);
    let occurrences: usize = lexicon
        .iter()
        .map(|word| text.matches(word.as_str()).count())
        .sum();
    occurrences as f64 / words as f64
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::fetch::{FetchError, FetchResponse, Fetcher, RetryPolicy};

    /// Serves a fixed set of pages by path; everything else is a 404.
    struct FixedSite {
        pages: HashMap<&'static str, &'static str>,
    }

    #[async_trait]
    impl Fetcher for FixedSite {
        async fn fetch(&self, url: &Url, _timeout: Duration) -> Result<FetchResponse, FetchError> {
            match self.pages.get(url.path()) {
                Some(body) => Ok(FetchResponse {
                    status: 200,
                    final_url: url.clone(),
                    body: (*body).to_owned(),
                }),
                None => Err(FetchError::Status {
                    status: 404,
                    url: url.to_string(),
                }),
            }
        }
    }

    fn fixed_session(pages: HashMap<&'static str, &'static str>) -> FetchSession {
        FetchSession::new(
            Arc::new(FixedSite { pages }),
            Duration::ZERO,
            RetryPolicy {
                attempts: 1,
                backoff: Duration::from_millis(1),
            },
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn candidate_ranking_is_deterministic() {
        let pages = HashMap::from([
            (
                "/",
                r#"<html><body><nav>
                    <a href="/annonces">Nos annonces</a>
                    <a href="/cessions">Cessions en cours</a>
                    <a href="/contact">Contact</a>
                </nav></body></html>"#,
            ),
            (
                "/annonces",
                r#"<html><body><table>
                    <tr><td>Vente fonds de commerce Paris</td><td>150 000 &euro;</td></tr>
                    <tr><td>Cession boulangerie Lyon</td><td>95 000 &euro;</td></tr>
                    <tr><td>Reprise restaurant Lille</td><td>120 000 &euro;</td></tr>
                    <tr><td>Vente garage Nantes</td><td>80 000 &euro;</td></tr>
                </table></body></html>"#,
            ),
            (
                "/cessions",
                r#"<html><body><p>cession vente annonce reprise cession
                    vente fonds annonce cession reprise</p></body></html>"#,
            ),
            ("/contact", r#"<html><body><p>Nous contacter</p></body></html>"#),
        ]);

        let session = fixed_session(pages);
        let cfg = DiscoverConfig::default();
        let site = Url::parse("http://site.test/").unwrap();

        let first = discover(&site, &session, &cfg).await;
        let second = discover(&site, &session, &cfg).await;

        assert_eq!(first.status, SiteStatus::Reachable);
        assert!(first.candidates.len() >= 2, "nav and keyword hits expected");
        assert_eq!(
            serde_json::to_string(&first.candidates).unwrap(),
            serde_json::to_string(&second.candidates).unwrap(),
            "identical input must produce the identical ranked list"
        );
    }

    #[test]
    fn nav_scan_ranks_earlier_links_higher() {
        let html = r#"<html><body><nav>
            <a href="/annonces">Nos annonces</a>
            <a href="/equipe">Équipe</a>
            <a href="/cessions">Cessions en cours</a>
        </nav></body></html>"#;
        let base = Url::parse("http://site.test/").unwrap();
        let lexicon: Vec<String> = patterns::LISTING_LEXICON
            .iter()
            .map(|s| (*s).to_owned())
            .collect();
        let found = nav_scan(html, &base, &lexicon);

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].0.path(), "/annonces");
        assert_eq!(found[1].0.path(), "/cessions");
        assert!(found[0].1 > found[1].1);
    }

    #[test]
    fn nav_scan_matches_url_path_keywords() {
        let html = r#"<html><body><div class="main-menu">
            <a href="/ventes-en-cours">Consulter</a>
        </div></body></html>"#;
        let base = Url::parse("http://site.test/").unwrap();
        let found = nav_scan(html, &base, &["vente".to_owned(), "ventes".to_owned()]);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn keyword_density_counts_lexicon_occurrences() {
        let html = "<html><body><p>cession vente cession annonce</p></body></html>";
        let density = keyword_density(html, &["cession".to_owned(), "vente".to_owned()]);
        assert!(density > 0.5);
    }

    #[test]
    fn page_links_are_deduplicated_and_scoped() {
        let html = r#"<html><body>
            <a href="/a">A</a>
            <a href="/a#section">A encore</a>
            <a href="http://autre.test/b">Externe</a>
            <a href="mailto:x@y.fr">Mail</a>
        </body></html>"#;
        let base = Url::parse("http://site.test/").unwrap();
        let links = page_links(html, &base, true);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].path(), "/a");
    }
}
