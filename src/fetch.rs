use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, USER_AGENT};
use url::Url;

const DEFAULT_USER_AGENT: &str = "cessionscout/0.1";

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request failed for {url}: {message}")]
    Transport { url: String, message: String },
    #[error("timed out fetching {url}")]
    Timeout { url: String },
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    /// URL after redirects, e.g. for resolving relative links.
    pub final_url: Url,
    pub body: String,
}

/// The fetch collaborator. The core never sees transport details beyond
/// status/final URL/body; a scripted-browser implementation can be slotted in
/// behind this trait for JavaScript-heavy sites.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &Url, timeout: Duration) -> Result<FetchResponse, FetchError>;
}

/// Plain reqwest-backed fetcher.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &Url, timeout: Duration) -> Result<FetchResponse, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .header(USER_AGENT, DEFAULT_USER_AGENT)
            .header(ACCEPT, "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .header(ACCEPT_LANGUAGE, "fr-FR,fr;q=0.9,en;q=0.7")
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    FetchError::Timeout {
                        url: url.to_string(),
                    }
                } else {
                    FetchError::Transport {
                        url: url.to_string(),
                        message: err.to_string(),
                    }
                }
            })?;

        let status = response.status().as_u16();
        let final_url = response.url().clone();
        let body = response.text().await.map_err(|err| FetchError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        })?;

        Ok(FetchResponse {
            status,
            final_url,
            body,
        })
    }
}

/// Bounded-attempt retry with exponential backoff between attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Per-host politeness gate: strictly one in-flight request per host with an
/// enforced minimum delay between consecutive requests to the same host.
/// The outer map lock is never held across an await; only the per-host slot
/// mutex is, so distinct hosts do not serialize through each other.
pub struct HostGate {
    delay: Duration,
    hosts: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Option<Instant>>>>>,
}

impl HostGate {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    async fn admit(&self, host: &str) {
        let slot = {
            let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(hosts.entry(host.to_owned()).or_default())
        };
        let mut last = slot.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.delay {
                tokio::time::sleep(self.delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Fetcher + gate + retry policy bundled for the pipeline: every page
/// download goes through [`FetchSession::get`].
pub struct FetchSession {
    fetcher: Arc<dyn Fetcher>,
    gate: HostGate,
    policy: RetryPolicy,
    timeout: Duration,
}

impl FetchSession {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        delay: Duration,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            gate: HostGate::new(delay),
            policy,
            timeout,
        }
    }

    /// Fetch a page, retrying transport errors and non-2xx statuses with
    /// exponential backoff. Returns the last error once attempts run out.
    pub async fn get(&self, url: &Url) -> Result<FetchResponse, FetchError> {
        let host = url.host_str().unwrap_or_default().to_owned();
        let mut last_error = FetchError::Transport {
            url: url.to_string(),
            message: "no fetch attempt made".to_owned(),
        };

        for attempt in 0..self.policy.attempts.max(1) {
            if attempt > 0 {
                let backoff = self.policy.backoff * 2u32.saturating_pow(attempt - 1);
                tracing::debug!(%url, attempt, ?backoff, "retrying fetch");
                tokio::time::sleep(backoff).await;
            }
            self.gate.admit(&host).await;

            match self.fetcher.fetch(url, self.timeout).await {
                Ok(response) if (200..300).contains(&response.status) => return Ok(response),
                Ok(response) => {
                    last_error = FetchError::Status {
                        status: response.status,
                        url: url.to_string(),
                    };
                }
                Err(err) => last_error = err,
            }
        }

        Err(last_error)
    }
}

/// Normalize a URL for visited-set deduplication: fragment stripped, trailing
/// slash trimmed, query pairs sorted.
pub fn normalize_url(url: &Url) -> Url {
    let mut normalized = url.clone();
    normalized.set_fragment(None);

    let mut pairs: Vec<(String, String)> = normalized
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        normalized.set_query(None);
    } else {
        pairs.sort();
        let query = pairs
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{k}={v}")
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        normalized.set_query(Some(&query));
    }

    let mut path = normalized.path().to_owned();
    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    normalized.set_path(&path);
    normalized
}

impl FetchError {
    /// Whether the failure looks like deliberate blocking rather than an
    /// outage, used to mark sites blocked vs errored.
    pub fn is_blocked(&self) -> bool {
        matches!(
            self,
            FetchError::Status {
                status: 401 | 403 | 429,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakyFetcher {
        remaining_failures: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl Fetcher for FlakyFetcher {
        async fn fetch(&self, url: &Url, _timeout: Duration) -> Result<FetchResponse, FetchError> {
            use std::sync::atomic::Ordering;
            let remaining = self.remaining_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(FetchError::Transport {
                    url: url.to_string(),
                    message: "connection reset".to_owned(),
                });
            }
            Ok(FetchResponse {
                status: 200,
                final_url: url.clone(),
                body: "<html></html>".to_owned(),
            })
        }
    }

    struct ForbiddenFetcher;

    #[async_trait]
    impl Fetcher for ForbiddenFetcher {
        async fn fetch(&self, url: &Url, _timeout: Duration) -> Result<FetchResponse, FetchError> {
            Ok(FetchResponse {
                status: 403,
                final_url: url.clone(),
                body: String::new(),
            })
        }
    }

    fn session(fetcher: Arc<dyn Fetcher>, attempts: u32) -> FetchSession {
        FetchSession::new(
            fetcher,
            Duration::ZERO,
            RetryPolicy {
                attempts,
                backoff: Duration::from_millis(1),
            },
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn retries_transport_errors_then_succeeds() {
        let fetcher = Arc::new(FlakyFetcher {
            remaining_failures: std::sync::atomic::AtomicU32::new(2),
        });
        let session = session(fetcher, 3);
        let url = Url::parse("http://example.test/annonces").unwrap();
        let response = session.get(&url).await.unwrap();
        assert_eq!(response.status, 200);
    }

    #[test]
    fn normalize_url_strips_fragment_and_sorts_query() {
        let url = Url::parse("http://site.test/annonces/?b=2&a=1#liste").unwrap();
        assert_eq!(
            normalize_url(&url).as_str(),
            "http://site.test/annonces?a=1&b=2"
        );

        let bare = Url::parse("http://site.test/").unwrap();
        assert_eq!(normalize_url(&bare).as_str(), "http://site.test/");
    }

    #[tokio::test]
    async fn forbidden_status_exhausts_attempts() {
        let session = session(Arc::new(ForbiddenFetcher), 3);
        let url = Url::parse("http://example.test/").unwrap();
        let err = session.get(&url).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 403, .. }));
        assert!(err.is_blocked());
    }
}
