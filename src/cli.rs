use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::discover::DiscoverConfig;
use crate::fetch::RetryPolicy;
use crate::pipeline::PipelineConfig;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run all phases: discover, classify, extract, filter.
    Run(RunArgs),
    /// Discover candidate listing pages for each seed site.
    Discover(CommonArgs),
    /// Classify the structure of discovered candidate pages.
    Classify(CommonArgs),
    /// Extract normalized records from classified pages.
    Extract(CommonArgs),
    /// Filter extracted records against the criteria file.
    Filter(CommonArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Reuse a persisted `sites.jsonl` instead of re-discovering.
    #[arg(long)]
    pub skip_discover: bool,

    /// Reuse a persisted `records.jsonl`; only re-run filtering.
    #[arg(long)]
    pub skip_classify: bool,
}

#[derive(Debug, Args)]
pub struct CommonArgs {
    /// Seed sites file (JSONL, one site per line).
    #[arg(long, default_value = "seeds.jsonl")]
    pub seeds: PathBuf,

    /// Workspace directory for artifacts.
    #[arg(long, default_value = "workspace")]
    pub out: PathBuf,

    /// Filter criteria file (YAML). Defaults to the built-in profile.
    #[arg(long)]
    pub criteria: Option<PathBuf>,

    /// Attempts per request, including the first.
    #[arg(long, default_value_t = 3)]
    pub max_retries: u32,

    /// Delay before each same-host request (politeness).
    #[arg(long, default_value_t = 1000)]
    pub delay_ms: u64,

    /// Base retry backoff, doubled per attempt.
    #[arg(long, default_value_t = 500)]
    pub backoff_ms: u64,

    /// Per-request timeout.
    #[arg(long, default_value_t = 20)]
    pub timeout_secs: u64,

    /// Budget for one site before it is marked failed.
    #[arg(long, default_value_t = 300)]
    pub site_timeout_secs: u64,

    /// Distinct sites processed concurrently.
    #[arg(long, default_value_t = 1)]
    pub parallel: usize,

    /// Maximum link depth for the fallback crawl strategy.
    #[arg(long, default_value_t = 3)]
    pub crawl_depth: u32,

    /// Maximum pages fetched by the fallback crawl strategy.
    #[arg(long, default_value_t = 20)]
    pub crawl_max_pages: usize,

    /// Repeating blocks required before a page counts as a listing.
    #[arg(long, default_value_t = 3)]
    pub min_items: usize,

    /// Descriptors below this confidence are not extracted.
    #[arg(long, default_value_t = 0.2)]
    pub min_confidence: f64,

    /// Candidate pages classified per site.
    #[arg(long, default_value_t = 3)]
    pub max_candidates: usize,

    /// Pagination pages followed per candidate page.
    #[arg(long, default_value_t = 10)]
    pub max_pages: usize,
}

impl CommonArgs {
    pub fn pipeline_config(&self, skip_discover: bool, skip_classify: bool) -> PipelineConfig {
        let discover = DiscoverConfig {
            crawl_depth: self.crawl_depth,
            crawl_max_pages: self.crawl_max_pages,
            min_items: self.min_items,
            ..DiscoverConfig::default()
        };
        PipelineConfig {
            seeds: self.seeds.clone(),
            out: self.out.clone(),
            criteria: self.criteria.clone(),
            skip_discover,
            skip_classify,
            parallel_sites: self.parallel,
            request_delay: Duration::from_millis(self.delay_ms),
            request_timeout: Duration::from_secs(self.timeout_secs),
            site_timeout: Duration::from_secs(self.site_timeout_secs),
            retry: RetryPolicy {
                attempts: self.max_retries,
                backoff: Duration::from_millis(self.backoff_ms),
            },
            discover,
            max_candidates: self.max_candidates,
            min_confidence: self.min_confidence,
            max_pages: self.max_pages,
        }
    }
}
