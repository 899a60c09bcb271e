use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser as _;

use cessionscout::fetch::{Fetcher, HttpFetcher};

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    cessionscout::logging::init().context("init logging")?;

    let cli = cessionscout::cli::Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new().context("build http client")?);

    match cli.command {
        cessionscout::cli::Command::Run(args) => {
            let cfg = args
                .common
                .pipeline_config(args.skip_discover, args.skip_classify);
            cessionscout::pipeline::run(&cfg, fetcher)
                .await
                .context("run")?;
        }
        cessionscout::cli::Command::Discover(args) => {
            let cfg = args.pipeline_config(false, false);
            cessionscout::pipeline::run_discover(&cfg, fetcher)
                .await
                .context("discover")?;
        }
        cessionscout::cli::Command::Classify(args) => {
            let cfg = args.pipeline_config(false, false);
            cessionscout::pipeline::run_classify(&cfg, fetcher)
                .await
                .context("classify")?;
        }
        cessionscout::cli::Command::Extract(args) => {
            let cfg = args.pipeline_config(false, false);
            cessionscout::pipeline::run_extract(&cfg, fetcher)
                .await
                .context("extract")?;
        }
        cessionscout::cli::Command::Filter(args) => {
            let cfg = args.pipeline_config(false, false);
            cessionscout::pipeline::run_filter(&cfg).await.context("filter")?;
        }
    }

    Ok(())
}
