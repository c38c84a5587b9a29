use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crawlnet::api::ApiServer;
use crawlnet::collect::{Fetcher, HttpFetcher, LogStorage, Storager, TaskOptions};
use crawlnet::config::Config;
use crawlnet::engine::{builtin, Crawler, TaskRegistry};
use crawlnet::master::{identity, MasterCoordinator};
use crawlnet::store::Cluster;
use crawlnet::Error;

#[derive(Parser)]
#[command(
    name = "crawlnet",
    version,
    about = "Distributed crawler with leader-elected masters and worker pools",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); overrides the config file
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a master and a worker in one process over an in-memory cluster
    Serve,

    /// Crawl the configured seed tasks without coordination
    Crawl {
        /// Crawl this site instead of the configured tasks
        #[arg(short, long)]
        url: Option<String>,

        /// Maximum link depth for --url
        #[arg(long, default_value = "2")]
        max_depth: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    setup_tracing(&config.logging.level, &config.logging.format, cli.verbose)?;

    if let Err(e) = crawlnet::metrics::init_metrics() {
        tracing::warn!(error = %e, "Metrics disabled");
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown requested");
                cancel.cancel();
            }
        });
    }

    let result = match cli.command {
        Commands::Serve => {
            tracing::info!("Starting serve command");
            serve(config, cancel).await
        }
        Commands::Crawl { url, max_depth } => {
            match crawl_target(config, url, max_depth) {
                Ok(config) => {
                    tracing::info!(tasks = config.tasks.len(), "Starting crawl command");
                    crawl(config, cancel).await
                }
                Err(e) => Err(e),
            }
        }
    };

    if let Err(e) = result {
        tracing::error!(
            error = %e,
            category = ?e.category(),
            recoverable = e.is_recoverable(),
            "crawlnet failed"
        );
        return Err(e.into());
    }

    tracing::info!("crawlnet completed successfully");
    Ok(())
}

fn setup_tracing(level: &str, format: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("crawlnet=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_new(format!("crawlnet={level},warn"))
            .context("Invalid log level")?
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

/// Replace the configured tasks with a single site when `--url` is given
fn crawl_target(mut config: Config, url: Option<String>, max_depth: u32) -> crawlnet::Result<Config> {
    let Some(url) = url else {
        return Ok(config);
    };
    let name = crawlnet::utils::extract_domain(&url)
        .ok_or_else(|| Error::config(format!("Invalid crawl url: {url}")))?;
    config.tasks = vec![TaskOptions {
        url,
        max_depth,
        ..TaskOptions::new(name)
    }];
    config.master.seeds.clear();
    config.cluster = false;
    config.validate().map_err(|e| Error::config(e.to_string()))?;
    Ok(config)
}

/// One link-following task per configured entry
fn build_registry(config: &Config) -> crawlnet::Result<TaskRegistry> {
    let mut fetcher = HttpFetcher::new(config.fetch_timeout())?;
    if let Some(agent) = &config.fetcher.user_agent {
        fetcher = fetcher.with_user_agent(agent);
    }
    let fetcher: Arc<dyn Fetcher> = Arc::new(fetcher);
    let storage: Arc<dyn Storager> = Arc::new(LogStorage);

    let mut registry = TaskRegistry::new();
    for options in &config.tasks {
        registry.add(builtin::link_follower(
            options.clone(),
            fetcher.clone(),
            storage.clone(),
        ));
    }
    Ok(registry)
}

async fn crawl(mut config: Config, cancel: CancellationToken) -> crawlnet::Result<()> {
    config.cluster = false;
    let registry = Arc::new(build_registry(&config)?);
    let crawler = Crawler::new(config.crawler_config(), registry);
    crawler.run(None, cancel).await
}

async fn serve(config: Config, cancel: CancellationToken) -> crawlnet::Result<()> {
    let cluster = Cluster::in_memory();

    let ipv4 = identity::local_ipv4().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Falling back to loopback for master identity");
        Ipv4Addr::LOCALHOST
    });
    let master = MasterCoordinator::new(config.master_config(ipv4), &cluster)?;

    let listener = ApiServer::bind(&config.master.http_address).await?;
    let server = ApiServer::new(master.clone(), Duration::from_secs(5))?;

    let registry = Arc::new(build_registry(&config)?);
    let crawler = Crawler::new(config.crawler_config(), registry);

    let master_handle = tokio::spawn(master.run(cancel.clone()));
    let api_handle = tokio::spawn(server.serve(listener, cancel.clone()));

    let crawl_result = crawler.run(Some(cluster), cancel.clone()).await;
    cancel.cancel();

    master_handle
        .await
        .map_err(|e| Error::with_source("Master task panicked", e))?;
    api_handle
        .await
        .map_err(|e| Error::with_source("API task panicked", e))??;
    crawl_result
}
