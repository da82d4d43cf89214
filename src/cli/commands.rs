use anyhow::{Result, Context};
use tracing::{info, warn};
use crawlpool::config::{CrawlerConfig, QueueBackendKind};
use crawlpool::crawler::{Crawler, Dispatcher, RunReport};
use crawlpool::http::{ContentKind, Response, XPathValue};
use crawlpool::storage::open_queue;
use std::path::PathBuf;

/// Name of the parser used by the `crawl` command
const SUMMARY_PARSER: &str = "summary";

/// Command line overrides for the crawler settings
pub struct CrawlOverrides {
    pub concurrency: Option<usize>,
    pub max_tries: Option<u32>,
    pub timeout_ms: Option<u64>,
    pub distributed: bool,
}

/// Load a named profile, or the default configuration
fn load_config(profile: Option<&str>) -> Result<CrawlerConfig> {
    match profile {
        Some(profile) => CrawlerConfig::load_profile(profile)
            .with_context(|| format!("Failed to load profile: {}", profile)),
        None => CrawlerConfig::load_default(),
    }
}

/// Log the title and link count of a page, the entry count of a feed, or the top-level keys of a JSON document
fn summarize(response: Response, _dispatcher: Dispatcher) -> Result<()> {
    match response.kind() {
        ContentKind::Json => {
            let keys: Vec<String> = match response.json()?.as_object() {
                Some(object) => object.keys().cloned().collect(),
                None => Vec::new(),
            };
            info!("[SUMMARY] {} JSON keys: {}", response.url(), keys.join(", "));
        }
        ContentKind::Xml => {
            // RSS items and Atom entries, whatever their namespace
            let entries = match response.xpath("count(//*[local-name()='item' or local-name()='entry'])")? {
                XPathValue::Number(count) => count as usize,
                _ => 0,
            };
            info!("[SUMMARY] {} feed entries: {}", response.url(), entries);
        }
        ContentKind::Html => {
            let title = response
                .select("title")?
                .first()
                .map(|title| title.text().collect::<String>().trim().to_string())
                .unwrap_or_default();
            let links = response.select("a[href]")?.len();
            info!("[SUMMARY] {} title: {:?}, links: {}", response.url(), title, links);
        }
    }

    Ok(())
}

fn print_report(report: &RunReport) {
    println!("{}", report);
    if !report.failed.is_empty() {
        println!("Failed URLs:");
        let mut failed: Vec<&String> = report.failed.iter().collect();
        failed.sort();
        for url in failed {
            println!("  - {}", url);
        }
    }
}

/// Crawl the given URLs with the summary parser
pub async fn crawl(urls: Vec<String>, profile: Option<String>, overrides: CrawlOverrides) -> Result<()> {
    // Load the configuration
    let mut config = load_config(profile.as_deref())?;

    // Override configuration with command line parameters if provided
    if let Some(concurrency) = overrides.concurrency {
        config.crawler.concurrency = concurrency;
    }
    if let Some(max_tries) = overrides.max_tries {
        config.crawler.max_tries = max_tries;
    }
    if let Some(timeout_ms) = overrides.timeout_ms {
        config.crawler.timeout_ms = timeout_ms;
    }
    if overrides.distributed {
        config.queue.backend = QueueBackendKind::Redis;
    }

    let crawler = Crawler::new("crawl", config)?.sync_parser(SUMMARY_PARSER, summarize);

    let report = crawler
        .run(|dispatcher| async move {
            dispatcher.get(urls).parser(SUMMARY_PARSER).send().await?;
            Ok::<(), anyhow::Error>(())
        })
        .await?;

    print_report(&report);
    Ok(())
}

/// Download a single URL
pub async fn download(url: String, dir: Option<PathBuf>, filename: Option<String>, profile: Option<String>) -> Result<()> {
    let config = load_config(profile.as_deref())?;
    let dir = dir.unwrap_or_else(|| config.download.save_dir.clone());

    let crawler = Crawler::new("download", config)?;
    let report = crawler
        .run(|dispatcher| async move {
            let mut task = dispatcher.download(url, dir);
            if let Some(filename) = filename {
                task = task.filename(filename);
            }
            task.send().await?;
            Ok::<(), anyhow::Error>(())
        })
        .await?;

    print_report(&report);
    Ok(())
}

/// Show the size and outstanding count of the configured Redis frontier
pub async fn queue_status(profile: Option<String>) -> Result<()> {
    let mut config = load_config(profile.as_deref())?;
    if config.queue.backend != QueueBackendKind::Redis {
        warn!("Configured queue backend is local; inspecting the Redis frontier anyway");
        config.queue.backend = QueueBackendKind::Redis;
    }

    let queue = open_queue(&config.queue)?;
    let size = queue.size().await.context("Failed to read frontier size")?;
    let outstanding = queue.outstanding().await.context("Failed to read outstanding count")?;
    queue.close().await?;

    println!("Frontier: {}", config.queue.name);
    println!("Queued: {}", size);
    println!("Outstanding: {}", outstanding);

    Ok(())
}

/// List all available configuration profiles
pub fn list_profiles() -> Result<()> {
    let profiles = CrawlerConfig::list_profiles()?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Manage a specific configuration profile
pub fn manage_profile(profile_name: String) -> Result<()> {
    // Load the profile if it exists
    match CrawlerConfig::load_profile(&profile_name) {
        Ok(config) => {
            // Display the configuration
            println!("Profile: {}", profile_name);
            println!("{:#?}", config);
        },
        Err(_) => {
            // Profile doesn't exist, create a new one
            warn!("Profile '{}' does not exist. Creating a default profile.", profile_name);
            let config = CrawlerConfig::default();
            config.save_as_profile(&profile_name)?;
            println!("Created default profile: {}", profile_name);
        }
    }

    Ok(())
}

/// Show the current configuration
pub fn show_config() -> Result<()> {
    let config = CrawlerConfig::load_default()?;
    println!("Current configuration:");
    println!("{:#?}", config);

    Ok(())
}
