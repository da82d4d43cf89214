pub mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log debug events from the crawler
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl URLs and log a summary of every page
    Crawl {
        /// URLs to start from
        #[arg(required = true)]
        urls: Vec<String>,

        /// Site profile to use instead of the default configuration
        #[arg(short, long)]
        profile: Option<String>,

        /// Number of concurrent workers
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Attempts per request
        #[arg(short, long)]
        max_tries: Option<u32>,

        /// Per-attempt timeout in milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        /// Share the frontier through Redis
        #[arg(short, long)]
        distributed: bool,
    },

    /// Download one URL to disk
    Download {
        /// URL to download
        #[arg(required = true)]
        url: String,

        /// Directory to save into (defaults to the configured save_dir)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// File name (defaults to the last URL path segment)
        #[arg(short, long)]
        filename: Option<String>,

        /// Site profile to use instead of the default configuration
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Show the size of the shared Redis frontier
    Queue {
        /// Site profile to use instead of the default configuration
        #[arg(short, long)]
        profile: Option<String>,
    },

    /// Manage configuration profiles
    Config {
        /// Profile name to manage
        #[arg(required = false)]
        profile: Option<String>,

        /// List all available profiles
        #[arg(short, long)]
        list: bool,
    },
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Crawl { urls, profile, concurrency, max_tries, timeout_ms, distributed } => {
            info!("Starting crawl of {} URLs", urls.len());
            let overrides = commands::CrawlOverrides { concurrency, max_tries, timeout_ms, distributed };
            commands::crawl(urls, profile, overrides).await
        },
        Commands::Download { url, dir, filename, profile } => {
            info!("Downloading {}", url);
            commands::download(url, dir, filename, profile).await
        },
        Commands::Queue { profile } => {
            commands::queue_status(profile).await
        },
        Commands::Config { profile, list } => {
            if list {
                info!("Listing all configuration profiles");
                commands::list_profiles()
            } else if let Some(profile_name) = profile {
                info!("Managing configuration profile: {}", profile_name);
                commands::manage_profile(profile_name)
            } else {
                info!("Showing current configuration");
                commands::show_config()
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn test_crawl_arguments() {
        let cli = Cli::try_parse_from([
            "crawler", "crawl", "http://a.test/", "http://b.test/", "-c", "5", "--distributed", "-v",
        ])
        .unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Crawl { urls, concurrency, distributed, .. } => {
                assert_eq!(urls.len(), 2);
                assert_eq!(concurrency, Some(5));
                assert!(distributed);
            }
            _ => panic!("expected crawl command"),
        }
    }
}
