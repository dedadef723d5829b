use anyhow::{anyhow, bail, Context, Result};
use bridge::{format_size, Category, DownloadEntry, DownloadEvent, DownloadStats};
use clap::Parser;
use engine::{Config, Coordinator};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

/// Powerhouse - watch simulated media downloads run to completion
#[derive(Parser, Debug)]
#[command(name = "powerhouse", version, about)]
struct Args {
    /// JSON config file (tick interval, increments, history, seed)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Drop finished downloads instead of keeping them listed
    #[arg(long)]
    no_history: bool,

    /// Downloads to start; categories: local, youtube, social, torrent, audio.
    /// Runs a small demo set when none are given.
    #[arg(value_name = "CATEGORY:NAME:SIZE_BYTES")]
    downloads: Vec<DownloadRequest>,
}

/// One `<category>:<name>:<size_bytes>` argument
#[derive(Debug, Clone, PartialEq)]
struct DownloadRequest {
    category: Category,
    name: String,
    size_bytes: u64,
}

impl FromStr for DownloadRequest {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let mut parts = raw.splitn(3, ':');
        let (Some(category), Some(name), Some(size)) = (parts.next(), parts.next(), parts.next())
        else {
            bail!("expected <category>:<name>:<size_bytes>, got '{}'", raw);
        };
        Ok(DownloadRequest {
            category: parse_category(category)?,
            name: name.to_string(),
            size_bytes: size
                .parse()
                .with_context(|| format!("invalid size in '{}'", raw))?,
        })
    }
}

fn parse_category(raw: &str) -> Result<Category> {
    Ok(match raw.to_ascii_lowercase().as_str() {
        "local" | "localmedia" => Category::LocalMedia,
        "youtube" | "yt" => Category::YouTube,
        "social" | "socialmedia" => Category::SocialMedia,
        "torrent" => Category::Torrent,
        "audio" | "music" => Category::Audio,
        _ => return Err(anyhow!("unknown category '{}'", raw)),
    })
}

fn demo_downloads() -> Vec<DownloadRequest> {
    vec![
        DownloadRequest {
            category: Category::YouTube,
            name: "Lo-fi beats compilation".into(),
            size_bytes: 48 * 1024 * 1024,
        },
        DownloadRequest {
            category: Category::Torrent,
            name: "debian-12.iso".into(),
            size_bytes: 650 * 1024 * 1024,
        },
        DownloadRequest {
            category: Category::Audio,
            name: "Morning podcast".into(),
            size_bytes: 22 * 1024 * 1024,
        },
    ]
}

fn render(entries: &[Arc<DownloadEntry>]) {
    println!(
        "{:>4}  {:<28} {:<13} {:<12} {:>7}  {:>10}",
        "ID", "NAME", "SOURCE", "STATUS", "DONE", "SIZE"
    );
    for entry in entries {
        println!(
            "{:>4}  {:<28} {:<13} {:<12} {:>6.1}%  {:>10}",
            entry.id,
            entry.name,
            entry.category.label(),
            entry.status.label(),
            entry.progress,
            format_size(entry.size_bytes)
        );
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    if args.no_history {
        config.history_enabled = false;
    }

    let coordinator = Coordinator::new(config)?;
    let mut observer = coordinator.observe();
    let mut events = coordinator.events();

    let requests = if args.downloads.is_empty() {
        demo_downloads()
    } else {
        args.downloads
    };
    coordinator.add_downloads(
        requests
            .into_iter()
            .map(|request| (request.name, request.category, request.size_bytes)),
    );
    render(&observer.current());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Interrupted, stopping");
                break;
            }
            Ok(event) = events.recv() => match event {
                DownloadEvent::Completed { name, .. } => info!("Finished: {}", name),
                DownloadEvent::Failed { name, reason, .. } => {
                    warn!("Failed: {} ({})", name, reason)
                }
                _ => {}
            },
            snapshot = observer.changed() => {
                let Some(snapshot) = snapshot else { break };
                render(&snapshot);
                if DownloadStats::from_entries(snapshot.iter().map(|e| &**e)).is_settled() {
                    break;
                }
            }
        }
    }

    let stats = coordinator.stats();
    coordinator.shutdown().await;
    info!(
        "{} completed, {} failed, {} downloaded",
        stats.completed,
        stats.failed,
        format_size(stats.downloaded_bytes)
    );
    Ok(())
}
