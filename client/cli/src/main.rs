use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod db;
mod error;
mod listing;
mod tui;

use api::ApiClient;
use config::Config;
use db::StateDb;
use listing::{
    normalize_prefix, relative_name, sorted_view, ListingController, LoadOutcome, SortDirection,
    SortKey, DEFAULT_DELIMITER,
};

#[derive(Parser)]
#[command(name = "shelf")]
#[command(about = "Object storage browser", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Point shelf at a storage API
    Connect {
        /// Server URL, e.g. localhost:8080
        url: String,
    },
    /// Show backend information
    Info,
    /// List buckets
    Buckets,
    /// Select the bucket to work in
    Use {
        bucket: String,
    },
    /// List a folder
    Ls {
        /// Folder path
        #[arg(default_value = "")]
        path: String,
        /// Fetch every page instead of just the first
        #[arg(long)]
        all: bool,
        #[arg(long, value_enum, default_value_t = SortKey::Name)]
        sort: SortKey,
        /// Sort descending
        #[arg(long)]
        desc: bool,
    },
    /// Browse interactively with infinite scroll
    Browse {
        #[arg(default_value = "")]
        path: String,
    },
    /// Upload a local file
    Upload {
        file: PathBuf,
        /// Object key to store under (defaults to the file name)
        #[arg(long)]
        key: Option<String>,
    },
    /// Download an object
    Download {
        key: String,
        /// Output file (defaults to the object name)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Delete one or more objects
    Rm {
        #[arg(required = true)]
        keys: Vec<String>,
        /// Skip confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Create a folder
    Mkdir {
        path: String,
    },
    /// Search object names
    Search {
        keyword: String,
        /// Folder to search in
        #[arg(long, default_value = "")]
        prefix: String,
        /// Maximum number of results
        #[arg(long)]
        limit: Option<u32>,
    },
    /// Show total size of a folder
    Du {
        #[arg(default_value = "")]
        path: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // The browser owns the terminal, so it gets no log output
    if !matches!(cli.command, Commands::Browse { .. }) {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "shelf=warn".into()),
            )
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .init();
    }

    if let Err(e) = run(cli).await {
        eprintln!("! {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;

    if let Commands::Connect { url } = &cli.command {
        return connect(&mut config, url).await;
    }

    let client = ApiClient::new(config.require_server()?);
    let state = StateDb::open()?;

    match cli.command {
        Commands::Connect { .. } => unreachable!(),
        Commands::Info => {
            let info = client.backend_info().await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Commands::Buckets => {
            let current = state.current_bucket()?;
            for bucket in client.list_buckets().await? {
                let marker = if current.as_deref() == Some(bucket.as_str()) { "*" } else { " " };
                println!("{} {}", marker, bucket);
            }
        }
        Commands::Use { bucket } => {
            let buckets = client.list_buckets().await?;
            if !buckets.contains(&bucket) {
                anyhow::bail!("no such bucket: {}", bucket);
            }
            state.set_current_bucket(&bucket)?;
            println!("using {}", bucket);
        }
        Commands::Ls { path, all, sort, desc } => {
            let bucket = current_bucket(&client, &state).await?;
            let direction = if desc {
                SortDirection::Descending
            } else {
                SortDirection::Ascending
            };
            list(client, &config, &bucket, &normalize_prefix(&path), all, sort, direction).await?;
        }
        Commands::Browse { path } => {
            let bucket = current_bucket(&client, &state).await?;
            tui::run_browser(
                Arc::new(client),
                &bucket,
                &normalize_prefix(&path),
                config.page_size,
            )
            .await?;
        }
        Commands::Upload { file, key } => {
            let bucket = current_bucket(&client, &state).await?;
            client.upload(&bucket, &file, key.as_deref()).await?;
            println!("uploaded {}", file.display());
        }
        Commands::Download { key, output } => {
            let bucket = current_bucket(&client, &state).await?;
            download(&client, &bucket, &key, output).await?;
        }
        Commands::Rm { keys, yes } => {
            let bucket = current_bucket(&client, &state).await?;
            remove(&client, &bucket, &keys, yes).await?;
        }
        Commands::Mkdir { path } => {
            let bucket = current_bucket(&client, &state).await?;
            let folder = normalize_prefix(&path);
            if folder.is_empty() {
                anyhow::bail!("folder name required");
            }
            client.create_folder(&bucket, &folder).await?;
            println!("created {}", folder);
        }
        Commands::Search { keyword, prefix, limit } => {
            let bucket = current_bucket(&client, &state).await?;
            let keyword = keyword.trim();
            if keyword.is_empty() {
                anyhow::bail!("search keyword required");
            }
            let prefix = normalize_prefix(&prefix);
            let limit = limit.unwrap_or(config.search_limit);
            let result = client.search(&bucket, keyword, &prefix, limit).await?;
            if result.files.is_empty() {
                println!("no matches");
                return Ok(());
            }
            for file in &result.files {
                let size = format_size(file.size.unwrap_or(0));
                println!("{:>10}  {}", size, relative_name(&file.key, &prefix, DEFAULT_DELIMITER));
            }
            if result.total_found > result.files.len() as u64 {
                println!("showing {} of {} matches", result.files.len(), result.total_found);
            }
        }
        Commands::Du { path } => {
            let bucket = current_bucket(&client, &state).await?;
            let prefix = normalize_prefix(&path);
            let size = client.folder_size(&bucket, &prefix).await?;
            println!(
                "{}  {} files  {}/{}",
                format_size(size.total_size),
                size.file_count,
                bucket,
                prefix
            );
        }
    }

    Ok(())
}

async fn connect(config: &mut Config, url: &str) -> anyhow::Result<()> {
    let url = config::normalize_server_url(url);
    let client = ApiClient::new(&url);
    client.backend_info().await?;
    config.server_url = Some(url.clone());
    config.save()?;
    println!("connected to {}", url);
    Ok(())
}

/// The remembered bucket if it still exists, else the first one
async fn current_bucket(client: &ApiClient, state: &StateDb) -> anyhow::Result<String> {
    let buckets = client.list_buckets().await?;
    let saved = state.current_bucket()?;
    let bucket = db::resolve_bucket(saved.as_deref(), &buckets)
        .ok_or_else(|| anyhow::anyhow!("no buckets available"))?;
    if saved.as_deref() != Some(bucket.as_str()) {
        state.set_current_bucket(&bucket)?;
    }
    Ok(bucket)
}

async fn list(
    client: ApiClient,
    config: &Config,
    bucket: &str,
    prefix: &str,
    all: bool,
    sort: SortKey,
    direction: SortDirection,
) -> anyhow::Result<()> {
    let mut controller = ListingController::new(client, config.page_size);
    controller.load(bucket, prefix, true).await?;
    if all {
        while let LoadOutcome::Merged { .. } = controller.load_more().await? {}
    }

    let Some(session) = controller.session() else {
        return Ok(());
    };
    let view = sorted_view(session.entries(), sort, direction);
    if view.is_empty() {
        println!("empty");
        return Ok(());
    }
    for entry in &view {
        let size = if entry.is_folder {
            "-".to_string()
        } else {
            format_size(entry.size)
        };
        let modified = entry
            .last_modified
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!("{:>10}  {:16}  {}", size, modified, entry.display_name());
    }
    if session.has_more() {
        println!("... more entries available (use --all)");
    }
    Ok(())
}

async fn download(
    client: &ApiClient,
    bucket: &str,
    key: &str,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let dest = match output {
        Some(path) => path,
        None => {
            let name = key.trim_end_matches(DEFAULT_DELIMITER);
            let name = name.rsplit(DEFAULT_DELIMITER).next().unwrap_or(name);
            if name.is_empty() {
                anyhow::bail!("cannot derive a file name from {}", key);
            }
            PathBuf::from(name)
        }
    };

    let progress = ProgressBar::new(0);
    progress.set_style(
        ProgressStyle::with_template("{bar:40} {bytes}/{total_bytes} {bytes_per_sec}")?,
    );
    let written = client.download(bucket, key, &dest, &progress).await;
    progress.finish_and_clear();
    let written = written?;
    println!("saved {} ({})", dest.display(), format_size(written));
    Ok(())
}

async fn remove(client: &ApiClient, bucket: &str, keys: &[String], yes: bool) -> anyhow::Result<()> {
    let question = if keys.len() == 1 {
        format!("delete {}? this cannot be undone", keys[0])
    } else {
        format!("delete {} objects? this cannot be undone", keys.len())
    };
    if !yes && !confirm(&question)? {
        println!("cancelled");
        return Ok(());
    }

    if keys.len() == 1 {
        client.delete(bucket, &keys[0]).await?;
    } else {
        client.delete_batch(bucket, keys).await?;
    }
    println!("deleted {}", keys.len());
    Ok(())
}

fn confirm(question: &str) -> anyhow::Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
