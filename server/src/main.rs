//! Shelf offline caching gateway (shelfd)

use clap::{Parser, Subcommand};
use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod gateway;
mod storage;

use config::Config;
use gateway::classify::Classifier;
use gateway::control::ControlMessage;
use gateway::lifecycle::CacheLifecycle;
use gateway::upstream::HttpUpstream;
use gateway::Gateway;
use storage::CacheStore;

#[derive(Parser)]
#[command(name = "shelfd")]
#[command(about = "Shelf offline caching gateway", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway (runs in background)
    Serve {
        /// Run in foreground (don't daemonize)
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the gateway
    Down,
    /// Show gateway status and cache statistics
    Status,
    /// Purge every cache namespace of a running gateway
    ClearCache,
    /// Activate the waiting cache version of a running gateway
    SkipWaiting,
}

fn pid_file() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("shelfd.pid")
}

fn is_server_running() -> Option<u32> {
    let pid_path = pid_file();
    if pid_path.exists() {
        if let Ok(pid_str) = fs::read_to_string(&pid_path) {
            if let Ok(pid) = pid_str.trim().parse::<u32>() {
                #[cfg(unix)]
                {
                    let result = Command::new("kill")
                        .args(["-0", &pid.to_string()])
                        .stdout(Stdio::null())
                        .stderr(Stdio::null())
                        .status();
                    if result.map(|s| s.success()).unwrap_or(false) {
                        return Some(pid);
                    }
                }
                #[cfg(not(unix))]
                {
                    return Some(pid);
                }
            }
        }
        // Stale pid file, remove it
        let _ = fs::remove_file(&pid_path);
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Serve { foreground: false } => start_daemon(),
        Commands::Down => stop_server(),
        Commands::Status => show_status().await,
        Commands::ClearCache => send_control(ControlMessage::ClearCache).await,
        Commands::SkipWaiting => send_control(ControlMessage::SkipWaiting).await,
        Commands::Serve { foreground: true } => {
            tracing_subscriber::registry()
                .with(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| "shelfd=info,tower_http=info".into()),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            run_server(Config::from_env()?).await
        }
    }
}

fn start_daemon() -> anyhow::Result<()> {
    if let Some(pid) = is_server_running() {
        println!("shelfd already running (pid {})", pid);
        return Ok(());
    }

    let config = Config::from_env()?;
    let exe = std::env::current_exe()?;

    // Spawn detached process with --foreground flag
    let child = Command::new(&exe)
        .args(["serve", "--foreground"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    let pid = child.id();
    write_pid(pid)?;

    println!("shelfd serving on localhost:{}", config.port);
    println!("  upstream: {}", config.upstream_url);
    println!("pid: {}", pid);

    Ok(())
}

fn stop_server() -> anyhow::Result<()> {
    if let Some(pid) = is_server_running() {
        #[cfg(unix)]
        {
            Command::new("kill").args([&pid.to_string()]).status()?;
        }
        #[cfg(not(unix))]
        {
            Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/F"])
                .status()?;
        }

        let _ = fs::remove_file(pid_file());
        println!("shelfd stopped");
    } else {
        println!("shelfd not running");
    }
    Ok(())
}

async fn show_status() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let Some(pid) = is_server_running() else {
        println!("shelfd not running");
        return Ok(());
    };

    println!("shelfd running");
    println!("  pid: {}", pid);
    println!("  gateway: localhost:{}", config.port);
    println!("  upstream: {}", config.upstream_url);

    let url = format!("{}/__shelf/stats", local_url(&config));
    match reqwest::get(&url).await {
        Ok(response) => {
            let stats: serde_json::Value = response.json().await?;
            let namespace = |key: &str| stats[key].as_str().unwrap_or("-").to_string();
            println!("  active cache: {}", namespace("active"));
            println!("  waiting cache: {}", namespace("waiting"));
            println!(
                "  entries: {}  bytes: {}",
                stats["entries"].as_u64().unwrap_or(0),
                stats["bytes"].as_u64().unwrap_or(0)
            );
            println!(
                "  hits: {}  misses: {}  hit rate: {}",
                stats["hits"].as_u64().unwrap_or(0),
                stats["misses"].as_u64().unwrap_or(0),
                stats["hitRate"].as_str().unwrap_or("-")
            );
        }
        Err(e) => println!("  stats unavailable: {}", e),
    }
    Ok(())
}

async fn send_control(message: ControlMessage) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    if is_server_running().is_none() {
        anyhow::bail!("shelfd not running");
    }

    let url = format!("{}/__shelf/control", local_url(&config));
    let response = reqwest::Client::new().post(&url).json(&message).send().await?;
    let status = response.status();
    let body: serde_json::Value = response.json().await?;

    if !status.is_success() || body["success"] != true {
        anyhow::bail!(
            "control message rejected: {}",
            body["message"].as_str().unwrap_or("unknown error")
        );
    }

    match message {
        ControlMessage::ClearCache => println!("cache cleared"),
        ControlMessage::SkipWaiting => match body["active"].as_str() {
            Some(active) => println!("active cache: {}", active),
            None => println!("no cache version waiting"),
        },
    }
    Ok(())
}

fn local_url(config: &Config) -> String {
    format!("http://127.0.0.1:{}", config.port)
}

fn write_pid(pid: u32) -> anyhow::Result<()> {
    let pid_path = pid_file();
    if let Some(parent) = pid_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&pid_path, pid.to_string())?;
    Ok(())
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    // Save PID for foreground mode too
    write_pid(std::process::id())?;

    let store = Arc::new(CacheStore::new(&config.cache_dir)?);
    let lifecycle = CacheLifecycle::open(store.clone())?;
    let upstream = HttpUpstream::new(&config.upstream_url)?;

    lifecycle
        .install(&config.cache_version, &upstream, &config.precache)
        .await?;

    if config.skip_waiting || lifecycle.active_namespace().is_none() {
        lifecycle.activate()?;
    } else if let (Some(active), Some(waiting)) =
        (lifecycle.active_namespace(), lifecycle.waiting_namespace())
    {
        tracing::info!("{} waiting, {} keeps serving until skip-waiting", waiting, active);
    }

    let classifier = Classifier::new(config.api_cache_prefixes.clone());
    let gateway = Arc::new(Gateway::new(store, lifecycle, upstream, classifier));

    tracing::info!("Proxying to {}", config.upstream_url);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let result = gateway::serve(addr, gateway).await;

    // Cleanup PID file
    let _ = fs::remove_file(pid_file());

    result
}
