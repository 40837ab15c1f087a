use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::EnvFilter;

use nex_lite::cache::WorkloadCache;
use nex_lite::config::{NodeConfig, StalenessPolicy};
use nex_lite::control::Location;
use nex_lite::fetch::DirObjectStore;
use nex_lite::node::{ControlMessage, Node};
use nex_lite::runtime::ProcessRuntime;
use nex_lite::shutdown::install_shutdown_handler;
use nex_lite::verify::{classify, Linkage};

#[derive(Parser, Debug)]
#[command(name = "nex-lite")]
#[command(version)]
#[command(about = "Workload node: fetch, verify, cache and run statically linked workloads")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a node serving control messages (newline-delimited JSON on stdin/stdout)
    Node(NodeArgs),

    /// Check whether a binary is a statically linked ELF executable
    Verify {
        /// Path to the binary
        path: PathBuf,

        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },

    /// Inspect the local workload cache
    Cache {
        /// Node data directory (the cache lives in <data-dir>/cache)
        #[arg(long, default_value = "/var/lib/nex-lite")]
        data_dir: PathBuf,

        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,

        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Publish a local file into a directory-backed object store
    Publish {
        /// Object store root directory
        #[arg(long)]
        store_dir: PathBuf,

        /// Store domain (defaults to the unscoped domain)
        #[arg(long)]
        domain: Option<String>,

        /// Target location as a URL: "nats://<bucket>/<key>"
        #[arg(long, value_parser = parse_location)]
        location: Location,

        /// File to publish
        file: PathBuf,
    },
}

// =============================================================================
// Node Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct NodeArgs {
    /// Public identity of this node
    #[arg(long, default_value = "local")]
    node_id: String,

    /// Public encryption key advertised in info responses
    #[arg(long, default_value = "")]
    xkey: String,

    /// Data directory holding the cache, staging area and machine directories
    #[arg(long, default_value = "/var/lib/nex-lite")]
    data_dir: PathBuf,

    /// Root directory of the object store workloads are fetched from
    #[arg(long)]
    store_dir: PathBuf,

    /// Control-plane request timeout in milliseconds (bounds fetch + verify)
    #[arg(long, default_value = "30000")]
    timeout_ms: u64,

    /// Maximum number of control messages handled in parallel
    #[arg(long, default_value = "64")]
    max_concurrent: usize,

    /// Always download and verify, even when the cached digest matches
    #[arg(long)]
    always_fetch: bool,

    /// Extra node tag (format: "key=value"); may be repeated
    #[arg(long = "tag", value_parser = parse_tag)]
    tags: Vec<(String, String)>,
}

#[derive(clap::Subcommand, Debug)]
enum CacheCommands {
    /// List cached workloads
    List,
    /// Remove a cached workload
    Evict {
        /// Workload identity (claims subject)
        identity: String,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Wire and Output Types
// =============================================================================

/// One control message per stdin line.
#[derive(Deserialize)]
struct InboundLine {
    subject: String,
    #[serde(default)]
    payload: serde_json::Value,
}

/// One reply per stdout line.
#[derive(Serialize)]
struct OutboundLine {
    subject: String,
    reply: serde_json::Value,
}

#[derive(Serialize)]
struct VerifyOutput {
    path: String,
    statically_linked: bool,
    interpreter: Option<String>,
    error: Option<String>,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_tag(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("invalid tag {:?}, expected key=value", raw)),
    }
}

fn parse_location(raw: &str) -> Result<Location, String> {
    Location::parse(raw).map_err(|e| e.to_string())
}

fn init_logging() {
    // stdout carries replies, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

// =============================================================================
// Node Implementation
// =============================================================================

async fn run_node(args: NodeArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let mut config = NodeConfig::new(args.node_id, &args.data_dir)
        .with_request_timeout_ms(args.timeout_ms)
        .with_staleness(if args.always_fetch {
            StalenessPolicy::AlwaysFetch
        } else {
            StalenessPolicy::DigestMatch
        });
    config.public_xkey = args.xkey;
    config.max_concurrent_requests = args.max_concurrent;
    for (key, value) in args.tags {
        config = config.with_tag(key, value);
    }

    tracing::info!(
        node_id = %config.node_id,
        data_dir = %args.data_dir.display(),
        store_dir = %args.store_dir.display(),
        timeout_ms = config.request_timeout_ms,
        "Starting nex-lite node"
    );

    let store = Arc::new(DirObjectStore::new(&args.store_dir));
    let runtime = Arc::new(ProcessRuntime::new(config.runtime.clone()));
    let node = Node::new(config, store, runtime).await?;
    let shutdown = install_shutdown_handler()?;

    let (tx, rx) = mpsc::channel(256);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                tracing::error!("stdout closed, dropping replies");
                break;
            }
        }
    });

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read control message");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let inbound: InboundLine = match serde_json::from_str(&line) {
                Ok(inbound) => inbound,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping malformed control line");
                    continue;
                }
            };

            let payload = match &inbound.payload {
                serde_json::Value::Null => Vec::new(),
                value => serde_json::to_vec(value).unwrap_or_default(),
            };
            let (reply_tx, reply_rx) = oneshot::channel();
            let message = ControlMessage {
                subject: inbound.subject.clone(),
                payload,
                reply: Some(reply_tx),
            };
            if tx.send(message).await.is_err() {
                break;
            }

            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                // Dropped senders mean the subject was not for this node
                let Ok(reply) = reply_rx.await else {
                    return;
                };
                let reply = serde_json::from_slice(&reply).unwrap_or(serde_json::Value::Null);
                let outbound = OutboundLine {
                    subject: inbound.subject,
                    reply,
                };
                if let Ok(line) = serde_json::to_string(&outbound) {
                    let _ = out_tx.send(line);
                }
            });
        }
    });

    Arc::new(node).run(rx, shutdown).await;
    reader.abort();
    let _ = writer.await;
    Ok(())
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_verify(path: PathBuf, output_format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = tokio::fs::read(&path).await?;
    let output = match classify(&bytes) {
        Ok(Linkage::Static) => VerifyOutput {
            path: path.display().to_string(),
            statically_linked: true,
            interpreter: None,
            error: None,
        },
        Ok(Linkage::Dynamic { interpreter }) => VerifyOutput {
            path: path.display().to_string(),
            statically_linked: false,
            interpreter: Some(interpreter),
            error: None,
        },
        Err(e) => VerifyOutput {
            path: path.display().to_string(),
            statically_linked: false,
            interpreter: None,
            error: Some(e.to_string()),
        },
    };

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Table => {
            if output.statically_linked {
                println!("[+] {}: statically linked ELF binary", output.path);
            } else if let Some(interpreter) = &output.interpreter {
                println!("[-] {}: dynamically linked (interpreter {})", output.path, interpreter);
            } else {
                println!(
                    "[-] {}: {}",
                    output.path,
                    output.error.as_deref().unwrap_or("rejected")
                );
            }
        }
    }

    if !output.statically_linked {
        std::process::exit(1);
    }
    Ok(())
}

async fn handle_cache(
    data_dir: PathBuf,
    command: CacheCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let cache = WorkloadCache::open(data_dir.join("cache")).await?;

    match command {
        CacheCommands::List => {
            let entries = cache.entries().await?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
                OutputFormat::Table => {
                    if entries.is_empty() {
                        println!("No cached workloads.");
                        return Ok(());
                    }
                    println!("{:<58} {:<10} {:<26} DIGEST", "IDENTITY", "SIZE", "STORED AT");
                    println!("{}", "-".repeat(140));
                    for entry in &entries {
                        println!(
                            "{:<58} {:<10} {:<26} {}",
                            entry.identity,
                            entry.size,
                            entry.stored_at.to_rfc3339(),
                            entry.digest
                        );
                    }
                }
            }
        }
        CacheCommands::Evict { identity } => {
            let removed = cache.evict(&identity).await?;
            match output_format {
                OutputFormat::Json => println!(
                    "{}",
                    serde_json::json!({ "identity": identity, "removed": removed })
                ),
                OutputFormat::Table if removed => println!("Evicted {}", identity),
                OutputFormat::Table => println!("{} was not cached", identity),
            }
        }
    }
    Ok(())
}

async fn handle_publish(
    store_dir: PathBuf,
    domain: Option<String>,
    location: Location,
    file: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let bytes = tokio::fs::read(&file).await?;
    let store = DirObjectStore::new(store_dir);
    let info = store
        .put_object(domain.as_deref(), location.bucket(), location.key(), &bytes)
        .await?;
    println!("Published {}/{} ({} bytes, {})", info.bucket, info.name, info.size, info.digest);
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Node(node_args) => run_node(node_args).await?,
        Commands::Verify { path, output } => handle_verify(path, &output).await?,
        Commands::Cache {
            data_dir,
            output,
            command,
        } => handle_cache(data_dir, command, &output).await?,
        Commands::Publish {
            store_dir,
            domain,
            location,
            file,
        } => handle_publish(store_dir, domain, location, file).await?,
    }

    Ok(())
}
