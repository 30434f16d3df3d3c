//! Fiscalgate CLI - inspect and replay the offline operation queue.
//!
//! Queue commands work directly on the persisted queue and never touch the
//! network. `drain` builds a full client and replays pending operations.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use fiscalgate_auth::StaticSession;
use fiscalgate_cache::{patterns_for_mutation, EndpointClassifier};
use fiscalgate_client::{ClientConfig, FiscalClient};
use fiscalgate_common::{HttpMethod, Role};
use fiscalgate_storage::{FileSecureStorage, NetworkMonitor, ProbeNetworkMonitor, SecureStorage};
use fiscalgate_sync::{OfflineOperationQueue, OperationStatus, QueuedOperation};

/// Environment variable holding the bearer token used by `drain`.
const TOKEN_ENV: &str = "FISCALGATE_TOKEN";

#[derive(Parser)]
#[command(name = "fiscalgate")]
#[command(about = "Fiscalgate - offline queue and cache policy tooling")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// JSON client configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the persisted queue and certificate.
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or edit the offline operation queue.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Show the cache policy applied to an endpoint.
    Classify {
        /// Request URL or path.
        url: String,

        /// HTTP method.
        #[arg(short, long, default_value = "GET")]
        method: HttpMethod,
    },

    /// Show the cache keys a mutation would invalidate.
    Invalidation {
        /// Request URL or path.
        url: String,

        /// HTTP method.
        #[arg(short, long, default_value = "POST")]
        method: HttpMethod,
    },

    /// Replay pending operations against the server.
    Drain {
        /// Role of the bearer token read from FISCALGATE_TOKEN.
        #[arg(short, long, default_value = "merchant")]
        role: Role,

        /// Move failed operations back to pending first.
        #[arg(long)]
        retry_failed: bool,
    },

    /// Print the effective configuration.
    Config,
}

#[derive(Subcommand)]
enum QueueAction {
    /// List queued operations in drain order.
    List,

    /// Show queue counters.
    Stats,

    /// Delete operations that are not being processed.
    Purge {
        /// Which operations to delete.
        #[arg(short, long, value_enum, default_value_t = PurgeScope::Failed)]
        status: PurgeScope,
    },

    /// Move failed operations back to pending.
    Retry,

    /// Delete one operation.
    Remove {
        /// Operation id.
        id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PurgeScope {
    Failed,
    Pending,
    All,
}

impl PurgeScope {
    fn matches(self, operation: &QueuedOperation) -> bool {
        match self {
            PurgeScope::Failed => operation.status == OperationStatus::Failed,
            PurgeScope::Pending => operation.status == OperationStatus::Pending,
            PurgeScope::All => true,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let builder = FmtSubscriber::builder().with_target(false).compact();
    if std::env::var_os("RUST_LOG").is_some() {
        tracing::subscriber::set_global_default(
            builder.with_env_filter(EnvFilter::from_default_env()).finish(),
        )?;
    } else {
        tracing::subscriber::set_global_default(builder.with_max_level(level).finish())?;
    }

    let config = load_config(cli.config.as_deref())?;
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => default_data_dir()?,
    };

    match cli.command {
        Commands::Queue { action } => cmd_queue(&config, &data_dir, action).await,

        Commands::Classify { url, method } => cmd_classify(&config, &url, method),

        Commands::Invalidation { url, method } => cmd_invalidation(&url, method),

        Commands::Drain { role, retry_failed } => {
            cmd_drain(config, &data_dir, role, retry_failed).await
        }

        Commands::Config => {
            println!("{}", config.to_json()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<ClientConfig> {
    match path {
        Some(path) => ClientConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(ClientConfig::default()),
    }
}

fn default_data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("No data directory on this platform")?;
    Ok(base.join("fiscalgate"))
}

fn open_storage(data_dir: &Path) -> Result<Arc<dyn SecureStorage>> {
    let storage = FileSecureStorage::new(data_dir)
        .with_context(|| format!("Failed to open storage at {}", data_dir.display()))?;
    Ok(Arc::new(storage))
}

async fn open_queue(config: &ClientConfig, data_dir: &Path) -> Result<OfflineOperationQueue> {
    OfflineOperationQueue::open(open_storage(data_dir)?, config.queue.clone())
        .await
        .context("Failed to load offline queue")
}

/// Run a queue subcommand.
async fn cmd_queue(config: &ClientConfig, data_dir: &Path, action: QueueAction) -> Result<()> {
    let queue = open_queue(config, data_dir).await?;

    match action {
        QueueAction::List => {
            let operations = queue.list().await;
            if operations.is_empty() {
                println!("Queue is empty.");
            }
            for op in operations {
                println!("{}", format_operation(&op));
                if let Some(error) = &op.error {
                    println!("    last error: {}", error);
                }
            }
        }

        QueueAction::Stats => {
            let stats = queue.stats().await;
            println!("Queue ({}):", config.queue.storage_key);
            println!("  Pending: {}", stats.pending);
            println!("  Processing: {}", stats.processing);
            println!("  Failed: {}", stats.failed);
            println!("  Total: {} / {}", stats.total, config.queue.capacity);
            if let Some(due) = queue.next_due_at().await {
                println!("  Next attempt: {}", due.to_rfc3339());
            }
        }

        QueueAction::Purge { status } => {
            let removed = queue
                .purge(|op| status.matches(op))
                .await
                .context("Failed to purge queue")?;
            println!("Removed {} operation(s).", removed);
        }

        QueueAction::Retry => {
            let reset = queue
                .retry_failed()
                .await
                .context("Failed to reset operations")?;
            println!("{} failed operation(s) moved back to pending.", reset);
        }

        QueueAction::Remove { id } => {
            if queue.remove(&id).await.context("Failed to remove operation")? {
                println!("Removed {}", id);
            } else {
                anyhow::bail!("No queued operation with id {}", id);
            }
        }
    }

    Ok(())
}

fn format_operation(op: &QueuedOperation) -> String {
    format!(
        "{} [{}] {:?} {} {} (attempt {}/{}, queued {})",
        op.id,
        op.status,
        op.priority,
        op.method,
        op.endpoint,
        op.retry_count,
        op.max_retries,
        op.created_at.format("%Y-%m-%d %H:%M:%S"),
    )
}

/// Show how the cache treats an endpoint.
fn cmd_classify(config: &ClientConfig, url: &str, method: HttpMethod) -> Result<()> {
    let classifier =
        EndpointClassifier::new(config.cache.clone()).context("Invalid cache configuration")?;
    let policy = classifier.classify(url, method);

    println!("{} {}", method, url);
    println!("  Class: {:?}", policy.class);
    println!("  Strategy: {}", policy.strategy);
    match policy.ttl {
        Some(ttl) => println!("  TTL: {}s", ttl.as_secs()),
        None => println!("  TTL: not cached"),
    }
    println!("  Background refresh: {}", policy.background_refresh);

    Ok(())
}

/// Show the cache keys a successful mutation invalidates.
fn cmd_invalidation(url: &str, method: HttpMethod) -> Result<()> {
    let patterns = patterns_for_mutation(url, method);
    if patterns.is_empty() {
        println!("{} {} invalidates nothing.", method, url);
    } else {
        println!("{} {} invalidates:", method, url);
        for pattern in patterns {
            println!("  {}", pattern);
        }
    }
    Ok(())
}

/// Replay the queue once against the configured API.
async fn cmd_drain(
    config: ClientConfig,
    data_dir: &Path,
    role: Role,
    retry_failed: bool,
) -> Result<()> {
    info!("Draining offline queue against {}", config.api_base_url);

    let session = match std::env::var(TOKEN_ENV) {
        Ok(token) if !token.is_empty() => StaticSession::with_credentials(token, role),
        _ => anyhow::bail!("{} is not set", TOKEN_ENV),
    };

    let probe = Arc::new(
        ProbeNetworkMonitor::new(config.probe_url()).context("Invalid probe URL")?,
    );
    if !probe.probe_once().await {
        anyhow::bail!("Server at {} is unreachable", config.probe_url());
    }
    let monitor: Arc<dyn NetworkMonitor> = probe;

    let client = FiscalClient::builder(config)
        .storage(open_storage(data_dir)?)
        .monitor(monitor)
        .session(Arc::new(session))
        .build()
        .await
        .context("Failed to build client")?;

    if retry_failed {
        let reset = client.sync_manager().retry_all_failed().await?;
        info!("{} failed operation(s) moved back to pending", reset);
    }

    let report = client.sync_now().await.context("Sync failed")?;

    println!("Sync finished in {:.1}s", report.duration.as_secs_f64());
    println!("  Completed: {}", report.completed);
    println!("  Rescheduled: {}", report.rescheduled);
    println!("  Failed: {}", report.failed);

    let stats = client.queue_stats().await;
    println!("  Remaining: {}", stats.total);

    Ok(())
}
