use anyhow::{Context, Result};
use clap::{ArgGroup, Args as ClapArgs, Parser, Subcommand};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use tidings::config::{Config, ProviderKind};
use tidings::remote::{HttpStreamProvider, HttpZoneProvider};
use tidings::storage::{Database, DatabaseError, StatusKey};
use tidings::sync::{Provider, SyncEngine, SyncError};

/// Get the config directory path (~/.config/tidings/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("tidings"))
}

#[derive(Parser, Debug)]
#[command(
    name = "tidings",
    about = "Keep a local feed-reader store in sync with a remote service"
)]
struct Args {
    /// Config file (default: ~/.config/tidings/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database file (default: ~/.config/tidings/tidings.db)
    #[arg(long, global = true, value_name = "FILE")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Push pending changes and pull remote state
    Sync,
    /// Change article state locally and queue it for the next sync
    Mark(MarkArgs),
    /// List changes not yet acknowledged by the remote
    Pending,
    /// Apply the retention policy to the local store
    Prune,
}

#[derive(ClapArgs, Debug)]
#[command(group(ArgGroup::new("edit").required(true).args(["read", "unread", "star", "unstar"])))]
struct MarkArgs {
    #[arg(long)]
    read: bool,
    #[arg(long)]
    unread: bool,
    #[arg(long)]
    star: bool,
    #[arg(long)]
    unstar: bool,

    /// Article ids
    #[arg(required = true)]
    ids: Vec<String>,
}

impl MarkArgs {
    fn edit(&self) -> (StatusKey, bool) {
        if self.read || self.unread {
            (StatusKey::Read, self.read)
        } else {
            (StatusKey::Starred, self.star)
        }
    }
}

fn build_provider(config: &Config) -> Result<Provider> {
    let base_url = config.base_url().context("Invalid remote configuration")?;
    let http = reqwest::Client::builder()
        .user_agent(concat!("tidings/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("Failed to build HTTP client")?;
    let token = config.api_token();
    let timeout = config.request_timeout();

    Ok(match config.provider {
        ProviderKind::Stream => Provider::Stream(Arc::new(HttpStreamProvider::new(
            http, base_url, token, timeout,
        ))),
        ProviderKind::Zone => Provider::Zone(Arc::new(HttpZoneProvider::new(
            http,
            base_url,
            token,
            timeout,
            config.zone_name.clone(),
        ))),
    })
}

async fn open_database(path: &PathBuf, cache_capacity: usize) -> Result<Database> {
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
    match Database::open_with_cache(path_str, cache_capacity).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::InstanceLocked) => {
            eprintln!("Error: Another instance of tidings appears to be running. Please close it and try again.");
            std::process::exit(1);
        }
        Err(e) => Err(anyhow::anyhow!("Failed to open database: {}", e)),
    }
}

async fn run_sync(engine: Arc<SyncEngine>) -> Result<()> {
    let canceler = Arc::clone(&engine);
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Canceling sync...");
            canceler.cancel();
        }
    });

    let result = engine.run_sync().await;
    ctrl_c.abort();

    match result {
        Ok(report) => {
            println!("Sync complete ({} steps)", report.states.len());
            Ok(())
        }
        Err(SyncError::Canceled) => {
            println!("Sync canceled");
            Ok(())
        }
        Err(SyncError::AccountDeleted) => {
            anyhow::bail!("The remote data for this account was deleted. Local data was left untouched.")
        }
        Err(e) => Err(e).context("Sync failed"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| config_dir.join("config.toml"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = match args.db.clone() {
        Some(path) => path,
        None => {
            if !config_dir.exists() {
                std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Err(e) = std::fs::set_permissions(&config_dir, std::fs::Permissions::from_mode(0o700)) {
                    tracing::warn!(path = %config_dir.display(), error = %e, "Failed to set config directory permissions to 0700");
                }
            }
            config_dir.join("tidings.db")
        }
    };
    let db = open_database(&db_path, config.cache_capacity).await?;

    match args.command {
        Command::Sync => {
            let provider = build_provider(&config)?;
            let engine = Arc::new(SyncEngine::new(db, provider, config.sync_settings()));
            run_sync(engine).await?;
        }
        Command::Mark(mark) => {
            let (key, flag) = mark.edit();
            let ids: HashSet<String> = mark.ids.iter().cloned().collect();
            // Queuing needs no network access, so a missing base_url is fine here.
            let queued = tidings::sync::queue_local_edit(&db, &ids, key, flag)
                .await
                .context("Failed to record local edit")?;
            println!("Queued {} change(s)", queued);
        }
        Command::Pending => {
            let pending = db
                .pending_changes()
                .await
                .context("Failed to load pending changes")?;
            if pending.is_empty() {
                println!("No pending changes");
            }
            for change in pending {
                println!(
                    "{}\t{}={}{}",
                    change.article_id,
                    change.key,
                    change.flag,
                    if change.in_progress { "\t(in progress)" } else { "" }
                );
            }
        }
        Command::Prune => {
            let settings = config.sync_settings();
            let cutoff = settings.retention_cutoff(chrono::Utc::now().timestamp());
            let protected: HashSet<String> = db
                .pending_changes()
                .await
                .context("Failed to load pending changes")?
                .into_iter()
                .map(|change| change.article_id)
                .collect();
            let articles = db
                .delete_old_articles(cutoff, &protected)
                .await
                .context("Failed to delete old articles")?;
            let statuses = db
                .prune_statuses(cutoff)
                .await
                .context("Failed to prune statuses")?;
            println!("Deleted {} article(s) and {} status row(s)", articles, statuses);
        }
    }

    Ok(())
}
