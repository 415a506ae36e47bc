use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Once;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use common::{AccessTier, FolderId, Progress, ShareId, UnifiedConfig};
use engine::{Engine, MemberCredentials};
use net::{NntpPool, PoolConfig, RetryPolicy};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let format = std::env::var("USENETSYNC_LOG_FORMAT").unwrap_or_else(|_| "compact".into());

        if format.eq_ignore_ascii_case("json") {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .json()
                .flatten_event(true)
                .init();
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_target(true)
                .compact()
                .init();
        }
    });
}

#[derive(Parser)]
#[command(name = "usctl")]
#[command(about = "UsenetSync control utility", long_about = None)]
struct Cli {
    /// Configuration file (JSON or YAML).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TierArg {
    Open,
    Member,
    Passphrase,
}

impl From<TierArg> for AccessTier {
    fn from(tier: TierArg) -> Self {
        match tier {
            TierArg::Open => AccessTier::Open,
            TierArg::Member => AccessTier::Member,
            TierArg::Passphrase => AccessTier::Passphrase,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Register a local directory tree
    AddFolder {
        path: String,
        #[arg(long)]
        name: Option<String>,
    },
    /// Scan and hash a registered folder
    IndexFolder { folder_id: String },
    /// Cut indexed files into encrypted segments
    SegmentFolder { folder_id: String },
    /// Post pending segments to the configured servers
    UploadFolder { folder_id: String },
    /// Index + segment + upload in one pass
    ResyncFolder { folder_id: String },
    /// Publish a folder under an access tier and print the token
    PublishFolder {
        folder_id: String,
        #[arg(long, value_enum, default_value = "open")]
        tier: TierArg,
        #[arg(long)]
        passphrase: Option<String>,
        /// member entries as user_id=hex_public_key
        #[arg(long)]
        member: Vec<String>,
    },
    /// Reconstruct a share into a destination directory
    DownloadShare {
        token: String,
        dest: PathBuf,
        #[arg(long)]
        passphrase: Option<String>,
        #[arg(long)]
        user_id: Option<String>,
        /// hex-encoded member public key
        #[arg(long)]
        public_key: Option<String>,
    },
    /// List registered folders
    ListFolders,
    /// List published shares
    ListShares,
    /// Revoke a share for everyone
    RevokeShare { share_id: String },
    /// Grant one user on a member share
    AddMember {
        share_id: String,
        user_id: String,
        /// hex-encoded public key
        public_key: String,
    },
    /// Revoke one user on a member share
    RemoveMember { share_id: String, user_id: String },
    /// Remove a folder and everything derived from it
    RemoveFolder { folder_id: String },
    /// Copy the embedded database to a backup file (WAL checkpointed first)
    Backup { dest: PathBuf },
    /// Probe the configured servers: capabilities and recent health
    CheckServers,
}

fn parse_folder_id(raw: &str) -> Result<FolderId> {
    FolderId::from_hex(raw).with_context(|| format!("{raw} is not a folder id"))
}

fn parse_share_id(raw: &str) -> Result<ShareId> {
    ShareId::parse(raw).with_context(|| format!("{raw} is not a share id"))
}

fn parse_member(raw: &str) -> Result<(String, Vec<u8>)> {
    let (user, key) = raw
        .split_once('=')
        .context("member entries look like user_id=hex_public_key")?;
    Ok((user.to_string(), hex::decode(key).context("bad public key hex")?))
}

fn progress_printer() -> common::ProgressFn {
    Arc::new(|progress: Progress| {
        if progress.total > 0 {
            eprintln!(
                "[{:?}] {}/{} {}",
                progress.phase,
                progress.current,
                progress.total,
                progress.current_path.as_deref().unwrap_or("")
            );
        }
    })
}

async fn build_engine(config_path: Option<PathBuf>) -> Result<(Engine, Arc<NntpPool>, store::Store)> {
    let config = match config_path {
        Some(path) => UnifiedConfig::from_file(path)?,
        None => UnifiedConfig::default(),
    };
    if config.servers.is_empty() {
        bail!("no servers configured; add a `servers` section to the config file");
    }

    let pool = Arc::new(NntpPool::new(
        config.servers.clone(),
        PoolConfig {
            retry: RetryPolicy::new(
                config.max_retries,
                std::time::Duration::from_millis(config.retry_base_delay_ms),
            ),
            upload_rate_mbps: config.upload_rate_limit_mbps,
            download_rate_mbps: config.download_rate_limit_mbps,
            ..Default::default()
        },
    ));

    let store = store::Store::open(&config).await?;
    let engine = Engine::new(
        store.clone(),
        pool.clone(),
        config,
        Arc::new(common::metrics::TracingMetrics),
        progress_printer(),
    );
    Ok((engine, pool, store))
}

/// Persist the pool's health view so the next run (and the operator)
/// can see which servers have been misbehaving.
async fn persist_server_health(store: &store::Store, pool: &NntpPool) -> Result<()> {
    for server_id in pool.server_ids() {
        let Some(snapshot) = pool.health(&server_id) else {
            continue;
        };
        store
            .upsert_server_health(&store::ServerHealthRow {
                server_id,
                response_time_ema: snapshot.response_time_ms,
                failure_rate_ema: snapshot.failure_rate,
                last_success: None,
                last_failure: None,
                unhealthy_since: None,
            })
            .await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let (engine, pool, store) = build_engine(cli.config.clone()).await?;

    match cli.command {
        Commands::AddFolder { path, name } => {
            let folder = engine.add_folder(&path, name).await?;
            println!("{}", folder.folder_id);
        }
        Commands::IndexFolder { folder_id } => {
            let outcome = engine.index_folder(&parse_folder_id(&folder_id)?).await?;
            println!(
                "added={} modified={} deleted={} unchanged={}",
                outcome.added, outcome.modified, outcome.deleted, outcome.unchanged
            );
        }
        Commands::SegmentFolder { folder_id } => {
            let rows = engine.segment_folder(&parse_folder_id(&folder_id)?).await?;
            println!("{rows} segment rows");
        }
        Commands::UploadFolder { folder_id } => {
            let state = engine.upload_folder(&parse_folder_id(&folder_id)?).await?;
            println!("{}", state.as_str());
        }
        Commands::ResyncFolder { folder_id } => {
            let outcome = engine.resync_folder(&parse_folder_id(&folder_id)?).await?;
            println!(
                "added={} modified={} deleted={} unchanged={}",
                outcome.added, outcome.modified, outcome.deleted, outcome.unchanged
            );
        }
        Commands::PublishFolder {
            folder_id,
            tier,
            passphrase,
            member,
        } => {
            let members = member
                .iter()
                .map(|m| parse_member(m))
                .collect::<Result<Vec<_>>>()?;
            let outcome = engine
                .publish_folder(
                    &parse_folder_id(&folder_id)?,
                    tier.into(),
                    passphrase.as_deref(),
                    &members,
                    b"usctl-owner",
                )
                .await?;
            println!("{}", outcome.token);
            println!("{}", outcome.json_token);
        }
        Commands::DownloadShare {
            token,
            dest,
            passphrase,
            user_id,
            public_key,
        } => {
            let member = match (user_id, public_key) {
                (Some(user_id), Some(key)) => Some(MemberCredentials {
                    user_id,
                    public_key: hex::decode(key).context("bad public key hex")?,
                }),
                (None, None) => None,
                _ => bail!("--user-id and --public-key go together"),
            };
            let summary = engine
                .download_share(&token, &dest, passphrase.as_deref(), member.as_ref())
                .await?;
            println!(
                "completed={} failed={} bytes={}",
                summary.files_completed,
                summary.files_failed.len(),
                summary.bytes_written
            );
            for (path, error) in &summary.files_failed {
                eprintln!("failed {path}: {error}");
            }
            if !summary.fully_successful() {
                persist_server_health(&store, &pool).await?;
                std::process::exit(1);
            }
        }
        Commands::ListFolders => {
            for folder in engine.list_folders().await? {
                println!(
                    "{} {} v{} [{}] {}",
                    folder.folder_id,
                    folder.name,
                    folder.version,
                    folder.state.as_str(),
                    folder.path
                );
            }
        }
        Commands::ListShares => {
            for share in engine.list_shares().await? {
                println!(
                    "{} {} tier={} revoked={} folder={}",
                    share.share_id,
                    share.kind.as_str(),
                    share.tier.as_str(),
                    share.revoked,
                    share.folder_id
                );
            }
        }
        Commands::RevokeShare { share_id } => {
            engine.revoke_share(&parse_share_id(&share_id)?).await?;
            println!("revoked");
        }
        Commands::AddMember {
            share_id,
            user_id,
            public_key,
        } => {
            engine
                .add_member(
                    &parse_share_id(&share_id)?,
                    &user_id,
                    &hex::decode(public_key).context("bad public key hex")?,
                )
                .await?;
            println!("granted");
        }
        Commands::RemoveMember { share_id, user_id } => {
            engine
                .remove_member(&parse_share_id(&share_id)?, &user_id)
                .await?;
            println!("revoked member");
        }
        Commands::RemoveFolder { folder_id } => {
            engine.remove_folder(&parse_folder_id(&folder_id)?).await?;
            println!("removed");
        }
        Commands::Backup { dest } => {
            let config = match cli.config {
                Some(ref path) => UnifiedConfig::from_file(path)?,
                None => UnifiedConfig::default(),
            };
            store.checkpoint().await?;
            let staging = dest.with_extension("tmp");
            std::fs::copy(&config.database_path, &staging)
                .with_context(|| format!("copying {}", config.database_path))?;
            // Atomic swap so a half-written backup never replaces a good one.
            std::fs::rename(&staging, &dest)?;
            println!("backup written to {}", dest.display());
        }
        Commands::CheckServers => {
            use net::ArticleTransport;
            let caps = pool.capabilities().await?;
            println!(
                "posting_allowed={} retention_days={:?} max_connections={:?}",
                caps.posting_allowed, caps.retention_days, caps.max_connections
            );
            for server_id in pool.server_ids() {
                if let Some(health) = pool.health(&server_id) {
                    println!(
                        "{server_id}: healthy={} failure_rate={:.2} response_ms={:.0}",
                        health.healthy, health.failure_rate, health.response_time_ms
                    );
                }
                if let Some(row) = store.server_health(&server_id).await? {
                    println!(
                        "{server_id} (persisted): failure_rate={:.2} response_ms={:.0}",
                        row.failure_rate_ema, row.response_time_ema
                    );
                }
            }
        }
    }

    persist_server_health(&store, &pool).await?;
    Ok(())
}
