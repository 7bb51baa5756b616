use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use nodeclaim_api::ManagerConfig;
use nodeclaim_core::{ClaimKey, ClaimSnapshot};
use nodeclaim_store::ClaimCache;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "nodeclaimctl", version, about = "Inspect the node's resource claim checkpoint")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Directory holding the checkpoint (default: /var/lib/kubelet)
    #[arg(long = "state-dir", global = true, env = "NODECLAIM_STATE_DIR")]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List every checkpointed claim
    Claims,
    /// Show one claim
    Claim {
        namespace: String,
        name: String,
    },
    /// Whether a pod still holds claim references
    Pod {
        /// Pod UID
        uid: String,
    },
}

/// Logs go to stderr so `-o json` output stays parseable.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("NODECLAIM_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

/// Open an existing checkpoint. Never creates one.
fn open_cache(path: &Path) -> Result<ClaimCache> {
    if !path.exists() {
        bail!("no checkpoint at {}", path.display());
    }
    let t0 = std::time::Instant::now();
    let cache = ClaimCache::open(path).with_context(|| format!("loading checkpoint {}", path.display()))?;
    debug!(path = %path.display(), took_ms = %t0.elapsed().as_millis(), "checkpoint loaded");
    Ok(cache)
}

fn print_human(s: &ClaimSnapshot) {
    let state = if s.prepared { "prepared" } else { "pending" };
    let pods = if s.pod_uids.is_empty() { "-".to_string() } else { s.pod_uids.join(",") };
    println!("{}/{} • {} • {} • {} • pods={}", s.namespace, s.claim_name, s.claim_uid, s.driver_name, state, pods);
    for (plugin, devices) in &s.prepared_devices {
        println!("    {} → {}", plugin, if devices.is_empty() { "(no devices)".to_string() } else { devices.join(", ") });
    }
}

fn checkpoint_path(state_dir: Option<PathBuf>) -> PathBuf {
    let mut cfg = ManagerConfig::from_env();
    if let Some(dir) = state_dir {
        cfg.state_dir = dir;
    }
    cfg.checkpoint_path()
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let path = checkpoint_path(cli.state_dir);
    let cache = open_cache(&path)?;

    match cli.command {
        Commands::Claims => {
            let claims: Vec<ClaimSnapshot> = cache.with_shared(|v| Ok(v.records().into_iter().map(|r| r.snapshot()).collect()))?;
            info!(count = claims.len(), path = %path.display(), "claims listed");
            match cli.output {
                Output::Human => {
                    if claims.is_empty() {
                        println!("no claims");
                    }
                    for s in &claims {
                        print_human(s);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&claims)?),
            }
        }
        Commands::Claim { namespace, name } => {
            let key = ClaimKey::new(namespace, name);
            let Some(snap) = cache.with_shared(|v| Ok(v.get(&key).map(|r| r.snapshot())))? else {
                bail!("claim {} is not in the checkpoint", key);
            };
            match cli.output {
                Output::Human => print_human(&snap),
                Output::Json => println!("{}", serde_json::to_string_pretty(&snap)?),
            }
        }
        Commands::Pod { uid } => {
            let claims: Vec<String> = cache.with_shared(|v| {
                Ok(v.records().into_iter().filter(|r| r.has_pod_reference(&uid)).map(|r| r.key().to_string()).collect())
            })?;
            match cli.output {
                Output::Human => {
                    if claims.is_empty() {
                        println!("pod {} holds no claims", uid);
                    } else {
                        println!("pod {} holds {}", uid, claims.join(", "));
                    }
                }
                Output::Json => println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({ "pod": uid, "holds_references": !claims.is_empty(), "claims": claims }))?
                ),
            }
        }
    }
    Ok(())
}
