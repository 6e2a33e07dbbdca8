//! Binary subcommands (§B.1): `mirror` runs one side of a session against a
//! peer, `scan` runs a dry-run initial scan and prints what the watcher
//! would seed, for inspecting ignore rules without actually connecting
//! anywhere. Parsed the same way the teacher's `main.rs` parses its own
//! `Build`/`Serve`/`Query` subcommands.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::TcpStream;

use crate::config::Config;
use crate::fsaccess::LocalFileAccess;
use crate::rules::PathRules;
use crate::server::Server;
use crate::session::Session;
use crate::tree::{current_millis, UpdateTree};
use crate::watcher::{FileWatcher, NotifyFileWatcher};

#[derive(Parser)]
#[command(name = "driftless", about = "Continuous two-way filesystem mirror")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run one side of a mirrored mount against a peer.
    Mirror {
        /// Directory to mirror (defaults to current dir).
        #[arg(default_value = ".")]
        path: String,
        /// Optional driftless.toml to load before applying the flags below.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Identifies this mount to the peer.
        #[arg(long, default_value = "default")]
        mount_key: String,
        /// Listen for an incoming connection on this address instead of
        /// connecting out. Mutually exclusive with `--connect`.
        #[arg(long)]
        listen: Option<String>,
        /// Connect to a peer already listening at this address. Mutually
        /// exclusive with `--listen`.
        #[arg(long)]
        connect: Option<String>,
        /// Extra exclude patterns, beyond the config file's.
        #[arg(long = "exclude")]
        excludes: Vec<String>,
        /// Extra include patterns (override excludes), beyond the config
        /// file's.
        #[arg(long = "include")]
        includes: Vec<String>,
    },
    /// Run the initial scan over a directory and print what would be
    /// seeded, honoring ignore rules but touching no network.
    Scan {
        /// Directory to scan (defaults to current dir).
        #[arg(default_value = ".")]
        path: String,
        #[arg(long = "exclude")]
        excludes: Vec<String>,
        #[arg(long = "include")]
        includes: Vec<String>,
    },
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Mirror {
            path,
            config,
            mount_key,
            listen,
            connect,
            excludes,
            includes,
        } => run_mirror(path, config, mount_key, listen, connect, excludes, includes).await,
        Commands::Scan {
            path,
            excludes,
            includes,
        } => run_scan(path, excludes, includes),
    }
}

async fn run_mirror(
    path: String,
    config_path: Option<PathBuf>,
    mount_key: String,
    listen: Option<String>,
    connect: Option<String>,
    excludes: Vec<String>,
    includes: Vec<String>,
) -> Result<()> {
    let mut config = Config::load(config_path.as_deref())?
        .with_mount_root(PathBuf::from(&path))
        .with_mount_key(mount_key);
    config.excludes.extend(excludes);
    config.includes.extend(includes);
    config.listen_addr = listen.clone();
    config.connect_addr = connect.clone();
    config.validate()?;

    match (listen, connect) {
        (Some(listen_addr), None) => {
            let server = Server::new(vec![config]);
            server.serve(&listen_addr).await
        }
        (None, Some(connect_addr)) => {
            let transport = TcpStream::connect(&connect_addr)
                .await
                .with_context(|| format!("connecting to {connect_addr}"))?;
            let watcher = NotifyFileWatcher::new(&config.mount_root);
            let access = LocalFileAccess::locked(&config.mount_root)
                .context("another driftless session already holds this mount root")?;
            let session = Session::connect(transport, config, watcher, access).await?;
            tokio::task::spawn_blocking(move || session.run()).await?
        }
        _ => anyhow::bail!("mirror requires exactly one of --listen or --connect"),
    }
}

/// Same ignore evaluation `SyncLogic`'s diff pass applies (§4.3): feed the
/// scan into a throwaway `UpdateTree` so `.gitignore` bodies discovered
/// during the walk are honored, not just the `--exclude`/`--include` flags,
/// then print only the entries that would actually survive to a seed.
fn run_scan(path: String, excludes: Vec<String>, includes: Vec<String>) -> Result<()> {
    let mut config = Config::default().with_mount_root(PathBuf::from(&path));
    config.excludes.extend(excludes);
    config.includes.extend(includes);

    let mut watcher = NotifyFileWatcher::new(&config.mount_root);
    watcher.on_start()?;
    let scan = watcher.perform_initial_scan()?;
    watcher.on_stop()?;

    let extra_includes =
        PathRules::compile(&config.includes.join("\n")).context("compiling include rules")?;
    let extra_excludes =
        PathRules::compile(&config.excludes.join("\n")).context("compiling exclude rules")?;

    let mut tree = UpdateTree::new();
    let now_ms = current_millis();
    for update in &scan {
        if let Err(e) = tree.add_local_at(update.clone(), now_ms) {
            tracing::warn!("skipping {:?} during scan: {e}", update.path);
        }
    }

    let mut printed = 0usize;
    let mut ignored = 0usize;
    for update in &scan {
        let Ok(node_id) = tree.find(&update.path) else {
            continue;
        };
        if tree.should_ignore(node_id, &extra_includes, &extra_excludes) {
            ignored += 1;
            continue;
        }
        let kind = if update.is_directory {
            "dir"
        } else if !update.symlink_target.is_empty() {
            "symlink"
        } else {
            "file"
        };
        println!("{kind}\t{}\t{}", update.mod_time, update.path);
        printed += 1;
    }
    eprintln!("{printed} entries ({ignored} ignored)");
    Ok(())
}
