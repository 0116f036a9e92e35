use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use pipeline::{
    config::DaemonConfig,
    sync::{retry_stuck, run_sync, SyncOptions},
    tools::ToolSet,
    watch::Watcher,
    worker::{process_project, WorkerContext},
};

/// Video pipeline daemon: watch, process, publish
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the watch areas and run the pipeline for new exports (default)
    Watch,
    /// Run the pipeline once for a single project workspace
    Process {
        /// Project workspace directory
        dir: PathBuf,
    },
    /// Reconcile the showcase manifest and the remote library with local state
    Sync {
        /// Report what would change without changing anything
        #[arg(long)]
        dry_run: bool,
        /// Delete remote assets without asking
        #[arg(long)]
        yes: bool,
        /// Manifest pass only, leave the remote library untouched
        #[arg(long)]
        skip_remote: bool,
        /// Also collapse same-title remote duplicates onto the newest upload
        #[arg(long)]
        delete_duplicates: bool,
    },
    /// Re-run the pipeline for projects whose status record is absent or empty
    RetryStuck,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; -v bumps the default to debug
    let mut builder = env_logger::Builder::from_default_env();
    if args.verbose && std::env::var("RUST_LOG").is_err() {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.format_timestamp_secs().init();

    let cfg = DaemonConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    match args.command.unwrap_or(Command::Watch) {
        Command::Watch => watch(cfg).await,
        Command::Process { dir } => process_one(cfg, dir).await,
        Command::Sync {
            dry_run,
            yes,
            skip_remote,
            delete_duplicates,
        } => {
            let opts = SyncOptions {
                dry_run,
                assume_yes: yes,
                skip_remote,
                delete_duplicates,
            };
            let ctx = context(cfg)?;
            run_sync(&ctx, &opts).await
        }
        Command::RetryStuck => {
            let ctx = context(cfg)?;
            let completed = retry_stuck(&ctx).await?;
            info!("{} stuck project(s) completed", completed);
            Ok(())
        }
    }
}

fn context(cfg: DaemonConfig) -> Result<WorkerContext> {
    let tools = ToolSet::resolve(&cfg.tools).context("Failed to resolve external tools")?;
    Ok(WorkerContext::new(Arc::new(cfg), Arc::new(tools)))
}

async fn watch(cfg: DaemonConfig) -> Result<()> {
    info!("vodflow daemon starting");
    info!("  watch areas: {}", cfg.watch_areas.len());
    for area in &cfg.watch_areas {
        info!(
            "    {} (private: {})",
            area.dir.display(),
            area.private
        );
        if !area.dir.exists() {
            warn!("    area does not exist yet");
        }
    }
    info!("  production dir: {}", cfg.production_dir.display());
    info!("  manifest: {}", cfg.manifest_path.display());
    info!(
        "  CDN publishing: {}",
        if cfg.bunny_stream.is_some() { "configured" } else { "off" }
    );

    std::fs::create_dir_all(&cfg.production_dir).with_context(|| {
        format!("Failed to create production dir: {}", cfg.production_dir.display())
    })?;

    let ctx = context(cfg)?;
    Watcher::new(ctx).run().await
}

async fn process_one(cfg: DaemonConfig, dir: PathBuf) -> Result<()> {
    let ctx = context(cfg)?;
    process_project(&ctx, &dir)
        .await
        .with_context(|| format!("Pipeline failed for {}", dir.display()))
}
