use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::{Context, Result};
use log::{info, warn};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::bunny::{parse_title, BunnyClient, RemoteVideo};
use crate::manifest::Manifest;
use crate::status::StatusRecord;
use crate::worker::{process_project, WorkerContext};

/// Knobs of one reconciliation run
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Report what would change without changing anything
    pub dry_run: bool,
    /// Skip the interactive confirmation before remote deletion
    pub assume_yes: bool,
    /// Manifest pass only, leave the remote library untouched
    pub skip_remote: bool,
    /// Also collapse same-title remote duplicates onto the newest upload
    pub delete_duplicates: bool,
}

/// Ids of the project workspaces currently on disk
pub fn local_project_ids(production_dir: &Path) -> Result<HashSet<String>> {
    let mut ids = HashSet::new();
    let entries = std::fs::read_dir(production_dir)
        .with_context(|| format!("Failed to list production dir: {}", production_dir.display()))?;
    for entry in entries {
        let entry = entry?;
        if entry.path().is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                ids.insert(name.to_string());
            }
        }
    }
    Ok(ids)
}

/// Drop manifest entries whose project workspace no longer exists.
/// Returns the removed ids.
pub fn prune_manifest(manifest_path: &Path, local: &HashSet<String>, dry_run: bool) -> Result<Vec<String>> {
    let mut manifest = Manifest::load(manifest_path);
    let removed = manifest.retain_local(|id| local.contains(id));

    if removed.is_empty() {
        info!("manifest in sync, nothing to prune");
    } else if dry_run {
        info!("would prune {} manifest entries: {:?}", removed.len(), removed);
    } else {
        manifest.save(manifest_path)?;
        info!("pruned {} manifest entries: {:?}", removed.len(), removed);
    }

    Ok(removed)
}

/// Remote assets whose parsed project id has no local workspace
pub fn plan_orphans(remote: &[RemoteVideo], local: &HashSet<String>) -> Vec<RemoteVideo> {
    remote
        .iter()
        .filter(|v| {
            let (id, _) = parse_title(&v.title);
            !local.contains(&id)
        })
        .cloned()
        .collect()
}

/// Same-title remote assets beyond the newest upload of each title.
/// Assets without an upload date sort oldest.
pub fn plan_duplicates(remote: &[RemoteVideo]) -> Vec<RemoteVideo> {
    let mut by_title: HashMap<&str, Vec<&RemoteVideo>> = HashMap::new();
    for video in remote {
        by_title.entry(video.title.as_str()).or_default().push(video);
    }

    let mut doomed = Vec::new();
    for (_, mut group) in by_title {
        if group.len() < 2 {
            continue;
        }
        group.sort_by(|a, b| b.date_uploaded.cmp(&a.date_uploaded));
        doomed.extend(group[1..].iter().map(|v| (*v).clone()));
    }
    doomed
}

/// Delete remote assets with bounded concurrency. Individual failures are
/// logged and counted, not fatal; sync can be re-run.
pub async fn delete_videos(
    client: &BunnyClient,
    videos: Vec<RemoteVideo>,
    concurrency: usize,
) -> Result<usize> {
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for video in videos {
        let client = client.clone();
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let _permit = match semaphore.acquire().await {
                Ok(permit) => permit,
                Err(e) => {
                    warn!("failed to delete {} (\"{}\"): {}", video.guid, video.title, e);
                    return false;
                }
            };
            match client.delete(&video.guid).await {
                Ok(()) => {
                    info!("deleted remote asset {} (\"{}\")", video.guid, video.title);
                    true
                }
                Err(e) => {
                    warn!("failed to delete {} (\"{}\"): {:#}", video.guid, video.title, e);
                    false
                }
            }
        });
    }

    let mut deleted = 0;
    while let Some(result) = tasks.join_next().await {
        if result.context("delete task panicked")? {
            deleted += 1;
        }
    }
    Ok(deleted)
}

fn confirm_deletion(count: usize) -> Result<bool> {
    print!("Delete {} remote asset(s)? Type 'yes' to confirm: ", count);
    std::io::stdout().flush().context("Failed to flush stdout")?;

    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("Failed to read confirmation")?;
    Ok(answer.trim().eq_ignore_ascii_case("yes"))
}

/// Full reconciliation: prune the manifest against local workspaces,
/// re-run the pipeline for local projects the manifest does not list, then
/// (unless skipped) align the remote library with what exists locally.
pub async fn run_sync(ctx: &WorkerContext, opts: &SyncOptions) -> Result<()> {
    let cfg = &*ctx.cfg;
    let local = local_project_ids(&cfg.production_dir)?;
    info!("{} local project(s)", local.len());

    prune_manifest(&cfg.manifest_path, &local, opts.dry_run)?;
    reprocess_unlisted(ctx, &local, opts).await?;

    if opts.skip_remote {
        return Ok(());
    }
    let Some(bunny_cfg) = cfg.bunny_stream.as_ref() else {
        info!("no CDN target configured, remote pass skipped");
        return Ok(());
    };

    let client = BunnyClient::new(bunny_cfg)?;
    let remote = client.list_all().await?;
    info!("{} remote asset(s)", remote.len());

    let mut doomed = plan_orphans(&remote, &local);
    if opts.delete_duplicates {
        doomed.extend(plan_duplicates(&remote));
    }
    // An orphan can also be a duplicate
    doomed.sort_by(|a, b| a.guid.cmp(&b.guid));
    doomed.dedup_by(|a, b| a.guid == b.guid);

    if doomed.is_empty() {
        info!("remote library in sync, nothing to delete");
        return Ok(());
    }

    for video in &doomed {
        info!("to delete: {} (\"{}\")", video.guid, video.title);
    }
    if opts.dry_run {
        info!("dry run, {} asset(s) left in place", doomed.len());
        return Ok(());
    }
    if !opts.assume_yes && !confirm_deletion(doomed.len())? {
        info!("aborted, no assets deleted");
        return Ok(());
    }

    let deleted = delete_videos(&client, doomed, cfg.delete_concurrency).await?;
    info!("deleted {} remote asset(s)", deleted);
    Ok(())
}

/// Local presence is ground truth: a workspace the manifest does not list
/// gets its pipeline re-run, which republishes and re-inserts it if anything
/// is playable.
async fn reprocess_unlisted(
    ctx: &WorkerContext,
    local: &HashSet<String>,
    opts: &SyncOptions,
) -> Result<()> {
    let manifest = Manifest::load(&ctx.cfg.manifest_path);
    let mut unlisted: Vec<&String> = local
        .iter()
        .filter(|id| {
            !manifest.contains(id) && ctx.cfg.production_dir.join(id).join("config.json").exists()
        })
        .collect();
    unlisted.sort();

    if unlisted.is_empty() {
        return Ok(());
    }
    if opts.dry_run {
        info!("would reprocess {} unlisted project(s): {:?}", unlisted.len(), unlisted);
        return Ok(());
    }

    for id in unlisted {
        let project_dir = ctx.cfg.production_dir.join(id);
        info!("reprocessing unlisted project `{}`", id);
        if let Err(e) = process_project(ctx, &project_dir).await {
            warn!("reprocess of `{}` failed: {:#}", id, e);
        }
    }
    Ok(())
}

/// Workspaces whose status record is absent or empty: a worker claimed the
/// project (or crashed before starting it) but no stage ever finished.
pub fn find_stuck_projects(production_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut stuck = Vec::new();
    let entries = std::fs::read_dir(production_dir)
        .with_context(|| format!("Failed to list production dir: {}", production_dir.display()))?;

    for entry in entries {
        let path = entry?.path();
        if !path.is_dir() || !path.join("config.json").exists() {
            continue;
        }
        let empty = match StatusRecord::load(&path) {
            Ok(status) => status.is_empty(),
            // An unreadable record is treated as stuck, same as an absent one
            Err(_) => true,
        };
        if empty {
            stuck.push(path);
        }
    }

    stuck.sort();
    Ok(stuck)
}

/// Re-run the pipeline for every stuck workspace, one at a time. Returns the
/// number of projects that completed.
pub async fn retry_stuck(ctx: &WorkerContext) -> Result<usize> {
    let stuck = find_stuck_projects(&ctx.cfg.production_dir)?;
    if stuck.is_empty() {
        info!("no stuck projects");
        return Ok(0);
    }

    let mut completed = 0;
    for project_dir in stuck {
        info!("retrying stuck project {}", project_dir.display());
        match process_project(ctx, &project_dir).await {
            Ok(()) => completed += 1,
            Err(e) => warn!("retry of {} failed: {:#}", project_dir.display(), e),
        }
    }
    Ok(completed)
}
