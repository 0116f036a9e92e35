use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::task::JoinSet;

use crate::config::{ProjectConfig, WatchArea};
use crate::stable::is_stable;
use crate::worker::{process_project, WorkerContext};

const MASTER_NAMES: [&str; 2] = ["video_master.mp4", "video_master.mov"];

/// A discovered export, before it is materialized into a workspace
struct Candidate {
    /// Entry in the watch area, used for the stability gate and the seen set
    entry: PathBuf,
    /// The master file to move into the workspace
    master: PathBuf,
    /// Project id derived from the file stem or folder name
    id: String,
}

/// Polls the watch areas for finished exports and hands each new project to
/// a worker task.
///
/// The seen set is keyed by source path and only populated after successful
/// hand-off, so a half-copied or failed intake is retried on the next poll
/// rather than lost. Restarting the daemon re-discovers sources, but intake
/// moves the export out of the area, so nothing is processed twice.
pub struct Watcher {
    ctx: WorkerContext,
    seen: HashSet<PathBuf>,
    workers: JoinSet<()>,
}

impl Watcher {
    pub fn new(ctx: WorkerContext) -> Self {
        Self {
            ctx,
            seen: HashSet::new(),
            workers: JoinSet::new(),
        }
    }

    /// Poll loop. Errors from a single iteration are logged, never fatal.
    pub async fn run(&mut self) -> Result<()> {
        let interval = Duration::from_secs(self.ctx.cfg.poll_interval_secs);
        info!(
            "watching {} area(s), polling every {}s",
            self.ctx.cfg.watch_areas.len(),
            self.ctx.cfg.poll_interval_secs
        );

        loop {
            if let Err(e) = self.scan_once().await {
                error!("scan iteration failed: {:#}", e);
            }
            self.reap_workers();
            tokio::time::sleep(interval).await;
        }
    }

    /// One pass over every watch area. Returns the number of projects
    /// handed to workers.
    pub async fn scan_once(&mut self) -> Result<usize> {
        let areas = self.ctx.cfg.watch_areas.clone();
        let mut started = 0;

        for area in &areas {
            if !area.dir.is_dir() {
                warn!("watch area {} does not exist", area.dir.display());
                continue;
            }
            match self.scan_area(area).await {
                Ok(n) => started += n,
                Err(e) => error!("scan of {} failed: {:#}", area.dir.display(), e),
            }
        }

        Ok(started)
    }

    async fn scan_area(&mut self, area: &WatchArea) -> Result<usize> {
        let entries = std::fs::read_dir(&area.dir)
            .with_context(|| format!("Failed to list watch area: {}", area.dir.display()))?;
        let mut started = 0;

        for entry in entries {
            let path = entry?.path();
            if self.seen.contains(&path) || is_hidden(&path) {
                continue;
            }
            let Some(candidate) = resolve_candidate(&path) else {
                continue;
            };

            let window = Duration::from_secs(self.ctx.cfg.stability_window_secs);
            if !is_stable(&candidate.entry, window).await? {
                info!("{} still changing, will re-check", candidate.entry.display());
                continue;
            }

            match self.intake(area, &candidate) {
                Ok(project_dir) => {
                    self.seen.insert(path);
                    self.spawn_worker(project_dir);
                    started += 1;
                }
                Err(e) => error!("intake of {} failed: {:#}", candidate.entry.display(), e),
            }
        }

        Ok(started)
    }

    /// Materialize the workspace: move the master in, write the project
    /// config from the area template, seed an empty status record.
    fn intake(&self, area: &WatchArea, candidate: &Candidate) -> Result<PathBuf> {
        let id = unique_project_id(&self.ctx.cfg.production_dir, &candidate.id);
        let project_dir = self.ctx.cfg.production_dir.join(&id);
        std::fs::create_dir_all(&project_dir)
            .with_context(|| format!("Failed to create workspace: {}", project_dir.display()))?;

        let file_name = candidate
            .master
            .file_name()
            .context("master path has no file name")?;
        move_file(&candidate.master, &project_dir.join(file_name))?;

        ProjectConfig::from_template(area.template.as_deref(), &id, area.private)?
            .save(&project_dir)?;
        std::fs::write(project_dir.join("status.json"), "{}")
            .with_context(|| format!("Failed to seed status record in {}", project_dir.display()))?;

        info!(
            "new project `{}` from {} (private: {})",
            id,
            candidate.entry.display(),
            area.private
        );
        Ok(project_dir)
    }

    fn spawn_worker(&mut self, project_dir: PathBuf) {
        let ctx = self.ctx.clone();
        self.workers.spawn(async move {
            if let Err(e) = process_project(&ctx, &project_dir).await {
                error!("pipeline failed for {}: {:#}", project_dir.display(), e);
            }
        });
    }

    fn reap_workers(&mut self) {
        while let Some(result) = self.workers.try_join_next() {
            if let Err(e) = result {
                error!("worker task panicked: {}", e);
            }
        }
    }

    /// Wait for every in-flight worker to finish (used on shutdown and by
    /// tests)
    pub async fn drain(&mut self) {
        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                error!("worker task panicked: {}", e);
            }
        }
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(true)
}

/// A bare media file, or a folder containing a well-known master name
fn resolve_candidate(path: &Path) -> Option<Candidate> {
    if path.is_file() {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        if ext != "mp4" && ext != "mov" {
            return None;
        }
        let id = path.file_stem()?.to_str()?.to_string();
        return Some(Candidate {
            entry: path.to_path_buf(),
            master: path.to_path_buf(),
            id,
        });
    }

    if path.is_dir() {
        for name in MASTER_NAMES {
            let master = path.join(name);
            if master.is_file() {
                let id = path.file_name()?.to_str()?.to_string();
                return Some(Candidate {
                    entry: path.to_path_buf(),
                    master,
                    id,
                });
            }
        }
    }

    None
}

/// First free id: the plain name, then `_v2`, `_v3`, ...
pub fn unique_project_id(production_dir: &Path, id: &str) -> String {
    if !production_dir.join(id).exists() {
        return id.to_string();
    }
    let mut n = 2;
    loop {
        let versioned = format!("{}_v{}", id, n);
        if !production_dir.join(&versioned).exists() {
            return versioned;
        }
        n += 1;
    }
}

/// Rename, with a copy-and-remove fallback for cross-filesystem moves
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    std::fs::copy(from, to)
        .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))?;
    std::fs::remove_file(from)
        .with_context(|| format!("Failed to remove {}", from.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::tools::ToolSet;
    use std::sync::Arc;

    fn test_watcher(root: &Path, template: Option<PathBuf>) -> Watcher {
        let mut cfg = DaemonConfig::default_config();
        cfg.watch_areas = vec![WatchArea {
            dir: root.join("exports"),
            private: true,
            template,
        }];
        cfg.production_dir = root.join("production");
        cfg.manifest_path = root.join("showcase.json");
        cfg.stability_window_secs = 0;
        std::fs::create_dir_all(&cfg.watch_areas[0].dir).unwrap();
        std::fs::create_dir_all(&cfg.production_dir).unwrap();

        let tools = ToolSet {
            ffmpeg: PathBuf::from("/bin/true"),
            ffprobe: PathBuf::from("/bin/true"),
            whisper: None,
        };
        Watcher::new(WorkerContext::new(Arc::new(cfg), Arc::new(tools)))
    }

    /// Template that disables every stage so spawned workers finish without
    /// touching external tools
    fn inert_template(root: &Path) -> PathBuf {
        let path = root.join("template.json");
        std::fs::write(&path, r#"{"formats": {"16x9": false}}"#).unwrap();
        path
    }

    #[test]
    fn unique_id_appends_version_suffix() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(unique_project_id(dir.path(), "Demo"), "Demo");

        std::fs::create_dir_all(dir.path().join("Demo")).unwrap();
        assert_eq!(unique_project_id(dir.path(), "Demo"), "Demo_v2");

        std::fs::create_dir_all(dir.path().join("Demo_v2")).unwrap();
        assert_eq!(unique_project_id(dir.path(), "Demo"), "Demo_v3");
    }

    #[test]
    fn candidates_are_media_files_or_master_folders() {
        let dir = tempfile::tempdir().unwrap();
        let clip = dir.path().join("Talk.MOV");
        std::fs::write(&clip, b"x").unwrap();
        assert_eq!(resolve_candidate(&clip).unwrap().id, "Talk");

        let folder = dir.path().join("Show");
        std::fs::create_dir_all(&folder).unwrap();
        assert!(resolve_candidate(&folder).is_none());
        std::fs::write(folder.join("video_master.mp4"), b"x").unwrap();
        let c = resolve_candidate(&folder).unwrap();
        assert_eq!(c.id, "Show");
        assert!(c.master.ends_with("video_master.mp4"));

        let note = dir.path().join("readme.txt");
        std::fs::write(&note, b"x").unwrap();
        assert!(resolve_candidate(&note).is_none());
    }

    #[tokio::test]
    async fn intake_materializes_workspace_and_moves_master() {
        let root = tempfile::tempdir().unwrap();
        let template = inert_template(root.path());
        let mut watcher = test_watcher(root.path(), Some(template));

        let export = root.path().join("exports").join("Keynote.mp4");
        std::fs::write(&export, b"finished export").unwrap();

        assert_eq!(watcher.scan_once().await.unwrap(), 1);
        watcher.drain().await;

        let project_dir = root.path().join("production").join("Keynote");
        assert!(!export.exists());
        assert_eq!(
            std::fs::read(project_dir.join("Keynote.mp4")).unwrap(),
            b"finished export"
        );

        let cfg = ProjectConfig::load(&project_dir).unwrap();
        assert_eq!(cfg.id, "Keynote");
        assert!(cfg.private);

        // Second pass finds nothing new
        assert_eq!(watcher.scan_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn folder_export_uses_folder_name_as_id() {
        let root = tempfile::tempdir().unwrap();
        let template = inert_template(root.path());
        let mut watcher = test_watcher(root.path(), Some(template));

        let folder = root.path().join("exports").join("Series_Ep1");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(folder.join("video_master.mov"), b"bytes").unwrap();

        assert_eq!(watcher.scan_once().await.unwrap(), 1);
        watcher.drain().await;

        let project_dir = root.path().join("production").join("Series_Ep1");
        assert!(project_dir.join("video_master.mov").exists());
        assert_eq!(ProjectConfig::load(&project_dir).unwrap().id, "Series_Ep1");
    }

    #[tokio::test]
    async fn name_collision_gets_version_suffix() {
        let root = tempfile::tempdir().unwrap();
        let template = inert_template(root.path());
        let mut watcher = test_watcher(root.path(), Some(template));
        std::fs::create_dir_all(root.path().join("production").join("Demo")).unwrap();

        std::fs::write(root.path().join("exports").join("Demo.mp4"), b"take two").unwrap();

        assert_eq!(watcher.scan_once().await.unwrap(), 1);
        watcher.drain().await;

        let versioned = root.path().join("production").join("Demo_v2");
        assert!(versioned.join("Demo.mp4").exists());
        assert_eq!(ProjectConfig::load(&versioned).unwrap().id, "Demo_v2");
    }

    #[tokio::test]
    async fn empty_export_is_not_taken_and_retried_later() {
        let root = tempfile::tempdir().unwrap();
        let mut watcher = test_watcher(root.path(), None);

        let export = root.path().join("exports").join("copying.mp4");
        std::fs::write(&export, b"").unwrap();

        assert_eq!(watcher.scan_once().await.unwrap(), 0);
        assert!(export.exists());
        assert!(!root.path().join("production").join("copying").exists());
    }

    #[tokio::test]
    async fn hidden_files_are_ignored() {
        let root = tempfile::tempdir().unwrap();
        let mut watcher = test_watcher(root.path(), None);
        std::fs::write(root.path().join("exports").join(".partial.mp4"), b"x").unwrap();

        assert_eq!(watcher.scan_once().await.unwrap(), 0);
    }
}
