use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use log::{info, warn};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::bunny::{video_title, BunnyClient};
use crate::config::{AudioConfig, DaemonConfig, ProjectConfig};
use crate::manifest::{Manifest, ManifestEntry};
use crate::probe::{detect_format, probe_dimensions, FormatTag};
use crate::stage::{StageError, StageRunner};
use crate::status::{StageOutcome, StatusRecord};
use crate::tools::ToolSet;

const MASTER_EXTENSIONS: [&str; 2] = ["mp4", "mov"];

/// Shared state handed to every project worker
#[derive(Clone)]
pub struct WorkerContext {
    pub cfg: Arc<DaemonConfig>,
    pub tools: Arc<ToolSet>,
    /// Serializes read-modify-write of the shared showcase manifest across
    /// concurrently finishing projects
    pub manifest_lock: Arc<Mutex<()>>,
}

impl WorkerContext {
    pub fn new(cfg: Arc<DaemonConfig>, tools: Arc<ToolSet>) -> Self {
        Self {
            cfg,
            tools,
            manifest_lock: Arc::new(Mutex::new(())),
        }
    }
}

/// Run the full stage sequence for one project workspace.
///
/// Every stage consults `status.json` before executing and records its
/// outcome immediately after, so a crashed or killed run resumes where it
/// left off instead of redoing finished work.
pub async fn process_project(ctx: &WorkerContext, project_dir: &Path) -> Result<()> {
    let project = ProjectConfig::load(project_dir)?;
    let mut status = StatusRecord::load(project_dir)?;

    let master = match find_master(project_dir)? {
        Some(m) => m,
        // No status write: the project stays eligible for the stuck sweep
        None => bail!("no master video found in {}", project_dir.display()),
    };

    let output_dir = project_dir.join("output");
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output dir: {}", output_dir.display()))?;

    let runner = StageRunner::new(
        &ctx.cfg.retry_backoff_secs,
        ctx.cfg.stage_retries,
        project_dir.join("logs").join("pipeline.log"),
    );

    info!("processing project `{}` ({})", project.id, master.display());

    let source = run_audio_stage(ctx, &runner, &project, project_dir, &master, &mut status).await?;
    run_caption_stages(ctx, &runner, &project, project_dir, &source, &mut status).await?;
    let source = run_branding_stage(ctx, &runner, &project, project_dir, &source, &mut status).await?;
    run_format_stages(ctx, &runner, &project, project_dir, &source, &mut status).await?;
    let publishing = run_publish_stage(ctx, &project, project_dir, &mut status).await?;

    status.last_update = Some(Utc::now());
    status.save(project_dir)?;
    write_inventory(project_dir, &project, &status)?;
    update_manifest(ctx, &project, &status).await?;

    // With a CDN target configured, finishing without a single playback URL
    // is a failure worth surfacing; the status record keeps partial progress
    // so a rerun only redoes what is missing.
    if publishing && status.bunny_urls.is_empty() {
        bail!("no renditions published for `{}`", project.id);
    }

    info!("project `{}` finished", project.id);
    Ok(())
}

/// Newest export dropped at the workspace root, by name order. Artifacts all
/// live under `output/` so a plain directory listing is unambiguous.
pub fn find_master(project_dir: &Path) -> Result<Option<PathBuf>> {
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(project_dir)
        .with_context(|| format!("Failed to list project dir: {}", project_dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| MASTER_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
        })
        .collect();
    candidates.sort();
    Ok(candidates.into_iter().next())
}

/// Path of the rendition artifact for one format tag
pub fn format_artifact(project_dir: &Path, tag: &str) -> PathBuf {
    project_dir.join("output").join("formats").join(format!("web_{}.mp4", tag))
}

fn optimized_path(project_dir: &Path) -> PathBuf {
    project_dir.join("output").join("video_optimized.mp4")
}

fn branded_path(project_dir: &Path) -> PathBuf {
    project_dir.join("output").join("video_branded.mp4")
}

/// Audio filter chain for the cleanup stage. All options off still runs a
/// null filter so the stage always produces the optimized artifact.
fn audio_filter(cfg: &AudioConfig) -> String {
    let mut filters = Vec::new();
    if cfg.denoise {
        filters.push("afftdn=nf=-25".to_string());
    }
    if cfg.enhance_speech {
        filters.push("highpass=f=80".to_string());
        filters.push("acompressor=threshold=-12dB:ratio=2:attack=5:release=50".to_string());
    }
    if cfg.normalize {
        filters.push("loudnorm=I=-16:TP=-1.5:LRA=11".to_string());
    }
    if filters.is_empty() {
        filters.push("anull".to_string());
    }
    filters.join(",")
}

async fn run_audio_stage(
    ctx: &WorkerContext,
    runner: &StageRunner,
    project: &ProjectConfig,
    project_dir: &Path,
    master: &Path,
    status: &mut StatusRecord,
) -> Result<PathBuf> {
    if !project.audio.enabled {
        if status.audio.is_none() {
            status.audio = Some(StageOutcome::Skipped);
            status.save(project_dir)?;
        }
        return Ok(master.to_path_buf());
    }

    let out = optimized_path(project_dir);
    if status.audio == Some(StageOutcome::Done) && out.exists() {
        return Ok(out);
    }

    let args = vec![
        "-y".to_string(),
        "-i".to_string(),
        master.display().to_string(),
        "-af".to_string(),
        audio_filter(&project.audio),
        "-c:v".to_string(),
        "copy".to_string(),
        out.display().to_string(),
    ];

    let outcome = match runner.run("audio", &ctx.tools.ffmpeg, &args).await {
        Ok(()) => StageOutcome::Done,
        Err(StageError::ToolMissing(tool)) => {
            warn!("audio stage unavailable, `{}` not found", tool);
            StageOutcome::Unavailable
        }
        Err(e) => {
            warn!("audio stage failed for `{}`: {}", project.id, e);
            StageOutcome::Warning
        }
    };

    status.audio = Some(outcome);
    status.save(project_dir)?;

    // Downstream stages fall back to the untouched master on soft failure
    if outcome == StageOutcome::Done {
        Ok(out)
    } else {
        Ok(master.to_path_buf())
    }
}

async fn run_caption_stages(
    ctx: &WorkerContext,
    runner: &StageRunner,
    project: &ProjectConfig,
    project_dir: &Path,
    source: &Path,
    status: &mut StatusRecord,
) -> Result<()> {
    if !project.captions.enabled {
        return Ok(());
    }

    let languages: Vec<String> = if project.languages.is_empty() {
        vec!["en".to_string()]
    } else {
        project.languages.clone()
    };

    let captions_dir = project_dir.join("output").join("captions");
    let scratch_dir = project_dir.join("output").join("transcribe");

    for language in &languages {
        if status.caption_done(language) {
            continue;
        }

        let outcome = match crate::captions::transcribe(
            &ctx.tools,
            runner,
            source,
            language,
            &captions_dir,
            &scratch_dir,
        )
        .await
        {
            Ok(_) => StageOutcome::Done,
            Err(StageError::ToolMissing(_)) => StageOutcome::Unavailable,
            Err(e) => {
                warn!("captions ({}) failed for `{}`: {}", language, project.id, e);
                StageOutcome::Warning
            }
        };

        status.captions.insert(language.clone(), outcome);
        status.save(project_dir)?;

        // Recognizer missing for one language means missing for all
        if outcome == StageOutcome::Unavailable {
            for lang in &languages {
                status.captions.entry(lang.clone()).or_insert(StageOutcome::Unavailable);
            }
            status.save(project_dir)?;
            break;
        }
    }

    Ok(())
}

async fn run_branding_stage(
    ctx: &WorkerContext,
    runner: &StageRunner,
    project: &ProjectConfig,
    project_dir: &Path,
    source: &Path,
    status: &mut StatusRecord,
) -> Result<PathBuf> {
    if !project.branding.enabled {
        if status.branding.is_none() {
            status.branding = Some(StageOutcome::Skipped);
            status.save(project_dir)?;
        }
        return Ok(source.to_path_buf());
    }

    let out = branded_path(project_dir);
    if status.branding == Some(StageOutcome::Done) && out.exists() {
        return Ok(out);
    }

    let outro = match project.branding.outro.as_deref() {
        Some(p) if p.exists() => p,
        _ => {
            warn!("outro clip missing for `{}`, skipping branding", project.id);
            status.branding = Some(StageOutcome::MissingOutro);
            status.save(project_dir)?;
            return Ok(source.to_path_buf());
        }
    };

    let args = vec![
        "-y".to_string(),
        "-i".to_string(),
        source.display().to_string(),
        "-i".to_string(),
        outro.display().to_string(),
        "-filter_complex".to_string(),
        "[0:v][0:a][1:v][1:a]concat=n=2:v=1:a=1[v][a]".to_string(),
        "-map".to_string(),
        "[v]".to_string(),
        "-map".to_string(),
        "[a]".to_string(),
        out.display().to_string(),
    ];

    let outcome = match runner.run("branding", &ctx.tools.ffmpeg, &args).await {
        Ok(()) => StageOutcome::Done,
        Err(StageError::ToolMissing(tool)) => {
            warn!("branding stage unavailable, `{}` not found", tool);
            StageOutcome::Unavailable
        }
        Err(e) => {
            warn!("branding stage failed for `{}`: {}", project.id, e);
            StageOutcome::Warning
        }
    };

    status.branding = Some(outcome);
    status.save(project_dir)?;

    if outcome == StageOutcome::Done {
        Ok(out)
    } else {
        Ok(source.to_path_buf())
    }
}

/// Format tags to render: the configured map, or a single auto-detected tag
/// measured from the source when the map is empty.
async fn planned_formats(
    ctx: &WorkerContext,
    project: &ProjectConfig,
    source: &Path,
) -> Result<Vec<(String, bool)>> {
    if !project.formats.is_empty() {
        return Ok(project
            .formats
            .iter()
            .map(|(tag, enabled)| (tag.clone(), *enabled))
            .collect());
    }

    let (w, h) = probe_dimensions(&ctx.tools, source).await?;
    let tag = detect_format(w, h);
    info!("auto-detected format {} from {}x{}", tag.as_str(), w, h);
    Ok(vec![(tag.as_str().to_string(), true)])
}

async fn run_format_stages(
    ctx: &WorkerContext,
    runner: &StageRunner,
    project: &ProjectConfig,
    project_dir: &Path,
    source: &Path,
    status: &mut StatusRecord,
) -> Result<()> {
    let formats_dir = project_dir.join("output").join("formats");
    std::fs::create_dir_all(&formats_dir)
        .with_context(|| format!("Failed to create formats dir: {}", formats_dir.display()))?;

    for (tag, enabled) in planned_formats(ctx, project, source).await? {
        if !enabled {
            status.formats.entry(tag.clone()).or_insert(StageOutcome::Skipped);
            status.save(project_dir)?;
            continue;
        }
        if status.format_done(&tag) {
            continue;
        }

        let format = match FormatTag::from_str(&tag) {
            Some(f) => f,
            None => {
                warn!("unknown format tag `{}` in `{}`, skipping", tag, project.id);
                status.formats.insert(tag, StageOutcome::Skipped);
                status.save(project_dir)?;
                continue;
            }
        };

        let out = format_artifact(project_dir, &tag);
        let args = vec![
            "-y".to_string(),
            "-i".to_string(),
            source.display().to_string(),
            "-vf".to_string(),
            format.scale_filter(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            "medium".to_string(),
            "-crf".to_string(),
            "20".to_string(),
            "-c:a".to_string(),
            "aac".to_string(),
            "-movflags".to_string(),
            "+faststart".to_string(),
            out.display().to_string(),
        ];

        let stage = format!("format_{}", tag);
        let outcome = match runner.run(&stage, &ctx.tools.ffmpeg, &args).await {
            Ok(()) => StageOutcome::Done,
            Err(StageError::ToolMissing(tool)) => {
                warn!("format stage unavailable, `{}` not found", tool);
                StageOutcome::Unavailable
            }
            Err(e) => {
                warn!("format {} failed for `{}`: {}", tag, project.id, e);
                StageOutcome::Warning
            }
        };

        status.formats.insert(tag, outcome);
        status.save(project_dir)?;
    }

    Ok(())
}

/// Upload every rendition that is transcoded but not yet published. A failed
/// upload leaves the format done-without-URL, so the next run retries it.
/// Returns whether a usable CDN target was configured.
async fn run_publish_stage(
    ctx: &WorkerContext,
    project: &ProjectConfig,
    project_dir: &Path,
    status: &mut StatusRecord,
) -> Result<bool> {
    let bunny_cfg = project
        .bunny_stream
        .as_ref()
        .or(ctx.cfg.bunny_stream.as_ref());

    let Some(bunny_cfg) = bunny_cfg else {
        return Ok(false);
    };
    if bunny_cfg.access_key.is_empty() || bunny_cfg.library_id.is_empty() {
        warn!("CDN target not fully configured, skipping publish for `{}`", project.id);
        return Ok(false);
    }

    let client = BunnyClient::new(bunny_cfg)?;

    for tag in status.unpublished_formats() {
        let artifact = format_artifact(project_dir, &tag);
        if !artifact.exists() {
            warn!("rendition {} missing for `{}`, not publishing", tag, project.id);
            continue;
        }

        let title = video_title(&project.id, &tag);
        match client.publish(&artifact, &title).await {
            Ok(url) => {
                status.bunny_urls.insert(tag, url);
                status.save(project_dir)?;
            }
            Err(e) => {
                warn!("publish of \"{}\" failed: {:#}", title, e);
            }
        }
    }

    Ok(true)
}

#[derive(Debug, Serialize)]
struct InventorySummary<'a> {
    id: &'a str,
    private: bool,
    audio: Option<StageOutcome>,
    branding: Option<StageOutcome>,
    captions: &'a BTreeMap<String, StageOutcome>,
    formats: &'a BTreeMap<String, StageOutcome>,
    bunny_urls: &'a BTreeMap<String, String>,
    generated_at: chrono::DateTime<Utc>,
}

/// Machine- and spreadsheet-readable summaries of what this run produced
fn write_inventory(project_dir: &Path, project: &ProjectConfig, status: &StatusRecord) -> Result<()> {
    let dir = project_dir.join("output").join("inventory");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create inventory dir: {}", dir.display()))?;

    let summary = InventorySummary {
        id: &project.id,
        private: project.private,
        audio: status.audio,
        branding: status.branding,
        captions: &status.captions,
        formats: &status.formats,
        bunny_urls: &status.bunny_urls,
        generated_at: Utc::now(),
    };
    let json = serde_json::to_string_pretty(&summary).context("Failed to serialize inventory")?;
    std::fs::write(dir.join("inventory.json"), json).context("Failed to write inventory.json")?;

    let mut csv = String::from("section,key,value\n");
    if let Some(outcome) = status.audio {
        csv.push_str(&format!("audio,,{}\n", outcome_str(outcome)));
    }
    if let Some(outcome) = status.branding {
        csv.push_str(&format!("branding,,{}\n", outcome_str(outcome)));
    }
    for (lang, outcome) in &status.captions {
        csv.push_str(&format!("captions,{},{}\n", lang, outcome_str(*outcome)));
    }
    for (tag, outcome) in &status.formats {
        csv.push_str(&format!("formats,{},{}\n", tag, outcome_str(*outcome)));
    }
    for (tag, url) in &status.bunny_urls {
        csv.push_str(&format!("published,{},{}\n", tag, url));
    }
    std::fs::write(dir.join("inventory.csv"), csv).context("Failed to write inventory.csv")?;

    Ok(())
}

fn outcome_str(outcome: StageOutcome) -> &'static str {
    match outcome {
        StageOutcome::Done => "done",
        StageOutcome::Warning => "warning",
        StageOutcome::Skipped => "skipped",
        StageOutcome::Unavailable => "unavailable",
        StageOutcome::MissingOutro => "missing_outro",
    }
}

/// Projects appear in the public showcase only once something is playable
async fn update_manifest(
    ctx: &WorkerContext,
    project: &ProjectConfig,
    status: &StatusRecord,
) -> Result<()> {
    if status.bunny_urls.is_empty() {
        info!("no published renditions for `{}`, showcase unchanged", project.id);
        return Ok(());
    }

    let _guard = ctx.manifest_lock.lock().await;
    let mut manifest = Manifest::load(&ctx.cfg.manifest_path);
    manifest.upsert(ManifestEntry::from_status(
        &project.id,
        project.private,
        status,
    ));
    manifest.save(&ctx.cfg.manifest_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BrandingConfig, CaptionsConfig};
    use std::os::unix::fs::PermissionsExt;

    fn context_with(cfg: DaemonConfig, tools: ToolSet) -> WorkerContext {
        WorkerContext::new(Arc::new(cfg), Arc::new(tools))
    }

    /// Stub transcoder that creates its last argument as a file, standing in
    /// for ffmpeg in sequencing tests
    fn stub_ffmpeg(dir: &Path) -> PathBuf {
        let path = dir.join("ffmpeg");
        std::fs::write(
            &path,
            "#!/bin/sh\nfor last; do :; done\nmkdir -p \"$(dirname \"$last\")\"\necho stub > \"$last\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn audio_filter_composes_enabled_options() {
        let cfg = AudioConfig {
            enabled: true,
            denoise: true,
            enhance_speech: true,
            normalize: true,
        };
        let chain = audio_filter(&cfg);
        assert!(chain.starts_with("afftdn=nf=-25,highpass=f=80,"));
        assert!(chain.ends_with("loudnorm=I=-16:TP=-1.5:LRA=11"));
    }

    #[test]
    fn audio_filter_defaults_to_null_filter() {
        let cfg = AudioConfig {
            enabled: true,
            ..AudioConfig::default()
        };
        assert_eq!(audio_filter(&cfg), "anull");
    }

    #[test]
    fn find_master_picks_first_by_name_and_ignores_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b_take2.mp4"), b"x").unwrap();
        std::fs::write(dir.path().join("a_take1.mov"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        std::fs::create_dir_all(dir.path().join("output")).unwrap();
        std::fs::write(dir.path().join("output").join("video_optimized.mp4"), b"x").unwrap();

        let master = find_master(dir.path()).unwrap().unwrap();
        assert_eq!(master.file_name().unwrap(), "a_take1.mov");
    }

    #[test]
    fn find_master_empty_project_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_master(dir.path()).unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_master_bails_without_status_write() {
        let dir = tempfile::tempdir().unwrap();
        ProjectConfig {
            id: "empty".to_string(),
            ..ProjectConfig::default()
        }
        .save(dir.path())
        .unwrap();

        let tools = ToolSet {
            ffmpeg: PathBuf::from("/bin/true"),
            ffprobe: PathBuf::from("/bin/true"),
            whisper: None,
        };
        let ctx = context_with(DaemonConfig::default_config(), tools);

        assert!(process_project(&ctx, dir.path()).await.is_err());
        assert!(!dir.path().join("status.json").exists());
    }

    #[tokio::test]
    async fn full_sequence_records_expected_outcomes() {
        let root = tempfile::tempdir().unwrap();
        let project_dir = root.path().join("Demo");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::write(project_dir.join("Demo.mp4"), b"master bytes").unwrap();

        let mut formats = BTreeMap::new();
        formats.insert("16x9".to_string(), true);
        formats.insert("1x1".to_string(), false);
        ProjectConfig {
            id: "Demo".to_string(),
            private: false,
            audio: AudioConfig {
                enabled: true,
                normalize: true,
                ..AudioConfig::default()
            },
            captions: CaptionsConfig { enabled: false },
            languages: vec![],
            branding: BrandingConfig {
                enabled: true,
                outro: Some(root.path().join("no_such_outro.mp4")),
            },
            formats,
            bunny_stream: None,
        }
        .save(&project_dir)
        .unwrap();

        let ffmpeg = stub_ffmpeg(root.path());
        let tools = ToolSet {
            ffprobe: ffmpeg.clone(),
            ffmpeg,
            whisper: None,
        };
        let mut cfg = DaemonConfig::default_config();
        cfg.retry_backoff_secs = vec![0];
        cfg.manifest_path = root.path().join("showcase.json");
        let ctx = context_with(cfg, tools);

        process_project(&ctx, &project_dir).await.unwrap();

        let status = StatusRecord::load(&project_dir).unwrap();
        assert_eq!(status.audio, Some(StageOutcome::Done));
        assert_eq!(status.branding, Some(StageOutcome::MissingOutro));
        assert_eq!(status.formats.get("16x9"), Some(&StageOutcome::Done));
        assert_eq!(status.formats.get("1x1"), Some(&StageOutcome::Skipped));
        assert!(status.bunny_urls.is_empty());
        assert!(status.last_update.is_some());

        assert!(project_dir.join("output").join("video_optimized.mp4").exists());
        assert!(format_artifact(&project_dir, "16x9").exists());
        assert!(project_dir.join("output").join("inventory").join("inventory.json").exists());
        assert!(project_dir.join("logs").join("pipeline.log").exists());

        // Nothing published, so nothing showcased
        assert!(!root.path().join("showcase.json").exists());
    }

    /// Stub recognizer that writes `<stem>.json` into its `--output_dir`
    fn stub_whisper(dir: &Path) -> PathBuf {
        let path = dir.join("whisper");
        std::fs::write(
            &path,
            concat!(
                "#!/bin/sh\n",
                "master=\"$1\"\n",
                "for last; do :; done\n",
                "mkdir -p \"$last\"\n",
                "stem=$(basename \"$master\"); stem=\"${stem%.*}\"\n",
                "printf '{\"text\":\"bonjour\",\"segments\":[{\"start\":0.0,\"end\":1.5,\"text\":\"bonjour\"}]}' > \"$last/$stem.json\"\n",
            ),
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn caption_artifacts_land_under_output() {
        let root = tempfile::tempdir().unwrap();
        let project_dir = root.path().join("Talk");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::write(project_dir.join("Talk.mp4"), b"master").unwrap();

        let mut formats = BTreeMap::new();
        formats.insert("16x9".to_string(), false);
        ProjectConfig {
            id: "Talk".to_string(),
            captions: CaptionsConfig { enabled: true },
            languages: vec!["fr".to_string()],
            formats,
            ..ProjectConfig::default()
        }
        .save(&project_dir)
        .unwrap();

        let ffmpeg = stub_ffmpeg(root.path());
        let tools = ToolSet {
            ffprobe: ffmpeg.clone(),
            ffmpeg,
            whisper: Some(stub_whisper(root.path())),
        };
        let mut cfg = DaemonConfig::default_config();
        cfg.retry_backoff_secs = vec![0];
        cfg.manifest_path = root.path().join("showcase.json");
        let ctx = context_with(cfg, tools);

        process_project(&ctx, &project_dir).await.unwrap();

        let status = StatusRecord::load(&project_dir).unwrap();
        assert_eq!(status.captions.get("fr"), Some(&StageOutcome::Done));

        let captions_dir = project_dir.join("output").join("captions");
        assert!(captions_dir.join("Talk.fr.vtt").exists());
        assert!(captions_dir.join("Talk.fr.srt").exists());
        assert!(captions_dir.join("Talk.fr.txt").exists());
        assert!(!project_dir.join("captions").exists());
    }

    #[tokio::test]
    async fn failing_format_warns_while_siblings_finish() {
        let root = tempfile::tempdir().unwrap();
        let project_dir = root.path().join("Mixed");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::write(project_dir.join("Mixed.mp4"), b"master").unwrap();

        let mut formats = BTreeMap::new();
        formats.insert("16x9".to_string(), true);
        formats.insert("9x16".to_string(), true);
        ProjectConfig {
            id: "Mixed".to_string(),
            formats,
            ..ProjectConfig::default()
        }
        .save(&project_dir)
        .unwrap();

        // Transcoder that fails for exactly the portrait rendition
        let ffmpeg = root.path().join("ffmpeg");
        std::fs::write(
            &ffmpeg,
            concat!(
                "#!/bin/sh\n",
                "for last; do :; done\n",
                "case \"$last\" in *web_9x16*) exit 1;; esac\n",
                "mkdir -p \"$(dirname \"$last\")\"\n",
                "echo stub > \"$last\"\n",
            ),
        )
        .unwrap();
        std::fs::set_permissions(&ffmpeg, std::fs::Permissions::from_mode(0o755)).unwrap();

        let tools = ToolSet {
            ffprobe: ffmpeg.clone(),
            ffmpeg,
            whisper: None,
        };
        let mut cfg = DaemonConfig::default_config();
        cfg.retry_backoff_secs = vec![0];
        cfg.manifest_path = root.path().join("showcase.json");
        let ctx = context_with(cfg, tools);

        process_project(&ctx, &project_dir).await.unwrap();

        let status = StatusRecord::load(&project_dir).unwrap();
        assert_eq!(status.formats.get("16x9"), Some(&StageOutcome::Done));
        assert_eq!(status.formats.get("9x16"), Some(&StageOutcome::Warning));
        assert!(format_artifact(&project_dir, "16x9").exists());
        assert!(!format_artifact(&project_dir, "9x16").exists());
    }

    #[tokio::test]
    async fn rerun_skips_finished_stages() {
        let root = tempfile::tempdir().unwrap();
        let project_dir = root.path().join("Rerun");
        std::fs::create_dir_all(&project_dir).unwrap();
        std::fs::write(project_dir.join("Rerun.mp4"), b"master").unwrap();

        let mut formats = BTreeMap::new();
        formats.insert("16x9".to_string(), true);
        ProjectConfig {
            id: "Rerun".to_string(),
            audio: AudioConfig {
                enabled: true,
                ..AudioConfig::default()
            },
            formats,
            ..ProjectConfig::default()
        }
        .save(&project_dir)
        .unwrap();

        let ffmpeg = stub_ffmpeg(root.path());
        let tools = ToolSet {
            ffprobe: ffmpeg.clone(),
            ffmpeg,
            whisper: None,
        };
        let mut cfg = DaemonConfig::default_config();
        cfg.retry_backoff_secs = vec![0];
        cfg.manifest_path = root.path().join("showcase.json");
        let ctx = context_with(cfg, tools);

        process_project(&ctx, &project_dir).await.unwrap();
        let first = StatusRecord::load(&project_dir).unwrap();

        // Sentinel content survives a rerun only if the stage is skipped
        let artifact = format_artifact(&project_dir, "16x9");
        std::fs::write(&artifact, b"already transcoded").unwrap();

        process_project(&ctx, &project_dir).await.unwrap();
        let second = StatusRecord::load(&project_dir).unwrap();

        assert_eq!(first.formats, second.formats);
        assert_eq!(std::fs::read(&artifact).unwrap(), b"already transcoded");
    }
}
