use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One watched source area. The upstream editor drops finished exports here,
/// either as bare media files or as folders containing a well-known master name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchArea {
    /// Directory to poll for new exports
    pub dir: PathBuf,
    /// Projects discovered here are published as private
    #[serde(default)]
    pub private: bool,
    /// Project-config template applied to projects discovered here.
    /// When absent, `ProjectConfig::default()` is used.
    #[serde(default)]
    pub template: Option<PathBuf>,
}

/// Explicit external-tool paths. Anything left unset is resolved from PATH
/// at startup; resolution failure is a startup error, never a silent fallback
/// to a bare command name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPaths {
    pub ffmpeg: Option<PathBuf>,
    pub ffprobe: Option<PathBuf>,
    pub whisper: Option<PathBuf>,
}

/// Configuration for the vodflow daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Source areas polled for finished exports
    pub watch_areas: Vec<WatchArea>,
    /// Root directory where project workspaces are materialized
    pub production_dir: PathBuf,
    /// Public manifest file consumed by the presentation layer
    pub manifest_path: PathBuf,
    /// Seconds between watcher poll iterations
    pub poll_interval_secs: u64,
    /// Observation window for the size-stability gate, in seconds
    pub stability_window_secs: u64,
    /// Escalating delays between stage retries, in seconds
    pub retry_backoff_secs: Vec<u64>,
    /// Retries after the first failed attempt of a stage
    pub stage_retries: usize,
    /// Concurrent remote deletions during sync
    pub delete_concurrency: usize,
    /// CDN target used by the remote reconciliation pass
    pub bunny_stream: Option<BunnyStreamConfig>,
    /// External tool paths (resolved and validated at startup)
    pub tools: ToolPaths,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl DaemonConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            watch_areas: vec![WatchArea {
                dir: PathBuf::from("exports"),
                private: false,
                template: None,
            }],
            production_dir: PathBuf::from("production"),
            manifest_path: PathBuf::from("showcase.json"),
            poll_interval_secs: 5,
            stability_window_secs: 5,
            retry_backoff_secs: vec![5, 30, 120],
            stage_retries: 2,
            delete_concurrency: 5,
            bunny_stream: None,
            tools: ToolPaths::default(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // Try JSON first, then TOML
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    let file_config: DaemonConfig = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                    config = file_config;
                } else {
                    let file_config: DaemonConfig = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                    config = file_config;
                }
            }
        }

        if let Some(bunny) = config.bunny_stream.as_mut() {
            bunny.apply_env();
        }

        Ok(config)
    }
}

/// Bunny Stream target: one library plus the pull zone its playback URLs hang off
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BunnyStreamConfig {
    pub access_key: String,
    pub library_id: String,
    pub pull_zone_url: String,
}

impl BunnyStreamConfig {
    /// Overlay credentials from the environment so secrets can stay out of
    /// config files checked into a project workspace.
    pub fn apply_env(&mut self) {
        if let Ok(lib) = std::env::var("BUNNY_LIBRARY_ID") {
            self.library_id = lib;
        }
        if let Ok(key) = std::env::var("BUNNY_ACCESS_KEY") {
            self.access_key = key;
        }
        if let Ok(zone) = std::env::var("BUNNY_PULL_ZONE_URL") {
            self.pull_zone_url = zone;
        }
    }
}

/// Audio cleanup stage options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub enabled: bool,
    /// FFT denoiser (afftdn)
    pub denoise: bool,
    /// High-pass + gentle compression for voice content
    pub enhance_speech: bool,
    /// EBU R128 loudness normalization to -16 LUFS
    pub normalize: bool,
}

/// Transcription stage options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptionsConfig {
    pub enabled: bool,
}

/// Branding (outro concat) stage options
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BrandingConfig {
    pub enabled: bool,
    /// Outro clip appended to the master; its absence is a soft failure
    pub outro: Option<PathBuf>,
}

/// Per-project configuration (`config.json` inside the project workspace).
///
/// Every field has a default so a minimal `{"id": "..."}` file is valid;
/// unknown keys are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub id: String,
    pub private: bool,
    pub audio: AudioConfig,
    pub captions: CaptionsConfig,
    /// Languages to transcribe when captions are enabled
    pub languages: Vec<String>,
    pub branding: BrandingConfig,
    /// Target aspect formats, tag -> enabled. An empty map means auto-detect
    /// a single format from the master's measured dimensions.
    pub formats: BTreeMap<String, bool>,
    pub bunny_stream: Option<BunnyStreamConfig>,
}

impl ProjectConfig {
    /// Load the config of one project workspace
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join("config.json");
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read project config: {}", path.display()))?;
        let mut cfg: ProjectConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse project config: {}", path.display()))?;
        if let Some(bunny) = cfg.bunny_stream.as_mut() {
            bunny.apply_env();
        }
        Ok(cfg)
    }

    /// Write the config into a project workspace
    pub fn save(&self, project_dir: &Path) -> Result<()> {
        let path = project_dir.join("config.json");
        let content = serde_json::to_string_pretty(self)
            .context("Failed to serialize project config")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write project config: {}", path.display()))?;
        Ok(())
    }

    /// Build a project config from an area template, injecting identity.
    /// A missing template file falls back to defaults.
    pub fn from_template(template: Option<&Path>, id: &str, private: bool) -> Result<Self> {
        let mut cfg = match template {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config template: {}", path.display()))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse config template: {}", path.display()))?
            }
            _ => ProjectConfig::default(),
        };
        cfg.id = id.to_string();
        cfg.private = private;
        Ok(cfg)
    }
}
