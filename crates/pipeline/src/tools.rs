use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use log::warn;
use crate::config::ToolPaths;

/// Resolved external tool paths, validated at startup.
///
/// ffmpeg and ffprobe are required for every pipeline; whisper is only needed
/// when a project enables captions, so its absence is tolerated here and
/// surfaced as a per-stage outcome later.
#[derive(Debug, Clone)]
pub struct ToolSet {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub whisper: Option<PathBuf>,
}

impl ToolSet {
    /// Resolve configured tool paths, falling back to a PATH lookup for
    /// anything left unset. Fails loudly when a required tool is missing.
    pub fn resolve(paths: &ToolPaths) -> Result<Self> {
        let ffmpeg = resolve_required("ffmpeg", paths.ffmpeg.as_deref())?;
        let ffprobe = resolve_required("ffprobe", paths.ffprobe.as_deref())?;
        let whisper = match resolve_required("whisper", paths.whisper.as_deref()) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("whisper not available ({e:#}); caption stages will be marked unavailable");
                None
            }
        };

        Ok(Self {
            ffmpeg,
            ffprobe,
            whisper,
        })
    }
}

fn resolve_required(name: &str, configured: Option<&Path>) -> Result<PathBuf> {
    match configured {
        Some(path) => {
            if !path.exists() {
                bail!("configured path for {} does not exist: {}", name, path.display());
            }
            Ok(path.to_path_buf())
        }
        None => which::which(name)
            .with_context(|| format!("{} not found on PATH and no explicit path configured", name)),
    }
}
