use std::path::Path;
use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::process::Command;
use crate::tools::ToolSet;

/// Target aspect format for a web rendition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatTag {
    /// 16x9 landscape, 1920x1080
    Wide,
    /// 9x16 portrait, 1080x1920
    Tall,
    /// 1x1 square, 1080x1080
    Square,
}

impl FormatTag {
    pub fn as_str(self) -> &'static str {
        match self {
            FormatTag::Wide => "16x9",
            FormatTag::Tall => "9x16",
            FormatTag::Square => "1x1",
        }
    }

    pub fn from_str(tag: &str) -> Option<Self> {
        match tag {
            "16x9" => Some(FormatTag::Wide),
            "9x16" => Some(FormatTag::Tall),
            "1x1" => Some(FormatTag::Square),
            _ => None,
        }
    }

    /// Exact output dimensions of this rendition
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            FormatTag::Wide => (1920, 1080),
            FormatTag::Tall => (1080, 1920),
            FormatTag::Square => (1080, 1080),
        }
    }

    /// ffmpeg video filter: scale to fit inside the box, pad to exact
    /// dimensions with centered black bars. Never crops, never distorts.
    pub fn scale_filter(self) -> String {
        let (w, h) = self.dimensions();
        format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1"
        )
    }
}

impl std::fmt::Display for FormatTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick the aspect format closest to the master's measured dimensions:
/// near-square within 10% goes square, taller-than-wide goes portrait,
/// everything else is landscape.
pub fn detect_format(width: u32, height: u32) -> FormatTag {
    if height == 0 {
        return FormatTag::Wide;
    }
    let ratio = width as f64 / height as f64;
    if (0.9..=1.1).contains(&ratio) {
        FormatTag::Square
    } else if ratio < 0.9 {
        FormatTag::Tall
    } else {
        FormatTag::Wide
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
}

/// Measure the first video stream of a media file via ffprobe
pub async fn probe_dimensions(tools: &ToolSet, path: &Path) -> Result<(u32, u32)> {
    let output = Command::new(&tools.ffprobe)
        .arg("-v")
        .arg("error")
        .arg("-select_streams")
        .arg("v:0")
        .arg("-show_entries")
        .arg("stream=width,height")
        .arg("-of")
        .arg("json")
        .arg(path)
        .output()
        .await
        .with_context(|| format!("Failed to execute ffprobe for: {}", path.display()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "ffprobe failed (exit code {}) for {}: {}",
            output.status.code().unwrap_or(-1),
            path.display(),
            stderr.trim()
        );
    }

    let parsed: ProbeOutput = serde_json::from_slice(&output.stdout)
        .with_context(|| format!("Failed to parse ffprobe JSON for: {}", path.display()))?;

    let stream = parsed
        .streams
        .first()
        .with_context(|| format!("No video stream in: {}", path.display()))?;

    match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => Ok((w, h)),
        _ => anyhow::bail!("Video stream has no usable dimensions: {}", path.display()),
    }
}
