use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use log::info;
use serde::Deserialize;
use crate::stage::{StageError, StageRunner};
use crate::tools::ToolSet;

/// Parsed speech-recognition result: full text plus timed segments
#[derive(Debug, Clone, Deserialize)]
pub struct Transcript {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Paths of the three caption artifacts derived from one recognition pass
#[derive(Debug)]
pub struct CaptionFiles {
    pub vtt: PathBuf,
    pub srt: PathBuf,
    pub txt: PathBuf,
}

/// Run the speech-recognition tool for one language and derive the caption
/// artifacts from its single JSON result.
///
/// The recognizer writes `<stem>.json` into the scratch directory; captions
/// land as `<stem>.<lang>.{vtt,srt,txt}` under the project's captions dir.
pub async fn transcribe(
    tools: &ToolSet,
    runner: &StageRunner,
    master: &Path,
    language: &str,
    captions_dir: &Path,
    scratch_dir: &Path,
) -> Result<CaptionFiles, StageError> {
    let whisper = tools
        .whisper
        .as_deref()
        .ok_or_else(|| StageError::ToolMissing("whisper".to_string()))?;

    std::fs::create_dir_all(scratch_dir).map_err(|source| StageError::Log {
        stage: format!("captions_{}", language),
        source,
    })?;

    let stage = format!("captions_{}", language);
    let args = vec![
        master.display().to_string(),
        "--language".to_string(),
        language.to_string(),
        "--output_format".to_string(),
        "json".to_string(),
        "--output_dir".to_string(),
        scratch_dir.display().to_string(),
    ];
    runner.run(&stage, whisper, &args).await?;

    let stem = master
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("video");
    let result_path = scratch_dir.join(format!("{}.json", stem));

    let transcript = read_transcript(&result_path).map_err(|e| StageError::Failed {
        stage: stage.clone(),
        attempts: 1,
        detail: format!("{e:#}"),
    })?;

    let files = write_caption_files(&transcript, captions_dir, stem, language).map_err(|e| {
        StageError::Failed {
            stage,
            attempts: 1,
            detail: format!("{e:#}"),
        }
    })?;

    info!(
        "captions {}: {} segments -> {}",
        language,
        transcript.segments.len(),
        files.vtt.display()
    );
    Ok(files)
}

fn read_transcript(path: &Path) -> Result<Transcript> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read recognition result: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse recognition result: {}", path.display()))
}

/// Emit cue-timed (VTT), index-timed (SRT) and plain-text artifacts
pub fn write_caption_files(
    transcript: &Transcript,
    captions_dir: &Path,
    stem: &str,
    language: &str,
) -> Result<CaptionFiles> {
    std::fs::create_dir_all(captions_dir)
        .with_context(|| format!("Failed to create captions dir: {}", captions_dir.display()))?;

    let base = format!("{}.{}", stem, language);
    let vtt = captions_dir.join(format!("{}.vtt", base));
    let srt = captions_dir.join(format!("{}.srt", base));
    let txt = captions_dir.join(format!("{}.txt", base));

    let mut vtt_body = String::from("WEBVTT\n\n");
    for segment in &transcript.segments {
        vtt_body.push_str(&format!(
            "{} --> {}\n{}\n\n",
            vtt_timestamp(segment.start),
            vtt_timestamp(segment.end),
            segment.text.trim()
        ));
    }
    std::fs::write(&vtt, vtt_body)
        .with_context(|| format!("Failed to write captions: {}", vtt.display()))?;

    let mut srt_body = String::new();
    for (i, segment) in transcript.segments.iter().enumerate() {
        srt_body.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            i + 1,
            srt_timestamp(segment.start),
            srt_timestamp(segment.end),
            segment.text.trim()
        ));
    }
    std::fs::write(&srt, srt_body)
        .with_context(|| format!("Failed to write captions: {}", srt.display()))?;

    std::fs::write(&txt, &transcript.text)
        .with_context(|| format!("Failed to write transcript text: {}", txt.display()))?;

    Ok(CaptionFiles { vtt, srt, txt })
}

/// `HH:MM:SS.mmm`, WebVTT cue timing
pub fn vtt_timestamp(seconds: f64) -> String {
    let (h, m, s, ms) = split_timestamp(seconds);
    format!("{:02}:{:02}:{:02}.{:03}", h, m, s, ms)
}

/// `HH:MM:SS,mmm`, SubRip cue timing
pub fn srt_timestamp(seconds: f64) -> String {
    let (h, m, s, ms) = split_timestamp(seconds);
    format!("{:02}:{:02}:{:02},{:03}", h, m, s, ms)
}

fn split_timestamp(seconds: f64) -> (u64, u64, u64, u64) {
    // Round to whole milliseconds first so a value like 59.9996 carries into
    // the next second instead of wrapping back to .000
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let whole = total_ms / 1000;
    (whole / 3600, (whole % 3600) / 60, whole % 60, total_ms % 1000)
}
