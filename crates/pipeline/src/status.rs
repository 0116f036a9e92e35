use std::collections::BTreeMap;
use std::path::Path;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one pipeline stage, as persisted in `status.json`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// Completed; never re-executed on a later run
    Done,
    /// Failed after retries; the pipeline carried on with the best available input
    Warning,
    /// Disabled by configuration
    Skipped,
    /// Required external tool is not installed
    Unavailable,
    /// Configured outro clip does not exist
    MissingOutro,
}

impl StageOutcome {
    pub fn is_done(self) -> bool {
        self == StageOutcome::Done
    }
}

/// Persisted per-project status record (`status.json`).
///
/// This is the sole durability mechanism for pipeline progress: each stage
/// consults it before running and updates it after. An empty record means the
/// project never started and is eligible for a fresh run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<StageOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branding: Option<StageOutcome>,
    /// language -> outcome
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub captions: BTreeMap<String, StageOutcome>,
    /// format tag -> outcome
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub formats: BTreeMap<String, StageOutcome>,
    /// format tag -> published playback URL
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub bunny_urls: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
}

impl StatusRecord {
    /// Load the status record of a project, treating a missing file as empty
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join("status.json");
        if !path.exists() {
            return Ok(StatusRecord::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read status record: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse status record: {}", path.display()))
    }

    /// Persist the record, whole-file write
    pub fn save(&self, project_dir: &Path) -> Result<()> {
        let path = project_dir.join("status.json");
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize status record")?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write status record: {}", path.display()))?;
        Ok(())
    }

    /// True when no stage ever recorded an outcome. Combined with a missing
    /// file this is the "stuck" condition the recovery sweep looks for.
    pub fn is_empty(&self) -> bool {
        self.audio.is_none()
            && self.branding.is_none()
            && self.captions.is_empty()
            && self.formats.is_empty()
            && self.bunny_urls.is_empty()
    }

    pub fn format_done(&self, tag: &str) -> bool {
        self.formats.get(tag).copied().map_or(false, StageOutcome::is_done)
    }

    pub fn caption_done(&self, lang: &str) -> bool {
        self.captions.get(lang).copied().map_or(false, StageOutcome::is_done)
    }

    /// Format tags that are transcoded but have no published URL yet.
    /// Publishing is retried for these on the next run.
    pub fn unpublished_formats(&self) -> Vec<String> {
        self.formats
            .iter()
            .filter(|(tag, outcome)| outcome.is_done() && !self.bunny_urls.contains_key(*tag))
            .map(|(tag, _)| tag.clone())
            .collect()
    }
}
