use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use crate::status::StatusRecord;

/// One published project in the showcase manifest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestEntry {
    pub id: String,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub captions: Vec<String>,
    #[serde(default)]
    pub formats_generated: Vec<String>,
    #[serde(default)]
    pub bunny_urls: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl ManifestEntry {
    pub fn from_status(id: &str, private: bool, status: &StatusRecord) -> Self {
        Self {
            id: id.to_string(),
            private,
            captions: status
                .captions
                .iter()
                .filter(|(_, o)| o.is_done())
                .map(|(lang, _)| lang.clone())
                .collect(),
            formats_generated: status
                .formats
                .iter()
                .filter(|(_, o)| o.is_done())
                .map(|(tag, _)| tag.clone())
                .collect(),
            bunny_urls: status.bunny_urls.clone(),
            updated_at: Utc::now(),
        }
    }
}

/// Showcase manifest, newest-first. Consumed by the site frontend, so a
/// corrupt file on disk is replaced rather than propagated as a hard error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn load(path: &Path) -> Self {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str(&raw) {
            Ok(entries) => Self { entries },
            Err(e) => {
                warn!(
                    "manifest {} is unreadable, starting fresh: {}",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let json =
            serde_json::to_string_pretty(&self.entries).context("Failed to serialize manifest")?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write manifest: {}", path.display()))?;
        Ok(())
    }

    /// Replace any prior entry with the same id and move the project to the
    /// front, keeping the manifest ordered by most recent update.
    pub fn upsert(&mut self, entry: ManifestEntry) {
        self.entries.retain(|e| e.id != entry.id);
        self.entries.insert(0, entry);
    }

    /// Drop entries for projects that no longer exist locally. Returns the
    /// removed ids.
    pub fn retain_local<F>(&mut self, exists: F) -> Vec<String>
    where
        F: Fn(&str) -> bool,
    {
        let mut removed = Vec::new();
        self.entries.retain(|e| {
            if exists(&e.id) {
                true
            } else {
                removed.push(e.id.clone());
                false
            }
        });
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StageOutcome;

    fn entry(id: &str) -> ManifestEntry {
        ManifestEntry {
            id: id.to_string(),
            private: false,
            captions: vec![],
            formats_generated: vec!["16x9".to_string()],
            bunny_urls: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let m = Manifest::load(&dir.path().join("showcase.json"));
        assert!(m.entries.is_empty());
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("showcase.json");
        fs::write(&path, "{not json").unwrap();
        let m = Manifest::load(&path);
        assert!(m.entries.is_empty());
    }

    #[test]
    fn upsert_moves_existing_entry_to_front() {
        let mut m = Manifest::default();
        m.upsert(entry("alpha"));
        m.upsert(entry("beta"));
        assert_eq!(m.entries[0].id, "beta");

        // Re-publishing alpha promotes it without duplicating it
        m.upsert(entry("alpha"));
        assert_eq!(m.entries.len(), 2);
        assert_eq!(m.entries[0].id, "alpha");
        assert_eq!(m.entries[1].id, "beta");
    }

    #[test]
    fn retain_local_reports_removed_ids() {
        let mut m = Manifest::default();
        m.upsert(entry("alpha"));
        m.upsert(entry("beta"));
        m.upsert(entry("gamma"));

        let removed = m.retain_local(|id| id != "beta");
        assert_eq!(removed, vec!["beta".to_string()]);
        assert_eq!(m.entries.len(), 2);
        assert!(!m.contains("beta"));
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("site").join("showcase.json");

        let mut m = Manifest::default();
        let mut e = entry("alpha");
        e.bunny_urls
            .insert("16x9".to_string(), "https://cdn/abc/play_720p.mp4".to_string());
        m.upsert(e);
        m.save(&path).unwrap();

        let loaded = Manifest::load(&path);
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.entries[0].id, "alpha");
        assert_eq!(
            loaded.entries[0].bunny_urls.get("16x9").unwrap(),
            "https://cdn/abc/play_720p.mp4"
        );
    }

    #[test]
    fn entry_from_status_keeps_only_done_outcomes() {
        let mut status = StatusRecord::default();
        status
            .captions
            .insert("en".to_string(), StageOutcome::Done);
        status
            .captions
            .insert("de".to_string(), StageOutcome::Unavailable);
        status.formats.insert("16x9".to_string(), StageOutcome::Done);
        status
            .formats
            .insert("9x16".to_string(), StageOutcome::Warning);

        let e = ManifestEntry::from_status("alpha", true, &status);
        assert!(e.private);
        assert_eq!(e.captions, vec!["en".to_string()]);
        assert_eq!(e.formats_generated, vec!["16x9".to_string()]);
    }
}
