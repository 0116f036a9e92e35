use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use anyhow::{Context, Result};
use log::{info, warn};
use regex::Regex;
use serde::Deserialize;
use crate::config::BunnyStreamConfig;

const API_BASE: &str = "https://video.bunnycdn.com";
const PAGE_SIZE: usize = 100;

/// One video object in the remote library
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteVideo {
    pub guid: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "dateUploaded", default)]
    pub date_uploaded: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VideoList {
    #[serde(default)]
    items: Vec<RemoteVideo>,
}

#[derive(Debug, Deserialize)]
struct CreatedVideo {
    guid: String,
}

/// Bunny Stream client for one library.
///
/// Publishing is find-before-create on the exact title, so re-running a
/// pipeline or retrying an upload converges on the same remote asset instead
/// of piling up duplicates.
#[derive(Debug, Clone)]
pub struct BunnyClient {
    http: reqwest::Client,
    api_base: String,
    access_key: String,
    library_id: String,
    pull_zone: String,
}

impl BunnyClient {
    pub fn new(cfg: &BunnyStreamConfig) -> Result<Self> {
        Self::with_api_base(cfg, API_BASE)
    }

    /// Client against an alternative API endpoint (used by tests)
    pub fn with_api_base(cfg: &BunnyStreamConfig, api_base: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            access_key: cfg.access_key.clone(),
            library_id: cfg.library_id.clone(),
            pull_zone: cfg.pull_zone_url.trim_end_matches('/').to_string(),
        })
    }

    fn videos_url(&self) -> String {
        format!("{}/library/{}/videos", self.api_base, self.library_id)
    }

    /// Public playback URL, derived deterministically from the asset id.
    /// Requires MP4 fallback to be enabled on the library.
    pub fn playback_url(&self, guid: &str) -> String {
        format!("{}/{}/play_720p.mp4", self.pull_zone, guid)
    }

    /// Search remote assets for an exact title match
    pub async fn find_by_title(&self, title: &str) -> Result<Option<String>> {
        let list: VideoList = self
            .http
            .get(self.videos_url())
            .header("AccessKey", &self.access_key)
            .query(&[("search", title)])
            .send()
            .await
            .context("Video search request failed")?
            .error_for_status()
            .context("Video search rejected")?
            .json()
            .await
            .context("Failed to parse video search response")?;

        Ok(list
            .items
            .into_iter()
            .find(|v| v.title == title)
            .map(|v| v.guid))
    }

    /// Create a new remote asset with the given title
    pub async fn create(&self, title: &str) -> Result<String> {
        let created: CreatedVideo = self
            .http
            .post(self.videos_url())
            .header("AccessKey", &self.access_key)
            .json(&serde_json::json!({ "title": title }))
            .send()
            .await
            .context("Video create request failed")?
            .error_for_status()
            .context("Video create rejected")?
            .json()
            .await
            .context("Failed to parse video create response")?;

        info!("created remote asset {} for \"{}\"", created.guid, title);
        Ok(created.guid)
    }

    /// Find-before-create keeps publishing idempotent across retries and
    /// reruns. A failed search is tolerated; creation is attempted anyway.
    pub async fn find_or_create(&self, title: &str) -> Result<String> {
        match self.find_by_title(title).await {
            Ok(Some(guid)) => {
                info!("reusing remote asset {} for \"{}\"", guid, title);
                return Ok(guid);
            }
            Ok(None) => {}
            Err(e) => warn!("video search failed for \"{}\": {:#}", title, e),
        }
        self.create(title).await
    }

    /// Upload the artifact's bytes to an existing remote asset
    pub async fn upload(&self, guid: &str, file: &Path) -> Result<()> {
        let bytes = tokio::fs::read(file)
            .await
            .with_context(|| format!("Failed to read artifact: {}", file.display()))?;

        self.http
            .put(format!("{}/{}", self.videos_url(), guid))
            .header("AccessKey", &self.access_key)
            .header("Content-Type", "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .context("Upload request failed")?
            .error_for_status()
            .context("Upload rejected")?;

        Ok(())
    }

    /// Map one local artifact to a published playback URL
    pub async fn publish(&self, file: &Path, title: &str) -> Result<String> {
        let guid = self.find_or_create(title).await?;
        self.upload(&guid, file)
            .await
            .with_context(|| format!("Failed to upload \"{}\" to asset {}", title, guid))?;

        let url = self.playback_url(&guid);
        info!("published \"{}\" -> {}", title, url);
        Ok(url)
    }

    /// Enumerate every asset in the library, paginated
    pub async fn list_all(&self) -> Result<Vec<RemoteVideo>> {
        let mut videos = Vec::new();
        let mut page = 1usize;

        loop {
            let list: VideoList = self
                .http
                .get(self.videos_url())
                .header("AccessKey", &self.access_key)
                .query(&[
                    ("page", page.to_string()),
                    ("itemsPerPage", PAGE_SIZE.to_string()),
                    ("orderBy", "date".to_string()),
                ])
                .send()
                .await
                .context("Video list request failed")?
                .error_for_status()
                .context("Video list rejected")?
                .json()
                .await
                .context("Failed to parse video list response")?;

            let count = list.items.len();
            videos.extend(list.items);
            if count < PAGE_SIZE {
                break;
            }
            page += 1;
        }

        Ok(videos)
    }

    /// Delete a remote asset by id
    pub async fn delete(&self, guid: &str) -> Result<()> {
        self.http
            .delete(format!("{}/{}", self.videos_url(), guid))
            .header("AccessKey", &self.access_key)
            .send()
            .await
            .context("Delete request failed")?
            .error_for_status()
            .context("Delete rejected")?;

        Ok(())
    }
}

/// Remote title of one (project, format) pair. The title is the sole
/// cross-reference between local projects and remote assets.
pub fn video_title(project_id: &str, tag: &str) -> String {
    format!("{} ({})", project_id, tag)
}

/// Parse a remote title back into (project id, format tag). Titles that do
/// not follow the `"{id} ({WxH})"` pattern reconcile on the raw title.
pub fn parse_title(title: &str) -> (String, Option<String>) {
    static TITLE_RE: OnceLock<Regex> = OnceLock::new();
    let re = TITLE_RE.get_or_init(|| Regex::new(r"^(.*) \((\d+x\d+)\)$").expect("valid regex"));

    match re.captures(title) {
        Some(caps) => (caps[1].to_string(), Some(caps[2].to_string())),
        None => (title.to_string(), None),
    }
}
