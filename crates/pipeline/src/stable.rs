use std::path::Path;
use std::time::Duration;
use anyhow::Result;
use log::debug;
use walkdir::WalkDir;

/// Check whether a path has finished being written: its content size must be
/// non-zero and unchanged across the observation window.
///
/// The upstream editor may still be flushing an export when it first appears,
/// so declaring stability too early would promote a truncated master. A path
/// that is empty at first observation gets one more chance after the same
/// wait, since a folder can exist a few seconds before its first byte lands.
pub async fn is_stable(path: &Path, window: Duration) -> Result<bool> {
    let mut first = match content_size(path) {
        Some(size) => size,
        None => return Ok(false),
    };

    if first == 0 {
        tokio::time::sleep(window).await;
        first = match content_size(path) {
            Some(size) => size,
            None => return Ok(false),
        };
        if first == 0 {
            debug!("still empty after grace period: {}", path.display());
            return Ok(false);
        }
    }

    tokio::time::sleep(window).await;

    let second = match content_size(path) {
        Some(size) => size,
        // Vanished mid-window (moved away by someone else)
        None => return Ok(false),
    };

    Ok(first == second && first > 0)
}

/// Content size of a path: file length, or the sum of all regular files for
/// a directory.
fn content_size(path: &Path) -> Option<u64> {
    if !path.exists() {
        return None;
    }

    if path.is_dir() {
        let mut total = 0u64;
        for entry in WalkDir::new(path)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() {
                if let Ok(meta) = entry.metadata() {
                    total += meta.len();
                }
            }
        }
        Some(total)
    } else {
        std::fs::metadata(path).ok().map(|m| m.len())
    }
}
