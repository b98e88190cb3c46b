//! Advisory cleanup of the overlay cache after a successful run.

use std::collections::BTreeSet;
use std::path::Path;

use tracing::{debug, warn};

use crate::rasterize::{APP_CACHE_DIR, CONTAINER_CACHE_DIR};

/// Delete cache entries whose key was not touched by the run. Errors are
/// logged and swallowed; a stale file is never worth failing a render that
/// already succeeded. Returns how many files were removed.
pub fn reap_cache(project_dir: &Path, touched: &BTreeSet<String>) -> usize {
    let mut removed = 0;
    for cache_dir in [CONTAINER_CACHE_DIR, APP_CACHE_DIR] {
        let dir = project_dir.join(cache_dir);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue, // never populated
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e != "png").unwrap_or(true) {
                continue;
            }
            let key = match path.file_stem() {
                Some(stem) => stem.to_string_lossy().into_owned(),
                None => continue,
            };
            if touched.contains(&key) {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "reaped stale overlay");
                    removed += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to reap overlay"),
            }
        }
    }
    removed
}
