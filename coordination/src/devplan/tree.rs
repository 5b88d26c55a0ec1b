//! Project tree listing fed to the file-scope predictor (§4.2): depth <= 3,
//! skipping VCS/ignored directories, capped at 100 entries.

use ignore::WalkBuilder;
use std::path::Path;

const MAX_DEPTH: usize = 3;
const MAX_ENTRIES: usize = 100;

/// Build a newline-delimited relative-path listing of `root`, respecting
/// `.gitignore` and skipping `.git`.
pub fn build_tree_listing(root: impl AsRef<Path>) -> String {
    let root = root.as_ref();
    let mut entries = Vec::new();

    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(true)
        .max_depth(Some(MAX_DEPTH))
        .build();

    for entry in walker.flatten() {
        let path = entry.path();
        if path == root {
            continue;
        }
        if path.components().any(|c| c.as_os_str() == ".git") {
            continue;
        }
        let rel = path.strip_prefix(root).unwrap_or(path);
        entries.push(rel.display().to_string());
        if entries.len() >= MAX_ENTRIES {
            break;
        }
    }

    entries.sort();
    entries.join("\n")
}
