//! Content digests used for task idempotency and cross-run dedup.
//!
//! Hashes are computed over the exact bytes as given — no trimming or
//! whitespace normalisation — so the same task text always hashes the same
//! way across runs and across processes.

/// Digest a task's text into its stable `task_hash`.
pub fn task_hash(task_text: &str) -> String {
    blake3::hash(task_text.as_bytes()).to_hex().to_string()
}

/// Digest a devplan's full contents into its `source_hash`.
pub fn source_hash(devplan_contents: &str) -> String {
    blake3::hash(devplan_contents.as_bytes()).to_hex().to_string()
}
