//! Broker key naming for the per-tenant records.
//!
//! All cross-process state lives under these keys, so producers and consumers
//! running in separate processes agree on them by construction.

use std::path::Path;

/// Set of file paths a tenant's discovery worker has fully published.
pub fn published_files(tenant: &str) -> String {
    format!("published_files:{}", tenant)
}

/// Set of file paths whose every chunk has been indexed.
pub fn completed_files(tenant: &str) -> String {
    format!("processed_files:{}", tenant)
}

/// Hash holding the indexed-chunk counter for one file.
///
/// Keyed by the file name only, so two files with the same name in different
/// subdirectories of one tenant share a counter.
pub fn chunk_counter(tenant: &str, file_path: &str) -> String {
    let file_name = Path::new(file_path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| file_path.to_string());
    format!("file_chunks_processed:{}:{}", tenant, file_name)
}

/// Field inside [`chunk_counter`] that is incremented.
pub const CHUNK_COUNTER_FIELD: &str = "processed_count";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_key_uses_file_name() {
        assert_eq!(
            chunk_counter("user_a", "data/user_a/text/11.txt"),
            "file_chunks_processed:user_a:11.txt"
        );
    }

    #[test]
    fn test_record_keys() {
        assert_eq!(published_files("A"), "published_files:A");
        assert_eq!(completed_files("A"), "processed_files:A");
    }
}
