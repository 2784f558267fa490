//! On-disk size accounting for installed bundles.

use capsa_core::model::BundleRecord;
use std::path::Path;
use walkdir::WalkDir;

/// Total bytes a bundle occupies: code directory plus data directory.
pub fn bundle_size(record: &BundleRecord) -> u64 {
    dir_size(&record.code_path) + dir_size(&record.data_path)
}

/// Recursive file-size sum of a directory; 0 if it does not exist.
pub fn dir_size(path: &Path) -> u64 {
    if !path.exists() {
        return 0;
    }
    WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}
