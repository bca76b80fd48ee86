use crate::catalog::CatalogStore;
use crate::error::CatalogError;
use crate::models::IngestedRecord;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

const PARTIAL_MARKER: &str = ".partial-";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingFile {
    pub original_url: String,
    pub local_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HashMismatch {
    pub local_path: String,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnreadableFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub records_checked: usize,
    pub files_scanned: usize,
    pub missing_files: Vec<MissingFile>,
    pub hash_mismatches: Vec<HashMismatch>,
    pub orphans: Vec<PathBuf>,
    pub partials: Vec<PathBuf>,
    pub unreadable: Vec<UnreadableFile>,
}

impl AuditReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_files.is_empty()
            && self.hash_mismatches.is_empty()
            && self.orphans.is_empty()
            && self.partials.is_empty()
            && self.unreadable.is_empty()
    }
}

pub fn discover_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|item| item.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, CatalogError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn audit_storage(root: &Path, records: &[IngestedRecord], ignore: &[PathBuf]) -> AuditReport {
    let mut report = AuditReport {
        records_checked: records.len(),
        ..AuditReport::default()
    };

    let by_path: HashMap<&str, &IngestedRecord> = records
        .iter()
        .map(|record| (record.local_path.as_str(), record))
        .collect();

    for record in records {
        let path = root.join(&record.local_path);
        if !path.is_file() {
            report.missing_files.push(MissingFile {
                original_url: record.original_url.clone(),
                local_path: record.local_path.clone(),
            });
            continue;
        }

        match digest_file(&path) {
            Ok(actual) if actual != record.content_hash => report.hash_mismatches.push(HashMismatch {
                local_path: record.local_path.clone(),
                expected: record.content_hash.clone(),
                actual,
            }),
            Ok(_) => {}
            Err(error) => report.unreadable.push(UnreadableFile {
                path,
                reason: error.to_string(),
            }),
        }
    }

    let ignored: HashSet<&Path> = ignore.iter().map(PathBuf::as_path).collect();
    for path in discover_files(root) {
        if ignored.contains(path.as_path()) {
            continue;
        }
        report.files_scanned += 1;

        let Some(relative) = catalog_path(root, &path) else {
            continue;
        };
        if by_path.contains_key(relative.as_str()) {
            continue;
        }

        let is_partial = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.contains(PARTIAL_MARKER));
        if is_partial {
            report.partials.push(path);
        } else {
            report.orphans.push(path);
        }
    }

    report
}

pub async fn audit_catalog(catalog: &CatalogStore, ignore: Vec<PathBuf>) -> Result<AuditReport, CatalogError> {
    let records = catalog.records().await?;
    let root = catalog.root().to_path_buf();
    info!(records = records.len(), root = %root.display(), "auditing catalog");

    let report = tokio::task::spawn_blocking(move || audit_storage(&root, &records, &ignore))
        .await
        .map_err(|join_error| CatalogError::Io(std::io::Error::other(join_error)))?;

    for missing in &report.missing_files {
        warn!(path = %missing.local_path, url = %missing.original_url, "cataloged file missing on disk");
    }
    for mismatch in &report.hash_mismatches {
        warn!(
            path = %mismatch.local_path,
            expected = %mismatch.expected,
            actual = %mismatch.actual,
            "stored file does not match its catalog hash"
        );
    }
    for orphan in &report.orphans {
        warn!(path = %orphan.display(), "file not referenced by the catalog");
    }
    for partial in &report.partials {
        warn!(path = %partial.display(), "leftover partial download");
    }
    for skipped in &report.unreadable {
        warn!(path = %skipped.path.display(), reason = %skipped.reason, "unable to read stored file");
    }

    Ok(report)
}

fn catalog_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    Some(
        relative
            .components()
            .map(|component| component.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
    )
}
