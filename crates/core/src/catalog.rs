use crate::error::CatalogError;
use crate::models::{IngestedRecord, Variant};
use chrono::NaiveDateTime;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Persisted(IngestedRecord),
    DuplicateContent,
    DuplicateLink,
    PathConflict(String),
    IoFailure(String),
}

pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(Clone)]
pub struct CatalogStore {
    pool: SqlitePool,
    root: PathBuf,
}

impl CatalogStore {
    pub fn new(pool: SqlitePool, root: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            root: root.into(),
        }
    }

    pub async fn open(db_path: &Path, root: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        if let Some(parent) = db_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        Self::connect(db_path, root, true).await
    }

    // For read-only commands: never creates the database file.
    pub async fn open_existing(db_path: &Path, root: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let not_initialized = || CatalogError::NotInitialized(db_path.display().to_string());
        if !tokio::fs::try_exists(db_path).await? {
            return Err(not_initialized());
        }

        let store = Self::connect(db_path, root, false).await?;
        let has_table: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'ingested_files'",
        )
        .fetch_one(&store.pool)
        .await?;
        if !has_table {
            store.close().await;
            return Err(not_initialized());
        }
        Ok(store)
    }

    async fn connect(db_path: &Path, root: impl Into<PathBuf>, create: bool) -> Result<Self, CatalogError> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(create)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(60));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(600))
            .connect_with(options)
            .await?;

        Ok(Self::new(pool, root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn migrate(&self) -> Result<(), CatalogError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ingested_files (
                id TEXT PRIMARY KEY,
                original_url TEXT NOT NULL UNIQUE,
                local_path TEXT NOT NULL,
                size INTEGER NOT NULL,
                file_hash TEXT NOT NULL UNIQUE CHECK (length(file_hash) = 64),
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ingested_files_created_at ON ingested_files(created_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_ingested_files_local_path ON ingested_files(local_path)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn known_links(&self) -> Result<Vec<String>, CatalogError> {
        Ok(sqlx::query_scalar("SELECT original_url FROM ingested_files")
            .fetch_all(&self.pool)
            .await?)
    }

    pub async fn record_count(&self) -> Result<i64, CatalogError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM ingested_files")
            .fetch_one(&self.pool)
            .await?)
    }

    pub async fn records(&self) -> Result<Vec<IngestedRecord>, CatalogError> {
        let rows = sqlx::query(
            "SELECT id, original_url, local_path, size, file_hash, created_at \
             FROM ingested_files ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| record_from_row(row).map_err(CatalogError::from))
            .collect()
    }

    pub async fn find_by_url(&self, original_url: &str) -> Result<Option<IngestedRecord>, CatalogError> {
        let row = sqlx::query(
            "SELECT id, original_url, local_path, size, file_hash, created_at \
             FROM ingested_files WHERE original_url = ?",
        )
        .bind(original_url)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(record_from_row).transpose()?)
    }

    pub async fn persist(
        &self,
        original_url: &str,
        content: &[u8],
        target: &Path,
        variant: Variant,
    ) -> Result<PersistOutcome, CatalogError> {
        let relative = relative_target(target)?;
        let file_hash = content_hash(content);
        let size = i64::try_from(content.len()).unwrap_or(i64::MAX);
        let temp_path = temp_sibling(&self.root.join(&relative));

        if let Err(io_error) = write_file(&temp_path, content).await {
            remove_quietly(&temp_path).await;
            error!(url = %original_url, path = %temp_path.display(), error = %io_error, "file write failed, nothing cataloged");
            return Ok(PersistOutcome::IoFailure(io_error.to_string()));
        }

        let placed = self
            .claim_and_place(original_url, &relative, &file_hash, size, &temp_path)
            .await;
        remove_quietly(&temp_path).await;
        let outcome = placed?;

        if let PersistOutcome::Persisted(record) = &outcome {
            info!(
                url = %original_url,
                path = %record.local_path,
                size,
                variant = %variant,
                "file stored"
            );
        }
        Ok(outcome)
    }

    // The row is committed before the file is linked into place, and the link
    // never replaces an existing file.
    async fn claim_and_place(
        &self,
        original_url: &str,
        relative: &Path,
        file_hash: &str,
        size: i64,
        temp_path: &Path,
    ) -> Result<PersistOutcome, CatalogError> {
        for candidate in candidate_paths(relative, file_hash) {
            let local_path = catalog_path(&candidate);
            let final_path = self.root.join(&candidate);
            if tokio::fs::try_exists(&final_path).await? {
                debug!(path = %local_path, "file name already taken");
                continue;
            }

            let id = Uuid::new_v4().to_string();
            let mut tx = self.pool.begin().await?;
            let inserted = sqlx::query(
                "INSERT INTO ingested_files (id, original_url, local_path, size, file_hash) \
                 VALUES (?, ?, ?, ?, ?) RETURNING created_at",
            )
            .bind(&id)
            .bind(original_url)
            .bind(&local_path)
            .bind(size)
            .bind(file_hash)
            .fetch_one(&mut *tx)
            .await;

            let created_at: NaiveDateTime = match inserted {
                Ok(row) => row.try_get("created_at")?,
                Err(sqlx::Error::Database(db_error)) if db_error.is_unique_violation() => {
                    tx.rollback().await?;
                    match self.classify_conflict(original_url, file_hash).await? {
                        Some(outcome) => return Ok(outcome),
                        None => continue,
                    }
                }
                Err(other) => return Err(other.into()),
            };
            tx.commit().await?;

            if let Err(io_error) = tokio::fs::hard_link(temp_path, &final_path).await {
                self.discard_record(&id).await?;
                if io_error.kind() == ErrorKind::AlreadyExists {
                    continue;
                }
                error!(url = %original_url, path = %final_path.display(), error = %io_error, "moving file into place failed, catalog row removed");
                return Ok(PersistOutcome::IoFailure(io_error.to_string()));
            }

            return Ok(PersistOutcome::Persisted(IngestedRecord {
                id,
                original_url: original_url.to_string(),
                local_path,
                size_bytes: size,
                content_hash: file_hash.to_string(),
                created_at,
            }));
        }

        let local_path = catalog_path(relative);
        warn!(url = %original_url, path = %local_path, "no free file name for attachment");
        Ok(PersistOutcome::PathConflict(local_path))
    }

    async fn classify_conflict(
        &self,
        original_url: &str,
        file_hash: &str,
    ) -> Result<Option<PersistOutcome>, CatalogError> {
        let hash_taken: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM ingested_files WHERE file_hash = ?")
                .bind(file_hash)
                .fetch_one(&self.pool)
                .await?;
        if hash_taken {
            info!(url = %original_url, hash = %file_hash, "identical content already cataloged");
            return Ok(Some(PersistOutcome::DuplicateContent));
        }

        let link_taken: bool =
            sqlx::query_scalar("SELECT COUNT(*) > 0 FROM ingested_files WHERE original_url = ?")
                .bind(original_url)
                .fetch_one(&self.pool)
                .await?;
        if link_taken {
            warn!(url = %original_url, "link already cataloged");
            return Ok(Some(PersistOutcome::DuplicateLink));
        }

        Ok(None)
    }

    async fn discard_record(&self, id: &str) -> Result<(), CatalogError> {
        sqlx::query("DELETE FROM ingested_files WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn record_from_row(row: &SqliteRow) -> Result<IngestedRecord, sqlx::Error> {
    Ok(IngestedRecord {
        id: row.try_get("id")?,
        original_url: row.try_get("original_url")?,
        local_path: row.try_get("local_path")?,
        size_bytes: row.try_get("size")?,
        content_hash: row.try_get("file_hash")?,
        created_at: row.try_get("created_at")?,
    })
}

fn relative_target(target: &Path) -> Result<PathBuf, CatalogError> {
    let mut relative = PathBuf::new();
    for component in target.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => return Err(CatalogError::InvalidTarget(target.display().to_string())),
        }
    }

    if relative.as_os_str().is_empty() {
        return Err(CatalogError::InvalidTarget(target.display().to_string()));
    }
    Ok(relative)
}

fn catalog_path(relative: &Path) -> String {
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

// Requested name first, then the same name tagged with a hash prefix.
fn candidate_paths(relative: &Path, file_hash: &str) -> [PathBuf; 2] {
    let stem = relative
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = relative
        .extension()
        .map(|ext| format!(".{}", ext.to_string_lossy()))
        .unwrap_or_default();
    let short_hash = file_hash.get(..12).unwrap_or(file_hash);

    [
        relative.to_path_buf(),
        relative.with_file_name(format!("{stem}-{short_hash}{extension}")),
    ]
}

fn temp_sibling(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    final_path.with_file_name(format!("{name}.partial-{}", Uuid::new_v4().simple()))
}

async fn write_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    Ok(())
}

async fn remove_quietly(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await {
        if error.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %error, "could not remove temporary file");
        }
    }
}
