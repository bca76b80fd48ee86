use crate::catalog::{CatalogStore, PersistOutcome};
use crate::dedup::{Admission, DedupIndex};
use crate::download::FetchOutcome;
use crate::error::HarvestError;
use crate::extractor::{extract_attachments, target_name};
use crate::models::{DateRange, Variant};
use crate::traits::{Fetch, MetadataSource};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeTally {
    pub persisted: usize,
    pub not_found: usize,
    pub forbidden: usize,
    pub failed: usize,
    pub duplicate_content: usize,
    pub duplicate_link: usize,
}

impl OutcomeTally {
    fn record(&mut self, outcome: &TaskOutcome) {
        match outcome {
            TaskOutcome::Persisted => self.persisted += 1,
            TaskOutcome::NotFound => self.not_found += 1,
            TaskOutcome::Forbidden => self.forbidden += 1,
            TaskOutcome::Failed(_) => self.failed += 1,
            TaskOutcome::DuplicateContent => self.duplicate_content += 1,
            TaskOutcome::DuplicateLink => self.duplicate_link += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.persisted
            + self.not_found
            + self.forbidden
            + self.failed
            + self.duplicate_content
            + self.duplicate_link
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HarvestReport {
    pub descriptors: usize,
    pub malformed_descriptors: usize,
    pub without_attachments: usize,
    pub attachments_seen: usize,
    pub missing_links: usize,
    pub already_cataloged: usize,
    pub repeated_links: usize,
    pub scheduled: usize,
    pub outcomes: OutcomeTally,
    pub source_interrupted: Option<String>,
}

impl HarvestReport {
    pub fn not_saved(&self) -> usize {
        self.outcomes.failed + self.outcomes.forbidden + self.outcomes.not_found
    }

    pub fn log_summary(&self, tenant: &str, variant: Variant) {
        info!(
            tenant,
            variant = %variant,
            descriptors = self.descriptors,
            malformed = self.malformed_descriptors,
            without_attachments = self.without_attachments,
            attachments = self.attachments_seen,
            missing_links = self.missing_links,
            already_cataloged = self.already_cataloged,
            repeated_links = self.repeated_links,
            scheduled = self.scheduled,
            "harvest dispatch summary"
        );
        info!(
            tenant,
            variant = %variant,
            persisted = self.outcomes.persisted,
            not_saved = self.not_saved(),
            not_found = self.outcomes.not_found,
            forbidden = self.outcomes.forbidden,
            failed = self.outcomes.failed,
            duplicate_content = self.outcomes.duplicate_content,
            duplicate_link = self.outcomes.duplicate_link,
            "harvest download summary"
        );
        if let Some(reason) = &self.source_interrupted {
            warn!(tenant, variant = %variant, reason = %reason, "descriptor listing was incomplete");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TaskOutcome {
    Persisted,
    NotFound,
    Forbidden,
    Failed(String),
    DuplicateContent,
    DuplicateLink,
}

struct DownloadTask {
    link: String,
    target: PathBuf,
}

pub struct HarvestCoordinator<S, F>
where
    S: MetadataSource,
    F: Fetch,
{
    source: S,
    fetcher: Arc<F>,
    catalog: CatalogStore,
    folder: Option<PathBuf>,
    concurrency: usize,
}

impl<S, F> HarvestCoordinator<S, F>
where
    S: MetadataSource + Send + Sync,
    F: Fetch + Send + Sync + 'static,
{
    pub fn new(source: S, fetcher: F, catalog: CatalogStore) -> Self {
        Self {
            source,
            fetcher: Arc::new(fetcher),
            catalog,
            folder: None,
            concurrency: 10,
        }
    }

    pub fn with_folder(mut self, folder: Option<impl Into<PathBuf>>) -> Self {
        self.folder = folder.map(Into::into);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub async fn run(&self, range: &DateRange, variant: Variant) -> Result<HarvestReport, HarvestError> {
        let mut report = HarvestReport::default();

        let batch = self.source.fetch_range(range, variant).await;
        report.descriptors = batch.descriptors.len();
        report.malformed_descriptors = batch.malformed;
        report.source_interrupted = batch.interrupted;
        if let Some(reason) = &report.source_interrupted {
            warn!(variant = %variant, reason = %reason, "source unavailable, continuing with fetched descriptors");
        }

        if batch.descriptors.is_empty() {
            warn!(variant = %variant, "no descriptors found for the requested range");
            return Ok(report);
        }

        info!("loading known links from catalog");
        let mut index = DedupIndex::from_snapshot(self.catalog.known_links().await?);
        info!(known_links = index.snapshot_len(), descriptors = report.descriptors, "dedup snapshot loaded");

        let mut queue = Vec::new();
        for descriptor in &batch.descriptors {
            let extraction = extract_attachments(descriptor);
            report.missing_links += extraction.missing_links;
            report.attachments_seen += extraction.attachments.len() + extraction.missing_links;

            if extraction.attachments.is_empty() && extraction.missing_links == 0 {
                warn!(document_id = %descriptor.id, "no attachments found for document");
                report.without_attachments += 1;
                continue;
            }

            for (position, attachment) in extraction.attachments.iter().enumerate() {
                match index.admit(&attachment.link) {
                    Admission::Cataloged => report.already_cataloged += 1,
                    Admission::Repeated => report.repeated_links += 1,
                    Admission::New => {
                        let name = target_name(descriptor, attachment, position);
                        let target = match &self.folder {
                            Some(folder) => folder.join(name),
                            None => PathBuf::from(name),
                        };
                        queue.push(DownloadTask {
                            link: attachment.link.clone(),
                            target,
                        });
                    }
                }
            }
        }

        report.scheduled = queue.len();
        info!(
            attachments = report.attachments_seen,
            already_cataloged = report.already_cataloged,
            scheduled = report.scheduled,
            "dispatch finished"
        );

        if queue.is_empty() {
            info!("no new files to download");
            return Ok(report);
        }

        report.outcomes = self.download_all(queue, variant).await;
        Ok(report)
    }

    async fn download_all(&self, queue: Vec<DownloadTask>, variant: Variant) -> OutcomeTally {
        info!(
            tasks = queue.len(),
            concurrency = self.concurrency,
            "starting downloads"
        );

        let gate = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for task in queue {
            let gate = Arc::clone(&gate);
            let fetcher = Arc::clone(&self.fetcher);
            let catalog = self.catalog.clone();

            tasks.spawn(async move {
                let _permit = match gate.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(closed) => return TaskOutcome::Failed(closed.to_string()),
                };

                let outcome = match fetcher.fetch(&task.link).await {
                    FetchOutcome::Fetched(bytes) => {
                        match catalog.persist(&task.link, &bytes, &task.target, variant).await {
                            Ok(PersistOutcome::Persisted(_)) => TaskOutcome::Persisted,
                            Ok(PersistOutcome::DuplicateContent) => TaskOutcome::DuplicateContent,
                            Ok(PersistOutcome::DuplicateLink) => TaskOutcome::DuplicateLink,
                            Ok(PersistOutcome::PathConflict(path)) => {
                                TaskOutcome::Failed(format!("no free file name for {path}"))
                            }
                            Ok(PersistOutcome::IoFailure(reason)) => TaskOutcome::Failed(reason),
                            Err(persist_error) => {
                                error!(link = %task.link, error = %persist_error, "catalog write failed");
                                TaskOutcome::Failed(persist_error.to_string())
                            }
                        }
                    }
                    FetchOutcome::NotFound => TaskOutcome::NotFound,
                    FetchOutcome::Forbidden => TaskOutcome::Forbidden,
                    FetchOutcome::Failed(reason) => TaskOutcome::Failed(reason),
                };
                debug!(link = %task.link, outcome = ?outcome, "download task finished");
                outcome
            });
        }

        let mut tally = OutcomeTally::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => tally.record(&outcome),
                Err(join_error) => {
                    error!(error = %join_error, "download task aborted");
                    tally.failed += 1;
                }
            }
        }
        tally
    }
}
