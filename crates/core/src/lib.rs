pub mod audit;
pub mod catalog;
pub mod config;
pub mod dedup;
pub mod download;
pub mod error;
pub mod extractor;
pub mod models;
pub mod orchestrator;
pub mod source;
pub mod traits;

pub use audit::{audit_catalog, audit_storage, discover_files, digest_file, AuditReport};
pub use catalog::{content_hash, CatalogStore, PersistOutcome};
pub use config::{normalized_base, parse_tenants, select_tenants, SourceConfig, Tenant};
pub use dedup::{Admission, DedupIndex};
pub use download::{FetchOutcome, HttpDownloader};
pub use error::{CatalogError, ConfigError, HarvestError, Result, SourceError};
pub use extractor::{extract_attachments, target_name, Extraction};
pub use models::{
    Attachment, DateRange, DocumentDescriptor, HarvestOptions, IngestedRecord, Payload,
    RawAttachment, RetryPolicy, Variant,
};
pub use orchestrator::{HarvestCoordinator, HarvestReport, OutcomeTally};
pub use source::{HttpMetadataSource, SqlMetadataSource};
pub use traits::{Fetch, MetadataSource, SourceBatch};
