use crate::download::FetchOutcome;
use crate::models::{DateRange, DocumentDescriptor, Variant};
use async_trait::async_trait;

#[derive(Debug, Clone, Default)]
pub struct SourceBatch {
    pub descriptors: Vec<DocumentDescriptor>,
    pub malformed: usize,
    pub pages: u32,
    pub interrupted: Option<String>,
}

#[async_trait]
pub trait MetadataSource {
    async fn fetch_range(&self, range: &DateRange, variant: Variant) -> SourceBatch;
}

#[async_trait]
pub trait Fetch {
    async fn fetch(&self, link: &str) -> FetchOutcome;
}
