use crate::config::{normalized_base, validate_identifier};
use crate::error::{ConfigError, SourceError};
use crate::models::{DateRange, DocumentDescriptor, Variant};
use crate::traits::{MetadataSource, SourceBatch};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

#[derive(Debug, Deserialize)]
struct PageEnvelope {
    #[serde(default)]
    data: Option<Vec<Value>>,
    #[serde(default, rename = "pageCount")]
    page_count: Option<u32>,
}

pub struct HttpMetadataSource {
    client: Arc<Client>,
    base: Url,
    token: String,
    page_size: u32,
}

impl HttpMetadataSource {
    pub fn new(
        base: &str,
        token: impl Into<String>,
        page_size: u32,
        timeout: Duration,
    ) -> Result<Self, SourceError> {
        Ok(Self {
            client: Arc::new(Client::builder().timeout(timeout).build()?),
            base: normalized_base(base)?,
            token: token.into(),
            page_size: page_size.max(1),
        })
    }

    async fn fetch_page(
        &self,
        url: &Url,
        range: &DateRange,
        offset: u64,
    ) -> Result<PageEnvelope, SourceError> {
        debug!(url = %url, offset, "requesting descriptor page");
        let response = self
            .client
            .get(url.clone())
            .bearer_auth(&self.token)
            .query(&[
                ("filter", format!("updatedAt||$gte||{}", range.start_param())),
                ("filter", format!("updatedAt||$lte||{}", range.end_param())),
                ("limit", self.page_size.to_string()),
                ("offset", offset.to_string()),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SourceError::BackendResponse {
                endpoint: url.to_string(),
                details: response.status().to_string(),
            });
        }

        Ok(response.json().await?)
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn fetch_range(&self, range: &DateRange, variant: Variant) -> SourceBatch {
        let mut batch = SourceBatch::default();
        let url = match self.base.join(variant.endpoint()) {
            Ok(url) => url,
            Err(error) => {
                batch.interrupted = Some(error.to_string());
                return batch;
            }
        };

        let mut offset = 0u64;
        let mut expected_pages: Option<u32> = None;

        loop {
            let envelope = match self.fetch_page(&url, range, offset).await {
                Ok(envelope) => envelope,
                Err(error) => {
                    warn!(url = %url, offset, error = %error, "descriptor page failed, keeping partial results");
                    batch.interrupted = Some(error.to_string());
                    break;
                }
            };

            let records = match envelope.data {
                Some(records) if !records.is_empty() => records,
                Some(_) => break,
                None => {
                    warn!(url = %url, offset, "response has no 'data' key");
                    break;
                }
            };

            batch.pages += 1;
            decode_into(&mut batch, variant, records);

            let total = *expected_pages.get_or_insert(envelope.page_count.unwrap_or(0));
            if batch.pages >= total {
                break;
            }
            offset += u64::from(self.page_size);
        }

        info!(
            variant = %variant,
            pages = batch.pages,
            descriptors = batch.descriptors.len(),
            malformed = batch.malformed,
            "descriptor listing finished"
        );
        batch
    }
}

struct Columns {
    id: &'static str,
    updated_at: &'static str,
    payload: &'static str,
    payload_key: &'static str,
}

fn columns(variant: Variant) -> Columns {
    match variant {
        Variant::Data => Columns {
            id: "DocumentId",
            updated_at: "UpdatedAt",
            payload: "originalText",
            payload_key: "original",
        },
        Variant::Party => Columns {
            id: "id",
            updated_at: "updatedAt",
            payload: "attachments",
            payload_key: "attachments",
        },
    }
}

pub struct SqlMetadataSource {
    pool: SqlitePool,
    table: String,
    page_size: u32,
}

impl SqlMetadataSource {
    pub fn new(pool: SqlitePool, table: &str, page_size: u32) -> Result<Self, ConfigError> {
        validate_identifier(table)?;
        Ok(Self {
            pool,
            table: table.to_string(),
            page_size: page_size.max(1),
        })
    }

    pub async fn connect(database_url: &str, table: &str, page_size: u32) -> Result<Self, SourceError> {
        let options = SqliteConnectOptions::from_str(database_url)?.read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        Self::new(pool, table, page_size).map_err(|error| SourceError::BackendResponse {
            endpoint: database_url.to_string(),
            details: error.to_string(),
        })
    }

    async fn fetch_page(
        &self,
        variant: Variant,
        range: &DateRange,
        offset: i64,
    ) -> Result<Vec<Value>, SourceError> {
        let columns = columns(variant);
        let statement = format!(
            "SELECT CAST({id} AS TEXT) AS doc_id, CAST({updated} AS TEXT) AS updated_at, {payload} AS payload \
             FROM {table} \
             WHERE datetime({updated}) BETWEEN ? AND ? \
             ORDER BY datetime({updated}), {id} \
             LIMIT ? OFFSET ?",
            id = columns.id,
            updated = columns.updated_at,
            payload = columns.payload,
            table = self.table,
        );

        let rows = sqlx::query(&statement)
            .bind(range.start.format("%Y-%m-%d %H:%M:%S").to_string())
            .bind(range.end.format("%Y-%m-%d %H:%M:%S").to_string())
            .bind(i64::from(self.page_size))
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| -> Result<Value, SourceError> {
                let mut record = Map::new();
                let id: Option<String> = row.try_get("doc_id")?;
                let updated_at: Option<String> = row.try_get("updated_at")?;
                let payload: Option<String> = row.try_get("payload")?;
                record.insert("id".to_string(), id.map_or(Value::Null, Value::String));
                record.insert(
                    "updatedAt".to_string(),
                    updated_at.map_or(Value::Null, Value::String),
                );
                record.insert(
                    columns.payload_key.to_string(),
                    payload.map_or(Value::Null, Value::String),
                );
                Ok(Value::Object(record))
            })
            .collect()
    }
}

#[async_trait]
impl MetadataSource for SqlMetadataSource {
    async fn fetch_range(&self, range: &DateRange, variant: Variant) -> SourceBatch {
        let mut batch = SourceBatch::default();
        let mut offset = 0i64;

        loop {
            let records = match self.fetch_page(variant, range, offset).await {
                Ok(records) => records,
                Err(error) => {
                    warn!(table = %self.table, offset, error = %error, "descriptor query failed, keeping partial results");
                    batch.interrupted = Some(error.to_string());
                    break;
                }
            };

            if records.is_empty() {
                break;
            }
            let short_page = records.len() < self.page_size as usize;
            batch.pages += 1;
            decode_into(&mut batch, variant, records);

            if short_page {
                break;
            }
            offset += i64::from(self.page_size);
        }

        info!(
            variant = %variant,
            table = %self.table,
            pages = batch.pages,
            descriptors = batch.descriptors.len(),
            malformed = batch.malformed,
            "descriptor query finished"
        );
        batch
    }
}

fn decode_into(batch: &mut SourceBatch, variant: Variant, records: Vec<Value>) {
    for record in records {
        match DocumentDescriptor::decode(variant, record) {
            Ok(descriptor) => batch.descriptors.push(descriptor),
            Err(error) => {
                warn!(variant = %variant, error = %error, "skipping malformed descriptor");
                batch.malformed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Payload;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn range() -> DateRange {
        DateRange::parse("2023-08-25", "2023-08-27").unwrap_or_else(|error| panic!("{error}"))
    }

    async fn mount_page(server: &MockServer, offset: &str, body: Value) {
        Mock::given(method("GET"))
            .and(path("/api/v1/party-docs/document"))
            .and(query_param("offset", offset))
            .and(query_param("limit", "2"))
            .and(header("authorization", "Bearer token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .expect(1)
            .mount(server)
            .await;
    }

    fn source(server: &MockServer) -> HttpMetadataSource {
        HttpMetadataSource::new(
            &format!("{}/api/v1/", server.uri()),
            "token",
            2,
            Duration::from_secs(5),
        )
        .unwrap_or_else(|error| panic!("{error}"))
    }

    #[tokio::test]
    async fn pagination_follows_first_page_count() {
        let server = MockServer::start().await;
        mount_page(
            &server,
            "0",
            json!({"data": [{"id": "P1", "attachments": []}, {"id": "P2", "attachments": []}], "page": 1, "pageCount": 3}),
        )
        .await;
        mount_page(
            &server,
            "2",
            json!({"data": [{"id": "P3", "attachments": []}, {"bogus": true}], "page": 2, "pageCount": 3}),
        )
        .await;
        mount_page(
            &server,
            "4",
            json!({"data": [{"id": "P5", "attachments": [{"link": "x.pdf", "attachNum": 1}]}], "page": 3, "pageCount": 3}),
        )
        .await;

        let batch = source(&server).fetch_range(&range(), Variant::Party).await;

        assert_eq!(batch.pages, 3);
        assert_eq!(batch.malformed, 1);
        assert!(batch.interrupted.is_none());
        let ids: Vec<&str> = batch.descriptors.iter().map(|doc| doc.id.as_str()).collect();
        assert_eq!(ids, vec!["P1", "P2", "P3", "P5"]);
        assert!(matches!(&batch.descriptors[3].payload, Payload::Party { attachments } if attachments.len() == 1));
    }

    #[tokio::test]
    async fn failed_page_keeps_partial_results() {
        let server = MockServer::start().await;
        mount_page(
            &server,
            "0",
            json!({"data": [{"id": "P1"}, {"id": "P2"}], "page": 1, "pageCount": 4}),
        )
        .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/party-docs/document"))
            .and(query_param("offset", "2"))
            .respond_with(ResponseTemplate::new(502))
            .expect(1)
            .mount(&server)
            .await;

        let batch = source(&server).fetch_range(&range(), Variant::Party).await;

        assert_eq!(batch.descriptors.len(), 2);
        assert!(batch.interrupted.is_some_and(|reason| reason.contains("502")));
    }

    #[tokio::test]
    async fn empty_range_is_not_an_error() {
        let server = MockServer::start().await;
        mount_page(&server, "0", json!({"data": [], "page": 1, "pageCount": 0})).await;

        let batch = source(&server).fetch_range(&range(), Variant::Party).await;

        assert!(batch.descriptors.is_empty());
        assert!(batch.interrupted.is_none());
        assert_eq!(batch.pages, 0);
    }

    #[tokio::test]
    async fn date_filters_are_sent_to_data_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/document"))
            .and(query_param("filter", "updatedAt||$gte||2023-08-25T00:00:00Z"))
            .and(query_param("filter", "updatedAt||$lte||2023-08-27T23:59:59Z"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({"data": [{"id": "D1", "original": {"link": "a.pdf"}}], "page": 1, "pageCount": 1}),
            ))
            .expect(1)
            .mount(&server)
            .await;

        let source = HttpMetadataSource::new(&server.uri(), "token", 100, Duration::from_secs(5))
            .unwrap_or_else(|error| panic!("{error}"));
        let batch = source.fetch_range(&range(), Variant::Data).await;

        assert_eq!(batch.descriptors.len(), 1);
        assert_eq!(batch.descriptors[0].id, "D1");
    }

    #[tokio::test]
    async fn sql_source_pages_through_matching_rows() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("registry.db");
        let setup = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(
                SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
                    .create_if_missing(true),
            )
            .await?;
        sqlx::query(
            "CREATE TABLE court_documents (DocumentId INTEGER, UpdatedAt TEXT, originalText TEXT)",
        )
        .execute(&setup)
        .await?;
        for (id, updated, original) in [
            (1, "2023-08-25T08:00:00Z", r#"{"link": "a.pdf"}"#),
            (2, "2023-08-26 12:00:00", r#"{"link": "b.pdf"}"#),
            (3, "2023-08-27T23:00:00", "not json"),
            (4, "2023-09-01 00:00:00", r#"{"link": "late.pdf"}"#),
        ] {
            sqlx::query("INSERT INTO court_documents VALUES (?, ?, ?)")
                .bind(id)
                .bind(updated)
                .bind(original)
                .execute(&setup)
                .await?;
        }
        setup.close().await;

        let source =
            SqlMetadataSource::connect(&format!("sqlite://{}", db_path.display()), "court_documents", 2)
                .await?;
        let batch = source.fetch_range(&range(), Variant::Data).await;

        assert!(batch.interrupted.is_none());
        assert_eq!(batch.pages, 2);
        assert_eq!(batch.malformed, 1);
        let ids: Vec<&str> = batch.descriptors.iter().map(|doc| doc.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        Ok(())
    }

    #[tokio::test]
    async fn sql_source_reports_missing_table_as_interruption() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let db_path = dir.path().join("empty.db");
        let pool = SqlitePoolOptions::new()
            .connect_with(
                SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
                    .create_if_missing(true),
            )
            .await?;

        let source = SqlMetadataSource::new(pool, "absent", 10)?;
        let batch = source.fetch_range(&range(), Variant::Party).await;

        assert!(batch.descriptors.is_empty());
        assert!(batch.interrupted.is_some());
        Ok(())
    }
}
