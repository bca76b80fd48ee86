use crate::error::ConfigError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use serde_with::{json::JsonString, serde_as};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Data,
    Party,
}

impl Variant {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Party => "party",
        }
    }

    pub fn endpoint(self) -> &'static str {
        match self {
            Self::Data => "data/document",
            Self::Party => "party-docs/document",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Variant {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "data" => Ok(Self::Data),
            "party" => Ok(Self::Party),
            other => Err(ConfigError::InvalidArgument(format!(
                "unknown document variant: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn from_days(start: NaiveDate, end: NaiveDate) -> Result<Self, ConfigError> {
        if start > end {
            return Err(ConfigError::InvalidDateRange(format!(
                "start {start} is after end {end}"
            )));
        }

        let last_second = NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN);
        Ok(Self {
            start: start.and_time(NaiveTime::MIN).and_utc(),
            end: end.and_time(last_second).and_utc(),
        })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self, ConfigError> {
        let parse_day = |raw: &str| {
            NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").map_err(|error| {
                ConfigError::InvalidDateRange(format!("{raw}: {error}"))
            })
        };
        Self::from_days(parse_day(start)?, parse_day(end)?)
    }

    pub fn start_param(&self) -> String {
        self.start.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }

    pub fn end_param(&self) -> String {
        self.end.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Scalar {
    Number(i64),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged, bound(deserialize = "T: DeserializeOwned"))]
pub enum Embedded<T> {
    Inline(T),
    Encoded(#[serde_as(as = "JsonString")] T),
}

impl<T> Embedded<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Inline(value) | Self::Encoded(value) => value,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RawAttachment {
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default, rename = "attachNum")]
    pub attach_num: Option<Scalar>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Data { original: Option<RawAttachment> },
    Party { attachments: Vec<RawAttachment> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentDescriptor {
    pub id: String,
    pub updated_at: Option<DateTime<Utc>>,
    pub payload: Payload,
}

#[derive(Deserialize)]
struct DataRecord {
    id: Scalar,
    #[serde(default, rename = "updatedAt", deserialize_with = "lenient_timestamp")]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    original: Option<Embedded<RawAttachment>>,
}

#[derive(Deserialize)]
struct PartyRecord {
    id: Scalar,
    #[serde(default, rename = "updatedAt", deserialize_with = "lenient_timestamp")]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    attachments: Option<Embedded<Vec<RawAttachment>>>,
}

impl DocumentDescriptor {
    pub fn variant(&self) -> Variant {
        match self.payload {
            Payload::Data { .. } => Variant::Data,
            Payload::Party { .. } => Variant::Party,
        }
    }

    pub fn decode(variant: Variant, record: Value) -> Result<Self, serde_json::Error> {
        match variant {
            Variant::Data => {
                let record: DataRecord = serde_json::from_value(record)?;
                Ok(Self {
                    id: record.id.to_string(),
                    updated_at: record.updated_at,
                    payload: Payload::Data {
                        original: record.original.map(Embedded::into_inner),
                    },
                })
            }
            Variant::Party => {
                let record: PartyRecord = serde_json::from_value(record)?;
                Ok(Self {
                    id: record.id.to_string(),
                    updated_at: record.updated_at,
                    payload: Payload::Party {
                        attachments: record
                            .attachments
                            .map(Embedded::into_inner)
                            .unwrap_or_default(),
                    },
                })
            }
        }
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|value| parse_timestamp(&value)))
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }

    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub link: String,
    pub sequence_number: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IngestedRecord {
    pub id: String,
    pub original_url: String,
    pub local_path: String,
    pub size_bytes: i64,
    pub content_hash: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 9,
            delay: Duration::from_secs(10),
            request_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HarvestOptions {
    pub concurrency: usize,
    pub page_size: u32,
    pub metadata_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for HarvestOptions {
    fn default() -> Self {
        Self {
            concurrency: 10,
            page_size: 100,
            metadata_timeout: Duration::from_secs(360),
            retry: RetryPolicy::default(),
        }
    }
}
