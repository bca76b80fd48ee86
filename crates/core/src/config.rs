use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path};
use url::Url;

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    #[default]
    Http,
    Sql {
        database: String,
        table: String,
    },
}

#[derive(Deserialize)]
struct TenantEntry {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    folder: Option<String>,
    #[serde(default)]
    source: SourceConfig,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Tenant {
    pub name: String,
    pub token: String,
    pub folder: Option<String>,
    pub source: SourceConfig,
}

impl fmt::Debug for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tenant")
            .field("name", &self.name)
            .field("token", &"<redacted>")
            .field("folder", &self.folder)
            .field("source", &self.source)
            .finish()
    }
}

pub fn parse_tenants(raw: &str) -> Result<Vec<Tenant>, ConfigError> {
    let entries: BTreeMap<String, TenantEntry> = serde_json::from_str(raw)?;
    if entries.is_empty() {
        return Err(ConfigError::NoTenants);
    }

    entries
        .into_iter()
        .map(|(name, entry)| {
            let token = entry
                .token
                .map(|token| token.trim().to_string())
                .filter(|token| !token.is_empty())
                .ok_or_else(|| ConfigError::MissingToken(name.clone()))?;

            let folder = entry
                .folder
                .map(|folder| folder.trim().to_string())
                .filter(|folder| !folder.is_empty());
            if let Some(folder) = &folder {
                validate_folder(folder)?;
            }

            if let SourceConfig::Sql { table, .. } = &entry.source {
                validate_identifier(table)?;
            }

            Ok(Tenant {
                name,
                token,
                folder,
                source: entry.source,
            })
        })
        .collect()
}

pub fn select_tenants(tenants: Vec<Tenant>, name: Option<&str>) -> Result<Vec<Tenant>, ConfigError> {
    match name {
        None => Ok(tenants),
        Some(name) => {
            let selected: Vec<Tenant> = tenants.into_iter().filter(|tenant| tenant.name == name).collect();
            if selected.is_empty() {
                Err(ConfigError::UnknownTenant(name.to_string()))
            } else {
                Ok(selected)
            }
        }
    }
}

pub fn normalized_base(raw: &str) -> Result<Url, url::ParseError> {
    let trimmed = raw.trim();
    if trimmed.ends_with('/') {
        Url::parse(trimmed)
    } else {
        Url::parse(&format!("{trimmed}/"))
    }
}

pub fn validate_identifier(name: &str) -> Result<(), ConfigError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_');
    if valid_start && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier(name.to_string()))
    }
}

fn validate_folder(folder: &str) -> Result<(), ConfigError> {
    let relative = Path::new(folder)
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if relative {
        Ok(())
    } else {
        Err(ConfigError::InvalidArgument(format!(
            "tenant folder must be a relative path without '..': {folder}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenants_parse_with_default_http_source() -> Result<(), Box<dyn std::error::Error>> {
        let tenants = parse_tenants(
            r#"{
                "zeta": {"token": "t2", "source": {"kind": "sql", "database": "sqlite://gov.db", "table": "party_docs"}},
                "acme": {"token": " t1 ", "folder": "acme/files"}
            }"#,
        )?;

        assert_eq!(tenants.len(), 2);
        assert_eq!(tenants[0].name, "acme");
        assert_eq!(tenants[0].token, "t1");
        assert_eq!(tenants[0].folder.as_deref(), Some("acme/files"));
        assert_eq!(tenants[0].source, SourceConfig::Http);
        assert!(matches!(tenants[1].source, SourceConfig::Sql { ref table, .. } if table == "party_docs"));
        Ok(())
    }

    #[test]
    fn tenant_without_token_is_fatal() {
        let result = parse_tenants(r#"{"acme": {"token": "  ", "folder": "acme"}}"#);
        assert!(matches!(result, Err(ConfigError::MissingToken(name)) if name == "acme"));

        let result = parse_tenants(r#"{"acme": {"folder": "acme"}}"#);
        assert!(matches!(result, Err(ConfigError::MissingToken(_))));
    }

    #[test]
    fn unsafe_folders_and_identifiers_are_rejected() {
        assert!(parse_tenants(r#"{"a": {"token": "t", "folder": "../out"}}"#).is_err());
        assert!(parse_tenants(r#"{"a": {"token": "t", "folder": "/abs"}}"#).is_err());
        assert!(parse_tenants(
            r#"{"a": {"token": "t", "source": {"kind": "sql", "database": "x", "table": "d; DROP"}}}"#
        )
        .is_err());
        assert!(parse_tenants("{}").is_err());
    }

    #[test]
    fn debug_output_hides_token() -> Result<(), Box<dyn std::error::Error>> {
        let tenants = parse_tenants(r#"{"acme": {"token": "very-secret"}}"#)?;
        let rendered = format!("{:?}", tenants[0]);
        assert!(!rendered.contains("very-secret"));
        Ok(())
    }

    #[test]
    fn tenant_selection_by_name() -> Result<(), Box<dyn std::error::Error>> {
        let tenants = parse_tenants(r#"{"a": {"token": "1"}, "b": {"token": "2"}}"#)?;
        assert_eq!(select_tenants(tenants.clone(), Some("b"))?.len(), 1);
        assert_eq!(select_tenants(tenants.clone(), None)?.len(), 2);
        assert!(select_tenants(tenants, Some("c")).is_err());
        Ok(())
    }

    #[test]
    fn base_url_gets_trailing_slash() -> Result<(), Box<dyn std::error::Error>> {
        let base = normalized_base("https://example.org/api/v1")?;
        assert_eq!(base.join("data/document")?.as_str(), "https://example.org/api/v1/data/document");
        Ok(())
    }
}
