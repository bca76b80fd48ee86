use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid response from {endpoint}: {details}")]
    BackendResponse { endpoint: String, details: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid file link: {0}")]
    InvalidLink(String),
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid target path: {0}")]
    InvalidTarget(String),

    #[error("catalog not initialized at {0}; run `init` first")]
    NotInitialized(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no bearer token configured for tenant {0}")]
    MissingToken(String),

    #[error("no tenants configured")]
    NoTenants,

    #[error("unknown tenant: {0}")]
    UnknownTenant(String),

    #[error("invalid tenant configuration: {0}")]
    InvalidTenants(#[from] serde_json::Error),

    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("invalid date range: {0}")]
    InvalidDateRange(String),

    #[error("invalid base url: {0}")]
    InvalidBaseUrl(#[from] url::ParseError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

pub type Result<T, E = HarvestError> = std::result::Result<T, E>;
