use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use docharvest_core::{
    audit_catalog, parse_tenants, select_tenants, CatalogStore, DateRange, HarvestCoordinator,
    HarvestOptions, HttpDownloader, HttpMetadataSource, MetadataSource, RetryPolicy, SourceConfig,
    SqlMetadataSource, Tenant, Variant,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "docharvest", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory downloaded files are stored under
    #[arg(long, env = "STORAGE_ROOT", default_value = "files", global = true)]
    storage_root: PathBuf,

    /// SQLite catalog of stored files
    #[arg(long = "catalog", env = "CATALOG_PATH", default_value = "catalog.db", global = true)]
    catalog_path: PathBuf,
}

#[derive(Subcommand)]
enum Command {
    /// Create the catalog database and schema.
    Init,
    /// Download new attachments for a date range into the catalog.
    Harvest(HarvestArgs),
    /// Compare catalog rows with the files on disk.
    Audit,
}

#[derive(Args)]
struct HarvestArgs {
    /// Document category: data or party
    #[arg(long)]
    variant: Variant,

    /// First day of the range (YYYY-MM-DD)
    #[arg(long)]
    start: String,

    /// Last day of the range (YYYY-MM-DD), inclusive
    #[arg(long)]
    end: String,

    /// Run a single configured tenant
    #[arg(long)]
    tenant: Option<String>,

    /// API base URL for listings and file storage
    #[arg(long, env = "BASE_LINK")]
    api_base: String,

    /// Tenant map as JSON
    #[arg(long, env = "TENANTS", hide_env_values = true)]
    tenants: String,

    /// Maximum downloads in flight
    #[arg(long, env = "CONCURRENCY", default_value = "10")]
    concurrency: usize,

    /// Attempts per file before giving up on transient errors
    #[arg(long, default_value = "9")]
    retry_attempts: u32,

    /// Seconds between attempts
    #[arg(long, default_value = "10")]
    retry_delay_secs: u64,

    /// Per-request timeout for file downloads
    #[arg(long, default_value = "600")]
    request_timeout_secs: u64,

    /// Per-request timeout for descriptor listings
    #[arg(long, default_value = "360")]
    metadata_timeout_secs: u64,

    /// Descriptors requested per listing page
    #[arg(long, default_value = "100")]
    page_size: u32,
}

impl HarvestArgs {
    fn options(&self) -> HarvestOptions {
        HarvestOptions {
            concurrency: self.concurrency.max(1),
            page_size: self.page_size.max(1),
            metadata_timeout: Duration::from_secs(self.metadata_timeout_secs),
            retry: RetryPolicy {
                max_attempts: self.retry_attempts.max(1),
                delay: Duration::from_secs(self.retry_delay_secs),
                request_timeout: Duration::from_secs(self.request_timeout_secs),
            },
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    if let Err(error) = dotenvy::dotenv() {
        if !error.not_found() {
            return Err(anyhow::anyhow!("unable to load .env: {error}"));
        }
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "docharvest boot"
    );

    match &cli.command {
        Command::Init => {
            let catalog = CatalogStore::open(&cli.catalog_path, &cli.storage_root).await?;
            catalog.migrate().await?;
            println!("catalog ready at {}", cli.catalog_path.display());
            catalog.close().await;
        }
        Command::Harvest(args) => {
            let range = DateRange::parse(&args.start, &args.end)?;
            let tenants = select_tenants(parse_tenants(&args.tenants)?, args.tenant.as_deref())?;
            let options = args.options();

            let catalog = CatalogStore::open(&cli.catalog_path, &cli.storage_root).await?;
            catalog.migrate().await?;

            info!(
                variant = %args.variant,
                start = %range.start_param(),
                end = %range.end_param(),
                tenants = tenants.len(),
                "starting harvest"
            );

            for tenant in &tenants {
                if let Err(run_error) =
                    harvest_tenant(tenant, &args.api_base, &catalog, &range, args.variant, &options).await
                {
                    error!(tenant = %tenant.name, error = %run_error, "tenant harvest failed");
                }
            }

            catalog.close().await;
            println!(
                "harvest of {} finished for {} tenant(s) at {}",
                args.variant,
                tenants.len(),
                Utc::now().to_rfc3339()
            );
        }
        Command::Audit => {
            let catalog = CatalogStore::open_existing(&cli.catalog_path, &cli.storage_root).await?;
            let report = audit_catalog(&catalog, catalog_files(&cli.catalog_path)).await?;
            catalog.close().await;

            println!(
                "records={} files={} missing={} mismatched={} orphans={} partials={} unreadable={}",
                report.records_checked,
                report.files_scanned,
                report.missing_files.len(),
                report.hash_mismatches.len(),
                report.orphans.len(),
                report.partials.len(),
                report.unreadable.len()
            );
            if !report.is_consistent() {
                anyhow::bail!("catalog and storage root are out of sync");
            }
        }
    }

    Ok(())
}

async fn harvest_tenant(
    tenant: &Tenant,
    api_base: &str,
    catalog: &CatalogStore,
    range: &DateRange,
    variant: Variant,
    options: &HarvestOptions,
) -> anyhow::Result<()> {
    let downloader = HttpDownloader::new(api_base, tenant.token.clone(), options.retry)
        .with_context(|| format!("building downloader for {}", tenant.name))?;

    match &tenant.source {
        SourceConfig::Http => {
            let source = HttpMetadataSource::new(
                api_base,
                tenant.token.clone(),
                options.page_size,
                options.metadata_timeout,
            )?;
            run_coordinator(tenant, source, downloader, catalog, range, variant, options).await
        }
        SourceConfig::Sql { database, table } => {
            let source = SqlMetadataSource::connect(database, table, options.page_size)
                .await
                .with_context(|| format!("opening descriptor database for {}", tenant.name))?;
            run_coordinator(tenant, source, downloader, catalog, range, variant, options).await
        }
    }
}

async fn run_coordinator<S>(
    tenant: &Tenant,
    source: S,
    downloader: HttpDownloader,
    catalog: &CatalogStore,
    range: &DateRange,
    variant: Variant,
    options: &HarvestOptions,
) -> anyhow::Result<()>
where
    S: MetadataSource + Send + Sync,
{
    info!(tenant = %tenant.name, folder = ?tenant.folder, "harvesting tenant");

    let coordinator = HarvestCoordinator::new(source, downloader, catalog.clone())
        .with_folder(tenant.folder.clone())
        .with_concurrency(options.concurrency);

    let report = coordinator.run(range, variant).await?;
    report.log_summary(&tenant.name, variant);

    if report.not_saved() > 0 {
        warn!(tenant = %tenant.name, not_saved = report.not_saved(), "some attachments were not saved");
    }
    println!(
        "{}: {} persisted, {} not saved, {} already cataloged",
        tenant.name,
        report.outcomes.persisted,
        report.not_saved(),
        report.already_cataloged
    );
    Ok(())
}

/// The catalog database and its WAL journals, skipped by the orphan scan.
fn catalog_files(catalog_path: &Path) -> Vec<PathBuf> {
    let name = catalog_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    vec![
        catalog_path.to_path_buf(),
        catalog_path.with_file_name(format!("{name}-wal")),
        catalog_path.with_file_name(format!("{name}-shm")),
    ]
}
