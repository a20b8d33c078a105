//! High-level runner API for the WID loader.
//!
//! This module wraps connection acquisition, plan resolution, and dispatch
//! behind two entry points, one per CLI command. It is the only public API of
//! the crate.

use anyhow::{Context, Result, bail};
use sqlx::postgres::PgConnectOptions;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{AcquireConfig, FileCategory, LoadConfigBuilder, LoadPlan};
use crate::coordination::{DispatchSummary, Dispatcher, FileLoader, setup_progress_tracking};
use crate::db::{Migrations, PgConnector, Pool, acquire, query_table_target};

/// Database the built-in World Inequality Database plan loads into
pub const RAW_DATABASE: &str = "raw";

/// Where and how to connect
#[derive(Debug, Clone)]
pub struct ConnectionArgs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,

    /// Overall deadline for the first successful ping
    pub ping_timeout: Duration,
    /// Pause between connection attempts
    pub ping_interval: Duration,
}

impl ConnectionArgs {
    fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .password(&self.password)
            .database(&self.database)
    }

    fn acquire_config(&self) -> AcquireConfig {
        AcquireConfig {
            timeout: self.ping_timeout,
            retry_interval: self.ping_interval,
        }
    }
}

/// Arguments for running a data load operation
#[derive(Debug, Clone)]
pub struct LoadArgs {
    pub connection: ConnectionArgs,

    /// Directory holding the source files
    pub data_dir: PathBuf,
    /// JSON load plan; the built-in plan is used for the raw database when absent
    pub plan: Option<PathBuf>,
    pub batch_size: usize,
    pub quiet: bool,

    // Test-only: inject a pre-created pool (for SQLite testing)
    #[cfg(test)]
    pub test_pool: Option<Pool>,
}

/// Result of a completed data load operation
#[derive(Debug)]
pub struct LoadResult {
    pub run_id: String,
    pub files_loaded: usize,
    pub batches: usize,
    pub rows_read: u64,
    pub rows_inserted: u64,
    pub rows_dropped: u64,
    pub duration: Duration,
    /// p50, p90, p99 batch insert time in milliseconds
    pub batch_time_percentiles: Option<(u64, u64, u64)>,
}

/// Run every category of the load plan, in order
///
/// Files of one category are loaded concurrently up to the category's
/// ceiling; the next category starts only once the previous one is fully
/// loaded. The first failure stops the run. Batches already inserted are
/// kept.
pub async fn run_load(args: LoadArgs) -> Result<LoadResult> {
    let start_time = Instant::now();
    let run_id = Uuid::new_v4().to_string();
    info!("Starting load run: {}", run_id);

    let plan = resolve_plan(&args)?;
    let load_config = LoadConfigBuilder::default()
        .batch_size(args.batch_size)
        .build()
        .context("Invalid load configuration")?;
    plan.validate(&load_config).context("Invalid load plan")?;

    let mut categories: Vec<(&FileCategory, Vec<PathBuf>)> = Vec::new();
    for category in &plan.categories {
        let paths = category.resolve(&args.data_dir).with_context(|| {
            format!(
                "Failed to list files for category '{}' in {}",
                category.name,
                args.data_dir.display()
            )
        })?;
        info!(
            category = %category.name,
            table = %category.table,
            files = paths.len(),
            "resolved category"
        );
        categories.push((category, paths));
    }
    let total_files: usize = categories.iter().map(|(_, paths)| paths.len()).sum();

    // Create connection pool (or use test pool if provided)
    #[cfg(test)]
    let pool = match args.test_pool {
        Some(test_pool) => test_pool,
        None => connect(&args.connection, plan.max_concurrency()).await?,
    };

    #[cfg(not(test))]
    let pool = connect(&args.connection, plan.max_concurrency()).await?;

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling load");
                cancel.cancel();
            }
        })
    };

    let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel();
    let progress = setup_progress_tracking(total_files as u64, args.quiet, telemetry_rx);

    let dispatcher =
        Dispatcher::new(FileLoader::new(Arc::new(pool.clone()), load_config).with_telemetry(telemetry_tx));
    let outcome = load_categories(&dispatcher, &pool, categories, &cancel).await;

    // Dropping the dispatcher closes the telemetry channel so progress can finish
    drop(dispatcher);
    interrupt.abort();
    let stats = progress.await.context("Progress tracking task failed")?;

    let summary = outcome?;
    let duration = start_time.elapsed();

    info!(
        "Load complete: {} files, {} rows inserted, {} rows dropped in {:.2}s",
        summary.files,
        summary.rows_inserted,
        summary.rows_dropped,
        duration.as_secs_f64()
    );

    let batch_time_percentiles = match stats.get_percentiles() {
        (Some(p50), Some(p90), Some(p99)) => Some((p50, p90, p99)),
        _ => None,
    };

    Ok(LoadResult {
        run_id,
        files_loaded: summary.files,
        batches: summary.batches,
        rows_read: summary.rows_read,
        rows_inserted: summary.rows_inserted,
        rows_dropped: summary.rows_dropped,
        duration,
        batch_time_percentiles,
    })
}

fn resolve_plan(args: &LoadArgs) -> Result<LoadPlan> {
    match &args.plan {
        Some(path) => LoadPlan::from_json_file(path)
            .with_context(|| format!("Failed to read load plan {}", path.display())),
        None if args.connection.database == RAW_DATABASE => Ok(LoadPlan::wid()),
        None => bail!(
            "No built-in load plan for database '{}'. Pass --plan to describe the files to load.",
            args.connection.database
        ),
    }
}

async fn load_categories(
    dispatcher: &Dispatcher<Pool>,
    pool: &Pool,
    categories: Vec<(&FileCategory, Vec<PathBuf>)>,
    cancel: &CancellationToken,
) -> Result<DispatchSummary> {
    let mut total = DispatchSummary::default();

    for (category, paths) in categories {
        let target = query_table_target(pool, &category.table)
            .await
            .with_context(|| format!("Failed to look up columns of table '{}'", category.table))?;

        let summary = dispatcher
            .dispatch(
                &target,
                paths,
                category.expected_columns,
                category.concurrency,
                cancel,
            )
            .await
            .with_context(|| {
                format!(
                    "Failed to load category '{}' into table '{}'",
                    category.name, category.table
                )
            })?;

        info!(
            category = %category.name,
            files = summary.files,
            inserted = summary.rows_inserted,
            dropped = summary.rows_dropped,
            "loaded category"
        );
        total.merge(&summary);
    }

    Ok(total)
}

async fn connect(connection: &ConnectionArgs, pool_size: usize) -> Result<Pool> {
    let pool_size = u32::try_from(pool_size).unwrap_or(u32::MAX);
    let connector = PgConnector::new(connection.connect_options(), pool_size);
    let pool = acquire(&connector, connection.acquire_config())
        .await
        .context("Error connecting to database")?;
    Ok(pool)
}

/// Schema change to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationCommand {
    /// Apply every pending migration
    Up,
    /// Revert every applied migration
    Down,
    /// Apply (positive) or revert (negative) this many migrations
    Step(i64),
}

/// Arguments for running schema migrations
#[derive(Debug, Clone)]
pub struct MigrateArgs {
    pub connection: ConnectionArgs,
    /// Directory of `{version}_{name}.up.sql` / `.down.sql` files
    pub migrations_dir: PathBuf,
}

/// Connect and run one migration command
pub async fn run_migration(args: MigrateArgs, command: MigrationCommand) -> Result<()> {
    let migrations = Migrations::from_dir(&args.migrations_dir)
        .await
        .with_context(|| {
            format!(
                "Error initializing migrations from {}",
                args.migrations_dir.display()
            )
        })?;

    let pool = connect(&args.connection, 1).await?;

    let count = match command {
        MigrationCommand::Up => migrations
            .up(&pool)
            .await
            .context("Error performing up migration")?,
        MigrationCommand::Down => migrations
            .down(&pool)
            .await
            .context("Error performing down migration")?,
        MigrationCommand::Step(delta) => migrations
            .steps(&pool, delta)
            .await
            .with_context(|| format!("Error stepping migrations by {}", delta))?,
    };
    if count == 0 {
        info!("no migration change");
    }

    Ok(())
}
