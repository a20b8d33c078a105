use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use wid_loader::runner::{
    ConnectionArgs, LoadArgs, MigrateArgs, MigrationCommand, run_load, run_migration,
};

#[derive(Parser, Clone)]
#[command(name = "wid-loader", about = "a World Inequality Database CLI")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

/// Flags shared by every command
#[derive(Clone, ClapArgs)]
struct CommonOpts {
    /// Database to connect to
    #[arg(long, default_value = "raw")]
    database: String,

    /// Database user
    #[arg(long, env = "WID_DB_USER")]
    db_user: String,

    /// Database password
    #[arg(long, env = "WID_DB_PASS", hide_env_values = true)]
    db_pass: String,

    /// Database host
    #[arg(long, env = "WID_DB_HOST", default_value = "localhost")]
    db_host: String,

    /// Database port
    #[arg(long, env = "WID_DB_PORT", default_value = "5432")]
    db_port: u16,

    /// Timeout for establishing the initial database connection (e.g., 5s, 1m)
    #[arg(long, default_value = "5s", value_parser = cli::parse_duration)]
    ping_timeout: Duration,

    /// Interval between attempts to establish the initial connection (e.g., 300ms)
    #[arg(long, default_value = "300ms", value_parser = cli::parse_duration)]
    ping_interval: Duration,

    /// Enable verbose logging for debugging
    #[arg(short, long)]
    verbose: bool,

    /// Enable database driver logs for debugging
    #[arg(long)]
    enable_db_logs: bool,
}

impl CommonOpts {
    fn connection(&self) -> ConnectionArgs {
        ConnectionArgs {
            host: self.db_host.clone(),
            port: self.db_port,
            user: self.db_user.clone(),
            password: self.db_pass.clone(),
            database: self.database.clone(),
            ping_timeout: self.ping_timeout,
            ping_interval: self.ping_interval,
        }
    }
}

#[derive(Clone, Subcommand)]
enum Command {
    /// Apply migrations to the database
    Migrate {
        #[command(flatten)]
        common: CommonOpts,

        /// Directory of migration files
        #[arg(long, default_value = "migrations")]
        migrations_dir: PathBuf,

        #[command(subcommand)]
        action: MigrateAction,
    },

    /// Load data into the database
    Load {
        #[command(flatten)]
        common: CommonOpts,

        /// Directory holding the source files
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,

        /// JSON load plan (default: the built-in plan for the raw database)
        #[arg(long)]
        plan: Option<PathBuf>,

        /// Rows per insert statement
        #[arg(short, long, default_value = "2500")]
        batch_size: usize,

        /// Quiet mode - minimal output, only show summary
        #[arg(short, long)]
        quiet: bool,
    },
}

#[derive(Clone, Copy, Subcommand)]
enum MigrateAction {
    /// Apply all pending migrations
    Up,
    /// Revert all applied migrations
    Down,
    /// Apply or revert a number of migrations
    Step {
        /// Number of migrations (delta > 0 will upgrade, delta < 0 will downgrade)
        #[arg(long, default_value = "0", allow_negative_numbers = true)]
        delta: i64,
    },
}

impl From<MigrateAction> for MigrationCommand {
    fn from(action: MigrateAction) -> Self {
        match action {
            MigrateAction::Up => MigrationCommand::Up,
            MigrateAction::Down => MigrationCommand::Down,
            MigrateAction::Step { delta } => MigrationCommand::Step(delta),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Command::Migrate {
            common,
            migrations_dir,
            action,
        } => {
            init_tracing(&common, false);
            let migrate_args = MigrateArgs {
                connection: common.connection(),
                migrations_dir,
            };
            run_migration(migrate_args, action.into()).await?;
        }
        Command::Load {
            common,
            data_dir,
            plan,
            batch_size,
            quiet,
        } => {
            init_tracing(&common, quiet);
            run_loader(common, data_dir, plan, batch_size, quiet).await?;
        }
    }
    Ok(())
}

fn init_tracing(common: &CommonOpts, quiet: bool) {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    let filter = EnvFilter::new(cli::log_directives(
        common.verbose,
        quiet,
        common.enable_db_logs,
    ));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

async fn run_loader(
    common: CommonOpts,
    data_dir: PathBuf,
    plan: Option<PathBuf>,
    batch_size: usize,
    quiet: bool,
) -> anyhow::Result<()> {
    if !quiet {
        println!("WID Data Loader");
        println!("===============");
        println!("Database: {}@{}:{}", common.database, common.db_host, common.db_port);
        println!("Data directory: {}", data_dir.display());
        match &plan {
            Some(path) => println!("Plan: {}", path.display()),
            None => println!("Plan: built-in"),
        }
        println!("Batch size: {}", batch_size);
        println!();
    }

    let load_args = LoadArgs {
        connection: common.connection(),
        data_dir,
        plan,
        batch_size,
        quiet,
    };

    let result = run_load(load_args).await?;

    println!();
    println!("Load Summary");
    println!("============");
    println!("Run ID: {}", result.run_id);
    println!("Files loaded: {}", result.files_loaded);
    println!("Batches: {}", result.batches);
    println!("Rows read: {}", result.rows_read);
    println!("Rows inserted: {}", result.rows_inserted);
    println!("Rows dropped: {}", result.rows_dropped);
    println!("Duration: {:.2}s", result.duration.as_secs_f64());
    println!(
        "Throughput: {:.2} rows/sec",
        result.rows_inserted as f64 / result.duration.as_secs_f64().max(f64::EPSILON)
    );
    if let Some((p50, p90, p99)) = result.batch_time_percentiles {
        println!("Batch time: p50 {}ms, p90 {}ms, p99 {}ms", p50, p90, p99);
    }

    Ok(())
}

/// CLI utility functions for parsing command-line arguments
mod cli {
    use std::time::Duration;

    /// Parse human-readable durations like "300ms", "5s", "2m", "1h"
    pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
        let s = s.trim().to_lowercase();

        let (number_part, unit_part) = match s.find(|c: char| !c.is_ascii_digit()) {
            Some(0) => return Err(anyhow::anyhow!("Invalid duration '{}': missing number", s)),
            Some(pos) => s.split_at(pos),
            None => {
                return Err(anyhow::anyhow!(
                    "Invalid duration '{}': missing unit. Valid units: ms, s, m, h",
                    s
                ));
            }
        };

        let number: u64 = number_part
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid duration number '{}': {}", number_part, e))?;

        match unit_part.trim() {
            "ms" => Ok(Duration::from_millis(number)),
            "s" => Ok(Duration::from_secs(number)),
            "m" => Ok(Duration::from_secs(number * 60)),
            "h" => Ok(Duration::from_secs(number * 60 * 60)),
            _ => Err(anyhow::anyhow!(
                "Invalid duration unit '{}'. Valid units: ms, s, m, h",
                unit_part
            )),
        }
    }

    /// Tracing filter directives for the chosen verbosity
    pub fn log_directives(verbose: bool, quiet: bool, enable_db_logs: bool) -> String {
        let level = if verbose {
            "debug"
        } else if quiet {
            "warn"
        } else {
            "info"
        };
        let db_level = if enable_db_logs { level } else { "off" };
        format!("wid_loader={},sqlx={}", level, db_level)
    }

}
