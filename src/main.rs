//! Binlens - MySQL Binlog Change-Data-Capture Analyzer
//!
//! Command line front end: runs analysis jobs, lists databases and tables,
//! and reads status reports back.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use binlens::catalog::Catalog;
use binlens::config::{BinlensConfig, DatabaseConfig, WorkType};
use binlens::error::{Error, Result};
use binlens::pipeline::Job;
use binlens::report::parse_report;

/// Binlens - MySQL binlog analyzer
#[derive(Parser)]
#[command(name = "binlens")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "binlens.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an analysis job
    Run {
        /// Override the configured work type (2sql, rollback, stats)
        #[arg(short, long)]
        work_type: Option<String>,

        /// Override the output directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Print SQL to stdout and follow the server
        #[arg(long)]
        screen: bool,
    },

    /// List user databases on the server
    Databases {
        /// Connection string `user:password@tcp(host:port)` instead of the config
        #[arg(long)]
        dsn: Option<String>,
    },

    /// List tables of the given databases
    Tables {
        /// Databases to list
        #[arg(short, long, required = true, num_args = 1..)]
        database: Vec<String>,

        /// Connection string `user:password@tcp(host:port)` instead of the config
        #[arg(long)]
        dsn: Option<String>,
    },

    /// Parse a binlog_status.txt report and print it as JSON
    Report {
        /// Report file
        file: PathBuf,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "binlens.toml")]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The flag wins over the config file; the config is only read when present
    let level = cli.log_level.clone().unwrap_or_else(|| {
        BinlensConfig::from_file(&cli.config)
            .map(|c| c.logging.level)
            .unwrap_or_else(|_| "info".to_string())
    });
    init_logging(&level);

    match cli.command {
        Commands::Run {
            work_type,
            output_dir,
            screen,
        } => run_job(cli.config, work_type, output_dir, screen).await,
        Commands::Databases { dsn } => run_databases(cli.config, dsn).await,
        Commands::Tables { database, dsn } => run_tables(cli.config, dsn, database).await,
        Commands::Report { file } => run_report(file),
        Commands::Init { output } => run_init(output),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn parse_work_type(value: &str) -> Result<WorkType> {
    match value {
        "2sql" | "forward" => Ok(WorkType::ToSql),
        "rollback" => Ok(WorkType::Rollback),
        "stats" => Ok(WorkType::Stats),
        other => Err(Error::Config(format!(
            "unknown work type '{}', expected 2sql, rollback or stats",
            other
        ))),
    }
}

/// Connection from `--dsn` or the config file
fn database_config(config_path: &Path, dsn: Option<String>) -> Result<DatabaseConfig> {
    match dsn {
        Some(dsn) => DatabaseConfig::from_connection_string(&dsn),
        None => Ok(BinlensConfig::from_file(config_path)?.database),
    }
}

/// Run an analysis job until it drains or Ctrl+C is pressed
async fn run_job(
    config_path: PathBuf,
    work_type: Option<String>,
    output_dir: Option<PathBuf>,
    screen: bool,
) -> Result<()> {
    let mut config = match BinlensConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };

    if let Some(work_type) = work_type {
        config.job.work_type = parse_work_type(&work_type)?;
    }
    if let Some(dir) = output_dir {
        config.job.output_dir = dir;
    }
    config.job.output_to_screen |= screen;
    config.validate()?;

    tracing::info!(
        "Analysing binlogs of {} ({:?}, {} workers)",
        config.database.address(),
        config.job.work_type,
        config.job.threads
    );

    let job = Job::new(config);
    let stop = job.stop_handle();
    ctrlc::set_handler(move || {
        tracing::info!("Received Ctrl+C, stopping analysis...");
        stop.stop();
    })
    .map_err(|e| Error::Internal(format!("failed to install Ctrl+C handler: {}", e)))?;

    match job.run().await {
        Ok(summary) => {
            println!("Analysis finished");
            println!("  Events read:      {}", summary.classifier.events_read);
            println!("  Records selected: {}", summary.classifier.records_selected);
            if summary.classifier.decode_failures > 0 {
                println!(
                    "  Undecodable:      {} events skipped",
                    summary.classifier.decode_failures
                );
            }
            println!(
                "  Rows changed:     {} inserts, {} updates, {} deletes",
                summary.stats.inserts, summary.stats.updates, summary.stats.deletes
            );
            if let Some(report) = &summary.report {
                if let Some(path) = &report.output {
                    println!("  SQL statements:   {} in {}", report.statements, path.display());
                }
            }
            println!("  Reports in:       {}", summary.output_dir.display());
            Ok(())
        }
        Err(e) => {
            tracing::error!("Analysis failed: {}", e);
            Err(e)
        }
    }
}

/// List non-system databases
async fn run_databases(config_path: PathBuf, dsn: Option<String>) -> Result<()> {
    let database = database_config(&config_path, dsn)?;
    let catalog = Catalog::connect(&database).await?;

    for name in catalog.list_databases().await? {
        println!("{}", name);
    }
    Ok(())
}

/// List tables of the given databases
async fn run_tables(config_path: PathBuf, dsn: Option<String>, databases: Vec<String>) -> Result<()> {
    let database = database_config(&config_path, dsn)?;
    let catalog = Catalog::connect(&database).await?;

    for table in catalog.list_tables(&databases).await? {
        println!("{}", table);
    }
    Ok(())
}

/// Print a status report as JSON
fn run_report(file: PathBuf) -> Result<()> {
    let entries = parse_report(&file)?;
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}

/// Write a sample configuration
fn run_init(output: PathBuf) -> Result<()> {
    let config_content = r#"# Binlens Configuration
# Generated configuration file

[database]
host = "127.0.0.1"
port = 3306
# Needs REPLICATION SLAVE, REPLICATION CLIENT and SELECT on information_schema
user = "binlens"
password = "changeme"
server_id = 1113306
pool_size = 2
connect_timeout_secs = 10

[job]
mode = "repl"            # repl | file
work_type = "2sql"       # 2sql | rollback | stats
databases = []
tables = []
include_ddl = false      # true: emit DDL statements only
include_insert = true
include_update = true
include_delete = true
# threads = 4
# start_datetime = "2026-01-21 16:00:00"
# stop_datetime = "2026-01-21 17:00:00"
# start_file = "mysql-bin.000001"
# start_position = 4
# local_files = ["/var/lib/mysql/mysql-bin.000001"]
output_dir = "./binlens-out"
output_to_screen = false
extra_info = true
idle_timeout_secs = 5
print_interval_secs = 30
big_trx_row_limit = 500
long_trx_seconds = 300

[logging]
level = "info"
"#;

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure the source server and job.");
    println!("Then run with: binlens --config {} run", output.display());

    Ok(())
}

fn run_validate(config_path: PathBuf) -> Result<()> {
    match BinlensConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!(
                "  Source: {}@{}",
                config.database.user,
                config.database.address()
            );
            println!("  Mode: {:?}", config.job.mode);
            println!("  Work type: {:?}", config.job.work_type);
            println!("  Workers: {}", config.job.threads);
            if !config.job.databases.is_empty() {
                println!("  Databases: {}", config.job.databases.join(", "));
            }
            if !config.job.tables.is_empty() {
                println!("  Tables: {}", config.job.tables.join(", "));
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
