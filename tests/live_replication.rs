//! Tests against a live server
//!
//! Run with `cargo test --features integration` and
//! `BINLENS_TEST_DSN="user:password@tcp(host:port)"` pointing at a server
//! with binary logging enabled.

#![cfg(feature = "integration")]

use binlens::catalog::Catalog;
use binlens::config::{BinlensConfig, DatabaseConfig, WorkType};
use binlens::pipeline::Job;

fn database() -> Option<DatabaseConfig> {
    let dsn = std::env::var("BINLENS_TEST_DSN").ok()?;
    Some(DatabaseConfig::from_connection_string(&dsn).expect("invalid BINLENS_TEST_DSN"))
}

#[tokio::test]
async fn test_catalog_lists_binlogs() {
    let Some(database) = database() else {
        eprintln!("BINLENS_TEST_DSN not set, skipping");
        return;
    };

    let catalog = Catalog::connect(&database).await.unwrap();
    let files = catalog.binlog_files().await.unwrap();
    assert!(!files.is_empty());

    let databases = catalog.list_databases().await.unwrap();
    assert!(!databases.iter().any(|d| d == "information_schema"));
}

#[tokio::test]
async fn test_stats_job_drains() {
    let Some(database) = database() else {
        eprintln!("BINLENS_TEST_DSN not set, skipping");
        return;
    };

    let out = tempfile::tempdir().unwrap();
    let mut config = BinlensConfig::with_database(database);
    config.job.work_type = WorkType::Stats;
    config.job.output_dir = out.path().to_path_buf();
    config.job.idle_timeout_secs = 2;

    let summary = Job::new(config).run().await.unwrap();
    assert!(summary.classifier.events_read > 0);
    assert!(summary.report.is_none());
    assert!(out.path().join("binlog_status.txt").exists());
}
