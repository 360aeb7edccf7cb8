//! Pipeline Module
//!
//! Wires a job together: one classifier task producing records, a pool of
//! SQL generation workers, the ordered SQL reporter and the statistics
//! aggregator, connected by bounded channels.

pub mod check;
pub mod classifier;
pub mod record;
pub mod reporter;
pub mod stats;
pub mod worker;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::binlog::{BinlogFileReader, EventSource, ReplicationStream};
use crate::catalog::{Catalog, MySqlSchemaResolver, SchemaResolver, StaticSchemaResolver};
use crate::config::{BinlensConfig, JobConfig, SourceMode, BINLOG_START_POS};
use crate::error::{Error, Result};
use crate::locator;
use crate::tuning::channel_capacity;

pub use check::{CheckOutcome, EventCheck, FilterCheck};
pub use classifier::{Classifier, ClassifierSummary};
pub use record::{ChangeRecord, OperationKind, StatRecord, TransactionState, TrxStatus};
pub use reporter::{ReportSummary, Reporter};
pub use stats::{StatsAggregator, StatsSummary};
pub use worker::{run_worker, RenderedSql, SqlRenderer, StatementRenderer};

/// Cooperative stop signal shared by the job and its controller
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the job to stop after the current event
    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve once a stop has been requested
    pub async fn stopped(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

/// Read-mostly job state shared by every stage
#[derive(Debug)]
pub struct JobContext {
    pub job: JobConfig,
    stop: StopHandle,
}

impl JobContext {
    pub fn new(job: JobConfig) -> Self {
        Self::with_stop(job, StopHandle::new())
    }

    pub fn with_stop(job: JobConfig, stop: StopHandle) -> Self {
        Self { job, stop }
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    pub async fn stopped(&self) {
        self.stop.stopped().await
    }
}

/// Outcome of a finished job
#[derive(Debug, Clone, Default)]
pub struct JobSummary {
    pub classifier: ClassifierSummary,
    pub rendered: u64,
    /// `None` for statistics-only jobs
    pub report: Option<ReportSummary>,
    pub stats: StatsSummary,
    pub output_dir: PathBuf,
}

/// A binlog analysis job
pub struct Job {
    config: BinlensConfig,
    ctx: Arc<JobContext>,
}

impl Job {
    pub fn new(config: BinlensConfig) -> Self {
        let ctx = Arc::new(JobContext::new(config.job.clone()));
        Self { config, ctx }
    }

    /// Handle for cooperative cancellation from another task or thread
    pub fn stop_handle(&self) -> StopHandle {
        self.ctx.stop_handle()
    }

    pub fn context(&self) -> &Arc<JobContext> {
        &self.ctx
    }

    /// Run against the configured source until it drains or is stopped
    pub async fn run(&self) -> Result<JobSummary> {
        let job = &self.config.job;
        let renderer: Arc<dyn SqlRenderer> = Arc::new(StatementRenderer::new(job.extra_info));
        let needs_schemas = !job.is_stats_only() && !job.include_ddl;

        match job.mode {
            SourceMode::Repl => {
                let catalog = Catalog::connect(&self.config.database).await?;
                let start = locator::resolve_start(&self.config, &catalog).await?;
                let schemas: Arc<dyn SchemaResolver> =
                    Arc::new(MySqlSchemaResolver::new(catalog.pool().clone()));

                let stream = ReplicationStream::connect(
                    &self.config.database,
                    self.config.database.server_id,
                    &start,
                    job.verify_checksum,
                )
                .await?;

                self.run_with(stream, start.file, schemas, renderer).await
            }
            SourceMode::File => {
                let first = job
                    .local_files
                    .first()
                    .ok_or_else(|| Error::Config("no local binlog files given".into()))?;
                let start_file = BinlogFileReader::file_name(first);

                let schemas: Arc<dyn SchemaResolver> = if needs_schemas {
                    let catalog = Catalog::connect(&self.config.database).await?;
                    Arc::new(MySqlSchemaResolver::new(catalog.pool().clone()))
                } else {
                    Arc::new(StaticSchemaResolver::new())
                };

                let reader = BinlogFileReader::new(
                    job.local_files.clone(),
                    job.start_position.unwrap_or(BINLOG_START_POS),
                    job.verify_checksum,
                );
                self.run_with(reader, start_file, schemas, renderer).await
            }
        }
    }

    /// Run the pipeline over any event source
    ///
    /// The aggregator, reporter and workers start before the classifier.
    /// Once the classifier returns its senders are gone, so the workers
    /// drain what is queued and exit, which in turn closes the reporter.
    pub async fn run_with<S>(
        &self,
        source: S,
        start_file: String,
        schemas: Arc<dyn SchemaResolver>,
        renderer: Arc<dyn SqlRenderer>,
    ) -> Result<JobSummary>
    where
        S: EventSource + 'static,
    {
        let job = &self.ctx.job;
        let capacity = channel_capacity(job.threads);
        tokio::fs::create_dir_all(&job.output_dir).await?;

        tracing::info!(
            work_type = ?job.work_type,
            threads = job.threads,
            "Starting binlog analysis job, output in {}",
            job.output_dir.display()
        );

        let (stat_tx, stat_rx) = mpsc::channel::<StatRecord>(capacity);
        let aggregator = StatsAggregator::create(job).await?;
        let stats_task = tokio::spawn(aggregator.run(stat_rx));

        let mut workers = Vec::new();
        let mut reporter_task = None;
        let sql_tx = if job.is_stats_only() {
            None
        } else {
            let (sql_tx, sql_rx) = mpsc::channel::<ChangeRecord>(capacity);
            let (out_tx, out_rx) = mpsc::channel::<RenderedSql>(capacity);
            reporter_task = Some(tokio::spawn(Reporter::new(job).run(out_rx)));

            let sql_rx = Arc::new(Mutex::new(sql_rx));
            for id in 1..=job.threads {
                workers.push(tokio::spawn(run_worker(
                    id,
                    sql_rx.clone(),
                    out_tx.clone(),
                    renderer.clone(),
                )));
            }
            Some(sql_tx)
        };

        let check = FilterCheck::from_job(job)?;
        let classifier = Classifier::new(
            self.ctx.clone(),
            source,
            check,
            schemas,
            start_file,
            sql_tx,
            stat_tx,
        );
        let classified = tokio::spawn(classifier.run())
            .await
            .map_err(Error::from)
            .and_then(|r| r);

        let mut rendered = 0;
        let mut first_error = None;
        for worker in workers {
            match worker.await.map_err(Error::from).and_then(|r| r) {
                Ok(count) => rendered += count,
                Err(e) => {
                    tracing::error!("SQL worker failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        let report = match reporter_task {
            Some(task) => Some(task.await??),
            None => None,
        };
        let stats = stats_task.await??;

        let classifier = classified?;
        if let Some(e) = first_error {
            return Err(e);
        }

        tracing::info!(
            events = classifier.events_read,
            selected = classifier.records_selected,
            rendered = rendered,
            "Binlog analysis job finished"
        );

        Ok(JobSummary {
            classifier,
            rendered,
            report,
            stats,
            output_dir: job.output_dir.clone(),
        })
    }
}
