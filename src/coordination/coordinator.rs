use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::executor::BatchSink;
use super::worker::{FileLoader, FileReport};
use crate::db::TableTarget;
use crate::error::LoadError;
use crate::telemetry::{ProgressStats, TelemetryEvent};

/// Totals over the files of one dispatch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub files: usize,
    pub batches: usize,
    pub rows_read: u64,
    pub rows_inserted: u64,
    pub rows_dropped: u64,
}

impl DispatchSummary {
    fn add(&mut self, report: &FileReport) {
        self.files += 1;
        self.batches += report.batches;
        self.rows_read += report.rows_read;
        self.rows_inserted += report.rows_inserted;
        self.rows_dropped += report.rows_dropped;
    }

    pub fn merge(&mut self, other: &DispatchSummary) {
        self.files += other.files;
        self.batches += other.batches;
        self.rows_read += other.rows_read;
        self.rows_inserted += other.rows_inserted;
        self.rows_dropped += other.rows_dropped;
    }
}

/// Runs a file loader over many files with a bounded number in flight
///
/// The first failure cancels every other loader of the dispatch: files not yet
/// started are skipped and running ones stop at their next batch. Inserts
/// already sent to the database are not interrupted.
pub struct Dispatcher<S: BatchSink> {
    loader: Arc<FileLoader<S>>,
}

impl<S: BatchSink + 'static> Dispatcher<S> {
    pub fn new(loader: FileLoader<S>) -> Self {
        Self {
            loader: Arc::new(loader),
        }
    }

    /// Load every path into `target`, at most `ceiling` at a time
    pub async fn dispatch(
        &self,
        target: &TableTarget,
        paths: Vec<PathBuf>,
        expected_columns: usize,
        ceiling: usize,
        parent: &CancellationToken,
    ) -> Result<DispatchSummary, LoadError> {
        if ceiling == 0 {
            return Err(LoadError::Config(
                "concurrency ceiling must be positive".to_string(),
            ));
        }
        self.loader.validate(expected_columns)?;

        let cancel = parent.child_token();
        let target = Arc::new(target.clone());
        let mut join_set: JoinSet<Result<FileReport, LoadError>> = JoinSet::new();
        let mut summary = DispatchSummary::default();
        let mut first_error: Option<LoadError> = None;

        info!(
            table = %target.name,
            files = paths.len(),
            ceiling,
            "dispatching files"
        );

        for path in paths {
            // Wait if we've reached the concurrency limit
            while join_set.len() >= ceiling {
                if let Some(result) = join_set.join_next().await {
                    Self::collect(result, &mut summary, &mut first_error, &cancel);
                }
            }

            if cancel.is_cancelled() {
                debug!(path = %path.display(), "skipping file after cancellation");
                if first_error.is_none() {
                    first_error = Some(LoadError::Cancelled { path });
                }
                break;
            }

            let loader = Arc::clone(&self.loader);
            let target = Arc::clone(&target);
            let cancel = cancel.clone();
            join_set.spawn(async move {
                loader
                    .load(&target, &path, expected_columns, &cancel)
                    .await
            });
        }

        // In-flight loaders finish their current statement before stopping
        while let Some(result) = join_set.join_next().await {
            Self::collect(result, &mut summary, &mut first_error, &cancel);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Record one finished loader, cancelling the rest on the first failure
    fn collect(
        result: Result<Result<FileReport, LoadError>, JoinError>,
        summary: &mut DispatchSummary,
        first_error: &mut Option<LoadError>,
        cancel: &CancellationToken,
    ) {
        let error = match result {
            Ok(Ok(report)) => {
                summary.add(&report);
                return;
            }
            Ok(Err(e)) => e,
            Err(e) => LoadError::Worker(format!("Task panicked: {}", e)),
        };

        if !error.is_cancelled() {
            warn!("file load failed: {}", error);
        }
        cancel.cancel();

        // A loader that stopped because of cancellation never hides the
        // failure that caused it.
        let replace = match first_error {
            None => true,
            Some(current) => current.is_cancelled() && !error.is_cancelled(),
        };
        if replace {
            *first_error = Some(error);
        }
    }
}

/// Render progress bars from loader telemetry until every sender is dropped
pub fn setup_progress_tracking(
    total_files: u64,
    quiet: bool,
    mut telemetry_rx: mpsc::UnboundedReceiver<TelemetryEvent>,
) -> tokio::task::JoinHandle<ProgressStats> {
    if quiet {
        return tokio::spawn(async move {
            let mut stats = ProgressStats::new();
            while let Some(event) = telemetry_rx.recv().await {
                stats.update(&event);
            }
            stats
        });
    }

    let multi_progress = MultiProgress::new();

    let files_bar = multi_progress.add(ProgressBar::new(total_files));
    files_bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] Files: [{bar:30.cyan/blue}] {pos}/{len} ({percent}%)")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-"),
    );

    let rows_bar = multi_progress.add(ProgressBar::new_spinner());
    rows_bar.set_style(
        ProgressStyle::default_spinner()
            .template("[{elapsed_precise}] Rows:  {human_pos} inserted | {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );

    let stats_bar = multi_progress.add(ProgressBar::new(0));
    stats_bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] Batch Time: {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    tokio::spawn(async move {
        let mut stats = ProgressStats::new();

        while let Some(event) = telemetry_rx.recv().await {
            stats.update(&event);

            files_bar.set_position(stats.files_completed as u64);
            rows_bar.set_position(stats.rows_inserted);
            rows_bar.set_message(format!("{} dropped", stats.rows_dropped));

            let (p50, p90, p99) = stats.get_percentiles();
            if let (Some(p50), Some(p90), Some(p99)) = (p50, p90, p99) {
                stats_bar.set_message(format!("p50: {}ms, p90: {}ms, p99: {}ms", p50, p90, p99));
            }
        }

        files_bar.finish();
        rows_bar.finish();
        let (p50, p90, p99) = stats.get_percentiles();
        if let (Some(p50), Some(p90), Some(p99)) = (p50, p90, p99) {
            stats_bar.finish_with_message(format!("p50: {}ms, p90: {}ms, p99: {}ms", p50, p90, p99));
        } else {
            stats_bar.finish();
        }
        stats
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadConfig;
    use crate::formats::Record;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    /// Fails any batch containing a row for `fail_country`; tracks overlap
    struct GatedSink {
        fail_country: Option<&'static str>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        countries: Mutex<Vec<String>>,
    }

    impl GatedSink {
        fn new(fail_country: Option<&'static str>) -> Self {
            Self {
                fail_country,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                countries: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BatchSink for GatedSink {
        async fn insert(&self, _sql: &str, records: &[Record]) -> Result<u64, sqlx::Error> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let country = records[0].fields[0].clone();
            self.countries.lock().unwrap().push(country.clone());
            if Some(country.as_str()) == self.fail_country {
                return Err(sqlx::Error::Protocol(format!("cannot insert {}", country)));
            }
            Ok(records.len() as u64)
        }
    }

    fn write_files(dir: &TempDir, countries: &[&str], rows: usize) -> Vec<PathBuf> {
        countries
            .iter()
            .map(|country| {
                let mut content = String::from("country;variable;percentile;year;value;age;pop\n");
                for i in 0..rows {
                    content.push_str(&format!("{};npopul999i;p0p100;{};{};999;i\n", country, 2000 + i, i));
                }
                let path = dir.path().join(format!("WID_data_{}.csv", country));
                std::fs::write(&path, content).unwrap();
                path
            })
            .collect()
    }

    fn dispatcher(sink: Arc<GatedSink>, batch_size: usize) -> Dispatcher<GatedSink> {
        let config = LoadConfig {
            batch_size,
            ..Default::default()
        };
        Dispatcher::new(FileLoader::new(sink, config))
    }

    #[tokio::test]
    async fn test_second_file_failure_is_returned() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &["DE", "FR", "US"], 4);
        let sink = Arc::new(GatedSink::new(Some("FR")));

        let err = dispatcher(Arc::clone(&sink), 2)
            .dispatch(
                &TableTarget::untyped("data"),
                paths.clone(),
                7,
                2,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            LoadError::Query { path, batch, .. } => {
                assert_eq!(path, paths[1]);
                assert_eq!(batch, 0);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // FR never gets past its first batch
        let countries = sink.countries.lock().unwrap();
        assert_eq!(countries.iter().filter(|c| *c == "FR").count(), 1);
    }

    #[tokio::test]
    async fn test_ceiling_bounds_concurrent_files() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &["AR", "BR", "CL", "DE", "ES", "FR"], 6);
        let sink = Arc::new(GatedSink::new(None));

        let summary = dispatcher(Arc::clone(&sink), 2)
            .dispatch(
                &TableTarget::untyped("data"),
                paths,
                7,
                2,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(sink.max_in_flight.load(Ordering::SeqCst) <= 2);
        assert_eq!(summary.files, 6);
        assert_eq!(summary.batches, 18);
        assert_eq!(summary.rows_inserted, 36);
        assert_eq!(summary.rows_dropped, 0);
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_dispatch() {
        let dir = TempDir::new().unwrap();
        let paths = write_files(&dir, &["DE", "FR"], 2);
        let sink = Arc::new(GatedSink::new(None));
        let parent = CancellationToken::new();
        parent.cancel();

        let err = dispatcher(Arc::clone(&sink), 2)
            .dispatch(&TableTarget::untyped("data"), paths, 7, 1, &parent)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(sink.countries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_ceiling_is_config_error() {
        let sink = Arc::new(GatedSink::new(None));
        let err = dispatcher(sink, 2)
            .dispatch(
                &TableTarget::untyped("data"),
                vec![],
                7,
                0,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::Config(_)));
    }

    #[test]
    fn test_summary_merge() {
        let mut total = DispatchSummary::default();
        let part = DispatchSummary {
            files: 2,
            batches: 3,
            rows_read: 10,
            rows_inserted: 8,
            rows_dropped: 2,
        };
        total.merge(&part);
        total.merge(&part);
        assert_eq!(total.files, 4);
        assert_eq!(total.rows_inserted, 16);
        assert_eq!(total.rows_dropped, 4);
    }

    #[tokio::test]
    async fn test_quiet_progress_tracking_aggregates() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = setup_progress_tracking(1, true, rx);
        tx.send(TelemetryEvent::FileStarted).unwrap();
        tx.send(TelemetryEvent::BatchLoaded {
            rows_inserted: 7,
            rows_dropped: 1,
            duration_ms: 3,
        })
        .unwrap();
        tx.send(TelemetryEvent::FileCompleted { succeeded: true })
            .unwrap();
        drop(tx);

        let stats = handle.await.unwrap();
        assert_eq!(stats.files_completed, 1);
        assert_eq!(stats.rows_inserted, 7);
    }
}
