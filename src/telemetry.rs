/// Telemetry events sent from file loaders to the runner for progress tracking
#[derive(Debug, Clone)]
pub enum TelemetryEvent {
    /// A loader was admitted and started reading a file
    FileStarted,
    /// A batch was inserted
    BatchLoaded {
        rows_inserted: u64,
        rows_dropped: u64,
        duration_ms: u64,
    },
    /// Rows dropped after the last inserted batch of a file
    RowsDropped { rows_dropped: u64 },
    /// A loader finished a file, successfully or not
    FileCompleted { succeeded: bool },
}

/// Statistics aggregated from telemetry events
#[derive(Debug, Default, Clone)]
pub struct ProgressStats {
    pub files_started: usize,
    pub files_completed: usize,
    pub files_failed: usize,
    pub rows_inserted: u64,
    pub rows_dropped: u64,
    pub batch_durations_ms: Vec<u64>,
}

impl ProgressStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update stats with a telemetry event
    pub fn update(&mut self, event: &TelemetryEvent) {
        match event {
            TelemetryEvent::FileStarted => {
                self.files_started += 1;
            }
            TelemetryEvent::BatchLoaded {
                rows_inserted,
                rows_dropped,
                duration_ms,
            } => {
                self.rows_inserted += rows_inserted;
                self.rows_dropped += rows_dropped;
                self.batch_durations_ms.push(*duration_ms);
            }
            TelemetryEvent::RowsDropped { rows_dropped } => {
                self.rows_dropped += rows_dropped;
            }
            TelemetryEvent::FileCompleted { succeeded } => {
                self.files_completed += 1;
                if !succeeded {
                    self.files_failed += 1;
                }
            }
        }
    }

    /// Calculate percentile from batch durations
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.batch_durations_ms.is_empty() {
            return None;
        }

        let mut sorted = self.batch_durations_ms.clone();
        sorted.sort_unstable();

        let index = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
        let index = index.saturating_sub(1).min(sorted.len() - 1);

        Some(sorted[index])
    }

    /// Get p50, p90, p99 percentiles
    pub fn get_percentiles(&self) -> (Option<u64>, Option<u64>, Option<u64>) {
        (
            self.percentile(50.0),
            self.percentile(90.0),
            self.percentile(99.0),
        )
    }
}
