//! Configuration constants and load settings for the data loader
//!
//! This module centralizes the tunable parameters used throughout the
//! application. Nothing here is mutated at runtime: values are built once by
//! the caller and passed into the components that need them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::error::LoadError;

// ============================================================================
// Connection Configuration
// ============================================================================

/// Overall deadline for establishing the initial database connection
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between connection attempts while the database is unreachable
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(300);

/// Upper bound on a single connect attempt inside the connection pool
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on a single ping when the pool validates a connection
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Load Configuration
// ============================================================================

/// Number of rows inserted per statement
pub const DEFAULT_BATCH_SIZE: usize = 2500;

/// Number of files loaded at the same time within one category
pub const DEFAULT_FILE_CONCURRENCY: usize = 12;

/// Field separator used by every source file
pub const FIELD_SEPARATOR: u8 = b';';

/// Column whose empty values cause a row to be skipped
pub const DEFAULT_VALUE_COLUMN: &str = "value";

/// Maximum number of bind parameters Postgres accepts in one statement
///
/// A batch binds `batch_size * column_count` parameters, so plans that would
/// exceed this are rejected before any row is read.
pub const MAX_BIND_PARAMETERS: usize = 65535;

/// Timeout and retry interval for connection acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireConfig {
    pub timeout: Duration,
    pub retry_interval: Duration,
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PING_TIMEOUT,
            retry_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

/// What to do with a row whose designated column is empty
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SkipPolicy {
    /// Insert every row as read
    #[default]
    KeepAll,
    /// Drop rows whose named column holds an empty string
    SkipEmpty { column: String },
}

impl SkipPolicy {
    pub fn skip_empty(column: impl Into<String>) -> Self {
        SkipPolicy::SkipEmpty {
            column: column.into(),
        }
    }
}

/// Per-file load settings shared by every loader in a run
#[derive(Debug, Clone, Builder)]
pub struct LoadConfig {
    #[builder(default = "DEFAULT_BATCH_SIZE")]
    pub batch_size: usize,
    #[builder(default = "FIELD_SEPARATOR")]
    pub separator: u8,
    #[builder(default = "SkipPolicy::skip_empty(DEFAULT_VALUE_COLUMN)")]
    pub skip_policy: SkipPolicy,
}

impl LoadConfig {
    /// Reject a batch shape that could never produce a valid insert
    pub fn check_columns(&self, expected_columns: usize) -> Result<(), LoadError> {
        if self.batch_size == 0 {
            return Err(LoadError::Config("batch size must be positive".to_string()));
        }
        if expected_columns == 0 {
            return Err(LoadError::Config(
                "expected column count must be positive".to_string(),
            ));
        }
        let parameters = self.batch_size.saturating_mul(expected_columns);
        if parameters > MAX_BIND_PARAMETERS {
            return Err(LoadError::Config(format!(
                "batch size {} with {} columns needs {} bind parameters, limit is {}",
                self.batch_size, expected_columns, parameters, MAX_BIND_PARAMETERS
            )));
        }
        Ok(())
    }
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            separator: FIELD_SEPARATOR,
            skip_policy: SkipPolicy::skip_empty(DEFAULT_VALUE_COLUMN),
        }
    }
}

// ============================================================================
// Load Plan
// ============================================================================

/// How the files of a category are located
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileSelector {
    /// A single file, relative to the data directory
    File { name: String },
    /// Every file in the data directory whose name starts with `prefix`
    Prefix { prefix: String },
}

/// A group of files sharing a destination table and a shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCategory {
    pub name: String,
    pub table: String,
    pub expected_columns: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    pub files: FileSelector,
}

fn default_concurrency() -> usize {
    DEFAULT_FILE_CONCURRENCY
}

/// Ordered list of categories loaded by one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadPlan {
    pub categories: Vec<FileCategory>,
}

impl LoadPlan {
    /// Layout of the World Inequality Database bulk export
    pub fn wid() -> Self {
        Self {
            categories: vec![
                FileCategory {
                    name: "countries".to_string(),
                    table: "country".to_string(),
                    expected_columns: 5,
                    concurrency: 1,
                    files: FileSelector::File {
                        name: "WID_countries.csv".to_string(),
                    },
                },
                FileCategory {
                    name: "metadata".to_string(),
                    table: "metadata".to_string(),
                    expected_columns: 19,
                    concurrency: DEFAULT_FILE_CONCURRENCY,
                    files: FileSelector::Prefix {
                        prefix: "WID_metadata".to_string(),
                    },
                },
                FileCategory {
                    name: "data".to_string(),
                    table: "data".to_string(),
                    expected_columns: 7,
                    concurrency: DEFAULT_FILE_CONCURRENCY,
                    files: FileSelector::Prefix {
                        prefix: "WID_data".to_string(),
                    },
                },
            ],
        }
    }

    /// Read a plan from a JSON file
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let plan = serde_json::from_str(&raw)?;
        Ok(plan)
    }

    /// Check every category against `config` before anything is read
    pub fn validate(&self, config: &LoadConfig) -> Result<(), LoadError> {
        for category in &self.categories {
            if category.concurrency == 0 {
                return Err(LoadError::Config(format!(
                    "category '{}' has a concurrency of 0",
                    category.name
                )));
            }
            config.check_columns(category.expected_columns).map_err(|e| match e {
                LoadError::Config(reason) => {
                    LoadError::Config(format!("category '{}': {}", category.name, reason))
                }
                other => other,
            })?;
        }
        Ok(())
    }

    /// Largest concurrency ceiling across categories, used to size the pool
    pub fn max_concurrency(&self) -> usize {
        self.categories
            .iter()
            .map(|c| c.concurrency)
            .max()
            .unwrap_or(1)
            .max(1)
    }
}

impl FileCategory {
    /// Resolve the category's files inside `data_dir`
    ///
    /// Prefix matches are sorted by file name so runs are reproducible. A
    /// missing single file is reported by the loader when it tries to open it.
    pub fn resolve(&self, data_dir: &Path) -> std::io::Result<Vec<PathBuf>> {
        match &self.files {
            FileSelector::File { name } => Ok(vec![data_dir.join(name)]),
            FileSelector::Prefix { prefix } => {
                let mut paths = Vec::new();
                for entry in std::fs::read_dir(data_dir)? {
                    let entry = entry?;
                    if !entry.file_type()?.is_file() {
                        continue;
                    }
                    if entry.file_name().to_string_lossy().starts_with(prefix.as_str()) {
                        paths.push(entry.path());
                    }
                }
                paths.sort();
                Ok(paths)
            }
        }
    }
}
