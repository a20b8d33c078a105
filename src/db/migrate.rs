//! Schema migrations
//!
//! Migrations live in a directory of `{version}_{name}.up.sql` /
//! `{version}_{name}.down.sql` files. Applying with nothing pending, or
//! reverting with nothing applied, is a no-op rather than an error. Every
//! command holds the database's migration lock, refuses a dirty state and
//! checks applied versions against the files before changing anything.

use std::path::Path;

use async_trait::async_trait;
use sqlx::migrate::{AppliedMigration, Migrate, MigrateError, Migration, Migrator};
use sqlx::postgres::PgConnection;
use tracing::{debug, info};

use super::pool::Pool;
use crate::error::MigrationError;

/// Versions to apply or revert for a relative step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepPlan {
    /// Pending versions in ascending order
    Apply(Vec<i64>),
    /// Applied versions, newest first
    Revert(Vec<i64>),
}

/// Work out which migrations a `steps(delta)` call touches
pub fn plan_steps(available: &[i64], applied: &[i64], delta: i64) -> StepPlan {
    if delta >= 0 {
        let mut pending: Vec<i64> = available
            .iter()
            .copied()
            .filter(|v| !applied.contains(v))
            .collect();
        pending.sort_unstable();
        pending.dedup();
        pending.truncate(usize::try_from(delta).unwrap_or(usize::MAX));
        StepPlan::Apply(pending)
    } else {
        let mut done = applied.to_vec();
        done.sort_unstable_by(|a, b| b.cmp(a));
        done.truncate(usize::try_from(delta.unsigned_abs()).unwrap_or(usize::MAX));
        StepPlan::Revert(done)
    }
}

/// The bookkeeping a database keeps about applied migrations
#[async_trait]
pub trait MigrationState: Send {
    async fn lock(&mut self) -> Result<(), MigrateError>;
    async fn unlock(&mut self) -> Result<(), MigrateError>;
    async fn ensure_migrations_table(&mut self) -> Result<(), MigrateError>;
    /// Version of a migration that failed part way, if any
    async fn dirty_version(&mut self) -> Result<Option<i64>, MigrateError>;
    async fn list_applied(&mut self) -> Result<Vec<AppliedMigration>, MigrateError>;
    async fn apply(&mut self, migration: &Migration) -> Result<(), MigrateError>;
    async fn revert(&mut self, migration: &Migration) -> Result<(), MigrateError>;
}

#[async_trait]
impl MigrationState for PgConnection {
    async fn lock(&mut self) -> Result<(), MigrateError> {
        Migrate::lock(self).await
    }

    async fn unlock(&mut self) -> Result<(), MigrateError> {
        Migrate::unlock(self).await
    }

    async fn ensure_migrations_table(&mut self) -> Result<(), MigrateError> {
        Migrate::ensure_migrations_table(self).await
    }

    async fn dirty_version(&mut self) -> Result<Option<i64>, MigrateError> {
        Migrate::dirty_version(self).await
    }

    async fn list_applied(&mut self) -> Result<Vec<AppliedMigration>, MigrateError> {
        Migrate::list_applied_migrations(self).await
    }

    async fn apply(&mut self, migration: &Migration) -> Result<(), MigrateError> {
        Migrate::apply(self, migration).await.map(|_| ())
    }

    async fn revert(&mut self, migration: &Migration) -> Result<(), MigrateError> {
        Migrate::revert(self, migration).await.map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Request {
    Up,
    Down,
    Steps(i64),
}

pub struct Migrations {
    migrator: Migrator,
}

impl Migrations {
    /// Load migrations from a directory
    pub async fn from_dir(dir: &Path) -> Result<Self, MigrationError> {
        debug!(dir = %dir.display(), "initializing migrations");
        let migrator = Migrator::new(dir).await?;
        Ok(Self { migrator })
    }

    /// Apply every pending migration
    pub async fn up(&self, pool: &Pool) -> Result<usize, MigrationError> {
        let mut pooled = pool.acquire().await?;
        let conn: &mut PgConnection = &mut pooled;
        debug!("applying up migrations");
        let count = self.run_on(conn, Request::Up).await?;
        info!(count, "migrations up!");
        Ok(count)
    }

    /// Revert every applied migration
    pub async fn down(&self, pool: &Pool) -> Result<usize, MigrationError> {
        let mut pooled = pool.acquire().await?;
        let conn: &mut PgConnection = &mut pooled;
        debug!("applying down migrations");
        let count = self.run_on(conn, Request::Down).await?;
        info!(count, "migrations down!");
        Ok(count)
    }

    /// Apply (`delta > 0`) or revert (`delta < 0`) that many migrations
    ///
    /// Returns how many migrations were applied or reverted.
    pub async fn steps(&self, pool: &Pool, delta: i64) -> Result<usize, MigrationError> {
        if delta == 0 {
            return Ok(0);
        }

        let mut pooled = pool.acquire().await?;
        let conn: &mut PgConnection = &mut pooled;
        let count = self.run_on(conn, Request::Steps(delta)).await?;
        info!(delta, count, "migration steps applied");
        Ok(count)
    }

    /// Run `request` while holding the migration lock
    ///
    /// The lock is released whether or not the run succeeds.
    async fn run_on<M>(&self, conn: &mut M, request: Request) -> Result<usize, MigrationError>
    where
        M: MigrationState + ?Sized,
    {
        conn.lock().await?;
        let result = self.run_locked(conn, request).await;
        let unlocked = conn.unlock().await;
        let count = result?;
        unlocked?;
        Ok(count)
    }

    async fn run_locked<M>(&self, conn: &mut M, request: Request) -> Result<usize, MigrationError>
    where
        M: MigrationState + ?Sized,
    {
        conn.ensure_migrations_table().await?;
        if let Some(version) = conn.dirty_version().await? {
            return Err(MigrationError::Dirty(version));
        }

        let applied = conn.list_applied().await?;
        self.check_applied(&applied)?;

        let applied: Vec<i64> = applied.iter().map(|m| m.version).collect();
        let available: Vec<i64> = self.up_migrations().map(|m| m.version).collect();
        let delta = match request {
            Request::Up => available.len() as i64,
            Request::Down => -(applied.len() as i64),
            Request::Steps(delta) => delta,
        };

        let count = match plan_steps(&available, &applied, delta) {
            StepPlan::Apply(versions) => {
                for version in &versions {
                    if let Some(migration) = self.up_migrations().find(|m| m.version == *version) {
                        debug!(version, description = %migration.description, "applying migration");
                        conn.apply(migration).await?;
                    }
                }
                versions.len()
            }
            StepPlan::Revert(versions) => {
                for version in &versions {
                    let migration = self
                        .down_migrations()
                        .find(|m| m.version == *version)
                        .ok_or(MigrationError::Irreversible(*version))?;
                    debug!(version, description = %migration.description, "reverting migration");
                    conn.revert(migration).await?;
                }
                versions.len()
            }
        };

        if count == 0 {
            debug!(?request, "no migration change");
        }
        Ok(count)
    }

    /// Every applied version must still exist, unchanged, on disk
    fn check_applied(&self, applied: &[AppliedMigration]) -> Result<(), MigrateError> {
        for applied in applied {
            match self.up_migrations().find(|m| m.version == applied.version) {
                None => return Err(MigrateError::VersionMissing(applied.version)),
                Some(migration) if migration.checksum != applied.checksum => {
                    return Err(MigrateError::VersionMismatch(applied.version));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn up_migrations(&self) -> impl Iterator<Item = &Migration> {
        self.migrator
            .iter()
            .filter(|m| !m.migration_type.is_down_migration())
    }

    fn down_migrations(&self) -> impl Iterator<Item = &Migration> {
        self.migrator
            .iter()
            .filter(|m| m.migration_type.is_down_migration())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use tempfile::TempDir;

    /// In-memory migration bookkeeping that records every call
    #[derive(Default)]
    struct FakeState {
        dirty: Option<i64>,
        applied: Vec<(i64, Vec<u8>)>,
        calls: Vec<String>,
    }

    impl FakeState {
        /// Pretend `versions` were applied from `migrations`
        fn with_applied(migrations: &Migrations, versions: &[i64]) -> Self {
            let applied = versions
                .iter()
                .map(|v| {
                    let migration = migrations.up_migrations().find(|m| m.version == *v).unwrap();
                    (*v, migration.checksum.to_vec())
                })
                .collect();
            Self {
                applied,
                ..Default::default()
            }
        }

        fn changes(&self) -> Vec<&str> {
            self.calls
                .iter()
                .map(String::as_str)
                .filter(|c| c.starts_with("apply") || c.starts_with("revert"))
                .collect()
        }
    }

    #[async_trait]
    impl MigrationState for FakeState {
        async fn lock(&mut self) -> Result<(), MigrateError> {
            self.calls.push("lock".to_string());
            Ok(())
        }

        async fn unlock(&mut self) -> Result<(), MigrateError> {
            self.calls.push("unlock".to_string());
            Ok(())
        }

        async fn ensure_migrations_table(&mut self) -> Result<(), MigrateError> {
            self.calls.push("ensure".to_string());
            Ok(())
        }

        async fn dirty_version(&mut self) -> Result<Option<i64>, MigrateError> {
            Ok(self.dirty)
        }

        async fn list_applied(&mut self) -> Result<Vec<AppliedMigration>, MigrateError> {
            Ok(self
                .applied
                .iter()
                .map(|(version, checksum)| AppliedMigration {
                    version: *version,
                    checksum: Cow::Owned(checksum.clone()),
                })
                .collect())
        }

        async fn apply(&mut self, migration: &Migration) -> Result<(), MigrateError> {
            self.calls.push(format!("apply {}", migration.version));
            self.applied
                .push((migration.version, migration.checksum.to_vec()));
            Ok(())
        }

        async fn revert(&mut self, migration: &Migration) -> Result<(), MigrateError> {
            self.calls.push(format!("revert {}", migration.version));
            self.applied.retain(|(v, _)| *v != migration.version);
            Ok(())
        }
    }

    /// Reversible `create table` migrations for `versions`
    async fn migrations_in(dir: &TempDir, versions: &[i64]) -> Migrations {
        for version in versions {
            std::fs::write(
                dir.path().join(format!("{}_create_t{}.up.sql", version, version)),
                format!("CREATE TABLE t{} (id TEXT);", version),
            )
            .unwrap();
            std::fs::write(
                dir.path().join(format!("{}_create_t{}.down.sql", version, version)),
                format!("DROP TABLE t{};", version),
            )
            .unwrap();
        }
        Migrations::from_dir(dir.path()).await.unwrap()
    }

    #[tokio::test]
    async fn test_dirty_state_refuses_to_step() {
        let dir = TempDir::new().unwrap();
        let migrations = migrations_in(&dir, &[1, 2, 3]).await;
        let mut state = FakeState::with_applied(&migrations, &[1]);
        state.dirty = Some(2);

        let err = migrations
            .run_on(&mut state, Request::Steps(1))
            .await
            .unwrap_err();

        assert!(matches!(err, MigrationError::Dirty(2)));
        assert!(state.changes().is_empty());
        assert_eq!(state.calls.first().map(String::as_str), Some("lock"));
        assert_eq!(state.calls.last().map(String::as_str), Some("unlock"));
    }

    #[tokio::test]
    async fn test_nothing_pending_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let migrations = migrations_in(&dir, &[1, 2]).await;
        let mut state = FakeState::with_applied(&migrations, &[1, 2]);

        assert_eq!(migrations.run_on(&mut state, Request::Up).await.unwrap(), 0);
        assert_eq!(
            migrations
                .run_on(&mut state, Request::Steps(1))
                .await
                .unwrap(),
            0
        );
        assert!(state.changes().is_empty());
    }

    #[tokio::test]
    async fn test_down_with_nothing_applied_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let migrations = migrations_in(&dir, &[1, 2]).await;
        let mut state = FakeState::default();

        assert_eq!(migrations.run_on(&mut state, Request::Down).await.unwrap(), 0);
        assert_eq!(
            migrations
                .run_on(&mut state, Request::Steps(-1))
                .await
                .unwrap(),
            0
        );
        assert!(state.changes().is_empty());
    }

    #[tokio::test]
    async fn test_up_applies_pending_in_order_then_down_reverts_all() {
        let dir = TempDir::new().unwrap();
        let migrations = migrations_in(&dir, &[1, 2, 3]).await;
        let mut state = FakeState::with_applied(&migrations, &[1]);

        assert_eq!(migrations.run_on(&mut state, Request::Up).await.unwrap(), 2);
        assert_eq!(state.changes(), vec!["apply 2", "apply 3"]);

        state.calls.clear();
        assert_eq!(migrations.run_on(&mut state, Request::Down).await.unwrap(), 3);
        assert_eq!(state.changes(), vec!["revert 3", "revert 2", "revert 1"]);
        assert!(state.applied.is_empty());
    }

    #[tokio::test]
    async fn test_changed_migration_is_rejected() {
        let dir = TempDir::new().unwrap();
        let migrations = migrations_in(&dir, &[1, 2]).await;
        let mut state = FakeState::default();
        state.applied.push((1, vec![0xde, 0xad]));

        let err = migrations.run_on(&mut state, Request::Up).await.unwrap_err();

        assert!(matches!(
            err,
            MigrationError::Migrate(MigrateError::VersionMismatch(1))
        ));
        assert!(state.changes().is_empty());
        assert_eq!(state.calls.last().map(String::as_str), Some("unlock"));
    }

    #[tokio::test]
    async fn test_applied_version_missing_on_disk_is_rejected() {
        let dir = TempDir::new().unwrap();
        let migrations = migrations_in(&dir, &[1]).await;
        let mut state = FakeState::with_applied(&migrations, &[1]);
        state.applied.push((9, vec![1, 2, 3]));

        let err = migrations
            .run_on(&mut state, Request::Steps(-1))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            MigrationError::Migrate(MigrateError::VersionMissing(9))
        ));
        assert!(state.changes().is_empty());
    }

    #[tokio::test]
    async fn test_revert_without_down_file_is_irreversible() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("1_create_t1.up.sql"),
            "CREATE TABLE t1 (id TEXT);",
        )
        .unwrap();
        let migrations = Migrations::from_dir(dir.path()).await.unwrap();
        let mut state = FakeState::with_applied(&migrations, &[1]);

        let err = migrations
            .run_on(&mut state, Request::Steps(-1))
            .await
            .unwrap_err();

        assert!(matches!(err, MigrationError::Irreversible(1)));
        assert!(state.changes().is_empty());
    }

    #[test]
    fn test_plan_forward_takes_lowest_pending() {
        let plan = plan_steps(&[3, 1, 2, 4], &[1], 2);
        assert_eq!(plan, StepPlan::Apply(vec![2, 3]));
    }

    #[test]
    fn test_plan_forward_past_end_is_bounded() {
        let plan = plan_steps(&[1, 2], &[1], 5);
        assert_eq!(plan, StepPlan::Apply(vec![2]));
    }

    #[test]
    fn test_plan_forward_nothing_pending() {
        let plan = plan_steps(&[1, 2], &[1, 2], 1);
        assert_eq!(plan, StepPlan::Apply(vec![]));
    }

    #[test]
    fn test_plan_backward_takes_newest_applied() {
        let plan = plan_steps(&[1, 2, 3], &[1, 2, 3], -2);
        assert_eq!(plan, StepPlan::Revert(vec![3, 2]));
    }

    #[test]
    fn test_plan_backward_nothing_applied() {
        let plan = plan_steps(&[1, 2], &[], -1);
        assert_eq!(plan, StepPlan::Revert(vec![]));
    }

    #[tokio::test]
    async fn test_from_dir_reads_reversible_pairs() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("1_create_country.up.sql"),
            "CREATE TABLE country (alpha2 TEXT);",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("1_create_country.down.sql"),
            "DROP TABLE country;",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("2_create_data.up.sql"),
            "CREATE TABLE data (country TEXT);",
        )
        .unwrap();
        std::fs::write(dir.path().join("2_create_data.down.sql"), "DROP TABLE data;").unwrap();

        let migrations = Migrations::from_dir(dir.path()).await.unwrap();
        let ups: Vec<i64> = migrations.up_migrations().map(|m| m.version).collect();
        let downs: Vec<i64> = migrations.down_migrations().map(|m| m.version).collect();

        assert_eq!(ups, vec![1, 2]);
        assert_eq!(downs, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_bundled_migrations_are_reversible() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations");
        let migrations = Migrations::from_dir(&dir).await.unwrap();
        let ups: Vec<i64> = migrations.up_migrations().map(|m| m.version).collect();
        let downs: Vec<i64> = migrations.down_migrations().map(|m| m.version).collect();

        assert_eq!(ups, vec![1, 2, 3]);
        assert_eq!(downs, vec![1, 2, 3]);
    }
}
