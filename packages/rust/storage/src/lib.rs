//! Turso Embedded / libSQL storage layer.
//!
//! The [`Storage`] struct wraps a libSQL database holding the assessment
//! layout, version table, bundles, page images, groups, tasks, annotations
//! and rubric revisions.
//!
//! **Concurrency rules:**
//! - Every cross-entity invariant (one Known image per slot, one live task
//!   per group, one lessee per task) is enforced by the database itself:
//!   partial unique indexes and conditional `UPDATE … WHERE … RETURNING`.
//! - Writes go through one connection guarded by the store's write lock;
//!   multi-statement operations run there in an immediate transaction.
//! - Reads use a second connection and only ever see committed rows.
//! - Handles in other processes wait on the file lock for up to
//!   [`BUSY_TIMEOUT`] instead of failing with "database is locked".
//! - Read-only handles ([`Storage::open_readonly`]) reject every write.

mod assessment;
mod bundles;
mod groups;
mod migrations;
mod results;
mod rows;
mod rubrics;
mod tasks;
mod users;

use std::ops::Deref;
use std::path::Path;
use std::time::Duration;

use libsql::{Connection, Database, Transaction, TransactionBehavior, params};
use scanmark_shared::{Result, ScanmarkError};
use tokio::sync::{Mutex, MutexGuard};

pub use bundles::{BundleRegistration, CollisionKeep, Disposition, PageAction};
pub use groups::{GroupChange, GroupDelta, GroupPlanner};
pub use rubrics::MajorRevision;
pub use tasks::{ClaimCandidate, IdentifySubmission};

use rows::db_err;

/// How long a statement waits on another connection's lock.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    writer: Connection,
    reader: Connection,
    readonly: bool,
    write_lock: Mutex<()>,
}

/// The write connection, held under the store's write lock.
pub(crate) struct WriteConn<'a> {
    conn: &'a Connection,
    _guard: MutexGuard<'a, ()>,
}

impl Deref for WriteConn<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

/// A transaction that holds the store's write lock until it ends.
///
/// Dropping it without [`WriteTx::commit`] rolls back.
pub(crate) struct WriteTx<'a> {
    tx: Transaction,
    _guard: MutexGuard<'a, ()>,
}

impl Deref for WriteTx<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.tx
    }
}

impl WriteTx<'_> {
    pub(crate) async fn commit(self) -> Result<()> {
        let Self { tx, _guard } = self;
        tx.commit().await.map_err(db_err)
    }
}

fn connect(db: &Database) -> Result<Connection> {
    let conn = db.connect().map_err(db_err)?;
    conn.busy_timeout(BUSY_TIMEOUT).map_err(db_err)?;
    Ok(conn)
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ScanmarkError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let writer = connect(&db)?;
        // Readers never block the writer, and the writer never blocks readers.
        let mut mode = writer
            .query("PRAGMA journal_mode = WAL", params![])
            .await
            .map_err(db_err)?;
        mode.next().await.map_err(db_err)?;
        drop(mode);
        let reader = connect(&db)?;

        let storage = Self {
            db,
            writer,
            reader,
            readonly: false,
            write_lock: Mutex::new(()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (reporting, dashboards).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let writer = connect(&db)?;
        let reader = connect(&db)?;

        Ok(Self {
            db,
            writer,
            reader,
            readonly: true,
            write_lock: Mutex::new(()),
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.writer
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        ScanmarkError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .writer
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(ScanmarkError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    /// Take the write connection for a single-statement write.
    pub(crate) async fn lock_writes(&self) -> Result<WriteConn<'_>> {
        self.check_writable()?;
        Ok(WriteConn {
            conn: &self.writer,
            _guard: self.write_lock.lock().await,
        })
    }

    /// Begin an immediate transaction under the write lock.
    pub(crate) async fn begin_write(&self) -> Result<WriteTx<'_>> {
        self.check_writable()?;
        let guard = self.write_lock.lock().await;
        let tx = self
            .writer
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(db_err)?;
        Ok(WriteTx { tx, _guard: guard })
    }

    /// The read connection. It never observes an open write transaction.
    pub(crate) fn conn(&self) -> &Connection {
        &self.reader
    }
}
