//! Shell application-inventory database access.
//!
//! After a patch install the shell's `app.db` still carries the old
//! version string; the dispatcher rewrites it so the bubble shows the
//! patched version. The access is behind a trait so dispatcher tests can
//! record the update instead of opening a real database.

use std::path::PathBuf;

use rusqlite::{params, Connection};
use tracing::debug;

use crate::error::InstallError;

/// The one write the dispatcher performs against the shell database.
pub trait AppDatabase: Send {
    /// Set the displayed version of an installed title.
    fn set_app_version(&mut self, title_id: &str, version: &str) -> Result<(), InstallError>;
}

/// `rusqlite`-backed implementation against the shell's `app.db`.
///
/// The connection is opened per update and closed on both success and
/// failure paths.
pub struct ShellAppDb {
    path: PathBuf,
}

impl ShellAppDb {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AppDatabase for ShellAppDb {
    fn set_app_version(&mut self, title_id: &str, version: &str) -> Result<(), InstallError> {
        let conn = Connection::open(&self.path)
            .map_err(|e| InstallError::Database(format!("can't open app database: {e}")))?;

        let result = conn
            .execute(
                "UPDATE tbl_appinfo SET val = ?1 WHERE titleId = ?2 AND key = 3168212510",
                params![version, title_id],
            )
            .map_err(|e| InstallError::Database(format!("version update failed: {e}")));

        // Close explicitly so a close failure is not silently dropped.
        let closed = conn
            .close()
            .map_err(|(_, e)| InstallError::Database(format!("can't close app database: {e}")));

        let rows = result?;
        closed?;
        debug!(title_id, version, rows, "updated app version");
        Ok(())
    }
}
