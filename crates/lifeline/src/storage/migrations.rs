//! Database migration system for lifeline.
//!
//! The schema is built up one version at a time from
//! [`VERSION_STEPS`]; each step runs in its own transaction together with
//! the version bump, so a crash mid-upgrade leaves a consistent version.

use rusqlite::{Connection, OptionalExtension};
use tracing::info;

use crate::error::{Error, Result};

use super::schema::{CREATE_METADATA_TABLE, VERSION_STEPS};

/// The current schema version.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub const CURRENT_VERSION: i32 = VERSION_STEPS.len() as i32;

/// Key used to store the schema version in the metadata table.
const VERSION_KEY: &str = "schema_version";

/// Bring the database schema up to [`CURRENT_VERSION`].
///
/// # Errors
///
/// Returns an error if the stored version is unreadable, newer than this
/// build understands, or a step fails.
pub fn initialize_schema(conn: &mut Connection) -> Result<()> {
    conn.execute(CREATE_METADATA_TABLE, [])?;

    let version = get_schema_version(conn)?;
    if version > CURRENT_VERSION {
        return Err(Error::DatabaseMigration {
            message: format!(
                "database schema version {version} is newer than supported {CURRENT_VERSION}"
            ),
        });
    }

    for next in (version + 1)..=CURRENT_VERSION {
        run_migration(conn, next)?;
    }

    Ok(())
}

/// Get the current schema version from the database.
///
/// Returns 0 if no version is set (fresh database).
fn get_schema_version(conn: &Connection) -> Result<i32> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            [VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;

    match value {
        Some(value) => value.parse().map_err(|_| Error::DatabaseMigration {
            message: format!("invalid schema version: {value}"),
        }),
        None => Ok(0),
    }
}

/// Apply one version step and record it.
fn run_migration(conn: &mut Connection, version: i32) -> Result<()> {
    let step = usize::try_from(version - 1)
        .ok()
        .and_then(|index| VERSION_STEPS.get(index))
        .ok_or_else(|| Error::DatabaseMigration {
            message: format!("unknown migration version: {version}"),
        })?;

    let tx = conn.transaction()?;
    for statement in *step {
        tx.execute(statement, [])?;
    }
    tx.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        (VERSION_KEY, version.to_string()),
    )?;
    tx.commit()?;

    info!(version, "Applied schema migration");
    Ok(())
}
