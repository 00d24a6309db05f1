//! Versioned schema for the cache database.
//!
//! The version lives in `PRAGMA user_version`. Every step is safe to run
//! twice, so a crash between a step and the version bump cannot wedge the
//! database.

use rusqlite::{Connection, Transaction};

use crate::core::error::CacheError;

pub const CURRENT_VERSION: u32 = 2;

const V1_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    email TEXT NOT NULL,
    display_name TEXT NOT NULL,
    profile_picture_url TEXT,
    is_online INTEGER NOT NULL DEFAULT 0,
    last_seen INTEGER NOT NULL,
    push_token TEXT,
    created_at INTEGER NOT NULL,
    synced_at INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL CHECK(type IN ('direct', 'group')),
    name TEXT,
    participants TEXT NOT NULL,
    last_message TEXT,
    last_message_timestamp INTEGER,
    group_picture_url TEXT,
    created_at INTEGER NOT NULL,
    created_by TEXT NOT NULL,
    synced_at INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_conversations_timestamp
    ON conversations(last_message_timestamp DESC);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    type TEXT NOT NULL CHECK(type IN ('text', 'image')),
    content TEXT NOT NULL DEFAULT '',
    image_url TEXT,
    timestamp INTEGER NOT NULL,
    status TEXT NOT NULL CHECK(status IN ('sending', 'sent', 'delivered', 'read', 'failed')),
    delivered_to TEXT NOT NULL DEFAULT '[]',
    read_by TEXT NOT NULL DEFAULT '[]',
    local_id TEXT,
    synced_at INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_timestamp
    ON messages(conversation_id, timestamp ASC);

CREATE INDEX IF NOT EXISTS idx_messages_local_id
    ON messages(local_id) WHERE local_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS pending_messages (
    local_id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    type TEXT NOT NULL CHECK(type IN ('text', 'image')),
    content TEXT NOT NULL,
    image_url TEXT,
    created_at INTEGER NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_attempt_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_pending_messages_conversation
    ON pending_messages(conversation_id, created_at ASC);
";

type Step = fn(&Transaction<'_>) -> Result<(), CacheError>;

const STEPS: &[(u32, Step)] = &[(1, initial_schema), (2, outbox_error_tracking)];

fn initial_schema(tx: &Transaction<'_>) -> Result<(), CacheError> {
    tx.execute_batch(V1_SCHEMA)?;
    Ok(())
}

fn outbox_error_tracking(tx: &Transaction<'_>) -> Result<(), CacheError> {
    add_column_if_absent(tx, "pending_messages", "last_error", "TEXT")?;
    add_column_if_absent(
        tx,
        "pending_messages",
        "parked",
        "INTEGER NOT NULL DEFAULT 0",
    )?;
    tx.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_pending_messages_created
             ON pending_messages(parked, created_at ASC);",
    )?;
    Ok(())
}

fn add_column_if_absent(
    tx: &Transaction<'_>,
    table: &str,
    column: &str,
    decl: &str,
) -> Result<(), CacheError> {
    let exists: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2)",
        rusqlite::params![table, column],
        |row| row.get(0),
    )?;
    if !exists {
        tx.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl};"))?;
    }
    Ok(())
}

pub fn schema_version(conn: &Connection) -> Result<u32, CacheError> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version as u32)
}

/// Bring the schema up to [`CURRENT_VERSION`]. All pending steps share one
/// transaction; any failure leaves the database at its previous version.
pub fn run(conn: &mut Connection) -> Result<u32, CacheError> {
    let current = schema_version(conn)?;
    log::debug!("Cache schema version {current}, target {CURRENT_VERSION}");

    if current > CURRENT_VERSION {
        return Err(CacheError::SchemaTooNew {
            found: current,
            supported: CURRENT_VERSION,
        });
    }
    if current == CURRENT_VERSION {
        return Ok(current);
    }

    let tx = conn.transaction()?;
    for (version, step) in STEPS {
        if *version <= current {
            continue;
        }
        log::info!("Applying cache migration v{version}");
        step(&tx)?;
    }
    tx.pragma_update(None, "user_version", CURRENT_VERSION as i64)?;
    tx.commit()?;

    log::info!("Cache schema migrated from v{current} to v{CURRENT_VERSION}");
    Ok(CURRENT_VERSION)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM pragma_table_info(?1)")
            .unwrap();
        stmt.query_map([table], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn fresh_database_reaches_current_version() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(run(&mut conn).unwrap(), CURRENT_VERSION);
        assert_eq!(schema_version(&conn).unwrap(), CURRENT_VERSION);
        let cols = columns(&conn, "pending_messages");
        assert!(cols.contains(&"last_error".to_string()));
        assert!(cols.contains(&"parked".to_string()));
    }

    #[test]
    fn rerun_is_a_noop() {
        let mut conn = Connection::open_in_memory().unwrap();
        run(&mut conn).unwrap();
        assert_eq!(run(&mut conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn upgrades_v1_database_in_place() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(V1_SCHEMA).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();
        conn.execute(
            "INSERT INTO pending_messages (local_id, conversation_id, sender_id, type, content, created_at)
             VALUES ('l1', 'c1', 'u1', 'text', 'hi', 10)",
            [],
        )
        .unwrap();

        run(&mut conn).unwrap();

        let parked: i64 = conn
            .query_row(
                "SELECT parked FROM pending_messages WHERE local_id = 'l1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(parked, 0);
        assert_eq!(schema_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn steps_tolerate_partially_applied_schema() {
        // Column already present but version never bumped.
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(V1_SCHEMA).unwrap();
        conn.execute_batch("ALTER TABLE pending_messages ADD COLUMN last_error TEXT;")
            .unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();
        assert_eq!(run(&mut conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn refuses_newer_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 99).unwrap();
        assert!(matches!(
            run(&mut conn),
            Err(CacheError::SchemaTooNew { found: 99, .. })
        ));
    }
}
