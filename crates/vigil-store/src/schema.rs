//! Schema creation and upgrades, tracked with `PRAGMA user_version`.

use crate::StoreError;
use rusqlite::{Connection, Transaction};

const SCHEMA_VERSION: i32 = 1;

const SCHEMA_V1: &str = "
CREATE TABLE persons (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    notes       TEXT NOT NULL DEFAULT '',
    first_seen  TEXT,
    last_seen   TEXT,
    visit_count INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL
);

CREATE TABLE embeddings (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    person_id  INTEGER NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
    vector     BLOB NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE visits (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    person_id  INTEGER NOT NULL REFERENCES persons(id) ON DELETE CASCADE,
    timestamp  TEXT NOT NULL,
    confidence REAL NOT NULL,
    image_path TEXT NOT NULL
);

CREATE TABLE unknown_sightings (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp     TEXT NOT NULL,
    image_path    TEXT NOT NULL,
    identified    INTEGER NOT NULL DEFAULT 0,
    identified_as INTEGER REFERENCES persons(id) ON DELETE SET NULL
);

CREATE INDEX idx_embeddings_person ON embeddings(person_id);
CREATE INDEX idx_visits_person ON visits(person_id);
CREATE INDEX idx_visits_timestamp ON visits(timestamp DESC);
CREATE INDEX idx_unknown_timestamp ON unknown_sightings(timestamp DESC);
";

pub(crate) fn migrate(conn: &mut Connection) -> Result<(), StoreError> {
    let mut version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if version > SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }
    if version == SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn.transaction()?;
    while version < SCHEMA_VERSION {
        version += 1;
        apply(&tx, version)?;
        tracing::info!(version, "applied schema migration");
    }
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    tx.commit()?;
    Ok(())
}

fn apply(tx: &Transaction<'_>, version: i32) -> Result<(), StoreError> {
    match version {
        1 => tx.execute_batch(SCHEMA_V1)?,
        other => {
            return Err(StoreError::SchemaTooNew {
                found: other,
                supported: SCHEMA_VERSION,
            })
        }
    }
    Ok(())
}
