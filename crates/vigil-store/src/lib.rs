//! vigil-store: SQLite persistence for the person registry, visits and
//! unknown sightings.
//!
//! One [`Store`] wraps one connection. The database runs in WAL mode with a
//! busy timeout, so the daemon's recorder can write while the CLI reads.
//! Timestamps are stored as fixed-width RFC 3339 UTC text, which keeps
//! lexicographic order equal to chronological order.

mod schema;

use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use vigil_core::{Embedding, Person, PersonId, Visit};

const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("database schema version {found} is newer than supported ({supported})")]
    SchemaTooNew { found: i32, supported: i32 },
    #[error("person {0} not found")]
    PersonNotFound(PersonId),
    #[error("a person named {0:?} already exists")]
    DuplicateName(String),
    #[error("person name must not be empty")]
    EmptyName,
    #[error("at least one face embedding is required")]
    NoEmbeddings,
    #[error("unknown sighting {0} not found")]
    UnknownNotFound(i64),
    #[error("unknown sighting {0} is already identified")]
    AlreadyIdentified(i64),
    #[error("corrupt {column} value {value:?}")]
    Corrupt { column: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Partial update of a person's descriptive fields.
#[derive(Debug, Clone, Default)]
pub struct PersonUpdate {
    pub name: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VisitFilter {
    pub person_id: Option<PersonId>,
    pub since: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for VisitFilter {
    fn default() -> Self {
        Self {
            person_id: None,
            since: None,
            limit: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UnknownFilter {
    pub identified: bool,
    pub limit: usize,
}

impl Default for UnknownFilter {
    fn default() -> Self {
        Self {
            identified: false,
            limit: 50,
        }
    }
}

/// A stored visit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisitRecord {
    pub id: i64,
    pub person_id: PersonId,
    pub person_name: String,
    pub timestamp: DateTime<Utc>,
    pub confidence: f32,
    pub image_path: PathBuf,
}

/// A stored unknown sighting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnknownRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub image_path: PathBuf,
    pub identified: bool,
    pub identified_as: Option<PersonId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrequentVisitor {
    pub name: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub total_persons: u64,
    pub total_visits: u64,
    /// Unknown sightings not yet identified.
    pub unknown_count: u64,
    /// Visits on the UTC day of the reference time.
    pub visits_today: u64,
    /// `None` until someone has visited.
    pub most_frequent_visitor: Option<FrequentVisitor>,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        let store = Self::init(conn)?;
        tracing::debug!(path = %path.display(), "opened database");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::trace!(journal_mode = %mode, "configured connection");
        schema::migrate(&mut conn)?;
        Ok(Self { conn })
    }

    /// Enroll a person with one or more face embeddings.
    pub fn add_person(
        &mut self,
        name: &str,
        embeddings: &[Embedding],
        notes: &str,
    ) -> Result<PersonId> {
        let name = name.trim();
        if name.is_empty() {
            return Err(StoreError::EmptyName);
        }
        if embeddings.is_empty() {
            return Err(StoreError::NoEmbeddings);
        }

        let now = fmt_ts(Utc::now());
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO persons (name, notes, created_at) VALUES (?1, ?2, ?3)",
            params![name, notes, now],
        )
        .map_err(|e| duplicate_name(e, name))?;
        let id = tx.last_insert_rowid();
        insert_embeddings(&tx, id, embeddings, &now)?;
        tx.commit()?;

        tracing::info!(person_id = id, name, faces = embeddings.len(), "person enrolled");
        Ok(id)
    }

    /// Attach further face embeddings to an existing person.
    pub fn add_embeddings(&mut self, id: PersonId, embeddings: &[Embedding]) -> Result<()> {
        if embeddings.is_empty() {
            return Err(StoreError::NoEmbeddings);
        }
        let tx = self.conn.transaction()?;
        ensure_person(&tx, id)?;
        insert_embeddings(&tx, id, embeddings, &fmt_ts(Utc::now()))?;
        tx.commit()?;
        tracing::info!(person_id = id, faces = embeddings.len(), "embeddings added");
        Ok(())
    }

    pub fn update_person(&mut self, id: PersonId, update: &PersonUpdate) -> Result<()> {
        let tx = self.conn.transaction()?;
        ensure_person(&tx, id)?;
        if let Some(name) = &update.name {
            let name = name.trim();
            if name.is_empty() {
                return Err(StoreError::EmptyName);
            }
            tx.execute("UPDATE persons SET name = ?1 WHERE id = ?2", params![name, id])
                .map_err(|e| duplicate_name(e, name))?;
        }
        if let Some(notes) = &update.notes {
            tx.execute("UPDATE persons SET notes = ?1 WHERE id = ?2", params![notes, id])?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Delete a person; their embeddings and visits go with them.
    pub fn delete_person(&self, id: PersonId) -> Result<()> {
        let n = self
            .conn
            .execute("DELETE FROM persons WHERE id = ?1", params![id])?;
        if n == 0 {
            return Err(StoreError::PersonNotFound(id));
        }
        tracing::info!(person_id = id, "person deleted");
        Ok(())
    }

    pub fn get_person(&self, id: PersonId) -> Result<Person> {
        let mut person = self
            .conn
            .query_row(
                "SELECT id, name, notes, first_seen, last_seen, visit_count
                 FROM persons WHERE id = ?1",
                params![id],
                row_to_person,
            )
            .optional()?
            .ok_or(StoreError::PersonNotFound(id))??;

        let mut stmt = self
            .conn
            .prepare("SELECT vector FROM embeddings WHERE person_id = ?1 ORDER BY id")?;
        let blobs = stmt.query_map(params![id], |row| row.get::<_, Vec<u8>>(0))?;
        for blob in blobs {
            person.embeddings.push(decode_embedding(&blob?)?);
        }
        Ok(person)
    }

    /// Every person with their embeddings, ordered by name.
    pub fn list_persons(&self) -> Result<Vec<Person>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, notes, first_seen, last_seen, visit_count
             FROM persons ORDER BY name",
        )?;
        let mut persons = stmt
            .query_map([], row_to_person)?
            .map(|r| r.map_err(StoreError::from).and_then(|p| p))
            .collect::<Result<Vec<_>>>()?;

        let mut by_id: HashMap<PersonId, Vec<Embedding>> = HashMap::new();
        let mut stmt = self
            .conn
            .prepare("SELECT person_id, vector FROM embeddings ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        for row in rows {
            let (person_id, blob) = row?;
            by_id
                .entry(person_id)
                .or_default()
                .push(decode_embedding(&blob)?);
        }

        for person in &mut persons {
            person.embeddings = by_id.remove(&person.id).unwrap_or_default();
        }
        Ok(persons)
    }

    /// Append a visit and bump the person's `last_seen`/`visit_count`.
    pub fn record_visit(&mut self, visit: &Visit) -> Result<i64> {
        let ts = fmt_ts(visit.timestamp);
        let tx = self.conn.transaction()?;
        let updated = tx.execute(
            "UPDATE persons
             SET visit_count = visit_count + 1,
                 first_seen = COALESCE(first_seen, ?1),
                 last_seen = CASE WHEN last_seen IS NULL OR last_seen < ?1
                                  THEN ?1 ELSE last_seen END
             WHERE id = ?2",
            params![ts, visit.person_id],
        )?;
        if updated == 0 {
            return Err(StoreError::PersonNotFound(visit.person_id));
        }
        tx.execute(
            "INSERT INTO visits (person_id, timestamp, confidence, image_path)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                visit.person_id,
                ts,
                visit.confidence as f64,
                visit.image_path.to_string_lossy()
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub fn record_unknown(&self, timestamp: DateTime<Utc>, image_path: &Path) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO unknown_sightings (timestamp, image_path) VALUES (?1, ?2)",
            params![fmt_ts(timestamp), image_path.to_string_lossy()],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Attribute an unknown sighting to a person. Allowed once per sighting.
    pub fn mark_identified(&mut self, unknown_id: i64, person_id: PersonId) -> Result<()> {
        let tx = self.conn.transaction()?;
        ensure_person(&tx, person_id)?;
        let identified: bool = tx
            .query_row(
                "SELECT identified FROM unknown_sightings WHERE id = ?1",
                params![unknown_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(StoreError::UnknownNotFound(unknown_id))?;
        if identified {
            return Err(StoreError::AlreadyIdentified(unknown_id));
        }
        tx.execute(
            "UPDATE unknown_sightings SET identified = 1, identified_as = ?1 WHERE id = ?2",
            params![person_id, unknown_id],
        )?;
        tx.commit()?;
        tracing::info!(unknown_id, person_id, "unknown sighting identified");
        Ok(())
    }

    /// Visits, newest first.
    pub fn list_visits(&self, filter: &VisitFilter) -> Result<Vec<VisitRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT v.id, v.person_id, p.name, v.timestamp, v.confidence, v.image_path
             FROM visits v JOIN persons p ON p.id = v.person_id
             WHERE (?1 IS NULL OR v.person_id = ?1)
               AND (?2 IS NULL OR v.timestamp >= ?2)
             ORDER BY v.timestamp DESC, v.id DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![filter.person_id, filter.since.map(fmt_ts), limit(filter.limit)],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, String>(5)?,
                ))
            },
        )?;
        rows.map(|row| {
            let (id, person_id, person_name, ts, confidence, image_path) = row?;
            Ok(VisitRecord {
                id,
                person_id,
                person_name,
                timestamp: parse_ts(&ts, "visits.timestamp")?,
                confidence: confidence as f32,
                image_path: PathBuf::from(image_path),
            })
        })
        .collect()
    }

    /// Unknown sightings with the given identification status, newest first.
    pub fn list_unknown(&self, filter: &UnknownFilter) -> Result<Vec<UnknownRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, timestamp, image_path, identified, identified_as
             FROM unknown_sightings
             WHERE identified = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![filter.identified, limit(filter.limit)], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, Option<i64>>(4)?,
            ))
        })?;
        rows.map(|row| {
            let (id, ts, image_path, identified, identified_as) = row?;
            Ok(UnknownRecord {
                id,
                timestamp: parse_ts(&ts, "unknown_sightings.timestamp")?,
                image_path: PathBuf::from(image_path),
                identified,
                identified_as,
            })
        })
        .collect()
    }

    pub fn stats(&self, now: DateTime<Utc>) -> Result<Stats> {
        let count = |sql: &str, params: &[&dyn rusqlite::ToSql]| -> Result<u64> {
            let n: i64 = self.conn.query_row(sql, params, |row| row.get(0))?;
            Ok(n.max(0) as u64)
        };

        let day_start = Utc
            .from_utc_datetime(&now.date_naive().and_hms_opt(0, 0, 0).unwrap_or_default());
        let day_end = day_start + Duration::days(1);

        let most_frequent_visitor = self
            .conn
            .query_row(
                "SELECT name, visit_count FROM persons
                 WHERE visit_count > 0
                 ORDER BY visit_count DESC, id ASC LIMIT 1",
                [],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?
            .map(|(name, count)| FrequentVisitor {
                name,
                count: count.max(0) as u64,
            });

        Ok(Stats {
            total_persons: count("SELECT COUNT(*) FROM persons", &[])?,
            total_visits: count("SELECT COUNT(*) FROM visits", &[])?,
            unknown_count: count(
                "SELECT COUNT(*) FROM unknown_sightings WHERE identified = 0",
                &[],
            )?,
            visits_today: count(
                "SELECT COUNT(*) FROM visits WHERE timestamp >= ?1 AND timestamp < ?2",
                &[&fmt_ts(day_start), &fmt_ts(day_end)],
            )?,
            most_frequent_visitor,
        })
    }
}

fn insert_embeddings(
    conn: &Connection,
    person_id: PersonId,
    embeddings: &[Embedding],
    created_at: &str,
) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO embeddings (person_id, vector, created_at) VALUES (?1, ?2, ?3)",
    )?;
    for embedding in embeddings {
        stmt.execute(params![person_id, embedding.to_le_bytes(), created_at])?;
    }
    Ok(())
}

fn ensure_person(conn: &Connection, id: PersonId) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM persons WHERE id = ?1)",
        params![id],
        |row| row.get(0),
    )?;
    if exists {
        Ok(())
    } else {
        Err(StoreError::PersonNotFound(id))
    }
}

/// Map a rusqlite row to a `Person` without embeddings. The inner result
/// carries timestamp parse failures.
fn row_to_person(row: &Row<'_>) -> rusqlite::Result<Result<Person>> {
    let first_seen: Option<String> = row.get(3)?;
    let last_seen: Option<String> = row.get(4)?;
    let visit_count: i64 = row.get(5)?;
    let id: PersonId = row.get(0)?;
    let name: String = row.get(1)?;
    let notes: String = row.get(2)?;

    Ok((|| {
        Ok(Person {
            id,
            name,
            embeddings: Vec::new(),
            notes,
            first_seen: first_seen
                .map(|s| parse_ts(&s, "persons.first_seen"))
                .transpose()?,
            last_seen: last_seen
                .map(|s| parse_ts(&s, "persons.last_seen"))
                .transpose()?,
            visit_count: visit_count.max(0) as u64,
        })
    })())
}

fn decode_embedding(blob: &[u8]) -> Result<Embedding> {
    Embedding::from_le_bytes(blob).ok_or_else(|| StoreError::Corrupt {
        column: "embeddings.vector",
        value: format!("{} bytes", blob.len()),
    })
}

fn duplicate_name(err: rusqlite::Error, name: &str) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            StoreError::DuplicateName(name.to_string())
        }
        _ => StoreError::Sqlite(err),
    }
}

fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str, column: &'static str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StoreError::Corrupt {
            column,
            value: value.to_string(),
        })
}
