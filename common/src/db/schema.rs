use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use rusqlite::Connection;
use tracing::{debug, info};

pub const SCHEMA_VERSION: &str = "1.1";

// schema management
//
// every table uses CREATE IF NOT EXISTS so that opening a store is
// idempotent, and older stores are brought current by adding any missing
// columns before the indexes are (re)created.

pub fn init(conn: &Connection) -> Result<()> {
    create_tables(conn)?;
    migrate(conn)?;

    // legacy stores may predate the (hash, size) uniqueness; the index
    // cannot be created while duplicate rows exist
    collapse_duplicate_identities(conn)?;

    create_indexes(conn)?;

    Ok(())
}

// collapse rows sharing a (hash, size) identity, keeping the oldest and
// rewriting message references.  only row state is touched here; files
// belonging to dropped rows become orphans and are swept by the
// reconciler after its grace window.
fn collapse_duplicate_identities(conn: &Connection) -> Result<()> {
    let groups = {
        let mut stmt = conn.prepare(
            "SELECT file_hash, file_size FROM media_files
             WHERE file_hash IS NOT NULL AND file_size > 0
             GROUP BY file_hash, file_size
             HAVING COUNT(*) > 1",
        )?;

        stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?
    };

    for (hash, size) in groups {
        let ids = {
            let mut stmt = conn.prepare(
                "SELECT id FROM media_files
                 WHERE file_hash = ?1 AND file_size = ?2
                 ORDER BY indexed_at ASC, id ASC",
            )?;

            stmt.query_map(rusqlite::params![hash, size], |row| row.get::<_, i64>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        };

        let keep = ids[0];

        for dup in &ids[1..] {
            conn.execute(
                "UPDATE messages SET media_file_id = ?1 WHERE media_file_id = ?2",
                rusqlite::params![keep, dup],
            )?;
            conn.execute("DELETE FROM media_files WHERE id = ?1", rusqlite::params![dup])?;
        }

        info!({ hash = hash, kept = keep, dropped = ids.len() - 1 }, "collapsed duplicate media rows");
    }

    Ok(())
}

fn create_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS messages (
            id INTEGER,
            entity_id INTEGER,
            date TEXT,
            text TEXT,
            media_type TEXT,
            forward_origin TEXT,
            sender_id TEXT,
            sender_name TEXT,
            views INTEGER,
            reply_to_msg_id INTEGER,
            reactions TEXT,
            web_preview TEXT,
            extraction_time TEXT,
            is_service INTEGER DEFAULT 0,
            is_voice INTEGER DEFAULT 0,
            is_pinned INTEGER DEFAULT 0,
            file_id TEXT,
            file_size INTEGER,
            media_file_id INTEGER,
            PRIMARY KEY (id, entity_id),
            FOREIGN KEY (media_file_id) REFERENCES media_files(id)
        );

        CREATE TABLE IF NOT EXISTS media_files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_path TEXT UNIQUE NOT NULL,
            file_hash TEXT NOT NULL,
            file_size INTEGER NOT NULL,
            file_id TEXT,
            access_hash TEXT,
            media_type TEXT,
            mime_type TEXT,
            file_name TEXT,
            file_extension TEXT,
            duration INTEGER,
            width INTEGER,
            height INTEGER,
            indexed_at TEXT,
            last_used_at TEXT
        );

        CREATE TABLE IF NOT EXISTS buttons (
            message_id INTEGER,
            entity_id INTEGER,
            row INTEGER,
            column INTEGER,
            text TEXT,
            data TEXT,
            url TEXT,
            UNIQUE(message_id, entity_id, row, column)
        );

        CREATE TABLE IF NOT EXISTS links (
            message_id INTEGER,
            entity_id INTEGER,
            ord INTEGER,
            text TEXT,
            href TEXT,
            UNIQUE(message_id, entity_id, ord)
        );

        CREATE TABLE IF NOT EXISTS replies (
            message_id INTEGER,
            entity_id INTEGER,
            reply_to_msg_id INTEGER,
            quote_text TEXT,
            UNIQUE(message_id, entity_id)
        );

        CREATE TABLE IF NOT EXISTS reactions (
            message_id INTEGER,
            entity_id INTEGER,
            emoji TEXT,
            count INTEGER,
            UNIQUE(message_id, entity_id, emoji)
        );

        CREATE TABLE IF NOT EXISTS backup_metadata (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TEXT
        );
        ",
    )?;

    Ok(())
}

fn create_indexes(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        CREATE INDEX IF NOT EXISTS idx_media_hash ON media_files(file_hash);
        CREATE INDEX IF NOT EXISTS idx_media_file_id ON media_files(file_id);
        CREATE INDEX IF NOT EXISTS idx_media_size ON media_files(file_size);
        CREATE INDEX IF NOT EXISTS idx_media_path ON media_files(file_path);
        CREATE INDEX IF NOT EXISTS idx_media_name ON media_files(file_name);
        CREATE INDEX IF NOT EXISTS idx_media_size_duration ON media_files(file_size, duration);
        CREATE INDEX IF NOT EXISTS idx_media_resolution ON media_files(width, height);
        CREATE INDEX IF NOT EXISTS idx_messages_media_ref ON messages(media_file_id);

        -- the serialization point for concurrent post-download merges
        CREATE UNIQUE INDEX IF NOT EXISTS idx_media_hash_size_unique
            ON media_files(file_hash, file_size);
        ",
    )?;

    Ok(())
}

// columns that may be added to an existing store, validated against this
// allow-list before any identifier reaches a statement
const COLUMN_MIGRATIONS: &[(&str, &str, &str, Option<&str>)] = &[
    ("messages", "is_service", "INTEGER", Some("0")),
    ("messages", "is_voice", "INTEGER", Some("0")),
    ("messages", "is_pinned", "INTEGER", Some("0")),
    ("messages", "sender_id", "TEXT", None),
    ("messages", "file_id", "TEXT", None),
    ("messages", "file_size", "INTEGER", None),
    ("messages", "media_file_id", "INTEGER", None),
    ("replies", "quote_text", "TEXT", None),
    ("media_files", "access_hash", "TEXT", None),
    ("media_files", "mime_type", "TEXT", None),
    ("media_files", "file_name", "TEXT", None),
    ("media_files", "file_extension", "TEXT", None),
    ("media_files", "duration", "INTEGER", None),
    ("media_files", "width", "INTEGER", None),
    ("media_files", "height", "INTEGER", None),
];

const ALLOWED_COLUMN_TYPES: &[&str] = &["TEXT", "INTEGER", "REAL", "BLOB"];

static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("invalid identifier regex"));

fn migrate(conn: &Connection) -> Result<()> {
    let mut performed = Vec::new();

    for (table, column, column_type, default) in COLUMN_MIGRATIONS {
        if add_column_if_missing(conn, table, column, column_type, *default)? {
            performed.push(format!("{table}.{column}"));
        }
    }

    if !performed.is_empty() {
        info!({ columns = ?performed }, "database schema updated");
    }

    Ok(())
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    column_type: &str,
    default: Option<&str>,
) -> Result<bool> {
    if !IDENTIFIER_RE.is_match(table) || !IDENTIFIER_RE.is_match(column) {
        return Err(anyhow::Error::msg(format!(
            "invalid identifier in migration: {table}.{column}"
        )));
    }

    if !ALLOWED_COLUMN_TYPES.contains(&column_type) {
        return Err(anyhow::Error::msg(format!(
            "invalid column type in migration: {column_type}"
        )));
    }

    if column_exists(conn, table, column)? {
        return Ok(false);
    }

    // identifiers were validated above, so string assembly is safe here
    let default_clause = match default {
        Some(val) => format!(" DEFAULT {val}"),
        None => String::new(),
    };

    conn.execute(
        &format!("ALTER TABLE {table} ADD COLUMN {column} {column_type}{default_clause}"),
        [],
    )?;

    debug!({ table = table, column = column }, "added missing column");
    Ok(true)
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;

    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get("name")?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        init(&conn).unwrap();
        init(&conn).unwrap();

        assert!(column_exists(&conn, "media_files", "access_hash").unwrap());
        assert!(column_exists(&conn, "messages", "media_file_id").unwrap());
    }

    #[test]
    fn migration_adds_missing_columns() {
        let conn = Connection::open_in_memory().unwrap();

        // a legacy store without the newer media columns
        conn.execute_batch(
            r"
            CREATE TABLE media_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_path TEXT UNIQUE NOT NULL,
                file_hash TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                file_id TEXT,
                media_type TEXT,
                indexed_at TEXT,
                last_used_at TEXT
            );
            ",
        )
        .unwrap();

        init(&conn).unwrap();

        assert!(column_exists(&conn, "media_files", "duration").unwrap());
        assert!(column_exists(&conn, "media_files", "width").unwrap());
    }

    #[test]
    fn duplicate_identities_are_collapsed_before_indexing() {
        let conn = Connection::open_in_memory().unwrap();

        // a legacy store with two rows for the same content
        conn.execute_batch(
            r"
            CREATE TABLE media_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_path TEXT UNIQUE NOT NULL,
                file_hash TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                indexed_at TEXT,
                last_used_at TEXT
            );
            CREATE TABLE messages (
                id INTEGER,
                entity_id INTEGER,
                media_file_id INTEGER,
                PRIMARY KEY (id, entity_id)
            );
            INSERT INTO media_files (file_path, file_hash, file_size, indexed_at)
                VALUES ('media/a.jpg', 'h', 10, '2024-01-01T00:00:00+00:00');
            INSERT INTO media_files (file_path, file_hash, file_size, indexed_at)
                VALUES ('media/b.jpg', 'h', 10, '2024-02-01T00:00:00+00:00');
            INSERT INTO messages (id, entity_id, media_file_id) VALUES (1, 7, 2);
            ",
        )
        .unwrap();

        init(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM media_files", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);

        // the survivor is the oldest row, and the message follows it
        let (path, msg_ref): (String, i64) = conn
            .query_row(
                "SELECT mf.file_path, m.media_file_id
                 FROM media_files mf, messages m",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(path, "media/a.jpg");
        assert_eq!(msg_ref, 1);
    }

    #[test]
    fn hash_size_uniqueness_is_enforced() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();

        conn.execute(
            "INSERT INTO media_files (file_path, file_hash, file_size) VALUES ('a', 'h', 10)",
            [],
        )
        .unwrap();

        let dup = conn.execute(
            "INSERT INTO media_files (file_path, file_hash, file_size) VALUES ('b', 'h', 10)",
            [],
        );

        assert!(dup.is_err());
    }
}
