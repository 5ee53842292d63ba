use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::Result;
use chrono::Utc;
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, Row, named_params, params_from_iter};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{Level, debug, instrument};

use crate::db::{MessageRow, MetadataQuery, NewMediaFile, schema};
use crate::error::BackupError;
use crate::media::hash::HashAlgorithm;
use crate::media::metadata::normalize_filename_for_search;

use api::entity::EntityId;
use api::media::{MediaFile, MediaFileId, RemoteMedia};
use api::message::{MessageId, RemoteMessage, TextLink};

// sqlite store backend
//
// one backup.db per entity.  the connection lives behind an async mutex, so
// every statement is serialized; sqlite runs in autocommit mode and the
// multi-statement operations below use explicit transactions, which is what
// keeps index state and filesystem state in lockstep across crashes.
pub struct BackupDb {
    conn: Mutex<Connection>,
    // guards the compound dedup sequences (check + file rename + update),
    // which span several statements and a filesystem mutation
    dedup: Mutex<()>,
    base_dir: PathBuf,
    algorithm: HashAlgorithm,
}

const MEDIA_COLUMNS: &str = "id, file_path, file_hash, file_size, file_id, access_hash, \
     media_type, mime_type, file_name, file_extension, duration, width, height, \
     indexed_at, last_used_at";

fn media_from_row(row: &Row<'_>) -> rusqlite::Result<MediaFile> {
    Ok(MediaFile {
        id: row.get(0)?,
        file_path: row.get(1)?,
        file_hash: row.get(2)?,
        file_size: row.get(3)?,
        file_id: row.get(4)?,
        access_hash: row.get(5)?,
        media_type: row.get(6)?,
        mime_type: row.get(7)?,
        file_name: row.get(8)?,
        file_extension: row.get(9)?,
        duration: row.get(10)?,
        width: row.get(11)?,
        height: row.get(12)?,
        indexed_at: row.get(13)?,
        last_used_at: row.get(14)?,
    })
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn metadata_get(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM backup_metadata WHERE key = :key",
            named_params! { ":key": key },
            |row| row.get(0),
        )
        .optional()?;

    Ok(value)
}

fn metadata_set(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO backup_metadata (key, value, updated_at)
         VALUES (:key, :value, :now)",
        named_params! { ":key": key, ":value": value, ":now": now() },
    )?;

    Ok(())
}

impl BackupDb {
    // open (or create) the per-entity store, run migrations, and verify the
    // hash-algorithm pin.  refusing a mismatched algorithm is what keeps the
    // (hash, size) identity meaningful across runs.
    #[instrument(level = Level::DEBUG, skip_all)]
    pub async fn open(base_dir: &Path, algorithm: HashAlgorithm) -> Result<Self> {
        let base_dir = base_dir.to_owned();

        tokio::fs::create_dir_all(&base_dir).await?;

        let db_path = base_dir.join(api::DB_FILENAME);

        debug!({ path = ?db_path }, "opening backup store");

        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = Connection::open(&db_path)?;

            schema::init(&conn)?;

            match metadata_get(&conn, "hash_algorithm")? {
                None => metadata_set(&conn, "hash_algorithm", algorithm.name())?,
                Some(stored) if stored == algorithm.name() => {}
                Some(stored) => {
                    return Err(anyhow::Error::msg(format!(
                        "store was indexed with {stored}; refusing to write {} digests \
                         without a re-hash migration",
                        algorithm.name()
                    )));
                }
            }

            match metadata_get(&conn, "schema_version")? {
                Some(version) if version == schema::SCHEMA_VERSION => {}
                _ => metadata_set(&conn, "schema_version", schema::SCHEMA_VERSION)?,
            }

            Ok(conn)
        })
        .await??;

        Ok(BackupDb {
            conn: Mutex::new(conn),
            dedup: Mutex::new(()),
            base_dir,
            algorithm,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn media_dir(&self) -> PathBuf {
        self.base_dir.join(api::MEDIA_DIR)
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    // hold this guard across any dedup sequence that mutates both the
    // filesystem and the index, so a rename is never visible without the
    // matching row update
    pub async fn dedup_guard(&self) -> MutexGuard<'_, ()> {
        self.dedup.lock().await
    }

    // stored paths are relative to the entity directory when possible
    pub fn relative_path(&self, path: &Path) -> String {
        match path.strip_prefix(&self.base_dir) {
            Ok(rel) => rel.to_string_lossy().into_owned(),
            Err(_) => path.to_string_lossy().into_owned(),
        }
    }

    pub fn absolute_path(&self, stored: &str) -> PathBuf {
        let path = Path::new(stored);

        if path.is_absolute() {
            path.to_owned()
        } else {
            self.base_dir.join(path)
        }
    }

    pub async fn metadata_value(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;

        metadata_get(&conn, key)
    }

    pub async fn set_metadata_value(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().await;

        metadata_set(&conn, key, value)
    }

    // message persistence
    //
    // INSERT OR IGNORE keeps re-runs idempotent, but a media reference that
    // resolves on a later run still has to land on the existing row, hence
    // the explicit update afterwards.
    #[instrument(level = Level::DEBUG, skip_all)]
    pub async fn save_message(
        &self,
        msg: &RemoteMessage,
        extraction_time: &str,
        media_file_id: Option<MediaFileId>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let is_service = msg.service.is_some();
        let text = msg
            .service
            .as_ref()
            .map(|action| action.render())
            .or_else(|| msg.text.clone());

        let media_type = msg.media.as_ref().map(|m| m.kind().to_owned());
        let is_voice = msg.media.as_ref().is_some_and(|m| m.is_voice());
        let file_id = msg.media.as_ref().and_then(|m| m.file_id().map(String::from));
        let file_size = msg
            .media
            .as_ref()
            .filter(|m| m.downloadable())
            .map(|m| m.declared_size());

        let web_preview = match &msg.media {
            Some(RemoteMedia::WebPage(page)) => Some(serde_json::to_string(page)?),
            _ => None,
        };

        let reactions_json = if msg.reactions.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&msg.reactions)?)
        };

        tx.execute(
            "INSERT OR IGNORE INTO messages
                 (id, entity_id, date, text, media_type, forward_origin, sender_id,
                  sender_name, views, reply_to_msg_id, reactions, web_preview,
                  extraction_time, is_service, is_voice, is_pinned, file_id,
                  file_size, media_file_id)
             VALUES
                 (:id, :entity_id, :date, :text, :media_type, :forward_origin,
                  :sender_id, :sender_name, :views, :reply_to, :reactions,
                  :web_preview, :extraction_time, :is_service, :is_voice,
                  :is_pinned, :file_id, :file_size, :media_file_id)",
            named_params! {
                ":id": msg.id,
                ":entity_id": msg.entity_id,
                ":date": msg.date,
                ":text": text,
                ":media_type": media_type,
                ":forward_origin": msg.forward_origin,
                ":sender_id": msg.sender_id,
                ":sender_name": msg.sender_name,
                ":views": msg.views.unwrap_or(0),
                ":reply_to": msg.reply_to.as_ref().map(|r| r.msg_id),
                ":reactions": reactions_json,
                ":web_preview": web_preview,
                ":extraction_time": extraction_time,
                ":is_service": is_service,
                ":is_voice": is_voice,
                ":is_pinned": msg.is_pinned,
                ":file_id": file_id,
                ":file_size": file_size,
                ":media_file_id": media_file_id,
            },
        )?;

        if let Some(media_file_id) = media_file_id {
            tx.execute(
                "UPDATE messages
                 SET media_file_id = :media_file_id,
                     file_id = COALESCE(:file_id, file_id),
                     file_size = COALESCE(:file_size, file_size)
                 WHERE id = :id AND entity_id = :entity_id",
                named_params! {
                    ":media_file_id": media_file_id,
                    ":file_id": file_id,
                    ":file_size": file_size,
                    ":id": msg.id,
                    ":entity_id": msg.entity_id,
                },
            )?;
        }

        for reaction in &msg.reactions {
            tx.execute(
                "INSERT OR IGNORE INTO reactions VALUES (:id, :entity_id, :emoji, :count)",
                named_params! {
                    ":id": msg.id,
                    ":entity_id": msg.entity_id,
                    ":emoji": reaction.emoji,
                    ":count": reaction.count,
                },
            )?;
        }

        if let Some(reply) = &msg.reply_to {
            tx.execute(
                "INSERT OR IGNORE INTO replies VALUES (:id, :entity_id, :reply_to, :quote)",
                named_params! {
                    ":id": msg.id,
                    ":entity_id": msg.entity_id,
                    ":reply_to": reply.msg_id,
                    ":quote": reply.quote_text,
                },
            )?;
        }

        for (i, row) in msg.buttons.iter().enumerate() {
            for (j, button) in row.iter().enumerate() {
                tx.execute(
                    "INSERT OR IGNORE INTO buttons
                     VALUES (:id, :entity_id, :row, :column, :text, :data, :url)",
                    named_params! {
                        ":id": msg.id,
                        ":entity_id": msg.entity_id,
                        ":row": i as i64,
                        ":column": j as i64,
                        ":text": button.text,
                        ":data": button.data,
                        ":url": button.url,
                    },
                )?;
            }
        }

        if !is_service && let Some(text) = &text {
            for (ord, link) in extract_text_links(text).into_iter().enumerate() {
                tx.execute(
                    "INSERT OR IGNORE INTO links
                     VALUES (:id, :entity_id, :ord, :text, :href)",
                    named_params! {
                        ":id": msg.id,
                        ":entity_id": msg.entity_id,
                        ":ord": ord as i64,
                        ":text": link.text,
                        ":href": link.href,
                    },
                )?;
            }
        }

        tx.commit()?;

        debug!({ message_id = msg.id }, "saved message");
        Ok(())
    }

    pub async fn get_message(
        &self,
        id: MessageId,
        entity_id: EntityId,
    ) -> Result<Option<MessageRow>> {
        let conn = self.conn.lock().await;

        let row = conn
            .query_row(
                "SELECT id, entity_id, text, media_type, file_id, file_size,
                        media_file_id, is_service, is_voice, is_pinned
                 FROM messages WHERE id = :id AND entity_id = :entity_id",
                named_params! { ":id": id, ":entity_id": entity_id },
                |row| {
                    Ok(MessageRow {
                        id: row.get(0)?,
                        entity_id: row.get(1)?,
                        text: row.get(2)?,
                        media_type: row.get(3)?,
                        file_id: row.get(4)?,
                        file_size: row.get(5)?,
                        media_file_id: row.get(6)?,
                        is_service: row.get(7)?,
                        is_voice: row.get(8)?,
                        is_pinned: row.get(9)?,
                    })
                },
            )
            .optional()?;

        Ok(row)
    }

    pub async fn message_count(&self, entity_id: EntityId) -> Result<i64> {
        let conn = self.conn.lock().await;

        let count = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE entity_id = :entity_id",
            named_params! { ":entity_id": entity_id },
            |row| row.get(0),
        )?;

        Ok(count)
    }

    // used by the reconciler to recover identifiers for a rediscovered file
    // whose name matches a previously seen file_id
    pub async fn message_media_hint(
        &self,
        file_id: &str,
    ) -> Result<Option<(String, Option<String>)>> {
        let conn = self.conn.lock().await;

        let hint = conn
            .query_row(
                "SELECT file_id, media_type FROM messages
                 WHERE file_id = :file_id LIMIT 1",
                named_params! { ":file_id": file_id },
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(hint)
    }

    // media index operations

    // insert-or-merge on the (hash, size) identity.  on conflict the existing
    // row wins and only its null fields are filled from the new data; the
    // existing path is never overwritten here.
    #[instrument(level = Level::DEBUG, skip_all)]
    pub async fn upsert_by_identity(&self, new: &NewMediaFile) -> Result<MediaFileId> {
        let conn = self.conn.lock().await;

        let timestamp = now();

        let result = conn.query_row(
            "INSERT INTO media_files
                 (file_path, file_hash, file_size, file_id, access_hash, media_type,
                  mime_type, file_name, file_extension, duration, width, height,
                  indexed_at, last_used_at)
             VALUES
                 (:path, :hash, :size, :file_id, :access_hash, :media_type, :mime,
                  :name, :ext, :duration, :width, :height, :now, :now)
             ON CONFLICT(file_hash, file_size) DO UPDATE SET
                 file_id = COALESCE(media_files.file_id, excluded.file_id),
                 access_hash = COALESCE(media_files.access_hash, excluded.access_hash),
                 media_type = COALESCE(media_files.media_type, excluded.media_type),
                 mime_type = COALESCE(media_files.mime_type, excluded.mime_type),
                 file_name = COALESCE(media_files.file_name, excluded.file_name),
                 file_extension = COALESCE(media_files.file_extension, excluded.file_extension),
                 duration = COALESCE(media_files.duration, excluded.duration),
                 width = COALESCE(media_files.width, excluded.width),
                 height = COALESCE(media_files.height, excluded.height),
                 last_used_at = excluded.last_used_at
             RETURNING id",
            named_params! {
                ":path": new.file_path,
                ":hash": new.file_hash,
                ":size": new.file_size,
                ":file_id": new.file_id,
                ":access_hash": new.access_hash,
                ":media_type": new.media_type,
                ":mime": new.mime_type,
                ":name": new.file_name,
                ":ext": new.file_extension,
                ":duration": new.duration,
                ":width": new.width,
                ":height": new.height,
                ":now": timestamp,
            },
            |row| row.get(0),
        );

        // the only constraint the upsert clause does not absorb is the
        // file_path uniqueness; surface that as the race kind
        let id = result.map_err(|err| match err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                anyhow::Error::from(BackupError::IndexConstraintRace(format!(
                    "{}:{}",
                    new.file_hash, new.file_size
                )))
            }
            err => anyhow::Error::from(err),
        })?;

        debug!({ media_id = id, hash = new.file_hash }, "upserted media row");
        Ok(id)
    }

    pub async fn get_media(&self, id: MediaFileId) -> Result<Option<MediaFile>> {
        let conn = self.conn.lock().await;

        let media = conn
            .query_row(
                &format!("SELECT {MEDIA_COLUMNS} FROM media_files WHERE id = :id"),
                named_params! { ":id": id },
                media_from_row,
            )
            .optional()?;

        Ok(media)
    }

    pub async fn find_by_identity(
        &self,
        hash: &str,
        size: i64,
    ) -> Result<Option<MediaFile>> {
        let conn = self.conn.lock().await;

        let media = conn
            .query_row(
                &format!(
                    "SELECT {MEDIA_COLUMNS} FROM media_files
                     WHERE file_hash = :hash AND file_size = :size"
                ),
                named_params! { ":hash": hash, ":size": size },
                media_from_row,
            )
            .optional()?;

        Ok(media)
    }

    pub async fn find_by_file_id(&self, file_id: &str) -> Result<Option<MediaFile>> {
        let conn = self.conn.lock().await;

        let media = conn
            .query_row(
                &format!(
                    "SELECT {MEDIA_COLUMNS} FROM media_files
                     WHERE file_id = :file_id LIMIT 1"
                ),
                named_params! { ":file_id": file_id },
                media_from_row,
            )
            .optional()?;

        Ok(media)
    }

    pub async fn find_by_path(&self, path: &str) -> Result<Option<MediaFile>> {
        let conn = self.conn.lock().await;

        let media = conn
            .query_row(
                &format!("SELECT {MEDIA_COLUMNS} FROM media_files WHERE file_path = :path"),
                named_params! { ":path": path },
                media_from_row,
            )
            .optional()?;

        Ok(media)
    }

    // cascading metadata search: exact size plus duration/resolution when the
    // stored row has them, then filtered by file_id substring or normalized
    // filename containment if several rows survive
    #[instrument(level = Level::DEBUG, skip_all)]
    pub async fn find_by_metadata(&self, query: &MetadataQuery) -> Result<Option<MediaFile>> {
        if query.file_size == 0 {
            return Ok(None);
        }

        let conn = self.conn.lock().await;

        let mut sql = format!(
            "SELECT {MEDIA_COLUMNS} FROM media_files WHERE file_size = ?"
        );
        let mut params: Vec<i64> = vec![query.file_size];

        if let Some(duration) = query.duration {
            sql.push_str(" AND (duration = ? OR duration IS NULL)");
            params.push(duration);
        }

        if let (Some(width), Some(height)) = (query.width, query.height) {
            sql.push_str(
                " AND ((width = ? AND height = ?) OR (width IS NULL AND height IS NULL))",
            );
            params.push(width);
            params.push(height);
        }

        let mut stmt = conn.prepare(&sql)?;

        let candidates = stmt
            .query_map(params_from_iter(params), media_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if candidates.is_empty() {
            return Ok(None);
        }

        if candidates.len() > 1 {
            if let Some(file_id) = &query.file_id {
                for media in &candidates {
                    if media
                        .file_name
                        .as_deref()
                        .is_some_and(|name| name.contains(file_id.as_str()))
                    {
                        return Ok(Some(media.clone()));
                    }
                }
            }

            if let Some(file_name) = &query.file_name {
                let normalized_search = normalize_filename_for_search(file_name);

                if !normalized_search.is_empty() {
                    for media in &candidates {
                        let Some(db_name) = media.file_name.as_deref() else {
                            continue;
                        };

                        let normalized_db = normalize_filename_for_search(db_name);

                        if !normalized_db.is_empty()
                            && (normalized_search.contains(&normalized_db)
                                || normalized_db.contains(&normalized_search))
                        {
                            return Ok(Some(media.clone()));
                        }
                    }
                }
            }
        }

        Ok(candidates.into_iter().next())
    }

    pub async fn set_path(&self, id: MediaFileId, new_path: &str) -> Result<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            "UPDATE media_files SET file_path = :path WHERE id = :id",
            named_params! { ":path": new_path, ":id": id },
        )?;

        Ok(())
    }

    pub async fn touch_last_used(&self, id: MediaFileId) -> Result<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            "UPDATE media_files SET last_used_at = :now WHERE id = :id",
            named_params! { ":now": now(), ":id": id },
        )?;

        Ok(())
    }

    // fill missing remote identifiers on a row found via the metadata tier
    pub async fn fill_remote_ids(
        &self,
        id: MediaFileId,
        file_id: Option<&str>,
        access_hash: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            "UPDATE media_files
             SET file_id = COALESCE(file_id, :file_id),
                 access_hash = COALESCE(access_hash, :access_hash),
                 last_used_at = :now
             WHERE id = :id",
            named_params! {
                ":file_id": file_id,
                ":access_hash": access_hash,
                ":now": now(),
                ":id": id,
            },
        )?;

        Ok(())
    }

    // point every message at the surviving row; used by the duplicate
    // collapse pass
    pub async fn migrate_message_refs(
        &self,
        old_id: MediaFileId,
        new_id: MediaFileId,
    ) -> Result<()> {
        let conn = self.conn.lock().await;

        let moved = conn.execute(
            "UPDATE messages SET media_file_id = :new WHERE media_file_id = :old",
            named_params! { ":new": new_id, ":old": old_id },
        )?;

        debug!({ old_id = old_id, new_id = new_id, moved = moved }, "migrated message refs");
        Ok(())
    }

    pub async fn remove_media(&self, id: MediaFileId) -> Result<()> {
        let conn = self.conn.lock().await;

        conn.execute(
            "DELETE FROM media_files WHERE id = :id",
            named_params! { ":id": id },
        )?;

        Ok(())
    }

    // drop a row whose file vanished out-of-band, clearing any message
    // references so the next run re-downloads
    pub async fn remove_media_and_null_refs(&self, id: MediaFileId) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM media_files WHERE id = :id",
            named_params! { ":id": id },
        )?;
        tx.execute(
            "UPDATE messages SET media_file_id = NULL WHERE media_file_id = :id",
            named_params! { ":id": id },
        )?;

        tx.commit()?;

        Ok(())
    }

    pub async fn all_media(&self) -> Result<Vec<MediaFile>> {
        let conn = self.conn.lock().await;

        let mut stmt = conn.prepare(&format!("SELECT {MEDIA_COLUMNS} FROM media_files"))?;

        let media = stmt
            .query_map([], media_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(media)
    }

    pub async fn media_count(&self) -> Result<i64> {
        let conn = self.conn.lock().await;

        let count = conn.query_row("SELECT COUNT(*) FROM media_files", [], |row| row.get(0))?;

        Ok(count)
    }

    pub async fn unused_media(&self) -> Result<Vec<MediaFile>> {
        let conn = self.conn.lock().await;

        // mf.* yields the table column order, which matches media_from_row
        let mut stmt = conn.prepare(
            "SELECT mf.* FROM media_files mf
             LEFT JOIN messages m ON m.media_file_id = mf.id
             WHERE m.id IS NULL",
        )?;

        let media = stmt
            .query_map([], media_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(media)
    }

    pub async fn duplicate_identities(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().await;

        let mut stmt = conn.prepare(
            "SELECT file_hash, file_size FROM media_files
             WHERE file_hash IS NOT NULL AND file_size > 0
             GROUP BY file_hash, file_size
             HAVING COUNT(*) > 1",
        )?;

        let groups = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(groups)
    }

    // all rows sharing an identity, oldest first, for the collapse pass
    pub async fn media_by_identity(&self, hash: &str, size: i64) -> Result<Vec<MediaFile>> {
        let conn = self.conn.lock().await;

        let mut stmt = conn.prepare(&format!(
            "SELECT {MEDIA_COLUMNS} FROM media_files
             WHERE file_hash = :hash AND file_size = :size
             ORDER BY indexed_at ASC, id ASC"
        ))?;

        let media = stmt
            .query_map(
                named_params! { ":hash": hash, ":size": size },
                media_from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(media)
    }
}

static LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<a\s+[^>]*?href="([^"]+)"[^>]*>(.*?)</a>"#).expect("invalid link regex")
});

// in-text hyperlinks, kept in their own table so they can never collide
// with keyboard buttons
pub fn extract_text_links(text: &str) -> Vec<TextLink> {
    LINK_RE
        .captures_iter(text)
        .map(|caps| TextLink {
            text: caps[2].to_owned(),
            href: caps[1].to_owned(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use api::message::{Button, Reaction, ReplyRef};

    fn new_media(path: &str, hash: &str, size: i64) -> NewMediaFile {
        NewMediaFile {
            file_path: path.to_owned(),
            file_hash: hash.to_owned(),
            file_size: size,
            ..Default::default()
        }
    }

    fn message(id: MessageId) -> RemoteMessage {
        RemoteMessage {
            id,
            entity_id: 7,
            date: "2024-05-01T10:00:00+00:00".to_owned(),
            text: Some("hello".to_owned()),
            media: None,
            service: None,
            forward_origin: None,
            sender_id: Some("100".to_owned()),
            sender_name: Some("Ann".to_owned()),
            views: Some(3),
            reply_to: None,
            reactions: Vec::new(),
            buttons: Vec::new(),
            is_pinned: false,
        }
    }

    async fn open_db(dir: &tempfile::TempDir) -> BackupDb {
        BackupDb::open(dir.path(), HashAlgorithm::Xxh3_128)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn upsert_merges_on_identity_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;

        let first = db.upsert_by_identity(&new_media("media/a.jpg", "h1", 100)).await.unwrap();

        let mut dup = new_media("media/b.jpg", "h1", 100);
        dup.file_id = Some("A1".to_owned());
        dup.mime_type = Some("image/jpeg".to_owned());

        let second = db.upsert_by_identity(&dup).await.unwrap();

        assert_eq!(first, second);

        let merged = db.get_media(first).await.unwrap().unwrap();

        // existing fields win, nulls are filled from the loser
        assert_eq!(merged.file_path, "media/a.jpg");
        assert_eq!(merged.file_id.as_deref(), Some("A1"));
        assert_eq!(merged.mime_type.as_deref(), Some("image/jpeg"));
    }

    #[tokio::test]
    async fn metadata_search_filters_by_file_id_then_name() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;

        let mut one = new_media("media/one.mp4", "h1", 500);
        one.file_name = Some("vacation (1).mp4".to_owned());
        db.upsert_by_identity(&one).await.unwrap();

        let mut two = new_media("media/A1.mp4", "h2", 500);
        two.file_name = Some("A1.mp4".to_owned());
        db.upsert_by_identity(&two).await.unwrap();

        // file_id substring match wins
        let hit = db
            .find_by_metadata(&MetadataQuery {
                file_size: 500,
                file_id: Some("A1".to_owned()),
                ..Default::default()
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.file_path, "media/A1.mp4");

        // normalized-name containment works in both directions
        let hit = db
            .find_by_metadata(&MetadataQuery {
                file_size: 500,
                file_name: Some("vacation.mp4".to_owned()),
                ..Default::default()
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.file_path, "media/one.mp4");

        // zero size never matches
        assert!(
            db.find_by_metadata(&MetadataQuery::default())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn metadata_search_tolerates_null_duration_and_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;

        db.upsert_by_identity(&new_media("media/clip.mp4", "h1", 900)).await.unwrap();

        let hit = db
            .find_by_metadata(&MetadataQuery {
                file_size: 900,
                duration: Some(14),
                width: Some(640),
                height: Some(480),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(hit.is_some());
    }

    #[tokio::test]
    async fn message_save_is_idempotent_and_updates_media_ref() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;

        let msg = message(1);

        db.save_message(&msg, "t0", None).await.unwrap();
        db.save_message(&msg, "t1", None).await.unwrap();

        assert_eq!(db.message_count(7).await.unwrap(), 1);

        let media_id = db.upsert_by_identity(&new_media("media/x.jpg", "h9", 10)).await.unwrap();

        // a later run that resolves media updates the existing row
        db.save_message(&msg, "t2", Some(media_id)).await.unwrap();

        let row = db.get_message(1, 7).await.unwrap().unwrap();
        assert_eq!(row.media_file_id, Some(media_id));
    }

    #[tokio::test]
    async fn child_rows_are_unique_across_reruns() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;

        let mut msg = message(2);
        msg.text = Some(
            "see <a href=\"https://example.com\">the docs</a> for details".to_owned(),
        );
        msg.reactions = vec![Reaction { emoji: "+1".to_owned(), count: 2 }];
        msg.reply_to = Some(ReplyRef { msg_id: 1, quote_text: Some("hello".to_owned()) });
        msg.buttons = vec![vec![Button {
            text: "open".to_owned(),
            data: None,
            url: Some("https://example.com".to_owned()),
        }]];

        db.save_message(&msg, "t0", None).await.unwrap();
        db.save_message(&msg, "t0", None).await.unwrap();

        let conn = db.conn.lock().await;
        let count = |table: &str| -> i64 {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .unwrap()
        };

        assert_eq!(count("reactions"), 1);
        assert_eq!(count("replies"), 1);
        assert_eq!(count("buttons"), 1);
        assert_eq!(count("links"), 1);
    }

    #[tokio::test]
    async fn unused_and_duplicate_queries() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;

        let used = db.upsert_by_identity(&new_media("media/u.jpg", "h1", 10)).await.unwrap();
        let _unused = db.upsert_by_identity(&new_media("media/v.jpg", "h2", 20)).await.unwrap();

        db.save_message(&message(1), "t0", Some(used)).await.unwrap();

        let unused = db.unused_media().await.unwrap();
        assert_eq!(unused.len(), 1);
        assert_eq!(unused[0].file_path, "media/v.jpg");
    }

    #[tokio::test]
    async fn migrate_message_refs_rewrites_forward_references() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;

        let old = db.upsert_by_identity(&new_media("media/a.bin", "h1", 1)).await.unwrap();
        let new = db.upsert_by_identity(&new_media("media/b.bin", "h2", 2)).await.unwrap();

        db.save_message(&message(5), "t0", Some(old)).await.unwrap();
        db.migrate_message_refs(old, new).await.unwrap();

        let row = db.get_message(5, 7).await.unwrap().unwrap();
        assert_eq!(row.media_file_id, Some(new));
    }

    #[tokio::test]
    async fn hash_algorithm_pin_refuses_mismatch() {
        let dir = tempfile::tempdir().unwrap();

        {
            let _db = open_db(&dir).await;
        }

        let reopened = BackupDb::open(dir.path(), HashAlgorithm::Sha256).await;
        assert!(reopened.is_err());
    }

    #[tokio::test]
    async fn paths_are_stored_relative_and_resolved_absolute() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;

        let abs = dir.path().join("media").join("A1.jpg");
        assert_eq!(db.relative_path(&abs), "media/A1.jpg");
        assert_eq!(db.absolute_path("media/A1.jpg"), abs);

        let foreign = Path::new("/elsewhere/blob.bin");
        assert_eq!(db.relative_path(foreign), "/elsewhere/blob.bin");
        assert_eq!(db.absolute_path("/elsewhere/blob.bin"), foreign);
    }

    #[test]
    fn link_extraction_finds_anchors() {
        let links = extract_text_links(
            "a <a href=\"https://one.example\">first</a> and \
             <a class=\"x\" href=\"https://two.example\">second</a>",
        );

        assert_eq!(links.len(), 2);
        assert_eq!(links[0].href, "https://one.example");
        assert_eq!(links[1].text, "second");
    }
}
