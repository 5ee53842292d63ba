use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime};

use anyhow::Result;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use tokio::fs::{remove_file, try_exists};
use tokio::task::JoinSet;
use tracing::{Level, debug, instrument, warn};
use walkdir::WalkDir;

use common::db::{BackupDb, NewMediaFile};
use common::media::hash::content_hash;
use common::media::metadata::extract_file_metadata;

// reconciler
//
// keeps the index and the media directory consistent with each other:
// a conditional pre-run re-index, an orphan sweep, and the unused-row /
// duplicate-collapse pass.  everything here must tolerate files vanishing
// or appearing out-of-band between runs.

const COUNT_DRIFT_TOLERANCE: i64 = 5;

// never delete files younger than this, to avoid racing an in-flight
// download from a concurrent run
const ORPHAN_GRACE: Duration = Duration::from_secs(300);

const REINDEX_WORKERS: usize = 4;

const LAST_INDEX_KEY: &str = "last_media_index_time";

// pass 1: refresh the index from disk when the media directory looks
// newer than the last indexing pass
#[instrument(level = Level::DEBUG, skip_all)]
pub async fn pre_pass(db: &Arc<BackupDb>) -> Result<()> {
    let media_dir = db.media_dir();

    if !try_exists(&media_dir).await? {
        return Ok(());
    }

    if should_reindex(db, &media_dir).await? {
        reindex(db, &media_dir).await?;
    }

    Ok(())
}

// passes 2 and 3, run after ingestion
#[instrument(level = Level::DEBUG, skip_all)]
pub async fn post_pass(db: &Arc<BackupDb>) -> Result<()> {
    sweep_orphans(db).await?;
    sweep_unused(db).await?;
    collapse_duplicates(db).await?;

    Ok(())
}

async fn should_reindex(db: &BackupDb, media_dir: &Path) -> Result<bool> {
    let Some(last) = db.metadata_value(LAST_INDEX_KEY).await? else {
        return Ok(true);
    };

    let Ok(last) = DateTime::parse_from_rfc3339(&last) else {
        // unparseable marker, safer to reindex
        return Ok(true);
    };
    let last = last.with_timezone(&Utc);

    let modified: DateTime<Utc> = tokio::fs::metadata(media_dir).await?.modified()?.into();

    if modified > last {
        debug!("media directory modified since last index");
        return Ok(true);
    }

    let db_count = db.media_count().await?;
    let disk_count = list_media_files(media_dir)?.len() as i64;

    if (db_count - disk_count).abs() > COUNT_DRIFT_TOLERANCE {
        debug!({ db_count = db_count, disk_count = disk_count }, "index count drift");
        return Ok(true);
    }

    Ok(false)
}

struct ReindexContext {
    db: Arc<BackupDb>,
    chashes: DashSet<String>,
    indexed: AtomicI64,
    warnings: AtomicI64,
}

#[instrument(skip_all)]
async fn reindex(db: &Arc<BackupDb>, media_dir: &Path) -> Result<()> {
    // drop rows whose file no longer exists, clearing message references
    // so the next run re-downloads
    let mut dropped = 0;

    for media in db.all_media().await? {
        if !try_exists(db.absolute_path(&media.file_path)).await? {
            db.remove_media_and_null_refs(media.id).await?;
            dropped += 1;
        }
    }

    let context = Arc::new(ReindexContext {
        db: db.clone(),
        chashes: DashSet::new(),
        indexed: AtomicI64::new(0),
        warnings: AtomicI64::new(0),
    });

    let mut tasks = JoinSet::new();

    for path in list_media_files(media_dir)? {
        while tasks.len() >= REINDEX_WORKERS {
            tasks.join_next().await;
        }

        let rel = db.relative_path(&path);

        if db.find_by_path(&rel).await?.is_some() {
            continue;
        }

        tasks.spawn(index_file(context.clone(), path));
    }

    while tasks.join_next().await.is_some() {}

    db.set_metadata_value(LAST_INDEX_KEY, &Utc::now().to_rfc3339())
        .await?;

    debug!(
        { dropped = dropped, indexed = context.indexed.load(Ordering::Relaxed) },
        "reindex complete"
    );
    Ok(())
}

async fn index_file(context: Arc<ReindexContext>, path: PathBuf) {
    let hash = match content_hash(&path, context.db.algorithm()).await {
        Ok(hash) => hash,
        Err(err) => {
            warn!({ path = ?path, error = %err }, "failed to hash on-disk file");
            context.warnings.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    // only one file per content hash gets registered in a single pass;
    // extra copies stay unindexed and fall to the orphan sweep
    if !context.chashes.insert(hash.clone()) {
        debug!({ path = ?path }, "duplicate content found during reindex");
        return;
    }

    let local = extract_file_metadata(&path).await;

    // a file named <file_id><ext> from an earlier run can recover its
    // remote identifiers from the message rows that referenced it
    let hint = match path.file_stem().and_then(|stem| stem.to_str()) {
        Some(stem) => match context.db.message_media_hint(stem).await {
            Ok(hint) => hint,
            Err(err) => {
                warn!({ path = ?path, error = %err }, "hint lookup failed");
                None
            }
        },
        None => None,
    };

    let (file_id, media_type) = match hint {
        Some((file_id, media_type)) => (Some(file_id), media_type),
        None => (None, None),
    };

    let new = NewMediaFile {
        file_path: context.db.relative_path(&path),
        file_hash: hash,
        file_size: local.file_size,
        file_id,
        media_type,
        file_name: local.file_name,
        file_extension: local.file_extension,
        width: local.width,
        height: local.height,
        ..Default::default()
    };

    match context.db.upsert_by_identity(&new).await {
        Ok(_) => {
            context.indexed.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            warn!({ path = ?path, error = %err }, "failed to index on-disk file");
            context.warnings.fetch_add(1, Ordering::Relaxed);
        }
    }
}

// pass 2: delete files on disk that no media row points at, once they are
// old enough to not be an in-flight download
#[instrument(level = Level::DEBUG, skip_all)]
pub async fn sweep_orphans(db: &Arc<BackupDb>) -> Result<(i64, u64)> {
    let media_dir = db.media_dir();

    if !try_exists(&media_dir).await? {
        return Ok((0, 0));
    }

    let known: HashSet<PathBuf> = db
        .all_media()
        .await?
        .into_iter()
        .map(|media| db.absolute_path(&media.file_path))
        .collect();

    let mut deleted = 0;
    let mut freed = 0;

    for path in list_media_files(&media_dir)? {
        if known.contains(&path) {
            continue;
        }

        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(_) => continue,
        };

        let age = meta
            .modified()
            .ok()
            .and_then(|mtime| SystemTime::now().duration_since(mtime).ok())
            .unwrap_or(Duration::ZERO);

        if age < ORPHAN_GRACE {
            continue;
        }

        match remove_file(&path).await {
            Ok(()) => {
                debug!({ path = ?path }, "removed orphaned file");
                deleted += 1;
                freed += meta.len();
            }
            Err(err) => warn!({ path = ?path, error = %err }, "failed to remove orphan"),
        }
    }

    Ok((deleted, freed))
}

// pass 3a: media rows no message points at are deleted along with their
// files
#[instrument(level = Level::DEBUG, skip_all)]
pub async fn sweep_unused(db: &Arc<BackupDb>) -> Result<(i64, u64)> {
    let mut deleted = 0;
    let mut freed = 0;

    for media in db.unused_media().await? {
        let path = db.absolute_path(&media.file_path);

        if try_exists(&path).await? {
            match remove_file(&path).await {
                Ok(()) => {
                    deleted += 1;
                    freed += media.file_size.max(0) as u64;
                }
                Err(err) => {
                    warn!({ path = ?path, error = %err }, "failed to remove unused file");
                    continue;
                }
            }
        }

        db.remove_media(media.id).await?;
    }

    Ok((deleted, freed))
}

// pass 3b: rows sharing a (hash, size) identity are folded onto the oldest
// one.  with the unique index in place new duplicates cannot appear, so
// this only finds work on stores imported from older layouts.
#[instrument(level = Level::DEBUG, skip_all)]
pub async fn collapse_duplicates(db: &Arc<BackupDb>) -> Result<i64> {
    let mut collapsed = 0;

    for (hash, size) in db.duplicate_identities().await? {
        let rows = db.media_by_identity(&hash, size).await?;

        let Some((keep, rest)) = rows.split_first() else {
            continue;
        };

        for dup in rest {
            db.migrate_message_refs(dup.id, keep.id).await?;

            if dup.file_path != keep.file_path {
                let path = db.absolute_path(&dup.file_path);

                if try_exists(&path).await? {
                    if let Err(err) = remove_file(&path).await {
                        warn!({ path = ?path, error = %err }, "failed to remove duplicate file");
                    }
                }
            }

            db.remove_media(dup.id).await?;
            collapsed += 1;
        }
    }

    Ok(collapsed)
}

// flat listing of the media directory: plain files only, dotfiles skipped
fn list_media_files(media_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(media_dir).min_depth(1).max_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!({ error = %err }, "failed to read media dir entry");
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }

        files.push(entry.into_path());
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    use api::message::RemoteMessage;
    use common::media::hash::HashAlgorithm;

    async fn open_db(dir: &tempfile::TempDir) -> Arc<BackupDb> {
        let db = BackupDb::open(dir.path(), HashAlgorithm::Xxh3_128)
            .await
            .unwrap();
        tokio::fs::create_dir_all(db.media_dir()).await.unwrap();
        Arc::new(db)
    }

    fn message_with_file_id(id: i64, file_id: &str) -> RemoteMessage {
        use api::media::{PhotoSize, RemoteMedia, RemotePhoto};

        RemoteMessage {
            id,
            entity_id: 7,
            date: "2024-05-01T10:00:00+00:00".to_owned(),
            text: None,
            media: Some(RemoteMedia::Photo(RemotePhoto {
                id: file_id.to_owned(),
                access_hash: None,
                sizes: vec![PhotoSize { width: 10, height: 10, bytes: 2048 }],
            })),
            service: None,
            forward_origin: None,
            sender_id: None,
            sender_name: None,
            views: None,
            reply_to: None,
            reactions: Vec::new(),
            buttons: Vec::new(),
            is_pinned: false,
        }
    }

    #[tokio::test]
    async fn pre_pass_indexes_unknown_files_with_message_hints() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;

        // a message from an earlier run knows this file_id
        db.save_message(&message_with_file_id(1, "A1"), "t0", None)
            .await
            .unwrap();

        tokio::fs::write(db.media_dir().join("A1.jpg"), vec![1u8; 2048])
            .await
            .unwrap();

        pre_pass(&db).await.unwrap();

        let media = db.find_by_file_id("A1").await.unwrap().unwrap();
        assert_eq!(media.file_size, 2048);
        assert_eq!(media.media_type.as_deref(), Some("photo"));
        assert_eq!(db.media_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn pre_pass_drops_rows_for_missing_files_and_nulls_refs() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;

        let id = db
            .upsert_by_identity(&NewMediaFile {
                file_path: "media/gone.jpg".to_owned(),
                file_hash: "h1".to_owned(),
                file_size: 100,
                ..Default::default()
            })
            .await
            .unwrap();

        db.save_message(&message_with_file_id(1, "gone"), "t0", Some(id))
            .await
            .unwrap();

        pre_pass(&db).await.unwrap();

        assert_eq!(db.media_count().await.unwrap(), 0);

        let row = db.get_message(1, 7).await.unwrap().unwrap();
        assert_eq!(row.media_file_id, None);
    }

    #[tokio::test]
    async fn pre_pass_skips_when_directory_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;

        tokio::fs::write(db.media_dir().join("A1.jpg"), vec![1u8; 512])
            .await
            .unwrap();

        pre_pass(&db).await.unwrap();
        assert_eq!(db.media_count().await.unwrap(), 1);

        // mark the index as newer than the directory and make sure a second
        // pass does not rehash (drop the row; it must stay gone)
        db.remove_media_and_null_refs(
            db.find_by_path("media/A1.jpg").await.unwrap().unwrap().id,
        )
        .await
        .unwrap();

        let future = (Utc::now() + chrono::TimeDelta::hours(1)).to_rfc3339();
        db.set_metadata_value(LAST_INDEX_KEY, &future).await.unwrap();

        pre_pass(&db).await.unwrap();
        assert_eq!(db.media_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fresh_orphans_survive_the_grace_window() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;

        let orphan = db.media_dir().join("fresh.bin");
        tokio::fs::write(&orphan, vec![0u8; 64]).await.unwrap();

        let (deleted, _) = sweep_orphans(&db).await.unwrap();

        assert_eq!(deleted, 0);
        assert!(try_exists(&orphan).await.unwrap());
    }

    #[tokio::test]
    async fn unused_rows_are_deleted_with_their_files() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir).await;

        let path = db.media_dir().join("unused.bin");
        tokio::fs::write(&path, vec![0u8; 64]).await.unwrap();

        db.upsert_by_identity(&NewMediaFile {
            file_path: "media/unused.bin".to_owned(),
            file_hash: "h1".to_owned(),
            file_size: 64,
            ..Default::default()
        })
        .await
        .unwrap();

        let (deleted, freed) = sweep_unused(&db).await.unwrap();

        assert_eq!(deleted, 1);
        assert_eq!(freed, 64);
        assert!(!try_exists(&path).await.unwrap());
        assert_eq!(db.media_count().await.unwrap(), 0);
    }
}
